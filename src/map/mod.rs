//! The public map type.
//!
//! [`CuckooMap`] owns the hash builder and hashes every key exactly once
//! per operation; the engine underneath works on precomputed hashes and
//! never sees the builder. Operations on keys whose candidate buckets live
//! on different stripes run fully in parallel.
//!
//! Callbacks handed to `find_fn`, `update_fn`, `upsert` and `erase_fn` run
//! while both of the key's stripe locks are held. Do not call back into the
//! same table from inside one; the stripes are spinlocks and a colliding
//! re-entrant operation deadlocks.

use std::borrow::Borrow;
use std::fmt;
use std::hash::{BuildHasher, Hash, Hasher};
use std::iter::FromIterator;

pub(crate) mod bucket;
pub(crate) mod locked;
pub(crate) mod locks;
pub(crate) mod raw;

use crate::config::{DEFAULT_SIZE, SLOT_PER_BUCKET};
use crate::error::Result;
use crate::map::locked::LockedTable;
use crate::map::locks::Locking;
use crate::map::raw::{hashed_key, reserve_calc, HashValue, RawTable};

// Most keys are small, so default to FxHash.
pub type DefaultHashBuilder = fxhash::FxBuildHasher;

#[inline]
pub(crate) fn make_hash<K: Hash + ?Sized>(hash_builder: &impl BuildHasher, val: &K) -> u64 {
    let mut state = hash_builder.build_hasher();
    val.hash(&mut state);
    state.finish()
}

/// A concurrent cuckoo hash map.
///
/// Every key lives in one of two candidate buckets derived from its hash;
/// lookups are two-bucket scans under two striped spinlocks, inserts
/// displace entries along a breadth-first cuckoo path when both candidates
/// are full, and the table doubles in place when no path exists. All
/// operations take `&self` and may be called from any number of threads.
pub struct CuckooMap<K, V, S = DefaultHashBuilder> {
    hash_builder: S,
    table: RawTable<K, V>,
}

impl<K, V> CuckooMap<K, V, DefaultHashBuilder> {
    /// Creates a table with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SIZE)
    }

    /// Creates a table with room for at least `capacity` elements before
    /// any expansion.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_and_hasher(capacity, DefaultHashBuilder::default())
    }
}

impl<K, V, S: BuildHasher> CuckooMap<K, V, S> {
    pub fn with_hasher(hash_builder: S) -> Self {
        Self::with_capacity_and_hasher(DEFAULT_SIZE, hash_builder)
    }

    pub fn with_capacity_and_hasher(capacity: usize, hash_builder: S) -> Self {
        CuckooMap {
            hash_builder,
            table: RawTable::with_hashpower(reserve_calc(capacity)),
        }
    }

    #[inline]
    fn hashed<Q: Hash + ?Sized>(&self, key: &Q) -> HashValue {
        hashed_key(make_hash(&self.hash_builder, key))
    }
}

impl<K, V, S: BuildHasher + Default> Default for CuckooMap<K, V, S> {
    fn default() -> Self {
        Self::with_capacity_and_hasher(DEFAULT_SIZE, S::default())
    }
}

// Inspectors. None of these synchronize with mutators: sizes and load
// factors are best-effort snapshots under concurrency.
impl<K, V, S> CuckooMap<K, V, S> {
    /// log2 of the bucket count.
    pub fn hashpower(&self) -> usize {
        self.table.hashpower()
    }

    pub fn bucket_count(&self) -> usize {
        self.table.bucket_count()
    }

    pub fn slot_per_bucket(&self) -> usize {
        SLOT_PER_BUCKET
    }

    /// Number of elements, summed from the per-stripe counters without
    /// taking any locks.
    pub fn len(&self) -> usize {
        self.table.size()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// `bucket_count() * slot_per_bucket()`.
    pub fn capacity(&self) -> usize {
        self.table.capacity()
    }

    /// `len() / capacity()`.
    pub fn load_factor(&self) -> f64 {
        self.table.load_factor()
    }

    pub fn minimum_load_factor(&self) -> f64 {
        self.table.minimum_load_factor()
    }

    /// Sets the load factor below which an *automatic* expansion fails with
    /// [`CuckooError::LoadFactorTooLow`](crate::CuckooError::LoadFactorTooLow)
    /// instead of growing the table. Explicit `rehash`/`reserve` calls are
    /// not affected. Values outside `[0, 1]` are rejected.
    pub fn set_minimum_load_factor(&self, mlf: f64) -> Result<()> {
        self.table.set_minimum_load_factor(mlf)
    }

    /// The largest hashpower the table may grow to;
    /// [`NO_MAXIMUM_HASHPOWER`](crate::config::NO_MAXIMUM_HASHPOWER) when
    /// unbounded.
    pub fn maximum_hashpower(&self) -> usize {
        self.table.maximum_hashpower()
    }

    /// Caps expansion. Values below the current hashpower are rejected.
    pub fn set_maximum_hashpower(&self, mhp: usize) -> Result<()> {
        self.table.set_maximum_hashpower(mhp)
    }

    pub fn hasher(&self) -> &S {
        &self.hash_builder
    }
}

// Lookup, update and erase. These lock at most two stripes and never
// resize, so they cannot fail; absence is reported in the return value.
impl<K, V, S> CuckooMap<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    /// Invokes `f` on the value for `key`, read-only. Returns whether the
    /// key was present.
    pub fn find_fn<Q, F>(&self, key: &Q, f: F) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        F: FnOnce(&V),
    {
        let hv = self.hashed(key);
        self.table.find_fn::<Locking, _, _, _>(hv, key, f).is_some()
    }

    /// Returns a clone of the value for `key`.
    pub fn find<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        let hv = self.hashed(key);
        self.table.find_fn::<Locking, _, _, _>(hv, key, V::clone)
    }

    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hv = self.hashed(key);
        self.table
            .find_fn::<Locking, _, _, _>(hv, key, |_| ())
            .is_some()
    }

    /// Invokes `f` on the value for `key`, mutably. Returns whether the key
    /// was present.
    pub fn update_fn<Q, F>(&self, key: &Q, f: F) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        F: FnOnce(&mut V),
    {
        let hv = self.hashed(key);
        self.table
            .update_fn::<Locking, _, _, _>(hv, key, f)
            .is_some()
    }

    /// Overwrites the value for `key` if present.
    pub fn update<Q>(&self, key: &Q, val: V) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hv = self.hashed(key);
        self.table
            .update_fn::<Locking, _, _, _>(hv, key, move |v| *v = val)
            .is_some()
    }

    /// Removes the entry for `key`. Returns whether it was present.
    pub fn erase<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hv = self.hashed(key);
        self.table.erase_fn::<Locking, _, _>(hv, key, |_| true)
    }

    /// Invokes `f` on the value for `key` and removes the entry if `f`
    /// returns true. Returns whether the key was present.
    pub fn erase_fn<Q, F>(&self, key: &Q, f: F) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        F: FnOnce(&mut V) -> bool,
    {
        let hv = self.hashed(key);
        self.table.erase_fn::<Locking, _, _>(hv, key, f)
    }

    /// Removes every entry.
    pub fn clear(&self) {
        self.table.clear::<Locking>();
    }

    /// Takes every stripe and returns an exclusive view for iteration and
    /// bulk operations. Concurrent operations block until it is dropped.
    pub fn lock_table(&self) -> LockedTable<'_, K, V, S> {
        LockedTable::new(self)
    }
}

// Insert and resize. These may have to grow the table, which can fail with
// a configuration error; duplicates are still reported in the `Ok` payload.
impl<K, V, S> CuckooMap<K, V, S>
where
    K: Hash + Eq + Send + Sync,
    V: Send + Sync,
    S: BuildHasher + Sync,
{
    /// Inserts `key → val`. Returns `Ok(false)` (and drops `val`) if the
    /// key was already present, leaving the existing value untouched.
    pub fn insert(&self, key: K, val: V) -> Result<bool> {
        self.upsert(key, |_| {}, val)
    }

    /// Inserts `key → val`, or invokes `f` on the existing value if the key
    /// is already present. Returns whether a new entry was inserted.
    pub fn upsert<F>(&self, key: K, f: F, val: V) -> Result<bool>
    where
        F: FnOnce(&mut V),
    {
        let hv = self.hashed(&key);
        let hash_builder = &self.hash_builder;
        let hash_fn = move |k: &K| make_hash(hash_builder, k);
        self.table.upsert::<Locking, F, _>(hv, key, f, val, &hash_fn)
    }

    /// Resizes to the given hashpower. A target too small for the current
    /// entries is raised to the smallest hashpower that fits. Returns
    /// whether the size changed.
    pub fn rehash(&self, new_hashpower: usize) -> Result<bool> {
        let hash_builder = &self.hash_builder;
        let hash_fn = move |k: &K| make_hash(hash_builder, k);
        self.table.rehash::<Locking, _>(new_hashpower, &hash_fn)
    }

    /// Resizes to the smallest hashpower that holds `n` elements (which may
    /// shrink the table). Returns whether the size changed.
    pub fn reserve(&self, n: usize) -> Result<bool> {
        let hash_builder = &self.hash_builder;
        let hash_fn = move |k: &K| make_hash(hash_builder, k);
        self.table.reserve::<Locking, _>(n, &hash_fn)
    }
}

impl<K, V, S> FromIterator<(K, V)> for CuckooMap<K, V, S>
where
    K: Hash + Eq + Send + Sync,
    V: Send + Sync,
    S: BuildHasher + Sync + Default,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let map = CuckooMap::with_capacity_and_hasher(DEFAULT_SIZE, S::default());
        for (k, v) in iter {
            let _ = map.insert(k, v);
        }
        map
    }
}

impl<K, V, S> Extend<(K, V)> for CuckooMap<K, V, S>
where
    K: Hash + Eq + Send + Sync,
    V: Send + Sync,
    S: BuildHasher + Sync,
{
    fn extend<T: IntoIterator<Item = (K, V)>>(&mut self, iter: T) {
        for (k, v) in iter {
            let _ = self.insert(k, v);
        }
    }
}

impl<K, V, S> fmt::Debug for CuckooMap<K, V, S>
where
    K: Hash + Eq + fmt::Debug,
    V: fmt::Debug,
    S: BuildHasher,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lt = self.lock_table();
        let mut map = f.debug_map();
        for (k, v) in lt.iter() {
            map.entry(k, v);
        }
        map.finish()
    }
}
