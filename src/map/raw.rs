//! The cuckoo hashing engine.
//!
//! Everything here operates on precomputed 64-bit hashes; the public facade
//! in `map` owns the hash builder and passes hashes (plus a rehash closure
//! for the paths that must re-derive a stored key's hash) down to this
//! module. Operations follow the same locking discipline:
//!
//! 1. snapshot the hashpower,
//! 2. compute the two candidate buckets under that snapshot,
//! 3. lock their stripes in ascending order,
//! 4. re-check the hashpower and retry from 1 if it moved.
//!
//! A resize takes the resize mutex and then every stripe, so the re-check
//! is bounded: once a stripe is held, the hashpower cannot change. Insert
//! is the only operation that ever gives its stripes up mid-flight, while
//! the breadth-first displacement search runs unlocked; every hop of the
//! chosen path is re-validated under locks before it is executed.

use std::borrow::Borrow;
use std::cell::UnsafeCell;
use std::mem;
use std::result::Result as StdResult;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread;

use parking_lot::Mutex;

use crate::config::{DEFAULT_MINIMUM_LOAD_FACTOR, NO_MAXIMUM_HASHPOWER, SLOT_PER_BUCKET};
use crate::error::{CuckooError, Result};
use crate::hint::{likely, unlikely};
use crate::map::bucket::{Bucket, BucketArray};
use crate::map::locks::{lock_ind, AllBuckets, LockArray, LockMode, OneBucket, TwoBuckets};

// Longest admissible cuckoo path. Five hops is enough for tables loaded
// well past 90% with four slots per bucket.
const MAX_BFS_PATH_LEN: usize = 5;

// Capacity of the BFS queue. Must be a power of two; the search simply
// reports failure (forcing an expansion) if the frontier outgrows it.
const MAX_CUCKOO_COUNT: usize = 512;

// Below this many buckets a resize runs on the calling thread; spawning
// workers costs more than the rehash itself.
const PARALLEL_RESIZE_THRESHOLD: usize = 1 << 13;

// Odd multiplier for the alternate-index computation, the 64-bit
// MurmurHash2 constant.
const ALT_MULTIPLIER: u64 = 0xc6a4_a793_5bd1_e995;

/// A key's full hash together with its 8-bit partial key.
#[derive(Clone, Copy, Default, PartialEq, Debug)]
pub(crate) struct HashValue {
    pub(crate) hash: u64,
    pub(crate) partial: u8,
}

#[inline]
pub(crate) fn hashed_key(hash: u64) -> HashValue {
    HashValue {
        hash,
        partial: partial_key(hash),
    }
}

/// XOR-folds a 64-bit hash down to 8 bits. Depends only on the hash, never
/// on the hashpower: doubling the table must preserve stored partials so
/// that the alternate index grows by exactly one bit at the top.
#[inline]
pub(crate) fn partial_key(hash: u64) -> u8 {
    let hash32 = (hash as u32) ^ ((hash >> 32) as u32);
    let hash16 = (hash32 as u16) ^ ((hash32 >> 16) as u16);
    (hash16 as u8) ^ ((hash16 >> 8) as u8)
}

#[inline(always)]
pub(crate) fn hashsize(hp: usize) -> usize {
    1 << hp
}

#[inline(always)]
pub(crate) fn hashmask(hp: usize) -> usize {
    hashsize(hp) - 1
}

/// First candidate bucket of a hash under hashpower `hp`.
#[inline]
pub(crate) fn index_hash(hp: usize, hash: u64) -> usize {
    hash as usize & hashmask(hp)
}

/// The other candidate bucket, derived from the first and the partial key.
/// The "+1" keeps the tag-derived displacement nonzero, and because the
/// displacement is a pure XOR, `alt_index(hp, p, alt_index(hp, p, i)) == i`.
#[inline]
pub(crate) fn alt_index(hp: usize, partial: u8, index: usize) -> usize {
    let nonzero_tag = partial as usize + 1;
    (index ^ nonzero_tag.wrapping_mul(ALT_MULTIPLIER as usize)) & hashmask(hp)
}

/// Small trivially-comparable keys don't benefit from the tag filter; for
/// them the scan compares keys directly. Tags are still stored either way,
/// the alternate-index computation needs them.
#[inline(always)]
pub(crate) fn is_simple<K>() -> bool {
    mem::size_of::<K>() <= mem::size_of::<u64>() && !mem::needs_drop::<K>()
}

/// Smallest hashpower whose table holds `n` elements. Never less than 1,
/// so the two candidate buckets are distinct from the start.
pub(crate) fn reserve_calc(n: usize) -> usize {
    let buckets = (n + SLOT_PER_BUCKET - 1) / SLOT_PER_BUCKET;
    let mut hp = 1;
    while hashsize(hp) < buckets {
        hp += 1;
    }
    hp
}

/// Raised (as an `Err`) when a lock was taken but the hashpower no longer
/// matches the snapshot the bucket indices were computed under.
struct HashpowerChanged;

/// A bucket/slot coordinate.
#[derive(Clone, Copy, Debug)]
pub(crate) struct TablePos {
    pub(crate) index: usize,
    pub(crate) slot: usize,
}

/// Where an insert should construct its pair, or where the key already is.
#[derive(Clone, Copy)]
pub(crate) struct InsertPos {
    pub(crate) index: usize,
    pub(crate) slot: usize,
    pub(crate) existing: bool,
}

enum InsertOutcome {
    Vacant(TablePos),
    Exists(TablePos),
    TableFull,
    UnderExpansion,
}

enum CuckooStatus {
    Ok(usize, usize),
    Failure,
    UnderExpansion,
}

enum Validity {
    Proceed,
    AlreadyResized,
}

/// One hop of a reconstructed cuckoo path: the bucket we displace from,
/// the slot within it, and the occupant's hash at reconstruction time
/// (used to re-validate the hop before moving).
#[derive(Clone, Copy, Default)]
struct CuckooRecord {
    bucket: usize,
    slot: usize,
    hv: HashValue,
}

/// A position in the BFS frontier. `pathcode` encodes the slot taken at
/// every hop as a base-`SLOT_PER_BUCKET` number; the seed pathcodes 0 and 1
/// record which candidate bucket the path starts from.
#[derive(Clone, Copy, Default)]
struct BSlot {
    bucket: usize,
    pathcode: usize,
    depth: usize,
}

/// Fixed circular buffer driving the BFS.
struct BQueue {
    slots: [BSlot; MAX_CUCKOO_COUNT],
    first: usize,
    last: usize,
}

impl BQueue {
    fn new() -> Self {
        BQueue {
            slots: [BSlot::default(); MAX_CUCKOO_COUNT],
            first: 0,
            last: 0,
        }
    }

    #[inline]
    fn increment(ind: usize) -> usize {
        (ind + 1) & (MAX_CUCKOO_COUNT - 1)
    }

    fn enqueue(&mut self, x: BSlot) {
        debug_assert!(!self.full());
        self.slots[self.last] = x;
        self.last = Self::increment(self.last);
    }

    fn dequeue(&mut self) -> BSlot {
        debug_assert!(!self.empty());
        let x = self.slots[self.first];
        self.first = Self::increment(self.first);
        x
    }

    fn empty(&self) -> bool {
        self.first == self.last
    }

    fn full(&self) -> bool {
        Self::increment(self.last) == self.first
    }
}

/// The table proper: an atomic hashpower, the bucket array it sizes, the
/// stripe locks, and the resize serializer. All mutation goes through
/// `&self`; the locking protocol is what makes it sound, which is why the
/// bucket array sits in an `UnsafeCell` and is only touched through the
/// unsafe accessors below.
pub(crate) struct RawTable<K, V> {
    hashpower: AtomicUsize,
    buckets: UnsafeCell<BucketArray<K, V>>,
    locks: LockArray,
    resize_lock: Mutex<()>,
    minimum_load_factor: AtomicU64,
    maximum_hashpower: AtomicUsize,
}

unsafe impl<K: Send, V: Send> Send for RawTable<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for RawTable<K, V> {}

impl<K, V> RawTable<K, V> {
    pub(crate) fn with_hashpower(hp: usize) -> Self {
        RawTable {
            hashpower: AtomicUsize::new(hp),
            buckets: UnsafeCell::new(BucketArray::new(hp)),
            locks: LockArray::new(hashsize(hp)),
            resize_lock: Mutex::new(()),
            minimum_load_factor: AtomicU64::new(DEFAULT_MINIMUM_LOAD_FACTOR.to_bits()),
            maximum_hashpower: AtomicUsize::new(NO_MAXIMUM_HASHPOWER),
        }
    }

    #[inline]
    pub(crate) fn hashpower(&self) -> usize {
        self.hashpower.load(Ordering::Acquire)
    }

    #[inline]
    fn set_hashpower(&self, hp: usize) {
        self.hashpower.store(hp, Ordering::Release);
    }

    pub(crate) fn bucket_count(&self) -> usize {
        hashsize(self.hashpower())
    }

    pub(crate) fn capacity(&self) -> usize {
        self.bucket_count() * SLOT_PER_BUCKET
    }

    /// Lock-free sum of the stripe counters; a best-effort snapshot under
    /// concurrent mutation.
    pub(crate) fn size(&self) -> usize {
        let mut total: i64 = 0;
        for i in 0..self.locks.size() {
            total += self.locks.at(i).elem_counter();
        }
        if total < 0 {
            0
        } else {
            total as usize
        }
    }

    /// Short-circuits on the first stripe with a nonzero counter.
    pub(crate) fn is_empty(&self) -> bool {
        for i in 0..self.locks.size() {
            if self.locks.at(i).elem_counter() != 0 {
                return false;
            }
        }
        true
    }

    pub(crate) fn load_factor(&self) -> f64 {
        self.size() as f64 / self.capacity() as f64
    }

    pub(crate) fn minimum_load_factor(&self) -> f64 {
        f64::from_bits(self.minimum_load_factor.load(Ordering::Acquire))
    }

    pub(crate) fn set_minimum_load_factor(&self, mlf: f64) -> Result<()> {
        if !(0.0..=1.0).contains(&mlf) {
            return Err(CuckooError::InvalidArgument(format!(
                "minimum load factor {} must lie in [0, 1]",
                mlf
            )));
        }
        self.minimum_load_factor
            .store(mlf.to_bits(), Ordering::Release);
        Ok(())
    }

    pub(crate) fn maximum_hashpower(&self) -> usize {
        self.maximum_hashpower.load(Ordering::Acquire)
    }

    pub(crate) fn set_maximum_hashpower(&self, mhp: usize) -> Result<()> {
        if mhp != NO_MAXIMUM_HASHPOWER && mhp < self.hashpower() {
            return Err(CuckooError::InvalidArgument(format!(
                "maximum hashpower {} is below the current hashpower {}",
                mhp,
                self.hashpower()
            )));
        }
        self.maximum_hashpower.store(mhp, Ordering::Release);
        Ok(())
    }

    /// # Safety
    /// The caller must hold the stripe locks of every bucket it goes on to
    /// touch (or own the table exclusively).
    #[inline(always)]
    pub(crate) unsafe fn buckets(&self) -> &BucketArray<K, V> {
        &*self.buckets.get()
    }

    /// # Safety
    /// Every stripe must be held; nothing else may be reading the array.
    #[allow(clippy::mut_from_ref)]
    #[inline(always)]
    unsafe fn buckets_mut(&self) -> &mut BucketArray<K, V> {
        &mut *self.buckets.get()
    }

    // Locking protocol ----------------------------------------------------

    /// After taking `lock`, verify the hashpower still matches the snapshot
    /// the caller computed its bucket indices under; unlock and report
    /// otherwise.
    #[inline]
    fn check_hashpower(&self, hp: usize, lock: usize) -> StdResult<(), HashpowerChanged> {
        if unlikely(self.hashpower() != hp) {
            self.locks.at(lock).unlock();
            return Err(HashpowerChanged);
        }
        Ok(())
    }

    fn lock_one<M: LockMode>(
        &self,
        hp: usize,
        i: usize,
    ) -> StdResult<OneBucket<'_, M>, HashpowerChanged> {
        if M::ACTIVE {
            let l = lock_ind(i);
            self.locks.at(l).lock();
            self.check_hashpower(hp, l)?;
        }
        Ok(OneBucket::new(&self.locks, i))
    }

    /// Locks the stripes of both buckets in ascending order, once if they
    /// coincide.
    fn lock_two<M: LockMode>(
        &self,
        hp: usize,
        i1: usize,
        i2: usize,
    ) -> StdResult<TwoBuckets<'_, M>, HashpowerChanged> {
        if M::ACTIVE {
            let mut l1 = lock_ind(i1);
            let mut l2 = lock_ind(i2);
            if l2 < l1 {
                mem::swap(&mut l1, &mut l2);
            }
            self.locks.at(l1).lock();
            self.check_hashpower(hp, l1)?;
            if l2 != l1 {
                self.locks.at(l2).lock();
            }
        }
        Ok(TwoBuckets::new(&self.locks, i1, i2))
    }

    /// Locks three stripes in ascending order, skipping duplicates. The
    /// third guard is inactive when `i3` shares a stripe with `i1`/`i2`.
    fn lock_three<M: LockMode>(
        &self,
        hp: usize,
        i1: usize,
        i2: usize,
        i3: usize,
    ) -> StdResult<(TwoBuckets<'_, M>, OneBucket<'_, M>), HashpowerChanged> {
        if M::ACTIVE {
            let mut l = [lock_ind(i1), lock_ind(i2), lock_ind(i3)];
            l.sort_unstable();
            self.locks.at(l[0]).lock();
            self.check_hashpower(hp, l[0])?;
            if l[1] != l[0] {
                self.locks.at(l[1]).lock();
            }
            if l[2] != l[1] {
                self.locks.at(l[2]).lock();
            }
        }
        let extra = if lock_ind(i3) == lock_ind(i1) || lock_ind(i3) == lock_ind(i2) {
            OneBucket::inactive()
        } else {
            OneBucket::new(&self.locks, i3)
        };
        Ok((TwoBuckets::new(&self.locks, i1, i2), extra))
    }

    /// Snapshots the hashpower, locks the hash's two candidate stripes, and
    /// retries until the snapshot survives the locking.
    fn snapshot_and_lock_two<M: LockMode>(&self, hv: HashValue) -> TwoBuckets<'_, M> {
        loop {
            let hp = self.hashpower();
            let i1 = index_hash(hp, hv.hash);
            let i2 = alt_index(hp, hv.partial, i1);
            match self.lock_two::<M>(hp, i1, i2) {
                Ok(b) => return b,
                Err(HashpowerChanged) => continue,
            }
        }
    }

    /// Takes the resize mutex and then every allocated stripe. The mutex is
    /// the top-level serializer: every all-stripe holder (resize, clear,
    /// locked view) goes through it, so two of them can never interleave
    /// stripe acquisition.
    fn snapshot_and_lock_all<M: LockMode>(&self) -> AllBuckets<'_, M> {
        let resize_guard = if M::ACTIVE {
            Some(self.resize_lock.lock())
        } else {
            None
        };
        if M::ACTIVE {
            for i in 0..self.locks.size() {
                self.locks.at(i).lock();
            }
        }
        AllBuckets::new(&self.locks, resize_guard)
    }

    /// Like [`snapshot_and_lock_all`](Self::snapshot_and_lock_all) for a
    /// caller that already holds the resize mutex.
    fn lock_all_with_resize_held<M: LockMode>(&self) -> AllBuckets<'_, M> {
        if M::ACTIVE {
            for i in 0..self.locks.size() {
                self.locks.at(i).lock();
            }
        }
        AllBuckets::new(&self.locks, None)
    }

    /// Grows the lock array for a table of `nlocks` buckets and locks every
    /// fresh stripe. Fresh stripes stay unreachable until the enlarged
    /// hashpower is published, so locking them here keeps the resize
    /// exclusive up to the moment they are released (by the migration, or
    /// by the all-stripes guard of the exclusive holder).
    fn extend_locks(&self, nlocks: usize) {
        let old = self.locks.size();
        self.locks.resize(nlocks);
        for i in old..self.locks.size() {
            self.locks.at(i).lock();
        }
    }

    pub(crate) fn lock_all(&self) -> AllBuckets<'_, crate::map::locks::Locking> {
        self.snapshot_and_lock_all()
    }

    // Scanning ------------------------------------------------------------

    fn try_read_from_bucket<Q>(&self, b: &Bucket<K, V>, partial: u8, key: &Q) -> Option<usize>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        for slot in 0..SLOT_PER_BUCKET {
            if !b.occupied(slot) || (!is_simple::<K>() && partial != b.partial(slot)) {
                continue;
            }
            if likely(unsafe { b.key(slot) }.borrow() == key) {
                return Some(slot);
            }
        }
        None
    }

    /// Searches both candidate buckets. Expects their stripes to be held.
    fn cuckoo_find<Q>(&self, partial: u8, key: &Q, i1: usize, i2: usize) -> Option<TablePos>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let buckets = unsafe { self.buckets() };
        if let Some(slot) = self.try_read_from_bucket(unsafe { buckets.bucket(i1) }, partial, key) {
            return Some(TablePos { index: i1, slot });
        }
        if let Some(slot) = self.try_read_from_bucket(unsafe { buckets.bucket(i2) }, partial, key) {
            return Some(TablePos { index: i2, slot });
        }
        None
    }

    /// Position lookup for an exclusive holder (no locks taken).
    pub(crate) fn position_of<Q>(&self, hv: HashValue, key: &Q) -> Option<TablePos>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let hp = self.hashpower();
        let i1 = index_hash(hp, hv.hash);
        let i2 = alt_index(hp, hv.partial, i1);
        self.cuckoo_find(hv.partial, key, i1, i2)
    }

    // Read/update/erase paths ---------------------------------------------

    pub(crate) fn find_fn<M, Q, F, T>(&self, hv: HashValue, key: &Q, f: F) -> Option<T>
    where
        M: LockMode,
        K: Borrow<Q>,
        Q: Eq + ?Sized,
        F: FnOnce(&V) -> T,
    {
        let b = self.snapshot_and_lock_two::<M>(hv);
        let pos = self.cuckoo_find(hv.partial, key, b.first(), b.second())?;
        let buckets = unsafe { self.buckets() };
        Some(f(unsafe { buckets.bucket(pos.index).val(pos.slot) }))
    }

    pub(crate) fn update_fn<M, Q, F, T>(&self, hv: HashValue, key: &Q, f: F) -> Option<T>
    where
        M: LockMode,
        K: Borrow<Q>,
        Q: Eq + ?Sized,
        F: FnOnce(&mut V) -> T,
    {
        let b = self.snapshot_and_lock_two::<M>(hv);
        let pos = self.cuckoo_find(hv.partial, key, b.first(), b.second())?;
        let buckets = unsafe { self.buckets() };
        Some(f(unsafe { buckets.bucket_mut(pos.index).val_mut(pos.slot) }))
    }

    /// Invokes `f` on the value if the key is present and erases the entry
    /// when `f` returns true. Returns whether the key was found.
    pub(crate) fn erase_fn<M, Q, F>(&self, hv: HashValue, key: &Q, f: F) -> bool
    where
        M: LockMode,
        K: Borrow<Q>,
        Q: Eq + ?Sized,
        F: FnOnce(&mut V) -> bool,
    {
        let b = self.snapshot_and_lock_two::<M>(hv);
        let pos = match self.cuckoo_find(hv.partial, key, b.first(), b.second()) {
            Some(pos) => pos,
            None => return false,
        };
        let buckets = unsafe { self.buckets() };
        if f(unsafe { buckets.bucket_mut(pos.index).val_mut(pos.slot) }) {
            unsafe { self.del_from_bucket(pos) };
        }
        true
    }

    /// # Safety
    /// The slot must be occupied and its stripe held.
    unsafe fn del_from_bucket(&self, pos: TablePos) {
        drop(self.buckets().bucket_mut(pos.index).erase_kv(pos.slot));
        self.locks.at(lock_ind(pos.index)).add_elems(-1);
    }

    /// # Safety
    /// The slot must be vacant and its stripe held.
    unsafe fn add_to_bucket(&self, index: usize, slot: usize, partial: u8, key: K, val: V) {
        self.buckets()
            .bucket_mut(index)
            .set_kv(slot, partial, key, val);
        self.locks.at(lock_ind(index)).add_elems(1);
    }

    /// Destroys every entry and zeroes the stripe counters.
    pub(crate) fn clear<M: LockMode>(&self) {
        let _all = self.snapshot_and_lock_all::<M>();
        unsafe { self.buckets().clear() };
        for i in 0..self.locks.size() {
            self.locks.at(i).reset_elems();
        }
    }
}

impl<K, V> RawTable<K, V>
where
    K: Eq,
{
    // Insert path ---------------------------------------------------------

    /// Scans one bucket for the key and for a vacancy. `Err(slot)` reports
    /// a duplicate; `Ok(Some(slot))` a vacancy; `Ok(None)` a full bucket.
    fn try_find_insert_bucket(
        &self,
        b: &Bucket<K, V>,
        partial: u8,
        key: &K,
    ) -> StdResult<Option<usize>, usize> {
        let mut vacant = None;
        for slot in 0..SLOT_PER_BUCKET {
            if b.occupied(slot) {
                if !is_simple::<K>() && partial != b.partial(slot) {
                    continue;
                }
                if unsafe { b.key(slot) } == key {
                    return Err(slot);
                }
            } else {
                vacant = Some(slot);
            }
        }
        Ok(vacant)
    }

    /// The atomic primitive behind insert and upsert: find the key or a
    /// place for it. On return the two candidate stripes are held and the
    /// reported position is valid under them.
    pub(crate) fn upsert<M, F, H>(
        &self,
        hv: HashValue,
        key: K,
        on_existing: F,
        val: V,
        hash_fn: &H,
    ) -> Result<bool>
    where
        M: LockMode,
        F: FnOnce(&mut V),
        H: Fn(&K) -> u64 + Sync,
        K: Send + Sync,
        V: Send + Sync,
    {
        let mut b = self.snapshot_and_lock_two::<M>(hv);
        let pos = self.cuckoo_insert_loop::<M, H>(hv, &mut b, &key, hash_fn)?;
        let buckets = unsafe { self.buckets() };
        if pos.existing {
            on_existing(unsafe { buckets.bucket_mut(pos.index).val_mut(pos.slot) });
            Ok(false)
        } else {
            unsafe { self.add_to_bucket(pos.index, pos.slot, hv.partial, key, val) };
            Ok(true)
        }
    }

    /// Runs `cuckoo_insert` until it lands: expanding on a full table,
    /// re-locking after a concurrent expansion. The guard behind `b` is
    /// active whenever this returns `Ok`.
    fn cuckoo_insert_loop<'a, M, H>(
        &'a self,
        hv: HashValue,
        b: &mut TwoBuckets<'a, M>,
        key: &K,
        hash_fn: &H,
    ) -> Result<InsertPos>
    where
        M: LockMode,
        H: Fn(&K) -> u64 + Sync,
        K: Send + Sync,
        V: Send + Sync,
    {
        loop {
            debug_assert!(b.is_active());
            let hp = self.hashpower();
            match self.cuckoo_insert::<M, H>(hv, b, key, hash_fn) {
                InsertOutcome::Vacant(pos) => {
                    return Ok(InsertPos {
                        index: pos.index,
                        slot: pos.slot,
                        existing: false,
                    });
                }
                InsertOutcome::Exists(pos) => {
                    return Ok(InsertPos {
                        index: pos.index,
                        slot: pos.slot,
                        existing: true,
                    });
                }
                InsertOutcome::TableFull => {
                    // The locks were released; expand and re-lock.
                    self.cuckoo_fast_double::<M, H>(hp, true, hash_fn)?;
                    *b = self.snapshot_and_lock_two::<M>(hv);
                }
                InsertOutcome::UnderExpansion => {
                    *b = self.snapshot_and_lock_two::<M>(hv);
                }
            }
        }
    }

    /// One insert attempt under the two held stripes: duplicate scan, then
    /// vacancy scan, then the displacement engine. `TableFull` and
    /// `UnderExpansion` come back with the stripes released.
    fn cuckoo_insert<'a, M, H>(
        &'a self,
        hv: HashValue,
        b: &mut TwoBuckets<'a, M>,
        key: &K,
        hash_fn: &H,
    ) -> InsertOutcome
    where
        M: LockMode,
        H: Fn(&K) -> u64 + Sync,
    {
        let buckets = unsafe { self.buckets() };
        let res1 = match self.try_find_insert_bucket(
            unsafe { buckets.bucket(b.first()) },
            hv.partial,
            key,
        ) {
            Err(slot) => {
                return InsertOutcome::Exists(TablePos {
                    index: b.first(),
                    slot,
                });
            }
            Ok(vacant) => vacant,
        };
        let res2 = match self.try_find_insert_bucket(
            unsafe { buckets.bucket(b.second()) },
            hv.partial,
            key,
        ) {
            Err(slot) => {
                return InsertOutcome::Exists(TablePos {
                    index: b.second(),
                    slot,
                });
            }
            Ok(vacant) => vacant,
        };
        if let Some(slot) = res1 {
            return InsertOutcome::Vacant(TablePos {
                index: b.first(),
                slot,
            });
        }
        if let Some(slot) = res2 {
            return InsertOutcome::Vacant(TablePos {
                index: b.second(),
                slot,
            });
        }

        // Both candidates are full; displace something.
        match self.run_cuckoo::<M, H>(b, hash_fn) {
            CuckooStatus::Ok(index, slot) => {
                debug_assert!(b.is_active());
                debug_assert!(index == b.first() || index == b.second());
                // The stripes were released while the path search ran;
                // another thread may have inserted this key in the interim.
                if let Some(pos) = self.cuckoo_find(hv.partial, key, b.first(), b.second()) {
                    return InsertOutcome::Exists(pos);
                }
                InsertOutcome::Vacant(TablePos { index, slot })
            }
            CuckooStatus::Failure => InsertOutcome::TableFull,
            CuckooStatus::UnderExpansion => InsertOutcome::UnderExpansion,
        }
    }

    // BFS displacement engine ---------------------------------------------

    /// Releases the two insert stripes, searches for a path, and executes
    /// it. On `Ok` the guard is active again and one of the two candidate
    /// buckets has a vacant slot.
    fn run_cuckoo<'a, M, H>(&'a self, b: &mut TwoBuckets<'a, M>, hash_fn: &H) -> CuckooStatus
    where
        M: LockMode,
        H: Fn(&K) -> u64 + Sync,
    {
        // The path search and move take stripe locks hop by hop; holding on
        // to the insert stripes here would deadlock against them. The final
        // hop of a successful move re-locks both and hands them back.
        let hp = self.hashpower();
        b.unlock();
        let mut path = [CuckooRecord::default(); MAX_BFS_PATH_LEN];
        loop {
            let depth =
                match self.cuckoopath_search::<M, H>(hp, &mut path, b.first(), b.second(), hash_fn)
                {
                    Ok(Some(depth)) => depth,
                    Ok(None) => return CuckooStatus::Failure,
                    Err(HashpowerChanged) => return CuckooStatus::UnderExpansion,
                };
            match self.cuckoopath_move::<M, H>(hp, &path, depth, b, hash_fn) {
                Ok(true) => {
                    debug_assert!(b.is_active());
                    return CuckooStatus::Ok(path[0].bucket, path[0].slot);
                }
                Ok(false) => continue,
                Err(HashpowerChanged) => return CuckooStatus::UnderExpansion,
            }
        }
    }

    /// Breadth-first search for a bucket with a vacant slot, starting from
    /// the two candidates. Locks each frontier bucket only for the moment
    /// its occupancy is read, so the result is a *candidate* path that the
    /// move re-validates.
    fn slot_search<M: LockMode>(
        &self,
        hp: usize,
        i1: usize,
        i2: usize,
    ) -> StdResult<Option<BSlot>, HashpowerChanged> {
        let mut q = BQueue::new();
        // The seed pathcodes record which bucket the path starts on.
        q.enqueue(BSlot {
            bucket: i1,
            pathcode: 0,
            depth: 0,
        });
        q.enqueue(BSlot {
            bucket: i2,
            pathcode: 1,
            depth: 0,
        });
        while !q.full() && !q.empty() {
            let mut x = q.dequeue();
            let starting_slot = x.pathcode % SLOT_PER_BUCKET;
            for i in 0..SLOT_PER_BUCKET {
                if q.full() {
                    break;
                }
                let slot = (starting_slot + i) % SLOT_PER_BUCKET;
                let _ob = self.lock_one::<M>(hp, x.bucket)?;
                let buckets = unsafe { self.buckets() };
                let b = unsafe { buckets.bucket(x.bucket) };
                if !b.occupied(slot) {
                    x.pathcode = x.pathcode * SLOT_PER_BUCKET + slot;
                    return Ok(Some(x));
                }
                // Where the occupant of this slot would go if kicked out.
                let partial = b.partial(slot);
                if x.depth < MAX_BFS_PATH_LEN - 1 {
                    q.enqueue(BSlot {
                        bucket: alt_index(hp, partial, x.bucket),
                        pathcode: x.pathcode * SLOT_PER_BUCKET + slot,
                        depth: x.depth + 1,
                    });
                }
            }
        }
        Ok(None)
    }

    /// Decodes the winning `BSlot` into concrete (bucket, slot, hash)
    /// records, re-reading each occupant under a brief lock. Returns the
    /// usable depth, which may be shorter than the search's if an occupant
    /// vanished in the meantime.
    fn cuckoopath_search<M, H>(
        &self,
        hp: usize,
        path: &mut [CuckooRecord; MAX_BFS_PATH_LEN],
        i1: usize,
        i2: usize,
        hash_fn: &H,
    ) -> StdResult<Option<usize>, HashpowerChanged>
    where
        M: LockMode,
        H: Fn(&K) -> u64 + Sync,
    {
        let mut x = match self.slot_search::<M>(hp, i1, i2)? {
            Some(x) => x,
            None => return Ok(None),
        };
        // Slot indices come out of the pathcode low digit first, i.e. from
        // the deepest hop backwards.
        for i in (0..=x.depth).rev() {
            path[i].slot = x.pathcode % SLOT_PER_BUCKET;
            x.pathcode /= SLOT_PER_BUCKET;
        }
        path[0].bucket = if x.pathcode == 0 {
            i1
        } else {
            debug_assert_eq!(x.pathcode, 1);
            i2
        };
        {
            let _ob = self.lock_one::<M>(hp, path[0].bucket)?;
            let buckets = unsafe { self.buckets() };
            let b = unsafe { buckets.bucket(path[0].bucket) };
            if !b.occupied(path[0].slot) {
                // Vacated while we were searching; a zero-hop path.
                return Ok(Some(0));
            }
            path[0].hv = hashed_key(hash_fn(unsafe { b.key(path[0].slot) }));
        }
        for i in 1..=x.depth {
            let prev = path[i - 1];
            let curr_bucket = alt_index(hp, prev.hv.partial, prev.bucket);
            path[i].bucket = curr_bucket;
            let _ob = self.lock_one::<M>(hp, curr_bucket)?;
            let buckets = unsafe { self.buckets() };
            let b = unsafe { buckets.bucket(curr_bucket) };
            if !b.occupied(path[i].slot) {
                return Ok(Some(i));
            }
            path[i].hv = hashed_key(hash_fn(unsafe { b.key(path[i].slot) }));
        }
        Ok(Some(x.depth))
    }

    /// Executes the path from the deepest hop up, re-validating every hop
    /// under its locks. `Ok(true)` hands the two insert stripes back to the
    /// caller, locked; `Ok(false)` means the path went stale and everything
    /// is unlocked again.
    fn cuckoopath_move<'a, M, H>(
        &'a self,
        hp: usize,
        path: &[CuckooRecord; MAX_BFS_PATH_LEN],
        mut depth: usize,
        b: &mut TwoBuckets<'a, M>,
        hash_fn: &H,
    ) -> StdResult<bool, HashpowerChanged>
    where
        M: LockMode,
        H: Fn(&K) -> u64 + Sync,
    {
        debug_assert!(!b.is_active());
        if depth == 0 {
            // The "path" is a slot of one of the insert buckets that went
            // vacant during the search. Take both stripes and make sure it
            // still is.
            let bucket = path[0].bucket;
            debug_assert!(bucket == b.first() || bucket == b.second());
            *b = self.lock_two::<M>(hp, b.first(), b.second())?;
            let buckets = unsafe { self.buckets() };
            if !unsafe { buckets.bucket(bucket) }.occupied(path[0].slot) {
                return Ok(true);
            }
            b.unlock();
            return Ok(false);
        }

        while depth > 0 {
            let from = path[depth - 1];
            let to = path[depth];
            let twob;
            let mut _extra = None;
            if depth == 1 {
                // The last hop moves out of one of the insert buckets; lock
                // both of them plus the move target so both stay held for
                // the caller afterwards.
                let (t, e) = self.lock_three::<M>(hp, b.first(), b.second(), to.bucket)?;
                twob = t;
                _extra = Some(e);
            } else {
                twob = self.lock_two::<M>(hp, from.bucket, to.bucket)?;
            }
            {
                let buckets = unsafe { self.buckets() };
                let fb = unsafe { buckets.bucket(from.bucket) };
                let tb = unsafe { buckets.bucket(to.bucket) };
                // The occupant may have been erased, replaced, or already
                // displaced, and the target slot may have been taken. Only
                // the hash needs to match: equal-hash keys share candidate
                // buckets, so the path stays valid.
                if !fb.occupied(from.slot)
                    || tb.occupied(to.slot)
                    || hash_fn(unsafe { fb.key(from.slot) }) != from.hv.hash
                {
                    return Ok(false);
                }
                unsafe {
                    buckets.move_to_bucket(from.bucket, from.slot, to.bucket, to.slot);
                }
            }
            if depth == 1 {
                // Keep the insert stripes; the target stripe (if distinct)
                // unlocks when `_extra` drops.
                *b = twob;
            }
            depth -= 1;
        }
        Ok(true)
    }

    // Resizing ------------------------------------------------------------

    fn check_resize_validity(
        &self,
        orig_hp: usize,
        new_hp: usize,
        automatic: bool,
    ) -> Result<Validity> {
        let mhp = self.maximum_hashpower();
        if mhp != NO_MAXIMUM_HASHPOWER && new_hp > mhp {
            return Err(CuckooError::MaximumHashpowerExceeded(new_hp));
        }
        if automatic {
            let lf = self.load_factor();
            if lf < self.minimum_load_factor() {
                return Err(CuckooError::LoadFactorTooLow(lf));
            }
        }
        if self.hashpower() != orig_hp {
            return Ok(Validity::AlreadyResized);
        }
        Ok(Validity::Proceed)
    }

    /// Doubles the table in place. Slots keep their index within the
    /// doubled array (partials don't depend on the hashpower), so the only
    /// rehash work is deciding, per entry, whether it stays at `b` or moves
    /// to `b + 2^hp`; that work is done per stripe, unlocking each stripe
    /// as its buckets finish, in parallel chunks on large tables.
    fn cuckoo_fast_double<M, H>(&self, current_hp: usize, automatic: bool, hash_fn: &H) -> Result<()>
    where
        M: LockMode,
        H: Fn(&K) -> u64 + Sync,
        K: Send + Sync,
        V: Send + Sync,
    {
        let new_hp = current_hp + 1;
        let _resize_guard = if M::ACTIVE {
            Some(self.resize_lock.lock())
        } else {
            None
        };
        if let Validity::AlreadyResized = self.check_resize_validity(current_hp, new_hp, automatic)?
        {
            // Another thread grew the table first; the caller just retries.
            return Ok(());
        }
        let mut all = self.lock_all_with_resize_held::<M>();
        self.extend_locks(hashsize(new_hp));

        unsafe {
            let buckets = self.buckets_mut();
            let mut new_buckets = BucketArray::new(new_hp);
            for i in 0..buckets.len() {
                for slot in 0..SLOT_PER_BUCKET {
                    if buckets.bucket(i).occupied(slot) {
                        let partial = buckets.bucket(i).partial(slot);
                        let (k, v) = buckets.bucket_mut(i).erase_kv(slot);
                        new_buckets.bucket_mut(i).set_kv(slot, partial, k, v);
                    }
                }
            }
            mem::swap(buckets, &mut new_buckets);
        }
        self.set_hashpower(new_hp);

        // Migrate the entries whose index gained a top bit, stripe by
        // stripe, releasing each stripe once its buckets are consistent
        // under the new hashpower.
        let locks_to_move = self.locks.size().min(hashsize(current_hp));
        self.parallel_exec(0, locks_to_move, &|start, end| {
            self.move_buckets::<M, H>(current_hp, new_hp, start, end, hash_fn);
            Ok(())
        })?;
        self.parallel_exec(locks_to_move, self.locks.size(), &|start, end| {
            if M::ACTIVE {
                for i in start..end {
                    self.locks.at(i).unlock();
                }
            }
            Ok(())
        })?;
        // Every stripe has been released by hand.
        all.release();
        Ok(())
    }

    fn move_buckets<M, H>(
        &self,
        old_hp: usize,
        new_hp: usize,
        start_lock: usize,
        end_lock: usize,
        hash_fn: &H,
    ) where
        M: LockMode,
        H: Fn(&K) -> u64 + Sync,
    {
        for lock in start_lock..end_lock {
            let mut bucket_i = lock;
            while bucket_i < hashsize(old_hp) {
                self.move_bucket_entries(old_hp, new_hp, bucket_i, hash_fn);
                bucket_i += crate::map::locks::MAX_NUM_LOCKS;
            }
            if M::ACTIVE {
                self.locks.at(lock).unlock();
            }
        }
    }

    fn move_bucket_entries<H>(&self, old_hp: usize, new_hp: usize, bucket_i: usize, hash_fn: &H)
    where
        H: Fn(&K) -> u64 + Sync,
    {
        let buckets = unsafe { self.buckets() };
        let new_bucket_i = bucket_i + hashsize(old_hp);
        let mut new_bucket_slot = 0;
        for slot in 0..SLOT_PER_BUCKET {
            let old_bucket = unsafe { buckets.bucket(bucket_i) };
            if !old_bucket.occupied(slot) {
                continue;
            }
            let hv = hashed_key(hash_fn(unsafe { old_bucket.key(slot) }));
            let old_ihash = index_hash(old_hp, hv.hash);
            let old_ahash = alt_index(old_hp, hv.partial, old_ihash);
            let new_ihash = index_hash(new_hp, hv.hash);
            let new_ahash = alt_index(new_hp, hv.partial, new_ihash);
            if (bucket_i == old_ihash && new_ihash == new_bucket_i)
                || (bucket_i == old_ahash && new_ahash == new_bucket_i)
            {
                unsafe {
                    buckets.move_to_bucket(bucket_i, slot, new_bucket_i, new_bucket_slot);
                }
                new_bucket_slot += 1;
                self.locks.at(lock_ind(bucket_i)).add_elems(-1);
                self.locks.at(lock_ind(new_bucket_i)).add_elems(1);
            }
        }
    }

    /// Rebuilds the table at `new_hp` by reinserting every entry into a
    /// fresh table and swapping the storage in. Handles shrinking: if the
    /// entries don't fit, reinsertion grows the fresh table, so the result
    /// is the smallest hashpower that holds everything.
    fn cuckoo_expand_simple<M, H>(&self, new_hp: usize, automatic: bool, hash_fn: &H) -> Result<bool>
    where
        M: LockMode,
        H: Fn(&K) -> u64 + Sync,
        K: Send + Sync,
        V: Send + Sync,
    {
        use crate::map::locks::Locking;

        let _resize_guard = if M::ACTIVE {
            Some(self.resize_lock.lock())
        } else {
            None
        };
        let all = self.lock_all_with_resize_held::<M>();
        let hp = self.hashpower();
        self.check_resize_validity(hp, new_hp, automatic)?;
        if new_hp == hp {
            return Ok(false);
        }

        let new_table = RawTable::<K, V>::with_hashpower(new_hp);
        self.parallel_exec(0, hashsize(hp), &|start, end| {
            let buckets = unsafe { self.buckets() };
            for i in start..end {
                for slot in 0..SLOT_PER_BUCKET {
                    let bucket = unsafe { buckets.bucket_mut(i) };
                    if !bucket.occupied(slot) {
                        continue;
                    }
                    let (k, v) = unsafe { bucket.erase_kv(slot) };
                    let hv = hashed_key(hash_fn(&k));
                    let mut b = new_table.snapshot_and_lock_two::<Locking>(hv);
                    let pos = new_table.cuckoo_insert_loop::<Locking, H>(hv, &mut b, &k, hash_fn)?;
                    debug_assert!(!pos.existing);
                    if !pos.existing {
                        unsafe {
                            new_table.add_to_bucket(pos.index, pos.slot, hv.partial, k, v);
                        }
                    }
                }
            }
            Ok(())
        })?;

        // Reinsertion may have grown the fresh table past `new_hp`.
        let final_hp = new_table.hashpower();
        self.extend_locks(hashsize(final_hp));
        unsafe {
            mem::swap(self.buckets_mut(), new_table.buckets_mut());
        }
        self.set_hashpower(final_hp);
        drop(all);
        Ok(true)
    }

    pub(crate) fn rehash<M, H>(&self, new_hp: usize, hash_fn: &H) -> Result<bool>
    where
        M: LockMode,
        H: Fn(&K) -> u64 + Sync,
        K: Send + Sync,
        V: Send + Sync,
    {
        if new_hp == self.hashpower() {
            return Ok(false);
        }
        self.cuckoo_expand_simple::<M, H>(new_hp, false, hash_fn)
    }

    pub(crate) fn reserve<M, H>(&self, n: usize, hash_fn: &H) -> Result<bool>
    where
        M: LockMode,
        H: Fn(&K) -> u64 + Sync,
        K: Send + Sync,
        V: Send + Sync,
    {
        let new_hp = reserve_calc(n);
        if new_hp == self.hashpower() {
            return Ok(false);
        }
        self.cuckoo_expand_simple::<M, H>(new_hp, false, hash_fn)
    }

    /// Splits `[start, end)` across worker threads on large tables. Worker
    /// panics resume on the caller after every thread has joined; worker
    /// errors surface as the first `Err`.
    fn parallel_exec<F>(&self, start: usize, end: usize, f: &F) -> Result<()>
    where
        F: Fn(usize, usize) -> Result<()> + Sync,
    {
        let total = end - start;
        let num_threads = num_cpus::get().max(1);
        if total < PARALLEL_RESIZE_THRESHOLD || num_threads < 2 {
            return f(start, end);
        }
        let work_per_thread = total / num_threads;
        thread::scope(|s| {
            let mut handles = Vec::with_capacity(num_threads);
            let mut begin = start;
            for i in 0..num_threads {
                let chunk_end = if i == num_threads - 1 {
                    end
                } else {
                    begin + work_per_thread
                };
                handles.push(s.spawn(move || f(begin, chunk_end)));
                begin = chunk_end;
            }
            for handle in handles {
                match handle.join() {
                    Ok(res) => res?,
                    Err(payload) => std::panic::resume_unwind(payload),
                }
            }
            Ok(())
        })
    }
}
