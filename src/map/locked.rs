//! An exclusive, all-stripes-held view of a table.
//!
//! [`LockedTable`] owns the resize mutex and every stripe lock for its
//! lifetime, so it can hand out plain references into the buckets, iterate
//! them without synchronization, and run bulk operations through the same
//! engine code paths with locking compiled out. Concurrent table operations
//! block (spinning on their stripes) until the view is dropped.

use std::borrow::Borrow;
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::marker::PhantomData;

use crate::config::SLOT_PER_BUCKET;
use crate::error::Result;
use crate::map::bucket::BucketArray;
use crate::map::locks::{AllBuckets, Locking, NoLocking};
use crate::map::{make_hash, CuckooMap, DefaultHashBuilder};

/// Exclusive ownership of a [`CuckooMap`]'s locks. Created by
/// [`CuckooMap::lock_table`]; dropping it releases every stripe and the
/// resize mutex deterministically.
pub struct LockedTable<'a, K, V, S = DefaultHashBuilder> {
    map: &'a CuckooMap<K, V, S>,
    _all: AllBuckets<'a, Locking>,
}

impl<'a, K, V, S> LockedTable<'a, K, V, S> {
    pub(crate) fn new(map: &'a CuckooMap<K, V, S>) -> Self {
        let all = map.table.lock_all();
        LockedTable { map, _all: all }
    }

    #[inline]
    fn buckets(&self) -> &BucketArray<K, V> {
        // Exclusive: every stripe is held for the lifetime of the view.
        unsafe { self.map.table.buckets() }
    }

    pub fn hashpower(&self) -> usize {
        self.map.table.hashpower()
    }

    pub fn bucket_count(&self) -> usize {
        self.map.table.bucket_count()
    }

    pub fn capacity(&self) -> usize {
        self.map.table.capacity()
    }

    /// Exact while the view exists; nothing else can mutate the table.
    pub fn len(&self) -> usize {
        self.map.table.size()
    }

    pub fn is_empty(&self) -> bool {
        self.map.table.is_empty()
    }

    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            buckets: self.buckets(),
            index: 0,
            slot: 0,
            items: self.len(),
        }
    }

    pub fn iter_mut(&mut self) -> IterMut<'_, K, V> {
        IterMut {
            buckets: self.buckets(),
            index: 0,
            slot: 0,
            items: self.len(),
            marker: PhantomData,
        }
    }
}

impl<'a, K, V, S> LockedTable<'a, K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    pub fn find<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hv = self.map.hashed(key);
        let pos = self.map.table.position_of(hv, key)?;
        Some(unsafe { self.buckets().bucket(pos.index).val(pos.slot) })
    }

    pub fn get_mut<Q>(&mut self, key: &Q) -> Option<&mut V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hv = self.map.hashed(key);
        let pos = self.map.table.position_of(hv, key)?;
        Some(unsafe { self.buckets().bucket_mut(pos.index).val_mut(pos.slot) })
    }

    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.find(key).is_some()
    }

    pub fn erase<Q>(&mut self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hv = self.map.hashed(key);
        self.map.table.erase_fn::<NoLocking, _, _>(hv, key, |_| true)
    }

    pub fn clear(&mut self) {
        self.map.table.clear::<NoLocking>();
    }
}

impl<'a, K, V, S> LockedTable<'a, K, V, S>
where
    K: Hash + Eq + Send + Sync,
    V: Send + Sync,
    S: BuildHasher + Sync,
{
    /// Bulk insert. Expansion triggered from inside the view keeps the
    /// newly created stripes locked, so the view stays exclusive across a
    /// growth.
    pub fn insert(&mut self, key: K, val: V) -> Result<bool> {
        let hv = self.map.hashed(&key);
        let hash_builder = &self.map.hash_builder;
        let hash_fn = move |k: &K| make_hash(hash_builder, k);
        self.map
            .table
            .upsert::<NoLocking, _, _>(hv, key, |_| {}, val, &hash_fn)
    }

    pub fn rehash(&mut self, new_hashpower: usize) -> Result<bool> {
        let hash_builder = &self.map.hash_builder;
        let hash_fn = move |k: &K| make_hash(hash_builder, k);
        self.map
            .table
            .rehash::<NoLocking, _>(new_hashpower, &hash_fn)
    }

    pub fn reserve(&mut self, n: usize) -> Result<bool> {
        let hash_builder = &self.map.hash_builder;
        let hash_fn = move |k: &K| make_hash(hash_builder, k);
        self.map.table.reserve::<NoLocking, _>(n, &hash_fn)
    }
}

impl<'a, 'b, K, V, S1, S2> PartialEq<LockedTable<'b, K, V, S2>> for LockedTable<'a, K, V, S1>
where
    K: Hash + Eq,
    V: PartialEq,
    S1: BuildHasher,
    S2: BuildHasher,
{
    fn eq(&self, other: &LockedTable<'b, K, V, S2>) -> bool {
        if self.len() != other.len() {
            return false;
        }
        self.iter()
            .all(|(k, v)| other.find(k).map_or(false, |ov| v == ov))
    }
}

impl<'a, K, V, S> fmt::Debug for LockedTable<'a, K, V, S>
where
    K: fmt::Debug,
    V: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (k, v) in self.iter() {
            map.entry(k, v);
        }
        map.finish()
    }
}

impl<'a, 'b, K, V, S> IntoIterator for &'b LockedTable<'a, K, V, S> {
    type Item = (&'b K, &'b V);
    type IntoIter = Iter<'b, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<'a, 'b, K, V, S> IntoIterator for &'b mut LockedTable<'a, K, V, S> {
    type Item = (&'b K, &'b mut V);
    type IntoIter = IterMut<'b, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter_mut()
    }
}

/// Read-only iterator over the occupied slots of a locked table, in bucket
/// order.
pub struct Iter<'a, K, V> {
    buckets: &'a BucketArray<K, V>,
    index: usize,
    slot: usize,
    items: usize,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        while self.index < self.buckets.len() {
            let bucket = unsafe { self.buckets.bucket(self.index) };
            while self.slot < SLOT_PER_BUCKET {
                let slot = self.slot;
                self.slot += 1;
                if bucket.occupied(slot) {
                    let kv = unsafe { bucket.kv(slot) };
                    self.items -= 1;
                    return Some((&kv.0, &kv.1));
                }
            }
            self.slot = 0;
            self.index += 1;
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.items, Some(self.items))
    }
}

impl<'a, K, V> ExactSizeIterator for Iter<'a, K, V> {}
impl<'a, K, V> std::iter::FusedIterator for Iter<'a, K, V> {}

/// Like [`Iter`], with mutable access to the values.
pub struct IterMut<'a, K, V> {
    buckets: &'a BucketArray<K, V>,
    index: usize,
    slot: usize,
    items: usize,
    marker: PhantomData<&'a mut (K, V)>,
}

impl<'a, K, V> Iterator for IterMut<'a, K, V> {
    type Item = (&'a K, &'a mut V);

    fn next(&mut self) -> Option<Self::Item> {
        while self.index < self.buckets.len() {
            let bucket = unsafe { self.buckets.bucket_mut(self.index) };
            while self.slot < SLOT_PER_BUCKET {
                let slot = self.slot;
                self.slot += 1;
                if bucket.occupied(slot) {
                    let kv = unsafe { bucket.kv_mut(slot) };
                    self.items -= 1;
                    return Some((&kv.0, &mut kv.1));
                }
            }
            self.slot = 0;
            self.index += 1;
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.items, Some(self.items))
    }
}

impl<'a, K, V> ExactSizeIterator for IterMut<'a, K, V> {}
impl<'a, K, V> std::iter::FusedIterator for IterMut<'a, K, V> {}
