//! Raw bucket storage.
//!
//! A bucket is a fixed record of `SLOT_PER_BUCKET` slots; each slot carries
//! an occupancy flag, an 8-bit partial key, and uninitialized storage for
//! one key-value pair. The pair is only ever constructed in place while the
//! flag is false and destroyed while it is true, so the flag is the single
//! source of truth for slot liveness.
//!
//! `BucketArray` owns `2^hashpower` buckets in one raw allocation and hands
//! out per-index references through unsafe accessors. Callers are expected
//! to hold the stripe lock of a bucket before touching it; disjoint buckets
//! may be mutated from different threads at the same time, which is why the
//! accessors go through raw pointers instead of borrowing the whole array.

use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::hint;
use std::marker::PhantomData;
use std::mem::{self, MaybeUninit};
use std::ptr::{self, NonNull};

use crate::config::SLOT_PER_BUCKET;

pub(crate) struct Bucket<K, V> {
    occupied: [bool; SLOT_PER_BUCKET],
    partials: [u8; SLOT_PER_BUCKET],
    slots: [MaybeUninit<(K, V)>; SLOT_PER_BUCKET],
}

impl<K, V> Bucket<K, V> {
    pub(crate) fn new() -> Self {
        Bucket {
            occupied: [false; SLOT_PER_BUCKET],
            partials: [0; SLOT_PER_BUCKET],
            // An uninitialized array of `MaybeUninit` is initialized.
            slots: unsafe { MaybeUninit::uninit().assume_init() },
        }
    }

    #[inline(always)]
    pub(crate) fn occupied(&self, slot: usize) -> bool {
        self.occupied[slot]
    }

    #[inline(always)]
    pub(crate) fn partial(&self, slot: usize) -> u8 {
        self.partials[slot]
    }

    /// # Safety
    /// The slot must be occupied.
    #[inline(always)]
    pub(crate) unsafe fn key(&self, slot: usize) -> &K {
        debug_assert!(self.occupied[slot]);
        &(*self.slots[slot].as_ptr()).0
    }

    /// # Safety
    /// The slot must be occupied.
    #[inline(always)]
    pub(crate) unsafe fn val(&self, slot: usize) -> &V {
        debug_assert!(self.occupied[slot]);
        &(*self.slots[slot].as_ptr()).1
    }

    /// # Safety
    /// The slot must be occupied.
    #[inline(always)]
    pub(crate) unsafe fn val_mut(&mut self, slot: usize) -> &mut V {
        debug_assert!(self.occupied[slot]);
        &mut (*self.slots[slot].as_mut_ptr()).1
    }

    /// # Safety
    /// The slot must be occupied.
    #[inline(always)]
    pub(crate) unsafe fn kv(&self, slot: usize) -> &(K, V) {
        debug_assert!(self.occupied[slot]);
        &*self.slots[slot].as_ptr()
    }

    /// # Safety
    /// The slot must be occupied. The key half must not be mutated in a way
    /// that changes its hash or equality.
    #[inline(always)]
    pub(crate) unsafe fn kv_mut(&mut self, slot: usize) -> &mut (K, V) {
        debug_assert!(self.occupied[slot]);
        &mut *self.slots[slot].as_mut_ptr()
    }

    /// Constructs a pair in place. The occupancy flag is published only
    /// after the pair has been written, so an unwind while evaluating the
    /// arguments leaves the slot vacant.
    ///
    /// # Safety
    /// The slot must be vacant.
    #[inline]
    pub(crate) unsafe fn set_kv(&mut self, slot: usize, partial: u8, key: K, val: V) {
        debug_assert!(!self.occupied[slot]);
        self.partials[slot] = partial;
        self.slots[slot].as_mut_ptr().write((key, val));
        self.occupied[slot] = true;
    }

    /// Moves the pair out of the slot, leaving it vacant.
    ///
    /// # Safety
    /// The slot must be occupied.
    #[inline]
    pub(crate) unsafe fn erase_kv(&mut self, slot: usize) -> (K, V) {
        debug_assert!(self.occupied[slot]);
        self.occupied[slot] = false;
        self.slots[slot].as_ptr().read()
    }

    /// Drops every live pair in the bucket.
    pub(crate) fn clear(&mut self) {
        for slot in 0..SLOT_PER_BUCKET {
            if self.occupied[slot] {
                self.occupied[slot] = false;
                unsafe { ptr::drop_in_place(self.slots[slot].as_mut_ptr()) };
            }
        }
    }
}

/// `2^hashpower` buckets in one allocation.
pub(crate) struct BucketArray<K, V> {
    base: NonNull<Bucket<K, V>>,
    hashpower: usize,
    marker: PhantomData<(K, V)>,
}

impl<K, V> BucketArray<K, V> {
    pub(crate) fn new(hashpower: usize) -> Self {
        let len = 1usize << hashpower;
        let layout = match Layout::array::<Bucket<K, V>>(len) {
            Ok(layout) => layout,
            Err(_) => panic!("hash table capacity overflow"),
        };
        let base = unsafe {
            let ptr = alloc(layout) as *mut Bucket<K, V>;
            if ptr.is_null() {
                handle_alloc_error(layout);
            }
            for i in 0..len {
                ptr.add(i).write(Bucket::new());
            }
            NonNull::new_unchecked(ptr)
        };
        BucketArray {
            base,
            hashpower,
            marker: PhantomData,
        }
    }

    #[inline(always)]
    pub(crate) fn len(&self) -> usize {
        1 << self.hashpower
    }

    /// # Safety
    /// `index` must be in bounds and the caller must hold the bucket's
    /// stripe lock (or otherwise have exclusive access to the table).
    #[inline(always)]
    pub(crate) unsafe fn bucket(&self, index: usize) -> &Bucket<K, V> {
        debug_assert!(index < self.len());
        &*self.base.as_ptr().add(index)
    }

    /// # Safety
    /// Same as [`bucket`](Self::bucket), and no other reference to this
    /// bucket may be live.
    #[allow(clippy::mut_from_ref)]
    #[inline(always)]
    pub(crate) unsafe fn bucket_mut(&self, index: usize) -> &mut Bucket<K, V> {
        debug_assert!(index < self.len());
        &mut *self.base.as_ptr().add(index)
    }

    /// Relocates one pair, tag included, without copying. The source and
    /// destination buckets may coincide (a key whose alternate index equals
    /// its home index moves between slots of the same bucket).
    ///
    /// # Safety
    /// The source slot must be occupied, the destination vacant, and the
    /// caller must hold the stripe locks covering both buckets.
    pub(crate) unsafe fn move_to_bucket(
        &self,
        from_bucket: usize,
        from_slot: usize,
        to_bucket: usize,
        to_slot: usize,
    ) {
        if from_bucket == to_bucket {
            let b = self.bucket_mut(from_bucket);
            let partial = b.partial(from_slot);
            let (key, val) = b.erase_kv(from_slot);
            b.set_kv(to_slot, partial, key, val);
        } else {
            let fb = self.bucket_mut(from_bucket);
            let tb = self.bucket_mut(to_bucket);
            let partial = fb.partial(from_slot);
            let (key, val) = fb.erase_kv(from_slot);
            tb.set_kv(to_slot, partial, key, val);
        }
    }

    /// Drops every live pair without deallocating the buckets.
    ///
    /// # Safety
    /// The caller must have exclusive access to the table.
    pub(crate) unsafe fn clear(&self) {
        for i in 0..self.len() {
            self.bucket_mut(i).clear();
        }
    }
}

impl<K, V> Drop for BucketArray<K, V> {
    fn drop(&mut self) {
        let len = self.len();
        unsafe {
            if mem::needs_drop::<(K, V)>() {
                self.clear();
            }
            let layout = Layout::array::<Bucket<K, V>>(len)
                // The same layout was computed successfully in `new`.
                .unwrap_or_else(|_| hint::unreachable_unchecked());
            dealloc(self.base.as_ptr() as *mut u8, layout);
        }
    }
}

unsafe impl<K: Send, V: Send> Send for BucketArray<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for BucketArray<K, V> {}
