//! Striped spinlocks.
//!
//! Bucket `b` is guarded by the lock at stripe `b % 2^LOCK_ARRAY_POWER`.
//! The stripe modulus never changes, so a bucket's lock identity survives
//! resizing; the array itself is allocated lazily in fixed segments and
//! only ever grows. Each lock carries the signed element counter for the
//! buckets it covers: the counters are mutated only while the lock is held
//! and are summed without locks by the sizing queries, so they are stored
//! as relaxed atomics and are meaningful only in aggregate.

use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicPtr, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;
use parking_lot::MutexGuard;

use crate::config::{LOCK_ARRAY_POWER, LOCK_SEGMENT_POWER};

/// Total number of stripes, and the fixed modulus of [`lock_ind`].
pub(crate) const MAX_NUM_LOCKS: usize = 1 << LOCK_ARRAY_POWER;

const SEGMENT_SIZE: usize = 1 << LOCK_SEGMENT_POWER;
const NUM_SEGMENTS: usize = MAX_NUM_LOCKS >> LOCK_SEGMENT_POWER;

/// Maps a bucket index to its stripe.
#[inline(always)]
pub(crate) fn lock_ind(bucket_ind: usize) -> usize {
    bucket_ind & (MAX_NUM_LOCKS - 1)
}

/// A test-and-test-and-set spinlock plus the element counter of its stripe.
pub(crate) struct SpinLock {
    locked: AtomicBool,
    elem_counter: AtomicI64,
}

impl SpinLock {
    pub(crate) fn new() -> Self {
        SpinLock {
            locked: AtomicBool::new(false),
            elem_counter: AtomicI64::new(0),
        }
    }

    #[inline]
    pub(crate) fn lock(&self) {
        while !self.try_lock() {
            while self.locked.load(Ordering::Relaxed) {
                std::hint::spin_loop();
            }
        }
    }

    #[inline]
    pub(crate) fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    #[inline]
    pub(crate) fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    #[inline]
    pub(crate) fn elem_counter(&self) -> i64 {
        self.elem_counter.load(Ordering::Relaxed)
    }

    /// Only the lock holder may call this.
    #[inline]
    pub(crate) fn add_elems(&self, n: i64) {
        self.elem_counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Only meaningful with every stripe held.
    #[inline]
    pub(crate) fn reset_elems(&self) {
        self.elem_counter.store(0, Ordering::Relaxed);
    }
}

/// Grow-only array of cache-padded stripes, allocated one segment at a
/// time. Published segments never move, so a `&SpinLock` handed out once
/// stays valid for the lifetime of the array.
pub(crate) struct LockArray {
    segments: Box<[AtomicPtr<CachePadded<SpinLock>>]>,
    allocated: AtomicUsize,
}

impl LockArray {
    pub(crate) fn new(nlocks: usize) -> Self {
        let segments = (0..NUM_SEGMENTS)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let array = LockArray {
            segments,
            allocated: AtomicUsize::new(0),
        };
        array.resize(nlocks);
        array
    }

    /// Number of usable stripes (a multiple of the segment size).
    #[inline]
    pub(crate) fn size(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
    }

    /// Grows the array until at least `min(nlocks, MAX_NUM_LOCKS)` stripes
    /// exist. Never shrinks. Safe to race: segment installation is a
    /// compare-and-swap and the loser frees its allocation.
    pub(crate) fn resize(&self, nlocks: usize) {
        let target = nlocks.min(MAX_NUM_LOCKS);
        let segments_needed = (target + SEGMENT_SIZE - 1) >> LOCK_SEGMENT_POWER;
        for seg in 0..segments_needed {
            if !self.segments[seg].load(Ordering::Acquire).is_null() {
                continue;
            }
            let fresh = (0..SEGMENT_SIZE)
                .map(|_| CachePadded::new(SpinLock::new()))
                .collect::<Vec<_>>()
                .into_boxed_slice();
            let fresh = Box::into_raw(fresh) as *mut CachePadded<SpinLock>;
            if self.segments[seg]
                .compare_exchange(
                    ptr::null_mut(),
                    fresh,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
            {
                unsafe { Self::free_segment(fresh) };
            }
        }
        self.allocated
            .fetch_max(segments_needed << LOCK_SEGMENT_POWER, Ordering::AcqRel);
    }

    #[inline]
    pub(crate) fn at(&self, ind: usize) -> &SpinLock {
        debug_assert!(ind < self.size());
        let seg = self.segments[ind >> LOCK_SEGMENT_POWER].load(Ordering::Acquire);
        debug_assert!(!seg.is_null());
        unsafe { &*seg.add(ind & (SEGMENT_SIZE - 1)) }
    }

    unsafe fn free_segment(seg: *mut CachePadded<SpinLock>) {
        drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
            seg,
            SEGMENT_SIZE,
        )));
    }
}

impl Drop for LockArray {
    fn drop(&mut self) {
        for seg in self.segments.iter() {
            let ptr = seg.load(Ordering::Acquire);
            if !ptr.is_null() {
                unsafe { Self::free_segment(ptr) };
            }
        }
    }
}

/// Compile-time switch between real locking and no-op locking. The
/// exclusive [`LockedTable`](crate::LockedTable) view re-runs the ordinary
/// code paths with [`NoLocking`], which compiles the lock traffic away
/// while keeping the bucket logic identical.
pub(crate) trait LockMode {
    const ACTIVE: bool;
}

pub(crate) enum Locking {}
pub(crate) enum NoLocking {}

impl LockMode for Locking {
    const ACTIVE: bool = true;
}

impl LockMode for NoLocking {
    const ACTIVE: bool = false;
}

/// Scoped holder of a single bucket's stripe.
pub(crate) struct OneBucket<'a, M: LockMode> {
    locks: Option<&'a LockArray>,
    i: usize,
    _mode: PhantomData<M>,
}

impl<'a, M: LockMode> OneBucket<'a, M> {
    pub(crate) fn new(locks: &'a LockArray, i: usize) -> Self {
        OneBucket {
            locks: Some(locks),
            i,
            _mode: PhantomData,
        }
    }

    /// A guard that covers nothing, for the third lock of a final hop that
    /// shares a stripe with the first two.
    pub(crate) fn inactive() -> Self {
        OneBucket {
            locks: None,
            i: 0,
            _mode: PhantomData,
        }
    }
}

impl<'a, M: LockMode> Drop for OneBucket<'a, M> {
    fn drop(&mut self) {
        if let Some(locks) = self.locks.take() {
            if M::ACTIVE {
                locks.at(lock_ind(self.i)).unlock();
            }
        }
    }
}

/// Scoped holder of the two stripes of an operation's candidate buckets.
/// Movable, so the final hop of a cuckoo path move can hand both stripes
/// back to the insert path still locked.
pub(crate) struct TwoBuckets<'a, M: LockMode> {
    locks: Option<&'a LockArray>,
    i1: usize,
    i2: usize,
    _mode: PhantomData<M>,
}

impl<'a, M: LockMode> TwoBuckets<'a, M> {
    pub(crate) fn new(locks: &'a LockArray, i1: usize, i2: usize) -> Self {
        TwoBuckets {
            locks: Some(locks),
            i1,
            i2,
            _mode: PhantomData,
        }
    }

    #[inline]
    pub(crate) fn first(&self) -> usize {
        self.i1
    }

    #[inline]
    pub(crate) fn second(&self) -> usize {
        self.i2
    }

    pub(crate) fn is_active(&self) -> bool {
        self.locks.is_some()
    }

    pub(crate) fn unlock(&mut self) {
        if let Some(locks) = self.locks.take() {
            if M::ACTIVE {
                let l1 = lock_ind(self.i1);
                let l2 = lock_ind(self.i2);
                locks.at(l1).unlock();
                if l2 != l1 {
                    locks.at(l2).unlock();
                }
            }
        }
    }
}

impl<'a, M: LockMode> Drop for TwoBuckets<'a, M> {
    fn drop(&mut self) {
        self.unlock();
    }
}

/// Scoped holder of every allocated stripe, plus (for the public lock-all
/// entry points) the resize mutex that serializes all-stripe holders.
///
/// Unlocks `0..size()` as of drop time: a resize performed while the guard
/// is held (only possible from the exclusive locked view) locks any stripes
/// it allocates, and those are released here along with the rest.
pub(crate) struct AllBuckets<'a, M: LockMode> {
    locks: Option<&'a LockArray>,
    _resize: Option<MutexGuard<'a, ()>>,
    _mode: PhantomData<M>,
}

impl<'a, M: LockMode> AllBuckets<'a, M> {
    pub(crate) fn new(locks: &'a LockArray, resize: Option<MutexGuard<'a, ()>>) -> Self {
        AllBuckets {
            locks: Some(locks),
            _resize: resize,
            _mode: PhantomData,
        }
    }

    /// Disarms the stripe unlock (the caller has already released them by
    /// hand); the resize mutex, if held, is still released on drop.
    pub(crate) fn release(&mut self) {
        self.locks = None;
    }
}

impl<'a, M: LockMode> Drop for AllBuckets<'a, M> {
    fn drop(&mut self) {
        if let Some(locks) = self.locks.take() {
            if M::ACTIVE {
                for i in 0..locks.size() {
                    locks.at(i).unlock();
                }
            }
        }
    }
}
