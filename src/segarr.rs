//! A lock-free segmented dynamic array.
//!
//! Storage grows in geometric segments that are published with a CAS and
//! never move, so a reader that obtained a slot reference keeps it for the
//! array's lifetime. This is what lets the bucket directory grow without
//! copying: doubling the table is a counter CAS elsewhere, and the new
//! buckets' slots materialize here on first touch.

use crate::OutOfMemory;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

/// Number of slots in segment 0. Must be a power of two.
const SEGMENT_BASE: usize = 256;

/// Segment `i` holds `SEGMENT_BASE << i` slots, so this many segments cover
/// every 32-bit index.
const SEGMENTS: usize = 25;

/// Marker for element types whose all-zero byte pattern is a valid value.
/// Segments come from `alloc_zeroed` and are exposed without further
/// initialization.
pub(crate) unsafe trait ZeroInit {}

// zero is the null address / empty slot
unsafe impl ZeroInit for AtomicUsize {}

/// Lock-free append-only array of `T` indexed by a 32-bit integer.
pub(crate) struct SegArray<T> {
    segments: [AtomicPtr<T>; SEGMENTS],
}

/// Maps an index to its segment and the offset inside that segment.
/// Segment `i` starts at index `SEGMENT_BASE * (2^i - 1)`.
#[inline]
fn split(index: usize) -> (usize, usize) {
    let u = index / SEGMENT_BASE + 1;
    let seg = (usize::BITS - 1 - u.leading_zeros()) as usize;
    (seg, index - SEGMENT_BASE * ((1 << seg) - 1))
}

impl<T: ZeroInit> SegArray<T> {
    pub(crate) fn new() -> Self {
        Self {
            segments: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
        }
    }

    fn segment_layout(seg: usize) -> Result<Layout, OutOfMemory> {
        Layout::array::<T>(SEGMENT_BASE << seg).map_err(|_| OutOfMemory)
    }

    /// Returns the slot at `index` if its segment has been published.
    /// Wait-free: never blocks, never allocates.
    pub(crate) fn value(&self, index: usize) -> Option<&T> {
        let (seg, off) = split(index);
        let base = self.segments[seg].load(Ordering::Acquire);
        if base.is_null() {
            return None;
        }
        // safety: a published segment holds SEGMENT_BASE << seg elements,
        // all valid by the ZeroInit contract, and is never freed or moved
        // before the array itself is dropped.
        Some(unsafe { &*base.add(off) })
    }

    /// Returns the slot at `index`, publishing its segment first if needed.
    ///
    /// Publication is a null -> segment CAS on the root entry; a thread that
    /// loses the race frees its own segment and adopts the winner's.
    pub(crate) fn lvalue(&self, index: usize) -> Result<&T, OutOfMemory> {
        let (seg, off) = split(index);
        let root = &self.segments[seg];
        let mut base = root.load(Ordering::Acquire);
        if base.is_null() {
            let layout = Self::segment_layout(seg)?;
            // safety: the layout is non-zero sized.
            let fresh = unsafe { alloc_zeroed(layout) } as *mut T;
            if fresh.is_null() {
                return Err(OutOfMemory);
            }
            match root.compare_exchange(
                ptr::null_mut(),
                fresh,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => base = fresh,
                Err(winner) => {
                    // safety: `fresh` was never published, we still own it.
                    unsafe { dealloc(fresh as *mut u8, layout) };
                    base = winner;
                }
            }
        }
        // safety: as in `value`.
        Ok(unsafe { &*base.add(off) })
    }
}

impl<T> Drop for SegArray<T> {
    fn drop(&mut self) {
        // we have &mut self, so no reader can still hold a slot reference.
        // slot *contents* (e.g. pointers parked in the slots) are the
        // caller's to free before dropping the array.
        for (seg, root) in self.segments.iter_mut().enumerate() {
            let base = *root.get_mut();
            if base.is_null() {
                continue;
            }
            let layout = Layout::array::<T>(SEGMENT_BASE << seg)
                .expect("layout fit at allocation time");
            // safety: `base` was obtained from alloc_zeroed with this layout
            // and ownership is exclusive here.
            unsafe { dealloc(base as *mut u8, layout) };
        }
    }
}

impl<T> std::fmt::Debug for SegArray<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let published = self
            .segments
            .iter()
            .take_while(|s| !s.load(Ordering::Relaxed).is_null())
            .count();
        f.debug_struct("SegArray")
            .field("segments", &published)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;

    #[test]
    fn split_maps_segment_boundaries() {
        assert_eq!(split(0), (0, 0));
        assert_eq!(split(SEGMENT_BASE - 1), (0, SEGMENT_BASE - 1));
        assert_eq!(split(SEGMENT_BASE), (1, 0));
        assert_eq!(split(3 * SEGMENT_BASE - 1), (1, 2 * SEGMENT_BASE - 1));
        assert_eq!(split(3 * SEGMENT_BASE), (2, 0));
        assert_eq!(split(7 * SEGMENT_BASE), (3, 0));
        // the last covered index of each segment is contiguous with the
        // first of the next
        for seg in 0..8 {
            let first = SEGMENT_BASE * ((1 << seg) - 1);
            let last = SEGMENT_BASE * ((1 << (seg + 1)) - 1) - 1;
            assert_eq!(split(first), (seg, 0));
            assert_eq!(split(last), (seg, (SEGMENT_BASE << seg) - 1));
        }
    }

    #[test]
    fn full_u32_range_fits() {
        let (seg, _) = split(u32::MAX as usize);
        assert!(seg < SEGMENTS);
    }

    #[test]
    fn value_is_none_until_lvalue() {
        let arr = SegArray::<AtomicUsize>::new();
        assert!(arr.value(0).is_none());
        assert!(arr.value(12345).is_none());

        let slot = arr.lvalue(12345).unwrap();
        assert_eq!(slot.load(Ordering::Relaxed), 0);
        slot.store(7, Ordering::Relaxed);

        // same slot, and the neighboring segment is still unpublished
        assert_eq!(arr.value(12345).unwrap().load(Ordering::Relaxed), 7);
        assert!(arr.value(2 * SEGMENT_BASE * SEGMENT_BASE).is_none());
    }

    #[test]
    fn slots_are_zero_initialized() {
        let arr = SegArray::<AtomicUsize>::new();
        for i in (0..4096).step_by(17) {
            assert_eq!(arr.lvalue(i).unwrap().load(Ordering::Relaxed), 0);
        }
    }

    #[test]
    fn racing_lvalue_agrees_on_one_segment() {
        let arr = SegArray::<AtomicUsize>::new();
        let barrier = Barrier::new(4);
        let addrs: Vec<usize> = std::thread::scope(|s| {
            (0..4)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        arr.lvalue(SEGMENT_BASE + 3).unwrap() as *const AtomicUsize as usize
                    })
                })
                .collect::<Vec<_>>()
                .into_iter()
                .map(|h| h.join().unwrap())
                .collect()
        });
        assert!(addrs.windows(2).all(|w| w[0] == w[1]));
    }
}
