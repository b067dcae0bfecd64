//! The pinned lock-free allocator.
//!
//! Hands out fixed-size nodes and recycles retired ones only once a scan of
//! every published pin proves no thread can still reach them. Each thread
//! operates through a pin block: three hazard slots visible to everyone,
//! plus a private purgatory (retired, not yet proven unreachable) and stash
//! (proven unreachable, ready for reuse). Blocks live in a push-only
//! registry and are handed back to a pool on release, so short-lived threads
//! do not leak them.
//!
//! The safety of the whole crate rests on the pin-and-verify discipline: a
//! node address read from a shared location may be dereferenced only after
//! it was published in a pin slot *and* the shared location was re-read and
//! still held that address. A node that passed verification cannot be
//! recycled while the pin stands, because recycling requires a scan that
//! would have observed the pin.

use crate::node::Node;
use crate::OutOfMemory;
use std::cell::Cell;
use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

/// Pin slots per thread. The ordered-list walk needs exactly three live
/// references at once: successor, current, predecessor.
pub(crate) const PIN_SLOTS: usize = 3;

/// A freeing thread runs a reclamation scan once its purgatory holds this
/// many nodes per registered pin block. Scaling with the block count keeps
/// the per-scan amortized cost constant: a scan reads every published pin.
const PURGATORY_FACTOR: usize = 10;

/// Scan attempts a released `Pins` makes to drain its purgatory before
/// leaving the remainder in the block for its next owner.
const RELEASE_SCAN_ATTEMPTS: usize = 4;

/// Typed allocator with pin-based reclamation. One per table.
pub(crate) struct PinAlloc<T> {
    /// Push-only registry of every pin block ever created; scans traverse
    /// it in full. Blocks are freed only when the allocator is dropped.
    blocks: AtomicPtr<PinBlock<T>>,

    /// Registry length; drives the purgatory threshold.
    nblocks: AtomicUsize,
}

/// Per-thread pin state. Owned by at most one thread at a time (the `busy`
/// flag); every thread may read the `pins` slots at any time.
struct PinBlock<T> {
    /// Hazard slots holding node addresses, `0` when empty. Written only by
    /// the owner, with SeqCst stores so a subsequent verify-reload cannot be
    /// reordered ahead of the publication.
    pins: [AtomicUsize; PIN_SLOTS],

    /// Whether some thread currently owns this block.
    busy: AtomicBool,

    /// Registry link. Immutable once the block is published.
    next: *mut PinBlock<T>,

    /// Retired nodes awaiting proof of unreachability. Owner-private,
    /// linked through `Node::free`.
    purgatory: Cell<*mut Node<T>>,
    purgatory_len: Cell<usize>,

    /// Nodes proven unreachable, reusable without further checks.
    /// Owner-private, linked through `Node::free`.
    stash: Cell<*mut Node<T>>,
}

impl<T> PinBlock<T> {
    fn new() -> Self {
        Self {
            pins: [const { AtomicUsize::new(0) }; PIN_SLOTS],
            busy: AtomicBool::new(true),
            next: ptr::null_mut(),
            purgatory: Cell::new(ptr::null_mut()),
            purgatory_len: Cell::new(0),
            stash: Cell::new(ptr::null_mut()),
        }
    }
}

impl<T> PinAlloc<T> {
    pub(crate) fn new() -> Self {
        Self {
            blocks: AtomicPtr::new(ptr::null_mut()),
            nblocks: AtomicUsize::new(0),
        }
    }

    /// Claims a pin block for the calling thread, reusing a released one
    /// when possible.
    pub(crate) fn acquire(&self) -> Pins<'_, T> {
        let mut b = self.blocks.load(Ordering::Acquire);
        while !b.is_null() {
            // safety: registry blocks are never freed while `self` is alive.
            let blk = unsafe { &*b };
            if blk
                .busy
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return Pins {
                    alloc: self,
                    block: b,
                };
            }
            b = blk.next;
        }

        // no free block; push a fresh one
        let fresh = Box::into_raw(Box::new(PinBlock::new()));
        let mut head = self.blocks.load(Ordering::Relaxed);
        loop {
            // safety: `fresh` is unpublished, we still own it exclusively.
            unsafe { (*fresh).next = head };
            match self.blocks.compare_exchange_weak(
                head,
                fresh,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(cur) => head = cur,
            }
        }
        self.nblocks.fetch_add(1, Ordering::Relaxed);
        Pins {
            alloc: self,
            block: fresh,
        }
    }

    /// Collects every published pin, then partitions `block`'s purgatory:
    /// still-pinned nodes stay, the rest become reusable stash.
    ///
    /// Any node moved to the stash was provably unpinned by every pin
    /// published before the scan began; a thread racing to pin it through a
    /// stale shared pointer will fail its verify-reload before ever
    /// dereferencing.
    fn scan(&self, block: &PinBlock<T>) {
        let mut pinned =
            Vec::with_capacity(self.nblocks.load(Ordering::Relaxed) * PIN_SLOTS);
        let mut b = self.blocks.load(Ordering::Acquire);
        while !b.is_null() {
            // safety: registry blocks are never freed while `self` is alive.
            let blk = unsafe { &*b };
            for slot in &blk.pins {
                let addr = slot.load(Ordering::SeqCst);
                if addr != 0 {
                    pinned.push(addr);
                }
            }
            b = blk.next;
        }
        pinned.sort_unstable();

        let mut p = block.purgatory.replace(ptr::null_mut());
        let mut kept = ptr::null_mut();
        let mut kept_len = 0;
        while !p.is_null() {
            // safety: purgatory nodes are owned by `block`; only the
            // freelist links are touched here.
            let next = unsafe { (*p).free.get() };
            if pinned.binary_search(&(p as usize)).is_ok() {
                unsafe { (*p).free.set(kept) };
                kept = p;
                kept_len += 1;
            } else {
                unsafe { (*p).free.set(block.stash.get()) };
                block.stash.set(p);
            }
            p = next;
        }
        block.purgatory.set(kept);
        block.purgatory_len.set(kept_len);
    }
}

impl<T> Drop for PinAlloc<T> {
    fn drop(&mut self) {
        // &mut self: no thread holds a `Pins` or traverses the table, so
        // every purgatory and stash node is exclusively ours. Nodes still
        // linked in the table are the table's to free, not ours.
        let mut b = *self.blocks.get_mut();
        while !b.is_null() {
            // safety: blocks were created by Box::into_raw in `acquire`.
            let blk = unsafe { Box::from_raw(b) };
            for head in [blk.purgatory.get(), blk.stash.get()] {
                let mut p = head;
                while !p.is_null() {
                    // safety: freelist nodes are unreachable from the table
                    // and unpinned, hence exclusively owned here.
                    unsafe {
                        let next = (*p).free.get();
                        Node::dealloc(p);
                        p = next;
                    }
                }
            }
            b = blk.next;
        }
    }
}

impl<T> fmt::Debug for PinAlloc<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinAlloc")
            .field("blocks", &self.nblocks.load(Ordering::Relaxed))
            .finish()
    }
}

/// A thread's claim on three pin slots, plus its private node freelists.
///
/// Obtained from [`LfHash::pin`](crate::LfHash::pin) and passed to every
/// table operation. Dropping it clears the pin slots, makes a bounded
/// attempt to recycle retired nodes, and returns the block to the table's
/// pool for the next thread.
pub struct Pins<'a, T> {
    alloc: &'a PinAlloc<T>,
    block: *mut PinBlock<T>,
}

impl<'a, T> Pins<'a, T> {
    #[inline]
    fn block(&self) -> &PinBlock<T> {
        // safety: `block` was claimed from `alloc`'s registry, whose blocks
        // outlive `alloc`, which outlives `'a`.
        unsafe { &*self.block }
    }

    /// Whether this handle came from `alloc`. Guards against crossing pins
    /// between tables, which would break reclamation.
    pub(crate) fn belongs_to(&self, alloc: &PinAlloc<T>) -> bool {
        ptr::eq(self.alloc, alloc)
    }

    /// Publishes `node` in pin slot `slot`. Until the slot is overwritten or
    /// cleared, no scan will recycle `node`.
    #[inline]
    pub(crate) fn pin(&self, slot: usize, node: *mut Node<T>) {
        self.block().pins[slot].store(node as usize, Ordering::SeqCst);
    }

    /// Clears pin slot `slot`.
    #[inline]
    pub(crate) fn unpin(&self, slot: usize) {
        self.block().pins[slot].store(0, Ordering::SeqCst);
    }

    /// Borrows the slot that backs returned records (slot 2); the reference
    /// is what keeps a [`RecordRef`](crate::RecordRef) able to release it.
    #[inline]
    pub(crate) fn result_slot(&self) -> &'a AtomicUsize {
        // safety: as in `block`; the slot lives as long as the allocator.
        unsafe { &(*self.block).pins[2] }
    }

    /// Hands out node storage with a freshly written header: stash first,
    /// then the global allocator.
    pub(crate) fn alloc(&self, sort_key: u32) -> Result<*mut Node<T>, OutOfMemory> {
        let block = self.block();
        let head = block.stash.get();
        if !head.is_null() {
            // safety: stash nodes are owned by this block; no pin references
            // them (that is what admitted them to the stash).
            unsafe {
                block.stash.set((*head).free.get());
                Node::write_header(head, sort_key);
            }
            return Ok(head);
        }
        let p = Node::<T>::alloc(sort_key);
        if p.is_null() {
            Err(OutOfMemory)
        } else {
            Ok(p)
        }
    }

    /// Retires `node` into this thread's purgatory. The caller must have
    /// unlinked it from every shared structure first; pins other threads
    /// already hold on it are fine and are exactly what the scan checks.
    pub(crate) fn free(&self, node: *mut Node<T>) {
        let block = self.block();
        // safety: after unlinking, the freelist link is ours to use; stale
        // readers only look at `link`, `sort_key` and the record.
        unsafe { (*node).free.set(block.purgatory.get()) };
        block.purgatory.set(node);
        block.purgatory_len.set(block.purgatory_len.get() + 1);

        if block.purgatory_len.get()
            >= self.alloc.nblocks.load(Ordering::Relaxed) * PURGATORY_FACTOR
        {
            self.alloc.scan(block);
        }
    }
}

impl<'a, T> Drop for Pins<'a, T> {
    fn drop(&mut self) {
        let block = self.block();
        for slot in &block.pins {
            slot.store(0, Ordering::SeqCst);
        }
        // best effort to hand nodes back before the block changes owners;
        // anything still pinned elsewhere is left for the next owner's
        // frees to retry.
        for _ in 0..RELEASE_SCAN_ATTEMPTS {
            if block.purgatory_len.get() == 0 {
                break;
            }
            self.alloc.scan(block);
            if block.purgatory_len.get() == 0 {
                break;
            }
            std::thread::yield_now();
        }
        block.busy.store(false, Ordering::Release);
    }
}

impl<'a, T> fmt::Debug for Pins<'a, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pins").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_nodes_come_from_the_global_allocator() {
        let alloc = PinAlloc::<u64>::new();
        let pins = alloc.acquire();
        let a = pins.alloc(3).unwrap();
        let b = pins.alloc(5).unwrap();
        assert_ne!(a, b);
        unsafe {
            assert_eq!((*a).sort_key, 3);
            assert_eq!((*b).sort_key, 5);
            Node::dealloc(a);
            Node::dealloc(b);
        }
    }

    #[test]
    fn unpinned_nodes_are_recycled_after_a_scan() {
        let alloc = PinAlloc::<u64>::new();
        let pins = alloc.acquire();
        let node = pins.alloc(1).unwrap();
        pins.free(node);

        alloc.scan(pins.block());
        let again = pins.alloc(7).unwrap();
        assert_eq!(node, again, "stash should hand back the retired node");
        unsafe { assert_eq!((*again).sort_key, 7) };
        pins.free(again);
    }

    #[test]
    fn pinned_nodes_stay_in_purgatory() {
        let alloc = PinAlloc::<u64>::new();
        let pins = alloc.acquire();
        let other = alloc.acquire();

        let node = pins.alloc(1).unwrap();
        other.pin(0, node);
        pins.free(node);

        alloc.scan(pins.block());
        let fresh = pins.alloc(2).unwrap();
        assert_ne!(node, fresh, "a pinned node must not be recycled");

        other.unpin(0);
        alloc.scan(pins.block());
        let recycled = pins.alloc(3).unwrap();
        assert_eq!(node, recycled);

        pins.free(fresh);
        pins.free(recycled);
    }

    #[test]
    fn frees_past_the_threshold_trigger_a_scan() {
        let alloc = PinAlloc::<u64>::new();
        let pins = alloc.acquire();
        let n = PURGATORY_FACTOR; // one registered block
        let nodes: Vec<_> = (0..n).map(|_| pins.alloc(1).unwrap()).collect();
        for &node in &nodes {
            pins.free(node);
        }
        assert_eq!(
            pins.block().purgatory_len.get(),
            0,
            "the threshold free should have scanned everything to the stash"
        );
        assert!(!pins.block().stash.get().is_null());
    }

    #[test]
    fn released_blocks_are_reused() {
        let alloc = PinAlloc::<u64>::new();
        let first = alloc.acquire();
        let addr = first.block;
        drop(first);

        let second = alloc.acquire();
        assert_eq!(addr, second.block);
        assert_eq!(alloc.nblocks.load(Ordering::Relaxed), 1);

        // a concurrently held block forces a second one
        let third = alloc.acquire();
        assert_ne!(second.block, third.block);
        assert_eq!(alloc.nblocks.load(Ordering::Relaxed), 2);
    }
}
