use crate::alloc::{PinAlloc, Pins};
use crate::node::{self, Node};
use crate::segarr::SegArray;
use crate::{DefaultHashBuilder, OutOfMemory};

use std::cmp::Ordering as KeyOrdering;
use std::error::Error;
use std::fmt::{self, Debug, Display, Formatter};
use std::hash::{BuildHasher, Hasher};
use std::hint::spin_loop;
use std::marker::PhantomData;
use std::ops::Deref;
use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// The load factor (elements per logical bucket) past which a successful
/// insert attempts to double the bucket count. Growth moves no data; it only
/// lets future walks start from a closer anchor.
const MAX_LOAD: f64 = 1.0;

/// The largest logical bucket count. Hashes are 31-bit, so going past this
/// stops paying off; it also keeps the doubling CAS clear of overflow.
const MAXIMUM_BUCKETS: u32 = 1 << 30;

/// Key hashes keep only the low 31 bits. The top bit is reserved.
const HASH_MASK: u32 = 0x7FFF_FFFF;

/// Pin slot assignment during a list walk. A returned record is re-pinned
/// into the predecessor slot, which the walk no longer needs.
const PIN_NEXT: usize = 0;
const PIN_CURR: usize = 1;
const PIN_PREV: usize = 2;

/// How a table finds the key bytes inside a record.
pub enum KeySpec<T> {
    /// The key is a fixed byte range of the record's in-memory
    /// representation. The range must lie within the record and must hold
    /// initialized bytes (no padding) in every record ever inserted.
    Inline {
        /// Byte offset of the key within the record.
        offset: usize,
        /// Key length in bytes.
        len: usize,
    },
    /// The key is whatever the callback returns. The callback must be a
    /// pure function of the record.
    Extract(fn(&T) -> &[u8]),
}

impl<T> KeySpec<T> {
    /// Borrows the key bytes out of `record`.
    #[inline]
    fn key_of<'r>(&self, record: &'r T) -> &'r [u8] {
        match *self {
            KeySpec::Inline { offset, len } => {
                // in-range per the constructor check; initialized bytes are
                // the caller's obligation, documented on the variant
                unsafe {
                    std::slice::from_raw_parts(
                        (record as *const T as *const u8).add(offset),
                        len,
                    )
                }
            }
            KeySpec::Extract(f) => f(record),
        }
    }
}

impl<T> Clone for KeySpec<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for KeySpec<T> {}

impl<T> Debug for KeySpec<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match *self {
            KeySpec::Inline { offset, len } => f
                .debug_struct("Inline")
                .field("offset", &offset)
                .field("len", &len)
                .finish(),
            KeySpec::Extract(_) => f.write_str("Extract(_)"),
        }
    }
}

/// The error type for [`LfHash::insert`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InsertError {
    /// The table holds unique keys and an equal key is already present.
    Duplicate,
    /// Node or directory allocation failed; nothing was inserted.
    OutOfMemory,
}

impl Display for InsertError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match *self {
            InsertError::Duplicate => f.write_str("an equal key is already present"),
            InsertError::OutOfMemory => Display::fmt(&OutOfMemory, f),
        }
    }
}

impl Error for InsertError {}

impl From<OutOfMemory> for InsertError {
    fn from(_: OutOfMemory) -> Self {
        InsertError::OutOfMemory
    }
}

/// Default key comparator: lexicographic byte order, shorter key first on a
/// shared prefix.
fn byte_cmp(a: &[u8], b: &[u8]) -> KeyOrdering {
    a.cmp(b)
}

/// A lock-free extensible hash table mapping byte keys to fixed-size
/// records.
///
/// All entries live on one lock-free linked list ordered by the bit-reversed
/// hash of their key (*split order*). The bucket directory holds permanent
/// dummy nodes that anchor each bucket's slice of the list; doubling the
/// bucket count is a single CAS and moves nothing. Inserts, removals and
/// lookups are lock-free; readers are protected by the pin (hazard pointer)
/// scheme described in the [crate documentation](crate).
///
/// Every operation takes a [`Pins`] handle from [`LfHash::pin`]. Handles are
/// tied to the table they came from; using one with another table panics.
pub struct LfHash<T, S = DefaultHashBuilder> {
    /// Bucket directory. Slot `b` holds the address of bucket `b`'s dummy
    /// anchor, or 0 while the bucket is uninitialized. Slot 0 doubles as
    /// the head of the list.
    array: SegArray<AtomicUsize>,

    /// Node storage and pin-based reclamation.
    alloc: PinAlloc<T>,

    /// Logical bucket count `N`. Always a power of two; only ever doubled.
    size: AtomicU32,

    /// Element count `C` (dummies excluded).
    count: AtomicUsize,

    key: KeySpec<T>,
    cmp: fn(&[u8], &[u8]) -> KeyOrdering,
    unique: bool,
    build_hasher: S,

    /// Nodes store `T` behind raw pointers, invisible to auto traits.
    _marker: PhantomData<Box<Node<T>>>,
}

/// A cursor produced by a list walk: `prev` is the link word (or directory
/// slot) that pointed at `curr`, `next` is `curr`'s successor. The walk
/// leaves all three pinned.
struct Cursor<T> {
    prev: *const AtomicUsize,
    curr: *mut Node<T>,
    next: *mut Node<T>,
}

impl<T: Copy> LfHash<T, DefaultHashBuilder> {
    /// Creates an empty table with unique keys.
    ///
    /// The table starts with one logical bucket and grows by doubling as
    /// elements arrive.
    ///
    /// # Examples
    ///
    /// ```
    /// use lfhash::{KeySpec, LfHash};
    ///
    /// let table: LfHash<[u8; 16]> = LfHash::new(KeySpec::Inline { offset: 0, len: 4 });
    /// assert!(table.is_empty());
    /// ```
    pub fn new(key: KeySpec<T>) -> Self {
        Self::with_hasher(key, DefaultHashBuilder::default())
    }

    /// Creates an empty table that allows duplicate keys.
    ///
    /// A new record with an already-present key is placed *before* the
    /// existing equal-keyed records, so the latest duplicate is the one
    /// lookups return.
    pub fn multi(key: KeySpec<T>) -> Self {
        Self::multi_with_hasher(key, DefaultHashBuilder::default())
    }
}

impl<T: Copy, S: BuildHasher> LfHash<T, S> {
    /// Creates an empty unique-key table which hashes keys with
    /// `hash_builder`.
    ///
    /// Key bytes are fed to the hasher with a single `write`.
    pub fn with_hasher(key: KeySpec<T>, hash_builder: S) -> Self {
        Self::with_flags(key, true, hash_builder)
    }

    /// Creates an empty duplicate-friendly table which hashes keys with
    /// `hash_builder`. See [`LfHash::multi`].
    pub fn multi_with_hasher(key: KeySpec<T>, hash_builder: S) -> Self {
        Self::with_flags(key, false, hash_builder)
    }

    fn with_flags(key: KeySpec<T>, unique: bool, hash_builder: S) -> Self {
        if let KeySpec::Inline { offset, len } = key {
            assert!(
                offset.checked_add(len).map_or(false, |end| end <= std::mem::size_of::<T>()),
                "inline key range {}..{} does not fit the record",
                offset,
                offset.wrapping_add(len),
            );
        }
        Self {
            array: SegArray::new(),
            alloc: PinAlloc::new(),
            size: AtomicU32::new(1),
            count: AtomicUsize::new(0),
            key,
            cmp: byte_cmp,
            unique,
            build_hasher: hash_builder,
            _marker: PhantomData,
        }
    }

    /// Replaces the key comparator, consuming and returning the table.
    ///
    /// The comparator must be a total order consistent with equality of the
    /// key bytes, and keys it considers equal must hash equal under the
    /// table's hasher. Must be called before the first insert.
    ///
    /// # Panics
    ///
    /// Panics if the table already holds elements.
    pub fn comparator(mut self, cmp: fn(&[u8], &[u8]) -> KeyOrdering) -> Self {
        assert!(self.is_empty(), "comparator changed on a non-empty table");
        self.cmp = cmp;
        self
    }

    /// Acquires a pin handle for the calling thread.
    ///
    /// Reuses a previously released pin block when one is free, so the cost
    /// after warm-up is one CAS.
    pub fn pin(&self) -> Pins<'_, T> {
        self.alloc.acquire()
    }

    /// 31-bit key hash; the top bit is reserved.
    fn hash_key(&self, key: &[u8]) -> u32 {
        let mut h = self.build_hasher.build_hasher();
        h.write(key);
        (h.finish() as u32) & HASH_MASK
    }

    /// Key bytes of a published node; dummies have the empty key.
    ///
    /// # Safety
    ///
    /// The node must be pinned by the calling thread (or exclusively owned).
    unsafe fn node_key<'n>(&self, n: &'n Node<T>) -> &'n [u8] {
        if n.is_dummy() {
            &[]
        } else {
            // safety: real nodes have their record written before
            // publication, and it stays intact until recycled.
            self.key.key_of(unsafe { n.record() })
        }
    }

    /// Returns the directory slot anchoring `hashnr`'s bucket, lazily
    /// threading the bucket's dummy into the list first if needed. The slot
    /// doubles as the head pointer the walks start from.
    fn bucket_head(&self, hashnr: u32, pins: &Pins<'_, T>) -> Result<&AtomicUsize, OutOfMemory> {
        let bucket = hashnr % self.size.load(Ordering::SeqCst);
        let slot = self.array.lvalue(bucket as usize)?;
        if slot.load(Ordering::SeqCst) == 0 {
            self.init_bucket(slot, bucket, pins)?;
        }
        Ok(slot)
    }

    /// Initializes bucket `bucket`: ensures the parent bucket exists, links
    /// a fresh dummy at the right split-order position (adopting a racing
    /// winner's dummy if beaten), and publishes it in `slot`.
    ///
    /// The parent index clears the highest set bit, so recursion strictly
    /// descends and bottoms out at bucket 0. Depth is bounded by log2(N).
    fn init_bucket(
        &self,
        slot: &AtomicUsize,
        bucket: u32,
        pins: &Pins<'_, T>,
    ) -> Result<(), OutOfMemory> {
        let parent = if bucket == 0 {
            0
        } else {
            bucket & !(1u32 << (31 - bucket.leading_zeros()))
        };
        let parent_slot = self.array.lvalue(parent as usize)?;
        if bucket != 0 && parent_slot.load(Ordering::SeqCst) == 0 {
            self.init_bucket(parent_slot, parent, pins)?;
        }

        // dummies come straight from the global allocator, not the pinned
        // one: they are never reclaimed before the table itself dies
        let mut dummy = Node::<T>::alloc(bucket.reverse_bits());
        if dummy.is_null() {
            return Err(OutOfMemory);
        }
        debug_assert!(unsafe { (*dummy).is_dummy() });

        if let Some(existing) = self.link(parent_slot, dummy, true, pins) {
            // safety: our dummy was never published; we still own it.
            unsafe { Node::dealloc(dummy) };
            dummy = existing;
        }

        // a racing initializer can only have published the same adopted
        // dummy, so losing this CAS is fine; the dummy is never freed here
        let _ = slot.compare_exchange(
            0,
            dummy as usize,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        Ok(())
    }

    /// The ordered-list walk. Positions a cursor at the first node whose
    /// `(sort_key, key)` is greater than or equal to the target, unlinking
    /// any marked node it passes on behalf of whoever marked it. Returns
    /// whether an equal node was found.
    ///
    /// On return all three pin slots are set (`next`, `curr`, `prev` in
    /// slots 0, 1, 2) so the caller can act on the cursor atomically.
    ///
    /// Every shared pointer is pinned and then verified by re-reading its
    /// source; a mismatch restarts the walk. This is what makes it safe to
    /// dereference nodes that may be concurrently retired.
    fn locate(
        &self,
        head: &AtomicUsize,
        sort_key: u32,
        key: &[u8],
        pins: &Pins<'_, T>,
    ) -> (bool, Cursor<T>) {
        'retry: loop {
            let mut prev: *const AtomicUsize = head;
            let mut curr;
            loop {
                // safety: `prev` is the head slot here, owned by the live
                // directory.
                curr = unsafe { (*prev).load(Ordering::SeqCst) } as *mut Node<T>;
                pins.pin(PIN_CURR, curr);
                if unsafe { (*prev).load(Ordering::SeqCst) } == curr as usize {
                    break;
                }
                spin_loop();
            }
            loop {
                if curr.is_null() {
                    return (false, Cursor { prev, curr, next: ptr::null_mut() });
                }
                let mut link;
                loop {
                    // safety: `curr` is pinned and was verified against
                    // `*prev` (or will be below before we act on it); its
                    // memory cannot have been recycled.
                    link = unsafe { (*curr).link.load(Ordering::SeqCst) };
                    pins.pin(PIN_NEXT, node::untag::<T>(link));
                    if unsafe { (*curr).link.load(Ordering::SeqCst) } == link {
                        break;
                    }
                    spin_loop();
                }
                let next = node::untag::<T>(link);
                // safety: as above; sort_key is immutable after publication.
                let cur_sort = unsafe { (*curr).sort_key };
                // safety: `prev` is either the head slot or the link word of
                // a node pinned in slot 2; neither can have been recycled.
                if unsafe { (*prev).load(Ordering::SeqCst) } != curr as usize {
                    spin_loop();
                    continue 'retry;
                }
                if !node::tagged(link) {
                    if cur_sort >= sort_key {
                        let r = if cur_sort > sort_key {
                            KeyOrdering::Greater
                        } else {
                            // safety: `curr` is pinned and verified.
                            (self.cmp)(unsafe { self.node_key(&*curr) }, key)
                        };
                        match r {
                            KeyOrdering::Less => {}
                            KeyOrdering::Equal => return (true, Cursor { prev, curr, next }),
                            KeyOrdering::Greater => {
                                return (false, Cursor { prev, curr, next })
                            }
                        }
                    }
                    // advance; `curr` becomes the predecessor and moves to
                    // pin slot 2
                    prev = unsafe { ptr::addr_of!((*curr).link) };
                    pins.pin(PIN_PREV, curr);
                } else {
                    // `curr` is marked: finish the removal for whoever
                    // marked it, then retry from the top on contention
                    if unsafe { &*prev }
                        .compare_exchange(
                            curr as usize,
                            next as usize,
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        )
                        .is_ok()
                    {
                        pins.free(curr);
                    } else {
                        spin_loop();
                        continue 'retry;
                    }
                }
                curr = next;
                pins.pin(PIN_CURR, curr);
            }
        }
    }

    /// Links `node` into the list at its split-order position, walking from
    /// `head`. With `unique`, an existing equal node aborts the insert and
    /// is returned; ownership of `node` stays with the caller. Without it,
    /// `node` is placed before any equal-keyed nodes.
    ///
    /// Clears all pins before returning.
    fn link(
        &self,
        head: &AtomicUsize,
        node: *mut Node<T>,
        unique: bool,
        pins: &Pins<'_, T>,
    ) -> Option<*mut Node<T>> {
        // safety: `node` is ours until the CAS publishes it; sort_key and
        // record are already written.
        let sort_key = unsafe { (*node).sort_key };
        let key: &[u8] = unsafe { self.node_key(&*node) };
        let existing = loop {
            let (found, cursor) = self.locate(head, sort_key, key, pins);
            if found && unique {
                break Some(cursor.curr);
            }
            debug_assert!(cursor.curr != node);
            unsafe { (*node).link.store(cursor.curr as usize, Ordering::SeqCst) };
            // safety: `cursor.prev` is protected as described in `locate`.
            if unsafe { &*cursor.prev }
                .compare_exchange(
                    cursor.curr as usize,
                    node as usize,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                break None;
            }
            spin_loop();
        };
        pins.unpin(PIN_NEXT);
        pins.unpin(PIN_CURR);
        pins.unpin(PIN_PREV);
        existing
    }

    /// Inserts a copy of `record`, keyed by its own key bytes.
    ///
    /// In unique mode an equal key fails with [`InsertError::Duplicate`] and
    /// leaves the present record in place. Lock-free; failed CAS attempts
    /// retry internally.
    ///
    /// # Examples
    ///
    /// ```
    /// use lfhash::{InsertError, KeySpec, LfHash};
    ///
    /// fn key(r: &(u32, [u8; 4])) -> &[u8] {
    ///     &r.1
    /// }
    ///
    /// let table = LfHash::new(KeySpec::Extract(key));
    /// let mut pins = table.pin();
    ///
    /// assert_eq!(table.insert(&mut pins, (1, *b"carl")), Ok(()));
    /// assert_eq!(
    ///     table.insert(&mut pins, (2, *b"carl")),
    ///     Err(InsertError::Duplicate)
    /// );
    /// assert_eq!(table.len(), 1);
    /// ```
    pub fn insert(&self, pins: &mut Pins<'_, T>, record: T) -> Result<(), InsertError> {
        self.check_pins(pins);
        let hashnr = self.hash_key(self.key.key_of(&record));
        let node = pins
            .alloc(hashnr.reverse_bits() | 1)
            .map_err(InsertError::from)?;
        // safety: `node` is unpublished storage we own.
        unsafe { Node::write_record(node, record) };

        let head = match self.bucket_head(hashnr, pins) {
            Ok(head) => head,
            Err(oom) => {
                pins.free(node);
                return Err(oom.into());
            }
        };
        if self.link(head, node, self.unique, pins).is_some() {
            // never published; parking it in purgatory is still the
            // cheapest way to give it back
            pins.free(node);
            return Err(InsertError::Duplicate);
        }

        let csize = self.size.load(Ordering::SeqCst);
        let filled = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        if (filled as f64) / (csize as f64) > MAX_LOAD && csize < MAXIMUM_BUCKETS {
            // one doubling per crossing is plenty; a lost race means some
            // other thread already grew the table
            let _ = self.size.compare_exchange(
                csize,
                csize * 2,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
        }
        Ok(())
    }

    /// Removes the record with the given key (in duplicate mode: the first
    /// of them). Returns whether a record was removed.
    ///
    /// # Examples
    ///
    /// ```
    /// use lfhash::{KeySpec, LfHash};
    ///
    /// fn key(r: &(u32, [u8; 4])) -> &[u8] {
    ///     &r.1
    /// }
    ///
    /// let table = LfHash::new(KeySpec::Extract(key));
    /// let mut pins = table.pin();
    ///
    /// table.insert(&mut pins, (1, *b"carl")).unwrap();
    /// assert_eq!(table.remove(&mut pins, b"carl"), Ok(true));
    /// assert_eq!(table.remove(&mut pins, b"carl"), Ok(false));
    /// ```
    pub fn remove(&self, pins: &mut Pins<'_, T>, key: &[u8]) -> Result<bool, OutOfMemory> {
        self.check_pins(pins);
        let hashnr = self.hash_key(key);
        let head = self.bucket_head(hashnr, pins)?;
        let sort_key = hashnr.reverse_bits() | 1;

        let removed = loop {
            let (found, cursor) = self.locate(head, sort_key, key, pins);
            if !found {
                break false;
            }
            // mark first: a marked node is logically gone even while linked
            // safety: `cursor.curr` is pinned and verified by `locate`.
            if unsafe { &(*cursor.curr).link }
                .compare_exchange(
                    cursor.next as usize,
                    cursor.next as usize | node::DELETED,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                // we own the removal now; unlink it or, if someone moved
                // `prev` under us, re-walk so the marked node gets helped
                // out before we report success
                if unsafe { &*cursor.prev }
                    .compare_exchange(
                        cursor.curr as usize,
                        cursor.next as usize,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .is_ok()
                {
                    pins.free(cursor.curr);
                } else {
                    let _ = self.locate(head, sort_key, key, pins);
                }
                break true;
            }
            spin_loop();
        };
        pins.unpin(PIN_NEXT);
        pins.unpin(PIN_CURR);
        pins.unpin(PIN_PREV);

        if removed {
            self.count.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(removed)
    }

    /// Looks up the record with the given key.
    ///
    /// The returned [`RecordRef`] keeps the record pinned; drop it to let
    /// the table recycle the node. While it is alive the borrow checker
    /// blocks further operations through the same `Pins`.
    ///
    /// # Examples
    ///
    /// ```
    /// use lfhash::{KeySpec, LfHash};
    ///
    /// fn key(r: &(u32, [u8; 4])) -> &[u8] {
    ///     &r.1
    /// }
    ///
    /// let table = LfHash::new(KeySpec::Extract(key));
    /// let mut pins = table.pin();
    /// table.insert(&mut pins, (7, *b"carl")).unwrap();
    ///
    /// let found = table.get(&mut pins, b"carl").unwrap();
    /// assert_eq!(found.as_deref().map(|r| r.0), Some(7));
    /// ```
    pub fn get<'p>(
        &self,
        pins: &'p mut Pins<'_, T>,
        key: &[u8],
    ) -> Result<Option<RecordRef<'p, T>>, OutOfMemory> {
        self.check_pins(pins);
        let hashnr = self.hash_key(key);
        let head = self.bucket_head(hashnr, pins)?;
        let (found, cursor) = self.locate(head, hashnr.reverse_bits() | 1, key, pins);
        Ok(self.take_result(found, cursor, pins))
    }

    /// Returns a record satisfying `pred`, sampled with a bias no worse
    /// than the split-order layout allows: the walk starts at the bucket
    /// prefix chosen by `rand` and wraps to the head of the list for
    /// whatever that pass skipped.
    ///
    /// The predicate may be called on records that a concurrent thread is
    /// deleting; it must depend only on record contents.
    ///
    /// # Examples
    ///
    /// ```
    /// use lfhash::{KeySpec, LfHash};
    ///
    /// fn key(r: &(u32, [u8; 4])) -> &[u8] {
    ///     &r.1
    /// }
    ///
    /// let table = LfHash::new(KeySpec::Extract(key));
    /// let mut pins = table.pin();
    /// table.insert(&mut pins, (1, *b"odd!")).unwrap();
    /// table.insert(&mut pins, (2, *b"even")).unwrap();
    ///
    /// let hit = table
    ///     .random_match(&mut pins, |r| r.0 % 2 == 0, 0x5eed)
    ///     .unwrap();
    /// assert_eq!(hit.as_deref().map(|r| r.0), Some(2));
    /// ```
    pub fn random_match<'p, P>(
        &self,
        pins: &'p mut Pins<'_, T>,
        pred: P,
        rand: u32,
    ) -> Result<Option<RecordRef<'p, T>>, OutOfMemory>
    where
        P: Fn(&T) -> bool,
    {
        self.check_pins(pins);
        let hashnr = rand & HASH_MASK;
        let rev = hashnr.reverse_bits();
        let head = self.bucket_head(hashnr, pins)?;
        let (mut found, mut cursor) = self.scan_match(head, rev | 1, u32::MAX, &pred, pins);

        if !found && hashnr != 0 {
            // nothing from the random start to the tail; wrap around and
            // cover the head of the list, stopping where the first pass
            // began
            pins.unpin(PIN_NEXT);
            pins.unpin(PIN_CURR);
            pins.unpin(PIN_PREV);
            let head = self.bucket_head(0, pins)?;
            let (f, c) = self.scan_match(head, 1, rev, &pred, pins);
            found = f;
            cursor = c;
        }
        Ok(self.take_result(found, cursor, pins))
    }

    /// Like `locate`, but positions on the first live real node in
    /// `[first_sort, last_sort]` whose record satisfies the predicate,
    /// helping marked nodes out along the way.
    fn scan_match<P: Fn(&T) -> bool>(
        &self,
        head: &AtomicUsize,
        first_sort: u32,
        last_sort: u32,
        pred: &P,
        pins: &Pins<'_, T>,
    ) -> (bool, Cursor<T>) {
        'retry: loop {
            let mut prev: *const AtomicUsize = head;
            let mut curr;
            loop {
                // safety: as in `locate`.
                curr = unsafe { (*prev).load(Ordering::SeqCst) } as *mut Node<T>;
                pins.pin(PIN_CURR, curr);
                if unsafe { (*prev).load(Ordering::SeqCst) } == curr as usize {
                    break;
                }
                spin_loop();
            }
            loop {
                if curr.is_null() {
                    return (false, Cursor { prev, curr, next: ptr::null_mut() });
                }
                let mut link;
                loop {
                    // safety: as in `locate`.
                    link = unsafe { (*curr).link.load(Ordering::SeqCst) };
                    pins.pin(PIN_NEXT, node::untag::<T>(link));
                    if unsafe { (*curr).link.load(Ordering::SeqCst) } == link {
                        break;
                    }
                    spin_loop();
                }
                let next = node::untag::<T>(link);
                let cur_sort = unsafe { (*curr).sort_key };
                if unsafe { (*prev).load(Ordering::SeqCst) } != curr as usize {
                    spin_loop();
                    continue 'retry;
                }
                if !node::tagged(link) {
                    if cur_sort >= first_sort {
                        if cur_sort > last_sort {
                            return (false, Cursor { prev, curr, next });
                        }
                        // dummies carry no record and never match
                        // safety: `curr` is pinned and verified; real nodes
                        // have initialized records.
                        if cur_sort & 1 == 1 && pred(unsafe { (*curr).record() }) {
                            return (true, Cursor { prev, curr, next });
                        }
                    }
                    prev = unsafe { ptr::addr_of!((*curr).link) };
                    pins.pin(PIN_PREV, curr);
                } else {
                    if unsafe { &*prev }
                        .compare_exchange(
                            curr as usize,
                            next as usize,
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        )
                        .is_ok()
                    {
                        pins.free(curr);
                    } else {
                        spin_loop();
                        continue 'retry;
                    }
                }
                curr = next;
                pins.pin(PIN_CURR, curr);
            }
        }
    }

    /// Converts a walk result into the public form: the found node moves to
    /// pin slot 2 (which backs the returned reference), everything else is
    /// unpinned.
    fn take_result<'p>(
        &self,
        found: bool,
        cursor: Cursor<T>,
        pins: &'p mut Pins<'_, T>,
    ) -> Option<RecordRef<'p, T>> {
        let result = if found {
            pins.pin(PIN_PREV, cursor.curr);
            Some(RecordRef {
                node: cursor.curr,
                slot: pins.result_slot(),
                _marker: PhantomData,
            })
        } else {
            pins.unpin(PIN_PREV);
            None
        };
        pins.unpin(PIN_NEXT);
        pins.unpin(PIN_CURR);
        result
    }

    /// Number of records in the table.
    pub fn len(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Whether the table holds no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current logical bucket count. Grows in powers of two as records
    /// arrive; never shrinks.
    pub fn buckets(&self) -> u32 {
        self.size.load(Ordering::SeqCst)
    }

    #[inline]
    fn check_pins(&self, pins: &Pins<'_, T>) {
        assert!(
            pins.belongs_to(&self.alloc),
            "pins were acquired from a different table"
        );
    }
}

impl<T, S> Drop for LfHash<T, S> {
    fn drop(&mut self) {
        // &mut self: no operation is in flight and no pins are held, so the
        // whole list is exclusively ours. Walk it from bucket 0's anchor,
        // freeing dummies and records alike; retired nodes live in the
        // allocator's freelists and are freed by its own Drop.
        let Some(slot) = self.array.value(0) else {
            return;
        };
        let mut p = node::untag::<T>(slot.load(Ordering::Relaxed));
        while !p.is_null() {
            // safety: we own every node reachable from the list; nothing
            // reachable here is also on a freelist (nodes are unlinked
            // before being retired).
            unsafe {
                let next = node::untag::<T>((*p).link.load(Ordering::Relaxed));
                Node::dealloc(p);
                p = next;
            }
        }
    }
}

impl<T, S> fmt::Debug for LfHash<T, S> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("LfHash")
            .field("len", &self.count.load(Ordering::Relaxed))
            .field("buckets", &self.size.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// A pinned reference to a record inside the table.
///
/// Obtained from [`LfHash::get`] and [`LfHash::random_match`]. Derefs to the
/// record; dropping it releases pin slot 2 so the node can eventually be
/// recycled. A concurrent removal may retire the node while this reference
/// is alive: the bytes stay valid and unchanged, but re-checking presence is
/// the caller's business.
pub struct RecordRef<'p, T> {
    node: *const Node<T>,
    slot: &'p AtomicUsize,
    _marker: PhantomData<&'p T>,
}

impl<'p, T> Deref for RecordRef<'p, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // safety: `node` is a real entry pinned in `slot`; the pin holds
        // off recycling until this reference is dropped.
        unsafe { (*self.node).record() }
    }
}

impl<'p, T> Drop for RecordRef<'p, T> {
    fn drop(&mut self) {
        self.slot.store(0, Ordering::SeqCst);
    }
}

impl<'p, T: Debug> Debug for RecordRef<'p, T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RecordRef").field(&**self).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    struct Rec {
        key: [u8; 8],
        val: u64,
    }

    fn rec_key(r: &Rec) -> &[u8] {
        &r.key
    }

    fn rec(n: u64) -> Rec {
        Rec {
            key: n.to_be_bytes(),
            val: n * 1000,
        }
    }

    impl<T: Copy, S: BuildHasher> LfHash<T, S> {
        /// Walks the whole list single-threaded and asserts the sort and
        /// anchor invariants; returns (dummies, live records) seen.
        fn check_invariants(&self) -> (usize, usize) {
            let mut dummies = 0;
            let mut reals = 0;
            let mut on_list = std::collections::HashSet::new();
            let head = match self.array.value(0) {
                Some(slot) => slot,
                None => return (0, 0),
            };

            let mut last: Option<(u32, Vec<u8>)> = None;
            let mut p = node::untag::<T>(head.load(Ordering::SeqCst));
            while !p.is_null() {
                let n = unsafe { &*p };
                let link = n.link.load(Ordering::SeqCst);
                assert!(
                    !node::tagged(link),
                    "marked node still linked on a quiescent list"
                );
                let this = (n.sort_key, unsafe { self.node_key(n) }.to_vec());
                if let Some(prev) = &last {
                    assert!(
                        *prev < this || (!self.unique && *prev == this),
                        "list out of split order: {:?} then {:?}",
                        prev,
                        this
                    );
                }
                if n.is_dummy() {
                    dummies += 1;
                } else {
                    reals += 1;
                }
                on_list.insert(p as usize);
                last = Some(this);
                p = node::untag::<T>(link);
            }

            // every initialized directory slot points at an in-list dummy
            // with the bucket's reversed index as its sort key
            for b in 0..self.size.load(Ordering::SeqCst) {
                let Some(slot) = self.array.value(b as usize) else {
                    continue;
                };
                let addr = slot.load(Ordering::SeqCst);
                if addr == 0 {
                    continue;
                }
                assert!(on_list.contains(&addr), "anchor of bucket {} not on list", b);
                let anchor = unsafe { &*(addr as *mut Node<T>) };
                assert!(anchor.is_dummy());
                assert_eq!(anchor.sort_key, b.reverse_bits());
            }
            (dummies, reals)
        }
    }

    #[test]
    fn list_stays_sorted_through_inserts_and_removes() {
        let table = LfHash::new(KeySpec::Extract(rec_key));
        let mut pins = table.pin();
        for n in 0..512u64 {
            table.insert(&mut pins, rec(n)).unwrap();
        }
        for n in (0..512u64).step_by(3) {
            assert_eq!(table.remove(&mut pins, &n.to_be_bytes()), Ok(true));
        }
        drop(pins);

        let expected = 512 - 512u64.div_ceil(3) as usize;
        assert_eq!(table.len(), expected);
        let (_, reals) = table.check_invariants();
        assert_eq!(reals, expected);
    }

    #[test]
    fn growth_keeps_every_anchor_valid() {
        let table = LfHash::new(KeySpec::Extract(rec_key));
        let mut pins = table.pin();
        for n in 0..2000u64 {
            table.insert(&mut pins, rec(n)).unwrap();
        }
        // touch plenty of buckets so lots of dummies get threaded in
        for n in 0..2000u64 {
            assert!(table.get(&mut pins, &n.to_be_bytes()).unwrap().is_some());
        }
        drop(pins);

        let buckets = table.buckets();
        assert!(buckets.is_power_of_two());
        assert!(buckets >= 2000, "load factor 1.0 forces size past count");
        table.check_invariants();
    }

    #[test]
    fn emptied_table_keeps_only_anchors() {
        let table = LfHash::new(KeySpec::Extract(rec_key));
        let mut pins = table.pin();
        for n in 0..100u64 {
            table.insert(&mut pins, rec(n)).unwrap();
        }
        for n in 0..100u64 {
            assert_eq!(table.remove(&mut pins, &n.to_be_bytes()), Ok(true));
        }
        drop(pins);

        assert_eq!(table.len(), 0);
        let (dummies, reals) = table.check_invariants();
        assert_eq!(reals, 0);
        assert!(dummies >= 1);
    }

    #[test]
    fn parents_are_initialized_before_children() {
        let table = LfHash::new(KeySpec::Extract(rec_key));
        let mut pins = table.pin();
        for n in 0..300u64 {
            table.insert(&mut pins, rec(n)).unwrap();
        }
        drop(pins);

        for b in 1..table.buckets() {
            let slot = match table.array.value(b as usize) {
                Some(s) => s,
                None => continue,
            };
            if slot.load(Ordering::SeqCst) == 0 {
                continue;
            }
            let parent = b & !(1u32 << (31 - b.leading_zeros()));
            let pslot = table
                .array
                .value(parent as usize)
                .expect("parent slot must exist");
            assert_ne!(
                pslot.load(Ordering::SeqCst),
                0,
                "bucket {} initialized before its parent {}",
                b,
                parent
            );
        }
    }

    #[test]
    fn duplicates_insert_before_their_elders() {
        let table = LfHash::multi(KeySpec::Extract(rec_key));
        let mut pins = table.pin();
        let mut a = rec(42);
        a.val = 1;
        let mut b = rec(42);
        b.val = 2;
        table.insert(&mut pins, a).unwrap();
        table.insert(&mut pins, b).unwrap();
        assert_eq!(table.len(), 2);

        // the younger duplicate is the one lookups see
        let hit = table.get(&mut pins, &42u64.to_be_bytes()).unwrap().unwrap();
        assert_eq!(hit.val, 2);
        drop(hit);

        assert_eq!(table.remove(&mut pins, &42u64.to_be_bytes()), Ok(true));
        let hit = table.get(&mut pins, &42u64.to_be_bytes()).unwrap().unwrap();
        assert_eq!(hit.val, 1);
    }

    #[test]
    fn inline_key_spec_reads_the_right_bytes() {
        let table: LfHash<[u8; 12]> = LfHash::new(KeySpec::Inline { offset: 4, len: 8 });
        let mut pins = table.pin();
        let mut record = [0u8; 12];
        record[..4].copy_from_slice(&[9, 9, 9, 9]);
        record[4..].copy_from_slice(b"the-key!");
        table.insert(&mut pins, record).unwrap();

        assert!(table.get(&mut pins, b"the-key!").unwrap().is_some());
        assert!(table.get(&mut pins, b"99999999").unwrap().is_none());
    }

    #[test]
    #[should_panic(expected = "does not fit the record")]
    fn oversized_inline_key_is_rejected() {
        let _ = LfHash::<[u8; 4]>::new(KeySpec::Inline { offset: 2, len: 4 });
    }

    #[test]
    #[should_panic(expected = "different table")]
    fn foreign_pins_are_rejected() {
        let a = LfHash::new(KeySpec::Extract(rec_key));
        let b = LfHash::new(KeySpec::Extract(rec_key));
        let mut pins = a.pin();
        let _ = b.insert(&mut pins, rec(1));
    }

    #[test]
    fn custom_comparator_folds_case() {
        fn fold(b: u8) -> u8 {
            b.to_ascii_lowercase()
        }
        fn ci_cmp(a: &[u8], b: &[u8]) -> KeyOrdering {
            a.iter().map(|&c| fold(c)).cmp(b.iter().map(|&c| fold(c)))
        }
        #[derive(Clone, Copy)]
        struct Ascii {
            key: [u8; 4],
        }
        fn ascii_key(r: &Ascii) -> &[u8] {
            &r.key
        }
        // equal-under-cmp keys must hash equal, so fold the hash too
        #[derive(Default)]
        struct FoldHasher(std::collections::hash_map::DefaultHasher);
        impl Hasher for FoldHasher {
            fn write(&mut self, bytes: &[u8]) {
                for &b in bytes {
                    self.0.write_u8(fold(b));
                }
            }
            fn finish(&self) -> u64 {
                self.0.finish()
            }
        }
        #[derive(Default)]
        struct FoldBuild;
        impl BuildHasher for FoldBuild {
            type Hasher = FoldHasher;
            fn build_hasher(&self) -> FoldHasher {
                FoldHasher::default()
            }
        }

        let table = LfHash::with_hasher(KeySpec::Extract(ascii_key), FoldBuild)
            .comparator(ci_cmp);
        let mut pins = table.pin();
        table.insert(&mut pins, Ascii { key: *b"Carl" }).unwrap();
        assert_eq!(
            table.insert(&mut pins, Ascii { key: *b"CARL" }),
            Err(InsertError::Duplicate)
        );
        assert!(table.get(&mut pins, b"carl").unwrap().is_some());
    }
}
