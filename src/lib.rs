//! A lock-free extensible hash table.
//!
//! This crate implements the split-ordered-list design: all entries live on a
//! single lock-free ordered linked list, sorted by the *bit-reversed* hash of
//! their key. Bucket boundaries are marked by permanent dummy nodes, and a
//! segmented directory maps bucket numbers to their dummy. Growing the table
//! is a single CAS that doubles the logical bucket count; no entry ever
//! moves, because in split order every bucket's future halves are already
//! contiguous. See Shalev & Shavit, "Split-Ordered Lists: Lock-Free
//! Extensible Hash Tables", and Michael, "High Performance Dynamic Lock-Free
//! Hash Tables and List-Based Sets".
//!
//! # Records and keys
//!
//! The table maps opaque byte keys to fixed-size records. A record is any
//! `Copy` type `T`; its key is a byte slice extracted from the record by a
//! [`KeySpec`], either a fixed byte range within the record or a callback.
//! Records are copied into the table on insert and read in place under a pin.
//!
//! # A note on pins and memory use
//!
//! Every operation takes a [`Pins`] handle obtained from [`LfHash::pin`]. A
//! `Pins` is this thread's set of three hazard-pointer slots: publishing a
//! node's address in a slot tells every other thread "do not recycle this
//! node yet". Retired nodes sit in the owning thread's purgatory until a scan
//! of all published pins proves nobody references them, after which they move
//! to a private stash and are handed out again by [`LfHash::insert`]. Node
//! memory is only returned to the system when the table is dropped.
//!
//! References returned by [`LfHash::get`] and [`LfHash::random_match`] are
//! backed by pin slot 2 and stay valid until the returned [`RecordRef`] is
//! dropped; the borrow checker ties them to the `Pins` they came from, so a
//! stale reference cannot outlive its pin.
//!
//! # Examples
//!
//! ```
//! use lfhash::{KeySpec, LfHash};
//!
//! #[derive(Clone, Copy)]
//! struct Session {
//!     id: [u8; 8],
//!     user: u32,
//! }
//!
//! fn session_key(s: &Session) -> &[u8] {
//!     &s.id
//! }
//!
//! let table = LfHash::new(KeySpec::Extract(session_key));
//! let mut pins = table.pin();
//!
//! table
//!     .insert(&mut pins, Session { id: *b"AAAABBBB", user: 17 })
//!     .unwrap();
//!
//! let found = table.get(&mut pins, b"AAAABBBB").unwrap();
//! assert_eq!(found.as_deref().map(|s| s.user), Some(17));
//! drop(found); // releases pin slot 2
//!
//! assert!(table.remove(&mut pins, b"AAAABBBB").unwrap());
//! assert!(table.get(&mut pins, b"AAAABBBB").unwrap().is_none());
//! ```

#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

mod alloc;
mod map;
mod node;
mod segarr;

pub use alloc::Pins;
pub use map::{InsertError, KeySpec, LfHash, RecordRef};

use std::fmt;

/// The default [`std::hash::BuildHasher`] for keys.
///
/// Keys are fed to the hasher as raw bytes. This is [ahash] with its
/// compile-time random state; any other `BuildHasher` can be substituted via
/// [`LfHash::with_hasher`].
///
/// [ahash]: https://crates.io/crates/ahash
pub type DefaultHashBuilder = ahash::RandomState;

/// Error returned when a node or directory-segment allocation fails.
///
/// The table never aborts on exhausted memory: every allocating path reports
/// failure through this type and leaves the structure in a state that later
/// operations can use as-is.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct OutOfMemory;

impl fmt::Display for OutOfMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("out of memory")
    }
}

impl std::error::Error for OutOfMemory {}
