//! failfast-map: hash maps with explicit contracts for what happens when
//! a map changes while it is being traversed.
//!
//! Internal Design:
//!
//! Summary
//! - Goal: one structural table shared by three maps, each of which
//!   picks a different answer to "iteration meets mutation".
//! - Layers:
//!   - LinkedTable<K, V>: structural layer. Slot storage with stable
//!     generational handles, a hash index, a doubly linked iteration
//!     order and a modification counter. Owns no hasher.
//!   - LinkedHashMap<K, V, S>: single-threaded and fail-fast. Insertion
//!     or access order. Iterators and bulk operations report
//!     `MapError::ConcurrentModification` instead of walking a table that
//!     changed under them.
//!   - ConcurrentHashMap<K, V, S>: `Sync`, sharded behind
//!     `parking_lot::RwLock`s. Traversals are weakly consistent and never
//!     fail.
//!   - WeakKeyHashMap<K, V, S>: keys held as `Weak<K>`; entries whose key
//!     died are invisible at once and expunged by amortised sweeps on
//!     insert, by `len` and the views, by `purge`, or by a background
//!     `Sweeper`. Traversals are fail-fast.
//!   - IdentityHashMap<K, V, S>: a LinkedHashMap keyed by `IdentityKey`,
//!     which compares `Arc` allocations by address.
//!
//! Structural modification
//! - Inserting a new key, removing a key, clearing a non-empty table and
//!   (access order only) moving an entry to the tail bump the counter.
//! - Replacing the value of an existing key does not.
//! - A fail-fast traversal snapshots the counter when it starts and
//!   compares before every step, including the step that would report the
//!   end. Its own `remove` refreshes the snapshot.
//!
//! Reentrancy policy and interior mutability
//! - LinkedHashMap keeps its table in a `RefCell` and takes `&self`
//!   everywhere. User closures (`replace_all`, `compute`, `remove_if`, ...)
//!   run with no borrow held, so they may call back into the map; the
//!   counter then tells the operation that its view is stale.
//! - Only `K: Eq` and `K: Hash` run while the table is borrowed.
//!   Re-entering the map from them panics on the `RefCell`.
//! - ConcurrentHashMap runs `compute`-style closures under the shard's
//!   upgradable read lock, which makes them atomic per key. Such a closure
//!   may read the map; writing to it from the closure panics instead of
//!   deadlocking. Bulk operations run their closures with no lock held and
//!   apply each result only if the entry still holds the value the
//!   closure saw.
//! - WeakKeyHashMap follows the LinkedHashMap policy with a `Mutex` in
//!   place of the `RefCell`.
//! - Removed keys and values are handed back out of the table and
//!   dropped after the borrow or lock is released, so `Drop` for `K`/`V`
//!   may re-enter.
//!
//! Hasher and rehashing invariants
//! - Each entry stores its `u64` hash and the index only ever uses the
//!   stored hash; `K: Hash` is never invoked after insertion. The weak
//!   keyed map depends on this: a dead key cannot be hashed at all.
//!
//! Construction
//! - `MapConfig` carries validated sizing (capacity, load factor, shard
//!   count). Every map can also be built from any entry source; the
//!   source's size hint only sizes the first allocation and never bounds
//!   how many entries are accepted.
//!
//! Notes and non-goals
//! - Values are handed out by clone; there are no guards or references
//!   into the tables.
//! - Keys are immutable post-insert.
//! - Lower layers are implementation details.

mod compute_scope;
mod concurrent_hash_map;
mod config;
mod error;
mod identity_key;
mod linked_hash_map;
mod linked_table;
mod linked_table_proptest;
mod mod_count;
mod weak_key_hash_map;

// Public surface
pub use concurrent_hash_map::ConcurrentHashMap;
pub use config::{MapConfig, DEFAULT_CAPACITY, DEFAULT_LOAD_FACTOR, MAXIMUM_CAPACITY};
pub use error::MapError;
pub use identity_key::{IdentityHashMap, IdentityKey};
pub use linked_hash_map::{AccessOrder, Iter, Keys, LinkedHashMap, Values};
pub use weak_key_hash_map::{Sweeper, WeakKeyHashMap};

/// Weakly consistent iterator types of `ConcurrentHashMap`.
pub mod concurrent {
    pub use crate::concurrent_hash_map::Iter;
}

/// Fail-fast iterator type of `WeakKeyHashMap`.
pub mod weak {
    pub use crate::weak_key_hash_map::Iter;
}
