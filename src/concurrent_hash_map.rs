//! ConcurrentHashMap: sharded map shared between threads without
//! external locking.
//!
//! Keys are hashed once; the high half of the hash picks a shard and the
//! full hash drives that shard's `LinkedTable`. Each shard sits behind its
//! own `parking_lot::RwLock`, so writers on different shards never wait
//! on each other.
//!
//! User callbacks never run under a write lock. The `compute` family runs
//! its callback under the key's shard *upgradable* read lock: other
//! writers of that shard wait, readers do not, and the callback itself may
//! read the map. Writing to the map from such a callback panics instead of
//! deadlocking. Bulk operations (`replace_all`, `remove_if` and friends)
//! run their callbacks on a copy of each shard with no lock held, then
//! apply each result only if the entry still holds the value the callback
//! saw, so those callbacks may do anything.
//!
//! Traversals are weakly consistent. `keys`, `values` and `to_vec` copy
//! one shard at a time under its read lock; `iter` does the same lazily.
//! A snapshot may miss writes that land on shards already copied, but
//! every element in it is a whole entry that existed at the moment its
//! shard was read. Nothing here reports `ConcurrentModification`.

use crate::compute_scope::ComputeScope;
use crate::config::MapConfig;
use crate::error::MapError;
use crate::linked_table::{Handle, LinkedTable};
use core::borrow::Borrow;
use core::fmt;
use core::hash::{BuildHasher, Hash};
use core::sync::atomic::{AtomicUsize, Ordering};
use hashbrown::HashSet;
use parking_lot::{RwLock, RwLockReadGuard, RwLockUpgradableReadGuard, RwLockWriteGuard};
use std::collections::hash_map::RandomState;

type Shard<K, V> = RwLock<LinkedTable<K, V>>;

const WRITE_FROM_COMPUTE: &str =
    "ConcurrentHashMap modified from inside one of its own compute callbacks";

pub struct ConcurrentHashMap<K, V, S = RandomState> {
    shards: Box<[Shard<K, V>]>,
    len: AtomicUsize,
    hasher: S,
}

impl<K, V> ConcurrentHashMap<K, V>
where
    K: Eq + Hash,
{
    pub fn new() -> Self {
        Self::with_config(MapConfig::default())
    }

    pub fn with_config(config: MapConfig) -> Self {
        Self::with_config_and_hasher(config, RandomState::new())
    }

    /// Build a map holding every entry the source yields.
    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
    {
        let m = Self::new();
        m.insert_all(entries);
        m
    }
}

impl<K, V> Default for ConcurrentHashMap<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S> ConcurrentHashMap<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    pub fn with_hasher(hasher: S) -> Self {
        Self::with_config_and_hasher(MapConfig::default(), hasher)
    }

    pub fn with_config_and_hasher(config: MapConfig, hasher: S) -> Self {
        let n = config.shards();
        let per_shard = config.reserved_entries().div_ceil(n);
        let shards = (0..n)
            .map(|_| RwLock::new(LinkedTable::with_capacity(per_shard)))
            .collect();
        tracing::debug!(shards = n, per_shard, "built concurrent map");
        Self {
            shards,
            len: AtomicUsize::new(0),
            hasher,
        }
    }

    fn make_hash<Q>(&self, q: &Q) -> u64
    where
        Q: ?Sized + Hash,
    {
        self.hasher.hash_one(q)
    }

    #[inline]
    fn shard(&self, hash: u64) -> &Shard<K, V> {
        let i = ((hash >> 32) as usize) & (self.shards.len() - 1);
        &self.shards[i]
    }

    pub fn contains_key<Q>(&self, q: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let hash = self.make_hash(q);
        self.lock_read(self.shard(hash))
            .find(hash, |k| k.borrow() == q)
            .is_some()
    }

    pub fn get<Q>(&self, q: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
        V: Clone,
    {
        let hash = self.make_hash(q);
        let t = self.lock_read(self.shard(hash));
        let h = t.find(hash, |k| k.borrow() == q)?;
        t.value(h).cloned()
    }

    /// # Panics
    ///
    /// When called from inside a `compute`-family callback of this map.
    /// The same holds for every other method that writes.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        let hash = self.make_hash(&key);
        let mut t = self.lock_write(self.shard(hash));
        match t.find(hash, |k| *k == key) {
            Some(h) => t.replace_value(h, value),
            None => {
                t.insert_new(hash, key, value);
                self.len.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert only when `key` is absent; otherwise return the current value.
    pub fn insert_if_absent(&self, key: K, value: V) -> Option<V>
    where
        V: Clone,
    {
        let hash = self.make_hash(&key);
        let mut t = self.lock_write(self.shard(hash));
        match t.find(hash, |k| *k == key) {
            Some(h) => t.value(h).cloned(),
            None => {
                t.insert_new(hash, key, value);
                self.len.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn replace<Q>(&self, q: &Q, value: V) -> Option<V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let hash = self.make_hash(q);
        let mut t = self.lock_write(self.shard(hash));
        let h = t.find(hash, |k| k.borrow() == q)?;
        t.replace_value(h, value)
    }

    pub fn remove<Q>(&self, q: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.remove_entry(q).map(|(_, v)| v)
    }

    pub fn remove_entry<Q>(&self, q: &Q) -> Option<(K, V)>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let hash = self.make_hash(q);
        let mut t = self.lock_write(self.shard(hash));
        let h = t.find(hash, |k| k.borrow() == q)?;
        let removed = t.remove(h);
        if removed.is_some() {
            self.len.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    /// Remove every listed key; returns how many were present.
    pub fn remove_all<'q, Q, I>(&self, keys: I) -> usize
    where
        I: IntoIterator<Item = &'q Q>,
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq + 'q,
    {
        keys.into_iter()
            .filter(|q| self.remove_entry(*q).is_some())
            .count()
    }

    /// Remove every entry whose key is not listed; returns how many went.
    pub fn retain_all<'q, I>(&self, keys: I) -> usize
    where
        I: IntoIterator<Item = &'q K>,
        K: 'q,
    {
        let keep: HashSet<&K, RandomState> = keys.into_iter().collect();
        let mut total = 0;
        for shard in self.shards.iter() {
            let removed = self.lock_write(shard).retain(|k, _| keep.contains(k));
            self.len.fetch_sub(removed.len(), Ordering::Relaxed);
            total += removed.len();
            drop(removed);
        }
        total
    }

    pub fn insert_all<I>(&self, entries: I)
    where
        I: IntoIterator<Item = (K, V)>,
    {
        for (k, v) in entries {
            self.insert(k, v);
        }
    }

    /// Recompute the mapping for `key` atomically with respect to other
    /// writers of the same key.
    ///
    /// `f` runs once, under the shard's upgradable read lock. It may read
    /// this map, including keys on the same shard.
    ///
    /// # Panics
    ///
    /// When `f` writes to this map, or when called from inside another
    /// `compute`-family callback of this map.
    pub fn compute<F>(&self, key: K, f: F) -> Option<V>
    where
        F: FnOnce(&K, Option<&V>) -> Option<V>,
        V: Clone,
    {
        let hash = self.make_hash(&key);
        let (result, displaced) = {
            let t = self.lock_upgradable(self.shard(hash));
            let found = t.find(hash, |k| *k == key);
            let computed = {
                let _scope = ComputeScope::enter(self);
                f(&key, found.and_then(|h| t.value(h)))
            };
            let mut t = RwLockUpgradableReadGuard::upgrade(t);
            self.settle(&mut t, hash, key, found, computed)
        };
        drop(displaced);
        result
    }

    /// Same locking rule as `compute`. A present key returns its value
    /// without calling `f`.
    pub fn compute_if_absent<F>(&self, key: K, f: F) -> Option<V>
    where
        F: FnOnce(&K) -> Option<V>,
        V: Clone,
    {
        let hash = self.make_hash(&key);
        let (result, displaced) = {
            let t = self.lock_upgradable(self.shard(hash));
            if let Some(h) = t.find(hash, |k| *k == key) {
                return t.value(h).cloned();
            }
            let computed = {
                let _scope = ComputeScope::enter(self);
                f(&key)
            };
            let mut t = RwLockUpgradableReadGuard::upgrade(t);
            self.settle(&mut t, hash, key, None, computed)
        };
        drop(displaced);
        result
    }

    /// Same locking rule as `compute`. Absent keys return `None` without
    /// calling `f`.
    pub fn compute_if_present<Q, F>(&self, q: &Q, f: F) -> Option<V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
        F: FnOnce(&K, &V) -> Option<V>,
        V: Clone,
    {
        let hash = self.make_hash(q);
        let (result, displaced): (Option<V>, Displaced<K, V>) = {
            let t = self.lock_upgradable(self.shard(hash));
            let h = t.find(hash, |k| k.borrow() == q)?;
            let computed = {
                let (k, v) = t.get(h)?;
                let _scope = ComputeScope::enter(self);
                f(k, v)
            };
            let mut t = RwLockUpgradableReadGuard::upgrade(t);
            match computed {
                Some(v) => {
                    let old = t.replace_value(h, v.clone());
                    (Some(v), (None, None, old))
                }
                None => match t.remove(h) {
                    Some((k_old, v_old)) => {
                        self.len.fetch_sub(1, Ordering::Relaxed);
                        (None, (None, Some(k_old), Some(v_old)))
                    }
                    None => (None, (None, None, None)),
                },
            }
        };
        drop(displaced);
        result
    }

    /// Store `value` when `key` is absent, otherwise combine it with the
    /// current value through `f`; `None` from `f` removes the entry. Same
    /// locking rule as `compute`.
    pub fn merge<F>(&self, key: K, value: V, f: F) -> Option<V>
    where
        F: FnOnce(&V, V) -> Option<V>,
        V: Clone,
    {
        let hash = self.make_hash(&key);
        let (result, displaced) = {
            let t = self.lock_upgradable(self.shard(hash));
            let found = t.find(hash, |k| *k == key);
            let computed = match found.and_then(|h| t.value(h)) {
                Some(old) => {
                    let _scope = ComputeScope::enter(self);
                    f(old, value)
                }
                None => Some(value),
            };
            let mut t = RwLockUpgradableReadGuard::upgrade(t);
            self.settle(&mut t, hash, key, found, computed)
        };
        drop(displaced);
        result
    }

    fn settle(
        &self,
        t: &mut LinkedTable<K, V>,
        hash: u64,
        key: K,
        found: Option<Handle>,
        computed: Option<V>,
    ) -> (Option<V>, Displaced<K, V>)
    where
        V: Clone,
    {
        match (found, computed) {
            (Some(h), Some(v)) => {
                let old = t.replace_value(h, v.clone());
                (Some(v), (Some(key), None, old))
            }
            (Some(h), None) => match t.remove(h) {
                Some((k_old, v_old)) => {
                    self.len.fetch_sub(1, Ordering::Relaxed);
                    (None, (Some(key), Some(k_old), Some(v_old)))
                }
                None => (None, (Some(key), None, None)),
            },
            (None, Some(v)) => {
                t.insert_new(hash, key, v.clone());
                self.len.fetch_add(1, Ordering::Relaxed);
                (Some(v), (None, None, None))
            }
            (None, None) => (None, (Some(key), None, None)),
        }
    }
}

/// Keys and values displaced by an update, dropped once the shard lock is
/// released.
type Displaced<K, V> = (Option<K>, Option<K>, Option<V>);

impl<K, V, S> ConcurrentHashMap<K, V, S> {
    /// Read-lock a shard. Inside a compute callback of this map the lock
    /// is taken recursively so it cannot queue behind a writer that waits
    /// for the callback.
    fn lock_read<'a>(&self, shard: &'a Shard<K, V>) -> RwLockReadGuard<'a, LinkedTable<K, V>> {
        if ComputeScope::is_active(self) {
            shard.read_recursive()
        } else {
            shard.read()
        }
    }

    fn lock_write<'a>(&self, shard: &'a Shard<K, V>) -> RwLockWriteGuard<'a, LinkedTable<K, V>> {
        assert!(!ComputeScope::is_active(self), "{WRITE_FROM_COMPUTE}");
        shard.write()
    }

    fn lock_upgradable<'a>(
        &self,
        shard: &'a Shard<K, V>,
    ) -> RwLockUpgradableReadGuard<'a, LinkedTable<K, V>> {
        assert!(!ComputeScope::is_active(self), "{WRITE_FROM_COMPUTE}");
        shard.upgradable_read()
    }

    /// Copy of one shard's entries, with the handles they live under.
    fn copy_shard(&self, shard: &Shard<K, V>) -> Vec<(Handle, K, V)>
    where
        K: Clone,
        V: Clone,
    {
        self.lock_read(shard)
            .iter()
            .map(|(h, k, v)| (h, k.clone(), v.clone()))
            .collect()
    }

    /// Number of entries. May lag behind writers still in flight.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains_value(&self, value: &V) -> bool
    where
        V: PartialEq,
    {
        self.shards
            .iter()
            .any(|s| self.lock_read(s).iter().any(|(_, _, v)| v == value))
    }

    /// Empty every shard in turn. Writers racing with `clear` may leave
    /// their entries behind in shards already cleared.
    pub fn clear(&self) {
        for shard in self.shards.iter() {
            let drained = self.lock_write(shard).drain_all();
            self.len.fetch_sub(drained.len(), Ordering::Relaxed);
            drop(drained);
        }
    }

    /// Replace every value with `f(key, value)`.
    ///
    /// `f` runs with no lock held and may use this map. Each result is
    /// stored only if the entry still holds the value `f` saw; if another
    /// writer changed it meanwhile, `f` runs again on the new value.
    /// Entries removed meanwhile are skipped, and entries added meanwhile
    /// may or may not be visited.
    pub fn replace_all<F>(&self, mut f: F)
    where
        F: FnMut(&K, &V) -> V,
        K: Clone,
        V: Clone + PartialEq,
    {
        // Only a refused entry can fail, and `Some` is never refused.
        let _ = self.try_replace_all(|k, v| Some(f(k, v)));
    }

    /// Like `replace_all`, but `f` may refuse an entry by returning `None`.
    /// The first refusal stops the pass with `InvalidArgument`; entries
    /// already visited keep their new values and the refused one keeps
    /// its old value.
    pub fn try_replace_all<F>(&self, mut f: F) -> Result<(), MapError>
    where
        F: FnMut(&K, &V) -> Option<V>,
        K: Clone,
        V: Clone + PartialEq,
    {
        for shard in self.shards.iter() {
            for (h, key, seen) in self.copy_shard(shard) {
                self.replace_entry(shard, h, &key, seen, &mut f)?;
            }
        }
        Ok(())
    }

    fn replace_entry<F>(
        &self,
        shard: &Shard<K, V>,
        h: Handle,
        key: &K,
        mut seen: V,
        f: &mut F,
    ) -> Result<(), MapError>
    where
        F: FnMut(&K, &V) -> Option<V>,
        V: Clone + PartialEq,
    {
        loop {
            let new = f(key, &seen).ok_or(MapError::InvalidArgument("replacement value is missing"))?;
            let mut t = self.lock_write(shard);
            let Some(current) = t.value_mut(h) else {
                return Ok(());
            };
            if *current == seen {
                let old = core::mem::replace(current, new);
                drop(t);
                drop(old);
                return Ok(());
            }
            seen = current.clone();
        }
    }

    /// Remove every entry matching `pred`; returns how many went.
    ///
    /// `pred` runs with no lock held and may use this map. An entry is
    /// removed only if it still holds the value `pred` saw.
    pub fn remove_if<F>(&self, mut pred: F) -> usize
    where
        F: FnMut(&K, &V) -> bool,
        K: Clone,
        V: Clone + PartialEq,
    {
        let mut total = 0;
        for shard in self.shards.iter() {
            for (h, key, seen) in self.copy_shard(shard) {
                if !pred(&key, &seen) {
                    continue;
                }
                let removed = {
                    let mut t = self.lock_write(shard);
                    if t.value(h) == Some(&seen) {
                        t.remove(h)
                    } else {
                        None
                    }
                };
                if removed.is_some() {
                    self.len.fetch_sub(1, Ordering::Relaxed);
                    total += 1;
                }
            }
        }
        total
    }

    pub fn retain<F>(&self, mut pred: F) -> usize
    where
        F: FnMut(&K, &V) -> bool,
        K: Clone,
        V: Clone + PartialEq,
    {
        self.remove_if(|k, v| !pred(k, v))
    }

    /// Call `f` on a weakly consistent copy of each shard in turn. No lock
    /// is held while `f` runs, so it may use this map.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&K, &V),
        K: Clone,
        V: Clone,
    {
        for (k, v) in self.iter() {
            f(&k, &v);
        }
    }

    /// Weakly consistent copy of the keys.
    pub fn keys(&self) -> Vec<K>
    where
        K: Clone,
    {
        let mut out = Vec::with_capacity(self.len());
        for shard in self.shards.iter() {
            out.extend(self.lock_read(shard).iter().map(|(_, k, _)| k.clone()));
        }
        out
    }

    /// Weakly consistent copy of the values.
    pub fn values(&self) -> Vec<V>
    where
        V: Clone,
    {
        let mut out = Vec::with_capacity(self.len());
        for shard in self.shards.iter() {
            out.extend(self.lock_read(shard).iter().map(|(_, _, v)| v.clone()));
        }
        out
    }

    /// Weakly consistent copy of the entries.
    pub fn to_vec(&self) -> Vec<(K, V)>
    where
        K: Clone,
        V: Clone,
    {
        let mut out = Vec::with_capacity(self.len());
        for shard in self.shards.iter() {
            out.extend(
                self.lock_read(shard)
                    .iter()
                    .map(|(_, k, v)| (k.clone(), v.clone())),
            );
        }
        out
    }

    /// Lazy, weakly consistent iterator over cloned entries.
    pub fn iter(&self) -> Iter<'_, K, V, S> {
        Iter {
            map: self,
            next_shard: 0,
            buffered: Vec::new().into_iter(),
        }
    }
}

impl<K, V, S> FromIterator<(K, V)> for ConcurrentHashMap<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher + Default,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let m = Self::with_hasher(S::default());
        m.insert_all(iter);
        m
    }
}

impl<K, V, S> Extend<(K, V)> for ConcurrentHashMap<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        self.insert_all(iter);
    }
}

impl<K, V, S> fmt::Debug for ConcurrentHashMap<K, V, S>
where
    K: fmt::Debug,
    V: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut m = f.debug_map();
        for shard in self.shards.iter() {
            let t = self.lock_read(shard);
            m.entries(t.iter().map(|(_, k, v)| (k, v)));
        }
        m.finish()
    }
}

/// Weakly consistent iterator. Copies one shard when the previous one is
/// used up, so it never holds a lock between calls to `next`.
pub struct Iter<'a, K, V, S = RandomState> {
    map: &'a ConcurrentHashMap<K, V, S>,
    next_shard: usize,
    buffered: std::vec::IntoIter<(K, V)>,
}

impl<'a, K: Clone, V: Clone, S> Iterator for Iter<'a, K, V, S> {
    type Item = (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(kv) = self.buffered.next() {
                return Some(kv);
            }
            let shard = self.map.shards.get(self.next_shard)?;
            self.next_shard += 1;
            let copy: Vec<(K, V)> = self
                .map
                .lock_read(shard)
                .iter()
                .map(|(_, k, v)| (k.clone(), v.clone()))
                .collect();
            self.buffered = copy.into_iter();
        }
    }
}
