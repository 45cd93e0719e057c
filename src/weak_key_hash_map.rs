//! WeakKeyHashMap: entries that do not keep their keys alive.
//!
//! Keys are handed in as `Arc<K>` and stored as `Weak<K>`. Once the last
//! strong reference to a key is gone its entry is dead. Dead entries are
//! never observable: lookups only match keys that still upgrade, and every
//! view skips what does not.
//!
//! Dead entries are unlinked by a sweep. Sweeps run on `len`, on the
//! views, on `purge`, from a `Sweeper` thread, and after a number of
//! inserts proportional to the table's size, which keeps inserts
//! amortised O(1). Lookups and removals never sweep. A sweep is not a
//! structural change: it only unlinks entries that no view could see, so
//! it never trips a traversal. The hash of every entry is stored alongside
//! it, so a dead key never needs to be hashed again.
//!
//! Traversals are fail-fast, like `LinkedHashMap`'s: `iter`, `for_each`,
//! `replace_all`, `remove_if` and the compute family hold the lock only
//! between steps, so their callbacks may use the map, and report
//! `ConcurrentModification` when the key set changed behind their back.

use crate::config::MapConfig;
use crate::error::MapError;
use crate::linked_table::{Handle, LinkedTable};
use crate::mod_count::ExpectedModCount;
use core::borrow::Borrow;
use core::fmt;
use core::hash::{BuildHasher, Hash};
use hashbrown::HashSet;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::hash_map::RandomState;
use std::io;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

type Table<K, V> = LinkedTable<Weak<K>, V>;
type Dead<K, V> = Vec<(Weak<K>, V)>;

/// Fewest inserts between two sweeps of a small table.
const MIN_SWEEP_INTERVAL: usize = 64;

struct State<K, V> {
    table: Table<K, V>,
    inserts_since_sweep: usize,
}

impl<K, V> State<K, V> {
    /// Unlink every entry whose key is dead. The caller drops the returned
    /// entries after releasing the lock.
    fn sweep(&mut self) -> Dead<K, V> {
        self.inserts_since_sweep = 0;
        let dead = self.table.expunge(|k, _| k.strong_count() > 0);
        if !dead.is_empty() {
            tracing::debug!(removed = dead.len(), "expunged entries with dead keys");
        }
        dead
    }

    /// Record an insert of a new entry; sweeps once the inserts since the
    /// last sweep reach the table's size.
    fn note_insert(&mut self) -> Dead<K, V> {
        self.inserts_since_sweep += 1;
        if self.inserts_since_sweep >= self.table.len().max(MIN_SWEEP_INTERVAL) {
            self.sweep()
        } else {
            Vec::new()
        }
    }
}

struct Shared<K, V, S> {
    state: Mutex<State<K, V>>,
    hasher: S,
}

impl<K, V, S> Shared<K, V, S> {
    fn purge(&self) -> usize {
        let dead = self.state.lock().sweep();
        let n = dead.len();
        drop(dead);
        n
    }
}

fn same_key<K, Q>(stored: &Weak<K>, q: &Q) -> bool
where
    K: Borrow<Q>,
    Q: ?Sized + Eq,
{
    stored
        .upgrade()
        .is_some_and(|k| <K as Borrow<Q>>::borrow(&k) == q)
}

/// First entry at or after `from` whose key is alive, with the key pinned.
fn first_live<K, V>(t: &Table<K, V>, from: Option<Handle>) -> Option<(Handle, Arc<K>)> {
    let mut cursor = from;
    while let Some(h) = cursor {
        if let Some(k) = t.get(h).and_then(|(w, _)| w.upgrade()) {
            return Some((h, k));
        }
        cursor = t.next_of(h);
    }
    None
}

/// Hash map holding its keys weakly.
///
/// Equality checks briefly upgrade stored keys; if another thread drops
/// the last strong reference at that moment, `K`'s destructor runs under
/// the map's lock and must not access the map.
pub struct WeakKeyHashMap<K, V, S = RandomState> {
    inner: Arc<Shared<K, V, S>>,
}

impl<K, V> WeakKeyHashMap<K, V>
where
    K: Eq + Hash,
{
    pub fn new() -> Self {
        Self::with_config(MapConfig::default())
    }

    pub fn with_config(config: MapConfig) -> Self {
        Self::with_config_and_hasher(config, RandomState::new())
    }

    /// Build a map from borrowed keys; the map holds only weak references,
    /// so entries live exactly as long as the caller keeps the keys.
    pub fn from_entries<'a, I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (&'a Arc<K>, V)>,
        K: 'a,
    {
        let m = Self::new();
        m.insert_all(entries);
        m
    }
}

impl<K, V> Default for WeakKeyHashMap<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S> WeakKeyHashMap<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    pub fn with_hasher(hasher: S) -> Self {
        Self::with_config_and_hasher(MapConfig::default(), hasher)
    }

    pub fn with_config_and_hasher(config: MapConfig, hasher: S) -> Self {
        Self {
            inner: Arc::new(Shared {
                state: Mutex::new(State {
                    table: LinkedTable::with_capacity(config.reserved_entries()),
                    inserts_since_sweep: 0,
                }),
                hasher,
            }),
        }
    }

    fn make_hash<Q>(&self, q: &Q) -> u64
    where
        Q: ?Sized + Hash,
    {
        self.inner.hasher.hash_one(q)
    }

    /// Map `key` to `value` without taking ownership of the key.
    pub fn insert(&self, key: &Arc<K>, value: V) -> Option<V> {
        let hash = self.make_hash(&**key);
        let (old, dead) = {
            let mut s = self.inner.state.lock();
            match s.table.find(hash, |w| same_key(w, &**key)) {
                Some(h) => (s.table.replace_value(h, value), Vec::new()),
                None => {
                    s.table.insert_new(hash, Arc::downgrade(key), value);
                    (None, s.note_insert())
                }
            }
        };
        drop(dead);
        old
    }

    pub fn insert_all<'a, I>(&self, entries: I)
    where
        I: IntoIterator<Item = (&'a Arc<K>, V)>,
        K: 'a,
    {
        for (k, v) in entries {
            self.insert(k, v);
        }
    }

    pub fn get<Q>(&self, q: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
        V: Clone,
    {
        let hash = self.make_hash(q);
        let s = self.inner.state.lock();
        let h = s.table.find(hash, |w| same_key(w, q))?;
        s.table.value(h).cloned()
    }

    pub fn contains_key<Q>(&self, q: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let hash = self.make_hash(q);
        self.inner
            .state
            .lock()
            .table
            .find(hash, |w| same_key(w, q))
            .is_some()
    }

    pub fn remove<Q>(&self, q: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.remove_entry(q).map(|(_, v)| v)
    }

    /// Remove an entry and hand back a strong reference to its key.
    pub fn remove_entry<Q>(&self, q: &Q) -> Option<(Arc<K>, V)>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let hash = self.make_hash(q);
        let removed = {
            let mut s = self.inner.state.lock();
            let h = s.table.find(hash, |w| same_key(w, q))?;
            s.table.remove(h)
        };
        removed.and_then(|(w, v)| Some((w.upgrade()?, v)))
    }

    /// Remove each listed key; returns how many were present.
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

    /// Remove every live entry whose key is not listed; returns how many
    /// went.
    pub fn retain_all<'q, I>(&self, keys: I) -> Result<usize, MapError>
    where
        I: IntoIterator<Item = &'q K>,
        K: 'q,
        V: Clone,
    {
        let keep: HashSet<&K, RandomState> = keys.into_iter().collect();
        self.remove_if(|k, _| !keep.contains(k))
    }

    /// Recompute the mapping for `key` from its current value.
    ///
    /// `f` runs with the lock released and sees the prior value (or
    /// `None`); `Some` stores its result, `None` removes the entry or
    /// leaves it absent. Returns the final value. Fails with
    /// `ConcurrentModification`, applying nothing, when the key set
    /// changed while `f` ran, whether through `f` or another thread.
    pub fn compute<F>(&self, key: &Arc<K>, f: F) -> Result<Option<V>, MapError>
    where
        F: FnOnce(&K, Option<&V>) -> Option<V>,
        V: Clone,
    {
        let hash = self.make_hash(&**key);
        let (expected, prior) = {
            let s = self.inner.state.lock();
            let prior = s
                .table
                .find(hash, |w| same_key(w, &**key))
                .and_then(|h| s.table.value(h).cloned());
            (s.table.expect(), prior)
        };
        let computed = f(&**key, prior.as_ref());
        self.finish_compute(expected, hash, key, computed)
    }

    /// Compute a value only when `key` is absent. A present key returns
    /// its current value without calling `f`.
    pub fn compute_if_absent<F>(&self, key: &Arc<K>, f: F) -> Result<Option<V>, MapError>
    where
        F: FnOnce(&K) -> Option<V>,
        V: Clone,
    {
        let hash = self.make_hash(&**key);
        let expected = {
            let s = self.inner.state.lock();
            if let Some(h) = s.table.find(hash, |w| same_key(w, &**key)) {
                return Ok(s.table.value(h).cloned());
            }
            s.table.expect()
        };
        let computed = f(&**key);
        self.finish_compute(expected, hash, key, computed)
    }

    /// Recompute the value of a live key; absent or dead keys return
    /// `None` without calling `f`.
    pub fn compute_if_present<Q, F>(&self, q: &Q, f: F) -> Result<Option<V>, MapError>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
        F: FnOnce(&K, &V) -> Option<V>,
        V: Clone,
    {
        let hash = self.make_hash(q);
        let (expected, key, prior) = {
            let s = self.inner.state.lock();
            let Some(h) = s.table.find(hash, |w| same_key(w, q)) else {
                return Ok(None);
            };
            let Some((w, v)) = s.table.get(h) else {
                return Ok(None);
            };
            let Some(key) = w.upgrade() else {
                return Ok(None);
            };
            (s.table.expect(), key, v.clone())
        };
        let computed = f(&*key, &prior);
        self.finish_compute(expected, hash, &key, computed)
    }

    /// Store `value` when `key` is absent, otherwise combine it with the
    /// current value through `f`; `None` from `f` removes the entry.
    pub fn merge<F>(&self, key: &Arc<K>, value: V, f: F) -> Result<Option<V>, MapError>
    where
        F: FnOnce(&V, V) -> Option<V>,
        V: Clone,
    {
        let hash = self.make_hash(&**key);
        let (expected, prior) = {
            let s = self.inner.state.lock();
            let prior = s
                .table
                .find(hash, |w| same_key(w, &**key))
                .and_then(|h| s.table.value(h).cloned());
            (s.table.expect(), prior)
        };
        let computed = match prior {
            Some(old) => f(&old, value),
            None => Some(value),
        };
        self.finish_compute(expected, hash, key, computed)
    }

    fn finish_compute(
        &self,
        expected: ExpectedModCount,
        hash: u64,
        key: &Arc<K>,
        computed: Option<V>,
    ) -> Result<Option<V>, MapError>
    where
        V: Clone,
    {
        let (result, old, dead) = {
            let mut s = self.inner.state.lock();
            expected.check(s.table.mod_count())?;
            let found = s.table.find(hash, |w| same_key(w, &**key));
            match (found, computed) {
                (Some(h), Some(v)) => {
                    let old = s.table.replace_value(h, v.clone());
                    (Some(v), old, Vec::new())
                }
                (Some(h), None) => (None, s.table.remove(h).map(|(_, v)| v), Vec::new()),
                (None, Some(v)) => {
                    s.table.insert_new(hash, Arc::downgrade(key), v.clone());
                    (Some(v), None, s.note_insert())
                }
                (None, None) => (None, None, Vec::new()),
            }
        };
        drop(old);
        drop(dead);
        Ok(result)
    }
}

impl<K, V, S> WeakKeyHashMap<K, V, S> {
    /// Number of entries whose key is still alive. Sweeps first, so this
    /// is O(n).
    pub fn len(&self) -> usize {
        let (n, dead) = {
            let mut s = self.inner.state.lock();
            let dead = s.sweep();
            (s.table.len(), dead)
        };
        drop(dead);
        n
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let drained = {
            let mut s = self.inner.state.lock();
            s.inserts_since_sweep = 0;
            s.table.drain_all()
        };
        drop(drained);
    }

    /// Expunge every entry whose key is dead; returns how many went.
    pub fn purge(&self) -> usize {
        self.inner.purge()
    }

    /// Fail-fast iterator over the live entries, in insertion order.
    pub fn iter(&self) -> Iter<'_, K, V, S> {
        let s = self.inner.state.lock();
        Iter {
            map: self,
            expected: s.table.expect(),
            next: first_live(&s.table, s.table.head()),
            last: None,
            done: false,
        }
    }

    /// Visit every live entry, stopping at the first sign of a structural
    /// change made by `f` or anyone else.
    pub fn for_each<F>(&self, mut f: F) -> Result<(), MapError>
    where
        F: FnMut(&K, &V),
        V: Clone,
    {
        for item in self.iter() {
            let (k, v) = item?;
            f(&k, &v);
        }
        Ok(())
    }

    /// Replace every live value with `f(key, value)`, in iteration order.
    /// Stops with `ConcurrentModification` as soon as the key set is found
    /// changed; entries already visited keep their new values.
    pub fn replace_all<F>(&self, mut f: F) -> Result<(), MapError>
    where
        F: FnMut(&K, &V) -> V,
        V: Clone,
    {
        let mut it = self.iter();
        while let Some(item) = it.next() {
            let (k, v) = item?;
            it.set_value(f(&k, &v))?;
        }
        Ok(())
    }

    /// Remove every live entry matching `pred`; returns how many went.
    /// Any structural change other than these removals stops the scan
    /// with `ConcurrentModification`.
    pub fn remove_if<F>(&self, mut pred: F) -> Result<usize, MapError>
    where
        F: FnMut(&K, &V) -> bool,
        V: Clone,
    {
        let mut it = self.iter();
        let mut removed = 0;
        while let Some(item) = it.next() {
            let (k, v) = item?;
            if pred(&k, &v) {
                it.remove()?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Keep only the live entries matching `pred`.
    pub fn retain<F>(&self, mut pred: F) -> Result<usize, MapError>
    where
        F: FnMut(&K, &V) -> bool,
        V: Clone,
    {
        self.remove_if(|k, v| !pred(k, v))
    }

    /// Strong references to every live key.
    pub fn keys(&self) -> Vec<Arc<K>> {
        self.collect_live(|k, _| k)
    }

    pub fn values(&self) -> Vec<V>
    where
        V: Clone,
    {
        self.collect_live(|_, v| v.clone())
    }

    pub fn to_vec(&self) -> Vec<(Arc<K>, V)>
    where
        V: Clone,
    {
        self.collect_live(|k, v| (k, v.clone()))
    }

    fn collect_live<T>(&self, mut f: impl FnMut(Arc<K>, &V) -> T) -> Vec<T> {
        let (out, dead) = {
            let mut s = self.inner.state.lock();
            let dead = s.sweep();
            let out: Vec<T> = s
                .table
                .iter()
                .filter_map(|(_, w, v)| Some(f(w.upgrade()?, v)))
                .collect();
            (out, dead)
        };
        drop(dead);
        out
    }

    /// Start a background thread that purges dead entries every `period`.
    ///
    /// The thread holds only a weak reference to the map and exits on its
    /// own once the map is dropped. Stopping or dropping the returned
    /// `Sweeper` stops the thread and waits for it.
    pub fn spawn_sweeper(&self, period: Duration) -> io::Result<Sweeper>
    where
        K: Send + Sync + 'static,
        V: Send + 'static,
        S: Send + Sync + 'static,
    {
        let map = Arc::downgrade(&self.inner);
        let signal = Arc::new((Mutex::new(false), Condvar::new()));
        let theirs = Arc::clone(&signal);
        let handle = thread::Builder::new()
            .name("weak-key-sweeper".into())
            .spawn(move || {
                let (lock, cvar) = &*theirs;
                let mut stopped = lock.lock();
                while !*stopped {
                    if !cvar.wait_for(&mut stopped, period).timed_out() {
                        continue;
                    }
                    let Some(shared) = map.upgrade() else {
                        break;
                    };
                    MutexGuard::unlocked(&mut stopped, move || shared.purge());
                }
            })?;
        tracing::debug!(?period, "sweeper started");
        Ok(Sweeper {
            signal,
            handle: Some(handle),
        })
    }
}

impl<'a, K, V, S> FromIterator<(&'a Arc<K>, V)> for WeakKeyHashMap<K, V, S>
where
    K: Eq + Hash + 'a,
    S: BuildHasher + Default,
{
    fn from_iter<I: IntoIterator<Item = (&'a Arc<K>, V)>>(iter: I) -> Self {
        let m = Self::with_hasher(S::default());
        m.insert_all(iter);
        m
    }
}

impl<'a, K, V, S> Extend<(&'a Arc<K>, V)> for WeakKeyHashMap<K, V, S>
where
    K: Eq + Hash + 'a,
    S: BuildHasher,
{
    fn extend<I: IntoIterator<Item = (&'a Arc<K>, V)>>(&mut self, iter: I) {
        self.insert_all(iter);
    }
}

impl<K, V, S> fmt::Debug for WeakKeyHashMap<K, V, S>
where
    K: fmt::Debug,
    V: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.inner.state.lock();
        f.debug_map()
            .entries(
                s.table
                    .iter()
                    .filter_map(|(_, w, v)| Some((w.upgrade()?, v))),
            )
            .finish()
    }
}

/// Fail-fast iterator over live entries, yielding a strong key and a
/// cloned value.
///
/// Holds the lock only inside each call. The next entry's key is pinned
/// with a strong reference so no sweep can unlink it; entries whose key
/// dies before they are reached are skipped. Sweeps never trip the
/// iterator; inserts of new keys, removals and `clear` do.
pub struct Iter<'a, K, V, S = RandomState> {
    map: &'a WeakKeyHashMap<K, V, S>,
    expected: ExpectedModCount,
    next: Option<(Handle, Arc<K>)>,
    last: Option<Handle>,
    done: bool,
}

impl<'a, K, V, S> Iter<'a, K, V, S> {
    fn lock_checked(&mut self) -> Result<MutexGuard<'a, State<K, V>>, MapError> {
        let map = self.map;
        let s = map.inner.state.lock();
        if let Err(e) = self.expected.check(s.table.mod_count()) {
            self.done = true;
            return Err(e);
        }
        Ok(s)
    }

    /// Remove the entry returned by the last call to `next`. The
    /// traversal continues normally afterwards.
    pub fn remove(&mut self) -> Result<(), MapError> {
        let h = self
            .last
            .take()
            .ok_or(MapError::IllegalState("no current entry to remove"))?;
        let removed = {
            let mut s = self.lock_checked()?;
            let removed = s.table.remove(h);
            self.expected.refresh(s.table.mod_count());
            removed
        };
        drop(removed);
        Ok(())
    }

    /// Store `value` in the entry returned by the last call to `next`.
    fn set_value(&mut self, value: V) -> Result<(), MapError> {
        let h = self
            .last
            .ok_or(MapError::IllegalState("no current entry to update"))?;
        let old = {
            let mut s = self.lock_checked()?;
            s.table.replace_value(h, value)
        };
        drop(old);
        Ok(())
    }

    /// Feed the rest of the live entries to `f`, stopping at the first
    /// detected structural change.
    pub fn for_each_remaining<F>(&mut self, mut f: F) -> Result<(), MapError>
    where
        F: FnMut(Arc<K>, V),
        V: Clone,
    {
        for item in self.by_ref() {
            let (k, v) = item?;
            f(k, v);
        }
        Ok(())
    }
}

impl<'a, K, V: Clone, S> Iterator for Iter<'a, K, V, S> {
    type Item = Result<(Arc<K>, V), MapError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let (h, key, value) = {
            let s = match self.lock_checked() {
                Ok(s) => s,
                Err(e) => return Some(Err(e)),
            };
            let Some((h, key)) = self.next.take() else {
                self.done = true;
                return None;
            };
            let value = s.table.value(h).cloned();
            self.next = first_live(&s.table, s.table.next_of(h));
            (h, key, value)
        };
        match value {
            Some(v) => {
                self.last = Some(h);
                Some(Ok((key, v)))
            }
            None => {
                self.done = true;
                None
            }
        }
    }
}

/// Handle to a background purge thread started by
/// `WeakKeyHashMap::spawn_sweeper`.
pub struct Sweeper {
    signal: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl Sweeper {
    /// Stop the thread and wait for it to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        {
            let (lock, cvar) = &*self.signal;
            *lock.lock() = true;
            cvar.notify_all();
        }
        if handle.join().is_err() {
            tracing::warn!("sweeper thread panicked");
        }
        tracing::debug!("sweeper stopped");
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Sweeper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sweeper")
            .field("running", &self.handle.is_some())
            .finish()
    }
}
