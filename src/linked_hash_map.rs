//! LinkedHashMap: single-threaded ordered map with fail-fast traversal.

use crate::config::{MapConfig, MAX_UP_FRONT_RESERVE};
use crate::error::MapError;
use crate::linked_table::{Handle, LinkedTable};
use crate::mod_count::ExpectedModCount;
use core::borrow::Borrow;
use core::cell::RefCell;
use core::fmt;
use core::hash::{BuildHasher, Hash};
use hashbrown::HashSet;
use std::collections::hash_map::RandomState;

/// Iteration order of a `LinkedHashMap`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum AccessOrder {
    /// Entries stay where they were first inserted.
    #[default]
    Insertion,
    /// Every use of an entry moves it to the end. A use is a structural
    /// modification and trips open iterators.
    Access,
}

/// Ordered hash map whose iterators and bulk operations detect structural
/// modification made behind their back.
///
/// All methods take `&self`: the table sits behind a `RefCell`, and no
/// borrow is held while user closures run, so a closure passed to
/// `replace_all`, `remove_if`, `compute` and friends may call back into
/// the map. When it changes the key set, the operation stops with
/// `MapError::ConcurrentModification` instead of continuing over a table
/// that moved under it.
///
/// Only `K: Eq` and `K: Hash` run while the table is borrowed; re-entering
/// the map from those panics.
///
/// ```
/// use failfast_map::{LinkedHashMap, MapError};
///
/// let m = LinkedHashMap::new();
/// m.insert("a", 1);
/// m.insert("b", 2);
/// let r = m.replace_all(|k, v| {
///     m.insert("c", 3);
///     v + k.len() as i32
/// });
/// assert_eq!(r, Err(MapError::ConcurrentModification));
/// ```
pub struct LinkedHashMap<K, V, S = RandomState> {
    table: RefCell<LinkedTable<K, V>>,
    hasher: S,
    order: AccessOrder,
}

impl<K, V> LinkedHashMap<K, V>
where
    K: Eq + Hash,
{
    pub fn new() -> Self {
        Self::with_config(MapConfig::default(), AccessOrder::Insertion)
    }

    /// An empty map in access order.
    pub fn access_ordered() -> Self {
        Self::with_config(MapConfig::default(), AccessOrder::Access)
    }

    pub fn with_config(config: MapConfig, order: AccessOrder) -> Self {
        Self::with_config_and_hasher(config, order, RandomState::new())
    }

    /// Build an insertion-ordered map holding every entry the source
    /// yields, in source order.
    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
    {
        let m = Self::new();
        m.insert_all(entries);
        m
    }
}

impl<K, V> Default for LinkedHashMap<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Keys and values displaced by an update, dropped once the table borrow
/// is gone.
type Displaced<K, V> = (Option<K>, Option<K>, Option<V>);

impl<K, V, S> LinkedHashMap<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    pub fn with_hasher(hasher: S) -> Self {
        Self::with_config_and_hasher(MapConfig::default(), AccessOrder::Insertion, hasher)
    }

    pub fn with_config_and_hasher(config: MapConfig, order: AccessOrder, hasher: S) -> Self {
        Self {
            table: RefCell::new(LinkedTable::with_capacity(config.reserved_entries())),
            hasher,
            order,
        }
    }

    fn make_hash<Q>(&self, q: &Q) -> u64
    where
        Q: ?Sized + Hash,
    {
        self.hasher.hash_one(q)
    }

    fn touch(&self, t: &mut LinkedTable<K, V>, h: Handle) {
        if self.order == AccessOrder::Access {
            t.move_to_back(h);
        }
    }

    pub fn order(&self) -> AccessOrder {
        self.order
    }

    pub fn len(&self) -> usize {
        self.table.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.borrow().is_empty()
    }

    /// Membership test. Never counts as a use, even in access order.
    pub fn contains_key<Q>(&self, q: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let hash = self.make_hash(q);
        self.table.borrow().find(hash, |k| k.borrow() == q).is_some()
    }

    pub fn contains_value(&self, value: &V) -> bool
    where
        V: PartialEq,
    {
        self.table.borrow().iter().any(|(_, _, v)| v == value)
    }

    /// Insert or replace. Replacing the value of an existing key is not a
    /// structural change unless the map is access ordered.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        let hash = self.make_hash(&key);
        let mut t = self.table.borrow_mut();
        match t.find(hash, |k| *k == key) {
            Some(h) => {
                let old = t.replace_value(h, value);
                self.touch(&mut t, h);
                old
            }
            None => {
                t.insert_new(hash, key, value);
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
        let mut t = self.table.borrow_mut();
        match t.find(hash, |k| *k == key) {
            Some(h) => {
                self.touch(&mut t, h);
                t.value(h).cloned()
            }
            None => {
                t.insert_new(hash, key, value);
                None
            }
        }
    }

    /// Replace the value of a present key; absent keys are left absent.
    pub fn replace<Q>(&self, q: &Q, value: V) -> Option<V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let hash = self.make_hash(q);
        let mut t = self.table.borrow_mut();
        let h = t.find(hash, |k| k.borrow() == q)?;
        let old = t.replace_value(h, value);
        self.touch(&mut t, h);
        old
    }

    /// Look up a value. In access order this is a use of the entry.
    pub fn get<Q>(&self, q: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
        V: Clone,
    {
        let hash = self.make_hash(q);
        let mut t = self.table.borrow_mut();
        let h = t.find(hash, |k| k.borrow() == q)?;
        self.touch(&mut t, h);
        t.value(h).cloned()
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
        let mut t = self.table.borrow_mut();
        let h = t.find(hash, |k| k.borrow() == q)?;
        t.remove(h)
    }

    pub fn clear(&self) {
        let drained = self.table.borrow_mut().drain_all();
        drop(drained);
    }

    /// Insert every entry the source yields. The source's size hint only
    /// sizes the first allocation; it never limits what is accepted.
    pub fn insert_all<I>(&self, entries: I)
    where
        I: IntoIterator<Item = (K, V)>,
    {
        let entries = entries.into_iter();
        let (lower, _) = entries.size_hint();
        self.table
            .borrow_mut()
            .reserve(lower.min(MAX_UP_FRONT_RESERVE));
        for (k, v) in entries {
            self.insert(k, v);
        }
    }

    fn settle(
        &self,
        t: &mut LinkedTable<K, V>,
        hash: u64,
        key: K,
        computed: Option<V>,
    ) -> (Option<V>, Displaced<K, V>)
    where
        V: Clone,
    {
        let found = t.find(hash, |k| *k == key);
        match (found, computed) {
            (Some(h), Some(v)) => {
                let old = t.replace_value(h, v.clone());
                self.touch(t, h);
                (Some(v), (Some(key), None, old))
            }
            (Some(h), None) => match t.remove(h) {
                Some((k_old, v_old)) => (None, (Some(key), Some(k_old), Some(v_old))),
                None => (None, (Some(key), None, None)),
            },
            (None, Some(v)) => {
                t.insert_new(hash, key, v.clone());
                (Some(v), (None, None, None))
            }
            (None, None) => (None, (Some(key), None, None)),
        }
    }

    /// Recompute the mapping for `key` from its current value.
    ///
    /// `f` sees the prior value (or `None`) and decides the final state:
    /// `Some` stores the value, `None` removes the entry or leaves it
    /// absent. Returns the final value. Fails with
    /// `ConcurrentModification`, applying nothing, when `f` changed the
    /// key set.
    pub fn compute<F>(&self, key: K, f: F) -> Result<Option<V>, MapError>
    where
        F: FnOnce(&K, Option<&V>) -> Option<V>,
        V: Clone,
    {
        let hash = self.make_hash(&key);
        let (expected, prior) = {
            let t = self.table.borrow();
            let prior = t
                .find(hash, |k| *k == key)
                .and_then(|h| t.value(h).cloned());
            (t.expect(), prior)
        };
        let computed = f(&key, prior.as_ref());
        self.finish_compute(expected, hash, key, computed)
    }

    /// Compute a value only when `key` is absent. A present key returns
    /// its current value without calling `f`.
    pub fn compute_if_absent<F>(&self, key: K, f: F) -> Result<Option<V>, MapError>
    where
        F: FnOnce(&K) -> Option<V>,
        V: Clone,
    {
        let hash = self.make_hash(&key);
        let expected = {
            let mut t = self.table.borrow_mut();
            if let Some(h) = t.find(hash, |k| *k == key) {
                self.touch(&mut t, h);
                return Ok(t.value(h).cloned());
            }
            t.expect()
        };
        let computed = f(&key);
        self.finish_compute(expected, hash, key, computed)
    }

    /// Recompute the value of a present key; absent keys return `None`
    /// without calling `f`.
    pub fn compute_if_present<Q, F>(&self, q: &Q, f: F) -> Result<Option<V>, MapError>
    where
        K: Borrow<Q> + Clone,
        Q: ?Sized + Hash + Eq,
        F: FnOnce(&K, &V) -> Option<V>,
        V: Clone,
    {
        let hash = self.make_hash(q);
        let (expected, key, prior) = {
            let t = self.table.borrow();
            let Some(h) = t.find(hash, |k| k.borrow() == q) else {
                return Ok(None);
            };
            let Some((k, v)) = t.get(h) else {
                return Ok(None);
            };
            (t.expect(), k.clone(), v.clone())
        };
        let computed = f(&key, &prior);
        self.finish_compute(expected, hash, key, computed)
    }

    /// Store `value` when `key` is absent, otherwise combine it with the
    /// current value through `f`; `None` from `f` removes the entry.
    pub fn merge<F>(&self, key: K, value: V, f: F) -> Result<Option<V>, MapError>
    where
        F: FnOnce(&V, V) -> Option<V>,
        V: Clone,
    {
        let hash = self.make_hash(&key);
        let (expected, prior) = {
            let t = self.table.borrow();
            let prior = t
                .find(hash, |k| *k == key)
                .and_then(|h| t.value(h).cloned());
            (t.expect(), prior)
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
        key: K,
        computed: Option<V>,
    ) -> Result<Option<V>, MapError>
    where
        V: Clone,
    {
        let (result, displaced) = {
            let mut t = self.table.borrow_mut();
            expected.check(t.mod_count())?;
            self.settle(&mut t, hash, key, computed)
        };
        drop(displaced);
        Ok(result)
    }

    /// Replace every value with `f(key, value)`, in iteration order.
    ///
    /// Stops with `ConcurrentModification` as soon as `f` is found to
    /// have changed the key set; entries already visited keep their new
    /// values and the current one is left untouched.
    pub fn replace_all<F>(&self, mut f: F) -> Result<(), MapError>
    where
        F: FnMut(&K, &V) -> V,
        K: Clone,
        V: Clone,
    {
        self.try_replace_all(|k, v| Some(f(k, v)))
    }

    /// Like `replace_all`, for transforms that may fail to produce a
    /// value. A `None` result stops the pass with `InvalidArgument`
    /// without storing anything for that entry.
    pub fn try_replace_all<F>(&self, mut f: F) -> Result<(), MapError>
    where
        F: FnMut(&K, &V) -> Option<V>,
        K: Clone,
        V: Clone,
    {
        let (expected, mut cursor) = {
            let t = self.table.borrow();
            (t.expect(), t.head())
        };
        while let Some(h) = cursor {
            let (key, value) = {
                let t = self.table.borrow();
                expected.check(t.mod_count())?;
                match t.get(h) {
                    Some((k, v)) => (k.clone(), v.clone()),
                    None => break,
                }
            };
            let replacement =
                f(&key, &value).ok_or(MapError::InvalidArgument("replacement value is missing"))?;
            let old = {
                let mut t = self.table.borrow_mut();
                expected.check(t.mod_count())?;
                cursor = t.next_of(h);
                t.replace_value(h, replacement)
            };
            drop(old);
        }
        Ok(())
    }

    /// Visit every entry in iteration order, stopping at the first sign
    /// of a structural change made by `f` or anyone else.
    pub fn for_each<F>(&self, mut f: F) -> Result<(), MapError>
    where
        F: FnMut(&K, &V),
        K: Clone,
        V: Clone,
    {
        for item in self.iter() {
            let (k, v) = item?;
            f(&k, &v);
        }
        Ok(())
    }

    /// Remove every entry matching `pred` and return how many went.
    ///
    /// Removals go through the traversal itself and are not reported as
    /// conflicts; any other structural change, including one made by
    /// `pred`, stops the scan with `ConcurrentModification`.
    pub fn remove_if<F>(&self, mut pred: F) -> Result<usize, MapError>
    where
        F: FnMut(&K, &V) -> bool,
        K: Clone,
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

    /// Keep only the entries matching `pred`.
    pub fn retain<F>(&self, mut pred: F) -> Result<usize, MapError>
    where
        F: FnMut(&K, &V) -> bool,
        K: Clone,
        V: Clone,
    {
        self.remove_if(|k, v| !pred(k, v))
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

    /// Remove every entry whose key is not listed; returns how many went.
    pub fn retain_all<'q, I>(&self, keys: I) -> Result<usize, MapError>
    where
        I: IntoIterator<Item = &'q K>,
        K: Clone + 'q,
        V: Clone,
    {
        let keep: HashSet<&K, RandomState> = keys.into_iter().collect();
        self.remove_if(|k, _| !keep.contains(k))
    }
}

impl<K, V, S> LinkedHashMap<K, V, S> {
    /// Fail-fast iterator over cloned entries.
    pub fn iter(&self) -> Iter<'_, K, V, S> {
        let t = self.table.borrow();
        Iter {
            map: self,
            state: IterState::NotStarted,
            expected: t.expect(),
            next: t.head(),
            last: None,
        }
    }

    pub fn keys(&self) -> Keys<'_, K, V, S> {
        Keys { inner: self.iter() }
    }

    pub fn values(&self) -> Values<'_, K, V, S> {
        Values { inner: self.iter() }
    }

    /// One consistent copy of all entries, in iteration order.
    pub fn to_vec(&self) -> Vec<(K, V)>
    where
        K: Clone,
        V: Clone,
    {
        self.table
            .borrow()
            .iter()
            .map(|(_, k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn keys_vec(&self) -> Vec<K>
    where
        K: Clone,
    {
        self.table.borrow().iter().map(|(_, k, _)| k.clone()).collect()
    }

    pub fn values_vec(&self) -> Vec<V>
    where
        V: Clone,
    {
        self.table.borrow().iter().map(|(_, _, v)| v.clone()).collect()
    }
}

impl<K, V, S> FromIterator<(K, V)> for LinkedHashMap<K, V, S>
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

impl<K, V, S> Extend<(K, V)> for LinkedHashMap<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        self.insert_all(iter);
    }
}

impl<K, V, S> fmt::Debug for LinkedHashMap<K, V, S>
where
    K: fmt::Debug,
    V: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let t = self.table.borrow();
        f.debug_map()
            .entries(t.iter().map(|(_, k, v)| (k, v)))
            .finish()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum IterState {
    NotStarted,
    Iterating,
    Exhausted,
}

/// Fail-fast iterator yielding cloned `(K, V)` pairs.
///
/// Holds no borrow between steps. Each step compares the map's
/// modification counter with the snapshot taken at creation and yields
/// `Err(ConcurrentModification)` once on mismatch, after which the
/// iterator is exhausted.
pub struct Iter<'a, K, V, S = RandomState> {
    map: &'a LinkedHashMap<K, V, S>,
    state: IterState,
    expected: ExpectedModCount,
    next: Option<Handle>,
    last: Option<Handle>,
}

impl<'a, K, V, S> Iter<'a, K, V, S> {
    fn step(&mut self) -> Option<Result<Handle, MapError>> {
        if self.state == IterState::Exhausted {
            return None;
        }
        self.state = IterState::Iterating;
        let map = self.map;
        let t = map.table.borrow();
        if let Err(e) = self.expected.check(t.mod_count()) {
            self.state = IterState::Exhausted;
            return Some(Err(e));
        }
        match self.next.filter(|&h| t.contains_handle(h)) {
            Some(h) => {
                self.next = t.next_of(h);
                self.last = Some(h);
                Some(Ok(h))
            }
            None => {
                self.state = IterState::Exhausted;
                None
            }
        }
    }

    fn read<R>(&self, h: Handle, f: impl FnOnce(&K, &V) -> R) -> Option<R> {
        let t = self.map.table.borrow();
        t.get(h).map(|(k, v)| f(k, v))
    }

    /// Remove the entry returned by the last call to `next`. The
    /// traversal continues normally afterwards.
    pub fn remove(&mut self) -> Result<(), MapError> {
        let h = self
            .last
            .take()
            .ok_or(MapError::IllegalState("no current entry to remove"))?;
        let map = self.map;
        let removed = {
            let mut t = map.table.borrow_mut();
            if let Err(e) = self.expected.check(t.mod_count()) {
                self.state = IterState::Exhausted;
                return Err(e);
            }
            let removed = t.remove(h);
            self.expected.refresh(t.mod_count());
            removed
        };
        drop(removed);
        Ok(())
    }

    /// Feed the rest of the sequence to `f`, stopping at the first
    /// detected structural change.
    pub fn for_each_remaining<F>(&mut self, mut f: F) -> Result<(), MapError>
    where
        F: FnMut(K, V),
        K: Clone,
        V: Clone,
    {
        for item in self.by_ref() {
            let (k, v) = item?;
            f(k, v);
        }
        Ok(())
    }
}

impl<'a, K: Clone, V: Clone, S> Iterator for Iter<'a, K, V, S> {
    type Item = Result<(K, V), MapError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.step()? {
            Ok(h) => self
                .read(h, |k, v| Ok((k.clone(), v.clone())))
                .or_else(|| {
                    self.state = IterState::Exhausted;
                    None
                }),
            Err(e) => Some(Err(e)),
        }
    }
}

/// Fail-fast iterator over cloned keys.
pub struct Keys<'a, K, V, S = RandomState> {
    inner: Iter<'a, K, V, S>,
}

impl<'a, K, V, S> Keys<'a, K, V, S> {
    pub fn remove(&mut self) -> Result<(), MapError> {
        self.inner.remove()
    }

    /// Feed the remaining keys to `f`, stopping at the first detected
    /// structural change.
    pub fn for_each_remaining<F>(&mut self, mut f: F) -> Result<(), MapError>
    where
        F: FnMut(K),
        K: Clone,
    {
        for key in self.by_ref() {
            f(key?);
        }
        Ok(())
    }
}

impl<'a, K: Clone, V, S> Iterator for Keys<'a, K, V, S> {
    type Item = Result<K, MapError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.inner.step()? {
            Ok(h) => self.inner.read(h, |k, _| Ok(k.clone())),
            Err(e) => Some(Err(e)),
        }
    }
}

/// Fail-fast iterator over cloned values.
pub struct Values<'a, K, V, S = RandomState> {
    inner: Iter<'a, K, V, S>,
}

impl<'a, K, V, S> Values<'a, K, V, S> {
    pub fn remove(&mut self) -> Result<(), MapError> {
        self.inner.remove()
    }

    pub fn for_each_remaining<F>(&mut self, mut f: F) -> Result<(), MapError>
    where
        F: FnMut(V),
        V: Clone,
    {
        for value in self.by_ref() {
            f(value?);
        }
        Ok(())
    }
}

impl<'a, K, V: Clone, S> Iterator for Values<'a, K, V, S> {
    type Item = Result<V, MapError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.inner.step()? {
            Ok(h) => self.inner.read(h, |_, v| Ok(v.clone())),
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn abc() -> LinkedHashMap<String, i32> {
        let m = LinkedHashMap::new();
        m.insert("a".to_string(), 1);
        m.insert("b".to_string(), 2);
        m.insert("c".to_string(), 3);
        m
    }

    /// Invariant: replacing a value is not structural; an open iterator
    /// keeps going.
    #[test]
    fn value_replacement_does_not_trip_iterator() {
        let m = abc();
        let mut it = m.iter();
        assert_eq!(it.next(), Some(Ok(("a".to_string(), 1))));
        assert_eq!(m.insert("b".to_string(), 20), Some(2));
        assert_eq!(it.next(), Some(Ok(("b".to_string(), 20))));
        assert_eq!(it.next(), Some(Ok(("c".to_string(), 3))));
        assert_eq!(it.next(), None);
    }

    /// Invariant: iterator `remove` refreshes its snapshot and the
    /// traversal continues past the removed entry.
    #[test]
    fn iterator_remove_is_not_a_conflict() {
        let m = abc();
        let mut it = m.iter();
        assert!(matches!(it.remove(), Err(MapError::IllegalState(_))));
        it.next().unwrap().unwrap();
        it.next().unwrap().unwrap();
        it.remove().unwrap();
        assert!(matches!(it.remove(), Err(MapError::IllegalState(_))));
        assert_eq!(it.next(), Some(Ok(("c".to_string(), 3))));
        assert_eq!(it.next(), None);
        assert_eq!(m.keys_vec(), ["a", "c"]);
    }

    /// Invariant: after reporting a conflict the iterator is exhausted.
    #[test]
    fn conflict_is_reported_once() {
        let m = abc();
        let mut it = m.iter();
        it.next();
        m.remove("c");
        assert_eq!(it.next(), Some(Err(MapError::ConcurrentModification)));
        assert_eq!(it.next(), None);
    }

    /// Invariant: a conflict made after the last entry still surfaces on
    /// the next step.
    #[test]
    fn conflict_after_last_entry_is_reported() {
        let m = abc();
        let mut it = m.keys();
        for _ in 0..3 {
            it.next().unwrap().unwrap();
        }
        m.insert("d".to_string(), 4);
        assert_eq!(it.next(), Some(Err(MapError::ConcurrentModification)));
    }

    /// Invariant: clearing an empty map is not a structural change.
    #[test]
    fn clear_empty_is_not_structural() {
        let m: LinkedHashMap<String, i32> = LinkedHashMap::new();
        let mut it = m.iter();
        m.clear();
        assert_eq!(it.next(), None);
    }

    /// Invariant: keys and values iterators share the fail-fast contract.
    #[test]
    fn keys_and_values_views_fail_fast() {
        let m = abc();
        let mut ks = m.keys();
        let mut vs = m.values();
        assert_eq!(ks.next(), Some(Ok("a".to_string())));
        assert_eq!(vs.next(), Some(Ok(1)));
        m.insert("z".to_string(), 26);
        assert_eq!(ks.next(), Some(Err(MapError::ConcurrentModification)));
        assert_eq!(vs.next(), Some(Err(MapError::ConcurrentModification)));
    }

    /// Invariant: `values().remove()` removes the entry behind the value.
    #[test]
    fn values_remove_drops_entry() {
        let m = abc();
        let mut vs = m.values();
        while let Some(v) = vs.next() {
            if v.unwrap() == 2 {
                vs.remove().unwrap();
            }
        }
        assert_eq!(m.values_vec(), [1, 3]);
    }

    /// Invariant: `try_replace_all` stops at a missing value and leaves
    /// that entry and later ones untouched.
    #[test]
    fn try_replace_all_rejects_missing_value() {
        let m = abc();
        let r = m.try_replace_all(|k, v| if k == "b" { None } else { Some(v * 10) });
        assert!(matches!(r, Err(MapError::InvalidArgument(_))));
        assert_eq!(m.values_vec(), [10, 2, 3]);
    }

    /// Invariant: `for_each` stops immediately when the visitor inserts.
    #[test]
    fn for_each_stops_on_insert() {
        let m = abc();
        let seen = Cell::new(0);
        let r = m.for_each(|_, v| {
            seen.set(seen.get() + 1);
            m.insert(format!("x{v}"), *v);
        });
        assert_eq!(r, Err(MapError::ConcurrentModification));
        assert_eq!(seen.get(), 1);
        assert_eq!(m.len(), 4);
    }

    /// Invariant: `compute` whose function inserts another key applies
    /// nothing and reports a conflict.
    #[test]
    fn compute_detects_structural_change() {
        let m = abc();
        let r = m.compute("a".to_string(), |_, v| {
            m.insert("q".to_string(), 0);
            v.map(|v| v + 100)
        });
        assert_eq!(r, Err(MapError::ConcurrentModification));
        assert_eq!(m.get("a"), Some(1));
    }

    /// Invariant: `merge` inserts when absent, combines when present and
    /// removes on `None`.
    #[test]
    fn merge_outcomes() {
        let m = abc();
        assert_eq!(m.merge("n".to_string(), 5, |_, _| unreachable!()), Ok(Some(5)));
        assert_eq!(m.merge("a".to_string(), 5, |old, new| Some(old + new)), Ok(Some(6)));
        assert_eq!(m.merge("b".to_string(), 5, |_, _| None), Ok(None));
        assert!(!m.contains_key("b"));
        assert_eq!(m.keys_vec(), ["a", "c", "n"]);
    }

    /// Invariant: `compute_if_absent` does not call `f` for present keys
    /// and stores nothing when `f` yields `None`.
    #[test]
    fn compute_if_absent_outcomes() {
        let m = abc();
        let calls = Cell::new(0);
        let r = m.compute_if_absent("a".to_string(), |_| {
            calls.set(calls.get() + 1);
            Some(9)
        });
        assert_eq!(r, Ok(Some(1)));
        assert_eq!(calls.get(), 0);
        assert_eq!(m.compute_if_absent("z".to_string(), |_| None), Ok(None));
        assert!(!m.contains_key("z"));
        assert_eq!(m.compute_if_absent("z".to_string(), |k| Some(k.len() as i32)), Ok(Some(1)));
        assert_eq!(m.get("z"), Some(1));
    }

    /// Invariant: `compute_if_present` ignores absent keys and removes on
    /// `None`.
    #[test]
    fn compute_if_present_outcomes() {
        let m = abc();
        assert_eq!(m.compute_if_present("zz", |_, _| Some(1)), Ok(None));
        assert!(!m.contains_key("zz"));
        assert_eq!(m.compute_if_present("a", |_, v| Some(v + 1)), Ok(Some(2)));
        assert_eq!(m.compute_if_present("a", |_, _| None), Ok(None));
        assert_eq!(m.keys_vec(), ["b", "c"]);
    }

    /// Invariant: access order moves used entries to the end; membership
    /// tests do not count as a use.
    #[test]
    fn access_order_moves_used_entries() {
        let m = LinkedHashMap::access_ordered();
        for (i, k) in ["a", "b", "c"].iter().enumerate() {
            m.insert(k.to_string(), i);
        }
        assert_eq!(m.get("a"), Some(0));
        assert_eq!(m.keys_vec(), ["b", "c", "a"]);
        m.insert("b".to_string(), 10);
        assert_eq!(m.keys_vec(), ["c", "a", "b"]);
        assert!(m.contains_key("c"));
        assert_eq!(m.keys_vec(), ["c", "a", "b"]);
        assert_eq!(m.order(), AccessOrder::Access);
    }

    /// Invariant: `insert_if_absent` and `replace` keep the other case alone.
    #[test]
    fn insert_if_absent_and_replace() {
        let m = abc();
        assert_eq!(m.insert_if_absent("a".to_string(), 100), Some(1));
        assert_eq!(m.get("a"), Some(1));
        assert_eq!(m.insert_if_absent("d".to_string(), 4), None);
        assert_eq!(m.replace("zz", 1), None);
        assert!(!m.contains_key("zz"));
        assert_eq!(m.replace("d", 40), Some(4));
        assert_eq!(m.get("d"), Some(40));
    }

    /// Invariant: `remove_all` and `retain_all` report how many entries left.
    #[test]
    fn remove_all_and_retain_all() {
        let m = abc();
        m.insert("d".to_string(), 4);
        assert_eq!(m.remove_all(["a", "zz"].into_iter()), 1);
        let keep = vec!["b".to_string(), "q".to_string()];
        assert_eq!(m.retain_all(&keep), Ok(2));
        assert_eq!(m.keys_vec(), ["b"]);
    }

    /// Invariant: `contains_value` scans values, `Debug` prints in order.
    #[test]
    fn contains_value_and_debug() {
        let m = abc();
        assert!(m.contains_value(&2));
        assert!(!m.contains_value(&7));
        assert_eq!(format!("{m:?}"), r#"{"a": 1, "b": 2, "c": 3}"#);
    }
}
