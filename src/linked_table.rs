//! LinkedTable: structural layer with stable handles, linked iteration
//! order and a modification counter.
//!
//! The table owns no hasher. Callers hash keys themselves and pass the
//! hash plus an equality check; the hash is stored per entry and reused
//! whenever the index grows, so user `Hash` code never runs inside the
//! table. This is what lets the weak-keyed map keep entries whose key can
//! no longer be hashed.

use crate::mod_count::{ExpectedModCount, ModCount};
use hashbrown::HashTable;
use slotmap::{DefaultKey, SlotMap};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub(crate) struct Handle(DefaultKey);

#[derive(Debug)]
struct Node<K, V> {
    key: K,
    value: V,
    hash: u64,
    prev: Option<DefaultKey>,
    next: Option<DefaultKey>,
}

pub(crate) struct LinkedTable<K, V> {
    index: HashTable<DefaultKey>,
    slots: SlotMap<DefaultKey, Node<K, V>>, // storage using generational keys
    head: Option<DefaultKey>,
    tail: Option<DefaultKey>,
    mod_count: ModCount,
}

impl<K, V> Default for LinkedTable<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over entries in link order.
pub(crate) struct Iter<'a, K, V> {
    slots: &'a SlotMap<DefaultKey, Node<K, V>>,
    cursor: Option<DefaultKey>,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (Handle, &'a K, &'a V);
    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        let k = self.cursor?;
        let node = self.slots.get(k)?;
        self.cursor = node.next;
        Some((Handle(k), &node.key, &node.value))
    }
}

impl<K, V> LinkedTable<K, V> {
    pub(crate) fn new() -> Self {
        Self::with_capacity(0)
    }

    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            index: HashTable::with_capacity(capacity),
            slots: SlotMap::with_capacity_and_key(capacity),
            head: None,
            tail: None,
            mod_count: ModCount::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub(crate) fn mod_count(&self) -> u64 {
        self.mod_count.get()
    }

    pub(crate) fn expect(&self) -> ExpectedModCount {
        self.mod_count.expect()
    }

    pub(crate) fn reserve(&mut self, additional: usize) {
        let slots = &self.slots;
        self.index
            .reserve(additional, |&k| slots.get(k).map(|n| n.hash).unwrap_or(0));
        self.slots.reserve(additional);
    }

    pub(crate) fn find(&self, hash: u64, mut eq: impl FnMut(&K) -> bool) -> Option<Handle> {
        let slots = &self.slots;
        self.index
            .find(hash, |&k| slots.get(k).map(|n| eq(&n.key)).unwrap_or(false))
            .map(|&k| Handle(k))
    }

    /// Append a new entry at the tail. The caller has already checked
    /// that no equal key is present.
    pub(crate) fn insert_new(&mut self, hash: u64, key: K, value: V) -> Handle {
        let prev = self.tail;
        let k = self.slots.insert(Node {
            key,
            value,
            hash,
            prev,
            next: None,
        });
        match prev.and_then(|t| self.slots.get_mut(t)) {
            Some(tail) => tail.next = Some(k),
            None => self.head = Some(k),
        }
        self.tail = Some(k);
        let slots = &self.slots;
        self.index
            .insert_unique(hash, k, |&kk| slots.get(kk).map(|n| n.hash).unwrap_or(0));
        self.mod_count.bump();
        Handle(k)
    }

    pub(crate) fn remove(&mut self, handle: Handle) -> Option<(K, V)> {
        let kv = self.unlink_node(handle)?;
        self.mod_count.bump();
        Some(kv)
    }

    fn unlink_node(&mut self, handle: Handle) -> Option<(K, V)> {
        let k = handle.0;
        let node = self.slots.remove(k)?;
        if let Ok(entry) = self.index.find_entry(node.hash, |&kk| kk == k) {
            entry.remove();
        }
        self.unlink(node.prev, node.next);
        Some((node.key, node.value))
    }

    /// Move an entry to the tail. Counts as a structural change even when
    /// the entry already is the tail, so every use trips open traversals.
    pub(crate) fn move_to_back(&mut self, handle: Handle) {
        let k = handle.0;
        let Some(node) = self.slots.get(k) else {
            return;
        };
        if self.tail != Some(k) {
            let (prev, next) = (node.prev, node.next);
            self.unlink(prev, next);
            let old_tail = self.tail;
            if let Some(node) = self.slots.get_mut(k) {
                node.prev = old_tail;
                node.next = None;
            }
            match old_tail.and_then(|t| self.slots.get_mut(t)) {
                Some(tail) => tail.next = Some(k),
                None => self.head = Some(k),
            }
            self.tail = Some(k);
        }
        self.mod_count.bump();
    }

    /// Remove every entry and hand them back so the caller can drop them
    /// outside of any borrow or lock. An empty table is left untouched.
    pub(crate) fn drain_all(&mut self) -> Vec<(K, V)> {
        if self.slots.is_empty() {
            return Vec::new();
        }
        self.index.clear();
        self.head = None;
        self.tail = None;
        self.mod_count.bump();
        self.slots.drain().map(|(_, n)| (n.key, n.value)).collect()
    }

    /// Keep only entries for which `keep` returns true; removed entries are
    /// returned in link order.
    pub(crate) fn retain(&mut self, mut keep: impl FnMut(&K, &mut V) -> bool) -> Vec<(K, V)> {
        let mut removed = Vec::new();
        let mut cursor = self.head;
        while let Some(k) = cursor {
            let Some(node) = self.slots.get_mut(k) else {
                break;
            };
            cursor = node.next;
            if !keep(&node.key, &mut node.value) {
                if let Some(kv) = self.remove(Handle(k)) {
                    removed.push(kv);
                }
            }
        }
        removed
    }

    /// Unlink entries for which `keep` returns false without bumping the
    /// modification counter. Only for entries that already vanished from
    /// every view, such as weak entries whose key died.
    pub(crate) fn expunge(&mut self, mut keep: impl FnMut(&K, &V) -> bool) -> Vec<(K, V)> {
        let mut removed = Vec::new();
        let mut cursor = self.head;
        while let Some(k) = cursor {
            let Some(node) = self.slots.get(k) else {
                break;
            };
            cursor = node.next;
            if !keep(&node.key, &node.value) {
                if let Some(kv) = self.unlink_node(Handle(k)) {
                    removed.push(kv);
                }
            }
        }
        removed
    }

    /// Visit every value mutably in link order. Not a structural change.
    pub(crate) fn for_each_value_mut(&mut self, mut f: impl FnMut(&K, &mut V)) {
        let mut cursor = self.head;
        while let Some(k) = cursor {
            let Some(node) = self.slots.get_mut(k) else {
                break;
            };
            cursor = node.next;
            f(&node.key, &mut node.value);
        }
    }

    pub(crate) fn get(&self, h: Handle) -> Option<(&K, &V)> {
        self.slots.get(h.0).map(|n| (&n.key, &n.value))
    }

    #[cfg(test)]
    pub(crate) fn key(&self, h: Handle) -> Option<&K> {
        self.slots.get(h.0).map(|n| &n.key)
    }

    pub(crate) fn value(&self, h: Handle) -> Option<&V> {
        self.slots.get(h.0).map(|n| &n.value)
    }

    pub(crate) fn value_mut(&mut self, h: Handle) -> Option<&mut V> {
        self.slots.get_mut(h.0).map(|n| &mut n.value)
    }

    /// Swap in a new value for an existing entry. Not a structural change.
    pub(crate) fn replace_value(&mut self, h: Handle, value: V) -> Option<V> {
        self.value_mut(h).map(|slot| core::mem::replace(slot, value))
    }

    pub(crate) fn head(&self) -> Option<Handle> {
        self.head.map(Handle)
    }

    pub(crate) fn next_of(&self, h: Handle) -> Option<Handle> {
        self.slots.get(h.0).and_then(|n| n.next).map(Handle)
    }

    pub(crate) fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            slots: &self.slots,
            cursor: self.head,
        }
    }

    pub(crate) fn contains_handle(&self, h: Handle) -> bool {
        self.slots.contains_key(h.0)
    }

    fn unlink(&mut self, prev: Option<DefaultKey>, next: Option<DefaultKey>) {
        match prev.and_then(|p| self.slots.get_mut(p)) {
            Some(p) => p.next = next,
            None => self.head = next,
        }
        match next.and_then(|n| self.slots.get_mut(n)) {
            Some(n) => n.prev = prev,
            None => self.tail = prev,
        }
    }
}
