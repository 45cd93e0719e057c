//! Keys compared by identity instead of by value.
//!
//! `IdentityKey` wraps an `Arc<T>` and hashes and compares by the address
//! of the allocation, so two equal but distinct values are two keys, and
//! `T` needs neither `Eq` nor `Hash`. `IdentityHashMap` is a
//! `LinkedHashMap` keyed this way; it keeps every fail-fast contract of the
//! underlying map.

use crate::linked_hash_map::LinkedHashMap;
use core::fmt;
use core::hash::{Hash, Hasher};
use core::ops::Deref;
use std::collections::hash_map::RandomState;
use std::sync::Arc;

/// A shared reference that compares and hashes like a pointer.
pub struct IdentityKey<T: ?Sized>(Arc<T>);

impl<T: ?Sized> IdentityKey<T> {
    pub fn new(value: Arc<T>) -> Self {
        IdentityKey(value)
    }

    pub fn as_arc(&self) -> &Arc<T> {
        &self.0
    }

    pub fn into_inner(self) -> Arc<T> {
        self.0
    }

    fn addr(&self) -> *const () {
        Arc::as_ptr(&self.0) as *const ()
    }
}

impl<T: ?Sized> Clone for IdentityKey<T> {
    fn clone(&self) -> Self {
        IdentityKey(Arc::clone(&self.0))
    }
}

impl<T: ?Sized> PartialEq for IdentityKey<T> {
    fn eq(&self, rhs: &Self) -> bool {
        self.addr() == rhs.addr()
    }
}

impl<T: ?Sized> Eq for IdentityKey<T> {}

impl<T: ?Sized> Hash for IdentityKey<T> {
    fn hash<H: Hasher>(&self, hasher: &mut H) {
        self.addr().hash(hasher)
    }
}

impl<T: ?Sized> Deref for IdentityKey<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T: ?Sized> From<Arc<T>> for IdentityKey<T> {
    fn from(value: Arc<T>) -> Self {
        IdentityKey(value)
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for IdentityKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}@{:p}", &*self.0, self.addr())
    }
}

/// Insertion- or access-ordered map whose keys match only themselves.
pub type IdentityHashMap<K, V, S = RandomState> = LinkedHashMap<IdentityKey<K>, V, S>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of<T: Hash>(t: &T) -> u64 {
        let mut h = DefaultHasher::new();
        t.hash(&mut h);
        h.finish()
    }

    #[test]
    fn equal_values_are_distinct_keys() {
        let a = IdentityKey::new(Arc::new(String::from("x")));
        let b = IdentityKey::new(Arc::new(String::from("x")));
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
        assert_eq!(hash_of(&a), hash_of(&a.clone()));
        assert_eq!(*a, *b);
    }

    #[test]
    fn unsized_targets_compare_by_address() {
        let s: Arc<str> = Arc::from("abc");
        let a = IdentityKey::from(Arc::clone(&s));
        let b = IdentityKey::from(s);
        let c: IdentityKey<str> = IdentityKey::new(Arc::from("abc"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 3);
        assert!(Arc::ptr_eq(a.as_arc(), &b.into_inner()));
    }
}
