//! Structural modification counter.
//!
//! Every table carries a `ModCount` that is bumped on each structural
//! change (new key, removal, non-empty clear, access-order move). A
//! traversal records an `ExpectedModCount` when it starts and compares it
//! against the live counter before every step. The counter wraps; a
//! traversal would need 2^64 intervening changes to miss one.

use crate::error::MapError;

/// Per-table modification counter. Embed this in structures and call
/// `bump` from every path that changes the key set.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct ModCount(u64);

impl ModCount {
    pub(crate) const fn new() -> Self {
        Self(0)
    }

    #[inline]
    pub(crate) fn bump(&mut self) {
        self.0 = self.0.wrapping_add(1);
    }

    #[inline]
    pub(crate) fn get(&self) -> u64 {
        self.0
    }

    /// Snapshot the current value for a traversal.
    #[inline]
    pub(crate) fn expect(&self) -> ExpectedModCount {
        ExpectedModCount(self.0)
    }
}

/// Snapshot held by a traversal in progress.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct ExpectedModCount(u64);

impl ExpectedModCount {
    /// Fails with `ConcurrentModification` when `live` moved past the
    /// snapshot.
    #[inline]
    pub(crate) fn check(&self, live: u64) -> Result<(), MapError> {
        if self.0 == live {
            Ok(())
        } else {
            tracing::trace!(expected = self.0, live, "fail-fast check tripped");
            Err(MapError::ConcurrentModification)
        }
    }

    /// Adopt the live value after a change the traversal made itself.
    #[inline]
    pub(crate) fn refresh(&mut self, live: u64) {
        self.0 = live;
    }
}

#[cfg(test)]
mod tests {
    use super::ModCount;
    use crate::error::MapError;

    #[test]
    fn unchanged_counter_passes() {
        let c = ModCount::new();
        let e = c.expect();
        assert_eq!(e.check(c.get()), Ok(()));
    }

    #[test]
    fn bump_trips_snapshot() {
        let mut c = ModCount::new();
        let e = c.expect();
        c.bump();
        assert_eq!(e.check(c.get()), Err(MapError::ConcurrentModification));
    }

    #[test]
    fn refresh_adopts_own_change() {
        let mut c = ModCount::new();
        let mut e = c.expect();
        c.bump();
        e.refresh(c.get());
        assert_eq!(e.check(c.get()), Ok(()));
    }

    #[test]
    fn wraps_instead_of_overflowing() {
        let mut c = ModCount(u64::MAX);
        let e = c.expect();
        c.bump();
        assert_eq!(c.get(), 0);
        assert!(e.check(c.get()).is_err());
    }
}
