//! Per-thread record of the maps whose `compute` callback is running on
//! this thread.
//!
//! While a callback runs, its map holds one shard upgradable-read locked.
//! Reads from the callback must not queue behind writers waiting on that
//! shard, and writes from it would wait on the callback itself. The map
//! consults this record to read recursively in the first case and to
//! panic instead of hanging in the second.

use std::cell::RefCell;

thread_local!(static ACTIVE: RefCell<Vec<usize>> = RefCell::new(Vec::new()));

/// Marks `map` as running a callback on this thread until dropped.
pub(crate) struct ComputeScope {
    map: usize,
}

impl ComputeScope {
    pub(crate) fn enter<T>(map: &T) -> ComputeScope {
        let map = map as *const T as usize;
        ACTIVE.with(|active| active.borrow_mut().push(map));
        ComputeScope { map }
    }

    pub(crate) fn is_active<T>(map: &T) -> bool {
        let map = map as *const T as usize;
        ACTIVE.with(|active| active.borrow().contains(&map))
    }
}

impl Drop for ComputeScope {
    fn drop(&mut self) {
        let _ = ACTIVE.try_with(|active| {
            let mut active = active.borrow_mut();
            if let Some(i) = active.iter().rposition(|&m| m == self.map) {
                active.remove(i);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scopes_nest_and_unwind() {
        let (a, b) = (1u8, 2u8);
        assert!(!ComputeScope::is_active(&a));
        {
            let _outer = ComputeScope::enter(&a);
            {
                let _inner = ComputeScope::enter(&b);
                assert!(ComputeScope::is_active(&a));
                assert!(ComputeScope::is_active(&b));
            }
            assert!(ComputeScope::is_active(&a));
            assert!(!ComputeScope::is_active(&b));
        }
        assert!(!ComputeScope::is_active(&a));
    }

    #[test]
    fn scope_is_per_thread() {
        let a = 0u64;
        let _scope = ComputeScope::enter(&a);
        let addr = &a as *const u64 as usize;
        let seen = std::thread::spawn(move || {
            ACTIVE.with(|active| active.borrow().contains(&addr))
        })
        .join()
        .unwrap();
        assert!(!seen);
    }
}
