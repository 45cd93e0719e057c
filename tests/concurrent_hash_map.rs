// ConcurrentHashMap integration suite.
//
// Invariants exercised:
// - Readers never fail and never see a torn entry while writers insert
//   and remove on other keys.
// - Per-key atomicity of `compute`/`merge` under contention.
// - Snapshots are internally consistent: no duplicated keys.
// - No callback can hang the map: compute callbacks may read it and
//   panic if they write it; bulk callbacks may do both.
use failfast_map::{ConcurrentHashMap, MapConfig};
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

fn one_shard<V>() -> Arc<ConcurrentHashMap<u32, V>> {
    let config = MapConfig::default().with_shards(1).unwrap();
    Arc::new(ConcurrentHashMap::with_config(config))
}

// Run `f` on its own thread and fail the test if it does not return in
// time, so a deadlock shows up as a failure instead of a hang.
fn finishes<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> T {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(f());
    });
    rx.recv_timeout(Duration::from_secs(10))
        .expect("map operation did not return")
}

// Value derived from the key so a reader can tell a whole entry from a
// mixed-up one.
fn value_for(k: u64) -> (u64, String) {
    (k.wrapping_mul(31), format!("v{k}"))
}

fn is_whole(k: u64, v: &(u64, String)) -> bool {
    *v == value_for(k)
}

// Test: writers cycle insert/remove on disjoint key ranges while readers
// take unbounded `values`, `to_vec` and `iter` snapshots.
// Verifies: no reader panics, every observed entry is whole, no snapshot
// holds a key twice, and the map ends empty.
#[test]
fn snapshots_race_with_disjoint_writers() {
    const WRITERS: u64 = 4;
    const KEYS_PER_WRITER: u64 = 250;
    const ROUNDS: usize = 20;

    let config = MapConfig::default().with_shards(8).unwrap();
    let m: ConcurrentHashMap<u64, (u64, String)> = ConcurrentHashMap::with_config(config);
    let done = AtomicBool::new(false);
    let snapshots = AtomicUsize::new(0);

    thread::scope(|s| {
        for _ in 0..3 {
            s.spawn(|| {
                while !done.load(Ordering::Acquire) {
                    for (k, v) in m.to_vec() {
                        assert!(is_whole(k, &v), "torn entry for {k}");
                    }
                    let keys: Vec<u64> = m.iter().map(|(k, _)| k).collect();
                    let unique: HashSet<u64> = keys.iter().copied().collect();
                    assert_eq!(unique.len(), keys.len(), "duplicated key in snapshot");
                    for (n, text) in m.values() {
                        assert_eq!(text, format!("v{}", n / 31));
                    }
                    snapshots.fetch_add(1, Ordering::Relaxed);
                }
            });
        }

        let writers: Vec<_> = (0..WRITERS)
            .map(|w| {
                let m = &m;
                s.spawn(move || {
                    let range = w * KEYS_PER_WRITER..(w + 1) * KEYS_PER_WRITER;
                    for _ in 0..ROUNDS {
                        for k in range.clone() {
                            assert_eq!(m.insert(k, value_for(k)), None);
                        }
                        for k in range.clone() {
                            assert_eq!(m.remove(&k), Some(value_for(k)));
                        }
                    }
                })
            })
            .collect();
        for w in writers {
            w.join().unwrap();
        }
        done.store(true, Ordering::Release);
    });

    assert!(m.is_empty());
    assert!(m.to_vec().is_empty());
    assert!(snapshots.load(Ordering::Relaxed) > 0);
}

// Test: contended compute on a handful of keys.
// Verifies: no increment is lost.
#[test]
fn compute_is_atomic_per_key() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 500;

    let m = Arc::new(ConcurrentHashMap::<u8, usize>::new());
    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let m = Arc::clone(&m);
            thread::spawn(move || {
                for i in 0..PER_THREAD {
                    let k = ((t + i) % 4) as u8;
                    m.compute(k, |_, v| Some(v.map_or(1, |n| n + 1)));
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    let total: usize = m.values().into_iter().sum();
    assert_eq!(total, THREADS * PER_THREAD);
    assert_eq!(m.len(), 4);
}

// Test: merge as a concurrent counter.
// Verifies: all contributions land and a final merge to None removes.
#[test]
fn merge_accumulates_across_threads() {
    let m: ConcurrentHashMap<&'static str, u64> = ConcurrentHashMap::new();
    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                for _ in 0..1000 {
                    m.merge("hits", 1, |a, b| Some(a + b));
                }
            });
        }
    });
    assert_eq!(m.get("hits"), Some(4000));
    assert_eq!(m.merge("hits", 0, |_, _| None), None);
    assert!(m.is_empty());
}

// Test: replace_all and remove_if under concurrent readers.
// Verifies: bulk operations never fail and leave a consistent map.
#[test]
fn bulk_operations_with_readers() {
    let m: ConcurrentHashMap<u32, u32> = (0..1000).map(|i| (i, i)).collect();
    thread::scope(|s| {
        s.spawn(|| {
            for _ in 0..50 {
                let n = m.keys().len();
                assert!(n <= 1000);
            }
        });
        m.replace_all(|k, v| k + v);
        assert_eq!(m.remove_if(|k, _| k % 10 != 0), 900);
    });
    assert_eq!(m.len(), 100);
    assert!(m.to_vec().iter().all(|(k, v)| *v == 2 * k));
}

// Test: a compute callback that reads another key on the same shard.
// Verifies: the call returns, sees the other key's value, and stores the
// computed result.
#[test]
fn compute_callback_may_read_same_shard() {
    let m = one_shard::<u32>();
    m.insert(1, 10);
    m.insert(2, 5);
    let r = finishes({
        let m = Arc::clone(&m);
        move || m.compute(1, |_, v| Some(v.copied().unwrap_or(0) + m.get(&2).unwrap_or(0)))
    });
    assert_eq!(r, Some(15));
    let r = finishes({
        let m = Arc::clone(&m);
        move || {
            m.merge(3, 1, |_, _| unreachable!());
            m.merge(3, 1, |a, b| Some(a + b + m.values().len() as u32))
        }
    });
    assert_eq!(r, Some(5));
    assert_eq!(m.get(&1), Some(15));
}

// Test: compute callbacks read while another thread writes the shard.
// Verifies: a writer queued behind the callback does not block the
// callback's own reads, and no increment is lost.
#[test]
fn compute_reads_with_queued_writer() {
    let m = one_shard::<u64>();
    m.insert(0, 0);
    m.insert(1, 1);
    finishes({
        let m = Arc::clone(&m);
        move || {
            thread::scope(|s| {
                s.spawn(|| {
                    for i in 0..2000u32 {
                        m.insert(100 + i % 50, u64::from(i));
                    }
                });
                for _ in 0..2000 {
                    m.compute(0, |_, v| {
                        let one = m.get(&1).unwrap_or(0);
                        Some(v.copied().unwrap_or(0) + one)
                    });
                }
            });
        }
    });
    assert_eq!(m.get(&0), Some(2000));
}

// Test: a compute callback that writes to its own map.
// Verifies: the call panics instead of hanging, nothing is applied, and
// the map stays fully usable from every thread afterwards.
#[test]
fn compute_callback_writing_panics() {
    let m = one_shard::<u32>();
    m.insert(1, 1);
    let outcome = finishes({
        let m = Arc::clone(&m);
        move || {
            panic::catch_unwind(AssertUnwindSafe(|| {
                m.compute(1, |_, _| {
                    m.insert(2, 2);
                    Some(100)
                })
            }))
            .is_err()
        }
    });
    assert!(outcome);
    assert_eq!(m.get(&1), Some(1));
    assert!(!m.contains_key(&2));
    finishes({
        let m = Arc::clone(&m);
        move || m.insert(2, 2)
    });
    assert_eq!(m.compute_if_present(&2, |_, v| Some(v * 10)), Some(20));
}

// Test: bulk-operation callbacks that read and write the same map.
// Verifies: none of them hang; results applied only where the entry
// still held the value the callback saw.
#[test]
fn bulk_callbacks_may_use_the_map() {
    let m = one_shard::<u32>();
    for i in 0..10 {
        m.insert(i, i);
    }
    finishes({
        let m = Arc::clone(&m);
        move || {
            // Bumps key 9 before it is visited, so its transform reruns on
            // the new value.
            m.replace_all(|k, v| {
                if *k == 0 {
                    m.insert(9, 90);
                    m.insert(50, 0);
                }
                v + m.get(&0).map_or(0, |_| 1)
            });
        }
    });
    assert_eq!(m.get(&0), Some(1));
    assert_eq!(m.get(&9), Some(91));

    finishes({
        let m = Arc::clone(&m);
        move || {
            let removed = m.remove_if(|k, _| {
                if *k == 1 {
                    m.insert(2, 0);
                }
                *k < 3
            });
            // Key 2 changed under the predicate and is kept.
            assert_eq!(removed, 2);
        }
    });
    assert_eq!(m.get(&2), Some(0));
    assert!(!m.contains_key(&1));

    finishes({
        let m = Arc::clone(&m);
        move || {
            let mut seen = 0;
            m.for_each(|k, _| {
                m.remove(k);
                seen += 1;
            });
            seen
        }
    });
    assert!(m.is_empty());
}

// Test: `iter()` while its shards are cleared mid-traversal.
// Verifies: the iterator keeps yielding whole entries from the shard it
// already copied, never repeats a key, and then ends.
#[test]
fn iter_survives_clear_mid_traversal() {
    let m = one_shard::<String>();
    for i in 0..100u32 {
        m.insert(i, format!("v{i}"));
    }
    let mut it = m.iter();
    let first = it.next().unwrap();
    m.clear();
    assert!(m.is_empty());
    let rest: Vec<(u32, String)> = it.collect();
    assert_eq!(rest.len() + 1, 100);
    assert!(rest.iter().chain([&first]).all(|(k, v)| *v == format!("v{k}")));

    let config = MapConfig::default().with_shards(8).unwrap();
    let m: ConcurrentHashMap<u32, String> = ConcurrentHashMap::with_config(config);
    for i in 0..1000u32 {
        m.insert(i, format!("v{i}"));
    }
    let mut it = m.iter();
    let first = it.next().unwrap();
    m.clear();
    m.insert(5000, "v5000".to_string());
    let mut seen = HashSet::from([first.0]);
    for (k, v) in it {
        assert_eq!(v, format!("v{k}"));
        assert!(seen.insert(k), "key {k} yielded twice");
    }
    assert!(seen.len() < 1000);
    assert_eq!(m.len(), 1);
}
