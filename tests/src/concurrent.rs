use magpie::CuckooMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

#[test]
fn counter_updates_are_not_lost() {
    let map = Arc::new(CuckooMap::with_capacity(16));
    map.insert(1u64, 0u64).unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let map = Arc::clone(&map);
        handles.push(thread::spawn(move || {
            for _ in 0..10_000 {
                assert!(map.update_fn(&1, |v| *v += 1));
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(map.find(&1), Some(80_000));
}

#[test]
fn same_key_races_to_one_winner() {
    let map = Arc::new(CuckooMap::with_capacity(16));
    let winners = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for tid in 0..8u64 {
        let map = Arc::clone(&map);
        let winners = Arc::clone(&winners);
        handles.push(thread::spawn(move || {
            if map.insert(42u64, tid).unwrap() {
                winners.fetch_add(1, Ordering::SeqCst);
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(winners.load(Ordering::SeqCst), 1);
    assert_eq!(map.len(), 1);
    assert!(map.find(&42).unwrap() < 8);
}

#[test]
fn disjoint_inserts_from_many_threads() {
    // Small initial table so the inserts drive several expansions while
    // other threads keep inserting.
    let map = Arc::new(CuckooMap::with_capacity(64));
    let mut handles = Vec::new();
    for t in 0..8u64 {
        let map = Arc::clone(&map);
        handles.push(thread::spawn(move || {
            for i in 0..1000u64 {
                let key = t * 1000 + i;
                assert!(map.insert(key, key * 2).unwrap());
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(map.len(), 8000);
    for key in 0..8000u64 {
        assert_eq!(map.find(&key), Some(key * 2));
    }
}

#[test]
fn upsert_races_count_every_operation() {
    let map = Arc::new(CuckooMap::with_capacity(64));
    let mut handles = Vec::new();
    for _ in 0..4 {
        let map = Arc::clone(&map);
        handles.push(thread::spawn(move || {
            for i in 0..1000u64 {
                // Whether this thread inserts the key or bumps an existing
                // entry, it contributes exactly 1 to the total.
                map.upsert(i % 100, |v| *v += 1, 1u64).unwrap();
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    let total: u64 = (0..100u64).map(|k| map.find(&k).unwrap()).sum();
    assert_eq!(total, 4000);
}

#[test]
fn readers_see_all_keys_across_resizes() {
    let map = Arc::new(CuckooMap::with_capacity(4096));
    for i in 0..1000u64 {
        map.insert(i, i).unwrap();
    }
    let base_hp = map.hashpower();

    let mut handles = Vec::new();
    for t in 0..7u64 {
        let map = Arc::clone(&map);
        handles.push(thread::spawn(move || {
            let mut k = t * 131;
            for _ in 0..20_000 {
                k = (k + 997) % 1000;
                // Keys are never erased, so a miss would mean a reader
                // observed a half-migrated table.
                assert!(map.contains(&k));
            }
        }));
    }
    let resizer = {
        let map = Arc::clone(&map);
        thread::spawn(move || {
            for _ in 0..6 {
                map.rehash(base_hp + 1).unwrap();
                map.rehash(base_hp).unwrap();
            }
        })
    };
    for h in handles {
        h.join().unwrap();
    }
    resizer.join().unwrap();
    assert_eq!(map.len(), 1000);
    for i in 0..1000u64 {
        assert_eq!(map.find(&i), Some(i));
    }
}

#[test]
fn mixed_insert_and_erase_converges() {
    let map = Arc::new(CuckooMap::with_capacity(256));
    for i in 0..500u64 {
        map.insert(i, i).unwrap();
    }
    let eraser = {
        let map = Arc::clone(&map);
        thread::spawn(move || {
            for i in 0..500u64 {
                assert!(map.erase(&i));
            }
        })
    };
    let inserter = {
        let map = Arc::clone(&map);
        thread::spawn(move || {
            for i in 500..1000u64 {
                assert!(map.insert(i, i).unwrap());
            }
        })
    };
    eraser.join().unwrap();
    inserter.join().unwrap();
    assert_eq!(map.len(), 500);
    for i in 0..500u64 {
        assert!(!map.contains(&i));
        assert!(map.contains(&(i + 500)));
    }
}

#[test]
fn lock_table_blocks_concurrent_writers() {
    let map = Arc::new(CuckooMap::with_capacity(64));
    map.insert(1u64, 1u64).unwrap();

    let writer = {
        let map = Arc::clone(&map);
        let lt = map.lock_table();
        let handle = thread::spawn({
            let map = Arc::clone(&map);
            move || {
                // Blocks until the view below is dropped.
                map.insert(2u64, 2u64).unwrap();
            }
        });
        // Give the writer a moment to start spinning on the stripes.
        thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(lt.len(), 1);
        assert!(!lt.contains(&2));
        drop(lt);
        handle
    };
    writer.join().unwrap();
    assert!(map.contains(&2));
}
