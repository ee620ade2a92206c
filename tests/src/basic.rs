use magpie::{config, CuckooError, CuckooMap};

#[test]
fn sizing_from_capacity_hint() {
    let map: CuckooMap<u64, u64> = CuckooMap::with_capacity(16);
    assert_eq!(map.hashpower(), 2);
    assert_eq!(map.bucket_count(), 4);
    assert_eq!(map.slot_per_bucket(), 4);
    assert_eq!(map.capacity(), 16);
    assert!(map.is_empty());
    assert_eq!(map.len(), 0);
}

#[test]
fn insert_find_erase_cycle() {
    let map = CuckooMap::with_capacity(16);
    assert!(map.insert(1u64, "a".to_string()).unwrap());
    assert!(map.insert(2u64, "b".to_string()).unwrap());
    assert!(map.insert(3u64, "c".to_string()).unwrap());
    assert_eq!(map.len(), 3);
    assert_eq!(map.find(&2).as_deref(), Some("b"));
    assert!(map.erase(&1));
    assert_eq!(map.find(&1), None);
    assert!(!map.erase(&1));
    assert_eq!(map.len(), 2);
}

#[test]
fn insert_then_find_returns_value() {
    let map = CuckooMap::with_capacity(16);
    for i in 0..10u64 {
        assert!(map.insert(i, i * 7).unwrap());
    }
    for i in 0..10u64 {
        assert_eq!(map.find(&i), Some(i * 7));
    }
}

#[test]
fn erased_key_stays_gone() {
    let map = CuckooMap::with_capacity(16);
    map.insert(5u64, 50u64).unwrap();
    assert!(map.erase(&5));
    assert_eq!(map.find(&5), None);
    assert!(!map.contains(&5));
}

#[test]
fn clear_empties_the_table() {
    let map = CuckooMap::with_capacity(64);
    for i in 0..30u64 {
        map.insert(i, i).unwrap();
    }
    map.clear();
    assert_eq!(map.len(), 0);
    assert!(map.is_empty());
    for i in 0..30u64 {
        assert!(!map.contains(&i));
    }
    // The table is still usable afterwards.
    assert!(map.insert(1u64, 2u64).unwrap());
    assert_eq!(map.len(), 1);
}

#[test]
fn duplicate_insert_keeps_existing_value() {
    let map = CuckooMap::with_capacity(16);
    assert!(map.insert(9u64, 1u64).unwrap());
    assert!(!map.insert(9u64, 2u64).unwrap());
    assert_eq!(map.find(&9), Some(1));
    assert_eq!(map.len(), 1);
}

#[test]
fn upsert_inserts_then_mutates() {
    let map = CuckooMap::with_capacity(16);
    assert!(map.upsert(3u64, |v| *v += 5, 10u64).unwrap());
    assert_eq!(map.find(&3), Some(10));
    assert!(!map.upsert(3u64, |v| *v += 5, 10u64).unwrap());
    assert_eq!(map.find(&3), Some(15));
}

#[test]
fn find_fn_reads_without_cloning() {
    let map = CuckooMap::with_capacity(16);
    map.insert("key".to_string(), vec![1, 2, 3]).unwrap();
    let mut sum = 0;
    assert!(map.find_fn("key", |v| sum = v.iter().sum()));
    assert_eq!(sum, 6);
    assert!(!map.find_fn("missing", |_| panic!("must not run")));
}

#[test]
fn update_fn_mutates_in_place() {
    let map = CuckooMap::with_capacity(16);
    map.insert(1u64, String::from("x")).unwrap();
    assert!(map.update_fn(&1, |v| v.push('y')));
    assert_eq!(map.find(&1).as_deref(), Some("xy"));
    assert!(!map.update_fn(&2, |_| ()));
}

#[test]
fn update_overwrites_only_existing() {
    let map = CuckooMap::with_capacity(16);
    map.insert(1u64, 1u64).unwrap();
    assert!(map.update(&1, 100));
    assert_eq!(map.find(&1), Some(100));
    assert!(!map.update(&2, 100));
    assert!(!map.contains(&2));
}

#[test]
fn erase_fn_respects_predicate() {
    let map = CuckooMap::with_capacity(16);
    map.insert(1u64, 10u64).unwrap();
    assert!(map.erase_fn(&1, |v| *v > 50));
    assert!(map.contains(&1));
    assert!(map.erase_fn(&1, |v| *v == 10));
    assert!(!map.contains(&1));
    assert!(!map.erase_fn(&1, |_| true));
}

#[test]
fn heterogeneous_lookup_by_str() {
    let map = CuckooMap::with_capacity(16);
    map.insert(String::from("alpha"), 1u64).unwrap();
    assert!(map.contains("alpha"));
    assert_eq!(map.find("alpha"), Some(1));
    assert!(map.erase("alpha"));
}

#[test]
fn invalid_minimum_load_factor_is_rejected() {
    let map: CuckooMap<u64, u64> = CuckooMap::with_capacity(16);
    assert!(matches!(
        map.set_minimum_load_factor(1.01),
        Err(CuckooError::InvalidArgument(_))
    ));
    assert!(matches!(
        map.set_minimum_load_factor(-0.5),
        Err(CuckooError::InvalidArgument(_))
    ));
    assert!(map.set_minimum_load_factor(0.5).is_ok());
    assert_eq!(map.minimum_load_factor(), 0.5);
}

#[test]
fn maximum_hashpower_below_current_is_rejected() {
    let map: CuckooMap<u64, u64> = CuckooMap::with_capacity(16);
    assert_eq!(map.hashpower(), 2);
    assert!(matches!(
        map.set_maximum_hashpower(1),
        Err(CuckooError::InvalidArgument(_))
    ));
    assert!(map.set_maximum_hashpower(5).is_ok());
    assert_eq!(map.maximum_hashpower(), 5);
}

#[test]
fn config_defaults() {
    let map: CuckooMap<u64, u64> = CuckooMap::with_capacity(16);
    assert_eq!(
        map.minimum_load_factor(),
        config::DEFAULT_MINIMUM_LOAD_FACTOR
    );
    assert_eq!(map.maximum_hashpower(), config::NO_MAXIMUM_HASHPOWER);
}

#[test]
fn load_factor_tracks_size() {
    let map = CuckooMap::with_capacity(16);
    assert_eq!(map.load_factor(), 0.0);
    for i in 0..8u64 {
        map.insert(i, i).unwrap();
    }
    assert!((map.load_factor() - 0.5).abs() < 1e-9);
}

#[test]
fn from_iterator_and_extend() {
    let mut map: CuckooMap<u64, u64> = (0..50u64).map(|i| (i, i + 1)).collect();
    assert_eq!(map.len(), 50);
    map.extend((50..60u64).map(|i| (i, i + 1)));
    assert_eq!(map.len(), 60);
    for i in 0..60u64 {
        assert_eq!(map.find(&i), Some(i + 1));
    }
}

#[test]
fn drop_runs_value_destructors() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Tracked(Arc<AtomicUsize>);
    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    let drops = Arc::new(AtomicUsize::new(0));
    {
        let map = CuckooMap::with_capacity(64);
        for i in 0..20u64 {
            map.insert(i, Tracked(drops.clone())).unwrap();
        }
        // A duplicate insert drops the rejected value immediately.
        assert!(!map.insert(0u64, Tracked(drops.clone())).unwrap());
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }
    assert_eq!(drops.load(Ordering::SeqCst), 21);
}
