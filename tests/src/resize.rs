use crate::util::{IdentityBuild, ZeroBuild};
use magpie::{CuckooError, CuckooMap};
use rand::Rng;

#[test]
fn filling_past_capacity_expands() {
    // Two buckets of four slots; the ninth insert cannot fit without
    // growing.
    let map = CuckooMap::with_capacity(8);
    assert_eq!(map.hashpower(), 1);
    for i in 0..9u64 {
        assert!(map.insert(i, i).unwrap());
    }
    assert!(map.hashpower() >= 2);
    for i in 0..9u64 {
        assert_eq!(map.find(&i), Some(i));
    }
}

#[test]
fn displacement_chain_with_identity_hash() {
    // With the identity hash and hashpower 1, even keys land in bucket 0
    // and odd keys in bucket 1. Eight inserts fill both buckets; the ninth
    // forces a cuckoo path search and then an expansion, after which every
    // key must still be reachable.
    let map = CuckooMap::with_capacity_and_hasher(8, IdentityBuild);
    assert_eq!(map.hashpower(), 1);
    for k in &[0u64, 2, 4, 6, 1, 3, 5, 7] {
        assert!(map.insert(*k, *k * 10).unwrap());
    }
    assert_eq!(map.len(), 8);
    for k in 8..16u64 {
        assert!(map.insert(k, k * 10).unwrap());
    }
    assert_eq!(map.len(), 16);
    for k in 0..16u64 {
        assert_eq!(map.find(&k), Some(k * 10));
    }
}

#[test]
fn degenerate_hash_fails_with_load_factor_too_low() {
    // Every key hashes to zero, so exactly two buckets are usable. Once
    // both are full the automatic expansion must refuse to double a table
    // that is only a quarter full.
    let map = CuckooMap::with_capacity_and_hasher(32, ZeroBuild);
    assert_eq!(map.hashpower(), 3);
    map.set_minimum_load_factor(0.5).unwrap();
    for k in 0..8u64 {
        assert!(map.insert(k, k).unwrap());
    }
    match map.insert(8u64, 8u64) {
        Err(CuckooError::LoadFactorTooLow(lf)) => assert!(lf < 0.5),
        other => panic!("expected LoadFactorTooLow, got {:?}", other),
    }
    // The failed insert must not have corrupted anything.
    assert_eq!(map.len(), 8);
    for k in 0..8u64 {
        assert_eq!(map.find(&k), Some(k));
    }
}

#[test]
fn maximum_hashpower_bounds_expansion() {
    let map = CuckooMap::with_capacity(8);
    map.set_maximum_hashpower(2).unwrap();
    let mut inserted = Vec::new();
    let mut failed = false;
    for i in 0..100u64 {
        match map.insert(i, i) {
            Ok(true) => inserted.push(i),
            Ok(false) => panic!("unexpected duplicate"),
            Err(CuckooError::MaximumHashpowerExceeded(hp)) => {
                assert_eq!(hp, 3);
                failed = true;
                break;
            }
            Err(other) => panic!("unexpected error {:?}", other),
        }
    }
    assert!(failed, "expansion should have hit the hashpower cap");
    assert!(map.hashpower() <= 2);
    // Everything that went in before the cap is intact.
    assert_eq!(map.len(), inserted.len());
    for i in &inserted {
        assert_eq!(map.find(i), Some(*i));
    }
}

#[test]
fn explicit_rehash_grows_and_shrinks() {
    let map = CuckooMap::with_capacity(16);
    for i in 0..10u64 {
        map.insert(i, i).unwrap();
    }
    let hp = map.hashpower();
    assert!(map.rehash(hp + 2).unwrap());
    assert_eq!(map.hashpower(), hp + 2);
    for i in 0..10u64 {
        assert_eq!(map.find(&i), Some(i));
    }
    assert!(map.rehash(hp).unwrap());
    assert_eq!(map.hashpower(), hp);
    for i in 0..10u64 {
        assert_eq!(map.find(&i), Some(i));
    }
    assert!(!map.rehash(hp).unwrap());
}

#[test]
fn shrink_below_fit_raises_to_smallest_that_fits() {
    let map = CuckooMap::with_capacity(4096);
    assert_eq!(map.hashpower(), 10);
    for i in 0..1000u64 {
        map.insert(i, i).unwrap();
    }
    assert!(map.rehash(4).unwrap());
    // 2^4 buckets hold only 64 slots; reinsertion grows the rebuilt table
    // to the smallest hashpower that fits 1000 entries.
    assert!(map.hashpower() >= 8);
    assert!(map.hashpower() <= 9);
    assert_eq!(map.len(), 1000);
    for i in 0..1000u64 {
        assert_eq!(map.find(&i), Some(i));
    }
}

#[test]
fn reserve_picks_smallest_fitting_hashpower() {
    let map: CuckooMap<u64, u64> = CuckooMap::with_capacity(16);
    assert!(map.reserve(10_000).unwrap());
    assert!(map.capacity() >= 10_000);
    let grown = map.hashpower();
    assert!(!map.reserve((1 << grown) * 4).unwrap());
    assert!(map.reserve(16).unwrap());
    assert_eq!(map.hashpower(), 2);
}

#[test]
fn rehash_preserves_contents_exactly() {
    let mut rng = rand::thread_rng();
    let map = CuckooMap::with_capacity(256);
    let mut expected = Vec::new();
    for _ in 0..300 {
        let k: u64 = rng.gen();
        if map.insert(k, k.wrapping_mul(3)).unwrap() {
            expected.push((k, k.wrapping_mul(3)));
        }
    }
    expected.sort_unstable();

    let snapshot = |map: &CuckooMap<u64, u64>| {
        let lt = map.lock_table();
        let mut entries: Vec<(u64, u64)> = lt.iter().map(|(k, v)| (*k, *v)).collect();
        entries.sort_unstable();
        entries
    };

    let hp = map.hashpower();
    map.rehash(hp + 1).unwrap();
    assert_eq!(snapshot(&map), expected);
    map.rehash(hp + 3).unwrap();
    assert_eq!(snapshot(&map), expected);
    map.rehash(hp).unwrap();
    assert_eq!(snapshot(&map), expected);
    map.reserve(expected.len()).unwrap();
    assert_eq!(snapshot(&map), expected);
}

#[test]
fn tags_survive_doubling() {
    // Partials are hash-only, so entries placed before a string of
    // doublings must stay reachable through the tag-filtered lookup path
    // afterwards.
    let map = CuckooMap::with_capacity(8);
    for i in 0..6u64 {
        map.insert(format!("key-{}", i), i).unwrap();
    }
    for _ in 0..4 {
        let hp = map.hashpower();
        map.rehash(hp + 1).unwrap();
    }
    for i in 0..6u64 {
        assert_eq!(map.find(&format!("key-{}", i)), Some(i));
    }
}

#[test]
fn locked_view_rehash() {
    let map = CuckooMap::with_capacity(16);
    for i in 0..10u64 {
        map.insert(i, i).unwrap();
    }
    let hp = map.hashpower();
    {
        let mut lt = map.lock_table();
        assert!(lt.rehash(hp + 2).unwrap());
        assert_eq!(lt.len(), 10);
        assert_eq!(lt.find(&3), Some(&3));
    }
    assert_eq!(map.hashpower(), hp + 2);
    for i in 0..10u64 {
        assert_eq!(map.find(&i), Some(i));
    }
}
