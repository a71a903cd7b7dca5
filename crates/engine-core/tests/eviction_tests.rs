use engine_core::arc::ArcPolicy;
use engine_core::eviction::{new_policy, EvictionPolicy, RecencyList};
use engine_core::lru::LruPolicy;
use engine_common::config::EvictionPolicyKind;

fn store(policy: &mut dyn EvictionPolicy, block: u32, hash: u64) {
    policy.prepare_store(hash);
    policy.complete_store(block, hash);
}

#[test]
fn recency_list_moves_on_push() {
    let mut list = RecencyList::new();
    list.push_back(1u32);
    list.push_back(2);
    list.push_back(3);
    list.push_back(1);
    assert_eq!(list.iter().copied().collect::<Vec<_>>(), vec![2, 3, 1]);
    assert_eq!(list.pop_front_where(|k| *k != 2), Some(3));
    assert_eq!(list.len(), 2);
    assert_eq!(list.front(), Some(&2));
}

#[test]
fn lru_evicts_least_recently_touched() {
    let mut lru = LruPolicy::new(8);
    for b in 0..4 {
        store(&mut lru, b, 100 + b as u64);
    }
    lru.touch(0);
    assert_eq!(lru.order(), vec![1, 2, 3, 0]);
    assert_eq!(lru.evict_one(&|_| true), Some((1, 101)));
    assert_eq!(lru.lookup(102), Some(2));
    assert_eq!(lru.evict_one(&|_| true), Some((3, 103)));
    assert_eq!(lru.lookup(101), None);
}

#[test]
fn lru_skips_blocks_that_are_not_evictable() {
    let mut lru = LruPolicy::new(8);
    store(&mut lru, 0, 10);
    store(&mut lru, 1, 11);
    assert_eq!(lru.evict_one(&|b| b != 0), Some((1, 11)));
    assert_eq!(lru.evict_one(&|b| b != 0), None);
    assert!(lru.contains(0));
}

#[test]
fn arc_evicts_from_t1_into_b1() {
    let mut arc = ArcPolicy::new(4);
    for (b, h) in [(0, 100), (1, 101), (2, 102), (3, 103)] {
        store(&mut arc, b, h);
    }
    assert_eq!(arc.t1_len(), 4);
    arc.touch(0);
    assert!(arc.in_t2(0));
    assert_eq!(arc.t1_len(), 3);

    assert!(arc.t1_len() > arc.target_p());
    let (block, hash) = arc.evict_one(&|_| true).unwrap();
    assert_eq!((block, hash), (1, 101));
    assert!(arc.in_b1(101));
    assert!(!arc.in_t1(1));
}

#[test]
fn arc_release_keeps_block_in_its_list() {
    let mut arc = ArcPolicy::new(4);
    store(&mut arc, 0, 100);
    store(&mut arc, 1, 101);
    arc.release(0);
    assert!(arc.in_t1(0));
    assert_eq!(arc.t2_len(), 0);
    // requeued at the recent end of T1
    assert_eq!(arc.evict_one(&|_| true), Some((1, 101)));

    arc.touch(0);
    arc.release(0);
    assert!(arc.in_t2(0));
}

#[test]
fn arc_b1_ghost_hit_grows_target() {
    let mut arc = ArcPolicy::new(4);
    for (b, h) in [(0, 100), (1, 101), (2, 102)] {
        store(&mut arc, b, h);
    }
    arc.evict_one(&|_| true);
    assert!(arc.in_b1(100));
    let before = arc.target_p();
    store(&mut arc, 7, 100);
    assert!(arc.target_p() > before);
    assert!(arc.in_t2(7));
    assert!(!arc.in_b1(100));
}

#[test]
fn arc_b2_ghost_hit_shrinks_target() {
    let mut arc = ArcPolicy::new(2);
    store(&mut arc, 0, 10);
    arc.evict_one(&|_| true);
    store(&mut arc, 0, 10);
    assert_eq!(arc.target_p(), 1);
    assert!(arc.in_t2(0));

    store(&mut arc, 1, 11);
    // |T1| == p, so the victim comes from T2
    assert_eq!(arc.evict_one(&|_| true), Some((0, 10)));
    assert!(arc.in_b2(10));

    store(&mut arc, 0, 10);
    assert_eq!(arc.target_p(), 0);
}

#[test]
fn arc_target_is_capped_and_floored() {
    let mut arc = ArcPolicy::new(1);
    for round in 0..5u64 {
        store(&mut arc, 0, 50 + round);
        arc.evict_one(&|_| true);
        store(&mut arc, 0, 50 + round);
        assert!(arc.target_p() <= 1);
        arc.evict_one(&|_| true);
    }
    assert!(arc.b1_len() <= 1);
    assert!(arc.b2_len() <= 1);
}

#[test]
fn factory_selects_policy() {
    assert_eq!(new_policy(EvictionPolicyKind::Lru, 4).name(), "lru");
    let arc = new_policy(EvictionPolicyKind::Arc, 4);
    assert_eq!(arc.name(), "arc");
    assert_eq!(arc.capacity(), 4);
    assert!(arc.is_empty());
}
