use super::*;
use crate::layout::block::Block;

const SIZE: usize = 4096;
const STEP: u64 = (SIZE >> 9) as u64;

fn cache(nr_stripes: usize) -> StripeCache {
    StripeCache::new(nr_stripes, 4, 4, SIZE)
}

fn ready(c: &mut StripeCache, sector: u64) -> usize {
    match c.get_or_create(sector, SIZE) {
        Acquire::Ready(idx) => idx,
        other => panic!("expected a stripe for sector {sector}, got {other:?}"),
    }
}

#[test]
fn miss_then_hit_shares_the_stripe() {
    let mut c = cache(4);
    let a = ready(&mut c, 0);
    assert_eq!(c.stripe(a).refs, 1);
    assert_eq!(c.free_count(), 3);

    let b = ready(&mut c, 0);
    assert_eq!(a, b);
    assert_eq!(c.stripe(a).refs, 2);
    assert_eq!(c.find(0, SIZE), Some(a));
    assert_eq!(c.find(STEP, SIZE), None);
    assert_eq!(c.find(0, 512), None, "one block size at a time");
}

#[test]
fn locked_stripe_refuses_new_references() {
    let mut c = cache(2);
    let a = ready(&mut c, 0);
    c.stripe_mut(a).locked = true;
    assert_eq!(c.get_or_create(0, SIZE), Acquire::Busy);
    c.stripe_mut(a).locked = false;
    assert_eq!(c.get_or_create(0, SIZE), Acquire::Ready(a));
}

#[test]
fn evict_skips_busy_stripes() {
    let mut c = cache(4);
    let idx: Vec<usize> = (0..4).map(|i| ready(&mut c, i * STEP)).collect();
    for &i in &idx {
        c.put_ref(i);
    }
    c.stripe_mut(idx[1]).phase = Phase::Begin;
    c.stripe_mut(idx[2]).refs = 1;
    c.stripe_mut(idx[3]).locked = true;

    assert_eq!(c.evict(4), 1);
    assert_eq!(c.find(0, SIZE), None);
    for s in 1..4 {
        assert!(c.find(s * STEP, SIZE).is_some(), "busy stripe {s} must survive");
    }
    assert!(!c.drain(), "drain cannot finish while rounds are live");

    c.stripe_mut(idx[1]).phase = Phase::Complete;
    c.stripe_mut(idx[2]).refs = 0;
    c.stripe_mut(idx[3]).locked = false;
    assert!(c.drain());
    assert_eq!(c.free_count(), 4);
    assert_eq!(c.hashed_count(), 0);
}

#[test]
fn clock_sweep_resumes_where_it_stopped() {
    let mut c = cache(4);
    for s in 0..4 {
        let i = ready(&mut c, s * STEP);
        c.put_ref(i);
    }
    assert_eq!(c.evict(1), 1);
    assert_eq!(c.find(0, SIZE), None);
    assert_eq!(c.evict(1), 1);
    assert_eq!(c.find(STEP, SIZE), None);
    assert!(c.find(2 * STEP, SIZE).is_some());
    assert!(c.find(3 * STEP, SIZE).is_some());
}

#[test]
fn empty_free_list_evicts_an_eighth() {
    let mut c = cache(16);
    for s in 0..16 {
        let i = ready(&mut c, s * STEP);
        c.put_ref(i);
    }
    assert_eq!(c.free_count(), 0);

    let fresh = ready(&mut c, 100 * STEP);
    assert_eq!(c.stripe(fresh).sector, 100 * STEP);
    assert_eq!(c.free_count(), 1, "two evicted, one reused");
    assert_eq!(c.hashed_count(), 15);
}

#[test]
fn exhausted_when_nothing_is_evictable() {
    let mut c = cache(2);
    ready(&mut c, 0);
    ready(&mut c, STEP);
    assert_eq!(c.get_or_create(2 * STEP, SIZE), Acquire::Exhausted);
}

#[test]
fn size_change_waits_for_old_stripes() {
    let mut c = cache(4);
    let a = ready(&mut c, 0);
    assert_eq!(c.get_or_create(0, 512), Acquire::Busy);
    assert_eq!(c.buffer_size(), SIZE);

    c.put_ref(a);
    let b = match c.get_or_create(0, 512) {
        Acquire::Ready(i) => i,
        other => panic!("size change should go through, got {other:?}"),
    };
    assert_eq!(c.buffer_size(), 512);
    assert_eq!(c.stripe(b).size, 512);
    assert_eq!(c.stripe(b).pool.block_size(), 512);
    assert_eq!(c.hashed_count(), 1);
}

#[test]
fn eviction_returns_cached_blocks_to_the_pool() {
    let mut c = cache(1);
    let a = ready(&mut c, 0);
    let sh = c.stripe_mut(a);
    let blk = sh.pool.take_block();
    sh.old[2] = Some(Slot::Ready(blk));
    c.put_ref(a);

    assert_eq!(c.stats().cached, 1);
    assert!(c.drain());
    assert!(c.stripe(a).pool.is_full());
    assert!(c.stripe(a).old.iter().all(Option::is_none));
}

#[test]
#[should_panic(expected = "still in flight")]
fn evicting_with_io_outstanding_is_fatal() {
    let mut c = cache(1);
    let a = ready(&mut c, 0);
    c.stripe_mut(a).old[0] = Some(Slot::InFlight);
    c.put_ref(a);
    c.drain();
}

#[test]
fn stats_count_pending_and_locked() {
    let mut c = cache(4);
    let a = ready(&mut c, 0);
    let b = ready(&mut c, STEP);
    c.put_ref(b);
    let sh = c.stripe_mut(a);
    sh.phase = Phase::Write;
    sh.locked = true;

    let s = c.stats();
    assert_eq!(s.nr_stripes, 4);
    assert_eq!(s.hashed, 2);
    assert_eq!(s.free, 2);
    assert_eq!(s.pending, 1);
    assert_eq!(s.locked, 1);
    assert_eq!(s.cached, 1);
}

#[test]
fn pool_hands_out_fixed_counts() {
    let mut pool = BufferPool::new(3, 512);
    let blocks: Vec<Block> = (0..6).map(|_| pool.take_block()).collect();
    assert_eq!(pool.free_blocks(), 0);
    let shadow = pool.take_shadow(1, 64);
    assert_eq!(shadow, IoShadow { disk: 1, sector: 64 });
    assert!(!pool.is_full());

    for b in blocks {
        pool.put_block(b);
    }
    pool.put_shadow(shadow);
    assert!(pool.is_full());
    pool.resize(1024);
    assert_eq!(pool.take_block().len(), 1024);
}

#[test]
#[should_panic(expected = "buffer pool exhausted")]
fn pool_exhaustion_is_fatal() {
    let mut pool = BufferPool::new(3, 512);
    for _ in 0..7 {
        let _ = pool.take_block();
    }
}

#[test]
#[should_panic(expected = "borrowed blocks")]
fn resizing_a_borrowed_pool_is_fatal() {
    let mut pool = BufferPool::new(3, 512);
    let _held = pool.take_block();
    pool.resize(1024);
}
