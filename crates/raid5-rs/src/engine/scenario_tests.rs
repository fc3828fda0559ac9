//! End-to-end walks through the write, degraded-read and failure paths on a
//! four-disk fixed-parity array.

use std::sync::Arc;

use super::*;
use crate::layout::mapper::Algorithm;
use crate::retention::disk::{IoRecord, MemDisks};
use crate::testing::{read_sync, request, write_sync};

const CHUNK: usize = 4096;
const SPC: u64 = 8;
const PARITY_DEV: usize = 3;

fn config() -> ArrayConfig {
    ArrayConfig {
        raid_disks: 4,
        chunk_size: CHUNK,
        layout: Algorithm::FixedParity,
        disk_size: 256 * 1024,
        nr_stripes: 8,
        hash_buckets: 16,
    }
}

fn start(disks: &Arc<MemDisks>) -> Raid5 {
    Raid5::new(config(), disks.clone() as Arc<dyn DiskBackend>, Hooks::default()).expect("array starts")
}

fn reads(log: &[IoRecord]) -> Vec<usize> {
    let mut devs: Vec<usize> = log.iter().filter(|r| r.op == IoOp::Read).map(|r| r.dev).collect();
    devs.sort_unstable();
    devs
}

fn writes(log: &[IoRecord]) -> Vec<usize> {
    let mut devs: Vec<usize> = log.iter().filter(|r| r.op == IoOp::Write).map(|r| r.dev).collect();
    devs.sort_unstable();
    devs
}

/// Writes chunks A, B, C to logical sectors 0, 8 and 16 as one round.
fn write_full_stripe(raid: &Raid5) -> [Block; 3] {
    let chunks = [Block::filled(CHUNK, 0xa1), Block::filled(CHUNK, 0xb2), Block::filled(CHUNK, 0xc3)];
    let mut slots = Vec::new();
    for (k, data) in chunks.iter().enumerate() {
        let (slot, req) = request(k as u64 * SPC, IoOp::Write, data.clone());
        assert!(matches!(raid.submit(req), Ok(Submit::Accepted)));
        slots.push(slot);
    }
    raid.run_until_idle();
    for slot in slots {
        assert!(matches!(slot.lock().take(), Some(Ok(_))));
    }
    chunks
}

#[test]
fn full_stripe_write_needs_no_reads() {
    let disks = Arc::new(MemDisks::new(4, config().disk_size));
    let raid = start(&disks);

    let [a, b, c] = write_full_stripe(&raid);

    let log = disks.submitted();
    assert!(reads(&log).is_empty());
    assert_eq!(writes(&log), vec![0, 1, 2, 3]);
    assert_eq!(raid.cache_stats().reconstruct_writes, 1);
    assert_eq!(raid.cache_stats().read_modify_writes, 0);

    let parity = a.clone() ^ &b ^ &c;
    assert_eq!(disks.read_raw(PARITY_DEV, 0, CHUNK), parity.as_bytes());
    for (k, data) in [a, b, c].iter().enumerate() {
        assert_eq!(disks.read_raw(k, 0, CHUNK), data.as_bytes());
        assert_eq!(&read_sync(&raid, k as u64 * SPC, CHUNK).expect("read"), data);
    }
}

#[test]
fn degraded_read_rebuilds_from_the_other_members() {
    let disks = Arc::new(MemDisks::new(4, config().disk_size));
    let [_, b, _] = write_full_stripe(&start(&disks));

    // Cold cache; the member holding chunk B is gone.
    let raid = start(&disks);
    raid.notify_disk_failed(1).expect("one failure is tolerated");
    disks.clear_log();

    let got = read_sync(&raid, SPC, CHUNK).expect("degraded read");
    assert_eq!(got, b);
    let log = disks.submitted();
    assert_eq!(reads(&log), vec![0, 2, 3]);
    assert!(writes(&log).is_empty());
}

#[test]
fn write_with_only_its_own_chunk_cached_uses_read_modify_write() {
    let disks = Arc::new(MemDisks::new(4, config().disk_size));
    let raid = start(&disks);
    let [_, b, c] = write_full_stripe(&raid);

    // Keep only chunk A's pre-image in the cache.
    {
        let mut conf = raid.shared.conf.lock();
        let idx = conf.cache.find(0, CHUNK).expect("stripe 0 is cached");
        let sh = conf.cache.stripe_mut(idx);
        for disk in [1, 2, PARITY_DEV] {
            let mut slot = sh.old[disk].take().expect("cached after the write");
            let block = slot.take("old", disk);
            sh.pool.put_block(block);
        }
    }
    disks.clear_log();

    let a2 = Block::filled(CHUNK, 0x5e);
    write_sync(&raid, 0, a2.clone()).expect("write");

    let log = disks.submitted();
    assert_eq!(reads(&log), vec![PARITY_DEV], "only the old parity is fetched");
    assert_eq!(writes(&log), vec![0, PARITY_DEV]);
    let stats = raid.cache_stats();
    assert_eq!(stats.read_modify_writes, 1);
    assert_eq!(stats.reconstruct_writes, 1, "from the full-stripe write");

    let parity = a2.clone() ^ &b ^ &c;
    assert_eq!(disks.read_raw(PARITY_DEV, 0, CHUNK), parity.as_bytes());
    assert_eq!(disks.read_raw(0, 0, CHUNK), a2.as_bytes());
}

#[test]
fn two_failed_members_fail_requests_without_touching_disks() {
    let disks = Arc::new(MemDisks::new(4, config().disk_size));
    let raid = start(&disks);
    assert_eq!(raid.notify_disk_failed(0), Ok(()));
    assert_eq!(raid.notify_disk_failed(2), Err(IoError::ArrayFailed { failed_disks: 2 }));
    assert!(raid.array().has_failed());
    disks.clear_log();

    let result = read_sync(&raid, 0, CHUNK);
    assert_eq!(result, Err(IoError::ArrayFailed { failed_disks: 2 }));
    assert!(disks.submitted().is_empty());
}
