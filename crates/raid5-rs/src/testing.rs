//! Test backends and helpers shared by the engine tests.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::{Rng, RngCore};
use rand::seq::SliceRandom;

use crate::engine::{HostDone, HostRequest, Raid5};
use crate::error::IoError;
use crate::layout::block::Block;
use crate::retention::disk::{DiskBackend, DiskRequest, IoOp, IoRecord, MemDisks};

#[derive(Default)]
struct QueueState {
    queue: VecDeque<(u64, DiskRequest)>,
    log: Vec<IoRecord>,
    generation: u64,
    overlaps: usize,
}

/// QueueDisks holds every request until the test completes it.
///
/// Completion is served from an inner [`MemDisks`]. A request submitted for
/// a stripe that still has requests outstanding from before the last
/// completion batch means two rounds overlapped on that stripe.
pub struct QueueDisks {
    inner: MemDisks,
    state: Mutex<QueueState>,
}

impl QueueDisks {
    pub fn new(devices: usize, disk_size: u64) -> Self {
        Self {
            inner: MemDisks::new(devices, disk_size),
            state: Mutex::new(QueueState::default()),
        }
    }

    pub fn disks(&self) -> &MemDisks {
        &self.inner
    }

    pub fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn submitted(&self) -> Vec<IoRecord> {
        self.state.lock().log.clone()
    }

    pub fn clear_log(&self) {
        self.state.lock().log.clear();
    }

    pub fn overlapping_rounds(&self) -> usize {
        self.state.lock().overlaps
    }

    /// Completes every queued request; returns how many there were.
    pub fn complete_all(&self) -> usize {
        let batch: Vec<DiskRequest> = {
            let mut st = self.state.lock();
            st.generation += 1;
            st.queue.drain(..).map(|(_, r)| r).collect()
        };
        let n = batch.len();
        for r in batch {
            self.inner.submit(r);
        }
        n
    }

    /// Completes a random subset of at most `max` queued requests, in random order.
    pub fn complete_some(&self, max: usize, rng: &mut impl Rng) -> usize {
        let mut batch: Vec<DiskRequest> = {
            let mut st = self.state.lock();
            st.generation += 1;
            let mut all: Vec<(u64, DiskRequest)> = st.queue.drain(..).collect();
            all.shuffle(&mut *rng);
            let take = rng.random_range(0..=max.min(all.len()));
            let rest = all.split_off(take);
            st.queue.extend(rest);
            all.into_iter().map(|(_, r)| r).collect()
        };
        batch.shuffle(&mut *rng);
        let n = batch.len();
        for r in batch {
            self.inner.submit(r);
        }
        n
    }
}

impl DiskBackend for QueueDisks {
    fn submit(&self, request: DiskRequest) {
        let mut st = self.state.lock();
        let generation = st.generation;
        if st
            .queue
            .iter()
            .any(|(g, r)| r.sector == request.sector && *g < generation)
        {
            st.overlaps += 1;
        }
        st.log.push(IoRecord {
            dev: request.dev,
            op: request.op,
            sector: request.sector,
        });
        st.queue.push_back((generation, request));
    }
}

/// Outcome slot for one host request.
pub type Outcome = Arc<Mutex<Option<Result<Block, IoError>>>>;

pub fn outcome() -> (Outcome, HostDone) {
    let slot: Outcome = Arc::new(Mutex::new(None));
    let sink = slot.clone();
    (slot, Box::new(move |r| *sink.lock() = Some(r)))
}

pub fn request(sector: u64, op: IoOp, buf: Block) -> (Outcome, HostRequest) {
    let (slot, done) = outcome();
    (slot, HostRequest::new(sector, op, buf, done))
}

/// Pumps the worker and the queued backend until nothing moves.
pub fn pump(raid: &Raid5, disks: &QueueDisks) {
    loop {
        raid.run_until_idle();
        if disks.complete_all() == 0 {
            raid.run_until_idle();
            return;
        }
    }
}

/// Writes one block through the engine and drives it to completion.
pub fn write_sync(raid: &Raid5, sector: u64, data: Block) -> Result<Block, IoError> {
    let (slot, req) = request(sector, IoOp::Write, data);
    raid.make_request(req).expect("valid request");
    raid.run_until_idle();
    slot.lock().take().expect("write completed")
}

/// Reads one block through the engine and drives it to completion.
pub fn read_sync(raid: &Raid5, sector: u64, size: usize) -> Result<Block, IoError> {
    let (slot, req) = request(sector, IoOp::Read, Block::zeroed(size));
    raid.make_request(req).expect("valid request");
    raid.run_until_idle();
    slot.lock().take().expect("read completed")
}

pub fn random_block(size: usize, rng: &mut impl Rng) -> Block {
    let mut data = vec![0u8; size];
    rng.fill_bytes(&mut data);
    Block::from(data)
}

/// Checks that every member row of `disks` XORs to zero.
pub fn assert_parity_consistent(disks: &MemDisks, raid_disks: usize, disk_size: u64, chunk: usize) {
    let rows = disk_size / chunk as u64;
    for row in 0..rows {
        let off = row * chunk as u64;
        let mut acc = Block::zeroed(chunk);
        for dev in 0..raid_disks {
            acc ^= &Block::from(disks.read_raw(dev, off, chunk));
        }
        assert!(
            acc.as_bytes().iter().all(|b| *b == 0),
            "parity mismatch in row {row}"
        );
    }
}
