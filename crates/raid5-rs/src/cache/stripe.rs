use std::time::Instant;

use super::pool::{BufferPool, IoShadow};
use crate::engine::{HostDone, SyncDone, SyncKind};
use crate::layout::block::Block;
use crate::retention::disk::IoOp;

/// Where a stripe is in its current round.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Idle in the cache; nothing attached.
    Complete,
    /// New buffers attached, not yet classified.
    Begin,
    /// Reading pre-images needed for parity or reconstruction.
    ReadOld,
    /// Reading straight into host buffers.
    Read,
    /// Writing data and parity.
    Write,
}

/// Slot holds a block that is either usable or out at a disk.
#[derive(Debug)]
pub enum Slot {
    Ready(Block),
    InFlight,
}

impl Slot {
    #[must_use]
    pub const fn ready(&self) -> Option<&Block> {
        match self {
            Self::Ready(b) => Some(b),
            Self::InFlight => None,
        }
    }

    /// # Panics
    /// Panics if the block is still at a disk.
    #[must_use]
    pub fn expect_ready(&self, what: &str, disk: usize) -> &Block {
        match self {
            Self::Ready(b) => b,
            Self::InFlight => panic!("{what} buffer for disk {disk} is still in flight"),
        }
    }

    /// # Panics
    /// Panics if the block is still at a disk.
    pub fn expect_ready_mut(&mut self, what: &str, disk: usize) -> &mut Block {
        match self {
            Self::Ready(b) => b,
            Self::InFlight => panic!("{what} buffer for disk {disk} is still in flight"),
        }
    }

    /// # Panics
    /// Panics if the block is still at a disk.
    pub fn take(&mut self, what: &str, disk: usize) -> Block {
        match std::mem::replace(self, Self::InFlight) {
            Self::Ready(b) => b,
            Self::InFlight => panic!("{what} buffer for disk {disk} is still in flight"),
        }
    }
}

/// Attached is a host buffer riding on a stripe.
pub struct Attached {
    pub op: IoOp,
    pub buf: Slot,
    pub shadow: IoShadow,
    pub done: HostDone,
    pub started: Instant,
}

impl std::fmt::Debug for Attached {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attached")
            .field("op", &self.op)
            .field("buf", &self.buf)
            .field("shadow", &self.shadow)
            .finish_non_exhaustive()
    }
}

/// SyncRound is a resync or rebuild round holding the stripe.
pub struct SyncRound {
    pub kind: SyncKind,
    pub done: SyncDone,
    pub started: Instant,
}

impl std::fmt::Debug for SyncRound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncRound").field("kind", &self.kind).finish_non_exhaustive()
    }
}

/// Stripe caches one row of blocks across every member.
#[derive(Debug)]
pub struct Stripe {
    /// Member sector shared by every block in the row.
    pub sector: u64,
    /// Block size in bytes.
    pub size: usize,
    pub phase: Phase,
    pub cmd: Option<IoOp>,
    pub pd_idx: usize,
    /// Member I/Os outstanding in this round.
    pub nr_pending: usize,
    pub refs: usize,
    /// Blocks new attachments while set.
    pub locked: bool,
    /// A member I/O failed; restart classification.
    pub errored: bool,
    pub new: Vec<Option<Attached>>,
    pub old: Vec<Option<Slot>>,
    pub writeback: Vec<Option<Slot>>,
    /// Set while a sync round owns the stripe.
    pub sync: Option<SyncRound>,
    pub pool: BufferPool,
    pub(crate) hash_next: Option<usize>,
    pub(crate) hashed: bool,
}

impl Stripe {
    #[must_use]
    pub fn new(raid_disks: usize, size: usize) -> Self {
        Self {
            sector: 0,
            size,
            phase: Phase::Complete,
            cmd: None,
            pd_idx: 0,
            nr_pending: 0,
            refs: 0,
            locked: false,
            errored: false,
            new: (0..raid_disks).map(|_| None).collect(),
            old: (0..raid_disks).map(|_| None).collect(),
            writeback: (0..raid_disks).map(|_| None).collect(),
            sync: None,
            pool: BufferPool::new(raid_disks, size),
            hash_next: None,
            hashed: false,
        }
    }

    #[must_use]
    pub const fn disks(&self) -> usize {
        self.old.len()
    }

    /// Complete, unlocked and unreferenced.
    #[must_use]
    pub const fn is_idle(&self) -> bool {
        matches!(self.phase, Phase::Complete) && !self.locked && self.refs == 0
    }

    /// Not complete and nothing outstanding at the disks.
    #[must_use]
    pub const fn needs_handling(&self) -> bool {
        !matches!(self.phase, Phase::Complete) && self.nr_pending == 0
    }

    pub fn release_writeback(&mut self) {
        for i in 0..self.writeback.len() {
            if let Some(mut slot) = self.writeback[i].take() {
                let block = slot.take("writeback", i);
                self.pool.put_block(block);
            }
        }
    }

    pub fn release_old(&mut self) {
        for i in 0..self.old.len() {
            if let Some(mut slot) = self.old[i].take() {
                let block = slot.take("old", i);
                self.pool.put_block(block);
            }
        }
    }

    /// `reset` prepares an idle stripe for a new identity.
    ///
    /// # Panics
    /// Panics if the stripe still borrows pool buffers or has attachments.
    pub fn reset(&mut self, sector: u64, size: usize) {
        assert!(self.is_idle(), "reusing busy stripe {}", self.sector);
        assert!(
            self.new.iter().all(Option::is_none),
            "reusing stripe {} with attached buffers",
            self.sector
        );
        self.release_writeback();
        self.release_old();
        assert!(
            self.pool.is_full(),
            "stripe {} leaked buffers: {} of {} blocks home",
            self.sector,
            self.pool.free_blocks(),
            2 * self.disks()
        );
        self.pool.resize(size);
        self.sector = sector;
        self.size = size;
        self.cmd = None;
        self.errored = false;
        self.nr_pending = 0;
    }
}
