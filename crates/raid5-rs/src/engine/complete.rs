use std::time::Instant;

use tracing::{error, warn};

use super::{Actions, Shared};
use crate::cache::{Phase, Slot, Stripe};
use crate::layout::block::Block;
use crate::metrics::{self, DiskOp};
use crate::retention::array::FailureOutcome;
use crate::retention::disk::IoOp;

/// Which stripe slot a member transfer belongs to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(super) enum Target {
    Old,
    WriteBack,
    /// Straight into the host buffer.
    New,
}

/// IoTag travels with a member transfer back to [`Shared::end_io`].
#[derive(Copy, Clone, Debug)]
pub(super) struct IoTag {
    pub idx: usize,
    pub target: Target,
    pub disk: usize,
    pub dev: usize,
    pub op: IoOp,
    pub started: Instant,
}

impl Shared {
    /// `end_io` handles one finished member transfer.
    ///
    /// Puts the block back in its slot, records a failure against the
    /// member and wakes the worker once the round has nothing outstanding.
    pub(super) fn end_io(&self, tag: IoTag, block: Block, ok: bool) {
        metrics::record_disk_op(DiskOp {
            dev: tag.dev,
            op: tag.op,
            bytes: block.len() as u64,
            latency_seconds: tag.started.elapsed().as_secs_f64(),
            error: !ok,
        });
        if !ok {
            warn!(dev = tag.dev, disk = tag.disk, op = ?tag.op, "member I/O failed");
            self.disk_error(tag.dev);
        }

        let mut conf = self.conf.lock();
        let sh = conf.cache.stripe_mut(tag.idx);
        match tag.target {
            Target::Old if ok => sh.old[tag.disk] = Some(Slot::Ready(block)),
            Target::Old => {
                sh.old[tag.disk] = None;
                sh.pool.put_block(block);
            }
            Target::WriteBack => sh.writeback[tag.disk] = Some(Slot::Ready(block)),
            Target::New => {
                let Some(att) = sh.new[tag.disk].as_mut() else {
                    panic!("stripe {}: read completed for detached disk {}", sh.sector, tag.disk);
                };
                att.buf = Slot::Ready(block);
            }
        }

        assert!(
            sh.nr_pending > 0,
            "stripe {}: completion with no member I/O outstanding",
            sh.sector
        );
        sh.nr_pending -= 1;
        if !ok {
            let array = self.array.lock();
            let member_down = array.disk(tag.disk).is_some_and(|d| !d.operational);
            if array.failed_disks() > 0 && member_down {
                sh.errored = true;
            }
        }
        if sh.nr_pending == 0 {
            self.wake_worker(&mut conf);
        }
    }

    /// `disk_error` takes a failing member out of service.
    pub(super) fn disk_error(&self, dev: usize) -> FailureOutcome {
        let (outcome, snapshot) = {
            let mut array = self.array.lock();
            let outcome = array.mark_disk_failed(dev);
            (outcome, array.clone())
        };
        match outcome {
            FailureOutcome::Degraded { slot } => {
                error!(dev, slot, "disk failed; array running degraded");
            }
            FailureOutcome::ArrayFailed { slot } => {
                error!(
                    dev,
                    slot,
                    failed_disks = snapshot.failed_disks(),
                    "disk failed; array has lost redundancy and cannot serve requests"
                );
            }
            FailureOutcome::SpareLost => warn!(dev, "spare failed; rebuild abandoned"),
            FailureOutcome::Ignored => return outcome,
        }
        if let Err(e) = self.hooks.metadata.persist(&snapshot) {
            warn!(error = %e, "failed to persist array metadata");
        }
        self.hooks.recovery.wake();
        let mut conf = self.conf.lock();
        self.wake_worker(&mut conf);
        outcome
    }

    /// `complete_stripe` finishes a read or write round.
    ///
    /// In a write round the written data and parity become the cached
    /// pre-images. Every attached request took part in the round: the
    /// stripe is locked from classification on, so nothing can attach
    /// between the last member I/O and this call.
    pub(super) fn complete_stripe(&self, sh: &mut Stripe, out: &mut Actions) {
        let writing = sh.cmd == Some(IoOp::Write);
        if writing {
            let pd = sh.pd_idx;
            update_old(sh, pd);
        }

        for i in 0..sh.disks() {
            let Some(mut att) = sh.new[i].take() else {
                continue;
            };
            if writing {
                update_old(sh, i);
            }
            let block = att.buf.take("host", i);
            sh.pool.put_shadow(att.shadow);
            out.reply(att.done, Ok(block), att.op, sh.size, att.started);
        }
        sh.release_writeback();
        self.finish_stripe(sh);
    }

    /// `finish_stripe` returns a stripe to the idle cache.
    pub(super) fn finish_stripe(&self, sh: &mut Stripe) {
        sh.locked = false;
        sh.cmd = None;
        sh.phase = Phase::Complete;
        self.released.notify_all();
    }
}

/// `update_old` makes the block just written for slot `i` its cached pre-image.
fn update_old(sh: &mut Stripe, i: usize) {
    let Some(mut written) = sh.writeback[i].take() else {
        return;
    };
    let block = written.take("writeback", i);
    if let Some(mut prev) = sh.old[i].take() {
        let prev = prev.take("old", i);
        sh.pool.put_block(prev);
    }
    sh.old[i] = Some(Slot::Ready(block));
}
