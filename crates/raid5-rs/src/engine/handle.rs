use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use super::complete::{IoTag, Target};
use super::{Actions, Shared, SyncKind};
use crate::cache::{Attached, Phase, Slot, Stripe, StripeCache};
use crate::error::IoError;
use crate::layout::block::Block;
use crate::metrics::StripeEvent;
use crate::retention::array::DiskSnapshot;
use crate::retention::disk::{DiskRequest, IoOp};

/// Parity update strategy for a write round.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WriteMethod {
    /// Recompute parity from the complete stripe image.
    ReconstructWrite,
    /// Fold `old ^ new` of the written slots into the old parity.
    ReadModifyWrite,
}

/// Census is the per-round classification of a stripe's slots.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Census {
    pub nr_read: usize,
    pub nr_write: usize,
    /// Slots, parity included, with a cached pre-image.
    pub nr_cache: usize,
    /// Unattached data slots with a cached pre-image.
    pub nr_cache_other: usize,
    /// Attached data slots with a cached pre-image.
    pub nr_cache_overwrite: usize,
    /// Unattached data slots that cannot be read.
    pub nr_failed_other: usize,
    /// Attached data slots that cannot be read.
    pub nr_failed_overwrite: usize,
    pub parity_cached: bool,
    pub parity_failed: bool,
}

impl Census {
    /// `take` classifies every slot against the member health snapshot.
    pub(crate) fn take(sh: &Stripe, operational: &[bool]) -> Self {
        let mut c = Self::default();
        for i in 0..sh.disks() {
            let cached = sh.old[i].is_some();
            if cached {
                c.nr_cache += 1;
            }
            if i == sh.pd_idx {
                c.parity_cached = cached;
                c.parity_failed = !operational[i];
                continue;
            }
            let Some(att) = sh.new[i].as_ref() else {
                if cached {
                    c.nr_cache_other += 1;
                }
                if !operational[i] {
                    c.nr_failed_other += 1;
                }
                continue;
            };
            match att.op {
                IoOp::Read => c.nr_read += 1,
                IoOp::Write => c.nr_write += 1,
            }
            if cached {
                c.nr_cache_overwrite += 1;
            }
            if !operational[i] {
                c.nr_failed_overwrite += 1;
            }
        }
        c
    }

    /// Member I/Os still needed before parity can be rebuilt from the full
    /// stripe image; `None` if an unattached slot cannot be read.
    #[must_use]
    pub const fn reconstruct_write_cost(&self, data_disks: usize) -> Option<usize> {
        if self.nr_failed_other != 0 {
            return None;
        }
        Some(data_disks.saturating_sub(self.nr_write + self.nr_cache_other))
    }

    /// Member I/Os still needed before parity can be updated in place;
    /// `None` if a written slot or the parity slot cannot be read.
    #[must_use]
    pub const fn read_modify_write_cost(&self) -> Option<usize> {
        if self.nr_failed_overwrite != 0 || self.parity_failed {
            return None;
        }
        Some(self.nr_write - self.nr_cache_overwrite + if self.parity_cached { 0 } else { 1 })
    }

    /// `write_method` picks the cheaper strategy; ties go to reconstruct-write.
    #[must_use]
    pub const fn write_method(&self, data_disks: usize) -> Option<(WriteMethod, usize)> {
        match (self.reconstruct_write_cost(data_disks), self.read_modify_write_cost()) {
            (Some(rcw), Some(rmw)) if rcw <= rmw => Some((WriteMethod::ReconstructWrite, rcw)),
            (_, Some(rmw)) => Some((WriteMethod::ReadModifyWrite, rmw)),
            (Some(rcw), None) => Some((WriteMethod::ReconstructWrite, rcw)),
            (None, None) => None,
        }
    }

    #[must_use]
    pub const fn read_cost(&self) -> usize {
        self.nr_read - self.nr_cache_overwrite
    }
}

impl Shared {
    /// `handle_stripe` advances one stripe by one step.
    ///
    /// Runs under the cache lock; member I/O and host replies are queued on
    /// `out` for the caller to carry out once the lock is dropped.
    pub(super) fn handle_stripe(self: &Arc<Self>, cache: &mut StripeCache, idx: usize, out: &mut Actions) {
        cache.handled += 1;
        let sh = cache.stripe_mut(idx);
        let sector = sh.sector;
        let method = if sh.sync.is_some() {
            self.handle_sync(sh, idx, out);
            None
        } else {
            self.step(sh, idx, out)
        };
        let Some(method) = method else {
            return;
        };
        match method {
            WriteMethod::ReconstructWrite => cache.reconstruct_writes += 1,
            WriteMethod::ReadModifyWrite => cache.read_modify_writes += 1,
        }
        out.note(sector, method.into());
    }

    fn step(self: &Arc<Self>, sh: &mut Stripe, idx: usize, out: &mut Actions) -> Option<WriteMethod> {
        assert_eq!(
            sh.nr_pending, 0,
            "stripe {} handled with {} member I/O in flight",
            sh.sector, sh.nr_pending
        );
        if sh.phase == Phase::Complete {
            return None;
        }

        let restarted = restart_if_errored(sh, out);
        if !restarted
            && matches!(
                (sh.cmd, sh.phase),
                (Some(IoOp::Write), Phase::Write) | (Some(IoOp::Read), Phase::Read)
            )
        {
            self.complete_stripe(sh, out);
            return None;
        }

        let snap = self.array.lock().snapshot(sh.pd_idx);
        if snap.failed_disks > 1 || snap.non_operational() > 1 {
            warn!(
                sector = sh.sector,
                failed_disks = snap.failed_disks,
                "stripe cannot be served; failing attached requests"
            );
            fail_stripe(sh, snap.failed_disks.max(2), out);
            out.note(sh.sector, StripeEvent::Failed);
            self.finish_stripe(sh);
            return None;
        }

        let census = Census::take(sh, &snap.operational);
        if census.nr_write > 0 {
            self.handle_write(sh, idx, census, &snap, out)
        } else if census.nr_read > 0 {
            self.handle_read(sh, idx, &census, &snap, out);
            None
        } else {
            self.finish_stripe(sh);
            None
        }
    }

    /// Returns the parity method once the round's writes are issued.
    fn handle_write(
        self: &Arc<Self>,
        sh: &mut Stripe,
        idx: usize,
        mut census: Census,
        snap: &DiskSnapshot,
        out: &mut Actions,
    ) -> Option<WriteMethod> {
        let disks = sh.disks();
        let data_disks = disks - 1;
        let pd = sh.pd_idx;

        if census.nr_write < data_disks {
            self.coalesce(sh, &mut census, snap);
        }

        let Some((method, cost)) = census.write_method(data_disks) else {
            panic!("stripe {}: no usable parity update ({census:?})", sh.sector);
        };
        debug!(
            sector = sh.sector,
            rcw = ?census.reconstruct_write_cost(data_disks),
            rmw = ?census.read_modify_write_cost(),
            ?method,
            "write round classified"
        );

        sh.locked = true;
        if cost == 0 {
            sh.phase = Phase::Write;
            sh.compute_parity(method);
            for i in 0..disks {
                if i != pd && sh.new[i].is_none() {
                    continue;
                }
                let Some(dev) = snap.write_targets[i] else {
                    continue;
                };
                let Some(slot) = sh.writeback[i].as_mut() else {
                    continue;
                };
                let block = slot.take("writeback", i);
                self.issue(sh, idx, Target::WriteBack, i, dev, IoOp::Write, block, out);
            }
            return Some(method);
        }

        sh.phase = Phase::ReadOld;
        for i in 0..disks {
            let needed = match method {
                WriteMethod::ReconstructWrite => i != pd && sh.new[i].is_none(),
                WriteMethod::ReadModifyWrite => i == pd || sh.new[i].is_some(),
            };
            if !needed || sh.old[i].is_some() {
                continue;
            }
            let Some(dev) = snap.read_dev(i) else {
                panic!("stripe {}: {method:?} needs unreadable disk {i}", sh.sector);
            };
            self.read_old(sh, idx, i, dev, out);
        }
        None
    }

    /// `coalesce` picks up dirty host blocks for the stripe's unattached data
    /// slots so they go out in this round.
    fn coalesce(&self, sh: &mut Stripe, census: &mut Census, snap: &DiskSnapshot) {
        let pd = sh.pd_idx;
        for i in 0..sh.disks() {
            if i == pd || sh.new[i].is_some() {
                continue;
            }
            let logical = self.geometry.inverse_map(sh.sector, i, pd);
            let Some(cached) = self.hooks.block_cache.find_cached(logical, sh.size) else {
                continue;
            };
            if !cached.dirty || cached.locked || cached.data.len() != sh.size {
                continue;
            }
            debug!(sector = sh.sector, disk = i, logical, "coalescing dirty host block");
            let shadow = sh.pool.take_shadow(i, sh.sector);
            sh.new[i] = Some(Attached {
                op: IoOp::Write,
                buf: Slot::Ready(cached.data),
                shadow,
                done: cached.done,
                started: Instant::now(),
            });
            census.nr_write += 1;
            if sh.old[i].is_some() {
                census.nr_cache_overwrite += 1;
                census.nr_cache_other -= 1;
            }
            if !snap.operational[i] {
                census.nr_failed_overwrite += 1;
                census.nr_failed_other -= 1;
            }
        }
    }

    fn handle_read(
        self: &Arc<Self>,
        sh: &mut Stripe,
        idx: usize,
        census: &Census,
        snap: &DiskSnapshot,
        out: &mut Actions,
    ) {
        let disks = sh.disks();
        let cost = census.read_cost();

        if cost == 0 || (cost == 1 && census.nr_cache == disks - 1) {
            debug!(sector = sh.sector, cost, "read served from stripe cache");
            out.note(sh.sector, StripeEvent::CacheHit);
            for i in 0..disks {
                if sh.new[i].is_none() {
                    continue;
                }
                if sh.old[i].is_none() {
                    sh.compute_block(i);
                }
                copy_old_into_new(sh, i);
            }
            self.complete_stripe(sh, out);
            return;
        }

        sh.locked = true;
        if census.nr_failed_overwrite > 0 {
            debug!(sector = sh.sector, "degraded read; reading the rest of the stripe");
            out.note(sh.sector, StripeEvent::DegradedRead);
            sh.phase = Phase::ReadOld;
            for i in 0..disks {
                if sh.old[i].is_some() {
                    continue;
                }
                let Some(dev) = snap.read_dev(i) else {
                    continue;
                };
                self.read_old(sh, idx, i, dev, out);
            }
            return;
        }

        sh.phase = Phase::Read;
        for i in 0..disks {
            if sh.new[i].is_none() {
                continue;
            }
            if sh.old[i].is_some() {
                copy_old_into_new(sh, i);
                continue;
            }
            let Some(dev) = snap.read_dev(i) else {
                panic!("stripe {}: direct read from unreadable disk {i}", sh.sector);
            };
            let Some(att) = sh.new[i].as_mut() else {
                continue;
            };
            let block = att.buf.take("host", i);
            self.issue(sh, idx, Target::New, i, dev, IoOp::Read, block, out);
        }
    }

    /// `handle_sync` advances a resync or rebuild round.
    ///
    /// Every slot but the target is brought into the cache, the target is
    /// recomputed as their XOR and written out. The stripe stays locked
    /// throughout, so host requests retry until the round is over.
    fn handle_sync(self: &Arc<Self>, sh: &mut Stripe, idx: usize, out: &mut Actions) {
        assert_eq!(
            sh.nr_pending, 0,
            "stripe {} handled with {} member I/O in flight",
            sh.sector, sh.nr_pending
        );
        let Some(kind) = sh.sync.as_ref().map(|round| round.kind) else {
            return;
        };
        if !restart_if_errored(sh, out) && sh.phase == Phase::Write {
            sh.release_writeback();
            let event = match kind {
                SyncKind::Parity => StripeEvent::ParitySync,
                SyncKind::Rebuild { .. } => StripeEvent::Rebuild,
            };
            out.note(sh.sector, event);
            self.end_sync(sh, Ok(()), out);
            return;
        }

        let target = match kind {
            SyncKind::Parity => sh.pd_idx,
            SyncKind::Rebuild { slot } => slot,
        };
        let snap = self.array.lock().snapshot(sh.pd_idx);
        if snap.failed_disks > 1 || snap.non_operational() > 1 {
            let failed_disks = snap.failed_disks.max(2);
            self.end_sync(sh, Err(IoError::ArrayFailed { failed_disks }), out);
            return;
        }
        let Some(dev) = snap.write_targets[target] else {
            warn!(sector = sh.sector, slot = target, "nothing to write the regenerated block to");
            self.end_sync(sh, Err(IoError::MemberUnavailable { slot: target }), out);
            return;
        };

        if sh.phase == Phase::Begin && kind == SyncKind::Parity {
            // Cached parity may not match what the disk holds.
            if let Some(mut stale) = sh.old[target].take() {
                let block = stale.take("old", target);
                sh.pool.put_block(block);
            }
        }

        let missing: Vec<usize> = (0..sh.disks())
            .filter(|&i| i != target && sh.old[i].is_none())
            .collect();
        let mut reads = Vec::with_capacity(missing.len());
        for i in missing {
            match snap.read_dev(i) {
                Some(src) => reads.push((i, src)),
                None => {
                    self.end_sync(sh, Err(IoError::MemberUnavailable { slot: i }), out);
                    return;
                }
            }
        }
        sh.locked = true;
        if !reads.is_empty() {
            sh.phase = Phase::ReadOld;
            for (i, src) in reads {
                self.read_old(sh, idx, i, src, out);
            }
            return;
        }

        if sh.old[target].is_none() {
            sh.compute_block(target);
        }
        let mut copy = sh.pool.take_block();
        copy.copy_from(sh.cached(target));
        debug!(sector = sh.sector, slot = target, dev, ?kind, "writing regenerated block");
        sh.phase = Phase::Write;
        sh.writeback[target] = Some(Slot::InFlight);
        self.issue(sh, idx, Target::WriteBack, target, dev, IoOp::Write, copy, out);
    }

    fn end_sync(&self, sh: &mut Stripe, result: Result<(), IoError>, out: &mut Actions) {
        if let Some(round) = sh.sync.take() {
            out.synced.push((round.done, result));
        }
        self.finish_stripe(sh);
    }

    fn read_old(self: &Arc<Self>, sh: &mut Stripe, idx: usize, disk: usize, dev: usize, out: &mut Actions) {
        let block = sh.pool.take_block();
        sh.old[disk] = Some(Slot::InFlight);
        self.issue(sh, idx, Target::Old, disk, dev, IoOp::Read, block, out);
    }

    /// `issue` queues one member transfer and counts it against the round.
    #[allow(clippy::too_many_arguments)]
    fn issue(
        self: &Arc<Self>,
        sh: &mut Stripe,
        idx: usize,
        target: Target,
        disk: usize,
        dev: usize,
        op: IoOp,
        block: Block,
        out: &mut Actions,
    ) {
        sh.nr_pending += 1;
        let tag = IoTag {
            idx,
            target,
            disk,
            dev,
            op,
            started: Instant::now(),
        };
        let shared = Arc::clone(self);
        out.io.push(DiskRequest::new(
            dev,
            op,
            sh.sector,
            block,
            Box::new(move |block, ok| shared.end_io(tag, block, ok)),
        ));
    }
}

/// `restart_if_errored` sends a stripe whose member I/O failed back to
/// classification. Returns true if it did.
fn restart_if_errored(sh: &mut Stripe, out: &mut Actions) -> bool {
    if !sh.errored {
        return false;
    }
    warn!(sector = sh.sector, phase = ?sh.phase, "member I/O failed; restarting stripe");
    out.note(sh.sector, StripeEvent::Restart);
    sh.errored = false;
    sh.phase = Phase::Begin;
    sh.release_writeback();
    true
}

impl From<WriteMethod> for StripeEvent {
    fn from(method: WriteMethod) -> Self {
        match method {
            WriteMethod::ReconstructWrite => Self::ReconstructWrite,
            WriteMethod::ReadModifyWrite => Self::ReadModifyWrite,
        }
    }
}

fn copy_old_into_new(sh: &mut Stripe, i: usize) {
    let Some(old) = sh.old[i].as_ref() else {
        panic!("stripe {}: no cached block for disk {i}", sh.sector);
    };
    let old = old.expect_ready("old", i);
    if let Some(att) = sh.new[i].as_mut() {
        att.buf.expect_ready_mut("host", i).copy_from(old);
    }
}

/// `fail_stripe` fails every attached request and returns the stripe's buffers.
fn fail_stripe(sh: &mut Stripe, failed_disks: usize, out: &mut Actions) {
    for i in 0..sh.disks() {
        let Some(mut att) = sh.new[i].take() else {
            continue;
        };
        let _ = att.buf.take("host", i);
        sh.pool.put_shadow(att.shadow);
        out.reply(att.done, Err(IoError::ArrayFailed { failed_disks }), att.op, sh.size, att.started);
    }
    sh.release_writeback();
}
