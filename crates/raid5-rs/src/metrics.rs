//! Optional process-wide sink for member, host and stripe activity.
//!
//! Nothing is recorded until a sink is installed. Events are delivered
//! from engine and backend threads after the engine's lock is dropped.

use std::sync::{Arc, OnceLock};

use crate::retention::disk::IoOp;

/// DiskOp describes one completed member I/O.
#[derive(Copy, Clone, Debug)]
pub struct DiskOp {
    pub dev: usize,
    pub op: IoOp,
    pub bytes: u64,
    pub latency_seconds: f64,
    pub error: bool,
}

/// RaidOp describes one completed host request.
#[derive(Copy, Clone, Debug)]
pub struct RaidOp {
    pub op: IoOp,
    pub bytes: u64,
    pub latency_seconds: f64,
    pub error: bool,
}

/// What the state machine decided for a stripe.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StripeEvent {
    /// Parity rebuilt from the full stripe image.
    ReconstructWrite,
    /// Parity updated from the old and new contents of the written slots.
    ReadModifyWrite,
    /// A read round served without member I/O.
    CacheHit,
    /// A read needed a block from a lost member.
    DegradedRead,
    /// A member I/O failed and the round was reclassified.
    Restart,
    /// Requests failed because too many members were lost.
    Failed,
    ParitySync,
    Rebuild,
}

impl StripeEvent {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::ReconstructWrite => "reconstruct_write",
            Self::ReadModifyWrite => "read_modify_write",
            Self::CacheHit => "cache_hit",
            Self::DegradedRead => "degraded_read",
            Self::Restart => "restart",
            Self::Failed => "failed",
            Self::ParitySync => "parity_sync",
            Self::Rebuild => "rebuild",
        }
    }
}

/// StripeOp is one [`StripeEvent`] on the stripe at member sector `sector`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StripeOp {
    pub sector: u64,
    pub event: StripeEvent,
}

pub trait MetricsSink: Send + Sync + 'static {
    fn record_disk_op(&self, op: DiskOp);
    fn record_raid_op(&self, op: RaidOp);
    fn record_stripe_op(&self, _op: StripeOp) {}
}

static METRICS_SINK: OnceLock<Arc<dyn MetricsSink>> = OnceLock::new();

/// Installs the process-wide sink; returns false if one is already set.
pub fn install_metrics_sink(sink: Arc<dyn MetricsSink>) -> bool {
    METRICS_SINK.set(sink).is_ok()
}

pub fn is_enabled() -> bool {
    METRICS_SINK.get().is_some()
}

fn with_sink(f: impl FnOnce(&dyn MetricsSink)) {
    if let Some(sink) = METRICS_SINK.get() {
        f(sink.as_ref());
    }
}

pub fn record_disk_op(op: DiskOp) {
    with_sink(|s| s.record_disk_op(op));
}

pub fn record_raid_op(op: RaidOp) {
    with_sink(|s| s.record_raid_op(op));
}

pub fn record_stripe_op(op: StripeOp) {
    with_sink(|s| s.record_stripe_op(op));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ArrayConfig;
    use crate::engine::Raid5;
    use crate::hooks::Hooks;
    use crate::layout::block::Block;
    use crate::layout::mapper::Algorithm;
    use crate::retention::disk::{DiskBackend, MemDisks};
    use crate::testing::{read_sync, write_sync};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct StripeLog {
        ops: Mutex<Vec<StripeOp>>,
    }

    impl MetricsSink for StripeLog {
        fn record_disk_op(&self, _op: DiskOp) {}

        fn record_raid_op(&self, _op: RaidOp) {}

        fn record_stripe_op(&self, op: StripeOp) {
            self.ops.lock().push(op);
        }
    }

    #[test]
    fn stripe_decisions_reach_the_sink() {
        let log = Arc::new(StripeLog::default());
        assert!(install_metrics_sink(log.clone()));
        assert!(is_enabled());

        // Other tests drive small arrays concurrently; this stripe sits far
        // past the end of any of theirs.
        let config = ArrayConfig {
            layout: Algorithm::FixedParity,
            disk_size: 8 * 1024 * 1024,
            ..ArrayConfig::default()
        };
        let disks = Arc::new(MemDisks::new(config.raid_disks, config.disk_size));
        let raid = Raid5::new(config.clone(), disks as Arc<dyn DiskBackend>, Hooks::default()).expect("start");
        let spc = (config.chunk_size >> 9) as u64;
        let row = 1500;
        let logical = row * (config.raid_disks as u64 - 1) * spc;
        let member = config.geometry().map_sector(logical).sector;
        assert_eq!(member, row * spc);

        write_sync(&raid, logical, Block::filled(config.chunk_size, 0x3c)).expect("write");
        read_sync(&raid, logical, config.chunk_size).expect("read");

        let ours: Vec<StripeEvent> = log
            .ops
            .lock()
            .iter()
            .filter(|op| op.sector == member)
            .map(|op| op.event)
            .collect();
        assert_eq!(ours, vec![StripeEvent::ReconstructWrite, StripeEvent::CacheHit]);
    }

    #[test]
    fn event_names_are_distinct() {
        let all = [
            StripeEvent::ReconstructWrite,
            StripeEvent::ReadModifyWrite,
            StripeEvent::CacheHit,
            StripeEvent::DegradedRead,
            StripeEvent::Restart,
            StripeEvent::Failed,
            StripeEvent::ParitySync,
            StripeEvent::Rebuild,
        ];
        let mut names: Vec<&str> = all.iter().map(|e| e.name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), all.len());
    }
}
