use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use raid5_rs::IoOp;
use raid5_rs::metrics::{DiskOp, MetricsSink, RaidOp, StripeEvent, StripeOp};

#[derive(Copy, Clone, Debug)]
pub enum MetricsEvent {
    Disk(DiskOp),
    Raid(RaidOp),
    Stripe(StripeOp),
}

/// MetricsEmitter forwards engine events to the aggregator task.
///
/// Called from engine threads; never blocks. Events that do not fit in the
/// queue are counted and dropped.
pub struct MetricsEmitter {
    tx: mpsc::Sender<MetricsEvent>,
    dropped: AtomicU64,
}

impl MetricsEmitter {
    pub fn new(tx: mpsc::Sender<MetricsEvent>) -> Arc<Self> {
        Arc::new(Self {
            tx,
            dropped: AtomicU64::new(0),
        })
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn send(&self, event: MetricsEvent) {
        if self.tx.try_send(event).is_err() {
            let n = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if n % 1000 == 0 {
                warn!("metrics: dropped_events={n}");
            }
        }
    }
}

impl MetricsSink for MetricsEmitter {
    fn record_disk_op(&self, op: DiskOp) {
        self.send(MetricsEvent::Disk(op));
    }

    fn record_raid_op(&self, op: RaidOp) {
        self.send(MetricsEvent::Raid(op));
    }

    fn record_stripe_op(&self, op: StripeOp) {
        self.send(MetricsEvent::Stripe(op));
    }
}

#[derive(Clone, Debug, Default)]
pub struct OpTotals {
    pub reads: u64,
    pub writes: u64,
    pub bytes: u64,
    pub errors: u64,
    pub latency_seconds: f64,
}

impl OpTotals {
    fn add(&mut self, op: IoOp, bytes: u64, latency_seconds: f64, error: bool) {
        match op {
            IoOp::Read => self.reads += 1,
            IoOp::Write => self.writes += 1,
        }
        self.bytes += bytes;
        self.latency_seconds += latency_seconds;
        if error {
            self.errors += 1;
        }
    }

    pub fn mean_latency_us(&self) -> f64 {
        let n = self.reads + self.writes;
        if n == 0 {
            return 0.0;
        }
        self.latency_seconds / n as f64 * 1e6
    }
}

#[derive(Clone, Debug, Default)]
pub struct Totals {
    pub devices: BTreeMap<usize, OpTotals>,
    pub host: OpTotals,
    pub stripes: BTreeMap<StripeEvent, u64>,
}

impl Totals {
    fn record(&mut self, event: MetricsEvent) {
        match event {
            MetricsEvent::Disk(op) => {
                self.devices
                    .entry(op.dev)
                    .or_default()
                    .add(op.op, op.bytes, op.latency_seconds, op.error);
            }
            MetricsEvent::Raid(op) => self.host.add(op.op, op.bytes, op.latency_seconds, op.error),
            MetricsEvent::Stripe(op) => *self.stripes.entry(op.event).or_default() += 1,
        }
    }

    pub fn log_summary(&self) {
        let h = &self.host;
        info!(
            "host: reads={} writes={} bytes={} errors={} mean_latency_us={:.1}",
            h.reads,
            h.writes,
            h.bytes,
            h.errors,
            h.mean_latency_us()
        );
        for (dev, d) in &self.devices {
            info!(
                "disk{dev}: reads={} writes={} bytes={} errors={} mean_latency_us={:.1}",
                d.reads,
                d.writes,
                d.bytes,
                d.errors,
                d.mean_latency_us()
            );
        }
        if !self.stripes.is_empty() {
            let counts: Vec<String> = self
                .stripes
                .iter()
                .map(|(event, n)| format!("{}={n}", event.name()))
                .collect();
            info!("stripes: {}", counts.join(" "));
        }
    }
}

/// `run_aggregator` folds events until shutdown, then drains what is queued.
pub async fn run_aggregator(mut rx: mpsc::Receiver<MetricsEvent>, mut shutdown: watch::Receiver<bool>) -> Totals {
    let mut totals = Totals::default();
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(event) => totals.record(event),
                None => break,
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            },
        }
    }
    while let Ok(event) = rx.try_recv() {
        totals.record(event);
    }
    totals
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn aggregator_sums_per_device_host_and_stripe_event() {
        let (tx, rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let emitter = MetricsEmitter::new(tx);

        for dev in [0, 1, 1] {
            emitter.record_disk_op(DiskOp {
                dev,
                op: IoOp::Read,
                bytes: 512,
                latency_seconds: 0.001,
                error: dev == 0,
            });
        }
        emitter.record_raid_op(RaidOp {
            op: IoOp::Write,
            bytes: 4096,
            latency_seconds: 0.002,
            error: false,
        });
        for event in [StripeEvent::ReconstructWrite, StripeEvent::CacheHit, StripeEvent::CacheHit] {
            emitter.record_stripe_op(StripeOp { sector: 0, event });
        }

        let task = tokio::spawn(run_aggregator(rx, shutdown_rx));
        shutdown_tx.send(true).expect("aggregator listening");
        let totals = task.await.expect("aggregator");

        assert_eq!(totals.devices[&0].errors, 1);
        assert_eq!(totals.devices[&1].reads, 2);
        assert_eq!(totals.devices[&1].bytes, 1024);
        assert_eq!(totals.host.writes, 1);
        assert_eq!(totals.stripes[&StripeEvent::CacheHit], 2);
        assert_eq!(totals.stripes[&StripeEvent::ReconstructWrite], 1);
        assert!(!totals.stripes.contains_key(&StripeEvent::Restart));
        assert_eq!(emitter.dropped(), 0);
    }

    #[test]
    fn full_queue_drops_instead_of_blocking() {
        let (tx, _rx) = mpsc::channel(1);
        let emitter = MetricsEmitter::new(tx);
        for _ in 0..3 {
            emitter.record_raid_op(RaidOp {
                op: IoOp::Read,
                bytes: 1,
                latency_seconds: 0.0,
                error: false,
            });
        }
        assert_eq!(emitter.dropped(), 2);
    }
}
