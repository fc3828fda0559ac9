//! The RAID-5 engine: request dispatch, the stripe state machine, parity
//! computation, completion handling and the worker that drives them.
//!
//! All cache state lives behind one short critical section (`Shared::conf`).
//! The state machine runs under it and records what to do next in
//! [`Actions`]; member I/O and host completions are issued only after the
//! lock is dropped, so a backend may complete requests inline.

mod complete;
mod dispatch;
mod handle;
mod parity;
mod worker;

#[cfg(test)]
mod scenario_tests;

pub use handle::{Census, WriteMethod};

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tracing::info;

use crate::cache::{CacheStats, StripeCache};
use crate::config::ArrayConfig;
use crate::error::IoError;
use crate::hooks::Hooks;
use crate::layout::block::Block;
use crate::layout::mapper::Geometry;
use crate::metrics::{self, RaidOp, StripeEvent, StripeOp};
use crate::retention::array::{Array, ResyncParity};
use crate::retention::disk::{DiskBackend, DiskRequest, IoOp};

/// Completion callback for one host request.
///
/// Receives the request's block back (filled in for reads) or the reason
/// the request failed.
pub type HostDone = Box<dyn FnOnce(Result<Block, IoError>) + Send + 'static>;

/// HostRequest is one block-sized read or write against the volume.
pub struct HostRequest {
    /// Logical sector; must be aligned to the block size.
    pub sector: u64,
    pub op: IoOp,
    pub buf: Block,
    pub done: HostDone,
}

impl HostRequest {
    #[must_use]
    pub fn new(sector: u64, op: IoOp, buf: Block, done: HostDone) -> Self {
        Self {
            sector,
            op,
            buf,
            done,
        }
    }
}

impl std::fmt::Debug for HostRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostRequest")
            .field("sector", &self.sector)
            .field("op", &self.op)
            .field("len", &self.buf.len())
            .finish_non_exhaustive()
    }
}

/// Completion callback for one stripe sync round.
pub type SyncDone = Box<dyn FnOnce(Result<(), IoError>) + Send + 'static>;

/// Which block a sync round regenerates.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SyncKind {
    /// Recompute parity from the data slots.
    Parity,
    /// Regenerate `slot` from the other members and write it to the
    /// device now serving that slot's writes.
    Rebuild { slot: usize },
}

/// SyncRequest regenerates one block of one stripe row as a single round.
///
/// The stripe stays locked from the first read to the last write, so host
/// requests against it wait instead of interleaving.
pub struct SyncRequest {
    /// Member sector of the row; must be chunk aligned.
    pub sector: u64,
    pub kind: SyncKind,
    pub done: SyncDone,
}

impl SyncRequest {
    #[must_use]
    pub fn new(sector: u64, kind: SyncKind, done: SyncDone) -> Self {
        Self { sector, kind, done }
    }
}

impl std::fmt::Debug for SyncRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncRequest")
            .field("sector", &self.sector)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Outcome of a non-blocking [`Raid5::submit`] or [`Raid5::submit_sync`].
#[derive(Debug)]
pub enum Submit<R = HostRequest> {
    Accepted,
    /// The stripe is busy; try again once it is released.
    Retry(R),
}

struct Conf {
    cache: StripeCache,
    wake_pending: bool,
    stopping: bool,
    worker_running: bool,
}

/// Reply queued for a host request.
struct Reply {
    done: HostDone,
    result: Result<Block, IoError>,
    op: IoOp,
    bytes: usize,
    started: Instant,
}

/// Actions collected under the lock and carried out after it is dropped.
#[derive(Default)]
struct Actions {
    io: Vec<DiskRequest>,
    replies: Vec<Reply>,
    synced: Vec<(SyncDone, Result<(), IoError>)>,
    events: Vec<StripeOp>,
}

impl Actions {
    fn reply(&mut self, done: HostDone, result: Result<Block, IoError>, op: IoOp, bytes: usize, started: Instant) {
        self.replies.push(Reply {
            done,
            result,
            op,
            bytes,
            started,
        });
    }

    fn note(&mut self, sector: u64, event: StripeEvent) {
        self.events.push(StripeOp { sector, event });
    }
}

struct Shared {
    config: ArrayConfig,
    geometry: Geometry,
    conf: Mutex<Conf>,
    array: Mutex<Array>,
    /// Signalled when the worker has something to do.
    work: Condvar,
    /// Signalled when a stripe finishes its round.
    released: Condvar,
    backend: Arc<dyn DiskBackend>,
    hooks: Hooks,
}

impl Shared {
    /// `dispatch` issues queued member I/O and host completions.
    ///
    /// Must be called without `conf` held.
    fn dispatch(&self, actions: Actions) {
        for op in actions.events {
            metrics::record_stripe_op(op);
        }
        for request in actions.io {
            self.backend.submit(request);
        }
        for (done, result) in actions.synced {
            done(result);
        }
        for r in actions.replies {
            metrics::record_raid_op(RaidOp {
                op: r.op,
                bytes: r.bytes as u64,
                latency_seconds: r.started.elapsed().as_secs_f64(),
                error: r.result.is_err(),
            });
            (r.done)(r.result);
        }
    }

    fn wake_worker(&self, conf: &mut Conf) {
        conf.wake_pending = true;
        self.work.notify_one();
    }
}

/// Raid5 is one running array: its stripe cache, member health and worker.
pub struct Raid5 {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Raid5 {
    /// `new` starts the engine for an assembled array.
    ///
    /// # Arguments
    /// * `config` - Geometry and cache sizing.
    /// * `backend` - Member disk I/O; device `i` serves slot `i`.
    /// * `hooks` - Host collaborators.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or the stripe cache
    /// cannot be given any stripes.
    pub fn new(config: ArrayConfig, backend: Arc<dyn DiskBackend>, hooks: Hooks) -> anyhow::Result<Self> {
        config.validate()?;
        if config.nr_stripes == 0 {
            anyhow::bail!("stripe cache cannot grow: nr_stripes is 0");
        }
        let geometry = config.geometry();
        let cache = StripeCache::new(
            config.nr_stripes,
            config.hash_buckets,
            config.raid_disks,
            config.chunk_size,
        );
        info!(
            raid_disks = config.raid_disks,
            chunk_size = config.chunk_size,
            layout = config.layout.name(),
            nr_stripes = config.nr_stripes,
            "raid5 array started"
        );
        Ok(Self {
            shared: Arc::new(Shared {
                array: Mutex::new(Array::new(config.raid_disks)),
                config,
                geometry,
                conf: Mutex::new(Conf {
                    cache,
                    wake_pending: false,
                    stopping: false,
                    worker_running: false,
                }),
                work: Condvar::new(),
                released: Condvar::new(),
                backend,
                hooks,
            }),
            worker: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn config(&self) -> &ArrayConfig {
        &self.shared.config
    }

    #[must_use]
    pub fn geometry(&self) -> Geometry {
        self.shared.geometry
    }

    /// A copy of the current member health.
    #[must_use]
    pub fn array(&self) -> Array {
        self.shared.array.lock().clone()
    }

    #[must_use]
    pub fn status_string(&self) -> String {
        self.shared.array.lock().status_string()
    }

    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.shared.conf.lock().cache.stats()
    }

    /// `notify_disk_failed` reports a member failure seen outside any stripe.
    ///
    /// # Errors
    /// Returns [`IoError::ArrayFailed`] once the array cannot tolerate
    /// further failures.
    pub fn notify_disk_failed(&self, dev: usize) -> Result<(), IoError> {
        self.shared.disk_error(dev);
        let failed_disks = self.shared.array.lock().failed_disks();
        if failed_disks > 1 {
            return Err(IoError::ArrayFailed { failed_disks });
        }
        Ok(())
    }

    /// `attach_spare` starts redirecting writes for `slot` to device `dev`.
    ///
    /// # Errors
    /// Returns an error if the spare cannot be attached or metadata cannot
    /// be persisted.
    pub fn attach_spare(&self, dev: usize, slot: usize) -> anyhow::Result<()> {
        let snapshot = {
            let mut array = self.shared.array.lock();
            array.attach_spare(dev, slot)?;
            array.clone()
        };
        info!(dev, slot, "spare attached for rebuild");
        self.shared.hooks.metadata.persist(&snapshot)
    }

    /// `promote_spare` makes the rebuilt spare the member for its slot.
    ///
    /// # Errors
    /// Returns an error if no spare is attached or metadata cannot be
    /// persisted.
    pub fn promote_spare(&self) -> anyhow::Result<usize> {
        let (slot, snapshot) = {
            let mut array = self.shared.array.lock();
            let slot = array.promote_spare()?;
            (slot, array.clone())
        };
        info!(slot, "spare promoted; redundancy restored");
        self.shared.hooks.metadata.persist(&snapshot)?;
        Ok(slot)
    }

    /// # Errors
    /// Returns an error while the array is degraded.
    pub fn begin_parity_resync(&self) -> anyhow::Result<()> {
        self.shared.array.lock().begin_resync()?;
        info!("parity resync started");
        Ok(())
    }

    /// Ends a resync walk and reports whether a failure interrupted it.
    pub fn end_parity_resync(&self) -> ResyncParity {
        let state = self.shared.array.lock().end_resync();
        info!(?state, "parity resync finished");
        state
    }
}

impl Drop for Raid5 {
    fn drop(&mut self) {
        self.shutdown_worker();
    }
}
