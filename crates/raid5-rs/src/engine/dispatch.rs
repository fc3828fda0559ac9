use std::time::{Duration, Instant};

use tracing::debug;

use super::{Conf, HostRequest, Raid5, Shared, Submit, SyncKind, SyncRequest};
use crate::cache::{Acquire, Attached, Phase, Slot, StripeCache, SyncRound};
use crate::error::{IoError, RequestError};
use crate::layout::mapper::SECTOR_SHIFT;

/// How long a blocked caller sleeps before retrying on its own.
const RETRY_WAIT: Duration = Duration::from_millis(10);

impl Shared {
    fn validate(&self, req: &HostRequest) -> Result<(), RequestError> {
        let size = req.buf.len();
        if !self.config.supports_block_size(size) {
            return Err(RequestError::UnsupportedSize {
                size,
                chunk_size: self.config.chunk_size,
            });
        }
        let per_block = (size >> SECTOR_SHIFT) as u64;
        if req.sector % per_block != 0 {
            return Err(RequestError::Misaligned {
                sector: req.sector,
                size,
            });
        }
        let capacity = self.config.capacity_sectors();
        if req.sector.saturating_add(per_block) > capacity {
            return Err(RequestError::OutOfRange {
                sector: req.sector,
                capacity,
            });
        }
        Ok(())
    }

    /// `try_attach` maps a request onto its stripe and attaches it, or hands
    /// it back when the stripe cannot take it yet.
    fn try_attach(&self, conf: &mut Conf, req: HostRequest) -> Submit {
        let size = req.buf.len();
        let map = self.geometry.map_sector(req.sector);

        let idx = match conf.cache.get_or_create(map.sector, size) {
            Acquire::Ready(idx) => idx,
            Acquire::Busy | Acquire::Exhausted => {
                self.wake_worker(conf);
                return Submit::Retry(req);
            }
        };

        let sh = conf.cache.stripe_mut(idx);
        let opposite = sh.phase != Phase::Complete && sh.cmd.is_some_and(|cmd| cmd != req.op);
        let occupied = sh.new[map.data_disk].is_some();
        if opposite || occupied {
            debug!(
                sector = sh.sector,
                op = ?req.op,
                cmd = ?sh.cmd,
                occupied,
                "stripe contention; caller retries"
            );
            conf.cache.put_ref(idx);
            self.wake_worker(conf);
            return Submit::Retry(req);
        }

        sh.pd_idx = map.parity_disk;
        add_stripe_bh(&mut conf.cache, idx, map.data_disk, req);
        conf.cache.put_ref(idx);
        self.wake_worker(conf);
        Submit::Accepted
    }

    fn validate_sync(&self, req: &SyncRequest) -> Result<(), RequestError> {
        let chunk_size = self.config.chunk_size;
        if req.sector % self.geometry.sectors_per_chunk != 0 {
            return Err(RequestError::Misaligned {
                sector: req.sector,
                size: chunk_size,
            });
        }
        let disk_sectors = self.config.disk_size >> SECTOR_SHIFT;
        if req.sector >= disk_sectors {
            return Err(RequestError::OutOfRange {
                sector: req.sector,
                capacity: disk_sectors,
            });
        }
        if let SyncKind::Rebuild { slot } = req.kind
            && slot >= self.config.raid_disks
        {
            return Err(RequestError::NoSuchSlot {
                slot,
                raid_disks: self.config.raid_disks,
            });
        }
        Ok(())
    }

    /// `try_sync` claims an idle stripe row for a sync round.
    ///
    /// The stripe is locked on the spot; a row with a round of its own in
    /// progress hands the request back.
    fn try_sync(&self, conf: &mut Conf, req: SyncRequest) -> Submit<SyncRequest> {
        let idx = match conf.cache.get_or_create(req.sector, self.config.chunk_size) {
            Acquire::Ready(idx) => idx,
            Acquire::Busy | Acquire::Exhausted => {
                self.wake_worker(conf);
                return Submit::Retry(req);
            }
        };
        let sh = conf.cache.stripe_mut(idx);
        if sh.phase != Phase::Complete {
            conf.cache.put_ref(idx);
            self.wake_worker(conf);
            return Submit::Retry(req);
        }
        sh.pd_idx = self.geometry.parity_disk(req.sector);
        sh.sync = Some(SyncRound {
            kind: req.kind,
            done: req.done,
            started: Instant::now(),
        });
        sh.locked = true;
        sh.cmd = None;
        sh.phase = Phase::Begin;
        debug!(sector = sh.sector, kind = ?req.kind, "sync round queued");
        conf.cache.put_ref(idx);
        self.wake_worker(conf);
        Submit::Accepted
    }
}

/// `add_stripe_bh` attaches a host buffer to slot `disk` of a stripe,
/// opening a new round if the stripe was idle.
///
/// # Panics
/// Panics if the slot is occupied or the buffer size does not match.
fn add_stripe_bh(cache: &mut StripeCache, idx: usize, disk: usize, req: HostRequest) {
    let sh = cache.stripe_mut(idx);
    assert!(
        sh.new[disk].is_none(),
        "stripe {}: disk {disk} already has a buffer attached",
        sh.sector
    );
    assert_eq!(
        req.buf.len(),
        sh.size,
        "stripe {}: {}-byte buffer on a {}-byte stripe",
        sh.sector,
        req.buf.len(),
        sh.size
    );
    let shadow = sh.pool.take_shadow(disk, sh.sector);
    sh.new[disk] = Some(Attached {
        op: req.op,
        buf: Slot::Ready(req.buf),
        shadow,
        done: req.done,
        started: Instant::now(),
    });
    if sh.phase == Phase::Complete {
        sh.phase = Phase::Begin;
        sh.cmd = Some(req.op);
    }
}

impl Raid5 {
    /// `submit` hands one request to the engine without blocking.
    ///
    /// # Errors
    /// Returns an error if the request is misaligned, has an unsupported
    /// size or lies past the end of the volume.
    pub fn submit(&self, req: HostRequest) -> Result<Submit, RequestError> {
        self.shared.validate(&req)?;
        let mut conf = self.shared.conf.lock();
        if conf.stopping {
            drop(conf);
            (req.done)(Err(IoError::Stopped));
            return Ok(Submit::Accepted);
        }
        Ok(self.shared.try_attach(&mut conf, req))
    }

    /// `make_request` hands one request to the engine, waiting while its
    /// stripe is busy.
    ///
    /// Without a worker thread the caller drives the state machine itself
    /// while it waits.
    ///
    /// # Errors
    /// Returns an error if the request fails validation.
    pub fn make_request(&self, req: HostRequest) -> Result<(), RequestError> {
        let mut req = req;
        loop {
            match self.submit(req)? {
                Submit::Accepted => return Ok(()),
                Submit::Retry(r) => req = r,
            }
            self.wait_for_release();
        }
    }

    /// `submit_sync` queues a resync or rebuild round without blocking.
    ///
    /// # Errors
    /// Returns an error if the row is misaligned or past the end of the
    /// members, or the rebuild slot does not exist.
    pub fn submit_sync(&self, req: SyncRequest) -> Result<Submit<SyncRequest>, RequestError> {
        self.shared.validate_sync(&req)?;
        let mut conf = self.shared.conf.lock();
        if conf.stopping {
            drop(conf);
            (req.done)(Err(IoError::Stopped));
            return Ok(Submit::Accepted);
        }
        Ok(self.shared.try_sync(&mut conf, req))
    }

    /// `sync_stripe` queues a sync round, waiting while its row is busy.
    ///
    /// # Errors
    /// Returns an error if the request fails validation.
    pub fn sync_stripe(&self, req: SyncRequest) -> Result<(), RequestError> {
        let mut req = req;
        loop {
            match self.submit_sync(req)? {
                Submit::Accepted => return Ok(()),
                Submit::Retry(r) => req = r,
            }
            self.wait_for_release();
        }
    }

    fn wait_for_release(&self) {
        let mut conf = self.shared.conf.lock();
        if conf.worker_running {
            self.shared.released.wait_for(&mut conf, RETRY_WAIT);
            return;
        }
        drop(conf);
        if self.run_pending() == 0 {
            let mut conf = self.shared.conf.lock();
            self.shared.released.wait_for(&mut conf, RETRY_WAIT);
        }
    }
}
