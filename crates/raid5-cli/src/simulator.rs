use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use raid5_rs::Raid5;
use raid5_rs::cache::CacheStats;
use raid5_rs::hooks::{Hooks, MetadataStore, RecoveryScheduler};
use raid5_rs::retention::array::Array;
use raid5_rs::retention::disk::{DiskBackend, ImageDisks, MemDisks};
use raid5_rs::retention::volume::Volume;

use crate::cli::SimulateArgs;

const STATE_FILE: &str = "array.state";

/// Member devices, plus one spare device after the last slot.
enum Disks {
    Mem(Arc<MemDisks>),
    Image(Arc<ImageDisks>),
}

impl Disks {
    fn open(disk_dir: Option<&Path>, devices: usize, disk_size: u64) -> Result<Self> {
        match disk_dir {
            Some(dir) => {
                let disks = ImageDisks::open(dir, devices, disk_size)
                    .with_context(|| format!("opening disk images under {}", dir.display()))?;
                Ok(Self::Image(Arc::new(disks)))
            }
            None => Ok(Self::Mem(Arc::new(MemDisks::new(devices, disk_size)))),
        }
    }

    fn backend(&self) -> Arc<dyn DiskBackend> {
        match self {
            Self::Mem(d) => d.clone(),
            Self::Image(d) => d.clone(),
        }
    }

    /// Hot-removes a device; the engine finds out on its next I/O there.
    fn fail(&self, dev: usize) -> Result<()> {
        match self {
            Self::Mem(d) => {
                if dev >= d.devices() {
                    anyhow::bail!("device index out of range: {dev} (devices={})", d.devices());
                }
                d.set_failing(dev, true);
                Ok(())
            }
            Self::Image(d) => d.fail(dev),
        }
    }

    fn flush(&self) -> Result<()> {
        match self {
            Self::Mem(_) => Ok(()),
            Self::Image(d) => d.flush(),
        }
    }
}

/// StatusFile keeps a text copy of member health next to the images.
struct StatusFile {
    path: PathBuf,
}

impl MetadataStore for StatusFile {
    fn persist(&self, array: &Array) -> Result<()> {
        std::fs::write(&self.path, array.status_string())
            .with_context(|| format!("writing {}", self.path.display()))
    }
}

#[derive(Default)]
struct RecoveryRequests(AtomicU64);

impl RecoveryScheduler for RecoveryRequests {
    fn wake(&self) {
        let n = self.0.fetch_add(1, Ordering::Relaxed) + 1;
        info!("recovery requested (total={n})");
    }
}

#[derive(Debug)]
pub struct Report {
    pub ops: u64,
    pub reads: u64,
    pub writes: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub recovery_requests: u64,
    pub digest: String,
    pub status: String,
    pub cache: CacheStats,
}

/// `run` drives a random workload through the engine and checks every read
/// against a shadow copy of the volume.
///
/// # Errors
/// Returns an error if the array cannot be assembled, a request fails or
/// any byte read back differs from what was written.
pub fn run(args: &SimulateArgs, cancel: &AtomicBool) -> Result<Report> {
    let config = args.array.config();
    config.validate()?;
    if let Some(dev) = args.fail_disk
        && dev >= config.raid_disks
    {
        anyhow::bail!("--fail-disk {dev} is not a member (disks={})", config.raid_disks);
    }

    let spare_dev = config.raid_disks;
    let disks = Disks::open(args.disk_dir.as_deref(), config.raid_disks + 1, config.disk_size)?;
    let recovery = Arc::new(RecoveryRequests::default());
    let mut hooks = Hooks {
        recovery: recovery.clone(),
        ..Hooks::default()
    };
    if let Some(dir) = &args.disk_dir {
        hooks.metadata = Arc::new(StatusFile {
            path: dir.join(STATE_FILE),
        });
    }

    let raid = Raid5::new(config.clone(), disks.backend(), hooks)?;
    let volume = Volume::new(raid)?;
    let capacity = usize::try_from(volume.logical_capacity_bytes()).context("volume too large to shadow")?;
    info!(
        "simulate: disks={} chunk_size={} layout={} capacity={capacity}",
        config.raid_disks,
        config.chunk_size,
        config.layout.name()
    );

    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };
    // Images may hold data from an earlier run.
    let mut shadow = vec![0u8; capacity];
    volume.read_bytes(0, &mut shadow)?;

    let fail_at = args.fail_disk.map(|dev| (dev, args.ops / 2));
    let max_io = args.max_io.clamp(1, capacity);
    let mut report = Report {
        ops: 0,
        reads: 0,
        writes: 0,
        bytes_read: 0,
        bytes_written: 0,
        recovery_requests: 0,
        digest: String::new(),
        status: String::new(),
        cache: CacheStats::default(),
    };

    for i in 0..args.ops {
        if cancel.load(Ordering::Relaxed) {
            warn!("simulate: cancelled after {i} ops");
            break;
        }
        if let Some((dev, at)) = fail_at
            && i == at
        {
            warn!("simulate: failing disk {dev} at op {i}");
            disks.fail(dev)?;
        }

        let len = rng.random_range(1..=max_io);
        let offset = rng.random_range(0..=capacity - len);
        if rng.random_bool(args.write_ratio.clamp(0.0, 1.0)) {
            let mut payload = vec![0u8; len];
            rng.fill_bytes(&mut payload);
            volume
                .write_bytes(offset as u64, &payload)
                .with_context(|| format!("op {i}: write {len} bytes at {offset}"))?;
            shadow[offset..offset + len].copy_from_slice(&payload);
            report.writes += 1;
            report.bytes_written += len as u64;
        } else {
            let mut out = vec![0u8; len];
            volume
                .read_bytes(offset as u64, &mut out)
                .with_context(|| format!("op {i}: read {len} bytes at {offset}"))?;
            if out != shadow[offset..offset + len] {
                anyhow::bail!("op {i}: read {len} bytes at {offset} does not match what was written");
            }
            report.reads += 1;
            report.bytes_read += len as u64;
        }
        report.ops += 1;
        if report.ops % 500 == 0 {
            debug!("simulate: ops={} stats={:?}", report.ops, volume.raid().cache_stats());
        }
    }

    if let Some((dev, _)) = fail_at {
        let array = volume.raid().array();
        if array.slot_of(dev).is_some_and(|slot| array.disk(slot).is_some_and(|d| d.operational)) {
            // The workload never touched the device after it failed.
            let _ = volume.raid().notify_disk_failed(dev);
        }
        if args.rebuild {
            let slot = volume
                .raid()
                .array()
                .slot_of(dev)
                .context("failed device serves no slot")?;
            volume.raid().attach_spare(spare_dev, slot)?;
            let slot = volume.rebuild_spare()?;
            info!("simulate: spare dev={spare_dev} now serves slot {slot}");
        }
    }
    if args.resync {
        volume.resync_parity()?;
        info!("simulate: parity resync complete");
    }

    let mut image = vec![0u8; capacity];
    volume.read_bytes(0, &mut image)?;
    let got = Sha256::digest(&image);
    let want = Sha256::digest(&shadow);
    if got != want {
        anyhow::bail!("volume digest {got:x} does not match shadow digest {want:x}");
    }

    report.digest = format!("{got:x}");
    report.status = volume.disk_status_string();
    report.cache = volume.raid().cache_stats();
    report.recovery_requests = recovery.0.load(Ordering::Relaxed);
    volume.stop()?;
    disks.flush()?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{ArrayArgs, LayoutArg};

    fn args(disk_dir: Option<PathBuf>) -> SimulateArgs {
        SimulateArgs {
            array: ArrayArgs {
                disks: 4,
                chunk_size: 1024,
                layout: LayoutArg::LeftSymmetric,
                disk_size: 64 * 1024,
                nr_stripes: 16,
                hash_buckets: 64,
            },
            disk_dir,
            ops: 300,
            max_io: 5000,
            write_ratio: 0.6,
            seed: Some(1),
            fail_disk: None,
            rebuild: false,
            resync: false,
            metrics_queue_cap: 16,
        }
    }

    #[test]
    fn healthy_run_verifies() {
        let mut a = args(None);
        a.resync = true;
        let report = run(&a, &AtomicBool::new(false)).expect("simulate");
        assert_eq!(report.ops, 300);
        assert_eq!(report.reads + report.writes, 300);
        assert_eq!(report.recovery_requests, 0);
        assert!(report.status.contains("failed=0"));
    }

    #[test]
    fn failure_and_rebuild_on_images() {
        let dir = tempfile::TempDir::new().expect("tmp dir");
        let mut a = args(Some(dir.path().to_path_buf()));
        a.fail_disk = Some(2);
        a.rebuild = true;
        let report = run(&a, &AtomicBool::new(false)).expect("simulate");
        assert!(report.recovery_requests >= 1);
        assert!(report.status.contains("disk 2: OK (dev=4)"));

        let state = std::fs::read_to_string(dir.path().join(STATE_FILE)).expect("state file");
        assert!(state.contains("failed=0"));
    }

    #[test]
    fn cancelled_run_stops_early() {
        let report = run(&args(None), &AtomicBool::new(true)).expect("simulate");
        assert_eq!(report.ops, 0);
    }

    #[test]
    fn fail_disk_must_be_a_member() {
        let mut a = args(None);
        a.fail_disk = Some(9);
        assert!(run(&a, &AtomicBool::new(false)).is_err());
    }
}
