use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::{DiskBackend, DiskRequest, IoOp};

/// IoRecord is one entry in a backend's submission log.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct IoRecord {
    pub dev: usize,
    pub op: IoOp,
    pub sector: u64,
}

/// MemDisks keeps every device in memory and completes requests inline.
pub struct MemDisks {
    disks: Vec<Mutex<Vec<u8>>>,
    failing: Vec<AtomicBool>,
    log: Mutex<Vec<IoRecord>>,
    unplugs: AtomicU64,
}

impl MemDisks {
    /// # Panics
    /// Panics if `disk_size` does not fit in memory.
    #[must_use]
    pub fn new(devices: usize, disk_size: u64) -> Self {
        let len = usize::try_from(disk_size).expect("disk size exceeds addressable memory");
        Self {
            disks: (0..devices).map(|_| Mutex::new(vec![0u8; len])).collect(),
            failing: (0..devices).map(|_| AtomicBool::new(false)).collect(),
            log: Mutex::new(Vec::new()),
            unplugs: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn devices(&self) -> usize {
        self.disks.len()
    }

    /// Every request to `dev` completes with an error while `failing` is set.
    pub fn set_failing(&self, dev: usize, failing: bool) {
        self.failing[dev].store(failing, Ordering::SeqCst);
    }

    #[must_use]
    pub fn submitted(&self) -> Vec<IoRecord> {
        self.log.lock().clone()
    }

    pub fn clear_log(&self) {
        self.log.lock().clear();
    }

    #[must_use]
    pub fn unplug_count(&self) -> u64 {
        self.unplugs.load(Ordering::Relaxed)
    }

    /// `read_raw` copies device bytes without going through the request path.
    ///
    /// # Panics
    /// Panics if the range lies outside the device.
    #[must_use]
    pub fn read_raw(&self, dev: usize, off: u64, len: usize) -> Vec<u8> {
        let disk = self.disks[dev].lock();
        let off = usize::try_from(off).expect("offset exceeds usize");
        disk[off..off + len].to_vec()
    }

    pub fn write_raw(&self, dev: usize, off: u64, data: &[u8]) {
        let mut disk = self.disks[dev].lock();
        let off = usize::try_from(off).expect("offset exceeds usize");
        disk[off..off + data.len()].copy_from_slice(data);
    }
}

impl DiskBackend for MemDisks {
    fn submit(&self, mut request: DiskRequest) {
        self.log.lock().push(IoRecord {
            dev: request.dev,
            op: request.op,
            sector: request.sector,
        });

        if request.dev >= self.disks.len() || self.failing[request.dev].load(Ordering::SeqCst) {
            request.finish(false);
            return;
        }

        let ok = {
            let mut disk = self.disks[request.dev].lock();
            let Ok(off) = usize::try_from(request.byte_offset()) else {
                drop(disk);
                request.finish(false);
                return;
            };
            let end = off.saturating_add(request.buf.len());
            if end > disk.len() {
                false
            } else {
                match request.op {
                    IoOp::Read => request.buf.as_bytes_mut().copy_from_slice(&disk[off..end]),
                    IoOp::Write => disk[off..end].copy_from_slice(request.buf.as_bytes()),
                }
                true
            }
        };
        request.finish(ok);
    }

    fn unplug(&self) {
        self.unplugs.fetch_add(1, Ordering::Relaxed);
    }
}
