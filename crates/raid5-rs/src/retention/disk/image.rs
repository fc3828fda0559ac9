use memmap2::{MmapMut, MmapOptions};
use parking_lot::Mutex;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use super::{DiskBackend, DiskRequest, IoOp};

/// ImageDisk is one member backed by a memory-mapped image file.
pub struct ImageDisk {
    path: PathBuf,
    file: Option<File>,
    map: Option<MmapMut>,
    len: u64,
}

impl ImageDisk {
    /// # Errors
    /// Returns an error if the disk image cannot be created/opened or mapped.
    pub fn open_prealloc(path: impl AsRef<Path>, len: u64) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        file.set_len(len)?;

        let map_len = usize::try_from(len)
            .map_err(|_| anyhow::anyhow!("disk length {len} exceeds addressable size"))?;
        // SAFETY: the image file is owned by this process for the disk's lifetime.
        let map = unsafe { MmapOptions::new().len(map_len).map_mut(&file)? };

        Ok(Self {
            path,
            file: Some(file),
            map: Some(map),
            len,
        })
    }

    /// Mark this disk as failed (hot-remove).
    ///
    /// Renames the image to `*.failed.<ts>` and drops the mapping, so every
    /// later request to the device errors out.
    pub fn fail(&mut self) {
        if self.path.exists() {
            let ts = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            let failed_path = self.path.with_extension(format!("img.failed.{ts}"));
            let _ = std::fs::rename(&self.path, &failed_path);
        }

        self.map.take();
        self.file.take();
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub const fn len(&self) -> u64 {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub const fn is_operational(&self) -> bool {
        self.file.is_some() && self.map.is_some()
    }

    /// # Errors
    /// Returns an error if the mapping cannot be flushed.
    pub fn flush(&self) -> anyhow::Result<()> {
        if let Some(map) = self.map.as_ref() {
            map.flush()?;
        }
        Ok(())
    }

    pub fn read_at(&self, off: u64, buf: &mut [u8]) -> usize {
        let Some(map) = self.map.as_ref() else {
            return 0;
        };
        let Some((off, end)) = self.span(off, buf.len()) else {
            return 0;
        };
        let src = &map[off..end];
        let n = src.len();
        buf[..n].copy_from_slice(src);
        n
    }

    pub fn write_at(&mut self, off: u64, data: &[u8]) -> usize {
        let Some((off, end)) = self.span(off, data.len()) else {
            return 0;
        };
        let Some(map) = self.map.as_mut() else {
            return 0;
        };
        let dst = &mut map[off..end];
        let n = dst.len();
        dst.copy_from_slice(&data[..n]);
        n
    }

    fn span(&self, off: u64, len: usize) -> Option<(usize, usize)> {
        let off = usize::try_from(off).ok()?;
        let disk_len = usize::try_from(self.len).ok()?;
        if off >= disk_len {
            return None;
        }
        Some((off, off.saturating_add(len).min(disk_len)))
    }
}

/// ImageDisks serves requests from one image file per device, inline.
pub struct ImageDisks {
    disks: Vec<Mutex<ImageDisk>>,
}

impl ImageDisks {
    /// `open` creates or reuses `disk-<i>.img` for every device under `dir`.
    ///
    /// # Errors
    /// Returns an error if any image cannot be created or mapped.
    pub fn open(dir: impl AsRef<Path>, devices: usize, len: u64) -> anyhow::Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let disks = (0..devices)
            .map(|i| ImageDisk::open_prealloc(dir.join(format!("disk-{i}.img")), len))
            .map(|d| d.map(Mutex::new))
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self { disks })
    }

    /// Hot-remove device `dev`; later requests to it fail.
    ///
    /// # Errors
    /// Returns an error if the device index is out of range.
    pub fn fail(&self, dev: usize) -> anyhow::Result<()> {
        let Some(disk) = self.disks.get(dev) else {
            anyhow::bail!("device index out of range: {dev} (devices={})", self.disks.len());
        };
        disk.lock().fail();
        Ok(())
    }

    /// # Errors
    /// Returns an error if any mapping fails to flush.
    pub fn flush(&self) -> anyhow::Result<()> {
        for d in &self.disks {
            d.lock().flush()?;
        }
        Ok(())
    }

    #[must_use]
    pub fn paths(&self) -> Vec<PathBuf> {
        self.disks.iter().map(|d| d.lock().path().to_path_buf()).collect()
    }
}

impl DiskBackend for ImageDisks {
    fn submit(&self, mut request: DiskRequest) {
        let Some(disk) = self.disks.get(request.dev) else {
            request.finish(false);
            return;
        };
        let off = request.byte_offset();
        let want = request.buf.len();
        let done = {
            let mut disk = disk.lock();
            if disk.is_operational() {
                match request.op {
                    IoOp::Read => disk.read_at(off, request.buf.as_bytes_mut()),
                    IoOp::Write => disk.write_at(off, request.buf.as_bytes()),
                }
            } else {
                0
            }
        };
        request.finish(done == want);
    }
}
