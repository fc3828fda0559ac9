use crate::layout::mapper::{Algorithm, Geometry, SECTOR_SHIFT, SECTOR_SIZE};

pub const DEFAULT_RAID_DISKS: usize = 4;
pub const DEFAULT_CHUNK_SIZE: usize = 4096;
pub const DEFAULT_DISK_SIZE: u64 = 1 << 20;
pub const DEFAULT_NR_STRIPES: usize = 128;
pub const DEFAULT_HASH_BUCKETS: usize = 1024;

/// ArrayConfig is everything array assembly establishes before the engine starts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArrayConfig {
    pub raid_disks: usize,
    /// Bytes per chunk.
    pub chunk_size: usize,
    pub layout: Algorithm,
    /// Usable bytes per member disk.
    pub disk_size: u64,
    /// Stripe cache capacity.
    pub nr_stripes: usize,
    pub hash_buckets: usize,
}

impl Default for ArrayConfig {
    fn default() -> Self {
        Self {
            raid_disks: DEFAULT_RAID_DISKS,
            chunk_size: DEFAULT_CHUNK_SIZE,
            layout: Algorithm::LeftSymmetric,
            disk_size: DEFAULT_DISK_SIZE,
            nr_stripes: DEFAULT_NR_STRIPES,
            hash_buckets: DEFAULT_HASH_BUCKETS,
        }
    }
}

impl ArrayConfig {
    /// # Errors
    /// Returns an error describing the first field that is out of range.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.raid_disks < 3 {
            anyhow::bail!("raid_disks must be at least 3 (got {})", self.raid_disks);
        }
        if self.chunk_size < SECTOR_SIZE || !self.chunk_size.is_power_of_two() {
            anyhow::bail!(
                "chunk_size must be a power of two of at least {SECTOR_SIZE} bytes (got {})",
                self.chunk_size
            );
        }
        if self.disk_size == 0 || self.disk_size % self.chunk_size as u64 != 0 {
            anyhow::bail!(
                "disk_size must be a non-zero multiple of chunk_size {} (got {})",
                self.chunk_size,
                self.disk_size
            );
        }
        if !self.hash_buckets.is_power_of_two() {
            anyhow::bail!(
                "hash_buckets must be a power of two (got {})",
                self.hash_buckets
            );
        }
        Ok(())
    }

    #[must_use]
    pub fn geometry(&self) -> Geometry {
        Geometry::new(self.raid_disks, self.chunk_size, self.layout)
    }

    #[must_use]
    pub const fn data_disks(&self) -> usize {
        self.raid_disks - 1
    }

    /// Logical capacity of the volume in bytes.
    #[must_use]
    pub const fn capacity_bytes(&self) -> u64 {
        self.disk_size * self.data_disks() as u64
    }

    /// Logical capacity of the volume in sectors.
    #[must_use]
    pub const fn capacity_sectors(&self) -> u64 {
        self.capacity_bytes() >> SECTOR_SHIFT
    }

    /// Host block sizes the engine accepts: powers of two from one sector up to a chunk.
    #[must_use]
    pub const fn supports_block_size(&self, size: usize) -> bool {
        size >= SECTOR_SIZE && size <= self.chunk_size && size.is_power_of_two()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let cfg = ArrayConfig::default();
        cfg.validate().expect("defaults validate");
        assert_eq!(cfg.data_disks(), 3);
        assert_eq!(cfg.capacity_bytes(), 3 << 20);
        assert_eq!(cfg.capacity_sectors(), (3 << 20) / 512);
    }

    #[test]
    fn rejects_out_of_range_fields() {
        let bad = [
            ArrayConfig { raid_disks: 2, ..ArrayConfig::default() },
            ArrayConfig { chunk_size: 256, ..ArrayConfig::default() },
            ArrayConfig { chunk_size: 3072, ..ArrayConfig::default() },
            ArrayConfig { disk_size: 4096 * 3 + 512, ..ArrayConfig::default() },
            ArrayConfig { disk_size: 0, ..ArrayConfig::default() },
            ArrayConfig { hash_buckets: 1000, ..ArrayConfig::default() },
        ];
        for cfg in bad {
            assert!(cfg.validate().is_err(), "{cfg:?} must be rejected");
        }
    }

    #[test]
    fn block_sizes_are_bounded_by_chunk() {
        let cfg = ArrayConfig::default();
        assert!(cfg.supports_block_size(512));
        assert!(cfg.supports_block_size(4096));
        assert!(!cfg.supports_block_size(8192));
        assert!(!cfg.supports_block_size(1536));
        assert!(!cfg.supports_block_size(0));
    }
}
