//! Sector mapping between the logical volume and per-disk stripe positions.


/// Bytes per sector, as a shift.
pub const SECTOR_SHIFT: u32 = 9;
/// Bytes per sector.
pub const SECTOR_SIZE: usize = 1 << SECTOR_SHIFT;

/// Parity placement algorithm.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Algorithm {
    /// Parity always lives on the last slot ("level 4").
    FixedParity,
    LeftAsymmetric,
    RightAsymmetric,
    LeftSymmetric,
    RightSymmetric,
}

impl Algorithm {
    pub const ALL: [Self; 5] = [
        Self::FixedParity,
        Self::LeftAsymmetric,
        Self::RightAsymmetric,
        Self::LeftSymmetric,
        Self::RightSymmetric,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::FixedParity => "fixed-parity",
            Self::LeftAsymmetric => "left-asymmetric",
            Self::RightAsymmetric => "right-asymmetric",
            Self::LeftSymmetric => "left-symmetric",
            Self::RightSymmetric => "right-symmetric",
        }
    }
}

/// SectorMap is the physical position of one logical sector.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SectorMap {
    /// Stripe number (chunk row) the sector falls in.
    pub stripe: u64,
    /// Slot holding the sector's data.
    pub data_disk: usize,
    /// Slot holding the parity for this stripe.
    pub parity_disk: usize,
    /// Sector on the member disk.
    pub sector: u64,
}

/// Geometry describes how chunks are laid out across the members.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Geometry {
    pub raid_disks: usize,
    pub data_disks: usize,
    pub sectors_per_chunk: u64,
    pub algorithm: Algorithm,
}

impl Geometry {
    /// `new` builds a geometry for `raid_disks` members and `chunk_size`-byte chunks.
    ///
    /// # Panics
    /// Panics if fewer than two disks are given or the chunk is smaller than a sector.
    #[must_use]
    pub fn new(raid_disks: usize, chunk_size: usize, algorithm: Algorithm) -> Self {
        assert!(raid_disks >= 2, "parity layout needs at least two disks");
        assert!(
            chunk_size >= SECTOR_SIZE,
            "chunk size {chunk_size} is smaller than a sector"
        );
        Self {
            raid_disks,
            data_disks: raid_disks - 1,
            sectors_per_chunk: (chunk_size >> SECTOR_SHIFT) as u64,
            algorithm,
        }
    }

    /// `map_sector` maps a logical sector to its stripe, data slot and parity slot.
    ///
    /// # Arguments
    /// * `logical_sector` - Sector number on the virtual volume.
    ///
    /// # Returns
    /// The physical placement; `sector` is the same on every member of the stripe.
    #[must_use]
    pub fn map_sector(&self, logical_sector: u64) -> SectorMap {
        let raid_disks = self.raid_disks as u64;
        let data_disks = self.data_disks as u64;

        let chunk_number = logical_sector / self.sectors_per_chunk;
        let chunk_offset = logical_sector % self.sectors_per_chunk;
        let stripe = chunk_number / data_disks;
        let mut dd_idx = chunk_number % data_disks;

        let pd_idx = match self.algorithm {
            Algorithm::FixedParity => data_disks,
            Algorithm::LeftAsymmetric => {
                let pd = data_disks - stripe % raid_disks;
                if dd_idx >= pd {
                    dd_idx += 1;
                }
                pd
            }
            Algorithm::RightAsymmetric => {
                let pd = stripe % raid_disks;
                if dd_idx >= pd {
                    dd_idx += 1;
                }
                pd
            }
            Algorithm::LeftSymmetric => {
                let pd = data_disks - stripe % raid_disks;
                dd_idx = (pd + 1 + dd_idx) % raid_disks;
                pd
            }
            Algorithm::RightSymmetric => {
                let pd = stripe % raid_disks;
                dd_idx = (pd + 1 + dd_idx) % raid_disks;
                pd
            }
        };

        SectorMap {
            stripe,
            data_disk: to_slot(dd_idx),
            parity_disk: to_slot(pd_idx),
            sector: stripe * self.sectors_per_chunk + chunk_offset,
        }
    }

    /// `parity_disk` returns the parity slot for the stripe containing member sector `sector`.
    #[must_use]
    pub fn parity_disk(&self, sector: u64) -> usize {
        let stripe = sector / self.sectors_per_chunk;
        let raid_disks = self.raid_disks as u64;
        match self.algorithm {
            Algorithm::FixedParity => self.data_disks,
            Algorithm::LeftAsymmetric | Algorithm::LeftSymmetric => {
                to_slot(self.data_disks as u64 - stripe % raid_disks)
            }
            Algorithm::RightAsymmetric | Algorithm::RightSymmetric => to_slot(stripe % raid_disks),
        }
    }

    /// `inverse_map` returns the logical sector stored at slot `disk` of the
    /// stripe beginning at member sector `sector`.
    ///
    /// # Arguments
    /// * `sector` - Member sector shared by the whole stripe.
    /// * `disk` - Data slot to resolve; must not be the parity slot.
    /// * `parity_disk` - Parity slot of this stripe.
    ///
    /// # Panics
    /// Panics if `disk` is the parity slot or the result does not map back
    /// to the same position.
    #[must_use]
    pub fn inverse_map(&self, sector: u64, disk: usize, parity_disk: usize) -> u64 {
        assert_ne!(
            disk, parity_disk,
            "parity slot {disk} has no logical sector"
        );
        let stripe = sector / self.sectors_per_chunk;
        let chunk_offset = sector % self.sectors_per_chunk;

        let i = match self.algorithm {
            Algorithm::FixedParity => disk,
            Algorithm::LeftAsymmetric | Algorithm::RightAsymmetric => {
                if disk > parity_disk { disk - 1 } else { disk }
            }
            Algorithm::LeftSymmetric | Algorithm::RightSymmetric => {
                let shifted = if disk < parity_disk {
                    disk + self.raid_disks
                } else {
                    disk
                };
                shifted - (parity_disk + 1)
            }
        };

        let chunk_number = stripe * self.data_disks as u64 + i as u64;
        let logical = chunk_number * self.sectors_per_chunk + chunk_offset;

        let check = self.map_sector(logical);
        assert!(
            check.sector == sector && check.data_disk == disk && check.parity_disk == parity_disk,
            "inverse map not consistent for sector {sector}, disk {disk}, parity {parity_disk}"
        );
        logical
    }
}

fn to_slot(idx: u64) -> usize {
    usize::try_from(idx).expect("disk slot exceeds usize")
}

/// `locate_byte` maps a logical byte offset to its block-aligned logical
/// sector and the offset inside that block.
///
/// # Arguments
/// * `byte_offset` - Starting logical byte offset.
/// * `byte_delta` - Additional byte offset within the requested operation.
/// * `block_size` - Request block size in bytes.
///
/// # Returns
/// A tuple of `(block_sector, in_block_offset)`.
///
/// # Panics
/// Panics if the resulting byte offset overflows.
#[must_use]
pub fn locate_byte(byte_offset: u64, byte_delta: usize, block_size: usize) -> (u64, usize) {
    let absolute = byte_offset
        .checked_add(byte_delta as u64)
        .expect("byte offset overflow");
    let block = absolute / block_size as u64;
    let in_block =
        usize::try_from(absolute % block_size as u64).expect("block offset exceeds usize");
    let sectors_per_block = (block_size >> SECTOR_SHIFT) as u64;
    (block * sectors_per_block, in_block)
}
