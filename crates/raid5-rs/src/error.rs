//! Caller-visible request errors.

use thiserror::Error;

/// IoError is the outcome reported to a host request that did not complete.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum IoError {
    /// More members are unusable than parity can cover.
    #[error("array has lost redundancy: {failed_disks} member disk(s) failed")]
    ArrayFailed { failed_disks: usize },
    #[error("array is stopped")]
    Stopped,
    /// A sync round found no member to read or write slot `slot`.
    #[error("no usable member for slot {slot}")]
    MemberUnavailable { slot: usize },
}

/// RequestError rejects a host request before it reaches the stripe cache.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("sector {sector} is not aligned to the {size}-byte block size")]
    Misaligned { sector: u64, size: usize },
    #[error("unsupported block size {size} (chunk size {chunk_size})")]
    UnsupportedSize { size: usize, chunk_size: usize },
    #[error("sector {sector} is beyond the end of the volume ({capacity} sectors)")]
    OutOfRange { sector: u64, capacity: u64 },
    #[error("slot {slot} is not a member (raid_disks={raid_disks})")]
    NoSuchSlot { slot: usize, raid_disks: usize },
}
