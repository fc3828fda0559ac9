//! Member disk I/O boundary: requests, completions and backends.

mod image;
mod mem;

#[cfg(test)]
mod disk_tests;

pub use image::{ImageDisk, ImageDisks};
pub use mem::{IoRecord, MemDisks};

use std::fmt;

use crate::layout::block::Block;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum IoOp {
    Read,
    Write,
}

/// Completion callback for one member I/O.
///
/// Receives the request's block back (filled in for reads) and whether the
/// transfer succeeded.
pub type IoDone = Box<dyn FnOnce(Block, bool) + Send + 'static>;

/// DiskRequest is one physical transfer against a single device.
pub struct DiskRequest {
    /// Device index in the backend's device table.
    pub dev: usize,
    pub op: IoOp,
    /// Sector on the device.
    pub sector: u64,
    /// Data to write, or destination for a read.
    pub buf: Block,
    done: IoDone,
}

impl DiskRequest {
    #[must_use]
    pub fn new(dev: usize, op: IoOp, sector: u64, buf: Block, done: IoDone) -> Self {
        Self {
            dev,
            op,
            sector,
            buf,
            done,
        }
    }

    /// Byte offset of the transfer on the device.
    #[must_use]
    pub const fn byte_offset(&self) -> u64 {
        self.sector << crate::layout::mapper::SECTOR_SHIFT
    }

    /// `finish` hands the block back to the engine and reports the outcome.
    ///
    /// May be called from any thread, including inline from `submit`.
    pub fn finish(self, ok: bool) {
        (self.done)(self.buf, ok);
    }
}

impl fmt::Debug for DiskRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskRequest")
            .field("dev", &self.dev)
            .field("op", &self.op)
            .field("sector", &self.sector)
            .field("len", &self.buf.len())
            .finish_non_exhaustive()
    }
}

/// DiskBackend issues physical I/O to member and spare devices.
pub trait DiskBackend: Send + Sync + 'static {
    /// `submit` starts one transfer; completion is reported through
    /// [`DiskRequest::finish`], possibly before `submit` returns.
    fn submit(&self, request: DiskRequest);

    /// `unplug` flushes any requests the backend batched up.
    fn unplug(&self) {}
}
