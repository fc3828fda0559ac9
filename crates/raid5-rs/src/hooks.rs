//! Host-side collaborators the engine calls out to.

use std::sync::Arc;

use crate::engine::HostDone;
use crate::layout::block::Block;
use crate::retention::array::Array;

/// CachedBlock is a host buffer found by a coalescing lookup.
pub struct CachedBlock {
    pub data: Block,
    pub dirty: bool,
    /// Owned by someone else right now; must not be written out.
    pub locked: bool,
    /// Called once the block has been written (or the write failed).
    pub done: HostDone,
}

/// BlockCacheLookup answers whether the host holds a dirty buffer for a sector.
pub trait BlockCacheLookup: Send + Sync + 'static {
    /// `find_cached` is best effort; `None` is never an error.
    ///
    /// Called with the engine's lock held: must not block or call back
    /// into the engine.
    ///
    /// Returning a block hands it to the engine, which writes it out in the
    /// current round when it is dirty and unlocked and drops it otherwise.
    fn find_cached(&self, logical_sector: u64, size: usize) -> Option<CachedBlock>;
}

/// MetadataStore persists member roles and failure state.
pub trait MetadataStore: Send + Sync + 'static {
    /// # Errors
    /// Returns an error if the state could not be written to stable storage.
    fn persist(&self, array: &Array) -> anyhow::Result<()>;
}

/// RecoveryScheduler is woken when a member fails so rebuild can be planned.
pub trait RecoveryScheduler: Send + Sync + 'static {
    fn wake(&self);
}

pub struct NoBlockCache;

impl BlockCacheLookup for NoBlockCache {
    fn find_cached(&self, _logical_sector: u64, _size: usize) -> Option<CachedBlock> {
        None
    }
}

pub struct NullMetadata;

impl MetadataStore for NullMetadata {
    fn persist(&self, _array: &Array) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct IdleRecovery;

impl RecoveryScheduler for IdleRecovery {
    fn wake(&self) {}
}

/// Hooks bundles the host collaborators handed to [`crate::Raid5::new`].
#[derive(Clone)]
pub struct Hooks {
    pub block_cache: Arc<dyn BlockCacheLookup>,
    pub metadata: Arc<dyn MetadataStore>,
    pub recovery: Arc<dyn RecoveryScheduler>,
}

impl Default for Hooks {
    fn default() -> Self {
        Self {
            block_cache: Arc::new(NoBlockCache),
            metadata: Arc::new(NullMetadata),
            recovery: Arc::new(IdleRecovery),
        }
    }
}
