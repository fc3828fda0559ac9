use crate::layout::block::Block;

/// IoShadow is the header tracking where an attached host buffer goes.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct IoShadow {
    pub disk: usize,
    pub sector: u64,
}

/// BufferPool is a stripe's private supply of data blocks and I/O shadows.
///
/// Holds `2 * raid_disks` blocks (for `old` and `writeback`) and `raid_disks`
/// shadows (one per attached host buffer). Running dry is a bug in the
/// caller, not a condition to wait on.
#[derive(Debug)]
pub struct BufferPool {
    block_size: usize,
    blocks: Vec<Block>,
    shadows: Vec<IoShadow>,
    block_cap: usize,
    shadow_cap: usize,
}

impl BufferPool {
    #[must_use]
    pub fn new(raid_disks: usize, block_size: usize) -> Self {
        let block_cap = 2 * raid_disks;
        Self {
            block_size,
            blocks: (0..block_cap).map(|_| Block::zeroed(block_size)).collect(),
            shadows: vec![IoShadow::default(); raid_disks],
            block_cap,
            shadow_cap: raid_disks,
        }
    }

    #[must_use]
    pub const fn block_size(&self) -> usize {
        self.block_size
    }

    /// # Panics
    /// Panics if every block is already borrowed.
    pub fn take_block(&mut self) -> Block {
        self.blocks
            .pop()
            .unwrap_or_else(|| panic!("stripe buffer pool exhausted ({} blocks)", self.block_cap))
    }

    /// # Panics
    /// Panics if the block has the wrong size or was never borrowed.
    pub fn put_block(&mut self, block: Block) {
        assert_eq!(
            block.len(),
            self.block_size,
            "returned block has {} bytes, pool holds {}",
            block.len(),
            self.block_size
        );
        assert!(self.blocks.len() < self.block_cap, "buffer pool overfilled");
        self.blocks.push(block);
    }

    /// # Panics
    /// Panics if every shadow is already attached.
    pub fn take_shadow(&mut self, disk: usize, sector: u64) -> IoShadow {
        assert!(
            self.shadows.pop().is_some(),
            "stripe shadow pool exhausted ({} shadows)",
            self.shadow_cap
        );
        IoShadow { disk, sector }
    }

    /// # Panics
    /// Panics if more shadows come back than were handed out.
    pub fn put_shadow(&mut self, mut shadow: IoShadow) {
        assert!(self.shadows.len() < self.shadow_cap, "shadow pool overfilled");
        shadow.disk = 0;
        shadow.sector = 0;
        self.shadows.push(shadow);
    }

    #[must_use]
    pub fn free_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// True when every block and shadow is back home.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.blocks.len() == self.block_cap && self.shadows.len() == self.shadow_cap
    }

    /// `resize` swaps every block for one of `block_size` bytes.
    ///
    /// # Panics
    /// Panics if anything is still borrowed.
    pub fn resize(&mut self, block_size: usize) {
        assert!(self.is_full(), "resizing a buffer pool with borrowed blocks");
        if block_size == self.block_size {
            return;
        }
        self.block_size = block_size;
        for b in &mut self.blocks {
            *b = Block::zeroed(block_size);
        }
    }
}
