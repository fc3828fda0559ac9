use super::handle::WriteMethod;
use crate::cache::{Slot, Stripe};
use crate::layout::block::{Block, xor_blocks};
use crate::retention::disk::IoOp;

impl Stripe {
    /// # Panics
    /// Panics if slot `i` is not cached.
    pub(crate) fn cached(&self, i: usize) -> &Block {
        match self.old[i].as_ref() {
            Some(slot) => slot.expect_ready("old", i),
            None => panic!("stripe {}: no cached block for disk {i}", self.sector),
        }
    }

    /// `compute_block` rebuilds slot `missing` as the XOR of every other
    /// slot's cached block and caches the result.
    ///
    /// # Panics
    /// Panics if `missing` is already cached or any other slot is not.
    pub fn compute_block(&mut self, missing: usize) {
        assert!(
            self.old[missing].is_none(),
            "stripe {}: disk {missing} is already cached",
            self.sector
        );
        let mut dest = self.pool.take_block();
        dest.clear();
        let sources: Vec<&Block> = (0..self.disks())
            .filter(|&i| i != missing)
            .map(|i| self.cached(i))
            .collect();
        xor_blocks(&mut dest, &sources);
        self.old[missing] = Some(Slot::Ready(dest));
    }

    /// `compute_parity` stages a copy of every attached write and the new
    /// parity in `writeback`.
    ///
    /// # Arguments
    /// * `method` - Reconstruct-write needs every unattached data slot
    ///   cached; read-modify-write needs the parity and every written slot
    ///   cached.
    ///
    /// # Panics
    /// Panics if a block the method needs is not cached.
    pub fn compute_parity(&mut self, method: WriteMethod) {
        let pd = self.pd_idx;
        let disks = self.disks();

        for i in (0..disks).filter(|&i| i != pd) {
            let Some(att) = self.new[i].as_ref() else {
                continue;
            };
            assert_eq!(att.op, IoOp::Write, "stripe {}: read attached to a write round", self.sector);
            assert!(
                self.writeback[i].is_none(),
                "stripe {}: disk {i} already staged",
                self.sector
            );
            let mut copy = self.pool.take_block();
            copy.copy_from(att.buf.expect_ready("host", i));
            self.writeback[i] = Some(Slot::Ready(copy));
        }

        let mut parity = self.pool.take_block();
        match method {
            WriteMethod::ReconstructWrite => {
                parity.clear();
                let sources: Vec<&Block> = (0..disks)
                    .filter(|&i| i != pd)
                    .map(|i| match self.writeback[i].as_ref() {
                        Some(staged) => staged.expect_ready("writeback", i),
                        None => self.cached(i),
                    })
                    .collect();
                xor_blocks(&mut parity, &sources);
            }
            WriteMethod::ReadModifyWrite => {
                parity.copy_from(self.cached(pd));
                let mut sources: Vec<&Block> = Vec::new();
                for i in (0..disks).filter(|&i| i != pd) {
                    if let (Some(staged), Some(old)) = (self.writeback[i].as_ref(), self.old[i].as_ref()) {
                        sources.push(old.expect_ready("old", i));
                        sources.push(staged.expect_ready("writeback", i));
                    }
                }
                xor_blocks(&mut parity, &sources);
            }
        }

        assert!(
            self.writeback[pd].is_none(),
            "stripe {}: parity already staged",
            self.sector
        );
        self.writeback[pd] = Some(Slot::Ready(parity));
    }
}
