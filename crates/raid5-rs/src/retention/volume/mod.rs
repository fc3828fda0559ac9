
use std::collections::BTreeMap;
use std::sync::mpsc;

use anyhow::{Context, Result, anyhow};
use tracing::info;

use crate::engine::{HostDone, HostRequest, Raid5, SyncDone, SyncKind, SyncRequest};
use crate::layout::block::Block;
use crate::layout::mapper::locate_byte;
use crate::retention::array::ResyncParity;
use crate::retention::disk::IoOp;

/// Volume is a byte-addressed view of a running array.
///
/// Every transfer is split into chunk-sized host requests. Bytes that only
/// partly cover a block are merged with the block's current contents
/// first, so concurrent writers to the same block are not isolated from
/// each other.
pub struct Volume {
    raid: Raid5,
    block_size: usize,
}

impl Volume {
    /// `new` takes over `raid` and starts its background worker.
    ///
    /// # Errors
    /// Returns an error if the worker cannot be started.
    pub fn new(raid: Raid5) -> Result<Self> {
        raid.spawn_worker()?;
        let block_size = raid.config().chunk_size;
        Ok(Self { raid, block_size })
    }

    pub fn raid(&self) -> &Raid5 {
        &self.raid
    }

    pub fn disk_status_string(&self) -> String {
        self.raid.status_string()
    }

    pub fn logical_capacity_bytes(&self) -> u64 {
        self.raid.config().capacity_bytes()
    }

    /// # Errors
    /// Returns an error if the range runs past the end of the volume or any
    /// block fails.
    pub fn write_bytes(&self, byte_offset: u64, payload: &[u8]) -> Result<()> {
        self.check_range(byte_offset, payload.len())?;
        let bs = self.block_size;

        let mut partial = Vec::new();
        let mut pieces = Vec::new();
        let mut written = 0;
        while written < payload.len() {
            let (sector, in_block) = locate_byte(byte_offset, written, bs);
            let take = (bs - in_block).min(payload.len() - written);
            if take < bs {
                partial.push(sector);
            }
            pieces.push((sector, in_block, written, take));
            written += take;
        }

        let mut current: BTreeMap<u64, Block> = partial
            .iter()
            .copied()
            .zip(self.transfer(partial.iter().map(|&s| (s, IoOp::Read, Block::zeroed(bs))).collect())?)
            .collect();

        let mut out = Vec::with_capacity(pieces.len());
        for (sector, in_block, from, take) in pieces {
            let mut block = current.remove(&sector).unwrap_or_else(|| Block::zeroed(bs));
            block.as_bytes_mut()[in_block..in_block + take].copy_from_slice(&payload[from..from + take]);
            out.push((sector, IoOp::Write, block));
        }
        self.transfer(out)?;
        Ok(())
    }

    /// # Errors
    /// Returns an error if the range runs past the end of the volume or any
    /// block fails.
    pub fn read_bytes(&self, byte_offset: u64, out: &mut [u8]) -> Result<()> {
        self.check_range(byte_offset, out.len())?;
        let bs = self.block_size;

        let mut pieces = Vec::new();
        let mut read = 0;
        while read < out.len() {
            let (sector, in_block) = locate_byte(byte_offset, read, bs);
            let take = (bs - in_block).min(out.len() - read);
            pieces.push((sector, in_block, read, take));
            read += take;
        }

        let blocks = self.transfer(pieces.iter().map(|p| (p.0, IoOp::Read, Block::zeroed(bs))).collect())?;
        for ((_, in_block, to, take), block) in pieces.into_iter().zip(blocks) {
            out[to..to + take].copy_from_slice(&block.as_bytes()[in_block..in_block + take]);
        }
        Ok(())
    }

    /// `rebuild_spare` regenerates the attached spare's slot and promotes it.
    ///
    /// Each row is one locked round in the engine: the other members are
    /// read, the slot's block is recomputed and written to the spare. Host
    /// writes to a row wait for its round instead of racing it.
    ///
    /// # Returns
    /// The slot the spare now serves.
    ///
    /// # Errors
    /// Returns an error if no spare is attached, the spare fails during the
    /// walk or the array stops serving requests.
    pub fn rebuild_spare(&self) -> Result<usize> {
        let Some(slot) = self.raid.array().spare().map(|s| s.slot) else {
            anyhow::bail!("no spare attached");
        };
        info!(slot, "rebuilding spare");
        self.walk_rows(SyncKind::Rebuild { slot }, || {
            if self.raid.array().spare().is_none() {
                anyhow::bail!("spare for slot {slot} was lost during rebuild");
            }
            Ok(())
        })?;
        self.raid.promote_spare()
    }

    /// `resync_parity` recomputes the parity of every stripe from its data.
    ///
    /// # Errors
    /// Returns an error if the array is degraded, a member fails during the
    /// walk or any round fails.
    pub fn resync_parity(&self) -> Result<()> {
        self.raid.begin_parity_resync()?;
        let walked = self.walk_rows(SyncKind::Parity, || {
            if self.raid.array().resync_parity() == ResyncParity::Interrupted {
                anyhow::bail!("parity resync interrupted by a disk failure");
            }
            Ok(())
        });
        let state = self.raid.end_parity_resync();
        walked?;
        if state != ResyncParity::InProgress {
            anyhow::bail!("parity resync ended in state {state:?}");
        }
        Ok(())
    }

    /// # Errors
    /// Returns an error if the array was already stopped.
    pub fn stop(&self) -> Result<()> {
        self.raid.stop()
    }

    /// `walk_rows` runs one sync round per stripe row, in order.
    ///
    /// `check` runs after each row and aborts the walk on error.
    fn walk_rows(&self, kind: SyncKind, check: impl Fn() -> Result<()>) -> Result<()> {
        let config = self.raid.config();
        let spc = self.raid.geometry().sectors_per_chunk;
        let rows = config.disk_size / config.chunk_size as u64;
        for row in 0..rows {
            let sector = row * spc;
            let (tx, rx) = mpsc::channel();
            let done: SyncDone = Box::new(move |r| {
                let _ = tx.send(r);
            });
            self.raid.sync_stripe(SyncRequest::new(sector, kind, done))?;
            let result = rx
                .recv()
                .map_err(|_| anyhow!("sync of row {row} was dropped without completing"))?;
            result.with_context(|| format!("{kind:?} sync of row {row}"))?;
            check()?;
        }
        Ok(())
    }

    fn check_range(&self, byte_offset: u64, len: usize) -> Result<()> {
        let end = byte_offset
            .checked_add(len as u64)
            .ok_or_else(|| anyhow!("byte range overflows"))?;
        if end > self.logical_capacity_bytes() {
            anyhow::bail!(
                "byte range {byte_offset}..{end} exceeds volume capacity {}",
                self.logical_capacity_bytes()
            );
        }
        Ok(())
    }

    /// `transfer` issues a batch of block requests and waits for all of them.
    ///
    /// # Returns
    /// The blocks handed back, in request order.
    fn transfer(&self, requests: Vec<(u64, IoOp, Block)>) -> Result<Vec<Block>> {
        let n = requests.len();
        let (tx, rx) = mpsc::channel();
        for (i, (sector, op, buf)) in requests.into_iter().enumerate() {
            let tx = tx.clone();
            let done: HostDone = Box::new(move |r| {
                let _ = tx.send((i, r));
            });
            self.raid.make_request(HostRequest::new(sector, op, buf, done))?;
        }
        drop(tx);

        let mut blocks: Vec<Option<Block>> = (0..n).map(|_| None).collect();
        for (i, result) in rx {
            blocks[i] = Some(result?);
        }
        blocks
            .into_iter()
            .enumerate()
            .map(|(i, b)| b.ok_or_else(|| anyhow!("block request {i} was dropped without completing")))
            .collect()
    }
}
