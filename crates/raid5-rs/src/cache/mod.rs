//! Hash-indexed stripe cache with clock-sweep eviction.

pub mod pool;
pub mod stripe;

#[cfg(test)]
mod cache_tests;

pub use pool::{BufferPool, IoShadow};
pub use stripe::{Attached, Phase, Slot, Stripe, SyncRound};

use tracing::debug;

use crate::layout::mapper::SECTOR_SHIFT;

/// Outcome of [`StripeCache::get_or_create`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Acquire {
    /// Referenced stripe, ready for attachment.
    Ready(usize),
    /// Locked by an in-flight round, or a block size change is waiting
    /// for the old stripes to finish.
    Busy,
    /// No stripe could be freed.
    Exhausted,
}

/// CacheStats is a point-in-time census of the cache.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub nr_stripes: usize,
    pub hashed: usize,
    /// Hashed and idle, holding cached blocks.
    pub cached: usize,
    pub free: usize,
    /// Stripes with a round in progress.
    pub pending: usize,
    pub locked: usize,
    pub handled: u64,
    pub reconstruct_writes: u64,
    pub read_modify_writes: u64,
}

/// StripeCache owns every stripe; callers refer to them by arena index.
#[derive(Debug)]
pub struct StripeCache {
    stripes: Vec<Stripe>,
    buckets: Vec<Option<usize>>,
    free: Vec<usize>,
    clock: usize,
    buffer_size: usize,
    nr_hashed: usize,
    pub(crate) handled: u64,
    pub(crate) reconstruct_writes: u64,
    pub(crate) read_modify_writes: u64,
}

impl StripeCache {
    /// # Panics
    /// Panics if `hash_buckets` is not a power of two.
    #[must_use]
    pub fn new(nr_stripes: usize, hash_buckets: usize, raid_disks: usize, buffer_size: usize) -> Self {
        assert!(
            hash_buckets.is_power_of_two(),
            "hash bucket count {hash_buckets} is not a power of two"
        );
        Self {
            stripes: (0..nr_stripes)
                .map(|_| Stripe::new(raid_disks, buffer_size))
                .collect(),
            buckets: vec![None; hash_buckets],
            free: (0..nr_stripes).rev().collect(),
            clock: 0,
            buffer_size,
            nr_hashed: 0,
            handled: 0,
            reconstruct_writes: 0,
            read_modify_writes: 0,
        }
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.stripes.len()
    }

    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    #[must_use]
    pub const fn hashed_count(&self) -> usize {
        self.nr_hashed
    }

    #[must_use]
    pub const fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    #[must_use]
    pub fn stripe(&self, idx: usize) -> &Stripe {
        &self.stripes[idx]
    }

    pub fn stripe_mut(&mut self, idx: usize) -> &mut Stripe {
        &mut self.stripes[idx]
    }

    fn bucket_of(&self, sector: u64) -> usize {
        let per_block = (self.buffer_size >> SECTOR_SHIFT).max(1) as u64;
        // Truncation is fine: only the masked low bits are used.
        #[allow(clippy::cast_possible_truncation)]
        let h = (sector / per_block) as usize;
        h & (self.buckets.len() - 1)
    }

    /// `chain` walks the stripes hashed into bucket `b`.
    pub fn chain(&self, b: usize) -> impl Iterator<Item = usize> + '_ {
        std::iter::successors(self.buckets[b], |&idx| self.stripes[idx].hash_next)
    }

    /// `find` looks up the stripe for `(sector, size)`.
    #[must_use]
    pub fn find(&self, sector: u64, size: usize) -> Option<usize> {
        if size != self.buffer_size {
            return None;
        }
        self.chain(self.bucket_of(sector)).find(|&idx| {
            let sh = &self.stripes[idx];
            sh.sector == sector && sh.size == size
        })
    }

    /// `get_or_create` returns a referenced stripe for `(sector, size)`,
    /// allocating one from the free list (evicting if needed) on a miss.
    ///
    /// A different block size first sweeps the whole cache; until every
    /// stripe of the old size is gone the caller sees [`Acquire::Busy`].
    pub fn get_or_create(&mut self, sector: u64, size: usize) -> Acquire {
        if size != self.buffer_size {
            self.evict(self.total());
            if self.nr_hashed > 0 {
                return Acquire::Busy;
            }
            debug!(from = self.buffer_size, to = size, "stripe cache block size changed");
            self.buffer_size = size;
        }

        if let Some(idx) = self.find(sector, size) {
            let sh = &mut self.stripes[idx];
            if sh.locked {
                return Acquire::Busy;
            }
            sh.refs += 1;
            return Acquire::Ready(idx);
        }

        let idx = if let Some(idx) = self.free.pop() {
            idx
        } else {
            let want = (self.total() / 8).max(1);
            let evicted = self.evict(want);
            debug!(want, evicted, "free stripe list empty; swept cache");
            match self.free.pop() {
                Some(idx) => idx,
                None => return Acquire::Exhausted,
            }
        };

        let sh = &mut self.stripes[idx];
        sh.reset(sector, size);
        sh.refs = 1;
        self.insert_hash(idx);
        Acquire::Ready(idx)
    }

    /// Drops one reference taken by [`Self::get_or_create`].
    ///
    /// # Panics
    /// Panics if the stripe holds no references.
    pub fn put_ref(&mut self, idx: usize) {
        let sh = &mut self.stripes[idx];
        assert!(sh.refs > 0, "stripe {} reference underflow", sh.sector);
        sh.refs -= 1;
    }

    fn insert_hash(&mut self, idx: usize) {
        let b = self.bucket_of(self.stripes[idx].sector);
        let sh = &mut self.stripes[idx];
        debug_assert!(!sh.hashed);
        sh.hash_next = self.buckets[b];
        sh.hashed = true;
        self.buckets[b] = Some(idx);
        self.nr_hashed += 1;
    }

    /// `evict` sweeps buckets from the saved clock position and returns up
    /// to `n` idle stripes to the free list.
    ///
    /// # Returns
    /// The number of stripes evicted.
    pub fn evict(&mut self, n: usize) -> usize {
        if n == 0 {
            return 0;
        }
        let nb = self.buckets.len();
        let mut count = 0;
        for i in 0..nb {
            let b = (self.clock + i) & (nb - 1);
            let mut prev: Option<usize> = None;
            let mut cur = self.buckets[b];
            while let Some(idx) = cur {
                let next = self.stripes[idx].hash_next;
                if self.stripes[idx].is_idle() {
                    match prev {
                        Some(p) => self.stripes[p].hash_next = next,
                        None => self.buckets[b] = next,
                    }
                    self.release(idx);
                    count += 1;
                    if count == n {
                        self.clock = b;
                        return count;
                    }
                } else {
                    prev = Some(idx);
                }
                cur = next;
            }
        }
        count
    }

    fn release(&mut self, idx: usize) {
        let sh = &mut self.stripes[idx];
        sh.hash_next = None;
        sh.hashed = false;
        sh.release_writeback();
        sh.release_old();
        assert!(
            sh.pool.is_full(),
            "evicting stripe {} with borrowed buffers",
            sh.sector
        );
        self.nr_hashed -= 1;
        self.free.push(idx);
    }

    /// `drain` evicts everything idle.
    ///
    /// # Returns
    /// True once every stripe is back on the free list.
    pub fn drain(&mut self) -> bool {
        self.evict(self.total());
        self.free.len() == self.total()
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let mut s = CacheStats {
            nr_stripes: self.total(),
            hashed: self.nr_hashed,
            free: self.free.len(),
            handled: self.handled,
            reconstruct_writes: self.reconstruct_writes,
            read_modify_writes: self.read_modify_writes,
            ..CacheStats::default()
        };
        for sh in self.stripes.iter().filter(|sh| sh.hashed) {
            if sh.phase == Phase::Complete {
                if !sh.locked && sh.refs == 0 {
                    s.cached += 1;
                }
            } else {
                s.pending += 1;
            }
            if sh.locked {
                s.locked += 1;
            }
        }
        s
    }
}
