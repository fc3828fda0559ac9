use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use super::{Actions, Raid5, Shared};

/// Stripes handled between two backend unplugs.
const UNPLUG_BATCH: usize = 16;
const DRAIN_WAIT: Duration = Duration::from_millis(10);

impl Shared {
    /// `sweep` runs the state machine on every stripe that is waiting for it.
    ///
    /// A bucket's chain is rescanned from its head after each handled
    /// stripe; a stripe is handled at most once per sweep.
    fn sweep(self: &Arc<Self>) -> usize {
        let buckets = self.conf.lock().cache.bucket_count();
        let mut handled = 0;
        let mut run = 0;
        for b in 0..buckets {
            let mut seen: Vec<usize> = Vec::new();
            loop {
                let mut actions = Actions::default();
                {
                    let mut conf = self.conf.lock();
                    let next = {
                        let cache = &conf.cache;
                        cache
                            .chain(b)
                            .find(|&i| cache.stripe(i).needs_handling() && !seen.contains(&i))
                    };
                    let Some(idx) = next else {
                        break;
                    };
                    seen.push(idx);
                    self.handle_stripe(&mut conf.cache, idx, &mut actions);
                    if conf.cache.stripe(idx).needs_handling() {
                        conf.wake_pending = true;
                    }
                }
                self.dispatch(actions);
                handled += 1;
                run += 1;
                if run >= UNPLUG_BATCH {
                    self.backend.unplug();
                    run = 0;
                }
            }
        }
        if run > 0 {
            self.backend.unplug();
        }
        handled
    }

    fn worker_loop(self: Arc<Self>) {
        debug!("raid5 worker started");
        loop {
            {
                let mut conf = self.conf.lock();
                while !conf.wake_pending && conf.worker_running {
                    self.work.wait(&mut conf);
                }
                if !conf.worker_running {
                    break;
                }
                conf.wake_pending = false;
            }
            self.sweep();
        }
        debug!("raid5 worker stopped");
    }
}

impl Raid5 {
    /// `run_pending` performs one worker sweep in the caller's thread.
    ///
    /// # Returns
    /// The number of stripes handled.
    pub fn run_pending(&self) -> usize {
        self.shared.conf.lock().wake_pending = false;
        self.shared.sweep()
    }

    /// Sweeps until a sweep finds nothing to do.
    pub fn run_until_idle(&self) -> usize {
        let mut total = 0;
        loop {
            let n = self.run_pending();
            if n == 0 {
                return total;
            }
            total += n;
        }
    }

    /// `spawn_worker` starts the background worker thread.
    ///
    /// # Errors
    /// Returns an error if a worker is already running, the array is
    /// stopped or the thread cannot be spawned.
    pub fn spawn_worker(&self) -> anyhow::Result<()> {
        let mut slot = self.worker.lock();
        if slot.is_some() {
            anyhow::bail!("raid5 worker already running");
        }
        {
            let mut conf = self.shared.conf.lock();
            if conf.stopping {
                anyhow::bail!("array is stopped");
            }
            conf.worker_running = true;
            conf.wake_pending = true;
        }
        let shared = Arc::clone(&self.shared);
        let spawned = std::thread::Builder::new()
            .name("raid5d".into())
            .spawn(move || shared.worker_loop());
        match spawned {
            Ok(handle) => {
                *slot = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.shared.conf.lock().worker_running = false;
                Err(e.into())
            }
        }
    }

    /// `stop` refuses new requests, drains the stripe cache and joins the
    /// worker.
    ///
    /// Waits for rounds still in flight to finish.
    ///
    /// # Errors
    /// Returns an error if the array was already stopped.
    pub fn stop(&self) -> anyhow::Result<()> {
        {
            let mut conf = self.shared.conf.lock();
            if conf.stopping {
                anyhow::bail!("array already stopped");
            }
            conf.stopping = true;
        }
        loop {
            let mut conf = self.shared.conf.lock();
            if conf.cache.drain() {
                break;
            }
            if conf.worker_running {
                self.shared.wake_worker(&mut conf);
                self.shared.released.wait_for(&mut conf, DRAIN_WAIT);
                continue;
            }
            drop(conf);
            if self.run_pending() == 0 {
                let mut conf = self.shared.conf.lock();
                self.shared.released.wait_for(&mut conf, DRAIN_WAIT);
            }
        }
        self.shutdown_worker();
        info!("raid5 array stopped; stripe cache drained");
        Ok(())
    }

    pub(super) fn shutdown_worker(&self) {
        let Some(handle) = self.worker.lock().take() else {
            return;
        };
        {
            let mut conf = self.shared.conf.lock();
            conf.worker_running = false;
            self.shared.work.notify_all();
        }
        if handle.join().is_err() {
            error!("raid5 worker panicked");
        }
    }
}
