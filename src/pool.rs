//! Bounded pool of chunk writes.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::level::WriteJob;

/// Snapshot of write pool activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub in_flight: usize,
    /// Most writes ever pending at once; never exceeds the configured cap.
    pub peak_in_flight: usize,
}

#[derive(Default)]
struct SlotState {
    stats: WriteStats,
    errors: Vec<(usize, u64, crate::Error)>,
}

/// Counting semaphore over pending writes, which also collects their failures.
pub(crate) struct WriteSlots {
    cap: usize,
    state: Mutex<SlotState>,
    changed: Condvar,
}

impl WriteSlots {
    fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            state: Default::default(),
            changed: Condvar::new(),
        }
    }

    fn acquire(&self) {
        let mut state = self.state.lock();
        while state.stats.in_flight >= self.cap {
            self.changed.wait(&mut state);
        }
        let stats = &mut state.stats;
        stats.in_flight += 1;
        stats.submitted += 1;
        stats.peak_in_flight = stats.peak_in_flight.max(stats.in_flight);
    }

    fn release(&self, level: usize, z_block: u64, result: crate::Result<()>) {
        let mut state = self.state.lock();
        state.stats.in_flight -= 1;
        state.stats.completed += 1;
        if let Err(e) = result {
            state.stats.failed += 1;
            state.errors.push((level, z_block, e));
        }
        self.changed.notify_all();
    }

    fn wait_idle(&self) {
        let mut state = self.state.lock();
        while state.stats.in_flight > 0 {
            self.changed.wait(&mut state);
        }
    }

    pub fn stats(&self) -> WriteStats {
        self.state.lock().stats
    }
}

pub(crate) struct WritePool {
    threads: rayon::ThreadPool,
    slots: Arc<WriteSlots>,
}

impl WritePool {
    pub fn new(workers: usize, max_in_flight: usize) -> crate::Result<Self> {
        let threads = rayon::ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .thread_name(|i| format!("pyramid-write-{i}"))
            .build()
            .map_err(crate::Error::wrap)?;
        Ok(Self {
            threads,
            slots: Arc::new(WriteSlots::new(max_in_flight)),
        })
    }

    pub fn slots(&self) -> Arc<WriteSlots> {
        self.slots.clone()
    }

    /// Hand a block to a worker, blocking while the in-flight cap is reached.
    pub fn submit(&self, job: WriteJob) {
        self.slots.acquire();
        let slots = self.slots.clone();
        let (level, z_block) = (job.level, job.z_block);
        log::debug!("submitting level {level} block {z_block}");
        self.threads.spawn(move || {
            let result = catch_unwind(AssertUnwindSafe(move || job.run())).unwrap_or_else(|_| {
                Err(crate::Error::general(format!(
                    "write of level {level} block {z_block} panicked"
                )))
            });
            slots.release(level, z_block, result);
        });
    }

    /// Wait for every submitted write, returning the first failure.
    ///
    /// All failures are logged; none are retried.
    pub fn drain(&self) -> crate::Result<()> {
        self.slots.wait_idle();
        let errors = std::mem::take(&mut self.slots.state.lock().errors);
        let mut first = None;
        for (level, z_block, e) in errors {
            log::error!("write of level {level} block {z_block} failed: {e}");
            first.get_or_insert(e);
        }
        first.map_or(Ok(()), Err)
    }

    /// Wait for every submitted write, discarding failures.
    pub fn abandon(&self) {
        self.slots.wait_idle();
        let discarded = std::mem::take(&mut self.slots.state.lock().errors);
        if !discarded.is_empty() {
            log::warn!("discarding {} failed writes", discarded.len());
        }
    }
}
