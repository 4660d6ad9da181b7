//! The streaming pyramid writer.
//!
//! Frames pushed by the caller go through a bounded queue to a single ingestion thread,
//! which appends them to level 0 and cascades downsampled planes to coarser levels
//! under one lock. Full blocks are written by a [`rayon`] pool with a cap on pending writes.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};
use std::thread::JoinHandle;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use zarrs::filesystem::FilesystemStore;
use zarrs::storage::ReadableWritableListableStorage;

use crate::config::{FinalizeMode, NgffVersion, PadPolicy, WriterConfig};
use crate::downsample::{Frame, xy_mean2x2, z_mean_pair};
use crate::group::open_or_create_pyramid;
use crate::level::Level;
use crate::plan::{PyramidSpec, level_count, plan_pyramid, xy_prelude_levels};
use crate::pool::{WritePool, WriteSlots, WriteStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    /// Constructed; no frames yet.
    Open,
    Streaming,
    /// No longer accepting frames; draining.
    Closing,
    /// Arrays trimmed to their true depth.
    Closed,
    /// Abandoned without finalizing; array contents are undefined.
    Aborted,
}

/// Final geometry of one level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelSummary {
    pub level: usize,
    /// Absolute node path of the level's array.
    pub path: String,
    pub shape: [u64; 3],
    pub chunk_shape: [u64; 3],
    pub shard_shape: Option<[u64; 3]>,
    /// Downsampling factors relative to level 0.
    pub factors: [u64; 3],
}

/// What a closed writer produced.
#[derive(Debug, Clone)]
pub struct PyramidSummary {
    pub group_path: String,
    pub ome_version: NgffVersion,
    pub frames: u64,
    pub levels: Vec<LevelSummary>,
    pub write_stats: WriteStats,
}

impl PyramidSummary {
    /// Depth of every level, finest first.
    pub fn depths(&self) -> Vec<u64> {
        self.levels.iter().map(|l| l.shape[0]).collect()
    }
}

/// Result of [`PyramidWriter::finish`].
pub enum Finished {
    Closed(PyramidSummary),
    Pending(CloseHandle),
}

/// A finalization running in the background.
pub struct CloseHandle {
    group_path: String,
    thread: JoinHandle<crate::Result<PyramidSummary>>,
}

impl CloseHandle {
    pub fn group_path(&self) -> &str {
        &self.group_path
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Block until finalization is complete.
    pub fn wait(self) -> crate::Result<PyramidSummary> {
        self.thread
            .join()
            .unwrap_or_else(|_| Err(crate::Error::general("finalize thread panicked")))
    }
}

/// Buffers and arrays of every level. Only ever touched under [`Shared::pyramid`].
struct Pyramid {
    spec: PyramidSpec,
    group_path: String,
    ome_version: NgffVersion,
    pad_policy: PadPolicy,
    levels: Vec<Level>,
    pool: WritePool,
    frames: u64,
}

impl Pyramid {
    fn ingest(&mut self, frame: Frame) -> crate::Result<()> {
        self.frames += 1;
        self.cascade(0, frame)
    }

    /// Append `plane` to `level`, then feed its downsampled candidates upwards
    /// until a level holds it back for pairing or the top is reached.
    fn cascade(&mut self, mut level: usize, mut plane: Frame) -> crate::Result<()> {
        loop {
            if let Some(job) = self.levels[level].append(&plane)? {
                self.pool.submit(job);
            }
            level += 1;
            if level >= self.levels.len() {
                return Ok(());
            }
            let mut candidate = xy_mean2x2(&plane);
            if self.spec.pairs_in_z(level) {
                match self.levels[level].pair.take() {
                    None => {
                        self.levels[level].pair = Some(candidate);
                        return Ok(());
                    }
                    Some(previous) => candidate = z_mean_pair(&previous, &candidate)?,
                }
            }
            plane = candidate;
        }
    }

    /// Complete every pending pair, lowest level first.
    ///
    /// Completing a pair can leave a new candidate pending at a higher level,
    /// so this repeats until none remain.
    fn flush_pairs(&mut self) -> crate::Result<()> {
        while let Some(level) = self.levels.iter().position(|l| l.pair.is_some()) {
            let Some(pending) = self.levels[level].pair.take() else {
                continue;
            };
            let partner = match self.pad_policy {
                PadPolicy::Duplicate => pending.clone(),
                PadPolicy::Zeros => Frame::zeros(pending.shape()),
                PadPolicy::Drop => {
                    log::debug!("level {level}: dropping unpaired plane");
                    continue;
                }
            };
            let plane = z_mean_pair(&pending, &partner)?;
            self.cascade(level, plane)?;
        }
        Ok(())
    }

    fn pad_active(&mut self) {
        for level in &mut self.levels {
            if let Some(job) = level.pad(self.pad_policy) {
                self.pool.submit(job);
            }
        }
    }

    fn finalize(mut self) -> crate::Result<PyramidSummary> {
        let flushed = self.flush_pairs().map(|()| self.pad_active());
        let drained = self.pool.drain();
        flushed?;
        drained?;
        for level in &self.levels {
            level.resize()?;
        }
        Ok(self.summary())
    }

    /// Wait for pending writes, discarding buffers and failures.
    fn abandon(self) {
        self.pool.abandon();
    }

    fn summary(&self) -> PyramidSummary {
        let levels = self
            .levels
            .iter()
            .map(|level| {
                let plan = level.plan();
                LevelSummary {
                    level: plan.level,
                    path: level.path(),
                    shape: [level.z_count(), plan.shape[1], plan.shape[2]],
                    chunk_shape: plan.chunk_shape,
                    shard_shape: plan.shard_shape,
                    factors: self.spec.factors(plan.level),
                }
            })
            .collect();
        PyramidSummary {
            group_path: self.group_path.clone(),
            ome_version: self.ome_version,
            frames: self.frames,
            levels,
            write_stats: self.pool.slots().stats(),
        }
    }
}

struct Shared {
    pyramid: Mutex<Option<Pyramid>>,
    state: Mutex<WriterState>,
    aborted: AtomicBool,
}

impl Shared {
    fn set_state(&self, state: WriterState) {
        *self.state.lock() = state;
    }
}

fn consume(frames: Receiver<Frame>, shared: Arc<Shared>) -> crate::Result<()> {
    for frame in frames {
        if shared.aborted.load(Ordering::SeqCst) {
            continue;
        }
        let mut guard = shared.pyramid.lock();
        let Some(pyramid) = guard.as_mut() else {
            break;
        };
        if let Err(e) = pyramid.ingest(frame) {
            log::error!("ingestion stopped: {e}");
            return Err(e);
        }
    }
    Ok(())
}

/// Everything needed to finish a writer, detached from it so it can move to another thread.
struct Finalizer {
    shared: Arc<Shared>,
    sender: Option<SyncSender<Frame>>,
    consumer: Option<JoinHandle<crate::Result<()>>>,
}

impl Finalizer {
    fn run(self) -> crate::Result<PyramidSummary> {
        self.shared.set_state(WriterState::Closing);
        drop(self.sender);
        let ingested = match self.consumer.map(JoinHandle::join) {
            Some(Ok(result)) => result,
            Some(Err(_)) => Err(crate::Error::general("ingestion thread panicked")),
            None => Ok(()),
        };
        let pyramid = self
            .shared
            .pyramid
            .lock()
            .take()
            .ok_or(crate::Error::Closed("closed"))?;
        let result = match ingested {
            Ok(()) => pyramid.finalize(),
            Err(e) => {
                pyramid.abandon();
                Err(e)
            }
        };
        self.shared.set_state(WriterState::Closed);
        match &result {
            Ok(summary) => log::info!(
                "closed pyramid at {}: {} frames, level depths {:?}",
                summary.group_path,
                summary.frames,
                summary.depths()
            ),
            Err(e) => log::error!("closing pyramid failed: {e}"),
        }
        result
    }
}

/// Streams frames into a multiscale pyramid.
///
/// Must be finished with [`close`](Self::close), [`close_async`](Self::close_async),
/// [`finish`](Self::finish) or [`abort`](Self::abort);
/// a writer dropped without any of these is aborted.
pub struct PyramidWriter {
    config: WriterConfig,
    spec: PyramidSpec,
    group_path: String,
    shared: Arc<Shared>,
    sender: Option<SyncSender<Frame>>,
    consumer: Option<JoinHandle<crate::Result<()>>>,
    slots: Arc<WriteSlots>,
    frames_accepted: u64,
}

impl PyramidWriter {
    /// Write to a filesystem store at `config.store_path`.
    pub fn create(config: WriterConfig) -> crate::Result<Self> {
        let Some(path) = config.store_path.as_deref() else {
            return Err(crate::Error::InvalidConfig(
                "store_path is required for a filesystem store".into(),
            ));
        };
        std::fs::create_dir_all(path)?;
        let store = open_filesystem_store(path)?;
        Self::with_store(store, config)
    }

    /// Write to any store.
    pub fn with_store(
        store: ReadableWritableListableStorage,
        config: WriterConfig,
    ) -> crate::Result<Self> {
        config.validate()?;
        let [y, x] = config.frame_shape;
        let full = [config.z_size_estimate, y, x];
        let prelude = xy_prelude_levels(config.voxel_size);
        let spec = PyramidSpec {
            z_size_estimate: config.z_size_estimate,
            y,
            x,
            levels: level_count(full, prelude, config.min_level_dim, config.max_levels),
            xy_prelude_levels: prelude,
        };
        let plans = plan_pyramid(&spec, &config.chunk_scheme, config.effective_shard_shape());
        for plan in &plans {
            log::debug!(
                "level {}: shape {:?}, chunk {:?}, shard {:?}",
                plan.level,
                plan.shape,
                plan.chunk_shape,
                plan.shard_shape
            );
        }

        let arrays = open_or_create_pyramid(&store, &config, &spec, &plans)?;
        drop(store);
        let pool = WritePool::new(config.write_workers, config.max_in_flight)?;
        let slots = pool.slots();
        let group_path = arrays.group_path.clone();
        let pyramid = Pyramid {
            spec,
            group_path: arrays.group_path,
            ome_version: config.ome_version,
            pad_policy: config.pad_policy,
            levels: arrays
                .levels
                .into_iter()
                .map(|handle| Level::new(handle.plan, handle.array, handle.reused))
                .collect(),
            pool,
            frames: 0,
        };

        let shared = Arc::new(Shared {
            pyramid: Mutex::new(Some(pyramid)),
            state: Mutex::new(WriterState::Open),
            aborted: AtomicBool::new(false),
        });
        let (sender, receiver) = sync_channel(config.queue_capacity);
        let consumer = std::thread::Builder::new()
            .name("pyramid-ingest".into())
            .spawn({
                let shared = shared.clone();
                move || consume(receiver, shared)
            })?;

        Ok(Self {
            config,
            spec,
            group_path,
            shared,
            sender: Some(sender),
            consumer: Some(consumer),
            slots,
            frames_accepted: 0,
        })
    }

    pub fn config(&self) -> &WriterConfig {
        &self.config
    }

    pub fn spec(&self) -> &PyramidSpec {
        &self.spec
    }

    pub fn group_path(&self) -> &str {
        &self.group_path
    }

    pub fn state(&self) -> WriterState {
        *self.shared.state.lock()
    }

    pub fn frames_accepted(&self) -> u64 {
        self.frames_accepted
    }

    /// Planes appended to each level so far.
    ///
    /// Frames still queued are not yet counted.
    pub fn level_depths(&self) -> Vec<u64> {
        self.shared
            .pyramid
            .lock()
            .as_ref()
            .map(|p| p.levels.iter().map(Level::z_count).collect())
            .unwrap_or_default()
    }

    pub fn write_stats(&self) -> WriteStats {
        self.slots.stats()
    }

    /// Queue a frame, blocking while the queue is full.
    pub fn push(&mut self, frame: Frame) -> crate::Result<()> {
        match self.state() {
            WriterState::Open | WriterState::Streaming => {}
            WriterState::Aborted => return Err(crate::Error::Closed("aborted")),
            WriterState::Closing | WriterState::Closed => {
                return Err(crate::Error::Closed("closed"));
            }
        }
        let [y, x] = self.config.frame_shape;
        let expected = [y as usize, x as usize];
        if frame.shape() != expected {
            return Err(crate::Error::FrameShape {
                expected,
                received: frame.shape(),
            });
        }
        let limit = self.config.z_size_estimate;
        if self.frames_accepted >= limit {
            return Err(crate::Error::DepthExceeded {
                index: self.frames_accepted,
                limit,
            });
        }
        let sender = self.sender.as_ref().ok_or(crate::Error::Closed("closed"))?;
        sender.send(frame).map_err(|_| crate::Error::WriterFailed)?;
        if self.frames_accepted == 0 {
            self.shared.set_state(WriterState::Streaming);
        }
        self.frames_accepted += 1;
        Ok(())
    }

    fn take_finalizer(&mut self) -> Finalizer {
        Finalizer {
            shared: self.shared.clone(),
            sender: self.sender.take(),
            consumer: self.consumer.take(),
        }
    }

    /// Finalize, blocking until every level is written and trimmed.
    pub fn close(mut self) -> crate::Result<PyramidSummary> {
        self.take_finalizer().run()
    }

    /// Finalize on a background thread.
    pub fn close_async(mut self) -> crate::Result<CloseHandle> {
        let finalizer = self.take_finalizer();
        let thread = std::thread::Builder::new()
            .name("pyramid-finalize".into())
            .spawn(move || finalizer.run())?;
        Ok(CloseHandle {
            group_path: self.group_path.clone(),
            thread,
        })
    }

    /// Finalize according to the configured [`FinalizeMode`].
    pub fn finish(self) -> crate::Result<Finished> {
        match self.config.finalize {
            FinalizeMode::Blocking => self.close().map(Finished::Closed),
            FinalizeMode::Background => self.close_async().map(Finished::Pending),
        }
    }

    /// Stop without finalizing.
    ///
    /// Queued frames and partial buffers are discarded; writes already submitted are waited for.
    /// Array contents and depths are undefined afterwards. Never fails.
    pub fn abort(&mut self) {
        if matches!(self.state(), WriterState::Closed | WriterState::Aborted) {
            return;
        }
        self.shared.aborted.store(true, Ordering::SeqCst);
        drop(self.sender.take());
        if let Some(consumer) = self.consumer.take() {
            match consumer.join() {
                Ok(Err(e)) => log::debug!("ingestion had failed before abort: {e}"),
                Err(_) => log::warn!("ingestion thread panicked"),
                Ok(Ok(())) => {}
            }
        }
        let pyramid = self.shared.pyramid.lock().take();
        if let Some(pyramid) = pyramid {
            pyramid.abandon();
        }
        self.shared.set_state(WriterState::Aborted);
        log::warn!(
            "aborted pyramid at {} after {} frames",
            self.group_path,
            self.frames_accepted
        );
    }
}

impl Drop for PyramidWriter {
    fn drop(&mut self) {
        if self.consumer.is_some() {
            log::warn!("pyramid writer at {} dropped without close", self.group_path);
            self.abort();
        }
    }
}

fn open_filesystem_store(path: &Path) -> crate::Result<ReadableWritableListableStorage> {
    let store = FilesystemStore::new(path).map_err(crate::Error::wrap)?;
    Ok(Arc::new(store))
}
