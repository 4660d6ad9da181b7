//! Store instrumentation.
//!
//! [`ProbedStore`] wraps any store, counting writes and tracking how many are in progress at once.
//! It can also slow down or fail chunk writes, to observe the writer under bad I/O.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use zarrs::storage::{
    ListableStorageTraits, MaybeBytes, MaybeBytesIterator, OffsetBytesIterator,
    ReadableStorageTraits, StorageError, StoreKey, StoreKeys, StoreKeysPrefixes, StorePrefix,
    WritableStorageTraits,
    byte_range::{ByteRange, ByteRangeIterator},
};

/// Keys which hold zarr metadata rather than chunk data.
const METADATA_SUFFIXES: [&str; 5] = ["zarr.json", ".zarray", ".zgroup", ".zattrs", ".zmetadata"];

fn is_metadata_key(key: &StoreKey) -> bool {
    let name = key.as_str().rsplit('/').next().unwrap_or_default();
    METADATA_SUFFIXES.contains(&name)
}

/// Counters shared between a [`ProbedStore`] and its observers.
#[derive(Debug, Default)]
pub struct StoreProbe {
    chunk_sets: AtomicU64,
    metadata_sets: AtomicU64,
    bytes_written: AtomicU64,
    erases: AtomicU64,
    active: AtomicUsize,
    peak_active: AtomicUsize,
}

impl StoreProbe {
    /// Number of chunk (or shard) values written.
    pub fn chunk_sets(&self) -> u64 {
        self.chunk_sets.load(Ordering::SeqCst)
    }

    pub fn metadata_sets(&self) -> u64 {
        self.metadata_sets.load(Ordering::SeqCst)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::SeqCst)
    }

    pub fn erases(&self) -> u64 {
        self.erases.load(Ordering::SeqCst)
    }

    /// Largest number of chunk writes observed in progress at the same time.
    pub fn peak_concurrent_sets(&self) -> usize {
        self.peak_active.load(Ordering::SeqCst)
    }

    fn enter(&self) -> ActiveSet<'_> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active.fetch_max(now, Ordering::SeqCst);
        ActiveSet(self)
    }
}

/// Marks one chunk write in progress for as long as it lives.
struct ActiveSet<'a>(&'a StoreProbe);

impl Drop for ActiveSet<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct ProbedStore<S> {
    inner: S,
    probe: Arc<StoreProbe>,
    latency: Option<Duration>,
    fail_chunk_sets: AtomicBool,
}

impl<S> ProbedStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            probe: Default::default(),
            latency: None,
            fail_chunk_sets: AtomicBool::new(false),
        }
    }

    /// Sleep for `latency` inside every chunk write.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Make every subsequent chunk write fail (or succeed again).
    pub fn fail_chunk_writes(&self, fail: bool) {
        self.fail_chunk_sets.store(fail, Ordering::SeqCst);
    }

    pub fn probe(&self) -> Arc<StoreProbe> {
        self.probe.clone()
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: WritableStorageTraits> WritableStorageTraits for ProbedStore<S> {
    fn set(&self, key: &StoreKey, value: Bytes) -> Result<(), StorageError> {
        if is_metadata_key(key) {
            self.probe.metadata_sets.fetch_add(1, Ordering::SeqCst);
            return self.inner.set(key, value);
        }
        let _active = self.probe.enter();
        if let Some(latency) = self.latency {
            std::thread::sleep(latency);
        }
        if self.fail_chunk_sets.load(Ordering::SeqCst) {
            return Err(StorageError::Other(format!("injected write failure for {key}")));
        }
        self.probe.chunk_sets.fetch_add(1, Ordering::SeqCst);
        self.probe
            .bytes_written
            .fetch_add(value.len() as u64, Ordering::SeqCst);
        self.inner.set(key, value)
    }

    fn set_partial_many(
        &self,
        key: &StoreKey,
        offset_values: OffsetBytesIterator,
    ) -> Result<(), StorageError> {
        self.inner.set_partial_many(key, offset_values)
    }

    fn erase(&self, key: &StoreKey) -> Result<(), StorageError> {
        self.probe.erases.fetch_add(1, Ordering::SeqCst);
        self.inner.erase(key)
    }

    fn erase_prefix(&self, prefix: &StorePrefix) -> Result<(), StorageError> {
        self.probe.erases.fetch_add(1, Ordering::SeqCst);
        self.inner.erase_prefix(prefix)
    }

    fn supports_set_partial(&self) -> bool {
        self.inner.supports_set_partial()
    }
}

impl<S: ReadableStorageTraits> ReadableStorageTraits for ProbedStore<S> {
    fn get(&self, key: &StoreKey) -> Result<MaybeBytes, StorageError> {
        self.inner.get(key)
    }

    fn get_partial_many<'a>(
        &'a self,
        key: &StoreKey,
        byte_ranges: ByteRangeIterator<'a>,
    ) -> Result<MaybeBytesIterator<'a>, StorageError> {
        self.inner.get_partial_many(key, byte_ranges)
    }

    fn get_partial(&self, key: &StoreKey, byte_range: ByteRange) -> Result<MaybeBytes, StorageError> {
        self.inner.get_partial(key, byte_range)
    }

    fn size_key(&self, key: &StoreKey) -> Result<Option<u64>, StorageError> {
        self.inner.size_key(key)
    }

    fn supports_get_partial(&self) -> bool {
        self.inner.supports_get_partial()
    }
}

impl<S: ListableStorageTraits> ListableStorageTraits for ProbedStore<S> {
    fn list(&self) -> Result<StoreKeys, StorageError> {
        self.inner.list()
    }

    fn list_prefix(&self, prefix: &StorePrefix) -> Result<StoreKeys, StorageError> {
        self.inner.list_prefix(prefix)
    }

    fn list_dir(&self, prefix: &StorePrefix) -> Result<StoreKeysPrefixes, StorageError> {
        self.inner.list_dir(prefix)
    }

    fn size_prefix(&self, prefix: &StorePrefix) -> Result<u64, StorageError> {
        self.inner.size_prefix(prefix)
    }

    fn size(&self) -> Result<u64, StorageError> {
        self.inner.size()
    }
}

#[cfg(test)]
mod tests {
    use zarrs::storage::store::MemoryStore;

    use super::*;

    #[test]
    fn counts_chunk_and_metadata_writes_separately() {
        let store = ProbedStore::new(MemoryStore::new());
        let probe = store.probe();
        store
            .set(&StoreKey::new("a/zarr.json").unwrap(), Bytes::from_static(b"{}"))
            .unwrap();
        store
            .set(&StoreKey::new("a/c/0/0/0").unwrap(), Bytes::from_static(b"1234"))
            .unwrap();
        assert_eq!(probe.metadata_sets(), 1);
        assert_eq!(probe.chunk_sets(), 1);
        assert_eq!(probe.bytes_written(), 4);
        assert_eq!(probe.peak_concurrent_sets(), 1);
    }

    #[test]
    fn injected_failures_only_hit_chunks() {
        let store = ProbedStore::new(MemoryStore::new());
        store.fail_chunk_writes(true);
        assert!(
            store
                .set(&StoreKey::new("0/.zarray").unwrap(), Bytes::new())
                .is_ok()
        );
        assert!(
            store
                .set(&StoreKey::new("0/0/0/0").unwrap(), Bytes::new())
                .is_err()
        );
        assert!(store.get(&StoreKey::new("0/0/0/0").unwrap()).unwrap().is_none());
    }
}
