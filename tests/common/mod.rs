#![allow(dead_code)]

use std::sync::Arc;

use zarrs::array::Array;
use zarrs::storage::store::MemoryStore;
use zarrs::storage::{ReadableStorageTraits, ReadableWritableListableStorage, StoreKey};
use zarrs_live_pyramid::{Frame, WriterConfig};

pub fn init() {
    env_logger::try_init().ok();
}

pub fn memory_store() -> Arc<MemoryStore> {
    init();
    Arc::new(MemoryStore::new())
}

/// Isotropic voxels, so every level after 0 halves Z as well.
pub fn iso_config(frame_shape: [u64; 2], z: u64) -> WriterConfig {
    WriterConfig::new(frame_shape, z, [1.0, 1.0, 1.0])
}

/// Deterministic pseudo-random frame.
pub fn noise_frame(shape: [usize; 2], seed: u64) -> Frame {
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    Frame::from_fn(shape, |_, _| {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (state >> 48) as u16
    })
}

/// Shape and contents of a whole array.
pub fn read_array(store: ReadableWritableListableStorage, path: &str) -> (Vec<u64>, Vec<u16>) {
    let array = Array::open(store, path).expect("open array");
    let shape = array.shape().to_vec();
    let data: Vec<u16> = array
        .retrieve_array_subset(&array.subset_all())
        .expect("retrieve all data");
    (shape, data)
}

pub fn get_json(store: &ReadableWritableListableStorage, key: &str) -> Option<serde_json::Value> {
    let bytes = store
        .get(&StoreKey::new(key).expect("valid key"))
        .expect("store get")?;
    Some(serde_json::from_slice(&bytes).expect("valid json"))
}
