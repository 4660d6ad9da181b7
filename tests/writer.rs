mod common;

use std::sync::Arc;
use std::time::Duration;

use zarrs::array::Array;
use zarrs::storage::store::MemoryStore;
use zarrs::storage::{ListableStorageTraits, ReadableStorageTraits, ReadableWritableListableStorage};
use zarrs_live_pyramid::codec::Compressor;
use zarrs_live_pyramid::plan::ChunkScheme;
use zarrs_live_pyramid::storage::ProbedStore;
use zarrs_live_pyramid::{
    Error, FinalizeMode, Finished, Frame, PadPolicy, PyramidSummary, PyramidWriter, Sharding,
    WriterConfig, WriterState,
};

use common::{iso_config, memory_store, noise_frame, read_array};

fn write_all(
    store: ReadableWritableListableStorage,
    config: WriterConfig,
    frames: impl IntoIterator<Item = Frame>,
) -> PyramidSummary {
    let mut writer = PyramidWriter::with_store(store, config).expect("create writer");
    for frame in frames {
        writer.push(frame).expect("push frame");
    }
    writer.close().expect("close writer")
}

fn constant_frames(shape: [usize; 2], n: u16) -> impl Iterator<Item = Frame> {
    (1..=n).map(move |v| Frame::filled(shape, v))
}

#[test]
fn test_trailing_block_is_padded_with_last_plane() {
    let probed = Arc::new(ProbedStore::new(MemoryStore::new()));
    let store: ReadableWritableListableStorage = probed.clone();
    let mut config = iso_config([256, 256], 10);
    config.max_levels = Some(2);
    config.chunk_scheme.base = [4, 256, 256];

    let summary = write_all(store.clone(), config, constant_frames([256, 256], 10));
    assert_eq!(summary.depths(), vec![10, 5]);
    assert_eq!(summary.frames, 10);
    // three level 0 blocks and a single level 1 block
    assert_eq!(probed.probe().chunk_sets(), 4);

    let array = Array::open(store.clone(), "/0").expect("open level 0");
    assert_eq!(array.shape(), &[10, 256, 256]);
    let last: Vec<u16> = array.retrieve_chunk(&[2, 0, 0]).expect("retrieve last chunk");
    let plane = 256 * 256;
    assert_eq!(last.len(), 4 * plane);
    for (z, expected) in [9, 10, 10, 10].into_iter().enumerate() {
        assert!(
            last[z * plane..(z + 1) * plane].iter().all(|&v| v == expected),
            "plane {z} of the last chunk"
        );
    }

    let (shape, data) = read_array(store, "/1");
    assert_eq!(shape, vec![5, 128, 128]);
    let plane = 128 * 128;
    for (z, expected) in [2, 4, 6, 8, 10].into_iter().enumerate() {
        assert_eq!(data[z * plane], expected, "level 1 plane {z}");
    }
}

#[test]
fn test_zeros_policy_keeps_depths() {
    let mut config = iso_config([256, 256], 10);
    config.max_levels = Some(2);
    config.chunk_scheme.base = [4, 256, 256];
    config.pad_policy = PadPolicy::Zeros;
    let summary = write_all(memory_store(), config, constant_frames([256, 256], 10));
    assert_eq!(summary.depths(), vec![10, 5]);
}

#[test]
fn test_xy_prelude_then_z_pairing() {
    let store: ReadableWritableListableStorage = memory_store();
    let mut config = WriterConfig::new([64, 64], 2, [2.0, 1.0, 1.0]);
    config.min_level_dim = 16;
    let mut frame = vec![0u16; 64 * 64];
    frame[2 * 64 + 4] = 100;
    let frame = Frame::new([64, 64], frame).expect("frame");

    let summary = write_all(store.clone(), config, [frame.clone(), frame]);
    assert_eq!(summary.depths(), vec![2, 2, 1]);
    assert_eq!(summary.levels[1].factors, [1, 2, 2]);
    assert_eq!(summary.levels[2].factors, [2, 4, 4]);

    let (shape, data) = read_array(store.clone(), "/1");
    assert_eq!(shape, vec![2, 32, 32]);
    assert_eq!(data[32 + 2], 25);
    assert_eq!(data[32 * 32 + 32 + 2], 25);

    let (shape, data) = read_array(store, "/2");
    assert_eq!(shape, vec![1, 16, 16]);
    assert_eq!(data[1], 6);
    assert_eq!(data.iter().filter(|&&v| v != 0).count(), 1);
}

#[test]
fn test_depths_follow_ceiling_halving() {
    let mut config = iso_config([64, 64], 7);
    config.min_level_dim = 8;
    let frames = (0..7).map(|i| noise_frame([64, 64], i));
    let summary = write_all(memory_store(), config, frames);
    assert_eq!(summary.depths(), vec![7, 4, 2, 1]);
}

#[test]
fn test_drop_policy_discards_incomplete_blocks() {
    let store: ReadableWritableListableStorage = memory_store();
    let mut config = iso_config([32, 32], 7);
    config.max_levels = Some(2);
    config.min_level_dim = 8;
    config.pad_policy = PadPolicy::Drop;
    config.chunk_scheme = ChunkScheme {
        base: [4, 32, 32],
        target: [1, 32, 32],
    };
    let summary = write_all(store.clone(), config, constant_frames([32, 32], 7));
    assert_eq!(summary.depths(), vec![4, 2]);

    let (shape, data) = read_array(store, "/1");
    assert_eq!(shape, vec![2, 16, 16]);
    assert_eq!(data[0], 2);
    assert_eq!(data[16 * 16], 4);
}

#[test]
fn test_zeros_policy_pairs_with_empty_plane() {
    let store: ReadableWritableListableStorage = memory_store();
    let mut config = iso_config([64, 64], 3);
    config.max_levels = Some(2);
    config.pad_policy = PadPolicy::Zeros;
    let frames = (0..3).map(|_| Frame::filled([64, 64], 100));
    let summary = write_all(store.clone(), config, frames);
    assert_eq!(summary.depths(), vec![3, 2]);

    let (_, data) = read_array(store, "/1");
    let plane = 32 * 32;
    assert!(data[..plane].iter().all(|&v| v == 100));
    assert!(data[plane..].iter().all(|&v| v == 50));
}

#[test]
fn test_output_is_deterministic() {
    let config = || {
        let mut config = iso_config([64, 64], 12);
        config.min_level_dim = 8;
        config.compressor = Compressor::Zstd {
            level: 3,
            checksum: false,
        };
        config.sharding = Sharding::Enabled { shape: [8, 64, 64] };
        config.chunk_scheme.base = [2, 32, 32];
        config
    };
    let frames = || (0..12).map(|i| noise_frame([64, 64], i));

    let a = memory_store();
    let b = memory_store();
    let summary = write_all(a.clone(), config(), frames());
    write_all(b.clone(), config(), frames());
    assert!(summary.levels.iter().all(|l| l.shard_shape.is_some()));

    let keys = a.list().expect("list a");
    assert_eq!(keys, b.list().expect("list b"));
    assert!(!keys.is_empty());
    for key in keys {
        assert_eq!(
            a.get(&key).expect("get a"),
            b.get(&key).expect("get b"),
            "contents of {key}"
        );
    }
}

#[test]
fn test_in_flight_writes_are_bounded() {
    let probed = Arc::new(ProbedStore::new(MemoryStore::new()).with_latency(Duration::from_millis(2)));
    let mut config = iso_config([32, 32], 16);
    config.min_level_dim = 8;
    config.max_in_flight = 2;
    config.write_workers = 4;
    config.chunk_scheme.base = [1, 16, 16];
    let frames = (0..16).map(|i| noise_frame([32, 32], i));

    let summary = write_all(probed.clone(), config, frames);
    let stats = summary.write_stats;
    assert!(stats.peak_in_flight <= 2, "{stats:?}");
    assert_eq!(stats.submitted, stats.completed);
    assert_eq!(stats.failed, 0);
    assert!(probed.probe().peak_concurrent_sets() <= 2);
    assert!(probed.probe().chunk_sets() >= 16 * 4);
}

#[test]
fn test_write_failure_is_reported_at_close() {
    let probed = Arc::new(ProbedStore::new(MemoryStore::new()));
    let mut config = iso_config([64, 64], 4);
    config.max_levels = Some(1);
    config.chunk_scheme.base = [2, 64, 64];
    let mut writer = PyramidWriter::with_store(probed.clone(), config).expect("create writer");
    probed.fail_chunk_writes(true);
    for frame in constant_frames([64, 64], 4) {
        writer.push(frame).expect("push frame");
    }
    let err = writer.close().expect_err("writes failed");
    assert!(matches!(err, Error::Array(_)), "{err}");
}

#[test]
fn test_push_checks_shape_and_depth() {
    let mut config = iso_config([64, 64], 3);
    config.max_levels = Some(1);
    let mut writer = PyramidWriter::with_store(memory_store(), config).expect("create writer");
    assert_eq!(writer.state(), WriterState::Open);

    let err = writer.push(Frame::zeros([64, 32])).expect_err("wrong shape");
    assert!(matches!(
        err,
        Error::FrameShape {
            expected: [64, 64],
            received: [64, 32]
        }
    ));

    for frame in constant_frames([64, 64], 3) {
        writer.push(frame).expect("push frame");
    }
    assert_eq!(writer.state(), WriterState::Streaming);
    let err = writer.push(Frame::zeros([64, 64])).expect_err("too deep");
    assert!(matches!(err, Error::DepthExceeded { index: 3, limit: 3 }));
    assert_eq!(writer.frames_accepted(), 3);

    let summary = writer.close().expect("close writer");
    assert_eq!(summary.depths(), vec![3]);
}

#[test]
fn test_abort_releases_store() {
    let probed = Arc::new(ProbedStore::new(MemoryStore::new()));
    let mut config = iso_config([64, 64], 10);
    config.min_level_dim = 16;
    let mut writer = PyramidWriter::with_store(probed.clone(), config).expect("create writer");
    for i in 0..5 {
        writer.push(noise_frame([64, 64], i)).expect("push frame");
    }
    writer.abort();
    assert_eq!(writer.state(), WriterState::Aborted);
    assert!(matches!(
        writer.push(noise_frame([64, 64], 5)),
        Err(Error::Closed(_))
    ));
    assert!(writer.level_depths().is_empty());
    assert_eq!(Arc::strong_count(&probed), 1);

    // aborting twice is harmless
    writer.abort();
    drop(writer);
    assert_eq!(Arc::strong_count(&probed), 1);
}

#[test]
fn test_dropped_writer_is_aborted() {
    let probed = Arc::new(ProbedStore::new(MemoryStore::new()));
    let config = iso_config([64, 64], 10);
    let mut writer = PyramidWriter::with_store(probed.clone(), config).expect("create writer");
    writer.push(Frame::filled([64, 64], 1)).expect("push frame");
    drop(writer);
    assert_eq!(Arc::strong_count(&probed), 1);
}

#[test]
fn test_background_finish() {
    let store: ReadableWritableListableStorage = memory_store();
    let mut config = iso_config([64, 64], 6);
    config.finalize = FinalizeMode::Background;
    config.group_path = "tile_2".into();
    let mut writer = PyramidWriter::with_store(store.clone(), config).expect("create writer");
    for i in 0..6 {
        writer.push(noise_frame([64, 64], i)).expect("push frame");
    }
    let handle = match writer.finish().expect("finish") {
        Finished::Pending(handle) => handle,
        Finished::Closed(_) => panic!("expected a background finalize"),
    };
    assert_eq!(handle.group_path(), "/tile_2");
    let summary = handle.wait().expect("finalize");
    assert_eq!(summary.depths(), vec![6, 3]);
    assert_eq!(summary.levels[1].path, "/tile_2/1");

    let (shape, _) = read_array(store, "/tile_2/1");
    assert_eq!(shape, vec![3, 32, 32]);
}

#[test]
fn test_blocking_finish() {
    let mut config = iso_config([64, 64], 2);
    config.max_levels = Some(1);
    let mut writer = PyramidWriter::with_store(memory_store(), config).expect("create writer");
    writer.push(Frame::filled([64, 64], 9)).expect("push frame");
    match writer.finish().expect("finish") {
        Finished::Closed(summary) => assert_eq!(summary.depths(), vec![1]),
        Finished::Pending(_) => panic!("expected a blocking finalize"),
    }
}

#[test]
fn test_empty_stream_closes() {
    let mut config = iso_config([64, 64], 8);
    config.min_level_dim = 16;
    let writer = PyramidWriter::with_store(memory_store(), config).expect("create writer");
    let summary = writer.close().expect("close writer");
    assert_eq!(summary.frames, 0);
    assert!(summary.depths().iter().all(|&d| d == 0));
}
