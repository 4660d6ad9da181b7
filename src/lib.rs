//! Stream `u16` camera frames into a multiscale OME-Zarr pyramid,
//! computing coarser levels on the fly.
//!
//! ```no_run
//! use zarrs_live_pyramid::{Frame, PyramidWriter, WriterConfig};
//!
//! # fn main() -> zarrs_live_pyramid::Result<()> {
//! let mut config = WriterConfig::new([2048, 2048], 500, [2.0, 0.5, 0.5]);
//! config.store_path = Some("acquisition.ome.zarr".into());
//! config.group_path = "tile_0".into();
//! let mut writer = PyramidWriter::create(config)?;
//! for _ in 0..500 {
//!     writer.push(Frame::zeros([2048, 2048]))?;
//! }
//! let summary = writer.close()?;
//! println!("{:?}", summary.depths());
//! # Ok(())
//! # }
//! ```
pub mod codec;
pub mod config;
pub mod downsample;
mod error;
pub mod group;
mod level;
pub mod metadata;
pub mod plan;
mod pool;
pub mod sidecar;
pub mod storage;
pub mod writer;

pub use zarrs;

pub use config::{FinalizeMode, NgffVersion, PadPolicy, Sharding, WriterConfig};
pub use downsample::Frame;
pub use error::{Error, Result};
pub use pool::WriteStats;
pub use writer::{CloseHandle, Finished, LevelSummary, PyramidSummary, PyramidWriter, WriterState};
