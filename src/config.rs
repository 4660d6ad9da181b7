//! Writer configuration, loadable from JSON.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::codec::Compressor;
use crate::plan::ChunkScheme;

/// OME-NGFF version, which also selects the zarr format.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub enum NgffVersion {
    /// Zarr v2, chunked only.
    #[serde(rename = "0.4")]
    V04,
    /// Zarr v3, optionally sharded.
    #[default]
    #[serde(rename = "0.5")]
    V05,
}

impl NgffVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            NgffVersion::V04 => "0.4",
            NgffVersion::V05 => "0.5",
        }
    }

    pub fn supports_sharding(&self) -> bool {
        matches!(self, NgffVersion::V05)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum Sharding {
    #[default]
    Disabled,
    /// Desired `[z, y, x]` shard shape; coerced per level to a multiple of the chunk shape.
    Enabled { shape: [u64; 3] },
}

/// How incomplete data is completed when the stream ends.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PadPolicy {
    /// Repeat the last plane.
    #[default]
    Duplicate,
    /// Fill with zeros.
    Zeros,
    /// Discard the incomplete tail. The only policy which loses acquired data.
    Drop,
}

/// Whether `finish` blocks until the pyramid is complete.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FinalizeMode {
    #[default]
    Blocking,
    Background,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WriterConfig {
    /// Filesystem root of the store; only needed by [`crate::PyramidWriter::create`].
    #[serde(default)]
    pub store_path: Option<PathBuf>,
    /// Group holding this tile's levels.
    #[serde(default = "default_group_path")]
    pub group_path: String,
    /// `[y, x]`
    pub frame_shape: [u64; 2],
    /// Upper bound on the number of frames.
    pub z_size_estimate: u64,
    /// Physical `[z, y, x]` voxel size.
    pub voxel_size: [f64; 3],
    #[serde(default = "default_unit")]
    pub unit: String,
    #[serde(default)]
    pub chunk_scheme: ChunkScheme,
    #[serde(default)]
    pub compressor: Compressor,
    #[serde(default)]
    pub sharding: Sharding,
    #[serde(default)]
    pub ome_version: NgffVersion,
    #[serde(default)]
    pub finalize: FinalizeMode,
    /// Physical `[z, y, x]` origin of the tile.
    #[serde(default)]
    pub translation: [f64; 3],
    #[serde(default)]
    pub pad_policy: PadPolicy,
    /// Caps the number of levels, including level 0.
    #[serde(default)]
    pub max_levels: Option<usize>,
    /// Levels stop before the smaller spatial extent would drop below this.
    #[serde(default = "default_min_level_dim")]
    pub min_level_dim: u64,
    /// Frames buffered between `push` and the ingestion thread.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_write_workers")]
    pub write_workers: usize,
    /// Chunk writes allowed to be pending at once.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

fn default_group_path() -> String {
    "/".to_string()
}

fn default_unit() -> String {
    "micrometer".to_string()
}

fn default_min_level_dim() -> u64 {
    32
}

fn default_queue_capacity() -> usize {
    8
}

fn default_write_workers() -> usize {
    4
}

fn default_max_in_flight() -> usize {
    8
}

impl WriterConfig {
    /// A configuration with every optional field at its default.
    pub fn new(frame_shape: [u64; 2], z_size_estimate: u64, voxel_size: [f64; 3]) -> Self {
        Self {
            store_path: None,
            group_path: default_group_path(),
            frame_shape,
            z_size_estimate,
            voxel_size,
            unit: default_unit(),
            chunk_scheme: ChunkScheme::default(),
            compressor: Compressor::default(),
            sharding: Sharding::default(),
            ome_version: NgffVersion::default(),
            finalize: FinalizeMode::default(),
            translation: [0.0; 3],
            pad_policy: PadPolicy::default(),
            max_levels: None,
            min_level_dim: default_min_level_dim(),
            queue_capacity: default_queue_capacity(),
            write_workers: default_write_workers(),
            max_in_flight: default_max_in_flight(),
        }
    }

    pub fn from_json(json: &str) -> crate::Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> crate::Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        let config: Self = serde_json::from_reader(std::io::BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> crate::Result<()> {
        let invalid = |msg: String| Err(crate::Error::InvalidConfig(msg));
        if self.frame_shape.contains(&0) {
            return invalid(format!("frame shape {:?} is empty", self.frame_shape));
        }
        if self.z_size_estimate == 0 {
            return invalid("z_size_estimate must be positive".into());
        }
        if !self.voxel_size.iter().all(|d| d.is_finite() && *d > 0.0) {
            return invalid(format!(
                "voxel size {:?} must be positive",
                self.voxel_size
            ));
        }
        if !self.translation.iter().all(|t| t.is_finite()) {
            return invalid(format!("translation {:?} is not finite", self.translation));
        }
        let scheme = &self.chunk_scheme;
        if scheme.base.contains(&0) || scheme.target.contains(&0) {
            return invalid(format!("chunk scheme {scheme:?} has an empty axis"));
        }
        if let Sharding::Enabled { shape } = self.sharding
            && shape.contains(&0)
        {
            return invalid(format!("shard shape {shape:?} has an empty axis"));
        }
        if self.max_levels == Some(0) {
            return invalid("max_levels must be at least 1".into());
        }
        if self.min_level_dim == 0 {
            return invalid("min_level_dim must be positive".into());
        }
        for (name, value) in [
            ("queue_capacity", self.queue_capacity),
            ("write_workers", self.write_workers),
            ("max_in_flight", self.max_in_flight),
        ] {
            if value == 0 {
                return invalid(format!("{name} must be positive"));
            }
        }
        self.compressor.validate()
    }

    /// Desired shard shape, if sharding applies to the configured format.
    pub fn effective_shard_shape(&self) -> Option<[u64; 3]> {
        match (self.sharding, self.ome_version.supports_sharding()) {
            (Sharding::Disabled, _) => None,
            (Sharding::Enabled { shape }, true) => Some(shape),
            (Sharding::Enabled { shape }, false) => {
                log::warn!(
                    "OME-NGFF {} has no sharding; ignoring shard shape {shape:?}",
                    self.ome_version.as_str()
                );
                None
            }
        }
    }

    /// The group path normalised to an absolute zarr node path.
    pub fn node_path(&self) -> String {
        let trimmed = self.group_path.trim_matches('/');
        if trimmed.is_empty() {
            "/".to_string()
        } else {
            format!("/{trimmed}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_json_fills_defaults() {
        let config = WriterConfig::from_json(
            r#"{"frame_shape": [64, 48], "z_size_estimate": 10, "voxel_size": [2.0, 0.5, 0.5]}"#,
        )
        .unwrap();
        assert_eq!(config, WriterConfig::new([64, 48], 10, [2.0, 0.5, 0.5]));
        assert_eq!(config.node_path(), "/");
    }

    #[test]
    fn enums_use_lowercase_tags() {
        let config = WriterConfig::from_json(
            r#"{
                "frame_shape": [64, 64], "z_size_estimate": 4, "voxel_size": [1, 1, 1],
                "group_path": "tile_0/",
                "ome_version": "0.4",
                "sharding": {"type": "enabled", "shape": [16, 64, 64]},
                "compressor": {"type": "zstd", "level": 5},
                "pad_policy": "drop",
                "finalize": "background"
            }"#,
        )
        .unwrap();
        assert_eq!(config.ome_version, NgffVersion::V04);
        assert_eq!(config.pad_policy, PadPolicy::Drop);
        assert_eq!(config.finalize, FinalizeMode::Background);
        assert_eq!(config.node_path(), "/tile_0");
        assert_eq!(config.effective_shard_shape(), None);
    }

    #[test]
    fn rejects_degenerate_values() {
        let mut config = WriterConfig::new([8, 8], 1, [1.0, 1.0, 1.0]);
        config.validate().unwrap();
        config.voxel_size[0] = 0.0;
        assert!(matches!(
            config.validate(),
            Err(crate::Error::InvalidConfig(_))
        ));
        let mut config = WriterConfig::new([8, 8], 1, [1.0, 1.0, 1.0]);
        config.max_in_flight = 0;
        assert!(config.validate().is_err());
    }
}
