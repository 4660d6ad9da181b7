use std::sync::Arc;

use serde::{Deserialize, Serialize};
use zarrs::array::codec::{
    BloscCodec, BloscCompressionLevel, BloscCompressor, BloscShuffleMode, GzipCodec, ZstdCodec,
};
use zarrs::metadata::v2::MetadataV2;
use zarrs_codec::BytesToBytesCodecTraits;

/// Size in bytes of the only supported element type.
const TYPESIZE: usize = std::mem::size_of::<u16>();

/// Chunk compression configuration.
///
/// The same selection is expressed as a bytes-to-bytes codec for zarr v3
/// or as a `compressor` object for zarr v2.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum Compressor {
    /// Uncompressed.
    #[default]
    None,
    Gzip {
        /// Default 6. Must be in the range 0..=9.
        #[serde(default = "default_gzip_level")]
        level: u32,
    },
    Zstd {
        /// Default 3.
        #[serde(default = "default_zstd_level")]
        level: i32,
        /// Only honoured by zarr v3.
        #[serde(default)]
        checksum: bool,
    },
    Blosc {
        #[serde(default = "default_blosc_cname")]
        cname: BloscCompressor,
        /// Default 5. Must be in the range 0..=9.
        #[serde(default = "default_blosc_clevel")]
        clevel: u8,
        #[serde(default)]
        shuffle: Shuffle,
    },
}

/// Byte rearrangement applied by blosc before compression.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Shuffle {
    None,
    #[default]
    Byte,
    Bit,
}

fn default_gzip_level() -> u32 {
    6
}

fn default_zstd_level() -> i32 {
    3
}

fn default_blosc_cname() -> BloscCompressor {
    BloscCompressor::Zstd
}

fn default_blosc_clevel() -> u8 {
    5
}

impl Shuffle {
    fn mode(self) -> BloscShuffleMode {
        match self {
            Shuffle::None => BloscShuffleMode::NoShuffle,
            Shuffle::Byte => BloscShuffleMode::Shuffle,
            Shuffle::Bit => BloscShuffleMode::BitShuffle,
        }
    }

    /// numcodecs encodes the shuffle mode as an integer.
    fn numcodecs(self) -> i32 {
        match self {
            Shuffle::None => 0,
            Shuffle::Byte => 1,
            Shuffle::Bit => 2,
        }
    }
}

fn blosc_level(clevel: u8) -> crate::Result<BloscCompressionLevel> {
    BloscCompressionLevel::try_from(clevel)
        .map_err(|n| crate::Error::InvalidConfig(format!("invalid blosc clevel {n}")))
}

impl Compressor {
    /// Check parameter ranges without building a codec.
    pub fn validate(&self) -> crate::Result<()> {
        self.to_bytes_to_bytes_codec().map(|_| ())
    }

    /// Convert to a zarr v3 bytes-to-bytes codec, if compressing.
    pub fn to_bytes_to_bytes_codec(
        &self,
    ) -> crate::Result<Option<Arc<dyn BytesToBytesCodecTraits>>> {
        match *self {
            Compressor::None => Ok(None),
            Compressor::Gzip { level } => Ok(Some(Arc::new(
                GzipCodec::new(level).map_err(|e| crate::Error::InvalidConfig(e.to_string()))?,
            ))),
            Compressor::Zstd { level, checksum } => {
                Ok(Some(Arc::new(ZstdCodec::new(level, checksum))))
            }
            Compressor::Blosc {
                cname,
                clevel,
                shuffle,
            } => Ok(Some(Arc::new(
                BloscCodec::new(
                    cname,
                    blosc_level(clevel)?,
                    None,
                    shuffle.mode(),
                    Some(TYPESIZE),
                )
                .map_err(|e| crate::Error::InvalidConfig(e.to_string()))?,
            ))),
        }
    }

    /// Convert to a zarr v2 (numcodecs) `compressor` object, if compressing.
    pub fn to_v2_metadata(&self) -> crate::Result<Option<MetadataV2>> {
        self.validate()?;
        let value = match *self {
            Compressor::None => return Ok(None),
            Compressor::Gzip { level } => serde_json::json!({ "id": "gzip", "level": level }),
            Compressor::Zstd { level, .. } => serde_json::json!({ "id": "zstd", "level": level }),
            Compressor::Blosc {
                cname,
                clevel,
                shuffle,
            } => serde_json::json!({
                "id": "blosc",
                "cname": cname,
                "clevel": clevel,
                "shuffle": shuffle.numcodecs(),
                "blocksize": 0,
            }),
        };
        Ok(Some(serde_json::from_value(value)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialize_with_defaults() {
        let c: Compressor = serde_json::from_str(r#"{"type": "blosc"}"#).unwrap();
        assert_eq!(
            c,
            Compressor::Blosc {
                cname: BloscCompressor::Zstd,
                clevel: 5,
                shuffle: Shuffle::Byte
            }
        );
        let c: Compressor = serde_json::from_str(r#"{"type": "none"}"#).unwrap();
        assert!(c.to_bytes_to_bytes_codec().unwrap().is_none());
    }

    #[test]
    fn v2_blosc_uses_numcodecs_fields() {
        let c = Compressor::Blosc {
            cname: BloscCompressor::LZ4,
            clevel: 3,
            shuffle: Shuffle::Bit,
        };
        let meta = c.to_v2_metadata().unwrap().unwrap();
        assert_eq!(meta.id(), "blosc");
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["cname"], "lz4");
        assert_eq!(json["shuffle"], 2);
    }

    #[test]
    fn out_of_range_levels_are_rejected() {
        assert!(Compressor::Gzip { level: 42 }.validate().is_err());
        let c = Compressor::Blosc {
            cname: BloscCompressor::Zstd,
            clevel: 10,
            shuffle: Shuffle::None,
        };
        assert!(matches!(c.validate(), Err(crate::Error::InvalidConfig(_))));
    }
}
