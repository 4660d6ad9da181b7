//! OME-NGFF multiscales attributes.
//!
//! Both supported versions share the same `multiscales` entries;
//! they differ only in where those entries live in the group attributes:
//!
//! - 0.4: `{"multiscales": [{"version": "0.4", ...}]}`
//! - 0.5: `{"ome": {"version": "0.5", "multiscales": [{...}]}}`

use serde::{Deserialize, Serialize};

use crate::config::{NgffVersion, WriterConfig};
use crate::plan::PyramidSpec;

const AXIS_NAMES: [&str; 3] = ["z", "y", "x"];

/// Representation of a single axis.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Axis {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum CoordinateTransformation {
    Scale { scale: Vec<f64> },
    Translation { translation: Vec<f64> },
}

/// One pyramid level, addressed relative to the multiscales group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Dataset {
    pub path: String,
    pub coordinate_transformations: Vec<CoordinateTransformation>,
}

impl Dataset {
    pub fn scale(&self) -> Option<&[f64]> {
        self.coordinate_transformations.iter().find_map(|t| match t {
            CoordinateTransformation::Scale { scale } => Some(scale.as_slice()),
            _ => None,
        })
    }

    pub fn translation(&self) -> Option<&[f64]> {
        self.coordinate_transformations.iter().find_map(|t| match t {
            CoordinateTransformation::Translation { translation } => Some(translation.as_slice()),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Multiscale {
    /// Present in 0.4 only; 0.5 carries the version on the enclosing `ome` object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub axes: Vec<Axis>,
    pub datasets: Vec<Dataset>,
    /// Downsampling method.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// The 0.5 `ome` attribute.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OmeAttributes {
    pub version: String,
    pub multiscales: Vec<Multiscale>,
}

/// Build the multiscale description of a tile's pyramid.
pub fn multiscale(spec: &PyramidSpec, config: &WriterConfig, sharded: bool) -> Multiscale {
    let axes = AXIS_NAMES
        .iter()
        .map(|name| Axis {
            name: name.to_string(),
            kind: "space".to_string(),
            unit: Some(config.unit.clone()),
        })
        .collect();
    let datasets = (0..spec.levels)
        .map(|level| {
            let factors = spec.factors(level);
            let scale = config
                .voxel_size
                .iter()
                .zip(factors)
                .map(|(v, f)| v * f as f64)
                .collect();
            Dataset {
                path: level.to_string(),
                coordinate_transformations: vec![
                    CoordinateTransformation::Scale { scale },
                    CoordinateTransformation::Translation {
                        translation: config.translation.to_vec(),
                    },
                ],
            }
        })
        .collect();
    let mut metadata = serde_json::Map::new();
    metadata.insert(
        "method".into(),
        "rounded 2x2 mean in y/x, pairwise mean in z".into(),
    );
    let version = match config.ome_version {
        NgffVersion::V04 => Some(config.ome_version.as_str().to_string()),
        NgffVersion::V05 => {
            metadata.insert("sharded".into(), sharded.into());
            None
        }
    };
    let name = config.node_path().trim_start_matches('/').to_string();
    Multiscale {
        version,
        name: (!name.is_empty()).then_some(name),
        axes,
        datasets,
        kind: Some("mean".to_string()),
        metadata,
    }
}

/// Insert `multiscale` into group `attributes` under the version's schema.
///
/// Unrelated attributes are kept; a previous multiscales entry is replaced.
pub fn insert_multiscale(
    attributes: &mut serde_json::Map<String, serde_json::Value>,
    version: NgffVersion,
    multiscale: Multiscale,
) -> crate::Result<()> {
    match version {
        NgffVersion::V04 => {
            attributes.insert(
                "multiscales".into(),
                serde_json::to_value(vec![multiscale])?,
            );
        }
        NgffVersion::V05 => {
            let ome = OmeAttributes {
                version: version.as_str().to_string(),
                multiscales: vec![multiscale],
            };
            attributes.insert("ome".into(), serde_json::to_value(ome)?);
        }
    }
    Ok(())
}

/// Find multiscales in group attributes of either version.
pub fn read_multiscales(
    attributes: &serde_json::Map<String, serde_json::Value>,
) -> crate::Result<Option<(NgffVersion, Vec<Multiscale>)>> {
    if let Some(ome) = attributes.get("ome") {
        let ome: OmeAttributes = serde_json::from_value(ome.clone())?;
        if ome.version != NgffVersion::V05.as_str() {
            return Err(crate::Error::general(format!(
                "unsupported OME-NGFF version {}",
                ome.version
            )));
        }
        return Ok(Some((NgffVersion::V05, ome.multiscales)));
    }
    if let Some(multiscales) = attributes.get("multiscales") {
        let multiscales: Vec<Multiscale> = serde_json::from_value(multiscales.clone())?;
        return Ok(Some((NgffVersion::V04, multiscales)));
    }
    Ok(None)
}
