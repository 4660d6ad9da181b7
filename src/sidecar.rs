//! Per-tile view descriptions for multi-tile viewers.
//!
//! Nothing in the writer depends on this module; hosts build a [`TileView`] from each
//! closed tile's [`PyramidSummary`] and hand the [`ViewRegistry`] to whatever writes
//! the viewer's own sidecar format.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::WriterConfig;
use crate::writer::PyramidSummary;

/// Acquisition attributes distinguishing one view from another.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewAttributes {
    pub channel: u32,
    pub illumination: u32,
    pub angle: u32,
    pub tile: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewLevel {
    pub path: String,
    pub shape: [u64; 3],
    pub factors: [u64; 3],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileView {
    pub id: u32,
    pub attributes: ViewAttributes,
    /// `[z, y, x]`
    pub voxel_size: [f64; 3],
    pub unit: String,
    /// Row-major 3x4 matrix taking `(x, y, z, 1)` voxel coordinates to physical space.
    pub affine: [[f64; 4]; 3],
    pub group_path: String,
    pub levels: Vec<ViewLevel>,
}

impl TileView {
    pub fn from_summary(
        id: u32,
        attributes: ViewAttributes,
        config: &WriterConfig,
        summary: &PyramidSummary,
    ) -> Self {
        let [dz, dy, dx] = config.voxel_size;
        let [tz, ty, tx] = config.translation;
        let affine = [
            [dx, 0.0, 0.0, tx],
            [0.0, dy, 0.0, ty],
            [0.0, 0.0, dz, tz],
        ];
        let levels = summary
            .levels
            .iter()
            .map(|l| ViewLevel {
                path: l.path.clone(),
                shape: l.shape,
                factors: l.factors,
            })
            .collect();
        Self {
            id,
            attributes,
            voxel_size: config.voxel_size,
            unit: config.unit.clone(),
            affine,
            group_path: summary.group_path.clone(),
            levels,
        }
    }

    /// Full-resolution `[z, y, x]` extent.
    pub fn shape(&self) -> Option<[u64; 3]> {
        self.levels.first().map(|l| l.shape)
    }
}

/// Views recorded by a host over an acquisition, keyed by id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ViewRegistry {
    views: BTreeMap<u32, TileView>,
}

impl ViewRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Smallest id greater than every registered id.
    pub fn next_id(&self) -> u32 {
        self.views.keys().next_back().map_or(0, |id| id + 1)
    }

    pub fn register(&mut self, view: TileView) -> crate::Result<()> {
        if self.views.contains_key(&view.id) {
            return Err(crate::Error::general(format!(
                "view {} is already registered",
                view.id
            )));
        }
        log::debug!("registered view {} for {}", view.id, view.group_path);
        self.views.insert(view.id, view);
        Ok(())
    }

    pub fn get(&self, id: u32) -> Option<&TileView> {
        self.views.get(&id)
    }

    pub fn remove(&mut self, id: u32) -> Option<TileView> {
        self.views.remove(&id)
    }

    pub fn views(&self) -> impl Iterator<Item = &TileView> {
        self.views.values()
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    pub fn clear(&mut self) {
        self.views.clear();
    }

    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn write(&self, path: impl AsRef<Path>) -> crate::Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}
