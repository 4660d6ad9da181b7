//! Pyramid level and chunk geometry.
//!
//! Everything here is pure arithmetic on `[z, y, x]` shapes.

use serde::{Deserialize, Serialize};

/// Chunk shapes at the finest level (`base`) and the shape coarse levels tend towards (`target`).
///
/// At each level every axis moves by a factor of two from `base` towards `target`.
/// Typically Z grows and Y/X shrink, so level 0 is written densely
/// while coarse levels end up in fewer, larger files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkScheme {
    pub base: [u64; 3],
    pub target: [u64; 3],
}

impl Default for ChunkScheme {
    fn default() -> Self {
        Self {
            base: [8, 256, 256],
            target: [64, 128, 128],
        }
    }
}

impl ChunkScheme {
    /// Unclamped chunk shape at `level`.
    pub fn interpolate(&self, level: usize) -> [u64; 3] {
        let mut out = [0; 3];
        for (axis, out) in out.iter_mut().enumerate() {
            let (base, target) = (self.base[axis].max(1), self.target[axis].max(1));
            let mut value = base;
            for _ in 0..level {
                if value == target {
                    break;
                }
                value = if value < target {
                    (value * 2).min(target)
                } else {
                    (value / 2).max(target)
                };
            }
            *out = value;
        }
        out
    }
}

/// The shape of a pyramid, fixed when the writer is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PyramidSpec {
    /// Upper bound on the number of frames; the true depth is known only at close.
    pub z_size_estimate: u64,
    pub y: u64,
    pub x: u64,
    pub levels: usize,
    /// Leading levels (after 0) which downsample in X/Y only.
    pub xy_prelude_levels: usize,
}

impl PyramidSpec {
    /// Downsampling factors `[z, y, x]` of `level` relative to level 0.
    pub fn factors(&self, level: usize) -> [u64; 3] {
        level_factors(level, self.xy_prelude_levels)
    }

    /// Allocated `[z, y, x]` extent of `level`.
    pub fn level_shape(&self, level: usize) -> [u64; 3] {
        level_shape(
            [self.z_size_estimate, self.y, self.x],
            level,
            self.xy_prelude_levels,
        )
    }

    /// Whether frames reaching `level` are paired along Z.
    pub fn pairs_in_z(&self, level: usize) -> bool {
        level > self.xy_prelude_levels
    }
}

/// Geometry of a single level's array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelPlan {
    pub level: usize,
    pub shape: [u64; 3],
    pub chunk_shape: [u64; 3],
    /// Present only when sharding is in effect.
    pub shard_shape: Option<[u64; 3]>,
}

impl LevelPlan {
    /// The unit of storage: a shard when sharded, otherwise a chunk.
    pub fn write_shape(&self) -> [u64; 3] {
        self.shard_shape.unwrap_or(self.chunk_shape)
    }
}

/// Number of X/Y-only halvings before the X/Y sampling would become coarser than Z.
///
/// `voxel_size` is `[dz, dy, dx]`.
pub fn xy_prelude_levels(voxel_size: [f64; 3]) -> usize {
    let [dz, dy, dx] = voxel_size;
    let steps = |d: f64| -> usize {
        if d <= 0.0 || dz <= 0.0 {
            return 0;
        }
        let ratio = (dz / d).log2().floor();
        if ratio.is_finite() && ratio > 0.0 {
            ratio as usize
        } else {
            0
        }
    };
    steps(dy).min(steps(dx))
}

fn level_factors(level: usize, prelude: usize) -> [u64; 3] {
    let z_steps = level.saturating_sub(prelude);
    [1 << z_steps, 1 << level, 1 << level]
}

/// `[z, y, x]` extent of `level` for a level-0 extent of `full`.
pub fn level_shape(full: [u64; 3], level: usize, prelude: usize) -> [u64; 3] {
    let factors = level_factors(level, prelude);
    [
        full[0].div_ceil(factors[0]),
        full[1].div_ceil(factors[1]),
        full[2].div_ceil(factors[2]),
    ]
}

/// Total number of levels, including level 0.
///
/// Stops before the first level whose smaller spatial extent drops below `min_dim`,
/// or whose Z extent would be empty.
pub fn level_count(
    full: [u64; 3],
    prelude: usize,
    min_dim: u64,
    max_levels: Option<usize>,
) -> usize {
    let cap = max_levels.unwrap_or(usize::MAX).max(1);
    let mut levels = 1;
    while levels < cap && levels < 64 {
        let [z, y, x] = level_shape(full, levels, prelude);
        if y.min(x) < min_dim || z < 1 {
            break;
        }
        levels += 1;
    }
    levels
}

/// Chunk shape at `level`, clamped to the level's extent.
pub fn chunk_shape_for_level(scheme: &ChunkScheme, level: usize, extent: [u64; 3]) -> [u64; 3] {
    let raw = scheme.interpolate(level);
    std::array::from_fn(|axis| raw[axis].clamp(1, extent[axis].max(1)))
}

/// Largest multiple of `chunk` per axis not exceeding `min(desired, extent)`.
///
/// Never smaller than one chunk, so `shard % chunk == 0` always holds.
pub fn shard_shape_for_level(desired: [u64; 3], chunk: [u64; 3], extent: [u64; 3]) -> [u64; 3] {
    let shard = std::array::from_fn(|axis| {
        let limit = desired[axis].min(extent[axis]);
        (limit / chunk[axis]).max(1) * chunk[axis]
    });
    if shard != desired {
        log::debug!("shard shape {desired:?} coerced to {shard:?} for chunk shape {chunk:?}");
    }
    shard
}

/// Plan every level of a pyramid.
///
/// `shard` is only honoured by formats which support sharding; callers pass `None` otherwise.
pub fn plan_pyramid(
    spec: &PyramidSpec,
    scheme: &ChunkScheme,
    shard: Option<[u64; 3]>,
) -> Vec<LevelPlan> {
    (0..spec.levels)
        .map(|level| {
            let shape = spec.level_shape(level);
            let chunk_shape = chunk_shape_for_level(scheme, level, shape);
            let shard_shape = shard.map(|s| shard_shape_for_level(s, chunk_shape, shape));
            LevelPlan {
                level,
                shape,
                chunk_shape,
                shard_shape,
            }
        })
        .collect()
}
