//! Opening or creating the group hierarchy and level arrays of a pyramid.

use std::num::NonZeroU64;
use std::sync::Arc;

use zarrs::array::{
    Array, ArrayBuilder, ArrayCreateError, ArrayMetadata, ArrayMetadataV2, ArrayShardedExt,
    ChunkKeySeparator, FillValueMetadata, data_type,
};
use zarrs::group::{Group, GroupBuilder, GroupCreateError, GroupMetadata};
use zarrs::metadata::v2::GroupMetadataV2;
use zarrs::plugin::ExtensionName;
use zarrs::storage::{ReadableWritableListableStorage, ReadableWritableListableStorageTraits};

use crate::config::{NgffVersion, WriterConfig};
use crate::metadata;
use crate::plan::{LevelPlan, PyramidSpec};

/// An array handle over a type-erased store.
pub type LevelArray = Array<dyn ReadableWritableListableStorageTraits>;

const DIMENSION_NAMES: [&str; 3] = ["z", "y", "x"];
const DATA_TYPE_NAME: &str = "uint16";
const DATA_TYPE_V2: &str = "<u2";

/// One level's array and the geometry it is written with.
pub struct LevelArrayHandle {
    /// The planned geometry, or the existing array's grid when `reused`.
    pub plan: LevelPlan,
    pub array: Arc<LevelArray>,
    /// The array existed before this writer opened it.
    pub reused: bool,
}

/// The arrays backing a pyramid, one per level.
pub struct PyramidArrays {
    /// Absolute path of the group holding the levels.
    pub group_path: String,
    pub levels: Vec<LevelArrayHandle>,
}

/// Absolute path of `level`'s array inside `group_path`.
pub fn level_path(group_path: &str, level: usize) -> String {
    if group_path == "/" {
        format!("/{level}")
    } else {
        format!("{group_path}/{level}")
    }
}

fn zarr_format(version: NgffVersion) -> u8 {
    match version {
        NgffVersion::V04 => 2,
        NgffVersion::V05 => 3,
    }
}

fn open_or_create_group(
    store: &ReadableWritableListableStorage,
    path: &str,
    version: NgffVersion,
) -> crate::Result<Group<dyn ReadableWritableListableStorageTraits>> {
    match Group::open(store.clone(), path) {
        Ok(group) => {
            let compatible = matches!(
                (group.metadata(), version),
                (GroupMetadata::V2(_), NgffVersion::V04) | (GroupMetadata::V3(_), NgffVersion::V05)
            );
            if !compatible {
                return Err(crate::Error::mismatch(
                    path,
                    format!("existing group is not zarr v{}", zarr_format(version)),
                ));
            }
            Ok(group)
        }
        Err(GroupCreateError::MissingMetadata) => {
            log::debug!("creating zarr v{} group at {path}", zarr_format(version));
            let group = match version {
                NgffVersion::V04 => {
                    Group::new_with_metadata(store.clone(), path, GroupMetadataV2::new().into())?
                }
                NgffVersion::V05 => GroupBuilder::new().build(store.clone(), path)?,
            };
            group.store_metadata()?;
            Ok(group)
        }
        Err(e) => Err(e.into()),
    }
}

fn create_array(
    store: &ReadableWritableListableStorage,
    path: &str,
    plan: &LevelPlan,
    config: &WriterConfig,
) -> crate::Result<LevelArray> {
    let array = match config.ome_version {
        NgffVersion::V05 => {
            let mut builder = ArrayBuilder::new(
                plan.shape.to_vec(),
                plan.write_shape(),
                data_type::uint16(),
                0u16,
            );
            let compressor = config.compressor.to_bytes_to_bytes_codec()?;
            builder
                .dimension_names(Some(DIMENSION_NAMES))
                .bytes_to_bytes_codecs(compressor.into_iter().collect());
            if plan.shard_shape.is_some() {
                builder.subchunk_shape(plan.chunk_shape.to_vec());
            }
            builder.build(store.clone(), path)?
        }
        NgffVersion::V04 => {
            let chunks = plan
                .chunk_shape
                .iter()
                .map(|&n| NonZeroU64::new(n).ok_or_else(|| crate::Error::general("zero chunk size")))
                .collect::<crate::Result<Vec<_>>>()?;
            let meta = ArrayMetadataV2::new(
                plan.shape.to_vec(),
                chunks,
                DATA_TYPE_V2.into(),
                FillValueMetadata::from(0u16),
                config.compressor.to_v2_metadata()?,
                None,
            )
            .with_dimension_separator(ChunkKeySeparator::Slash);
            Array::new_with_metadata(store.clone(), path, ArrayMetadata::V2(meta))?
        }
    };
    array.store_metadata()?;
    Ok(array)
}

fn to_array3(shape: &[NonZeroU64]) -> Option<[u64; 3]> {
    match shape {
        [z, y, x] => Some([z.get(), y.get(), x.get()]),
        _ => None,
    }
}

/// Check that an existing array can take this level's writes, growing it in Z if needed.
///
/// The existing chunk (and shard) grid is adopted as the level's write block,
/// so a tile can be reopened with a different Z upper bound.
fn reuse_array(
    mut array: LevelArray,
    path: &str,
    plan: &LevelPlan,
    version: NgffVersion,
) -> crate::Result<(LevelArray, LevelPlan)> {
    let format_matches = matches!(
        (array.metadata(), version),
        (ArrayMetadata::V2(_), NgffVersion::V04) | (ArrayMetadata::V3(_), NgffVersion::V05)
    );
    if !format_matches {
        return Err(crate::Error::mismatch(
            path,
            format!("existing array is not zarr v{}", zarr_format(version)),
        ));
    }
    let dtype = array.data_type().name_v3();
    if dtype.as_deref() != Some(DATA_TYPE_NAME) {
        return Err(crate::Error::mismatch(
            path,
            format!("data type {dtype:?} is not {DATA_TYPE_NAME}"),
        ));
    }
    let shape = array.shape().to_vec();
    if shape.len() != 3 || shape[1..] != plan.shape[1..] {
        return Err(crate::Error::mismatch(
            path,
            format!("shape {shape:?} does not match planned {:?}", plan.shape),
        ));
    }
    if shape[0] < plan.shape[0] {
        log::debug!("growing {path} from {} to {} planes", shape[0], plan.shape[0]);
        array.set_shape(plan.shape.to_vec())?;
        array.store_metadata()?;
    }
    let grid = array.chunk_shape(&[0, 0, 0])?;
    let Some(grid) = to_array3(&grid) else {
        return Err(crate::Error::mismatch(path, "chunk grid is not 3D"));
    };
    let adopted = match array.subchunk_shape() {
        Some(inner) => {
            let inner = to_array3(&inner)
                .ok_or_else(|| crate::Error::mismatch(path, "subchunk shape is not 3D"))?;
            if (0..3).any(|axis| grid[axis] % inner[axis] != 0) {
                return Err(crate::Error::mismatch(
                    path,
                    format!("shard {grid:?} is not a multiple of subchunk {inner:?}"),
                ));
            }
            LevelPlan {
                chunk_shape: inner,
                shard_shape: Some(grid),
                ..*plan
            }
        }
        None => LevelPlan {
            chunk_shape: grid,
            shard_shape: None,
            ..*plan
        },
    };
    if adopted.write_shape() != plan.write_shape() {
        log::debug!(
            "{path}: keeping existing write block {:?} instead of planned {:?}",
            adopted.write_shape(),
            plan.write_shape()
        );
    }
    Ok((array, adopted))
}

fn open_or_create_array(
    store: &ReadableWritableListableStorage,
    path: &str,
    plan: &LevelPlan,
    config: &WriterConfig,
) -> crate::Result<LevelArrayHandle> {
    match Array::open(store.clone(), path) {
        Ok(array) => {
            log::debug!("reusing existing array at {path}");
            let (array, plan) = reuse_array(array, path, plan, config.ome_version)?;
            Ok(LevelArrayHandle {
                plan,
                array: Arc::new(array),
                reused: true,
            })
        }
        Err(ArrayCreateError::MissingMetadata) => Ok(LevelArrayHandle {
            plan: *plan,
            array: Arc::new(create_array(store, path, plan, config)?),
            reused: false,
        }),
        Err(e) => Err(e.into()),
    }
}

/// Ensure the group hierarchy, multiscales metadata and level arrays exist.
///
/// Existing compatible nodes are reused so several tiles can share one store;
/// anything incompatible fails with [`crate::Error::ConfigMismatch`].
pub fn open_or_create_pyramid(
    store: &ReadableWritableListableStorage,
    config: &WriterConfig,
    spec: &PyramidSpec,
    plans: &[LevelPlan],
) -> crate::Result<PyramidArrays> {
    let version = config.ome_version;
    let group_path = config.node_path();

    open_or_create_group(store, "/", version)?;
    let mut ancestor = String::new();
    for part in group_path.split('/').filter(|p| !p.is_empty()) {
        ancestor.push('/');
        ancestor.push_str(part);
        open_or_create_group(store, &ancestor, version)?;
    }

    let mut group = open_or_create_group(store, &group_path, version)?;
    let levels = plans
        .iter()
        .map(|plan| {
            let path = level_path(&group_path, plan.level);
            open_or_create_array(store, &path, plan, config)
        })
        .collect::<crate::Result<Vec<_>>>()?;

    let sharded = levels.iter().any(|l| l.plan.shard_shape.is_some());
    metadata::insert_multiscale(
        group.attributes_mut(),
        version,
        metadata::multiscale(spec, config, sharded),
    )?;
    group.store_metadata()?;

    log::info!(
        "opened {} level pyramid at {group_path} (OME-NGFF {})",
        levels.len(),
        version.as_str()
    );
    Ok(PyramidArrays { group_path, levels })
}
