//! Per-level buffering.
//!
//! Each level fills one write block (a chunk, or a shard when sharded) at a time.
//! A block is only handed off once every plane in it is present,
//! so stored data is never read back or modified.

use std::sync::Arc;

use crate::config::PadPolicy;
use crate::downsample::Frame;
use crate::group::LevelArray;
use crate::plan::LevelPlan;

/// A partially filled write block.
#[derive(Debug)]
struct ChunkBuffer {
    z_start: u64,
    filled: u64,
    data: Vec<u16>,
}

/// A completed write block, owned by the write pool until stored.
pub(crate) struct WriteJob {
    pub level: usize,
    /// Index of the block along Z.
    pub z_block: u64,
    array: Arc<LevelArray>,
    plane: [usize; 2],
    unit: [usize; 3],
    data: Vec<u16>,
}

impl WriteJob {
    /// Store the block, one chunk per Y/X grid cell.
    ///
    /// Cells overhanging the plane are zero-filled so every chunk is written whole.
    pub fn run(self) -> crate::Result<()> {
        let [py, px] = self.plane;
        let [uz, uy, ux] = self.unit;
        for (yi, y0) in (0..py).step_by(uy).enumerate() {
            let h = uy.min(py - y0);
            for (xi, x0) in (0..px).step_by(ux).enumerate() {
                let w = ux.min(px - x0);
                let mut block = vec![0u16; uz * uy * ux];
                for z in 0..uz {
                    for y in 0..h {
                        let src = z * py * px + (y0 + y) * px + x0;
                        let dst = (z * uy + y) * ux;
                        block[dst..dst + w].copy_from_slice(&self.data[src..src + w]);
                    }
                }
                self.array
                    .store_chunk(&[self.z_block, yi as u64, xi as u64], block)?;
            }
        }
        log::trace!("stored level {} block {}", self.level, self.z_block);
        Ok(())
    }
}

pub(crate) struct Level {
    plan: LevelPlan,
    array: Arc<LevelArray>,
    plane: [usize; 2],
    depth: u64,
    active: Option<ChunkBuffer>,
    /// Candidate waiting for its Z neighbour.
    pub pair: Option<Frame>,
    z_count: u64,
    /// The array may hold blocks from an earlier, deeper stack.
    reused: bool,
}

impl Level {
    pub fn new(plan: LevelPlan, array: Arc<LevelArray>, reused: bool) -> Self {
        let plane = [plan.shape[1] as usize, plan.shape[2] as usize];
        let depth = plan.write_shape()[0];
        Self {
            plan,
            array,
            plane,
            depth,
            active: None,
            pair: None,
            z_count: 0,
            reused,
        }
    }

    pub fn plan(&self) -> &LevelPlan {
        &self.plan
    }

    /// Planes appended so far.
    pub fn z_count(&self) -> u64 {
        self.z_count
    }

    fn plane_len(&self) -> usize {
        self.plane[0] * self.plane[1]
    }

    fn job(&self, buffer: ChunkBuffer) -> WriteJob {
        let [_, uy, ux] = self.plan.write_shape();
        WriteJob {
            level: self.plan.level,
            z_block: buffer.z_start / self.depth,
            array: self.array.clone(),
            plane: self.plane,
            unit: [self.depth as usize, uy as usize, ux as usize],
            data: buffer.data,
        }
    }

    /// Append the next plane, returning the block if it is now full.
    pub fn append(&mut self, plane: &Frame) -> crate::Result<Option<WriteJob>> {
        let expected = self.plane;
        if plane.shape() != expected {
            return Err(crate::Error::FrameShape {
                expected,
                received: plane.shape(),
            });
        }
        let len = self.plane_len();
        let depth = self.depth;
        let z_count = self.z_count;
        let buffer = self.active.get_or_insert_with(|| ChunkBuffer {
            z_start: z_count,
            filled: 0,
            data: vec![0; depth as usize * len],
        });
        let offset = buffer.filled as usize * len;
        buffer.data[offset..offset + len].copy_from_slice(plane.as_slice());
        buffer.filled += 1;
        self.z_count += 1;

        if buffer.filled == depth {
            let full = self.active.take();
            Ok(full.map(|b| self.job(b)))
        } else {
            Ok(None)
        }
    }

    /// Complete the partial block, if any, according to `policy`.
    ///
    /// Padding planes are written but not counted in `z_count`;
    /// [`PadPolicy::Drop`] discards the block and rolls `z_count` back instead.
    pub fn pad(&mut self, policy: PadPolicy) -> Option<WriteJob> {
        let mut buffer = self.active.take()?;
        let len = self.plane_len();
        let filled = buffer.filled as usize;
        match policy {
            PadPolicy::Drop => {
                log::debug!(
                    "level {}: dropping {} trailing planes",
                    self.plan.level,
                    buffer.filled
                );
                self.z_count -= buffer.filled;
                return None;
            }
            PadPolicy::Zeros => {}
            PadPolicy::Duplicate => {
                let (head, tail) = buffer.data.split_at_mut(filled * len);
                let last = &head[(filled - 1) * len..];
                for plane in tail.chunks_exact_mut(len) {
                    plane.copy_from_slice(last);
                }
            }
        }
        buffer.filled = self.depth;
        Some(self.job(buffer))
    }

    /// Trim the array to the number of planes appended.
    ///
    /// For a reused array, blocks left beyond the new depth by an earlier stack are erased.
    pub fn resize(&self) -> crate::Result<()> {
        let mut array = self.array.with_storage(self.array.storage());
        if self.reused {
            self.erase_trimmed(&array)?;
        }
        let shape = vec![self.z_count, self.plan.shape[1], self.plan.shape[2]];
        array.set_shape(shape)?;
        array.store_metadata()?;
        Ok(())
    }

    fn erase_trimmed(&self, array: &LevelArray) -> crate::Result<()> {
        let kept = self.z_count.div_ceil(self.depth);
        let &[gz, gy, gx] = array.chunk_grid_shape() else {
            return Ok(());
        };
        for z in kept..gz {
            for y in 0..gy {
                for x in 0..gx {
                    array.erase_chunk(&[z, y, x])?;
                }
            }
        }
        if gz > kept {
            log::debug!(
                "{}: erased blocks {kept}..{gz} beyond depth {}",
                self.array.path(),
                self.z_count
            );
        }
        Ok(())
    }

    pub fn path(&self) -> String {
        self.array.path().to_string()
    }
}
