//! Fixed-point mean kernels for building pyramid levels.
//!
//! All arithmetic is done in integers with explicit rounding,
//! so output is bit-reproducible and a constant plane maps to itself.

/// A 2D, row-major plane of `u16` samples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    shape: [usize; 2],
    data: Vec<u16>,
}

impl Frame {
    /// Wrap row-major samples of a `[y, x]` plane.
    pub fn new(shape: [usize; 2], data: Vec<u16>) -> crate::Result<Self> {
        let expected = shape[0] * shape[1];
        if data.len() != expected {
            return Err(crate::Error::general(format!(
                "frame of shape {shape:?} needs {expected} samples, got {}",
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    /// A plane with every sample set to `value`.
    pub fn filled(shape: [usize; 2], value: u16) -> Self {
        Self {
            shape,
            data: vec![value; shape[0] * shape[1]],
        }
    }

    pub fn zeros(shape: [usize; 2]) -> Self {
        Self::filled(shape, 0)
    }

    pub fn from_fn(shape: [usize; 2], mut f: impl FnMut(usize, usize) -> u16) -> Self {
        let mut data = Vec::with_capacity(shape[0] * shape[1]);
        for y in 0..shape[0] {
            for x in 0..shape[1] {
                data.push(f(y, x));
            }
        }
        Self { shape, data }
    }

    /// `[y, x]`
    pub fn shape(&self) -> [usize; 2] {
        self.shape
    }

    pub fn as_slice(&self) -> &[u16] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<u16> {
        self.data
    }

    pub fn get(&self, y: usize, x: usize) -> Option<u16> {
        (y < self.shape[0] && x < self.shape[1]).then(|| self.data[y * self.shape[1] + x])
    }
}

/// Shape of a plane after one X/Y halving step.
pub fn halved_shape(shape: [usize; 2]) -> [usize; 2] {
    [shape[0].div_ceil(2), shape[1].div_ceil(2)]
}

/// Rounded mean of each non-overlapping 2x2 block.
///
/// Odd trailing rows/columns are replicated, so the output shape is `ceil(dim / 2)`.
pub fn xy_mean2x2(frame: &Frame) -> Frame {
    let [ny, nx] = frame.shape;
    let [oy, ox] = halved_shape(frame.shape);
    let src = &frame.data;
    let mut data = Vec::with_capacity(oy * ox);
    for j in 0..oy {
        let r0 = 2 * j * nx;
        let r1 = (2 * j + 1).min(ny - 1) * nx;
        for i in 0..ox {
            let c0 = 2 * i;
            let c1 = (2 * i + 1).min(nx - 1);
            let sum = u32::from(src[r0 + c0])
                + u32::from(src[r0 + c1])
                + u32::from(src[r1 + c0])
                + u32::from(src[r1 + c1]);
            data.push(((sum + 2) >> 2) as u16);
        }
    }
    Frame {
        shape: [oy, ox],
        data,
    }
}

/// Rounded mean of two planes of the same shape.
pub fn z_mean_pair(a: &Frame, b: &Frame) -> crate::Result<Frame> {
    if a.shape != b.shape {
        return Err(crate::Error::FrameShape {
            expected: a.shape,
            received: b.shape,
        });
    }
    let data = a
        .data
        .iter()
        .zip(&b.data)
        .map(|(&p, &q)| ((u32::from(p) + u32::from(q) + 1) >> 1) as u16)
        .collect();
    Ok(Frame {
        shape: a.shape,
        data,
    })
}
