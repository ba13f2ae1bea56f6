//! Dimension descriptors: shape, strides, and offset over a typed buffer
//!
//! A `Dims` value maps multi-indices to linear element offsets in a backing
//! buffer. The leftmost dimension is the slowest-varying; strides are in
//! elements (not bytes) and never negative. All shape manipulation returns
//! new descriptors; the buffer itself is untouched.
//!
//! The aliasing invariant: for in-range indices, no two distinct
//! multi-indices map to the same linear offset (size-1 axes excepted).
//! Every constructor here preserves it.

mod select;

pub use select::{compose_selectors, Selector};

use crate::error::{Error, Result};
use smallvec::SmallVec;
use std::fmt;

/// Stack allocation threshold for dimensions;
/// most tensors have 4 or fewer axes
const STACK_DIMS: usize = 4;

/// Shape type: size along each axis
pub type Shape = SmallVec<[usize; STACK_DIMS]>;

/// Strides type: element offsets between consecutive positions along each
/// axis. Non-negative by construction.
pub type Strides = SmallVec<[usize; STACK_DIMS]>;

/// Shape/strides/offset descriptor for a strided view of a buffer
///
/// Address of the element at indices `[i0, i1, ..., in]`:
///   `offset + i0 * strides[0] + i1 * strides[1] + ... + in * strides[n]`
#[derive(Clone, PartialEq, Eq)]
pub struct Dims {
    shape: Shape,
    strides: Strides,
    offset: usize,
}

impl Dims {
    /// Create a dense (row-major) descriptor from a shape
    ///
    /// Fails with a shape error if any axis is zero.
    pub fn new(shape: &[usize]) -> Result<Self> {
        if shape.iter().any(|&d| d == 0) {
            return Err(Error::Shape {
                op: "dimensions",
                reason: format!("axes must be positive, got {shape:?}"),
            });
        }
        let shape: Shape = shape.iter().copied().collect();
        let strides = row_major_strides(&shape);
        Ok(Self {
            shape,
            strides,
            offset: 0,
        })
    }

    /// Create a descriptor with explicit shape, strides, and offset
    ///
    /// The caller asserts the aliasing invariant; this is the entry point
    /// for `reinterpret`-style views.
    pub fn with_strides(shape: &[usize], strides: &[usize], offset: usize) -> Result<Self> {
        if shape.len() != strides.len() {
            return Err(Error::Shape {
                op: "dimensions",
                reason: format!(
                    "shape rank {} does not match stride rank {}",
                    shape.len(),
                    strides.len()
                ),
            });
        }
        if shape.iter().any(|&d| d == 0) {
            return Err(Error::Shape {
                op: "dimensions",
                reason: format!("axes must be positive, got {shape:?}"),
            });
        }
        Ok(Self {
            shape: shape.iter().copied().collect(),
            strides: strides.iter().copied().collect(),
            offset,
        })
    }

    /// Get the shape
    #[inline]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Get the strides
    #[inline]
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    /// Get the element offset into the backing buffer
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Number of axes (rank)
    #[inline]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Total number of elements
    #[inline]
    pub fn elem_count(&self) -> usize {
        self.shape.iter().product()
    }

    /// Largest linear offset addressed by this descriptor
    ///
    /// A buffer backing this view must have at least `max_linear_index() + 1`
    /// elements.
    pub fn max_linear_index(&self) -> usize {
        self.offset
            + self
                .shape
                .iter()
                .zip(self.strides.iter())
                .map(|(&d, &s)| (d - 1) * s)
                .sum::<usize>()
    }

    /// Linear element offset for a multi-index, or `None` out of bounds
    pub fn index(&self, indices: &[usize]) -> Option<usize> {
        if indices.len() != self.rank() {
            return None;
        }
        for (&idx, &dim) in indices.iter().zip(self.shape.iter()) {
            if idx >= dim {
                return None;
            }
        }
        let mut linear = self.offset;
        for (&idx, &stride) in indices.iter().zip(self.strides.iter()) {
            linear += idx * stride;
        }
        Some(linear)
    }

    /// Check if strides equal the natural row-major strides for the shape
    pub fn is_dense(&self) -> bool {
        self.strides == row_major_strides(&self.shape)
    }

    /// Check that, with size-1 axes removed, strides strictly decrease
    ///
    /// A descriptor that fails this test has an in-place transposed axis;
    /// accelerated backends cannot walk it in a single pass.
    pub fn is_access_increasing(&self) -> bool {
        let mut prev: Option<usize> = None;
        for (&d, &s) in self.shape.iter().zip(self.strides.iter()) {
            if d == 1 {
                continue;
            }
            if let Some(p) = prev {
                if s >= p {
                    return false;
                }
            }
            prev = Some(s);
        }
        true
    }

    /// Dense, access-increasing, and zero offset
    #[inline]
    pub fn is_simple(&self) -> bool {
        self.offset == 0 && self.is_dense() && self.is_access_increasing()
    }

    /// Reinterpret the same elements under a new shape
    ///
    /// Succeeds only for dense, access-increasing descriptors whose element
    /// count matches the new shape.
    pub fn reshape(&self, new_shape: &[usize]) -> Result<Self> {
        if !self.is_dense() || !self.is_access_increasing() {
            return Err(Error::Shape {
                op: "reshape",
                reason: format!(
                    "strides {:?} are not dense row-major for {:?}",
                    self.strides.as_slice(),
                    self.shape.as_slice()
                ),
            });
        }
        let new_count: usize = new_shape.iter().product();
        if new_count != self.elem_count() || new_shape.iter().any(|&d| d == 0) {
            return Err(Error::Shape {
                op: "reshape",
                reason: format!(
                    "cannot reshape {:?} ({} elements) to {:?} ({} elements)",
                    self.shape.as_slice(),
                    self.elem_count(),
                    new_shape,
                    new_count
                ),
            });
        }
        let shape: Shape = new_shape.iter().copied().collect();
        let strides = row_major_strides(&shape);
        Ok(Self {
            shape,
            strides,
            offset: self.offset,
        })
    }

    /// Reorder axes by a permutation of `[0..rank)`
    pub fn transpose(&self, perm: &[usize]) -> Result<Self> {
        let n = self.rank();
        if perm.len() != n || !is_permutation(perm, n) {
            return Err(Error::Shape {
                op: "transpose",
                reason: format!("{perm:?} is not a permutation of 0..{n}"),
            });
        }
        let shape: Shape = perm.iter().map(|&p| self.shape[p]).collect();
        let strides: Strides = perm.iter().map(|&p| self.strides[p]).collect();
        Ok(Self {
            shape,
            strides,
            offset: self.offset,
        })
    }

    /// Narrow the view with one selector per axis
    ///
    /// Integer selectors drop the axis and fold the coordinate into the
    /// offset; ranges shrink the axis. Non-contiguous or non-monotonic
    /// index runs are rejected with a select error.
    pub fn select(&self, selectors: &[Selector]) -> Result<Self> {
        if selectors.len() != self.rank() {
            return Err(Error::Select {
                reason: format!(
                    "{} selectors for {} axes",
                    selectors.len(),
                    self.rank()
                ),
            });
        }
        let mut shape = Shape::new();
        let mut strides = Strides::new();
        let mut offset = self.offset;
        for (axis, sel) in selectors.iter().enumerate() {
            let dim = self.shape[axis];
            let stride = self.strides[axis];
            match sel.normalize(dim)? {
                None => {
                    shape.push(dim);
                    strides.push(stride);
                }
                Some((lo, hi, keep_axis)) => {
                    offset += lo * stride;
                    if keep_axis {
                        shape.push(hi - lo);
                        strides.push(stride);
                    }
                }
            }
        }
        Ok(Self {
            shape,
            strides,
            offset,
        })
    }

    /// Flatten to `[product_of_leading_axes, last_axis]`
    ///
    /// The leading axes must be mergeable (each contiguous in the next);
    /// the last axis may carry any stride.
    pub fn as_2d(&self) -> Result<Self> {
        match self.rank() {
            0 => Err(Error::Shape {
                op: "as-2d",
                reason: "scalar descriptor has no axes".to_string(),
            }),
            1 => Ok(Self {
                shape: SmallVec::from_slice(&[1, self.shape[0]]),
                strides: SmallVec::from_slice(&[self.shape[0] * self.strides[0], self.strides[0]]),
                offset: self.offset,
            }),
            2 => Ok(self.clone()),
            n => {
                self.require_merged(0, n - 1, "as-2d")?;
                let rows: usize = self.shape[..n - 1].iter().product();
                Ok(Self {
                    shape: SmallVec::from_slice(&[rows, self.shape[n - 1]]),
                    strides: SmallVec::from_slice(&[self.strides[n - 2], self.strides[n - 1]]),
                    offset: self.offset,
                })
            }
        }
    }

    /// Flatten to `[first_axis, product_of_trailing_axes]`
    pub fn as_batch(&self) -> Result<Self> {
        match self.rank() {
            0 => Err(Error::Shape {
                op: "as-batch",
                reason: "scalar descriptor has no axes".to_string(),
            }),
            1 => Ok(Self {
                shape: SmallVec::from_slice(&[self.shape[0], 1]),
                strides: SmallVec::from_slice(&[self.strides[0], 1]),
                offset: self.offset,
            }),
            2 => Ok(self.clone()),
            n => {
                self.require_merged(1, n, "as-batch")?;
                let cols: usize = self.shape[1..].iter().product();
                Ok(Self {
                    shape: SmallVec::from_slice(&[self.shape[0], cols]),
                    strides: SmallVec::from_slice(&[self.strides[0], self.strides[n - 1]]),
                    offset: self.offset,
                })
            }
        }
    }

    /// Stride of the slower-varying axis of a 2-D descriptor
    ///
    /// This is the leading dimension handed to gemm backends.
    pub fn column_stride(&self) -> Result<usize> {
        if self.rank() != 2 {
            return Err(Error::Shape {
                op: "column-stride",
                reason: format!("expected a 2-D descriptor, got rank {}", self.rank()),
            });
        }
        Ok(self.strides[0])
    }

    /// Stride of the fastest-varying axis (1 for a scalar descriptor)
    #[inline]
    pub fn element_stride(&self) -> usize {
        self.strides.last().copied().unwrap_or(1)
    }

    // Axes [lo, hi) must merge into one: each stride equals the next
    // stride times the next dimension.
    fn require_merged(&self, lo: usize, hi: usize, op: &'static str) -> Result<()> {
        for i in lo..hi - 1 {
            if self.strides[i] != self.strides[i + 1] * self.shape[i + 1] {
                return Err(Error::Shape {
                    op,
                    reason: format!(
                        "axes of {:?} with strides {:?} are not contiguous",
                        self.shape.as_slice(),
                        self.strides.as_slice()
                    ),
                });
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Dims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Dims {{ shape: {:?}, strides: {:?}, offset: {} }}",
            self.shape.as_slice(),
            self.strides.as_slice(),
            self.offset
        )
    }
}

fn row_major_strides(shape: &[usize]) -> Strides {
    let mut strides: Strides = SmallVec::with_capacity(shape.len());
    let mut stride = 1usize;
    for &dim in shape.iter().rev() {
        strides.push(stride);
        stride *= dim;
    }
    strides.reverse();
    strides
}

/// Walk a descriptor row by row in row-major order
///
/// Calls `f(base, count, stride)` once per innermost run: `base` is the
/// linear offset of the run's first element, `count` its length, and
/// `stride` the element step inside the run. Hosts and backends share this
/// walk for strided gathers and general elementwise loops.
pub fn for_each_row(
    dims: &Dims,
    mut f: impl FnMut(usize, usize, usize) -> crate::error::Result<()>,
) -> crate::error::Result<()> {
    let rank = dims.rank();
    if rank == 0 {
        return f(dims.offset(), 1, 1);
    }
    let last = rank - 1;
    let count = dims.shape()[last];
    let stride = dims.strides()[last];
    let mut idx = vec![0usize; last];
    loop {
        let mut base = dims.offset();
        for (i, &ix) in idx.iter().enumerate() {
            base += ix * dims.strides()[i];
        }
        f(base, count, stride)?;
        let mut axis = last;
        loop {
            if axis == 0 {
                return Ok(());
            }
            axis -= 1;
            idx[axis] += 1;
            if idx[axis] < dims.shape()[axis] {
                break;
            }
            idx[axis] = 0;
        }
    }
}

fn is_permutation(perm: &[usize], n: usize) -> bool {
    let mut seen = vec![false; n];
    perm.iter().all(|&p| p < n && !std::mem::replace(&mut seen[p], true))
}

/// Check commensurability of two shapes for elementwise broadcasting
///
/// Shapes are right-aligned; a missing axis counts as 1. Each axis pair
/// `(a, b)` must satisfy `max(a, b) % min(a, b) == 0`.
///
/// This deliberately relaxes NumPy broadcasting: any exact divisor
/// broadcasts, not just 1. `[6]` against `[3]` is legal here (the smaller
/// operand repeats via modular indexing) where NumPy would reject it.
pub fn commensurate(a: &[usize], b: &[usize]) -> bool {
    let n = a.len().max(b.len());
    for i in 0..n {
        let ad = if i < a.len() { a[a.len() - 1 - i] } else { 1 };
        let bd = if i < b.len() { b[b.len() - 1 - i] } else { 1 };
        if ad.max(bd) % ad.min(bd) != 0 {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dense_descriptor() {
        let dims = Dims::new(&[2, 3, 4]).unwrap();
        assert_eq!(dims.shape(), &[2, 3, 4]);
        assert_eq!(dims.strides(), &[12, 4, 1]);
        assert_eq!(dims.elem_count(), 24);
        assert!(dims.is_dense());
        assert!(dims.is_simple());
    }

    #[test]
    fn test_zero_axis_rejected() {
        assert!(Dims::new(&[2, 0, 4]).is_err());
    }

    #[test]
    fn test_index_math() {
        let dims = Dims::new(&[2, 3]).unwrap();
        assert_eq!(dims.index(&[0, 0]), Some(0));
        assert_eq!(dims.index(&[1, 2]), Some(5));
        assert_eq!(dims.index(&[2, 0]), None);
        assert_eq!(dims.max_linear_index(), 5);
    }

    #[test]
    fn test_transpose_permutation() {
        let dims = Dims::new(&[2, 3, 4]).unwrap();
        let t = dims.transpose(&[2, 0, 1]).unwrap();
        assert_eq!(t.shape(), &[4, 2, 3]);
        assert_eq!(t.strides(), &[1, 12, 4]);
        assert!(!t.is_access_increasing());
        assert!(dims.transpose(&[0, 0, 1]).is_err());
    }

    #[test]
    fn test_transpose_involution() {
        let dims = Dims::new(&[2, 3, 4]).unwrap();
        let t = dims.transpose(&[1, 2, 0]).unwrap();
        let back = t.transpose(&[2, 0, 1]).unwrap();
        assert_eq!(back, dims);
    }

    #[test]
    fn test_reshape_dense_only() {
        let dims = Dims::new(&[2, 3, 4]).unwrap();
        let r = dims.reshape(&[6, 4]).unwrap();
        assert_eq!(r.shape(), &[6, 4]);
        assert!(r.is_dense());

        let t = dims.transpose(&[1, 0, 2]).unwrap();
        assert!(t.reshape(&[6, 4]).is_err());
        assert!(dims.reshape(&[5, 5]).is_err());
    }

    #[test]
    fn test_access_increasing() {
        let dims = Dims::new(&[2, 3]).unwrap();
        assert!(dims.is_access_increasing());
        let t = dims.transpose(&[1, 0]).unwrap();
        assert!(!t.is_access_increasing());
        // Size-1 axes are ignored
        let d = Dims::with_strides(&[1, 2, 3], &[1, 3, 1], 0).unwrap();
        assert!(d.is_access_increasing());
    }

    #[test]
    fn test_as_2d_and_batch() {
        let dims = Dims::new(&[2, 3, 4]).unwrap();
        let m = dims.as_2d().unwrap();
        assert_eq!(m.shape(), &[6, 4]);
        assert_eq!(m.strides(), &[4, 1]);
        let b = dims.as_batch().unwrap();
        assert_eq!(b.shape(), &[2, 12]);
        assert_eq!(b.strides(), &[12, 1]);

        let v = Dims::new(&[5]).unwrap();
        assert_eq!(v.as_2d().unwrap().shape(), &[1, 5]);
        assert_eq!(v.as_batch().unwrap().shape(), &[5, 1]);
    }

    #[test]
    fn test_gemm_strides() {
        let dims = Dims::new(&[3, 4]).unwrap();
        assert_eq!(dims.column_stride().unwrap(), 4);
        assert_eq!(dims.element_stride(), 1);
        assert!(Dims::new(&[3, 4, 5]).unwrap().column_stride().is_err());
    }

    #[test]
    fn test_commensurate() {
        assert!(commensurate(&[6], &[3]));
        assert!(commensurate(&[6], &[6]));
        assert!(commensurate(&[2, 6], &[3]));
        assert!(commensurate(&[4], &[1]));
        assert!(!commensurate(&[6], &[4]));
        assert!(!commensurate(&[5, 2], &[3, 2]));
    }
}
