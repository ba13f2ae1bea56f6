//! Generic elementwise, ternary, reduction, and sampling kernels
//!
//! Kernels run on the stream worker after the dispatch layer has validated
//! every argument. Operands walk their views with per-axis modular
//! indexing, which is what implements commensurate broadcasting: a smaller
//! operand repeats whenever the destination axis is an exact multiple of
//! its own.
//!
//! Math happens in the canonical f64 form regardless of the element type;
//! bitwise operations use the exact i128 integer path instead.

use crate::dims::{for_each_row, Dims};
use crate::dispatch_dtype;
use crate::dtype::{DType, Element};
use crate::error::{Error, Result};
use crate::ops::{BinaryOp, Distribution, ReduceOp, UnaryOp};

/// A view resolved for kernel execution: host pointer, descriptor, scale
pub(crate) struct KView {
    pub ptr: u64,
    pub dims: Dims,
    pub scale: f64,
}

#[inline]
unsafe fn read<T: Element>(ptr: u64, off: usize) -> T {
    *(ptr as *const T).add(off)
}

#[inline]
unsafe fn write<T: Element>(ptr: u64, off: usize, value: T) {
    *(ptr as *mut T).add(off) = value;
}

fn dest_offset(dims: &Dims, idx: &[usize]) -> usize {
    let mut off = dims.offset();
    for (i, &s) in dims.strides().iter().enumerate() {
        off += idx[i] * s;
    }
    off
}

// Right-aligned modular offset: smaller operands wrap per axis.
fn operand_offset(dims: &Dims, idx: &[usize]) -> usize {
    let pad = idx.len() - dims.rank();
    let mut off = dims.offset();
    for (i, (&d, &s)) in dims.shape().iter().zip(dims.strides()).enumerate() {
        off += (idx[pad + i] % d) * s;
    }
    off
}

fn advance(idx: &mut [usize], shape: &[usize]) {
    for axis in (0..shape.len()).rev() {
        idx[axis] += 1;
        if idx[axis] < shape[axis] {
            return;
        }
        idx[axis] = 0;
    }
}

// General strided walk over the destination, reading each operand in the
// canonical float form.
fn elementwise<T: Element>(dest: &KView, srcs: &[&KView], f: impl Fn(&[f64]) -> f64) {
    let shape = dest.dims.shape();
    let n = dest.dims.elem_count();
    let mut idx = vec![0usize; shape.len()];
    let mut vals = vec![0f64; srcs.len()];
    for _ in 0..n {
        for (v, s) in vals.iter_mut().zip(srcs) {
            let off = operand_offset(&s.dims, &idx);
            *v = s.scale * unsafe { read::<T>(s.ptr, off) }.to_f64();
        }
        let out = T::from_f64(f(&vals));
        unsafe { write::<T>(dest.ptr, dest_offset(&dest.dims, &idx), out) };
        advance(&mut idx, shape);
    }
}

// Exact integer walk for the bitwise operations (unit scales by contract).
fn elementwise_int<T: Element>(dest: &KView, srcs: &[&KView], f: impl Fn(&[i128]) -> i128) {
    let shape = dest.dims.shape();
    let n = dest.dims.elem_count();
    let mut idx = vec![0usize; shape.len()];
    let mut vals = vec![0i128; srcs.len()];
    for _ in 0..n {
        for (v, s) in vals.iter_mut().zip(srcs) {
            let off = operand_offset(&s.dims, &idx);
            *v = unsafe { read::<T>(s.ptr, off) }.to_i128();
        }
        let out = T::from_i128(f(&vals));
        unsafe { write::<T>(dest.ptr, dest_offset(&dest.dims, &idx), out) };
        advance(&mut idx, shape);
    }
}

#[cfg(feature = "rayon")]
mod par {
    use super::*;
    use rayon::prelude::*;

    // Large dense same-shape launches with disjoint storage go through
    // flat slices and rayon; everything else falls back to the strided
    // walk.
    const PAR_THRESHOLD: usize = 1 << 14;

    fn byte_range<T>(view: &KView, n: usize) -> (u64, u64) {
        let elem = std::mem::size_of::<T>() as u64;
        let start = view.ptr + view.dims.offset() as u64 * elem;
        (start, start + n as u64 * elem)
    }

    fn eligible<T: Element>(dest: &KView, srcs: &[&KView]) -> bool {
        let n = dest.dims.elem_count();
        if n < PAR_THRESHOLD || !dest.dims.is_dense() {
            return false;
        }
        let dest_range = byte_range::<T>(dest, n);
        for s in srcs {
            if !s.dims.is_dense() || s.dims.shape() != dest.dims.shape() {
                return false;
            }
            let r = byte_range::<T>(s, n);
            if dest_range.0 < r.1 && r.0 < dest_range.1 {
                return false;
            }
        }
        true
    }

    pub(super) fn try_unary<T: Element>(
        dest: &KView,
        x: &KView,
        f: &(impl Fn(f64) -> f64 + Sync),
    ) -> bool {
        if !eligible::<T>(dest, &[x]) {
            return false;
        }
        let n = dest.dims.elem_count();
        let d = unsafe {
            std::slice::from_raw_parts_mut((dest.ptr as *mut T).add(dest.dims.offset()), n)
        };
        let xs =
            unsafe { std::slice::from_raw_parts((x.ptr as *const T).add(x.dims.offset()), n) };
        let scale = x.scale;
        d.par_iter_mut()
            .zip(xs.par_iter())
            .for_each(|(d, s)| *d = T::from_f64(f(scale * s.to_f64())));
        true
    }

    pub(super) fn try_binary<T: Element>(
        dest: &KView,
        x: &KView,
        y: &KView,
        f: &(impl Fn(f64, f64) -> f64 + Sync),
    ) -> bool {
        if !eligible::<T>(dest, &[x, y]) {
            return false;
        }
        let n = dest.dims.elem_count();
        let d = unsafe {
            std::slice::from_raw_parts_mut((dest.ptr as *mut T).add(dest.dims.offset()), n)
        };
        let xs =
            unsafe { std::slice::from_raw_parts((x.ptr as *const T).add(x.dims.offset()), n) };
        let ys =
            unsafe { std::slice::from_raw_parts((y.ptr as *const T).add(y.dims.offset()), n) };
        let (sx, sy) = (x.scale, y.scale);
        d.par_iter_mut()
            .zip(xs.par_iter().zip(ys.par_iter()))
            .for_each(|(d, (a, b))| {
                *d = T::from_f64(f(sx * a.to_f64(), sy * b.to_f64()));
            });
        true
    }
}

fn unary_fn(op: UnaryOp) -> fn(f64) -> f64 {
    match op {
        UnaryOp::Floor => f64::floor,
        UnaryOp::Ceil => f64::ceil,
        UnaryOp::Round => f64::round,
        UnaryOp::Negate => |v| -v,
        UnaryOp::Tanh => f64::tanh,
        UnaryOp::Logistic => |v| 1.0 / (1.0 + (-v).exp()),
        UnaryOp::Exp => f64::exp,
        UnaryOp::Sqrt => f64::sqrt,
        UnaryOp::Noop => |v| v,
    }
}

fn binary_fn(op: BinaryOp) -> fn(f64, f64) -> f64 {
    fn truth(t: bool) -> f64 {
        if t {
            1.0
        } else {
            0.0
        }
    }
    match op {
        BinaryOp::Add => |a, b| a + b,
        BinaryOp::Sub => |a, b| a - b,
        BinaryOp::Mul => |a, b| a * b,
        BinaryOp::Div => |a, b| a / b,
        BinaryOp::Max => f64::max,
        BinaryOp::Min => f64::min,
        BinaryOp::Eq => |a, b| truth(a == b),
        BinaryOp::Gt => |a, b| truth(a > b),
        BinaryOp::Ge => |a, b| truth(a >= b),
        BinaryOp::Lt => |a, b| truth(a < b),
        BinaryOp::Le => |a, b| truth(a <= b),
        BinaryOp::BitAnd | BinaryOp::BitXor => {
            unreachable!("bitwise ops take the integer path")
        }
    }
}

pub(crate) fn unary(dtype: DType, dest: &KView, op: UnaryOp, x: &KView) -> Result<()> {
    let f = unary_fn(op);
    dispatch_dtype!(dtype, T => {
        #[cfg(feature = "rayon")]
        if par::try_unary::<T>(dest, x, &f) {
            return Ok(());
        }
        elementwise::<T>(dest, &[x], |v| f(v[0]));
    });
    Ok(())
}

pub(crate) fn binary(
    dtype: DType,
    dest: &KView,
    op: BinaryOp,
    x: &KView,
    y: &KView,
) -> Result<()> {
    if op.is_bitwise() {
        dispatch_dtype!(dtype, T => {
            elementwise_int::<T>(dest, &[x, y], |v| match op {
                BinaryOp::BitAnd => v[0] & v[1],
                BinaryOp::BitXor => v[0] ^ v[1],
                _ => unreachable!(),
            });
        });
        return Ok(());
    }
    let f = binary_fn(op);
    dispatch_dtype!(dtype, T => {
        #[cfg(feature = "rayon")]
        if par::try_binary::<T>(dest, x, y, &f) {
            return Ok(());
        }
        elementwise::<T>(dest, &[x, y], |v| f(v[0], v[1]));
    });
    Ok(())
}

pub(crate) fn ternary_select(
    dtype: DType,
    dest: &KView,
    x: &KView,
    y: &KView,
    z: &KView,
) -> Result<()> {
    dispatch_dtype!(dtype, T => {
        elementwise::<T>(dest, &[x, y, z], |v| if v[0] >= 0.0 { v[1] } else { v[2] });
    });
    Ok(())
}

// Unravel the k-th row-major element of a descriptor.
fn linear_offset(dims: &Dims, k: usize) -> usize {
    let mut rem = k;
    let mut off = dims.offset();
    for axis in (0..dims.rank()).rev() {
        let d = dims.shape()[axis];
        off += (rem % d) * dims.strides()[axis];
        rem /= d;
    }
    off
}

pub(crate) fn reduce(dtype: DType, dest: &KView, op: ReduceOp, x: &KView) -> Result<()> {
    dispatch_dtype!(dtype, T => {
        reduce_typed::<T>(dest, op, x)?;
    });
    Ok(())
}

fn reduce_typed<T: Element>(dest: &KView, op: ReduceOp, x: &KView) -> Result<()> {
    let mut k = 0usize;
    for_each_row(&x.dims, |base, count, stride| {
        let mut acc = match op {
            ReduceOp::Max => f64::NEG_INFINITY,
            ReduceOp::Min => f64::INFINITY,
            _ => 0.0,
        };
        for j in 0..count {
            let v = x.scale * unsafe { read::<T>(x.ptr, base + j * stride) }.to_f64();
            match op {
                ReduceOp::Max => acc = acc.max(v),
                ReduceOp::Min => acc = acc.min(v),
                ReduceOp::Sum | ReduceOp::Mean => acc += v,
                ReduceOp::MagnitudeSquared | ReduceOp::Magnitude => acc += v * v,
            }
        }
        let value = match op {
            ReduceOp::Mean => acc / count as f64,
            ReduceOp::Magnitude => acc.sqrt(),
            _ => acc,
        };
        unsafe { write::<T>(dest.ptr, linear_offset(&dest.dims, k), T::from_f64(value)) };
        k += 1;
        Ok(())
    })
}

pub(crate) fn fill_random(dest: &KView, dist: Distribution) -> Result<()> {
    use rand_distr::{Distribution as Sample, Normal, Uniform};

    let mut rng = rand::rng();
    match dist {
        Distribution::Gaussian { mean, variance } => {
            let normal = Normal::new(mean as f32, (variance as f32).sqrt())
                .map_err(|e| Error::device(format!("gaussian parameters rejected: {e}")))?;
            write_samples(dest, || normal.sample(&mut rng))
        }
        Distribution::Flat { min, max } => {
            let uniform = Uniform::new(min as f32, max as f32)
                .map_err(|e| Error::device(format!("flat parameters rejected: {e}")))?;
            write_samples(dest, || uniform.sample(&mut rng))
        }
    }
}

fn write_samples(dest: &KView, mut next: impl FnMut() -> f32) -> Result<()> {
    for_each_row(&dest.dims, |base, count, stride| {
        for j in 0..count {
            unsafe { write::<f32>(dest.ptr, base + j * stride, next()) };
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kview(data: &mut [f64], shape: &[usize]) -> KView {
        KView {
            ptr: data.as_mut_ptr() as u64,
            dims: Dims::new(shape).unwrap(),
            scale: 1.0,
        }
    }

    #[test]
    fn test_unary_scaled() {
        let mut src = [1.0f64, 4.0, 9.0, 16.0];
        let mut dst = [0.0f64; 4];
        let x = KView {
            scale: 4.0,
            ..kview(&mut src, &[4])
        };
        let d = kview(&mut dst, &[4]);
        unary(DType::F64, &d, UnaryOp::Sqrt, &x).unwrap();
        assert_eq!(dst, [2.0, 4.0, 6.0, 8.0]);
    }

    #[test]
    fn test_binary_modular_broadcast() {
        let mut a = [1.0f64, 2.0, 3.0, 4.0, 5.0, 6.0];
        let mut b = [10.0f64, 20.0, 30.0];
        let mut out = [0.0f64; 6];
        let x = kview(&mut a, &[6]);
        let y = kview(&mut b, &[3]);
        let d = kview(&mut out, &[6]);
        binary(DType::F64, &d, BinaryOp::Add, &x, &y).unwrap();
        assert_eq!(out, [11.0, 22.0, 33.0, 14.0, 25.0, 36.0]);
    }

    #[test]
    fn test_bitwise_integer_path() {
        let mut a = [0b1100u64, u64::MAX];
        let mut b = [0b1010u64, 1];
        let mut out = [0u64; 2];
        let x = KView {
            ptr: a.as_mut_ptr() as u64,
            dims: Dims::new(&[2]).unwrap(),
            scale: 1.0,
        };
        let y = KView {
            ptr: b.as_mut_ptr() as u64,
            dims: Dims::new(&[2]).unwrap(),
            scale: 1.0,
        };
        let d = KView {
            ptr: out.as_mut_ptr() as u64,
            dims: Dims::new(&[2]).unwrap(),
            scale: 1.0,
        };
        binary(DType::U64, &d, BinaryOp::BitAnd, &x, &y).unwrap();
        assert_eq!(out, [0b1000, 1]);
    }

    #[test]
    fn test_ternary_select() {
        let mut cond = [1.0f64, -1.0, 0.0];
        let mut yes = [10.0f64, 20.0, 30.0];
        let mut no = [-10.0f64, -20.0, -30.0];
        let mut out = [0.0f64; 3];
        let (c, y, n, d) = (
            kview(&mut cond, &[3]),
            kview(&mut yes, &[3]),
            kview(&mut no, &[3]),
            kview(&mut out, &[3]),
        );
        ternary_select(DType::F64, &d, &c, &y, &n).unwrap();
        assert_eq!(out, [10.0, -20.0, 30.0]);
    }

    #[test]
    fn test_reduce_magnitude() {
        let mut src = [3.0f64, 4.0, 0.0, 5.0];
        let mut out = [0.0f64; 2];
        let x = kview(&mut src, &[2, 2]);
        let d = kview(&mut out, &[2]);
        reduce(DType::F64, &d, ReduceOp::Magnitude, &x).unwrap();
        assert_eq!(out, [5.0, 5.0]);
    }

    #[test]
    fn test_reduce_mean_strided_dest() {
        let mut src = [1.0f64, 2.0, 3.0, 4.0];
        let mut out = [0.0f64; 4];
        let x = kview(&mut src, &[2, 2]);
        // Write means into a stride-2 destination view
        let d = KView {
            ptr: out.as_mut_ptr() as u64,
            dims: Dims::with_strides(&[2], &[2], 0).unwrap(),
            scale: 1.0,
        };
        reduce(DType::F64, &d, ReduceOp::Mean, &x).unwrap();
        assert_eq!(out, [1.5, 0.0, 3.5, 0.0]);
    }

    #[test]
    fn test_fill_flat_in_range() {
        let mut out = [0.0f32; 64];
        let d = KView {
            ptr: out.as_mut_ptr() as u64,
            dims: Dims::new(&[64]).unwrap(),
            scale: 1.0,
        };
        fill_random(&d, Distribution::Flat { min: 2.0, max: 3.0 }).unwrap();
        assert!(out.iter().all(|&v| (2.0..3.0).contains(&v)));
    }
}
