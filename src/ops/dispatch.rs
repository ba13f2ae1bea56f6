//! Validation and routing of math operations onto streams
//!
//! Every entry point checks shapes, dtypes, aliasing, and device placement
//! before the backend sees anything, so failed operations are never
//! partially committed. Scalar operands are promoted to broadcast
//! one-element views here; backends only ever receive buffers.

use super::{
    BinaryOp, Distribution, GemmArgs, MathBackend as _, OperandView, ReduceOp, UnaryOp,
};
use crate::dims::Dims;
use crate::driver::{registry, same_device, Buffer, HostUsage, Stream};
use crate::dtype::{copy_convert, DType};
use crate::error::{Error, Result};
use crate::tensor::Tensor;
use std::sync::Arc;

/// A math-operation argument: a tensor or a scalar
///
/// Scalars carry their value through promotion to a broadcast one-element
/// view; the per-argument scale factor applies to either form.
#[derive(Clone, Copy)]
pub enum Operand<'a> {
    /// A tensor argument
    Tensor(&'a Tensor),
    /// A scalar argument
    Scalar(f64),
}

impl<'a> From<&'a Tensor> for Operand<'a> {
    fn from(tensor: &'a Tensor) -> Self {
        Operand::Tensor(tensor)
    }
}

impl From<f64> for Operand<'_> {
    fn from(value: f64) -> Self {
        Operand::Scalar(value)
    }
}

/// `dest = f(alpha * x)`
pub fn unary(
    stream: &Arc<dyn Stream>,
    dest: &Tensor,
    op: UnaryOp,
    alpha: f64,
    x: &Operand,
) -> Result<()> {
    const OP: &str = "unary";
    check_on_stream(stream, dest.buffer(), OP)?;
    let (x_view, _) = make_view(stream, x, alpha, dest, OP, true)?;
    stream.launch_unary(&dest_view(dest), op, &x_view)
}

/// `dest = (alpha * x) op (beta * y)`
///
/// Operand shapes must be commensurate with the destination, and the
/// destination must carry the larger element count.
pub fn binary(
    stream: &Arc<dyn Stream>,
    dest: &Tensor,
    op: BinaryOp,
    alpha: f64,
    x: &Operand,
    beta: f64,
    y: &Operand,
) -> Result<()> {
    const OP: &str = "binary";
    check_on_stream(stream, dest.buffer(), OP)?;
    if op.is_bitwise() {
        if dest.dtype().is_float() {
            return Err(Error::Domain {
                dtype: dest.dtype(),
                reason: format!("{op:?} requires an integer dtype"),
            });
        }
        if alpha != 1.0 || beta != 1.0 {
            return Err(Error::Domain {
                dtype: dest.dtype(),
                reason: format!("{op:?} requires unit scale factors"),
            });
        }
    }
    check_pairwise_commensurate(OP, &[x, y])?;
    let (x_view, x_count) = make_view(stream, x, alpha, dest, OP, true)?;
    let (y_view, y_count) = make_view(stream, y, beta, dest, OP, true)?;
    check_dest_is_max(OP, dest, &[x_count, y_count])?;
    stream.launch_binary(&dest_view(dest), op, &x_view, &y_view)
}

/// `dest = (alpha * x) >= 0 ? (beta * y) : (gamma * z)`
pub fn ternary_select(
    stream: &Arc<dyn Stream>,
    dest: &Tensor,
    alpha: f64,
    x: &Operand,
    beta: f64,
    y: &Operand,
    gamma: f64,
    z: &Operand,
) -> Result<()> {
    const OP: &str = "ternary-select";
    check_on_stream(stream, dest.buffer(), OP)?;
    check_pairwise_commensurate(OP, &[x, y, z])?;
    let (x_view, x_count) = make_view(stream, x, alpha, dest, OP, true)?;
    let (y_view, y_count) = make_view(stream, y, beta, dest, OP, true)?;
    let (z_view, z_count) = make_view(stream, z, gamma, dest, OP, true)?;
    check_dest_is_max(OP, dest, &[x_count, y_count, z_count])?;
    stream.launch_ternary_select(&dest_view(dest), &x_view, &y_view, &z_view)
}

/// Reduce `alpha * x` along its last axis into `dest`
pub fn reduce(
    stream: &Arc<dyn Stream>,
    dest: &Tensor,
    op: ReduceOp,
    alpha: f64,
    x: &Tensor,
) -> Result<()> {
    const OP: &str = "reduce";
    check_on_stream(stream, dest.buffer(), OP)?;
    check_on_stream(stream, x.buffer(), OP)?;
    check_dtype(OP, dest.dtype(), x.dtype())?;
    if x.rank() == 0 {
        return Err(Error::Shape {
            op: OP,
            reason: "input has no axes to reduce".to_string(),
        });
    }
    let expected: &[usize] = if x.rank() == 1 {
        &[1]
    } else {
        &x.shape()[..x.rank() - 1]
    };
    if dest.shape() != expected {
        return Err(Error::Shape {
            op: OP,
            reason: format!(
                "reducing {:?} along the last axis needs destination {:?}, got {:?}",
                x.shape(),
                expected,
                dest.shape()
            ),
        });
    }
    check_dest_alias(OP, dest, x, false)?;
    let x_view = OperandView {
        buffer: Arc::clone(x.buffer()),
        dims: x.dims().clone(),
        scale: alpha,
    };
    stream.launch_reduce(&dest_view(dest), op, &x_view)
}

/// `C = alpha * opA(A) * opB(B) + beta * C`
///
/// In-place transposed operands are canonicalized by flipping their
/// transpose flag, so backends only ever see access-increasing matrices
/// with unit element stride.
pub fn gemm(
    stream: &Arc<dyn Stream>,
    c: &Tensor,
    trans_a: bool,
    trans_b: bool,
    alpha: f64,
    a: &Tensor,
    b: &Tensor,
    beta: f64,
) -> Result<()> {
    const OP: &str = "gemm";
    for tensor in [c, a, b] {
        check_on_stream(stream, tensor.buffer(), OP)?;
    }
    check_dtype(OP, c.dtype(), a.dtype())?;
    check_dtype(OP, c.dtype(), b.dtype())?;
    if !c.dtype().is_float() {
        return Err(Error::Domain {
            dtype: c.dtype(),
            reason: "gemm supports float dtypes only".to_string(),
        });
    }
    check_dest_alias(OP, c, a, false)?;
    check_dest_alias(OP, c, b, false)?;

    let (a_dims, trans_a) = canonical_2d(a.dims(), trans_a, "A")?;
    let (b_dims, trans_b) = canonical_2d(b.dims(), trans_b, "B")?;
    let c_dims = c.dims();
    if c_dims.rank() != 2 || !c_dims.is_access_increasing() {
        return Err(Error::Shape {
            op: OP,
            reason: format!("C must be an untransposed matrix, got {c_dims:?}"),
        });
    }
    for (dims, which) in [(&a_dims, "A"), (&b_dims, "B"), (c_dims, "C")] {
        if dims.element_stride() != 1 {
            return Err(Error::Shape {
                op: OP,
                reason: format!("{which} has element stride {}", dims.element_stride()),
            });
        }
    }

    let (ra, ca) = (a_dims.shape()[0], a_dims.shape()[1]);
    let (m, k) = if trans_a { (ca, ra) } else { (ra, ca) };
    let (rb, cb) = (b_dims.shape()[0], b_dims.shape()[1]);
    let (kb, n) = if trans_b { (cb, rb) } else { (rb, cb) };
    if k != kb || c_dims.shape() != [m, n].as_slice() {
        return Err(Error::Shape {
            op: OP,
            reason: format!(
                "op(A) is {m}x{k}, op(B) is {kb}x{n}, C is {:?}",
                c_dims.shape()
            ),
        });
    }

    stream.launch_gemm(GemmArgs {
        c: Arc::clone(c.buffer()),
        c_offset: c_dims.offset(),
        ldc: c_dims.column_stride()?,
        trans_a,
        trans_b,
        alpha,
        a: Arc::clone(a.buffer()),
        a_offset: a_dims.offset(),
        m,
        k,
        lda: a_dims.column_stride()?,
        b: Arc::clone(b.buffer()),
        b_offset: b_dims.offset(),
        n,
        ldb: b_dims.column_stride()?,
        beta,
    })
}

/// Overwrite `dest` with samples from `dist` (f32 destinations only)
pub fn fill_random(stream: &Arc<dyn Stream>, dest: &Tensor, dist: Distribution) -> Result<()> {
    const OP: &str = "rand";
    check_on_stream(stream, dest.buffer(), OP)?;
    if dest.dtype() != DType::F32 {
        return Err(Error::Domain {
            dtype: dest.dtype(),
            reason: "random fills produce f32 samples only".to_string(),
        });
    }
    match dist {
        Distribution::Gaussian { variance, .. } if !(variance >= 0.0) => {
            return Err(Error::Domain {
                dtype: DType::F32,
                reason: format!("variance {variance} must be non-negative"),
            })
        }
        Distribution::Flat { min, max } if !(min < max) => {
            return Err(Error::Domain {
                dtype: DType::F32,
                reason: format!("empty sample interval [{min}, {max})"),
            })
        }
        _ => {}
    }
    stream.launch_fill_random(&dest_view(dest), dist)
}

fn dest_view(dest: &Tensor) -> OperandView {
    OperandView {
        buffer: Arc::clone(dest.buffer()),
        dims: dest.dims().clone(),
        scale: 1.0,
    }
}

// Resolve an operand into a checked view. Returns the operand's element
// count for tensor operands, `None` for promoted scalars.
fn make_view(
    stream: &Arc<dyn Stream>,
    operand: &Operand,
    scale: f64,
    dest: &Tensor,
    op: &'static str,
    allow_exact_alias: bool,
) -> Result<(OperandView, Option<usize>)> {
    match operand {
        Operand::Tensor(x) => {
            check_on_stream(stream, x.buffer(), op)?;
            check_dtype(op, dest.dtype(), x.dtype())?;
            check_commensurate_into(op, dest.dims(), x.dims())?;
            check_dest_alias(op, dest, x, allow_exact_alias)?;
            Ok((
                OperandView {
                    buffer: Arc::clone(x.buffer()),
                    dims: x.dims().clone(),
                    scale,
                },
                Some(x.elem_count()),
            ))
        }
        Operand::Scalar(value) => {
            let view = promote_scalar(stream, *value, dest.dtype(), dest.rank(), scale)?;
            Ok((view, None))
        }
    }
}

// Each destination axis count must be an exact multiple of the operand's
// (right-aligned; missing axes count as 1). The backend then walks the
// operand with modular indexing. This is the commensurate relaxation of
// broadcasting: any divisor repeats, not just 1.
fn check_commensurate_into(op: &'static str, dest: &Dims, x: &Dims) -> Result<()> {
    if x.rank() > dest.rank() {
        return Err(Error::Shape {
            op,
            reason: format!(
                "operand rank {} exceeds destination rank {}",
                x.rank(),
                dest.rank()
            ),
        });
    }
    let offset = dest.rank() - x.rank();
    for (i, &xd) in x.shape().iter().enumerate() {
        let dd = dest.shape()[offset + i];
        if dd % xd != 0 {
            return Err(Error::Shape {
                op,
                reason: format!(
                    "shapes {:?} and {:?} are not commensurate",
                    dest.shape(),
                    x.shape()
                ),
            });
        }
    }
    Ok(())
}

// Tensor operands must be commensurate with each other, not just with the
// destination.
fn check_pairwise_commensurate(op: &'static str, operands: &[&Operand]) -> Result<()> {
    let shapes: Vec<&[usize]> = operands
        .iter()
        .filter_map(|o| match o {
            Operand::Tensor(t) => Some(t.shape()),
            Operand::Scalar(_) => None,
        })
        .collect();
    for (i, a) in shapes.iter().enumerate() {
        for b in &shapes[i + 1..] {
            if !crate::dims::commensurate(a, b) {
                return Err(Error::Shape {
                    op,
                    reason: format!("operand shapes {a:?} and {b:?} are not commensurate"),
                });
            }
        }
    }
    Ok(())
}

// The destination must be the max-element-count side among the tensor
// operands (promoted scalars are exempt).
fn check_dest_is_max(op: &'static str, dest: &Tensor, counts: &[Option<usize>]) -> Result<()> {
    let max = counts.iter().flatten().copied().max();
    if let Some(max) = max {
        if dest.elem_count() != max {
            return Err(Error::Shape {
                op,
                reason: format!(
                    "destination holds {} elements but the largest operand holds {max}",
                    dest.elem_count()
                ),
            });
        }
    }
    Ok(())
}

fn check_dtype(op: &'static str, expected: DType, got: DType) -> Result<()> {
    if expected != got {
        return Err(Error::Domain {
            dtype: got,
            reason: format!("'{op}' arguments must share dtype {expected}"),
        });
    }
    Ok(())
}

// The buffer must live on the stream's device, or be host memory the
// device can address directly.
fn check_on_stream(stream: &Arc<dyn Stream>, buffer: &Arc<dyn Buffer>, op: &'static str) -> Result<()> {
    match buffer.device() {
        Some(device) => {
            if device.driver_name() != stream.driver_name() {
                return Err(Error::CrossDriver {
                    src: device.driver_name().to_string(),
                    dst: stream.driver_name().to_string(),
                });
            }
            if !same_device(device.as_ref(), stream.device().as_ref()) {
                return Err(Error::device(format!(
                    "'{op}' argument lives on {} but the stream serves {}",
                    device.name(),
                    stream.device().name()
                )));
            }
            Ok(())
        }
        None => {
            if stream.device().accepts_host_buffer(buffer.as_ref()) {
                Ok(())
            } else {
                Err(Error::device(format!(
                    "'{op}' argument is a host buffer the device cannot address"
                )))
            }
        }
    }
}

// Absolute element range of a view inside its backing allocation.
fn abs_range(t: &Tensor) -> (u64, usize, usize) {
    let region = t.buffer().region();
    let lo = region.offset + t.dims().offset();
    let hi = region.offset + t.dims().max_linear_index() + 1;
    (region.base, lo, hi)
}

fn index_sets_equal(a: &Tensor, b: &Tensor) -> bool {
    let (base_a, lo_a, _) = abs_range(a);
    let (base_b, lo_b, _) = abs_range(b);
    base_a == base_b
        && lo_a == lo_b
        && a.dims().shape() == b.dims().shape()
        && a.dims().strides() == b.dims().strides()
}

// Reject overlap between the destination and an input. Operations that
// tolerate in-place application pass `allow_exact` to admit an input whose
// index set is identical to the destination's.
fn check_dest_alias(
    op: &'static str,
    dest: &Tensor,
    input: &Tensor,
    allow_exact: bool,
) -> Result<()> {
    let (base_d, lo_d, hi_d) = abs_range(dest);
    let (base_i, lo_i, hi_i) = abs_range(input);
    if base_d != base_i || lo_d >= hi_i || lo_i >= hi_d {
        return Ok(());
    }
    if allow_exact && index_sets_equal(dest, input) {
        return Ok(());
    }
    Err(Error::Alias { op })
}

// Canonicalize one gemm operand: an in-place transposed matrix (strides
// increasing) becomes its transposed twin with the flag flipped.
fn canonical_2d(dims: &Dims, trans: bool, which: &'static str) -> Result<(Dims, bool)> {
    if dims.rank() != 2 {
        return Err(Error::Shape {
            op: "gemm",
            reason: format!("{which} must be 2-D, got {:?}", dims.shape()),
        });
    }
    if dims.is_access_increasing() {
        return Ok((dims.clone(), trans));
    }
    let flipped = dims.transpose(&[1, 0])?;
    if !flipped.is_access_increasing() {
        return Err(Error::Shape {
            op: "gemm",
            reason: format!("{which} strides {:?} fit neither layout", dims.strides()),
        });
    }
    Ok((flipped, !trans))
}

// Materialize a scalar as a one-element broadcast view on the stream's
// device.
fn promote_scalar(
    stream: &Arc<dyn Stream>,
    value: f64,
    dtype: DType,
    rank: usize,
    scale: f64,
) -> Result<OperandView> {
    let device = stream.device();
    let driver = registry::driver(device.driver_name())?;
    let host = driver.allocate_host_buffer(1, dtype, HostUsage::OneTime)?;
    let host_ptr = host
        .host_ptr()
        .ok_or_else(|| Error::device("driver returned a non-addressable host buffer"))?;
    copy_convert(
        DType::F64,
        (&value as *const f64) as u64,
        0,
        dtype,
        host_ptr,
        0,
        1,
        true,
    )?;
    let buffer = if device.accepts_host_buffer(host.as_ref()) {
        host
    } else {
        let device_buffer = device.allocate_buffer(1, dtype)?;
        stream.copy_host_to_device(&host, 0, &device_buffer, 0, 1)?;
        device_buffer
    };
    let ones = vec![1usize; rank.max(1)];
    Ok(OperandView {
        buffer,
        dims: Dims::new(&ones)?,
        scale,
    })
}
