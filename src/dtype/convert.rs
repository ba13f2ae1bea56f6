//! Typed elementwise copy with conversion
//!
//! This is the single conversion boundary of the datatype registry: every
//! host-side ingress and egress goes through `copy_convert`. Narrowing
//! conversions round toward zero. Out-of-range values wrap modulo 2^width
//! for integer targets when `unchecked`, and fail with a domain error
//! otherwise.

use super::{DType, Element};
use crate::dispatch_dtype;
use crate::error::{Error, Result};

/// Typed elementwise copy between two raw buffers with conversion
///
/// `src_ptr`/`dst_ptr` are host addresses; offsets and `n` are in elements
/// of the respective dtypes. Same-dtype copies degenerate to a memcpy.
///
/// # Safety contract
///
/// Callers guarantee both regions are live host memory covering
/// `off + n` elements and that the regions do not overlap unless the
/// dtypes are equal and the copy direction is safe for `ptr::copy`.
pub fn copy_convert(
    src_dtype: DType,
    src_ptr: u64,
    src_off: usize,
    dst_dtype: DType,
    dst_ptr: u64,
    dst_off: usize,
    n: usize,
    unchecked: bool,
) -> Result<()> {
    if n == 0 {
        return Ok(());
    }
    dispatch_dtype!(src_dtype, S => {
        dispatch_dtype!(dst_dtype, D => {
            convert_slice::<S, D>(src_ptr, src_off, dst_ptr, dst_off, n, unchecked)
        })
    })
}

fn convert_slice<S: Element, D: Element>(
    src_ptr: u64,
    src_off: usize,
    dst_ptr: u64,
    dst_off: usize,
    n: usize,
    unchecked: bool,
) -> Result<()> {
    let src = unsafe { std::slice::from_raw_parts((src_ptr as *const S).add(src_off), n) };
    let dst = unsafe { std::slice::from_raw_parts_mut((dst_ptr as *mut D).add(dst_off), n) };

    if S::DTYPE == D::DTYPE {
        // Same representation; regions may overlap (sub-buffer copies)
        unsafe {
            std::ptr::copy(src.as_ptr().cast::<D>(), dst.as_mut_ptr(), n);
        }
        return Ok(());
    }

    match (S::DTYPE.is_float(), D::DTYPE.is_float()) {
        // Exact integer path; i128 holds i64 and u64 losslessly
        (false, false) => {
            let bounds = D::DTYPE.int_bounds().expect("integer dtype has bounds");
            for (d, s) in dst.iter_mut().zip(src.iter()) {
                let v = s.to_i128();
                if !unchecked && (v < bounds.0 || v > bounds.1) {
                    return Err(out_of_range::<D>(v as f64));
                }
                *d = D::from_i128(v);
            }
        }
        (_, true) => {
            for (d, s) in dst.iter_mut().zip(src.iter()) {
                *d = D::from_f64(s.to_f64());
            }
        }
        // Float source, integer target: truncate toward zero, then wrap or check
        (true, false) => {
            let bounds = D::DTYPE.int_bounds().expect("integer dtype has bounds");
            for (d, s) in dst.iter_mut().zip(src.iter()) {
                let v = s.to_f64();
                if v.is_nan() {
                    if !unchecked {
                        return Err(Error::Domain {
                            dtype: D::DTYPE,
                            reason: "NaN has no integer value".to_string(),
                        });
                    }
                    *d = D::zero();
                    continue;
                }
                // `as i128` saturates, which keeps the bounds test exact
                let t = v.trunc() as i128;
                if !unchecked && (t < bounds.0 || t > bounds.1) {
                    return Err(out_of_range::<D>(v));
                }
                *d = D::from_i128(t);
            }
        }
    }
    Ok(())
}

fn out_of_range<D: Element>(value: f64) -> Error {
    Error::Domain {
        dtype: D::DTYPE,
        reason: format!("value {value} out of range"),
    }
}
