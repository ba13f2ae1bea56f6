//! BLAS-backed matrix multiply via faer
//!
//! The dispatcher hands this module canonical operands only: row-major
//! storage, unit element stride, transposition folded into the flags.
//! faer's matmul accepts arbitrary strides, so transposed operands are
//! expressed as stride-swapped views rather than copies.

use crate::error::{Error, Result};
use crate::ops::GemmArgs;
use faer::linalg::matmul::matmul;
use faer::mat::{MatMut, MatRef};
use faer::Accum;

pub(crate) fn run(args: &GemmArgs) -> Result<()> {
    match args.c.dtype() {
        crate::dtype::DType::F32 => run_f32(args),
        crate::dtype::DType::F64 => run_f64(args),
        other => Err(Error::Domain {
            dtype: other,
            reason: "gemm supports float dtypes only".to_string(),
        }),
    }
}

macro_rules! gemm_impl {
    ($name:ident, $ty:ty) => {
        fn $name(args: &GemmArgs) -> Result<()> {
            let a_ptr = host_ptr(&args.a)? as *const $ty;
            let b_ptr = host_ptr(&args.b)? as *const $ty;
            let c_ptr = host_ptr(&args.c)? as *mut $ty;
            let par = faer::get_global_parallelism();
            let alpha = args.alpha as $ty;

            // Stored (pre-transpose) extents of each operand
            let (ra, ca) = if args.trans_a {
                (args.k, args.m)
            } else {
                (args.m, args.k)
            };
            let (rb, cb) = if args.trans_b {
                (args.n, args.k)
            } else {
                (args.k, args.n)
            };

            unsafe {
                let a = MatRef::from_raw_parts(
                    a_ptr.add(args.a_offset),
                    ra,
                    ca,
                    args.lda as isize,
                    1,
                );
                let a = if args.trans_a { a.transpose() } else { a };
                let b = MatRef::from_raw_parts(
                    b_ptr.add(args.b_offset),
                    rb,
                    cb,
                    args.ldb as isize,
                    1,
                );
                let b = if args.trans_b { b.transpose() } else { b };

                if args.beta != 0.0 && args.beta != 1.0 {
                    let beta = args.beta as $ty;
                    let base = c_ptr.add(args.c_offset);
                    for i in 0..args.m {
                        let row = base.add(i * args.ldc);
                        for j in 0..args.n {
                            *row.add(j) *= beta;
                        }
                    }
                }

                let mut c = MatMut::from_raw_parts_mut(
                    c_ptr.add(args.c_offset),
                    args.m,
                    args.n,
                    args.ldc as isize,
                    1,
                );
                let accum = if args.beta == 0.0 {
                    Accum::Replace
                } else {
                    Accum::Add
                };
                matmul(&mut c, accum, a, b, alpha, par);
            }
            Ok(())
        }
    };
}

gemm_impl!(run_f32, f32);
gemm_impl!(run_f64, f64);

fn host_ptr(buffer: &std::sync::Arc<dyn crate::driver::Buffer>) -> Result<u64> {
    buffer
        .host_ptr()
        .ok_or_else(|| Error::device("gemm requires host-addressable buffers"))
}
