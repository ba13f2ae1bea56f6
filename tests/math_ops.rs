//! Dispatch-layer semantics: elementwise, reductions, gemm, rand

mod common;

use common::{assert_allclose_f64, with_cpu};
use tensr::prelude::*;

#[test]
fn test_gemm_plain_and_transposed() {
    with_cpu(|| {
        let a = to_tensor(&[[1.0f64, 2.0], [3.0, 4.0]], TensorOpts::new())?;
        let b = to_tensor(&[[5.0f64, 6.0], [7.0, 8.0]], TensorOpts::new())?;
        let c = new_tensor(&[2, 2], TensorOpts::new())?;
        let stream = current_stream()?;

        ops::gemm(&stream, &c, false, false, 1.0, &a, &b, 0.0)?;
        stream.sync_with_host()?;
        assert_eq!(
            c.to_vec2::<f64>()?,
            vec![vec![19.0, 22.0], vec![43.0, 50.0]]
        );

        ops::gemm(&stream, &c, true, false, 1.0, &a, &b, 0.0)?;
        stream.sync_with_host()?;
        assert_eq!(
            c.to_vec2::<f64>()?,
            vec![vec![26.0, 30.0], vec![38.0, 44.0]]
        );
        Ok(())
    });
}

#[test]
fn test_gemm_canonicalizes_transposed_views() {
    with_cpu(|| {
        let a = to_tensor(&[[1.0f64, 2.0], [3.0, 4.0]], TensorOpts::new())?;
        let b = to_tensor(&[[5.0f64, 6.0], [7.0, 8.0]], TensorOpts::new())?;
        let c = new_tensor(&[2, 2], TensorOpts::new())?;
        let stream = current_stream()?;

        // An in-place transposed A with trans_a = false must multiply as
        // A^T: the dispatcher flips the flag instead of copying.
        let a_view = a.transpose(&[1, 0])?;
        ops::gemm(&stream, &c, false, false, 1.0, &a_view, &b, 0.0)?;
        stream.sync_with_host()?;
        assert_eq!(
            c.to_vec2::<f64>()?,
            vec![vec![26.0, 30.0], vec![38.0, 44.0]]
        );

        // Flag and view cancel out
        ops::gemm(&stream, &c, true, false, 1.0, &a_view, &b, 0.0)?;
        stream.sync_with_host()?;
        assert_eq!(
            c.to_vec2::<f64>()?,
            vec![vec![19.0, 22.0], vec![43.0, 50.0]]
        );
        Ok(())
    });
}

#[test]
fn test_gemm_alpha_beta() {
    with_cpu(|| {
        let a = to_tensor(&[[1.0f64, 0.0], [0.0, 1.0]], TensorOpts::new())?;
        let b = to_tensor(&[[2.0f64, 4.0], [6.0, 8.0]], TensorOpts::new())?;
        let c = to_tensor(&[[100.0f64, 100.0], [100.0, 100.0]], TensorOpts::new())?;
        let stream = current_stream()?;

        ops::gemm(&stream, &c, false, false, 0.5, &a, &b, 1.0)?;
        stream.sync_with_host()?;
        assert_eq!(
            c.to_vec2::<f64>()?,
            vec![vec![101.0, 102.0], vec![103.0, 104.0]]
        );

        ops::gemm(&stream, &c, false, false, 1.0, &a, &b, 0.5)?;
        stream.sync_with_host()?;
        assert_eq!(
            c.to_vec2::<f64>()?,
            vec![vec![52.5, 55.0], vec![57.5, 60.0]]
        );
        Ok(())
    });
}

#[test]
fn test_gemm_rejects_aliased_output() {
    with_cpu(|| {
        let b = to_tensor(&[[5.0f64, 6.0], [7.0, 8.0]], TensorOpts::new())?;
        let c = to_tensor(&[[1.0f64, 2.0], [3.0, 4.0]], TensorOpts::new())?;
        let stream = current_stream()?;
        let err = ops::gemm(&stream, &c, false, false, 1.0, &c, &b, 0.0).unwrap_err();
        assert!(matches!(err, Error::Alias { op: "gemm" }));
        Ok(())
    });
}

#[test]
fn test_gemm_shape_and_stride_rejection() {
    with_cpu(|| {
        let a = to_tensor(&[[1.0f64, 2.0, 3.0], [4.0, 5.0, 6.0]], TensorOpts::new())?;
        let b = to_tensor(&[[1.0f64, 2.0], [3.0, 4.0]], TensorOpts::new())?;
        let c = new_tensor(&[2, 2], TensorOpts::new())?;
        let stream = current_stream()?;

        // Inner dimensions disagree: 2x3 times 2x2
        let err = ops::gemm(&stream, &c, false, false, 1.0, &a, &b, 0.0).unwrap_err();
        assert!(matches!(err, Error::Shape { op: "gemm", .. }));

        // Unit element stride is mandatory
        let strided = to_tensor(
            &[1.0f64, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0],
            TensorOpts::new(),
        )?;
        let gappy = strided.reinterpret(Dims::with_strides(&[2, 2], &[4, 2], 0)?)?;
        let err = ops::gemm(&stream, &c, false, false, 1.0, &gappy, &b, 0.0).unwrap_err();
        assert!(matches!(err, Error::Shape { op: "gemm", .. }));

        // Integer matrices are out of domain
        let ai = to_tensor(&[[1i32, 2], [3, 4]], TensorOpts::new())?;
        let ci = new_tensor(&[2, 2], TensorOpts::new().dtype(DType::I32))?;
        let err = ops::gemm(&stream, &ci, false, false, 1.0, &ai, &ai, 0.0).unwrap_err();
        assert!(matches!(err, Error::Domain { .. }));
        Ok(())
    });
}

#[test]
fn test_broadcast_add_commensurate() {
    with_cpu(|| {
        let x = to_tensor(&[1.0f64, 2.0, 3.0, 4.0, 5.0, 6.0], TensorOpts::new())?;
        let y = to_tensor(&[10.0f64, 20.0, 30.0], TensorOpts::new())?;
        let dest = new_tensor(&[6], TensorOpts::new())?;
        let stream = current_stream()?;

        ops::binary(
            &stream,
            &dest,
            BinaryOp::Add,
            1.0,
            &Operand::Tensor(&x),
            1.0,
            &Operand::Tensor(&y),
        )?;
        stream.sync_with_host()?;
        // The intended relaxation: [3] divides [6], so y cycles
        assert_eq!(
            dest.to_vec1::<f64>()?,
            vec![11.0, 22.0, 33.0, 14.0, 25.0, 36.0]
        );
        Ok(())
    });
}

#[test]
fn test_broadcast_rejections() {
    with_cpu(|| {
        let x = to_tensor(&[1.0f64; 6], TensorOpts::new())?;
        let y = to_tensor(&[1.0f64; 4], TensorOpts::new())?;
        let dest = new_tensor(&[6], TensorOpts::new())?;
        let stream = current_stream()?;

        // 6 is not a multiple of 4
        let err = ops::binary(
            &stream,
            &dest,
            BinaryOp::Add,
            1.0,
            &Operand::Tensor(&x),
            1.0,
            &Operand::Tensor(&y),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Shape { .. }));

        // The destination must be the larger side
        let small = new_tensor(&[3], TensorOpts::new())?;
        let err = ops::binary(
            &stream,
            &small,
            BinaryOp::Add,
            1.0,
            &Operand::Tensor(&x),
            1.0,
            &Operand::Tensor(&x),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Shape { .. }));
        Ok(())
    });
}

#[test]
fn test_unary_ops_with_scale() {
    with_cpu(|| {
        let x = to_tensor(&[1.0f64, 4.0, 9.0, 16.0], TensorOpts::new())?;
        let dest = new_tensor(&[4], TensorOpts::new())?;
        let stream = current_stream()?;

        ops::unary(&stream, &dest, UnaryOp::Sqrt, 4.0, &Operand::Tensor(&x))?;
        stream.sync_with_host()?;
        assert_eq!(dest.to_vec1::<f64>()?, vec![2.0, 4.0, 6.0, 8.0]);

        ops::unary(&stream, &dest, UnaryOp::Logistic, 1.0, &Operand::Scalar(0.0))?;
        stream.sync_with_host()?;
        assert_eq!(dest.to_vec1::<f64>()?, vec![0.5; 4]);

        ops::unary(&stream, &dest, UnaryOp::Negate, 1.0, &Operand::Tensor(&x))?;
        stream.sync_with_host()?;
        assert_eq!(dest.to_vec1::<f64>()?, vec![-1.0, -4.0, -9.0, -16.0]);
        Ok(())
    });
}

#[test]
fn test_unary_in_place_allowed() {
    with_cpu(|| {
        let x = to_tensor(&[1.0f64, 2.0, 3.0], TensorOpts::new())?;
        let stream = current_stream()?;
        ops::unary(&stream, &x, UnaryOp::Exp, 1.0, &Operand::Tensor(&x))?;
        stream.sync_with_host()?;
        assert_allclose_f64(
            &x.to_vec1::<f64>()?,
            &[1f64.exp(), 2f64.exp(), 3f64.exp()],
            1e-12,
            0.0,
            "in-place exp",
        );
        Ok(())
    });
}

#[test]
fn test_partial_alias_rejected_elementwise() {
    with_cpu(|| {
        let t = to_tensor(&[1.0f64, 2.0, 3.0, 4.0], TensorOpts::new())?;
        let left = t.select(&[Selector::Range(0, 3)])?;
        let right = t.select(&[Selector::Range(1, 4)])?;
        let stream = current_stream()?;
        let err = ops::unary(&stream, &left, UnaryOp::Noop, 1.0, &Operand::Tensor(&right))
            .unwrap_err();
        assert!(matches!(err, Error::Alias { .. }));
        Ok(())
    });
}

#[test]
fn test_binary_comparisons_and_minmax() {
    with_cpu(|| {
        let x = to_tensor(&[1i32, 5, 3, 7], TensorOpts::new())?;
        let y = to_tensor(&[4i32, 2, 3, 9], TensorOpts::new())?;
        let dest = new_tensor(&[4], TensorOpts::new().dtype(DType::I32))?;
        let stream = current_stream()?;

        ops::binary(
            &stream,
            &dest,
            BinaryOp::Gt,
            1.0,
            &Operand::Tensor(&x),
            1.0,
            &Operand::Tensor(&y),
        )?;
        stream.sync_with_host()?;
        assert_eq!(dest.to_vec1::<i32>()?, vec![0, 1, 0, 0]);

        ops::binary(
            &stream,
            &dest,
            BinaryOp::Max,
            1.0,
            &Operand::Tensor(&x),
            1.0,
            &Operand::Tensor(&y),
        )?;
        stream.sync_with_host()?;
        assert_eq!(dest.to_vec1::<i32>()?, vec![4, 5, 3, 9]);
        Ok(())
    });
}

#[test]
fn test_bitwise_integer_only_unit_scale() {
    with_cpu(|| {
        let x = to_tensor(&[0b1100u32, 0b1111], TensorOpts::new())?;
        let y = to_tensor(&[0b1010u32, 0b0101], TensorOpts::new())?;
        let dest = new_tensor(&[2], TensorOpts::new().dtype(DType::U32))?;
        let stream = current_stream()?;

        ops::binary(
            &stream,
            &dest,
            BinaryOp::BitXor,
            1.0,
            &Operand::Tensor(&x),
            1.0,
            &Operand::Tensor(&y),
        )?;
        stream.sync_with_host()?;
        assert_eq!(dest.to_vec1::<u32>()?, vec![0b0110, 0b1010]);

        let f = to_tensor(&[1.0f64, 2.0], TensorOpts::new())?;
        let fd = new_tensor(&[2], TensorOpts::new())?;
        let err = ops::binary(
            &stream,
            &fd,
            BinaryOp::BitAnd,
            1.0,
            &Operand::Tensor(&f),
            1.0,
            &Operand::Tensor(&f),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Domain { .. }));

        let err = ops::binary(
            &stream,
            &dest,
            BinaryOp::BitAnd,
            2.0,
            &Operand::Tensor(&x),
            1.0,
            &Operand::Tensor(&y),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Domain { .. }));
        Ok(())
    });
}

#[test]
fn test_ternary_select_mixed_operands() {
    with_cpu(|| {
        let cond = to_tensor(&[3.0f64, -1.0, 0.0, -7.0], TensorOpts::new())?;
        let yes = to_tensor(&[1.0f64, 2.0, 3.0, 4.0], TensorOpts::new())?;
        let dest = new_tensor(&[4], TensorOpts::new())?;
        let stream = current_stream()?;

        ops::ternary_select(
            &stream,
            &dest,
            1.0,
            &Operand::Tensor(&cond),
            10.0,
            &Operand::Tensor(&yes),
            1.0,
            &Operand::Scalar(-99.0),
        )?;
        stream.sync_with_host()?;
        // cond >= 0 picks 10*yes, otherwise the scalar
        assert_eq!(dest.to_vec1::<f64>()?, vec![10.0, -99.0, 30.0, -99.0]);
        Ok(())
    });
}

#[test]
fn test_reduction_magnitude() {
    with_cpu(|| {
        let x = to_tensor(&[[3.0f64, 4.0], [0.0, 5.0]], TensorOpts::new())?;
        let dest = new_tensor(&[2], TensorOpts::new())?;
        let stream = current_stream()?;
        ops::reduce(&stream, &dest, ReduceOp::Magnitude, 1.0, &x)?;
        stream.sync_with_host()?;
        assert_eq!(dest.to_vec1::<f64>()?, vec![5.0, 5.0]);
        Ok(())
    });
}

#[test]
fn test_reduction_family() {
    with_cpu(|| {
        let x = to_tensor(&[[1.0f64, 2.0, 3.0], [4.0, 5.0, 6.0]], TensorOpts::new())?;
        let dest = new_tensor(&[2], TensorOpts::new())?;
        let stream = current_stream()?;

        ops::reduce(&stream, &dest, ReduceOp::Sum, 1.0, &x)?;
        stream.sync_with_host()?;
        assert_eq!(dest.to_vec1::<f64>()?, vec![6.0, 15.0]);

        ops::reduce(&stream, &dest, ReduceOp::Mean, 1.0, &x)?;
        stream.sync_with_host()?;
        assert_eq!(dest.to_vec1::<f64>()?, vec![2.0, 5.0]);

        ops::reduce(&stream, &dest, ReduceOp::Max, 2.0, &x)?;
        stream.sync_with_host()?;
        assert_eq!(dest.to_vec1::<f64>()?, vec![6.0, 12.0]);

        ops::reduce(&stream, &dest, ReduceOp::MagnitudeSquared, 1.0, &x)?;
        stream.sync_with_host()?;
        assert_eq!(dest.to_vec1::<f64>()?, vec![14.0, 77.0]);

        // A rank-1 input reduces into a one-element destination
        let v = to_tensor(&[3.0f64, 4.0], TensorOpts::new())?;
        let scalar = new_tensor(&[1], TensorOpts::new())?;
        ops::reduce(&stream, &scalar, ReduceOp::Magnitude, 1.0, &v)?;
        stream.sync_with_host()?;
        assert_eq!(scalar.to_vec1::<f64>()?, vec![5.0]);

        // Destination shape must drop exactly the last axis
        let bad = new_tensor(&[3], TensorOpts::new())?;
        let err = ops::reduce(&stream, &bad, ReduceOp::Sum, 1.0, &x).unwrap_err();
        assert!(matches!(err, Error::Shape { .. }));
        Ok(())
    });
}

#[test]
fn test_reduction_rejects_aliased_input() {
    with_cpu(|| {
        let x = to_tensor(&[[3.0f64, 4.0], [0.0, 5.0]], TensorOpts::new())?;
        let dest = Tensor::from_parts(x.buffer().sub_buffer(0, 2)?, Dims::new(&[2])?)?;
        let stream = current_stream()?;
        let err = ops::reduce(&stream, &dest, ReduceOp::Sum, 1.0, &x).unwrap_err();
        assert!(matches!(err, Error::Alias { .. }));
        Ok(())
    });
}

#[test]
fn test_fill_random_flat_and_gaussian() {
    with_cpu(|| {
        let dest = new_tensor(&[4096], TensorOpts::new().dtype(DType::F32))?;
        let stream = current_stream()?;

        ops::fill_random(&stream, &dest, Distribution::Flat { min: 2.0, max: 3.0 })?;
        stream.sync_with_host()?;
        let samples = dest.to_vec1::<f32>()?;
        assert!(samples.iter().all(|&v| (2.0..3.0).contains(&v)));

        ops::fill_random(
            &stream,
            &dest,
            Distribution::Gaussian {
                mean: 10.0,
                variance: 1.0,
            },
        )?;
        stream.sync_with_host()?;
        let samples = dest.to_vec1::<f32>()?;
        let mean = samples.iter().map(|&v| v as f64).sum::<f64>() / samples.len() as f64;
        assert!((mean - 10.0).abs() < 0.5, "sample mean {mean} far from 10");
        Ok(())
    });
}

#[test]
fn test_fill_random_domain_errors() {
    with_cpu(|| {
        let stream = current_stream()?;
        let f64_dest = new_tensor(&[8], TensorOpts::new())?;
        let err = ops::fill_random(
            &stream,
            &f64_dest,
            Distribution::Flat { min: 0.0, max: 1.0 },
        )
        .unwrap_err();
        assert!(matches!(err, Error::Domain { .. }));

        let dest = new_tensor(&[8], TensorOpts::new().dtype(DType::F32))?;
        let err = ops::fill_random(
            &stream,
            &dest,
            Distribution::Flat { min: 1.0, max: 1.0 },
        )
        .unwrap_err();
        assert!(matches!(err, Error::Domain { .. }));
        Ok(())
    });
}

#[test]
fn test_worker_side_failure_surfaces_on_sync() {
    with_cpu(|| {
        // A dedicated stream keeps the stowed error away from the shared
        // default queue
        let stream = current_device()?.create_stream()?;
        let dest = new_tensor(&[8], TensorOpts::new().dtype(DType::F32))?;
        // Bounds that are distinct as f64 but collapse to one f32 value
        // pass dispatch validation and fail inside the kernel
        ops::fill_random(
            &stream,
            &dest,
            Distribution::Flat {
                min: 1e30,
                max: 1e30 * (1.0 + 1e-9),
            },
        )?;
        let err = stream.sync_with_host().unwrap_err();
        assert!(matches!(err, Error::Device { .. }));
        // The error is surfaced once; the stream keeps working
        stream.sync_with_host()?;
        dest.fill(&stream, 1.0)?;
        stream.sync_with_host()?;
        assert_eq!(dest.to_vec1::<f32>()?, vec![1.0; 8]);
        Ok(())
    });
}

#[test]
fn test_dtype_mismatch_rejected() {
    with_cpu(|| {
        let x = to_tensor(&[1.0f32, 2.0], TensorOpts::new())?;
        let dest = new_tensor(&[2], TensorOpts::new())?;
        let stream = current_stream()?;
        let err =
            ops::unary(&stream, &dest, UnaryOp::Noop, 1.0, &Operand::Tensor(&x)).unwrap_err();
        assert!(matches!(err, Error::Domain { .. }));
        Ok(())
    });
}
