//! # tensr
//!
//! **Portable compute abstraction for numerical workloads.**
//!
//! tensr lets numerical code be written once against an opaque device and
//! run on heterogeneous backends. Two subsystems carry the design:
//!
//! - **Driver/Device/Stream/Buffer contracts**: object-safe capability
//!   traits defining how memory is allocated on host staging areas and on
//!   devices, how streams serialize work, and how cross-stream ordering is
//!   established through events.
//! - **The tensor view layer**: a shape/strides/offset descriptor bound to
//!   an opaque buffer, with aliasing-preserving view math (select,
//!   transpose, reshape, sub-buffering) and a typed dispatch layer routing
//!   elementwise, reduction, and matrix-multiply operations to per-stream
//!   backend tables.
//!
//! A reference CPU backend satisfies every contract in-process, using
//! native aligned buffers, worker-thread streams, and faer for gemm.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use tensr::prelude::*;
//!
//! with_scope(|| {
//!     with_context(Context::for_driver("cpu")?, || {
//!         let a = to_tensor(&[[1.0f64, 2.0], [3.0, 4.0]], TensorOpts::new())?;
//!         let b = to_tensor(&[[5.0f64, 6.0], [7.0, 8.0]], TensorOpts::new())?;
//!         let c = new_tensor(&[2, 2], TensorOpts::new())?;
//!         let stream = current_stream()?;
//!         ops::gemm(&stream, &c, false, false, 1.0, &a, &b, 0.0)?;
//!         stream.sync_with_host()?;
//!         println!("{:?}", c.to_vec2::<f64>()?);
//!         Ok(())
//!     })
//! })?;
//! ```
//!
//! ## Broadcasting
//!
//! Elementwise operations broadcast *commensurate* shapes: along each
//! axis the larger count must be an exact multiple of the smaller, and the
//! smaller operand repeats through modular indexing. This deliberately
//! relaxes NumPy's length-1-only rule; `[6]` against `[3]` is legal here.
//!
//! ## Ordering
//!
//! Work on one stream runs in enqueue order. Across streams nothing is
//! ordered until [`driver::sync_with_stream`] inserts an event, and host
//! reads of device memory require [`driver::Stream::sync_with_host`] on
//! the last writing stream.
//!
//! ## Feature flags
//!
//! - `rayon` (default): data-parallel dense elementwise kernels

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod context;
pub mod dims;
pub mod driver;
pub mod dtype;
pub mod error;
pub mod ops;
pub mod scope;
pub mod tensor;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::context::{
        current_device, current_driver, current_dtype, current_stream, with_context, Context,
    };
    pub use crate::dims::{commensurate, compose_selectors, Dims, Selector};
    pub use crate::driver::{
        registry::driver, sync_with_stream, Buffer, Device, Driver, Event, Stream,
    };
    pub use crate::dtype::{DType, Element};
    pub use crate::error::{Error, Result};
    pub use crate::ops::{self, BinaryOp, Distribution, Operand, ReduceOp, UnaryOp};
    pub use crate::scope::{with_scope, ScopeToken};
    pub use crate::tensor::{
        clone_to_device, clone_to_host, host_tensor, new_tensor, to_tensor, Tensor, TensorOpts,
    };

    pub use crate::backend::cpu::{CpuDevice, CpuDriver, CpuStream};
}
