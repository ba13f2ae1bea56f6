//! Reference CPU backend
//!
//! A minimal in-process backend satisfying every driver capability using
//! 64-byte-aligned native allocations. Device buffers are host-addressable,
//! so `accepts_host_buffer` holds and staging copies are skipped. Streams
//! are worker threads draining a FIFO task queue; events are condvar-backed
//! completion flags. Gemm delegates to faer; everything else runs generic
//! elementwise kernels.

mod buffer;
mod device;
mod driver;
mod gemm;
mod kernels;
mod stream;

pub use buffer::CpuBuffer;
pub use device::CpuDevice;
pub use driver::CpuDriver;
pub use stream::{CpuEvent, CpuStream};
