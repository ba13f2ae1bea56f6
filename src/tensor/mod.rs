//! Tensors: dimension descriptors bound to opaque device buffers
//!
//! A tensor pairs a [`crate::dims::Dims`] descriptor with a reference to a
//! buffer it does not own. Views (select, transpose, reshape, sub-range)
//! are new descriptors over the same buffer; the enclosing resource scope
//! owns the storage.

mod core;
mod data;

pub use core::{
    clone_to_device, clone_to_host, host_tensor, new_tensor, to_tensor, Tensor, TensorOpts,
};
pub use data::TensorData;
