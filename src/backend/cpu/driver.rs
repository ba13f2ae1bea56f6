//! The CPU driver: device enumeration and host staging allocation

use super::buffer::CpuBuffer;
use super::device::CpuDevice;
use crate::driver::{Buffer, Device, Driver, HostUsage};
use crate::dtype::DType;
use crate::error::Result;
use std::sync::Arc;

/// Driver for the in-process CPU backend
pub struct CpuDriver {
    devices: Vec<Arc<CpuDevice>>,
}

impl CpuDriver {
    /// Create the driver with its single host device
    pub fn new() -> Self {
        Self {
            devices: vec![CpuDevice::create(0)],
        }
    }
}

impl Default for CpuDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for CpuDriver {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn devices(&self) -> Vec<Arc<dyn Device>> {
        self.devices
            .iter()
            .map(|d| Arc::clone(d) as Arc<dyn Device>)
            .collect()
    }

    fn allocate_host_buffer(
        &self,
        len: usize,
        dtype: DType,
        usage: HostUsage,
    ) -> Result<Arc<dyn Buffer>> {
        log::trace!("cpu allocating host staging {len} x {dtype} ({usage:?})");
        Ok(Arc::new(CpuBuffer::host_backed(len, dtype, usage)?))
    }
}
