//! The host CPU as a compute device

use super::buffer::CpuBuffer;
use super::stream::CpuStream;
use crate::driver::{Buffer, Device, MemoryInfo, Stream};
use crate::dtype::DType;
use crate::error::Result;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

/// The host CPU device
///
/// There is one per driver. Streams are real worker threads, so the device
/// supports as many independent queues as the caller wants.
pub struct CpuDevice {
    id: usize,
    me: Weak<CpuDevice>,
    default_stream: OnceLock<Arc<CpuStream>>,
    allocated: Arc<AtomicUsize>,
}

impl CpuDevice {
    pub(crate) fn create(id: usize) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            id,
            me: me.clone(),
            default_stream: OnceLock::new(),
            allocated: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub(crate) fn allocated_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.allocated)
    }

    fn arc(&self) -> Arc<CpuDevice> {
        self.me.upgrade().expect("device outlives its handles")
    }
}

impl Device for CpuDevice {
    fn driver_name(&self) -> &'static str {
        "cpu"
    }

    fn id(&self) -> usize {
        self.id
    }

    fn memory_info(&self) -> MemoryInfo {
        // The host heap has no fixed capacity; report what is in use
        // against the address-space ceiling.
        let used = self.allocated.load(Ordering::Relaxed);
        MemoryInfo {
            free: usize::MAX - used,
            total: usize::MAX,
        }
    }

    fn supports_create_stream(&self) -> bool {
        true
    }

    fn default_stream(&self) -> Arc<dyn Stream> {
        let stream = self
            .default_stream
            .get_or_init(|| CpuStream::spawn(self.arc()));
        Arc::clone(stream) as Arc<dyn Stream>
    }

    fn create_stream(&self) -> Result<Arc<dyn Stream>> {
        Ok(CpuStream::spawn(self.arc()) as Arc<dyn Stream>)
    }

    fn allocate_buffer(&self, len: usize, dtype: DType) -> Result<Arc<dyn Buffer>> {
        log::trace!("cpu:{} allocating {len} x {dtype}", self.id);
        Ok(Arc::new(CpuBuffer::device_backed(len, dtype, self.arc())?))
    }

    fn accepts_buffer(&self, buffer: &dyn Buffer) -> bool {
        buffer.driver_name() == "cpu"
    }

    fn accepts_host_buffer(&self, buffer: &dyn Buffer) -> bool {
        buffer.driver_name() == "cpu" && buffer.host_ptr().is_some()
    }
}
