//! CPU buffers: aligned host allocations behind the Buffer contract

use super::device::CpuDevice;
use crate::driver::{Buffer, Device, HostUsage, Region};
use crate::dtype::DType;
use crate::error::{Error, Result};
use std::alloc::{alloc_zeroed, dealloc, Layout as AllocLayout};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Alignment of every backing allocation, wide enough for any SIMD lane
const ALLOC_ALIGN: usize = 64;

// One owned, zero-initialized allocation. Sub-buffers share it through the
// Arc; the memory outlives every view by construction.
pub(crate) struct HostAlloc {
    ptr: u64,
    bytes: usize,
    accounted: Option<Arc<AtomicUsize>>,
}

// The allocation is plain bytes accessed through raw pointers; views
// coordinate through stream ordering, not through &mut.
unsafe impl Send for HostAlloc {}
unsafe impl Sync for HostAlloc {}

impl HostAlloc {
    fn new(bytes: usize, accounted: Option<Arc<AtomicUsize>>) -> Result<Self> {
        if bytes == 0 {
            return Err(Error::device("zero-length allocation"));
        }
        let layout = AllocLayout::from_size_align(bytes, ALLOC_ALIGN)
            .map_err(|e| Error::device(format!("invalid allocation layout: {e}")))?;
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(Error::device(format!("failed to allocate {bytes} bytes")));
        }
        if let Some(counter) = &accounted {
            counter.fetch_add(bytes, Ordering::Relaxed);
        }
        Ok(Self {
            ptr: ptr as u64,
            bytes,
            accounted,
        })
    }
}

impl Drop for HostAlloc {
    fn drop(&mut self) {
        let layout = AllocLayout::from_size_align(self.bytes, ALLOC_ALIGN)
            .expect("allocation layout was valid at construction");
        unsafe {
            dealloc(self.ptr as *mut u8, layout);
        }
        if let Some(counter) = &self.accounted {
            counter.fetch_sub(self.bytes, Ordering::Relaxed);
        }
    }
}

/// A CPU-backed buffer; device and host buffers share this representation
///
/// Every CPU buffer is host-addressable, which is what lets the CPU device
/// accept host staging buffers directly and skip upload copies.
pub struct CpuBuffer {
    alloc: Arc<HostAlloc>,
    offset: usize,
    len: usize,
    dtype: DType,
    device: Option<Arc<CpuDevice>>,
    usage: Option<HostUsage>,
}

impl CpuBuffer {
    pub(crate) fn device_backed(
        len: usize,
        dtype: DType,
        device: Arc<CpuDevice>,
    ) -> Result<Self> {
        let alloc = HostAlloc::new(len * dtype.size_in_bytes(), Some(device.allocated_counter()))?;
        Ok(Self {
            alloc: Arc::new(alloc),
            offset: 0,
            len,
            dtype,
            device: Some(device),
            usage: None,
        })
    }

    pub(crate) fn host_backed(len: usize, dtype: DType, usage: HostUsage) -> Result<Self> {
        let alloc = HostAlloc::new(len * dtype.size_in_bytes(), None)?;
        Ok(Self {
            alloc: Arc::new(alloc),
            offset: 0,
            len,
            dtype,
            device: None,
            usage: Some(usage),
        })
    }

    /// Usage hint this host buffer was allocated with
    pub fn usage(&self) -> Option<HostUsage> {
        self.usage
    }
}

impl Buffer for CpuBuffer {
    fn dtype(&self) -> DType {
        self.dtype
    }

    fn len(&self) -> usize {
        self.len
    }

    fn driver_name(&self) -> &'static str {
        "cpu"
    }

    fn device(&self) -> Option<Arc<dyn Device>> {
        self.device
            .as_ref()
            .map(|d| Arc::clone(d) as Arc<dyn Device>)
    }

    fn host_ptr(&self) -> Option<u64> {
        Some(self.alloc.ptr + (self.offset * self.dtype.size_in_bytes()) as u64)
    }

    fn region(&self) -> Region {
        Region {
            base: self.alloc.ptr,
            offset: self.offset,
            len: self.len,
        }
    }

    fn sub_buffer(&self, offset: usize, len: usize) -> Result<Arc<dyn Buffer>> {
        if len == 0 || offset + len > self.len {
            return Err(Error::Shape {
                op: "sub-buffer",
                reason: format!(
                    "range {offset}..{} exceeds buffer of {} elements",
                    offset + len,
                    self.len
                ),
            });
        }
        Ok(Arc::new(Self {
            alloc: Arc::clone(&self.alloc),
            offset: self.offset + offset,
            len,
            dtype: self.dtype,
            device: self.device.clone(),
            usage: self.usage,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{aliases, partially_aliases};

    fn host(len: usize) -> CpuBuffer {
        CpuBuffer::host_backed(len, DType::F32, HostUsage::OneTime).unwrap()
    }

    #[test]
    fn test_host_buffer_addressable() {
        let buffer = host(8);
        let ptr = buffer.host_ptr().unwrap();
        assert_ne!(ptr, 0);
        assert_eq!(ptr % ALLOC_ALIGN as u64, 0);
        assert_eq!(buffer.len(), 8);
        assert!(buffer.device().is_none());
    }

    #[test]
    fn test_sub_buffer_shares_backing() {
        let buffer: Arc<dyn Buffer> = Arc::new(host(8));
        let sub = buffer.sub_buffer(2, 4).unwrap();
        assert_eq!(sub.len(), 4);
        assert_eq!(sub.region().base, buffer.region().base);
        assert_eq!(sub.region().offset, 2);
        assert_eq!(
            sub.host_ptr().unwrap(),
            buffer.host_ptr().unwrap() + 2 * DType::F32.size_in_bytes() as u64
        );
        assert!(buffer.sub_buffer(6, 4).is_err());
        assert!(buffer.sub_buffer(0, 0).is_err());
    }

    #[test]
    fn test_alias_predicates() {
        let buffer: Arc<dyn Buffer> = Arc::new(host(8));
        let left = buffer.sub_buffer(0, 5).unwrap();
        let right = buffer.sub_buffer(4, 4).unwrap();
        let same = buffer.sub_buffer(0, 5).unwrap();
        let other: Arc<dyn Buffer> = Arc::new(host(8));

        assert!(aliases(left.as_ref(), same.as_ref()));
        assert!(!aliases(left.as_ref(), right.as_ref()));
        assert!(partially_aliases(left.as_ref(), right.as_ref()));
        assert!(partially_aliases(buffer.as_ref(), right.as_ref()));
        assert!(!partially_aliases(left.as_ref(), other.as_ref()));

        let disjoint = buffer.sub_buffer(5, 3).unwrap();
        assert!(!partially_aliases(left.as_ref(), disjoint.as_ref()));
    }
}
