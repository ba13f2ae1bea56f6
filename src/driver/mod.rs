//! Backend capability contracts: driver, device, stream, buffer, event
//!
//! Backends are described by four object-safe capability traits rather than
//! an inheritance hierarchy. A driver enumerates devices and allocates host
//! staging memory; a device owns memory and spawns streams; a stream is a
//! serial execution queue; buffers are opaque handles whose aliasing is
//! decided through `Region` identity.
//!
//! Ordering model: operations enqueued on one stream happen before each
//! other in enqueue order. Across streams there is no ordering except
//! through [`sync_with_stream`] or [`Stream::sync_with_host`]. Host reads
//! of device memory not preceded by a host sync on the last writing stream
//! observe undefined contents.

pub mod registry;

use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::ops::MathBackend;
use std::sync::Arc;

/// Free and total device memory, in bytes
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MemoryInfo {
    /// Bytes currently allocatable
    pub free: usize,
    /// Total bytes on the device
    pub total: usize,
}

/// Intended lifetime of a host staging buffer
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HostUsage {
    /// Staging for a single transfer
    OneTime,
    /// Repeatedly reused staging area
    Reusable,
}

/// Identity of a buffer's backing range, in elements
///
/// Two buffers share backing storage iff their `base` values are equal;
/// `offset`/`len` then locate each view inside that allocation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Region {
    /// Opaque identity of the backing allocation
    pub base: u64,
    /// Element offset of this view inside the allocation
    pub offset: usize,
    /// Element count of this view
    pub len: usize,
}

/// A backend registry entry: enumerates devices, allocates host staging
pub trait Driver: Send + Sync {
    /// Registry name of this driver
    fn name(&self) -> &'static str;

    /// All devices this driver can reach
    fn devices(&self) -> Vec<Arc<dyn Device>>;

    /// Allocate a host staging buffer of `len` elements
    ///
    /// Host buffers are directly addressable (`host_ptr` is `Some`), so
    /// dimension index math can read and write them without device round
    /// trips.
    fn allocate_host_buffer(
        &self,
        len: usize,
        dtype: DType,
        usage: HostUsage,
    ) -> Result<Arc<dyn Buffer>>;
}

impl std::fmt::Debug for dyn Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver").field("name", &self.name()).finish()
    }
}

/// A unit that owns memory and may spawn streams
pub trait Device: Send + Sync {
    /// Name of the owning driver
    fn driver_name(&self) -> &'static str;

    /// Device ordinal within its driver
    fn id(&self) -> usize;

    /// Human-readable name
    fn name(&self) -> String {
        format!("{}:{}", self.driver_name(), self.id())
    }

    /// Free and total memory
    fn memory_info(&self) -> MemoryInfo;

    /// Whether `create_stream` is available beyond the default stream
    fn supports_create_stream(&self) -> bool;

    /// The device's always-present default stream
    fn default_stream(&self) -> Arc<dyn Stream>;

    /// Create a new independent stream
    fn create_stream(&self) -> Result<Arc<dyn Stream>>;

    /// Allocate a device buffer of `len` elements
    fn allocate_buffer(&self, len: usize, dtype: DType) -> Result<Arc<dyn Buffer>>;

    /// Whether this device can operate on the given device buffer
    fn accepts_buffer(&self, buffer: &dyn Buffer) -> bool;

    /// Whether this device can address the given host buffer directly,
    /// making a staging copy unnecessary
    fn accepts_host_buffer(&self, buffer: &dyn Buffer) -> bool;
}

/// Device identity across `Arc<dyn Device>` handles
pub fn same_device(a: &dyn Device, b: &dyn Device) -> bool {
    a.driver_name() == b.driver_name() && a.id() == b.id()
}

/// An opaque element-typed memory handle
pub trait Buffer: Send + Sync {
    /// Element type
    fn dtype(&self) -> DType;

    /// Element count
    fn len(&self) -> usize;

    /// True when the buffer holds no elements
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Name of the driver that created this buffer
    fn driver_name(&self) -> &'static str;

    /// Owning device, `None` for pure host staging buffers
    fn device(&self) -> Option<Arc<dyn Device>>;

    /// Host address of the first element when host-addressable
    fn host_ptr(&self) -> Option<u64>;

    /// Backing-range identity for the aliasing predicates
    fn region(&self) -> Region;

    /// A view of `[offset, offset + len)` sharing this backing storage
    ///
    /// No copy is performed; the sub-buffer keeps the parent's allocation
    /// alive. Releasing the parent's scope while a sub-buffer is in use is
    /// a usage error.
    fn sub_buffer(&self, offset: usize, len: usize) -> Result<Arc<dyn Buffer>>;
}

/// True iff both handles cover the identical backing range
pub fn aliases(a: &dyn Buffer, b: &dyn Buffer) -> bool {
    let (ra, rb) = (a.region(), b.region());
    ra.base == rb.base && ra.offset == rb.offset && ra.len == rb.len
}

/// True iff the backing ranges overlap at all
pub fn partially_aliases(a: &dyn Buffer, b: &dyn Buffer) -> bool {
    let (ra, rb) = (a.region(), b.region());
    ra.base == rb.base && ra.offset < rb.offset + rb.len && rb.offset < ra.offset + ra.len
}

/// An opaque marker inserted into a stream's queue
pub trait Event: Send + Sync {
    /// Whether everything enqueued before the event has completed
    fn is_complete(&self) -> bool;

    /// Block the calling thread until the event completes
    fn wait(&self);
}

/// A serial execution queue on a device
///
/// Every method returns after enqueueing; only `sync_with_host` blocks.
/// Offsets and lengths are in elements and validated against the buffer
/// bounds before anything is enqueued. Work that fails after enqueue
/// surfaces its device error from the next `sync_with_host` or
/// `record_event` on the same stream.
pub trait Stream: MathBackend + Send + Sync {
    /// Name of the owning driver
    fn driver_name(&self) -> &'static str;

    /// The device this stream executes on
    fn device(&self) -> Arc<dyn Device>;

    /// Enqueue a host-to-device element copy
    fn copy_host_to_device(
        &self,
        src: &Arc<dyn Buffer>,
        src_off: usize,
        dst: &Arc<dyn Buffer>,
        dst_off: usize,
        len: usize,
    ) -> Result<()>;

    /// Enqueue a device-to-host element copy
    fn copy_device_to_host(
        &self,
        src: &Arc<dyn Buffer>,
        src_off: usize,
        dst: &Arc<dyn Buffer>,
        dst_off: usize,
        len: usize,
    ) -> Result<()>;

    /// Enqueue a device-to-device element copy
    fn copy_device_to_device(
        &self,
        src: &Arc<dyn Buffer>,
        src_off: usize,
        dst: &Arc<dyn Buffer>,
        dst_off: usize,
        len: usize,
    ) -> Result<()>;

    /// Block the caller until the stream's queue drains
    fn sync_with_host(&self) -> Result<()>;

    /// Insert an event at the current tail of the queue
    fn record_event(&self) -> Result<Arc<dyn Event>>;

    /// Make this stream wait for an event recorded on a sibling stream
    fn wait_event(&self, event: &Arc<dyn Event>) -> Result<()>;
}

/// Make `dst` await everything currently enqueued on `src`
///
/// Both streams must belong to the same driver.
pub fn sync_with_stream(src: &Arc<dyn Stream>, dst: &Arc<dyn Stream>) -> Result<()> {
    if src.driver_name() != dst.driver_name() {
        return Err(Error::CrossDriver {
            src: src.driver_name().to_string(),
            dst: dst.driver_name().to_string(),
        });
    }
    let event = src.record_event()?;
    dst.wait_event(&event)
}
