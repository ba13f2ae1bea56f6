//! The Tensor type: construction, movement, and views

use super::data::TensorData;
use crate::context;
use crate::dims::{for_each_row, Dims, Selector};
use crate::driver::{
    registry, same_device, Buffer, Device, Driver, HostUsage, Stream,
};
use crate::dtype::{copy_convert, DType, Element};
use crate::error::{Error, Result};
use crate::ops::{self, Operand, UnaryOp};
use crate::scope;
use std::sync::Arc;

/// Options recognized by the tensor construction and movement operations
///
/// Unset fields fall back to the ambient context; explicit values always
/// win over it.
#[derive(Clone, Default)]
pub struct TensorOpts {
    /// Element type (default: context datatype)
    pub dtype: Option<DType>,
    /// Shape override for `to_tensor` (element count must match the data)
    pub shape: Option<Vec<usize>>,
    /// Target device (default: context device)
    pub device: Option<Arc<dyn Device>>,
    /// Stream carrying the work (default: context stream)
    pub stream: Option<Arc<dyn Stream>>,
    /// Broadcast-assigned initial value for `new_tensor`
    pub init_value: Option<f64>,
    /// Conversion-checking override (default: context setting)
    pub unchecked: Option<bool>,
    /// Whether to block until the transfer lands
    pub sync: Option<bool>,
    /// Allow cloning a non-access-increasing view by compacting it first
    pub force: bool,
}

impl TensorOpts {
    /// Empty options; everything resolves from the context
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the element type
    pub fn dtype(mut self, dtype: DType) -> Self {
        self.dtype = Some(dtype);
        self
    }

    /// Override the shape inferred from nested data
    pub fn shape(mut self, shape: &[usize]) -> Self {
        self.shape = Some(shape.to_vec());
        self
    }

    /// Set the target device
    pub fn device(mut self, device: Arc<dyn Device>) -> Self {
        self.device = Some(device);
        self
    }

    /// Set the stream
    pub fn stream(mut self, stream: Arc<dyn Stream>) -> Self {
        self.stream = Some(stream);
        self
    }

    /// Broadcast-assign a value after allocation
    pub fn init_value(mut self, value: f64) -> Self {
        self.init_value = Some(value);
        self
    }

    /// Override the conversion-checking mode
    pub fn unchecked(mut self, unchecked: bool) -> Self {
        self.unchecked = Some(unchecked);
        self
    }

    /// Control blocking behavior of the transfer
    pub fn sync(mut self, sync: bool) -> Self {
        self.sync = Some(sync);
        self
    }

    /// Permit compaction of transposed views during clones
    pub fn force(mut self) -> Self {
        self.force = true;
        self
    }
}

/// A dimension descriptor bound to a buffer it does not own
///
/// Views share the buffer through its reference count; the enclosing
/// resource scope controls when the storage itself is released.
#[derive(Clone)]
pub struct Tensor {
    dims: Dims,
    buffer: Arc<dyn Buffer>,
}

impl Tensor {
    /// Bind a descriptor to a buffer, checking that every addressed
    /// element is in bounds
    pub fn from_parts(buffer: Arc<dyn Buffer>, dims: Dims) -> Result<Self> {
        if dims.max_linear_index() >= buffer.len() {
            return Err(Error::Shape {
                op: "tensor",
                reason: format!(
                    "descriptor addresses element {} of a buffer with {} elements",
                    dims.max_linear_index(),
                    buffer.len()
                ),
            });
        }
        Ok(Self { dims, buffer })
    }

    /// The dimension descriptor
    #[inline]
    pub fn dims(&self) -> &Dims {
        &self.dims
    }

    /// The backing buffer handle
    #[inline]
    pub fn buffer(&self) -> &Arc<dyn Buffer> {
        &self.buffer
    }

    /// Element type
    #[inline]
    pub fn dtype(&self) -> DType {
        self.buffer.dtype()
    }

    /// Shape
    #[inline]
    pub fn shape(&self) -> &[usize] {
        self.dims.shape()
    }

    /// Number of axes
    #[inline]
    pub fn rank(&self) -> usize {
        self.dims.rank()
    }

    /// Total element count
    #[inline]
    pub fn elem_count(&self) -> usize {
        self.dims.elem_count()
    }

    /// Owning device, `None` when backed by a pure host buffer
    pub fn device(&self) -> Option<Arc<dyn Device>> {
        self.buffer.device()
    }

    /// Whether strides are natural row-major
    pub fn is_dense(&self) -> bool {
        self.dims.is_dense()
    }

    /// Dense, access-increasing, zero offset
    pub fn is_simple(&self) -> bool {
        self.dims.is_simple()
    }

    /// View with one selector per axis
    pub fn select(&self, selectors: &[Selector]) -> Result<Tensor> {
        Ok(Self {
            dims: self.dims.select(selectors)?,
            buffer: Arc::clone(&self.buffer),
        })
    }

    /// View with axes permuted
    pub fn transpose(&self, perm: &[usize]) -> Result<Tensor> {
        Ok(Self {
            dims: self.dims.transpose(perm)?,
            buffer: Arc::clone(&self.buffer),
        })
    }

    /// View with a new shape over the same elements
    pub fn reshape(&self, shape: &[usize]) -> Result<Tensor> {
        Ok(Self {
            dims: self.dims.reshape(shape)?,
            buffer: Arc::clone(&self.buffer),
        })
    }

    /// View under a caller-asserted descriptor; only bounds are checked
    pub fn reinterpret(&self, dims: Dims) -> Result<Tensor> {
        Self::from_parts(Arc::clone(&self.buffer), dims)
    }

    /// Flatten to one axis (requires a dense, access-increasing view)
    pub fn as_vector(&self) -> Result<Tensor> {
        self.reshape(&[self.elem_count()])
    }

    /// View as `[product_of_leading_axes, last_axis]`
    pub fn as_2d(&self) -> Result<Tensor> {
        Ok(Self {
            dims: self.dims.as_2d()?,
            buffer: Arc::clone(&self.buffer),
        })
    }

    /// View as `[first_axis, product_of_trailing_axes]`
    pub fn as_batch(&self) -> Result<Tensor> {
        Ok(Self {
            dims: self.dims.as_batch()?,
            buffer: Arc::clone(&self.buffer),
        })
    }

    /// Row views of a 2-D tensor
    pub fn rows(&self) -> Result<Vec<Tensor>> {
        self.require_2d("rows")?;
        (0..self.shape()[0])
            .map(|i| self.select(&[Selector::Index(i), Selector::All]))
            .collect()
    }

    /// Column views of a 2-D tensor
    pub fn columns(&self) -> Result<Vec<Tensor>> {
        self.require_2d("columns")?;
        (0..self.shape()[1])
            .map(|j| self.select(&[Selector::All, Selector::Index(j)]))
            .collect()
    }

    /// Broadcast-assign `value` to every element, on `stream`
    pub fn fill(&self, stream: &Arc<dyn Stream>, value: f64) -> Result<()> {
        ops::unary(stream, self, UnaryOp::Noop, 1.0, &Operand::Scalar(value))
    }

    /// Extract a rank-1 tensor as a vector
    ///
    /// The buffer must be host-addressable and the caller must have synced
    /// the last writing stream.
    pub fn to_vec1<T: Element>(&self) -> Result<Vec<T>> {
        self.require_rank(1, "to-vec1")?;
        self.read_all()
    }

    /// Extract a rank-2 tensor as nested vectors
    pub fn to_vec2<T: Element>(&self) -> Result<Vec<Vec<T>>> {
        self.require_rank(2, "to-vec2")?;
        let flat = self.read_all::<T>()?;
        let cols = self.shape()[1];
        Ok(flat.chunks(cols).map(<[T]>::to_vec).collect())
    }

    /// Extract a rank-3 tensor as doubly nested vectors
    pub fn to_vec3<T: Element>(&self) -> Result<Vec<Vec<Vec<T>>>> {
        self.require_rank(3, "to-vec3")?;
        let flat = self.read_all::<T>()?;
        let (d1, d2) = (self.shape()[1], self.shape()[2]);
        Ok(flat
            .chunks(d1 * d2)
            .map(|plane| plane.chunks(d2).map(<[T]>::to_vec).collect())
            .collect())
    }

    fn require_rank(&self, rank: usize, op: &'static str) -> Result<()> {
        if self.rank() != rank {
            return Err(Error::Shape {
                op,
                reason: format!("expected rank {rank}, got {:?}", self.shape()),
            });
        }
        Ok(())
    }

    fn require_2d(&self, op: &'static str) -> Result<()> {
        self.require_rank(2, op)
    }

    // Read every element in row-major order with boundary conversion
    fn read_all<T: Element>(&self) -> Result<Vec<T>> {
        let src_ptr = self.buffer.host_ptr().ok_or_else(|| {
            Error::device("buffer is not host addressable; clone_to_host first")
        })?;
        let unchecked = context::current_unchecked();
        let mut out = vec![T::zero(); self.elem_count()];
        let dst_ptr = out.as_mut_ptr() as u64;
        let dtype = self.dtype();
        let mut written = 0usize;
        for_each_row(&self.dims, |base, count, stride| {
            if stride == 1 {
                copy_convert(dtype, src_ptr, base, T::DTYPE, dst_ptr, written, count, unchecked)?;
                written += count;
            } else {
                for j in 0..count {
                    copy_convert(
                        dtype,
                        src_ptr,
                        base + j * stride,
                        T::DTYPE,
                        dst_ptr,
                        written,
                        1,
                        unchecked,
                    )?;
                    written += 1;
                }
            }
            Ok(())
        })?;
        Ok(out)
    }
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape())
            .field("dtype", &self.dtype())
            .field("dims", &self.dims)
            .finish()
    }
}

/// Allocate a device tensor of the given shape
///
/// Datatype, device, and stream default from the ambient context. With
/// `init_value` set, the value is broadcast-assigned after allocation.
pub fn new_tensor(shape: &[usize], opts: TensorOpts) -> Result<Tensor> {
    let dims = Dims::new(shape)?;
    let dtype = opts.dtype.unwrap_or_else(context::current_dtype);
    let device = resolve_device(&opts)?;
    let buffer = device.allocate_buffer(dims.elem_count(), dtype)?;
    scope::track_buffer(Arc::clone(&buffer));
    let tensor = Tensor::from_parts(buffer, dims)?;
    if let Some(value) = opts.init_value {
        let stream = resolve_stream(&opts, &device)?;
        tensor.fill(&stream, value)?;
    }
    Ok(tensor)
}

/// Copy nested host data into a tensor on the current device
///
/// Data is written into a host staging buffer with the conversion
/// semantics of the datatype registry, then transferred on the current
/// stream. Devices that can address host memory directly adopt the staging
/// buffer without a copy.
pub fn to_tensor<D: TensorData + ?Sized>(data: &D, opts: TensorOpts) -> Result<Tensor> {
    let device = resolve_device(&opts)?;
    let stream = resolve_stream(&opts, &device)?;
    let driver = registry::driver(device.driver_name())?;
    let dtype = opts.dtype.unwrap_or(D::Elem::DTYPE);
    let dims = ingest_dims(data, &opts)?;
    let staging = stage_data(data, &driver, dtype, &opts, dims.elem_count())?;

    let buffer = if device.accepts_host_buffer(staging.as_ref()) {
        staging
    } else {
        let device_buffer = device.allocate_buffer(dims.elem_count(), dtype)?;
        stream.copy_host_to_device(&staging, 0, &device_buffer, 0, dims.elem_count())?;
        if opts.sync.unwrap_or(false) {
            stream.sync_with_host()?;
        }
        device_buffer
    };
    scope::track_buffer(Arc::clone(&buffer));
    Tensor::from_parts(buffer, dims)
}

/// Copy nested host data into a host-resident tensor (no device transfer)
pub fn host_tensor<D: TensorData + ?Sized>(data: &D, opts: TensorOpts) -> Result<Tensor> {
    let driver = match &opts.device {
        Some(device) => registry::driver(device.driver_name())?,
        None => context::current_driver()?,
    };
    let dtype = opts.dtype.unwrap_or(D::Elem::DTYPE);
    let dims = ingest_dims(data, &opts)?;
    let staging = stage_data(data, &driver, dtype, &opts, dims.elem_count())?;
    scope::track_buffer(Arc::clone(&staging));
    Tensor::from_parts(staging, dims)
}

/// Copy a tensor onto a device, producing fresh dense storage
///
/// Requires an access-increasing view unless `force` is set, in which case
/// the view is compacted first.
pub fn clone_to_device(tensor: &Tensor, opts: TensorOpts) -> Result<Tensor> {
    require_cloneable(tensor, &opts, "clone-to-device")?;
    let device = resolve_device(&opts)?;
    let stream = resolve_stream(&opts, &device)?;
    let n = tensor.elem_count();
    let dtype = tensor.dtype();
    let dense = Dims::new(tensor.shape())?;

    // Same-device clone is a strided on-device copy
    if let Some(src_device) = tensor.device() {
        if same_device(src_device.as_ref(), device.as_ref()) {
            let out = new_tensor(
                tensor.shape(),
                TensorOpts::new().dtype(dtype).device(Arc::clone(&device)),
            )?;
            ops::unary(&stream, &out, UnaryOp::Noop, 1.0, &Operand::Tensor(tensor))?;
            if opts.sync.unwrap_or(false) {
                stream.sync_with_host()?;
            }
            return Ok(out);
        }
    }

    // Cross-device or host-sourced: bounce through dense host staging
    let driver = registry::driver(device.driver_name())?;
    let staging = stage_to_host(tensor, &driver)?;
    let buffer = if device.accepts_host_buffer(staging.as_ref()) {
        staging
    } else {
        let device_buffer = device.allocate_buffer(n, dtype)?;
        stream.copy_host_to_device(&staging, 0, &device_buffer, 0, n)?;
        if opts.sync.unwrap_or(false) {
            stream.sync_with_host()?;
        }
        device_buffer
    };
    scope::track_buffer(Arc::clone(&buffer));
    Tensor::from_parts(buffer, dense)
}

/// Copy a tensor into host-resident dense storage
///
/// Blocks until the copy lands unless `sync` is explicitly disabled.
pub fn clone_to_host(tensor: &Tensor, opts: TensorOpts) -> Result<Tensor> {
    require_cloneable(tensor, &opts, "clone-to-host")?;
    let driver = registry::driver(tensor.buffer().driver_name())?;
    let n = tensor.elem_count();
    let dtype = tensor.dtype();
    let host = driver.allocate_host_buffer(n, dtype, HostUsage::Reusable)?;

    match tensor.device() {
        Some(device) => {
            let stream = match &opts.stream {
                Some(stream) => Arc::clone(stream),
                None => device.default_stream(),
            };
            let source = if tensor.is_dense() {
                tensor.clone()
            } else {
                // Compact transposed or gappy views on the device first
                let tmp = new_tensor(
                    tensor.shape(),
                    TensorOpts::new().dtype(dtype).device(Arc::clone(&device)),
                )?;
                ops::unary(&stream, &tmp, UnaryOp::Noop, 1.0, &Operand::Tensor(tensor))?;
                tmp
            };
            stream.copy_device_to_host(source.buffer(), source.dims().offset(), &host, 0, n)?;
            if opts.sync.unwrap_or(true) {
                stream.sync_with_host()?;
            }
        }
        None => {
            // Adopted staging buffers can still have queued stream writes
            if opts.sync.unwrap_or(true) {
                let stream = opts
                    .stream
                    .clone()
                    .or_else(|| context::current_stream().ok());
                if let Some(stream) = stream {
                    stream.sync_with_host()?;
                }
            }
            gather_host(tensor, &host)?;
        }
    }
    scope::track_buffer(Arc::clone(&host));
    Tensor::from_parts(host, Dims::new(tensor.shape())?)
}

fn require_cloneable(tensor: &Tensor, opts: &TensorOpts, op: &'static str) -> Result<()> {
    if !tensor.dims().is_access_increasing() && !opts.force {
        return Err(Error::Shape {
            op,
            reason: format!(
                "view {:?} has transposed axes; set force to compact it",
                tensor.dims()
            ),
        });
    }
    Ok(())
}

fn resolve_device(opts: &TensorOpts) -> Result<Arc<dyn Device>> {
    if let Some(device) = &opts.device {
        return Ok(Arc::clone(device));
    }
    if let Some(stream) = &opts.stream {
        return Ok(stream.device());
    }
    context::current_device()
}

fn resolve_stream(opts: &TensorOpts, device: &Arc<dyn Device>) -> Result<Arc<dyn Stream>> {
    if let Some(stream) = &opts.stream {
        if !same_device(stream.device().as_ref(), device.as_ref()) {
            return Err(Error::device(format!(
                "stream on {} cannot serve device {}",
                stream.device().name(),
                device.name()
            )));
        }
        return Ok(Arc::clone(stream));
    }
    if opts.device.is_some() {
        return Ok(device.default_stream());
    }
    context::current_stream()
}

fn ingest_dims<D: TensorData + ?Sized>(data: &D, opts: &TensorOpts) -> Result<Dims> {
    let natural = data.shape()?;
    let dims = match &opts.shape {
        Some(shape) => Dims::new(shape)?,
        None => Dims::new(&natural)?,
    };
    let natural_count: usize = natural.iter().product();
    if dims.elem_count() != natural_count {
        return Err(Error::Shape {
            op: "to-tensor",
            reason: format!(
                "shape override {:?} does not cover {} data elements",
                dims.shape(),
                natural_count
            ),
        });
    }
    Ok(dims)
}

// Write nested data into a fresh host staging buffer, converting per the
// datatype registry.
fn stage_data<D: TensorData + ?Sized>(
    data: &D,
    driver: &Arc<dyn Driver>,
    dtype: DType,
    opts: &TensorOpts,
    count: usize,
) -> Result<Arc<dyn Buffer>> {
    let unchecked = opts.unchecked.unwrap_or_else(context::current_unchecked);
    let staging = driver.allocate_host_buffer(count, dtype, HostUsage::OneTime)?;
    let dst_ptr = staging
        .host_ptr()
        .ok_or_else(|| Error::device("driver returned a non-addressable host buffer"))?;
    let mut written = 0usize;
    data.visit(&mut |run: &[D::Elem]| {
        copy_convert(
            D::Elem::DTYPE,
            run.as_ptr() as u64,
            0,
            dtype,
            dst_ptr,
            written,
            run.len(),
            unchecked,
        )?;
        written += run.len();
        Ok(())
    })?;
    Ok(staging)
}

// Gather a host-addressable tensor into dense host staging on `driver`.
fn stage_to_host(tensor: &Tensor, driver: &Arc<dyn Driver>) -> Result<Arc<dyn Buffer>> {
    let n = tensor.elem_count();
    let dtype = tensor.dtype();
    let staging = driver.allocate_host_buffer(n, dtype, HostUsage::OneTime)?;
    if tensor.buffer().host_ptr().is_some() {
        gather_host(tensor, &staging)?;
        return Ok(staging);
    }
    // Opaque device memory: drain a dense copy through the source's
    // default stream
    let device = tensor
        .device()
        .ok_or_else(|| Error::device("buffer has neither host access nor a device"))?;
    let stream = device.default_stream();
    let source = if tensor.is_dense() {
        tensor.clone()
    } else {
        let tmp = new_tensor(
            tensor.shape(),
            TensorOpts::new().dtype(dtype).device(Arc::clone(&device)),
        )?;
        ops::unary(&stream, &tmp, UnaryOp::Noop, 1.0, &Operand::Tensor(tensor))?;
        tmp
    };
    stream.copy_device_to_host(source.buffer(), source.dims().offset(), &staging, 0, n)?;
    stream.sync_with_host()?;
    Ok(staging)
}

// Strided host-side gather into a dense host buffer.
fn gather_host(tensor: &Tensor, dst: &Arc<dyn Buffer>) -> Result<()> {
    let src_ptr = tensor
        .buffer()
        .host_ptr()
        .ok_or_else(|| Error::device("source buffer is not host addressable"))?;
    let dst_ptr = dst
        .host_ptr()
        .ok_or_else(|| Error::device("staging buffer is not host addressable"))?;
    let dtype = tensor.dtype();
    let mut written = 0usize;
    for_each_row(tensor.dims(), |base, count, stride| {
        if stride == 1 {
            copy_convert(dtype, src_ptr, base, dtype, dst_ptr, written, count, true)?;
            written += count;
        } else {
            for j in 0..count {
                copy_convert(dtype, src_ptr, base + j * stride, dtype, dst_ptr, written, 1, true)?;
                written += 1;
            }
        }
        Ok(())
    })
}
