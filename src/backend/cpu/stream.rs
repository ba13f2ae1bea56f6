//! CPU streams: worker-thread FIFO queues with condvar events

use super::device::CpuDevice;
use super::{gemm, kernels};
use crate::driver::{Buffer, Device, Event, Stream};
use crate::error::{Error, Result};
use crate::ops::{
    BinaryOp, Distribution, GemmArgs, MathBackend, OperandView, ReduceOp, UnaryOp,
};
use parking_lot::{Condvar, Mutex};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread;

type Task = Box<dyn FnOnce() + Send>;

/// A serial execution queue backed by one worker thread
///
/// Enqueued tasks capture raw pointers plus `Arc` clones of every buffer
/// they touch, so backing storage cannot be released while work that uses
/// it is still queued. A kernel failure discovered on the worker is stowed
/// and surfaced by the next `sync_with_host` or `record_event`; it is
/// never swallowed.
pub struct CpuStream {
    device: Arc<CpuDevice>,
    sender: Mutex<Sender<Task>>,
    last_error: Arc<Mutex<Option<Error>>>,
}

impl CpuStream {
    pub(crate) fn spawn(device: Arc<CpuDevice>) -> Arc<Self> {
        let (sender, receiver) = mpsc::channel::<Task>();
        thread::Builder::new()
            .name("tensr-cpu-stream".to_string())
            .spawn(move || {
                while let Ok(task) = receiver.recv() {
                    task();
                }
            })
            .expect("failed to spawn stream worker");
        log::debug!("created cpu stream on device {}", device.id());
        Arc::new(Self {
            device,
            sender: Mutex::new(sender),
            last_error: Arc::new(Mutex::new(None)),
        })
    }

    fn enqueue(&self, task: impl FnOnce() + Send + 'static) -> Result<()> {
        self.sender
            .lock()
            .send(Box::new(task))
            .map_err(|_| Error::device("stream worker terminated"))
    }

    // Enqueue a fallible kernel; a failure is stowed for the next
    // synchronization point. The first pending error wins.
    fn enqueue_kernel(&self, task: impl FnOnce() -> Result<()> + Send + 'static) -> Result<()> {
        let slot = Arc::clone(&self.last_error);
        self.enqueue(move || {
            if let Err(e) = task() {
                log::error!("kernel failed on stream worker: {e}");
                let mut pending = slot.lock();
                if pending.is_none() {
                    *pending = Some(e);
                }
            }
        })
    }

    fn take_error(&self) -> Result<()> {
        match self.last_error.lock().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // Validate a copy and resolve both endpoints to absolute host pointers.
    fn copy_endpoints(
        src: &Arc<dyn Buffer>,
        src_off: usize,
        dst: &Arc<dyn Buffer>,
        dst_off: usize,
        len: usize,
        op: &'static str,
    ) -> Result<(u64, u64, usize)> {
        if src.dtype() != dst.dtype() {
            return Err(Error::Domain {
                dtype: dst.dtype(),
                reason: format!("'{op}' between {} and {} buffers", src.dtype(), dst.dtype()),
            });
        }
        if src_off + len > src.len() || dst_off + len > dst.len() {
            return Err(Error::Shape {
                op,
                reason: format!(
                    "copy of {len} elements at {src_off}/{dst_off} exceeds buffers of {}/{}",
                    src.len(),
                    dst.len()
                ),
            });
        }
        let elem = src.dtype().size_in_bytes();
        let src_ptr = host_ptr(src)? + (src_off * elem) as u64;
        let dst_ptr = host_ptr(dst)? + (dst_off * elem) as u64;
        Ok((src_ptr, dst_ptr, len * elem))
    }

    fn enqueue_copy(
        &self,
        src: &Arc<dyn Buffer>,
        src_off: usize,
        dst: &Arc<dyn Buffer>,
        dst_off: usize,
        len: usize,
        op: &'static str,
    ) -> Result<()> {
        let (src_ptr, dst_ptr, bytes) = Self::copy_endpoints(src, src_off, dst, dst_off, len, op)?;
        let keep = (Arc::clone(src), Arc::clone(dst));
        self.enqueue(move || {
            let _keep = keep;
            // memmove semantics: sub-buffer copies may overlap
            unsafe {
                std::ptr::copy(src_ptr as *const u8, dst_ptr as *mut u8, bytes);
            }
        })
    }
}

fn host_ptr(buffer: &Arc<dyn Buffer>) -> Result<u64> {
    buffer
        .host_ptr()
        .ok_or_else(|| Error::device("cpu stream requires host-addressable buffers"))
}

fn kernel_view(view: &OperandView) -> Result<(kernels::KView, Arc<dyn Buffer>)> {
    Ok((
        kernels::KView {
            ptr: host_ptr(&view.buffer)?,
            dims: view.dims.clone(),
            scale: view.scale,
        },
        Arc::clone(&view.buffer),
    ))
}

impl Stream for CpuStream {
    fn driver_name(&self) -> &'static str {
        "cpu"
    }

    fn device(&self) -> Arc<dyn Device> {
        Arc::clone(&self.device) as Arc<dyn Device>
    }

    fn copy_host_to_device(
        &self,
        src: &Arc<dyn Buffer>,
        src_off: usize,
        dst: &Arc<dyn Buffer>,
        dst_off: usize,
        len: usize,
    ) -> Result<()> {
        self.enqueue_copy(src, src_off, dst, dst_off, len, "copy-host-to-device")
    }

    fn copy_device_to_host(
        &self,
        src: &Arc<dyn Buffer>,
        src_off: usize,
        dst: &Arc<dyn Buffer>,
        dst_off: usize,
        len: usize,
    ) -> Result<()> {
        self.enqueue_copy(src, src_off, dst, dst_off, len, "copy-device-to-host")
    }

    fn copy_device_to_device(
        &self,
        src: &Arc<dyn Buffer>,
        src_off: usize,
        dst: &Arc<dyn Buffer>,
        dst_off: usize,
        len: usize,
    ) -> Result<()> {
        self.enqueue_copy(src, src_off, dst, dst_off, len, "copy-device-to-device")
    }

    fn sync_with_host(&self) -> Result<()> {
        let event = CpuEvent::new();
        let marker = Arc::clone(&event);
        self.enqueue(move || marker.signal())?;
        event.wait();
        // The queue is drained; surface anything the worker stowed
        self.take_error()
    }

    fn record_event(&self) -> Result<Arc<dyn Event>> {
        self.take_error()?;
        let event = CpuEvent::new();
        let marker = Arc::clone(&event);
        self.enqueue(move || marker.signal())?;
        Ok(event as Arc<dyn Event>)
    }

    fn wait_event(&self, event: &Arc<dyn Event>) -> Result<()> {
        let event = Arc::clone(event);
        self.enqueue(move || event.wait())
    }
}

impl MathBackend for CpuStream {
    fn launch_unary(&self, dest: &OperandView, op: UnaryOp, x: &OperandView) -> Result<()> {
        let (dest, keep_d) = kernel_view(dest)?;
        let (x, keep_x) = kernel_view(x)?;
        let dtype = keep_d.dtype();
        self.enqueue_kernel(move || {
            let _keep = (&keep_d, &keep_x);
            kernels::unary(dtype, &dest, op, &x)
        })
    }

    fn launch_binary(
        &self,
        dest: &OperandView,
        op: BinaryOp,
        x: &OperandView,
        y: &OperandView,
    ) -> Result<()> {
        let (dest, keep_d) = kernel_view(dest)?;
        let (x, keep_x) = kernel_view(x)?;
        let (y, keep_y) = kernel_view(y)?;
        let dtype = keep_d.dtype();
        self.enqueue_kernel(move || {
            let _keep = (&keep_d, &keep_x, &keep_y);
            kernels::binary(dtype, &dest, op, &x, &y)
        })
    }

    fn launch_ternary_select(
        &self,
        dest: &OperandView,
        x: &OperandView,
        y: &OperandView,
        z: &OperandView,
    ) -> Result<()> {
        let (dest, keep_d) = kernel_view(dest)?;
        let (x, keep_x) = kernel_view(x)?;
        let (y, keep_y) = kernel_view(y)?;
        let (z, keep_z) = kernel_view(z)?;
        let dtype = keep_d.dtype();
        self.enqueue_kernel(move || {
            let _keep = (&keep_d, &keep_x, &keep_y, &keep_z);
            kernels::ternary_select(dtype, &dest, &x, &y, &z)
        })
    }

    fn launch_reduce(&self, dest: &OperandView, op: ReduceOp, x: &OperandView) -> Result<()> {
        let (dest, keep_d) = kernel_view(dest)?;
        let (x, keep_x) = kernel_view(x)?;
        let dtype = keep_d.dtype();
        self.enqueue_kernel(move || {
            let _keep = (&keep_d, &keep_x);
            kernels::reduce(dtype, &dest, op, &x)
        })
    }

    fn launch_gemm(&self, args: GemmArgs) -> Result<()> {
        // Resolve endpoints eagerly so misuse fails at enqueue time
        host_ptr(&args.c)?;
        host_ptr(&args.a)?;
        host_ptr(&args.b)?;
        self.enqueue_kernel(move || gemm::run(&args))
    }

    fn launch_fill_random(&self, dest: &OperandView, dist: Distribution) -> Result<()> {
        let (dest, keep_d) = kernel_view(dest)?;
        self.enqueue_kernel(move || {
            let _keep = &keep_d;
            kernels::fill_random(&dest, dist)
        })
    }
}

/// Completion marker for cross-stream and host synchronization
pub struct CpuEvent {
    done: Mutex<bool>,
    cond: Condvar,
}

impl CpuEvent {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            done: Mutex::new(false),
            cond: Condvar::new(),
        })
    }

    pub(crate) fn signal(&self) {
        *self.done.lock() = true;
        self.cond.notify_all();
    }
}

impl Event for CpuEvent {
    fn is_complete(&self) -> bool {
        *self.done.lock()
    }

    fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.cond.wait(&mut done);
        }
    }
}
