//! Ambient execution context
//!
//! A context carries the current driver, device, stream, datatype, and
//! conversion-checking mode for a lexically delimited region. It is scoped
//! dynamic state on a per-thread stack, not a global singleton: lookups
//! resolve missing fields from outer frames, and every tensor-creating
//! operation also accepts explicit overrides. Tasks spawned for compute
//! kernels never inherit the context ambiently.

use crate::driver::{registry, Device, Driver, Stream};
use crate::dtype::DType;
use crate::error::{Error, Result};
use std::cell::RefCell;
use std::sync::Arc;

/// One context frame; unset fields resolve from outer frames
#[derive(Clone, Default)]
pub struct Context {
    /// Current driver
    pub driver: Option<Arc<dyn Driver>>,
    /// Current device
    pub device: Option<Arc<dyn Device>>,
    /// Current stream
    pub stream: Option<Arc<dyn Stream>>,
    /// Default element type for tensor creation
    pub dtype: Option<DType>,
    /// Whether numeric conversions skip domain checks
    pub unchecked: Option<bool>,
}

impl Context {
    /// An empty frame (pure pass-through)
    pub fn new() -> Self {
        Self::default()
    }

    /// Frame selecting a registered driver by name
    pub fn for_driver(name: &str) -> Result<Self> {
        Ok(Self {
            driver: Some(registry::driver(name)?),
            ..Self::default()
        })
    }

    /// Set the device (and implicitly its driver on lookup)
    pub fn with_device(mut self, device: Arc<dyn Device>) -> Self {
        self.device = Some(device);
        self
    }

    /// Set the stream
    pub fn with_stream(mut self, stream: Arc<dyn Stream>) -> Self {
        self.stream = Some(stream);
        self
    }

    /// Set the default datatype
    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = Some(dtype);
        self
    }

    /// Set the conversion-checking mode
    pub fn with_unchecked(mut self, unchecked: bool) -> Self {
        self.unchecked = Some(unchecked);
        self
    }
}

thread_local! {
    static CONTEXTS: RefCell<Vec<Context>> = const { RefCell::new(Vec::new()) };
}

/// Run `body` with `ctx` pushed as the innermost context frame
pub fn with_context<T>(ctx: Context, body: impl FnOnce() -> Result<T>) -> Result<T> {
    CONTEXTS.with(|c| c.borrow_mut().push(ctx));
    struct PopGuard;
    impl Drop for PopGuard {
        fn drop(&mut self) {
            CONTEXTS.with(|c| {
                c.borrow_mut().pop();
            });
        }
    }
    let _guard = PopGuard;
    body()
}

fn lookup<T>(pick: impl Fn(&Context) -> Option<T>) -> Option<T> {
    CONTEXTS.with(|c| c.borrow().iter().rev().find_map(pick))
}

/// The innermost selected driver
///
/// A frame that sets only a device still determines the driver. Falling
/// off the outermost frame without a driver selected is an error.
pub fn current_driver() -> Result<Arc<dyn Driver>> {
    if let Some(driver) = lookup(|ctx| ctx.driver.clone()) {
        return Ok(driver);
    }
    if let Some(device) = lookup(|ctx| ctx.device.clone()) {
        return registry::driver(device.driver_name());
    }
    Err(Error::NoContext { field: "driver" })
}

/// The innermost selected device, defaulting to the driver's first device
pub fn current_device() -> Result<Arc<dyn Device>> {
    if let Some(device) = lookup(|ctx| ctx.device.clone()) {
        return Ok(device);
    }
    if let Some(stream) = lookup(|ctx| ctx.stream.clone()) {
        return Ok(stream.device());
    }
    let driver = current_driver()?;
    driver
        .devices()
        .into_iter()
        .next()
        .ok_or_else(|| Error::device(format!("driver '{}' has no devices", driver.name())))
}

/// The innermost selected stream, defaulting to the device's default stream
pub fn current_stream() -> Result<Arc<dyn Stream>> {
    if let Some(stream) = lookup(|ctx| ctx.stream.clone()) {
        return Ok(stream);
    }
    Ok(current_device()?.default_stream())
}

/// The innermost selected datatype, `F64` when none is set
pub fn current_dtype() -> DType {
    lookup(|ctx| ctx.dtype).unwrap_or(DType::F64)
}

/// The innermost conversion-checking mode, unchecked when none is set
pub fn current_unchecked() -> bool {
    lookup(|ctx| ctx.unchecked).unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_context_errors() {
        let err = current_driver().unwrap_err();
        assert!(matches!(err, Error::NoContext { field: "driver" }));
        assert_eq!(current_dtype(), DType::F64);
        assert!(current_unchecked());
    }

    #[test]
    fn test_inner_frame_overrides() {
        with_context(Context::for_driver("cpu").unwrap(), || {
            assert_eq!(current_driver()?.name(), "cpu");
            assert_eq!(current_dtype(), DType::F64);
            with_context(Context::new().with_dtype(DType::F32).with_unchecked(false), || {
                // Driver resolves from the outer frame
                assert_eq!(current_driver()?.name(), "cpu");
                assert_eq!(current_dtype(), DType::F32);
                assert!(!current_unchecked());
                Ok(())
            })?;
            assert_eq!(current_dtype(), DType::F64);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_device_implies_driver() {
        let device = registry::driver("cpu").unwrap().devices().remove(0);
        with_context(Context::new().with_device(device), || {
            assert_eq!(current_driver()?.name(), "cpu");
            assert_eq!(current_device()?.id(), 0);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_frame_popped_after_error() {
        let _: Result<()> = with_context(Context::for_driver("cpu").unwrap(), || {
            Err(Error::device("bail"))
        });
        assert!(current_driver().is_err());
    }
}
