//! Device context management

use crate::driver::Driver;
use crate::{Error, Result};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Explicit handle to a device execution context.
///
/// Cloning is cheap and shares the same driver context. The context is torn
/// down when the last clone drops; every [`RawDeviceBuffer`](crate::RawDeviceBuffer)
/// holds a clone, so mappings are always closed before their context goes away.
pub struct DeviceContext<D: Driver> {
    inner: Arc<ContextInner<D>>,
}

struct ContextInner<D: Driver> {
    // field order matters: the raw context drops before the driver
    raw: D::Context,
    driver: D,
    device_id: usize,
    /// Set by a launch, cleared by the next barrier
    unsynchronized: AtomicBool,
}

impl<D: Driver> DeviceContext<D> {
    /// Bring up the driver and create a context on `device_id`.
    pub fn initialize(driver: D, device_id: usize) -> Result<Self> {
        debug!(device_id, "initializing driver");
        driver.init().map_err(Error::Initialization)?;

        let count = driver.device_count().map_err(Error::Initialization)?;
        if device_id >= count {
            return Err(Error::DeviceNotFound { device_id, count });
        }

        let raw = driver
            .create_context(device_id)
            .map_err(|source| Error::ContextCreation { device_id, source })?;

        info!(device_id, device_count = count, "device context ready");

        Ok(Self {
            inner: Arc::new(ContextInner {
                raw,
                driver,
                device_id,
                unsynchronized: AtomicBool::new(false),
            }),
        })
    }

    /// Get device ID
    pub fn device_id(&self) -> usize {
        self.inner.device_id
    }

    pub fn driver(&self) -> &D {
        &self.inner.driver
    }

    /// Driver-level context, for calls made through [`Self::driver`]
    pub fn raw(&self) -> &D::Context {
        &self.inner.raw
    }

    /// Whether both handles refer to the same driver context
    pub fn same_context(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Whether a launch has been issued since the last barrier
    pub fn has_pending_work(&self) -> bool {
        self.inner.unsynchronized.load(Ordering::Acquire)
    }

    pub(crate) fn mark_pending(&self) {
        self.inner.unsynchronized.store(true, Ordering::Release);
    }

    /// Block until all work queued on this context has completed.
    ///
    /// The queue is drained even when the barrier reports a fault, so pending
    /// work is cleared either way.
    pub fn synchronize(&self) -> Result<()> {
        debug!(device_id = self.device_id(), "synchronizing context");
        self.inner.unsynchronized.store(false, Ordering::Release);
        self.driver()
            .synchronize(self.raw())
            .map_err(|e| Error::compute("synchronization barrier failed", e))
    }
}

impl<D: Driver> Clone for DeviceContext<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Driver> fmt::Debug for DeviceContext<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceContext")
            .field("device_id", &self.inner.device_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockCall, MockDriver};

    #[test]
    fn test_initialize_binds_device() {
        let driver = MockDriver::with_devices(2);
        let ctx = DeviceContext::initialize(driver.clone(), 1).unwrap();
        assert_eq!(ctx.device_id(), 1);

        let calls = driver.calls();
        assert_eq!(calls.init, 1);
        assert_eq!(calls.device_count, 1);
        assert_eq!(calls.create_context, 1);
    }

    #[test]
    fn test_out_of_range_creates_no_context() {
        let driver = MockDriver::with_devices(1);
        let err = DeviceContext::initialize(driver.clone(), 1).unwrap_err();
        assert!(matches!(
            err,
            Error::DeviceNotFound {
                device_id: 1,
                count: 1
            }
        ));
        assert_eq!(driver.calls().create_context, 0);
        assert_eq!(driver.live_contexts(), 0);
    }

    #[test]
    fn test_init_failure() {
        let driver = MockDriver::with_devices(1);
        driver.fail_on(MockCall::Init, 100);
        let err = DeviceContext::initialize(driver.clone(), 0).unwrap_err();
        match err {
            Error::Initialization(e) => {
                assert_eq!(e.call, "cuInit");
                assert_eq!(e.code, 100);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(driver.calls().device_count, 0);
    }

    #[test]
    fn test_context_creation_failure() {
        let driver = MockDriver::with_devices(1);
        driver.fail_on(MockCall::CreateContext, 2);
        let err = DeviceContext::initialize(driver, 0).unwrap_err();
        assert!(matches!(err, Error::ContextCreation { device_id: 0, .. }));
    }

    #[test]
    fn test_context_released_with_last_clone() {
        let driver = MockDriver::with_devices(1);
        let ctx = DeviceContext::initialize(driver.clone(), 0).unwrap();
        let other = ctx.clone();
        assert!(ctx.same_context(&other));
        drop(ctx);
        assert_eq!(driver.live_contexts(), 1);
        drop(other);
        assert_eq!(driver.live_contexts(), 0);
    }

    #[test]
    fn test_barrier_clears_pending_work() {
        let driver = MockDriver::with_devices(1);
        let ctx = DeviceContext::initialize(driver, 0).unwrap();
        assert!(!ctx.has_pending_work());
        ctx.mark_pending();
        assert!(ctx.clone().has_pending_work());
        ctx.synchronize().unwrap();
        assert!(!ctx.has_pending_work());
    }

    #[test]
    fn test_separate_contexts_are_distinct() {
        let driver = MockDriver::with_devices(1);
        let a = DeviceContext::initialize(driver.clone(), 0).unwrap();
        let b = DeviceContext::initialize(driver, 0).unwrap();
        assert!(!a.same_context(&b));
    }
}
