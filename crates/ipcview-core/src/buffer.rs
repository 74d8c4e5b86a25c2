//! IPC handle resolution and mapped device buffers

use crate::context::DeviceContext;
use crate::driver::{DevicePtr, Driver, IpcOpenFlags};
use crate::handle::IpcMemHandle;
use crate::{Error, Result};
use tracing::{debug, info, warn};

/// Device memory mapped from another process.
///
/// The memory itself belongs to the exporter; this value owns only the
/// mapping, which is closed when it drops. Work still queued on the context
/// is waited for before the mapping goes away. The pointer stays valid only while
/// the exporter keeps its allocation alive, which nothing here can check.
pub struct RawDeviceBuffer<D: Driver> {
    ctx: DeviceContext<D>,
    ptr: DevicePtr,
    handle: IpcMemHandle,
    /// Whether this buffer still owns the mapping
    mapped: bool,
}

impl<D: Driver> RawDeviceBuffer<D> {
    /// Get device pointer
    pub fn device_ptr(&self) -> DevicePtr {
        self.ptr
    }

    /// Get device ID
    pub fn device_id(&self) -> usize {
        self.ctx.device_id()
    }

    pub fn handle(&self) -> &IpcMemHandle {
        &self.handle
    }

    pub fn context(&self) -> &DeviceContext<D> {
        &self.ctx
    }

    /// Close the mapping now and report the driver result.
    pub fn close(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        if !self.mapped {
            return Ok(());
        }
        self.mapped = false;
        if self.ctx.has_pending_work() {
            // a queued kernel may still read or write this mapping
            if let Err(e) = self.ctx.synchronize() {
                warn!(error = %e, "barrier before closing IPC mapping failed");
            }
        }
        debug!(ptr = format_args!("{:#x}", self.ptr), "closing IPC mapping");
        self.ctx
            .driver()
            .close_ipc_handle(self.ctx.raw(), self.ptr)
            .map_err(Error::IpcClose)
    }
}

impl<D: Driver> Drop for RawDeviceBuffer<D> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(error = %e, "failed to close IPC mapping");
        }
    }
}

/// Maps exported memory handles into a device context.
pub struct IpcHandleResolver<'a, D: Driver> {
    ctx: &'a DeviceContext<D>,
    flags: IpcOpenFlags,
}

impl<'a, D: Driver> IpcHandleResolver<'a, D> {
    pub fn new(ctx: &'a DeviceContext<D>) -> Self {
        Self {
            ctx,
            flags: IpcOpenFlags::default(),
        }
    }

    pub fn with_flags(mut self, flags: IpcOpenFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn flags(&self) -> IpcOpenFlags {
        self.flags
    }

    /// Resolve a 128-character hex handle.
    ///
    /// The string is validated before any driver call is made.
    pub fn open(&self, hex: &str) -> Result<RawDeviceBuffer<D>> {
        let handle = IpcMemHandle::from_hex(hex)?;
        self.open_handle(&handle)
    }

    /// Resolve an already decoded handle.
    pub fn open_handle(&self, handle: &IpcMemHandle) -> Result<RawDeviceBuffer<D>> {
        let ptr = self
            .ctx
            .driver()
            .open_ipc_handle(self.ctx.raw(), handle, self.flags)
            .map_err(Error::IpcOpen)?;

        info!(
            device_id = self.ctx.device_id(),
            ptr = format_args!("{:#x}", ptr),
            flags = self.flags.bits(),
            "opened IPC handle"
        );

        Ok(RawDeviceBuffer {
            ctx: self.ctx.clone(),
            ptr,
            handle: *handle,
            mapped: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;
    use crate::mock::{MockCall, MockDriver};

    fn setup() -> (MockDriver, DeviceContext<MockDriver>) {
        let driver = MockDriver::with_devices(1);
        let ctx = DeviceContext::initialize(driver.clone(), 0).unwrap();
        (driver, ctx)
    }

    #[test]
    fn test_open_and_close_on_drop() {
        let (driver, ctx) = setup();
        let handle = driver.export(0, vec![0u8; 16]);

        let buf = IpcHandleResolver::new(&ctx).open(&handle.to_hex()).unwrap();
        assert_ne!(buf.device_ptr(), 0);
        assert_eq!(buf.device_id(), 0);
        assert_eq!(buf.handle(), &handle);
        assert_eq!(driver.live_mappings(), 1);

        drop(buf);
        assert_eq!(driver.live_mappings(), 0);
        assert_eq!(driver.calls().close_ipc_handle, 1);
    }

    #[test]
    fn test_explicit_close_does_not_double_close() {
        let (driver, ctx) = setup();
        let handle = driver.export(0, vec![0u8; 16]);
        let buf = IpcHandleResolver::new(&ctx).open_handle(&handle).unwrap();
        buf.close().unwrap();
        assert_eq!(driver.calls().close_ipc_handle, 1);
    }

    #[test]
    fn test_invalid_hex_makes_no_driver_call() {
        let (driver, ctx) = setup();
        let before = driver.calls().total();
        let err = IpcHandleResolver::new(&ctx).open("abc").err().unwrap();
        assert!(matches!(err, Error::InvalidHandleFormat(_)));
        assert_eq!(driver.calls().total(), before);
    }

    #[test]
    fn test_unknown_handle_is_ipc_open_error() {
        let (_driver, ctx) = setup();
        let handle = IpcMemHandle::from_bytes([0xab; 64]);
        let err = IpcHandleResolver::new(&ctx).open_handle(&handle).err().unwrap();
        assert!(matches!(err, Error::IpcOpen(_)));
    }

    #[test]
    fn test_foreign_device_needs_peer_access() {
        let driver = MockDriver::with_devices(2);
        let ctx = DeviceContext::initialize(driver.clone(), 0).unwrap();
        let handle = driver.export(1, vec![0u8; 8]);

        let err = IpcHandleResolver::new(&ctx).open_handle(&handle).err().unwrap();
        assert!(matches!(err, Error::IpcOpen(_)));

        let buf = IpcHandleResolver::new(&ctx)
            .with_flags(IpcOpenFlags::LAZY_ENABLE_PEER_ACCESS)
            .open_handle(&handle)
            .unwrap();
        assert_eq!(buf.device_id(), 0);
        assert_eq!(driver.last_open_flags(), Some(IpcOpenFlags::LAZY_ENABLE_PEER_ACCESS));
    }

    #[test]
    fn test_close_failure_reported_by_close() {
        let (driver, ctx) = setup();
        let handle = driver.export(0, vec![0u8; 8]);
        let buf = IpcHandleResolver::new(&ctx).open_handle(&handle).unwrap();
        driver.fail_on(MockCall::CloseIpcHandle, 1);
        assert!(matches!(buf.close(), Err(Error::IpcClose(_))));
    }

    #[test]
    fn test_release_waits_for_queued_launch() {
        let (driver, ctx) = setup();
        let handle = driver.export(0, vec![1u8; 4]);
        let buf = IpcHandleResolver::new(&ctx).open_handle(&handle).unwrap();

        let ptr = buf.device_ptr();
        driver
            .launch_cumsum(ctx.raw(), DType::UInt8, ptr, ptr, 4)
            .unwrap();
        ctx.mark_pending();

        drop(buf);
        assert_eq!(driver.calls().synchronize, 1);
        assert_eq!(driver.mappings_closed_in_flight(), 0);
        assert_eq!(driver.read_export(&handle).unwrap(), vec![1, 2, 3, 4]);
        assert!(!ctx.has_pending_work());
    }

    #[test]
    fn test_release_without_pending_work_skips_barrier() {
        let (driver, ctx) = setup();
        let handle = driver.export(0, vec![0u8; 4]);
        let buf = IpcHandleResolver::new(&ctx).open_handle(&handle).unwrap();
        drop(buf);
        assert_eq!(driver.calls().synchronize, 0);
    }

    #[test]
    fn test_failed_barrier_still_closes_mapping() {
        let (driver, ctx) = setup();
        let handle = driver.export(0, vec![0u8; 4]);
        let buf = IpcHandleResolver::new(&ctx).open_handle(&handle).unwrap();
        ctx.mark_pending();
        driver.fail_on(MockCall::Synchronize, 700);

        drop(buf);
        assert_eq!(driver.live_mappings(), 0);
        assert!(!ctx.has_pending_work());
    }

    #[test]
    fn test_mapping_keeps_context_alive() {
        let (driver, ctx) = setup();
        let handle = driver.export(0, vec![0u8; 8]);
        let buf = IpcHandleResolver::new(&ctx).open_handle(&handle).unwrap();
        drop(ctx);
        assert_eq!(driver.live_contexts(), 1);
        drop(buf);
        assert_eq!(driver.live_contexts(), 0);
    }
}
