//! Device driver interface
//!
//! Everything the worker does on the device goes through [`Driver`]. The CUDA
//! implementation lives in [`crate::cuda`] (feature `cuda`); [`crate::mock`]
//! provides a host-memory double with call counters.

use crate::dtype::DType;
use crate::error::DriverError;
use crate::handle::IpcMemHandle;

/// Device address valid inside one driver context
pub type DevicePtr = u64;

/// Flags for mapping an IPC handle.
///
/// `CU_IPC_MEM_LAZY_ENABLE_PEER_ACCESS` lets the driver enable peer access on
/// demand when the exporter's device differs from ours. It is off unless
/// explicitly requested.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IpcOpenFlags {
    pub lazy_enable_peer_access: bool,
}

impl IpcOpenFlags {
    pub const NONE: Self = Self {
        lazy_enable_peer_access: false,
    };

    pub const LAZY_ENABLE_PEER_ACCESS: Self = Self {
        lazy_enable_peer_access: true,
    };

    /// Raw flag word passed to `cuIpcOpenMemHandle`
    pub const fn bits(&self) -> u32 {
        if self.lazy_enable_peer_access {
            0x1
        } else {
            0x0
        }
    }
}

/// Device API surface used by the worker.
///
/// Calls taking a `Context` act on that context only; implementations must
/// make it current themselves rather than relying on whatever the calling
/// thread had bound before.
pub trait Driver {
    /// Driver-level execution context. Released when dropped.
    type Context;

    /// Bring up the driver. Implementations initialize at most once per process.
    fn init(&self) -> Result<(), DriverError>;

    fn device_count(&self) -> Result<usize, DriverError>;

    fn create_context(&self, device_id: usize) -> Result<Self::Context, DriverError>;

    fn open_ipc_handle(
        &self,
        ctx: &Self::Context,
        handle: &IpcMemHandle,
        flags: IpcOpenFlags,
    ) -> Result<DevicePtr, DriverError>;

    fn close_ipc_handle(&self, ctx: &Self::Context, ptr: DevicePtr) -> Result<(), DriverError>;

    /// Enqueue an inclusive prefix sum of `len` elements from `src` into `dst`.
    ///
    /// Returns once the launch is queued; completion is only observable after
    /// [`Driver::synchronize`]. `src == dst` is allowed.
    fn launch_cumsum(
        &self,
        ctx: &Self::Context,
        dtype: DType,
        src: DevicePtr,
        dst: DevicePtr,
        len: usize,
    ) -> Result<(), DriverError>;

    /// Block until all work queued on `ctx` has finished.
    fn synchronize(&self, ctx: &Self::Context) -> Result<(), DriverError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_bits() {
        assert_eq!(IpcOpenFlags::default(), IpcOpenFlags::NONE);
        assert_eq!(IpcOpenFlags::NONE.bits(), 0);
        assert_eq!(IpcOpenFlags::LAZY_ENABLE_PEER_ACCESS.bits(), 1);
    }
}
