//! ipcview - typed views over CUDA memory exported by another process
//!
//! A worker creates a [`DeviceContext`], maps exported handles with
//! [`IpcHandleResolver`], types them with [`TypedBufferView`] and runs prefix
//! sums through [`OperationExecutor`].

pub mod buffer;
pub mod context;
#[cfg(feature = "cuda")]
pub mod cuda;
pub mod driver;
pub mod dtype;
pub mod error;
pub mod executor;
pub mod handle;
pub mod mock;
pub mod view;

pub use buffer::{IpcHandleResolver, RawDeviceBuffer};
pub use context::DeviceContext;
#[cfg(feature = "cuda")]
pub use cuda::CudaDriver;
pub use driver::{DevicePtr, Driver, IpcOpenFlags};
pub use dtype::DType;
pub use error::{DriverError, Error, Result};
pub use executor::{Completion, OperationExecutor, SyncPolicy};
pub use handle::{IpcMemHandle, IPC_HANDLE_HEX_LEN, IPC_HANDLE_SIZE};
pub use view::{CudaArrayInterface, TypedBufferView};
