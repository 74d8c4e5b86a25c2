//! Error types for ipcview

use thiserror::Error;

/// A rejected driver call, carrying the platform error identifier.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{call} failed: {name} ({code})")]
pub struct DriverError {
    /// Driver entry point that failed, e.g. `cuIpcOpenMemHandle`
    pub call: &'static str,
    /// Raw platform result code
    pub code: i32,
    /// Symbolic name of the result code
    pub name: String,
}

impl DriverError {
    pub fn new(call: &'static str, code: i32, name: impl Into<String>) -> Self {
        Self {
            call,
            code,
            name: name.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("driver initialization failed: {0}")]
    Initialization(#[source] DriverError),

    #[error("device {device_id} not found: {count} device(s) available")]
    DeviceNotFound { device_id: usize, count: usize },

    #[error("context creation failed on device {device_id}: {source}")]
    ContextCreation {
        device_id: usize,
        #[source]
        source: DriverError,
    },

    #[error("invalid IPC handle: {0}")]
    InvalidHandleFormat(String),

    #[error("IPC open failed: {0}")]
    IpcOpen(#[source] DriverError),

    #[error("IPC close failed: {0}")]
    IpcClose(#[source] DriverError),

    #[error("unsupported dtype: {0:?}")]
    UnsupportedDtype(String),

    #[error("invalid shape: {0}")]
    InvalidShape(String),

    #[error("buffer type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    #[error("view belongs to a different device context")]
    ContextMismatch,

    #[error("compute failed: {message}")]
    Compute {
        message: String,
        #[source]
        source: Option<DriverError>,
    },
}

impl Error {
    pub(crate) fn compute(message: impl Into<String>, source: DriverError) -> Self {
        Error::Compute {
            message: message.into(),
            source: Some(source),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
