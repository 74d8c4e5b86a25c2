//! Typed, shaped views over mapped device memory

use crate::buffer::RawDeviceBuffer;
use crate::context::DeviceContext;
use crate::driver::{DevicePtr, Driver};
use crate::dtype::DType;
use crate::{Error, Result};
use std::fmt;
use tracing::debug;

/// One-dimensional typed view over a [`RawDeviceBuffer`].
///
/// No element data is copied. The view owns the mapping: dropping the view
/// closes it. `len * dtype.size()` is trusted to fit inside the exporter's
/// allocation; the allocation size is not communicated across the process
/// boundary, so it cannot be checked here.
pub struct TypedBufferView<D: Driver> {
    buffer: RawDeviceBuffer<D>,
    dtype: DType,
    shape: [usize; 1],
    /// Strides in bytes
    strides: [usize; 1],
}

impl<D: Driver> TypedBufferView<D> {
    /// Build a view from an array-interface type string such as `<f4`.
    pub fn new(buffer: RawDeviceBuffer<D>, typestr: &str, len: usize) -> Result<Self> {
        let dtype = DType::parse_typestr(typestr)?;
        Self::with_dtype(buffer, dtype, len)
    }

    pub fn with_dtype(buffer: RawDeviceBuffer<D>, dtype: DType, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::InvalidShape("length must be positive".to_string()));
        }
        if len.checked_mul(dtype.size()).is_none() {
            return Err(Error::InvalidShape(format!(
                "{} elements of {} overflow the address space",
                len, dtype
            )));
        }

        debug!(
            ptr = format_args!("{:#x}", buffer.device_ptr()),
            %dtype,
            len,
            "built typed view"
        );

        Ok(Self {
            buffer,
            dtype,
            shape: [len],
            strides: [dtype.size()],
        })
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Strides in bytes; always contiguous
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.shape[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn size_in_bytes(&self) -> usize {
        self.len() * self.dtype.size()
    }

    pub fn typestr(&self) -> String {
        self.dtype.typestr()
    }

    pub fn device_ptr(&self) -> DevicePtr {
        self.buffer.device_ptr()
    }

    pub fn device_id(&self) -> usize {
        self.buffer.device_id()
    }

    pub fn context(&self) -> &DeviceContext<D> {
        self.buffer.context()
    }

    pub fn buffer(&self) -> &RawDeviceBuffer<D> {
        &self.buffer
    }

    /// Drop the typing and return the mapping
    pub fn into_buffer(self) -> RawDeviceBuffer<D> {
        self.buffer
    }

    /// Describe the view in `__cuda_array_interface__` (version 3) terms.
    pub fn array_interface(&self) -> CudaArrayInterface {
        CudaArrayInterface {
            shape: self.shape.to_vec(),
            typestr: self.typestr(),
            data: (self.device_ptr(), false),
            // contiguous views report no strides
            strides: None,
            version: CudaArrayInterface::VERSION,
        }
    }
}

impl<D: Driver> fmt::Debug for TypedBufferView<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedBufferView")
            .field("ptr", &format_args!("{:#x}", self.device_ptr()))
            .field("device_id", &self.device_id())
            .field("dtype", &self.dtype)
            .field("shape", &self.shape)
            .field("strides", &self.strides)
            .finish()
    }
}

/// Zero-copy array description understood by CUDA-aware numeric runtimes.
///
/// `stream` is always absent: producers synchronize before handing memory
/// over, so consumers need not wait on a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CudaArrayInterface {
    pub shape: Vec<usize>,
    pub typestr: String,
    /// Device pointer and read-only flag
    pub data: (DevicePtr, bool),
    pub strides: Option<Vec<usize>>,
    pub version: u32,
}

impl CudaArrayInterface {
    pub const VERSION: u32 = 3;
}
