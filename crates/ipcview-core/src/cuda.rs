//! CUDA driver backend and IPC support

use crate::driver::{DevicePtr, Driver, IpcOpenFlags};
use crate::dtype::DType;
use crate::error::DriverError;
use crate::handle::IpcMemHandle;
use cudarc::driver::{result, sys};
use parking_lot::Mutex;
use std::ffi::{c_char, c_void, CString};
use std::sync::OnceLock;
use tracing::{debug, info};

const CUMSUM_CU: &str = include_str!("kernels/cumsum.cu");

/// Outcome of the one `cuInit` this process performs
static DRIVER_INIT: OnceLock<Result<(), DriverError>> = OnceLock::new();

fn check(call: &'static str, result: sys::CUresult) -> Result<(), DriverError> {
    if result == sys::CUresult::CUDA_SUCCESS {
        Ok(())
    } else {
        Err(DriverError::new(call, result as i32, format!("{:?}", result)))
    }
}

fn wrap(call: &'static str) -> impl Fn(cudarc::driver::DriverError) -> DriverError {
    move |e| DriverError::new(call, e.0 as i32, format!("{:?}", e.0))
}

fn kernel_name(dtype: DType) -> Option<&'static str> {
    Some(match dtype {
        DType::UInt8 => "cumsum_u8",
        DType::Int8 => "cumsum_i8",
        DType::UInt16 => "cumsum_u16",
        DType::Int16 => "cumsum_i16",
        DType::UInt32 => "cumsum_u32",
        DType::Int32 => "cumsum_i32",
        DType::UInt64 => "cumsum_u64",
        DType::Int64 => "cumsum_i64",
        DType::Float32 => "cumsum_f32",
        DType::Float64 => "cumsum_f64",
        DType::Float16 => return None,
    })
}

/// CUDA driver API backend
#[derive(Debug, Clone, Copy, Default)]
pub struct CudaDriver;

impl CudaDriver {
    pub fn new() -> Self {
        Self
    }
}

/// Context created with `cuCtxCreate`, destroyed on drop
pub struct CudaContext {
    raw: sys::CUcontext,
    device_id: usize,
    /// Prefix-sum module, compiled on first launch
    module: Mutex<Option<sys::CUmodule>>,
}

// Safety: CudaContext can be sent between threads
// Every call binds the context explicitly before use
unsafe impl Send for CudaContext {}
unsafe impl Sync for CudaContext {}

impl CudaContext {
    pub fn device_id(&self) -> usize {
        self.device_id
    }

    /// Make this context current on the calling thread
    fn bind(&self) -> Result<(), DriverError> {
        unsafe { result::ctx::set_current(self.raw) }.map_err(wrap("cuCtxSetCurrent"))
    }

    fn function(&self, name: &'static str) -> Result<sys::CUfunction, DriverError> {
        let mut module = self.module.lock();
        let m = match *module {
            Some(m) => m,
            None => {
                let m = Self::load_module()?;
                *module = Some(m);
                m
            }
        };
        let name = CString::new(name)
            .map_err(|_| DriverError::new("cuModuleGetFunction", 1, "CUDA_ERROR_INVALID_VALUE"))?;
        unsafe { result::module::get_function(m, name) }.map_err(wrap("cuModuleGetFunction"))
    }

    fn load_module() -> Result<sys::CUmodule, DriverError> {
        debug!("compiling cumsum kernels");
        let ptx = cudarc::nvrtc::compile_ptx(CUMSUM_CU)
            .map_err(|e| DriverError::new("nvrtcCompileProgram", -1, format!("{:?}", e)))?;
        let image = CString::new(ptx.to_src())
            .map_err(|_| DriverError::new("cuModuleLoadData", 1, "CUDA_ERROR_INVALID_IMAGE"))?;
        unsafe { result::module::load_data(image.as_ptr() as *const c_void) }
            .map_err(wrap("cuModuleLoadData"))
    }
}

impl Drop for CudaContext {
    fn drop(&mut self) {
        if self.bind().is_ok() {
            if let Some(m) = self.module.lock().take() {
                let _ = unsafe { result::module::unload(m) };
            }
        }
        let _ = check("cuCtxDestroy", unsafe { sys::cuCtxDestroy_v2(self.raw) });
    }
}

impl Driver for CudaDriver {
    type Context = CudaContext;

    fn init(&self) -> Result<(), DriverError> {
        DRIVER_INIT
            .get_or_init(|| {
                info!("initializing CUDA driver");
                result::init().map_err(wrap("cuInit"))
            })
            .clone()
    }

    fn device_count(&self) -> Result<usize, DriverError> {
        let count = result::device::get_count().map_err(wrap("cuDeviceGetCount"))?;
        Ok(count.max(0) as usize)
    }

    fn create_context(&self, device_id: usize) -> Result<CudaContext, DriverError> {
        let ordinal = i32::try_from(device_id)
            .map_err(|_| DriverError::new("cuDeviceGet", 101, "CUDA_ERROR_INVALID_DEVICE"))?;
        let dev = result::device::get(ordinal).map_err(wrap("cuDeviceGet"))?;

        let mut raw: sys::CUcontext = std::ptr::null_mut();
        check("cuCtxCreate", unsafe { sys::cuCtxCreate_v2(&mut raw, 0, dev) })?;

        Ok(CudaContext {
            raw,
            device_id,
            module: Mutex::new(None),
        })
    }

    fn open_ipc_handle(
        &self,
        ctx: &CudaContext,
        handle: &IpcMemHandle,
        flags: IpcOpenFlags,
    ) -> Result<DevicePtr, DriverError> {
        ctx.bind()?;
        let raw_handle = sys::CUipcMemHandle {
            reserved: handle.reserved.map(|b| b as c_char),
        };
        let mut ptr: sys::CUdeviceptr = 0;
        check("cuIpcOpenMemHandle", unsafe {
            sys::cuIpcOpenMemHandle(&mut ptr, raw_handle, flags.bits())
        })?;
        Ok(ptr)
    }

    fn close_ipc_handle(&self, ctx: &CudaContext, ptr: DevicePtr) -> Result<(), DriverError> {
        ctx.bind()?;
        check("cuIpcCloseMemHandle", unsafe { sys::cuIpcCloseMemHandle(ptr) })
    }

    fn launch_cumsum(
        &self,
        ctx: &CudaContext,
        dtype: DType,
        src: DevicePtr,
        dst: DevicePtr,
        len: usize,
    ) -> Result<(), DriverError> {
        let name = kernel_name(dtype)
            .ok_or_else(|| DriverError::new("cuLaunchKernel", 801, "CUDA_ERROR_NOT_SUPPORTED"))?;
        ctx.bind()?;
        let func = ctx.function(name)?;

        let mut src = src;
        let mut dst = dst;
        let mut n = len as u64;
        let mut params = [
            &mut src as *mut u64 as *mut c_void,
            &mut dst as *mut u64 as *mut c_void,
            &mut n as *mut u64 as *mut c_void,
        ];
        // legacy default stream; launch returns before the kernel completes
        unsafe {
            result::launch_kernel(
                func,
                (1, 1, 1),
                (1, 1, 1),
                0,
                std::ptr::null_mut(),
                &mut params,
            )
        }
        .map_err(wrap("cuLaunchKernel"))
    }

    fn synchronize(&self, ctx: &CudaContext) -> Result<(), DriverError> {
        ctx.bind()?;
        result::ctx::synchronize().map_err(wrap("cuCtxSynchronize"))
    }
}
