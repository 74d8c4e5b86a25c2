//! Host-memory driver double
//!
//! Stands in for both sides of the IPC boundary: tests play the exporting
//! process through [`MockDriver::export`] / [`MockDriver::read_export`] and
//! hand the same driver to the worker code. Kernel launches are queued and
//! only applied by `synchronize`, so a missing barrier is observable.

use crate::driver::{DevicePtr, Driver, IpcOpenFlags};
use crate::dtype::DType;
use crate::error::DriverError;
use crate::handle::{IpcMemHandle, IPC_HANDLE_SIZE};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

const CUDA_ERROR_INVALID_VALUE: i32 = 1;
const CUDA_ERROR_NOT_INITIALIZED: i32 = 3;
const CUDA_ERROR_INVALID_DEVICE: i32 = 101;
const CUDA_ERROR_PEER_ACCESS_UNSUPPORTED: i32 = 217;
const CUDA_ERROR_ILLEGAL_ADDRESS: i32 = 700;
const CUDA_ERROR_NOT_SUPPORTED: i32 = 801;

/// Spacing between mapped base addresses
const MAPPING_STRIDE: DevicePtr = 1 << 20;

fn result_name(code: i32) -> &'static str {
    match code {
        1 => "CUDA_ERROR_INVALID_VALUE",
        2 => "CUDA_ERROR_OUT_OF_MEMORY",
        3 => "CUDA_ERROR_NOT_INITIALIZED",
        100 => "CUDA_ERROR_NO_DEVICE",
        101 => "CUDA_ERROR_INVALID_DEVICE",
        201 => "CUDA_ERROR_INVALID_CONTEXT",
        217 => "CUDA_ERROR_PEER_ACCESS_UNSUPPORTED",
        700 => "CUDA_ERROR_ILLEGAL_ADDRESS",
        719 => "CUDA_ERROR_LAUNCH_FAILED",
        801 => "CUDA_ERROR_NOT_SUPPORTED",
        _ => "CUDA_ERROR_UNKNOWN",
    }
}

/// Driver entry points, for counting and failure injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockCall {
    Init,
    DeviceCount,
    CreateContext,
    OpenIpcHandle,
    CloseIpcHandle,
    LaunchCumsum,
    Synchronize,
}

impl MockCall {
    /// CUDA entry point this call stands for
    pub fn driver_name(&self) -> &'static str {
        match self {
            MockCall::Init => "cuInit",
            MockCall::DeviceCount => "cuDeviceGetCount",
            MockCall::CreateContext => "cuCtxCreate",
            MockCall::OpenIpcHandle => "cuIpcOpenMemHandle",
            MockCall::CloseIpcHandle => "cuIpcCloseMemHandle",
            MockCall::LaunchCumsum => "cuLaunchKernel",
            MockCall::Synchronize => "cuCtxSynchronize",
        }
    }
}

/// Number of calls made per entry point, failed ones included
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub init: usize,
    pub device_count: usize,
    pub create_context: usize,
    pub open_ipc_handle: usize,
    pub close_ipc_handle: usize,
    pub launch_cumsum: usize,
    pub synchronize: usize,
}

impl CallCounts {
    pub fn total(&self) -> usize {
        self.init
            + self.device_count
            + self.create_context
            + self.open_ipc_handle
            + self.close_ipc_handle
            + self.launch_cumsum
            + self.synchronize
    }

    fn bump(&mut self, call: MockCall) {
        let slot = match call {
            MockCall::Init => &mut self.init,
            MockCall::DeviceCount => &mut self.device_count,
            MockCall::CreateContext => &mut self.create_context,
            MockCall::OpenIpcHandle => &mut self.open_ipc_handle,
            MockCall::CloseIpcHandle => &mut self.close_ipc_handle,
            MockCall::LaunchCumsum => &mut self.launch_cumsum,
            MockCall::Synchronize => &mut self.synchronize,
        };
        *slot += 1;
    }
}

struct Export {
    device_id: usize,
    bytes: Vec<u8>,
}

struct Mapping {
    handle: IpcMemHandle,
    ctx_id: u64,
    refs: usize,
}

struct Launch {
    ctx_id: u64,
    dtype: DType,
    src: DevicePtr,
    dst: DevicePtr,
    len: usize,
}

#[derive(Default)]
struct MockState {
    device_count: usize,
    initialized: bool,
    failures: HashMap<MockCall, i32>,
    calls: CallCounts,
    exports: HashMap<IpcMemHandle, Export>,
    mappings: HashMap<DevicePtr, Mapping>,
    pending: Vec<Launch>,
    live_contexts: usize,
    closed_in_flight: usize,
    next_id: u64,
    next_ptr: DevicePtr,
    last_open_flags: Option<IpcOpenFlags>,
}

impl MockState {
    /// Record the call and return an injected failure, if any
    fn enter(&mut self, call: MockCall) -> Result<(), DriverError> {
        self.calls.bump(call);
        match self.failures.get(&call) {
            Some(&code) => Err(err(call, code)),
            None => Ok(()),
        }
    }

    fn mapping_in(&self, ctx_id: u64, ptr: DevicePtr) -> Option<&Mapping> {
        self.mappings.get(&ptr).filter(|m| m.ctx_id == ctx_id)
    }

    fn apply(&mut self, launch: &Launch) -> Result<(), ()> {
        let src = self.mappings.get(&launch.src).ok_or(())?.handle;
        let dst = self.mappings.get(&launch.dst).ok_or(())?.handle;
        let nbytes = launch.len * launch.dtype.size();

        let input = self.exports.get(&src).ok_or(())?.bytes.get(..nbytes).ok_or(())?;
        let scanned = prefix_sum(launch.dtype, input, launch.len).ok_or(())?;

        let out = self.exports.get_mut(&dst).ok_or(())?.bytes.get_mut(..nbytes).ok_or(())?;
        out.copy_from_slice(&scanned);
        Ok(())
    }
}

fn err(call: MockCall, code: i32) -> DriverError {
    DriverError::new(call.driver_name(), code, result_name(code))
}

macro_rules! scan {
    ($t:ty, $input:expr, $add:expr) => {{
        const N: usize = std::mem::size_of::<$t>();
        let add: fn($t, $t) -> $t = $add;
        let mut acc = <$t>::default();
        let mut out = Vec::with_capacity($input.len());
        for chunk in $input.chunks_exact(N) {
            let mut raw = [0u8; N];
            raw.copy_from_slice(chunk);
            acc = add(acc, <$t>::from_le_bytes(raw));
            out.extend_from_slice(&acc.to_le_bytes());
        }
        out
    }};
}

/// Host reference of the device kernel: inclusive scan, wrapping integer
/// arithmetic, sequential float accumulation.
pub fn prefix_sum(dtype: DType, input: &[u8], len: usize) -> Option<Vec<u8>> {
    let input = input.get(..len.checked_mul(dtype.size())?)?;
    let out = match dtype {
        DType::UInt8 => scan!(u8, input, |a, b| a.wrapping_add(b)),
        DType::Int8 => scan!(i8, input, |a, b| a.wrapping_add(b)),
        DType::UInt16 => scan!(u16, input, |a, b| a.wrapping_add(b)),
        DType::Int16 => scan!(i16, input, |a, b| a.wrapping_add(b)),
        DType::UInt32 => scan!(u32, input, |a, b| a.wrapping_add(b)),
        DType::Int32 => scan!(i32, input, |a, b| a.wrapping_add(b)),
        DType::UInt64 => scan!(u64, input, |a, b| a.wrapping_add(b)),
        DType::Int64 => scan!(i64, input, |a, b| a.wrapping_add(b)),
        DType::Float32 => scan!(f32, input, |a, b| a + b),
        DType::Float64 => scan!(f64, input, |a, b| a + b),
        DType::Float16 => return None,
    };
    Some(out)
}

/// Host-memory [`Driver`] with call counters.
///
/// Clones share state, so a test can keep one clone for inspection and hand
/// another to the code under test.
#[derive(Clone, Default)]
pub struct MockDriver {
    state: Arc<Mutex<MockState>>,
}

/// Context handle issued by [`MockDriver`]
pub struct MockContext {
    id: u64,
    device_id: usize,
    state: Arc<Mutex<MockState>>,
}

impl MockContext {
    pub fn device_id(&self) -> usize {
        self.device_id
    }
}

impl Drop for MockContext {
    fn drop(&mut self) {
        let mut st = self.state.lock();
        st.live_contexts -= 1;
        st.pending.retain(|l| l.ctx_id != self.id);
    }
}

impl MockDriver {
    pub fn with_devices(device_count: usize) -> Self {
        let driver = Self::default();
        {
            let mut st = driver.state.lock();
            st.device_count = device_count;
            st.next_ptr = 0x7f00_0000_0000;
        }
        driver
    }

    /// Play the exporter: publish `bytes` as an allocation on `device_id`.
    pub fn export(&self, device_id: usize, bytes: Vec<u8>) -> IpcMemHandle {
        let mut st = self.state.lock();
        st.next_id += 1;
        let mut raw = [0x5au8; IPC_HANDLE_SIZE];
        raw[..8].copy_from_slice(&st.next_id.to_le_bytes());
        raw[8..16].copy_from_slice(&(device_id as u64).to_le_bytes());
        let handle = IpcMemHandle::from_bytes(raw);
        st.exports.insert(handle, Export { device_id, bytes });
        handle
    }

    /// Play the exporter freeing its allocation. Returns whether it existed.
    pub fn revoke(&self, handle: &IpcMemHandle) -> bool {
        self.state.lock().exports.remove(handle).is_some()
    }

    /// Read the exported memory directly, as another process would.
    ///
    /// Does not synchronize: queued launches are not reflected.
    pub fn read_export(&self, handle: &IpcMemHandle) -> Option<Vec<u8>> {
        self.state.lock().exports.get(handle).map(|e| e.bytes.clone())
    }

    pub fn calls(&self) -> CallCounts {
        self.state.lock().calls
    }

    /// Make every later `call` fail with `code`
    pub fn fail_on(&self, call: MockCall, code: i32) {
        self.state.lock().failures.insert(call, code);
    }

    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    pub fn pending_launches(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn live_contexts(&self) -> usize {
        self.state.lock().live_contexts
    }

    pub fn live_mappings(&self) -> usize {
        self.state.lock().mappings.len()
    }

    /// Mappings unmapped while a queued launch still targeted them
    pub fn mappings_closed_in_flight(&self) -> usize {
        self.state.lock().closed_in_flight
    }

    pub fn last_open_flags(&self) -> Option<IpcOpenFlags> {
        self.state.lock().last_open_flags
    }
}

impl Driver for MockDriver {
    type Context = MockContext;

    fn init(&self) -> Result<(), DriverError> {
        let mut st = self.state.lock();
        st.enter(MockCall::Init)?;
        st.initialized = true;
        Ok(())
    }

    fn device_count(&self) -> Result<usize, DriverError> {
        let mut st = self.state.lock();
        st.enter(MockCall::DeviceCount)?;
        if !st.initialized {
            return Err(err(MockCall::DeviceCount, CUDA_ERROR_NOT_INITIALIZED));
        }
        Ok(st.device_count)
    }

    fn create_context(&self, device_id: usize) -> Result<MockContext, DriverError> {
        let mut st = self.state.lock();
        st.enter(MockCall::CreateContext)?;
        if device_id >= st.device_count {
            return Err(err(MockCall::CreateContext, CUDA_ERROR_INVALID_DEVICE));
        }
        st.next_id += 1;
        st.live_contexts += 1;
        Ok(MockContext {
            id: st.next_id,
            device_id,
            state: Arc::clone(&self.state),
        })
    }

    fn open_ipc_handle(
        &self,
        ctx: &MockContext,
        handle: &IpcMemHandle,
        flags: IpcOpenFlags,
    ) -> Result<DevicePtr, DriverError> {
        let mut st = self.state.lock();
        st.enter(MockCall::OpenIpcHandle)?;
        st.last_open_flags = Some(flags);

        let export = st
            .exports
            .get(handle)
            .ok_or_else(|| err(MockCall::OpenIpcHandle, CUDA_ERROR_INVALID_VALUE))?;
        if export.device_id != ctx.device_id && !flags.lazy_enable_peer_access {
            return Err(err(
                MockCall::OpenIpcHandle,
                CUDA_ERROR_PEER_ACCESS_UNSUPPORTED,
            ));
        }

        // the driver hands out one mapping per handle and context, refcounted
        if let Some((&ptr, mapping)) = st
            .mappings
            .iter_mut()
            .find(|(_, m)| m.handle == *handle && m.ctx_id == ctx.id)
        {
            mapping.refs += 1;
            return Ok(ptr);
        }

        let ptr = st.next_ptr;
        st.next_ptr += MAPPING_STRIDE;
        st.mappings.insert(
            ptr,
            Mapping {
                handle: *handle,
                ctx_id: ctx.id,
                refs: 1,
            },
        );
        Ok(ptr)
    }

    fn close_ipc_handle(&self, ctx: &MockContext, ptr: DevicePtr) -> Result<(), DriverError> {
        let mut st = self.state.lock();
        st.enter(MockCall::CloseIpcHandle)?;
        let targeted = st
            .pending
            .iter()
            .any(|l| l.ctx_id == ctx.id && (l.src == ptr || l.dst == ptr));
        let mapping = st
            .mappings
            .get_mut(&ptr)
            .filter(|m| m.ctx_id == ctx.id)
            .ok_or_else(|| err(MockCall::CloseIpcHandle, CUDA_ERROR_INVALID_VALUE))?;
        mapping.refs -= 1;
        if mapping.refs == 0 {
            st.mappings.remove(&ptr);
            if targeted {
                st.closed_in_flight += 1;
            }
        }
        Ok(())
    }

    fn launch_cumsum(
        &self,
        ctx: &MockContext,
        dtype: DType,
        src: DevicePtr,
        dst: DevicePtr,
        len: usize,
    ) -> Result<(), DriverError> {
        let mut st = self.state.lock();
        st.enter(MockCall::LaunchCumsum)?;
        if !dtype.supports_cumsum() {
            return Err(err(MockCall::LaunchCumsum, CUDA_ERROR_NOT_SUPPORTED));
        }
        if st.mapping_in(ctx.id, src).is_none() || st.mapping_in(ctx.id, dst).is_none() {
            return Err(err(MockCall::LaunchCumsum, CUDA_ERROR_INVALID_VALUE));
        }
        st.pending.push(Launch {
            ctx_id: ctx.id,
            dtype,
            src,
            dst,
            len,
        });
        Ok(())
    }

    fn synchronize(&self, ctx: &MockContext) -> Result<(), DriverError> {
        let mut st = self.state.lock();
        st.enter(MockCall::Synchronize)?;

        let (mine, others): (Vec<_>, Vec<_>) =
            st.pending.drain(..).partition(|l| l.ctx_id == ctx.id);
        st.pending = others;

        for launch in &mine {
            // out-of-bounds or unmapped memory faults the context
            st.apply(launch)
                .map_err(|()| err(MockCall::Synchronize, CUDA_ERROR_ILLEGAL_ADDRESS))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_sum_reference() {
        let input: Vec<u8> = [1i32, 2, 3, 4].iter().flat_map(|v| v.to_le_bytes()).collect();
        let out = prefix_sum(DType::Int32, &input, 4).unwrap();
        let got: Vec<i32> = out
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(got, vec![1, 3, 6, 10]);
    }

    #[test]
    fn test_prefix_sum_wraps_integers() {
        let out = prefix_sum(DType::UInt8, &[200, 100, 1], 3).unwrap();
        assert_eq!(out, vec![200, 44, 45]);
    }

    #[test]
    fn test_prefix_sum_respects_len() {
        let out = prefix_sum(DType::UInt8, &[1, 1, 1, 1], 2).unwrap();
        assert_eq!(out, vec![1, 2]);
        assert!(prefix_sum(DType::UInt16, &[1, 0], 2).is_none());
        assert!(prefix_sum(DType::Float16, &[0; 4], 2).is_none());
    }

    #[test]
    fn test_open_same_handle_twice_is_refcounted() {
        let driver = MockDriver::with_devices(1);
        driver.init().unwrap();
        let ctx = driver.create_context(0).unwrap();
        let handle = driver.export(0, vec![0; 4]);

        let a = driver.open_ipc_handle(&ctx, &handle, IpcOpenFlags::NONE).unwrap();
        let b = driver.open_ipc_handle(&ctx, &handle, IpcOpenFlags::NONE).unwrap();
        assert_eq!(a, b);
        driver.close_ipc_handle(&ctx, a).unwrap();
        assert_eq!(driver.live_mappings(), 1);
        driver.close_ipc_handle(&ctx, b).unwrap();
        assert_eq!(driver.live_mappings(), 0);
        assert!(driver.close_ipc_handle(&ctx, a).is_err());
    }

    #[test]
    fn test_sync_after_revoke_faults() {
        let driver = MockDriver::with_devices(1);
        driver.init().unwrap();
        let ctx = driver.create_context(0).unwrap();
        let handle = driver.export(0, vec![0; 4]);
        let ptr = driver.open_ipc_handle(&ctx, &handle, IpcOpenFlags::NONE).unwrap();

        driver.launch_cumsum(&ctx, DType::Float32, ptr, ptr, 1).unwrap();
        assert!(driver.revoke(&handle));
        let e = driver.synchronize(&ctx).unwrap_err();
        assert_eq!(e.code, CUDA_ERROR_ILLEGAL_ADDRESS);
        assert_eq!(e.name, "CUDA_ERROR_ILLEGAL_ADDRESS");
    }

    #[test]
    fn test_close_under_queued_launch_is_recorded() {
        let driver = MockDriver::with_devices(1);
        driver.init().unwrap();
        let ctx = driver.create_context(0).unwrap();
        let handle = driver.export(0, vec![1; 4]);
        let ptr = driver.open_ipc_handle(&ctx, &handle, IpcOpenFlags::NONE).unwrap();

        driver.launch_cumsum(&ctx, DType::UInt8, ptr, ptr, 4).unwrap();
        driver.close_ipc_handle(&ctx, ptr).unwrap();
        assert_eq!(driver.mappings_closed_in_flight(), 1);
        assert!(driver.synchronize(&ctx).is_err());
        assert_eq!(driver.read_export(&handle).unwrap(), vec![1; 4]);
    }

    #[test]
    fn test_device_count_requires_init() {
        let driver = MockDriver::with_devices(1);
        assert_eq!(driver.device_count().unwrap_err().code, CUDA_ERROR_NOT_INITIALIZED);
    }
}
