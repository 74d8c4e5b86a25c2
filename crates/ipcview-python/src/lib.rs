//! Python bindings for ipcview
//!
//! `ipcview.open(handle, typestr, length)` maps exported device memory and
//! returns an object implementing `__cuda_array_interface__`, so torch, cupy
//! or numba can wrap it without copying.

#[cfg(not(feature = "cuda"))]
use pyo3::exceptions::PyRuntimeError;
use pyo3::prelude::*;

#[cfg(feature = "cuda")]
mod cuda_array {
    use ipcview_core::{
        CudaDriver, DeviceContext, IpcHandleResolver, IpcOpenFlags, OperationExecutor,
        SyncPolicy, TypedBufferView,
    };
    use pyo3::exceptions::PyRuntimeError;
    use pyo3::prelude::*;
    use pyo3::types::{PyDict, PyTuple};
    use std::cell::RefCell;
    use std::collections::HashMap;

    /// Convert ipcview error to Python exception
    fn to_py_err(e: ipcview_core::Error) -> PyErr {
        PyRuntimeError::new_err(e.to_string())
    }

    fn closed() -> PyErr {
        PyRuntimeError::new_err("IpcArray is closed")
    }

    thread_local! {
        /// One context per device for every array opened on this thread
        static CONTEXTS: RefCell<HashMap<usize, DeviceContext<CudaDriver>>> =
            RefCell::new(HashMap::new());
    }

    fn context(device: usize) -> PyResult<DeviceContext<CudaDriver>> {
        CONTEXTS.with(|contexts| {
            let mut contexts = contexts.borrow_mut();
            if let Some(ctx) = contexts.get(&device) {
                return Ok(ctx.clone());
            }
            let ctx = DeviceContext::initialize(CudaDriver::new(), device).map_err(to_py_err)?;
            contexts.insert(device, ctx.clone());
            Ok(ctx)
        })
    }

    /// Exported device memory viewed as a typed 1-D array
    ///
    /// The IPC mapping stays open until `close()` or garbage collection.
    #[pyclass(unsendable)]
    pub struct IpcArray {
        view: Option<TypedBufferView<CudaDriver>>,
    }

    impl IpcArray {
        fn view(&self) -> PyResult<&TypedBufferView<CudaDriver>> {
            self.view.as_ref().ok_or_else(closed)
        }
    }

    #[pymethods]
    impl IpcArray {
        #[getter]
        fn __cuda_array_interface__(&self, py: Python<'_>) -> PyResult<PyObject> {
            let cai = self.view()?.array_interface();
            let dict = PyDict::new(py);
            dict.set_item("shape", PyTuple::new(py, &cai.shape))?;
            dict.set_item("typestr", &cai.typestr)?;
            dict.set_item("data", cai.data)?;
            dict.set_item("strides", cai.strides.map(|s| PyTuple::new(py, s)))?;
            dict.set_item("mask", py.None())?;
            dict.set_item("stream", py.None())?;
            dict.set_item("version", cai.version)?;
            Ok(dict.to_object(py))
        }

        #[getter]
        fn shape(&self) -> PyResult<(usize,)> {
            Ok((self.view()?.len(),))
        }

        #[getter]
        fn typestr(&self) -> PyResult<String> {
            Ok(self.view()?.typestr())
        }

        #[getter]
        fn device(&self) -> PyResult<usize> {
            Ok(self.view()?.device_id())
        }

        #[getter]
        fn ptr(&self) -> PyResult<u64> {
            Ok(self.view()?.device_ptr())
        }

        /// In-place prefix sum; returns after the device has finished
        fn cumsum_(&mut self) -> PyResult<()> {
            let view = self.view.as_mut().ok_or_else(closed)?;
            let ctx = view.context().clone();
            OperationExecutor::new(&ctx, SyncPolicy::Hardened)
                .cumsum_in_place(view)
                .map_err(to_py_err)?;
            Ok(())
        }

        /// Close the IPC mapping
        fn close(&mut self) -> PyResult<()> {
            match self.view.take() {
                Some(view) => view.into_buffer().close().map_err(to_py_err),
                None => Ok(()),
            }
        }

        fn __repr__(&self) -> String {
            match &self.view {
                Some(v) => format!(
                    "IpcArray(ptr={:#x}, shape=({},), typestr={:?}, device={})",
                    v.device_ptr(),
                    v.len(),
                    v.typestr(),
                    v.device_id()
                ),
                None => "IpcArray(closed)".to_string(),
            }
        }
    }

    /// Map an exported allocation and view it as `length` elements of `typestr`
    #[pyfunction]
    #[pyo3(signature = (handle, typestr, length, device = 0, lazy_peer_access = false))]
    pub fn open(
        handle: &str,
        typestr: &str,
        length: usize,
        device: usize,
        lazy_peer_access: bool,
    ) -> PyResult<IpcArray> {
        let handle = ipcview_core::IpcMemHandle::from_hex(handle).map_err(to_py_err)?;
        let flags = if lazy_peer_access {
            IpcOpenFlags::LAZY_ENABLE_PEER_ACCESS
        } else {
            IpcOpenFlags::NONE
        };

        let ctx = context(device)?;
        let buf = IpcHandleResolver::new(&ctx)
            .with_flags(flags)
            .open_handle(&handle)
            .map_err(to_py_err)?;
        let view = TypedBufferView::new(buf, typestr, length).map_err(to_py_err)?;
        Ok(IpcArray { view: Some(view) })
    }
}

/// Stand-in when built without CUDA: validates arguments, then fails
#[cfg(not(feature = "cuda"))]
#[pyfunction]
#[pyo3(signature = (handle, typestr, length, device = 0, lazy_peer_access = false))]
fn open(
    handle: &str,
    typestr: &str,
    length: usize,
    device: usize,
    lazy_peer_access: bool,
) -> PyResult<()> {
    let _ = (length, device, lazy_peer_access);
    ipcview_core::IpcMemHandle::from_hex(handle)
        .map_err(|e| PyRuntimeError::new_err(e.to_string()))?;
    ipcview_core::DType::parse_typestr(typestr)
        .map_err(|e| PyRuntimeError::new_err(e.to_string()))?;
    Err(PyRuntimeError::new_err(
        "ipcview was built without the `cuda` feature",
    ))
}

#[cfg(feature = "cuda")]
use cuda_array::{open, IpcArray};

#[pymodule]
fn ipcview(_py: Python, m: &PyModule) -> PyResult<()> {
    #[cfg(feature = "cuda")]
    m.add_class::<IpcArray>()?;
    m.add_function(wrap_pyfunction!(open, m)?)?;
    Ok(())
}
