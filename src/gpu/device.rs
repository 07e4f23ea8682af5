//! Device context: which compute device the current thread targets.
//!
//! The CUDA runtime keeps the active device per thread, so pool workers do not
//! inherit it from whoever queued the work. Transfer code captures the id on
//! the dispatching thread and re-establishes it inside every task through the
//! [`DeviceContext`] trait.

use std::cell::Cell;
use std::ffi::{c_int, c_void};
use std::sync::{Arc, OnceLock};

use libloading::Library;
use thiserror::Error;
use tracing::info;

use crate::backend::driver::open_first;

/// Index of a compute device as understood by the CUDA runtime.
pub type DeviceId = i32;

#[derive(Error, Debug, Clone)]
pub enum DeviceError {
    #[error("CUDA runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("{call} failed with CUDA error {code}")]
    Cuda { call: &'static str, code: i32 },
}

/// Reads and pins the calling thread's active device.
pub trait DeviceContext: Send + Sync {
    fn current_device(&self) -> Result<DeviceId, DeviceError>;

    fn set_device(&self, device: DeviceId) -> Result<(), DeviceError>;
}

thread_local! {
    static HOST_DEVICE: Cell<DeviceId> = const { Cell::new(0) };
}

/// Per-thread device id without any hardware behind it.
///
/// Mirrors the runtime's thread-local semantics so that code paths which must
/// re-pin the device on worker threads are exercised on machines without a GPU.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostDeviceContext;

impl HostDeviceContext {
    /// The id pinned on the calling thread.
    pub fn current() -> DeviceId {
        HOST_DEVICE.with(|d| d.get())
    }
}

impl DeviceContext for HostDeviceContext {
    fn current_device(&self) -> Result<DeviceId, DeviceError> {
        Ok(Self::current())
    }

    fn set_device(&self, device: DeviceId) -> Result<(), DeviceError> {
        HOST_DEVICE.with(|d| d.set(device));
        Ok(())
    }
}

const CUDART_NAMES: &[&str] = &["libcudart.so", "libcudart.so.12", "libcudart.so.11.0"];

pub(crate) const MEMCPY_HOST_TO_DEVICE: c_int = 1;
pub(crate) const MEMCPY_DEVICE_TO_HOST: c_int = 2;
pub(crate) const MEMCPY_DEVICE_TO_DEVICE: c_int = 3;

type GetDeviceFn = unsafe extern "C" fn(*mut c_int) -> c_int;
type SetDeviceFn = unsafe extern "C" fn(c_int) -> c_int;
type MallocFn = unsafe extern "C" fn(*mut *mut c_void, usize) -> c_int;
type FreeFn = unsafe extern "C" fn(*mut c_void) -> c_int;
type MemcpyFn = unsafe extern "C" fn(*mut c_void, *const c_void, usize, c_int) -> c_int;

/// Entry points of `libcudart` bound at run time.
pub struct CudaRuntime {
    get_device: GetDeviceFn,
    set_device: SetDeviceFn,
    malloc: MallocFn,
    free: FreeFn,
    memcpy: MemcpyFn,
    _lib: Library,
}

impl CudaRuntime {
    /// Load the CUDA runtime library and resolve the calls gds-io needs.
    pub fn load() -> Result<Self, DeviceError> {
        let (lib, name) =
            open_first(CUDART_NAMES).map_err(|e| DeviceError::RuntimeUnavailable(e.to_string()))?;

        // SAFETY: the signatures match the CUDA runtime API declarations.
        let runtime = unsafe {
            Self {
                get_device: resolve(&lib, b"cudaGetDevice\0")?,
                set_device: resolve(&lib, b"cudaSetDevice\0")?,
                malloc: resolve(&lib, b"cudaMalloc\0")?,
                free: resolve(&lib, b"cudaFree\0")?,
                memcpy: resolve(&lib, b"cudaMemcpy\0")?,
                _lib: lib,
            }
        };

        info!(library = name, "CUDA runtime loaded");
        Ok(runtime)
    }

    pub(crate) fn malloc(&self, size: usize) -> Result<*mut c_void, DeviceError> {
        let mut ptr = std::ptr::null_mut();
        // SAFETY: `ptr` is a valid out-parameter.
        check("cudaMalloc", unsafe { (self.malloc)(&mut ptr, size) })?;
        Ok(ptr)
    }

    /// # Safety
    /// `ptr` must come from [`CudaRuntime::malloc`] and not be freed twice.
    pub(crate) unsafe fn device_free(&self, ptr: *mut c_void) -> Result<(), DeviceError> {
        check("cudaFree", (self.free)(ptr))
    }

    /// # Safety
    /// Both pointers must be valid for `len` bytes in the spaces `kind` names.
    pub(crate) unsafe fn memcpy(
        &self,
        dst: *mut c_void,
        src: *const c_void,
        len: usize,
        kind: c_int,
    ) -> Result<(), DeviceError> {
        check("cudaMemcpy", (self.memcpy)(dst, src, len, kind))
    }
}

impl DeviceContext for CudaRuntime {
    fn current_device(&self) -> Result<DeviceId, DeviceError> {
        let mut device: c_int = 0;
        // SAFETY: `device` is a valid out-parameter.
        check("cudaGetDevice", unsafe { (self.get_device)(&mut device) })?;
        Ok(device)
    }

    fn set_device(&self, device: DeviceId) -> Result<(), DeviceError> {
        // SAFETY: plain value argument.
        check("cudaSetDevice", unsafe { (self.set_device)(device) })
    }
}

static CUDA_RUNTIME: OnceLock<Option<Arc<CudaRuntime>>> = OnceLock::new();

/// The process's CUDA runtime, loaded on first call; `None` when not installed.
pub fn cuda_runtime() -> Option<Arc<CudaRuntime>> {
    CUDA_RUNTIME
        .get_or_init(|| match CudaRuntime::load() {
            Ok(runtime) => Some(Arc::new(runtime)),
            Err(e) => {
                info!(error = %e, "No CUDA runtime, device buffers live in host memory");
                None
            }
        })
        .clone()
}

unsafe fn resolve<T: Copy>(lib: &Library, symbol: &[u8]) -> Result<T, DeviceError> {
    lib.get::<T>(symbol)
        .map(|sym| *sym)
        .map_err(|e| DeviceError::RuntimeUnavailable(e.to_string()))
}

fn check(call: &'static str, code: c_int) -> Result<(), DeviceError> {
    if code == 0 {
        Ok(())
    } else {
        Err(DeviceError::Cuda { call, code })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_context_is_per_thread() {
        let ctx = HostDeviceContext;
        ctx.set_device(3).unwrap();
        assert_eq!(ctx.current_device().unwrap(), 3);

        let other = std::thread::spawn(|| HostDeviceContext.current_device().unwrap())
            .join()
            .unwrap();
        assert_eq!(other, 0);
        assert_eq!(HostDeviceContext::current(), 3);
    }

    #[test]
    fn test_check_maps_codes() {
        assert!(check("cudaSetDevice", 0).is_ok());
        let err = check("cudaSetDevice", 101).unwrap_err();
        assert!(err.to_string().contains("cudaSetDevice"));
    }
}
