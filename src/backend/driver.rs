//! Backend drivers: the table of calls the transfer engines dispatch through.
//!
//! [`CufileLibrary`] binds libcufile at run time. [`PosixDriver`] implements the
//! same contract with positional host I/O so the engines can run where no GDS
//! stack is installed (device pointers are then host pointers, see
//! [`HostMemory`](crate::gpu::allocator::HostMemory)).

use std::ffi::{c_int, c_void};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use libloading::Library;
use tracing::{debug, info};

use crate::backend::ffi::{
    self, CUfileDescr, CUfileHandle, CUfileHandleUnion, CU_FILE_HANDLE_TYPE_OPAQUE_FD,
    CU_FILE_SUCCESS,
};
use crate::backend::shim::ShimError;
use crate::gpu::allocator::DevicePtr;

/// Library names tried, in order, when loading libcufile.
pub const CUFILE_LIBRARY_NAMES: &[&str] = &["libcufile.so", "libcufile.so.0"];

/// Opaque per-file handle returned by [`BackendDriver::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendHandle(usize);

impl BackendHandle {
    pub fn from_raw(raw: *mut c_void) -> Self {
        Self(raw as usize)
    }

    pub fn as_raw(self) -> *mut c_void {
        self.0 as *mut c_void
    }
}

/// Calls the chunked engines need from an acceleration backend.
///
/// `read` and `write` follow the cuFile convention: the number of bytes moved,
/// or a negative value on failure.
pub trait BackendDriver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Register an open descriptor. Errors carry the backend's status code.
    fn register(&self, fd: RawFd) -> Result<BackendHandle, i32>;

    fn deregister(&self, handle: BackendHandle);

    /// # Safety
    /// `dst` must be valid for writes of `size` bytes until the call returns.
    unsafe fn read(
        &self,
        handle: BackendHandle,
        dst: DevicePtr,
        size: usize,
        file_offset: u64,
    ) -> isize;

    /// # Safety
    /// `src` must be valid for reads of `size` bytes until the call returns.
    unsafe fn write(
        &self,
        handle: BackendHandle,
        src: DevicePtr,
        size: usize,
        file_offset: u64,
    ) -> isize;

    /// Close the driver. Called once at teardown; later calls are no-ops.
    fn shutdown(&self) {}
}

/// Produces the driver a [`CapabilityShim`](crate::backend::shim::CapabilityShim) wraps.
pub trait DriverLoader: Send + Sync {
    fn load(&self) -> Result<Arc<dyn BackendDriver>, ShimError>;
}

impl<F> DriverLoader for F
where
    F: Fn() -> Result<Arc<dyn BackendDriver>, ShimError> + Send + Sync,
{
    fn load(&self) -> Result<Arc<dyn BackendDriver>, ShimError> {
        self()
    }
}

/// Open the first library in `names` that the dynamic loader can find.
pub(crate) fn open_first(
    names: &[&'static str],
) -> Result<(Library, &'static str), libloading::Error> {
    let mut last_err = None;
    for &name in names {
        // SAFETY: loading runs the library's initialisers; the CUDA libraries
        // gds-io loads have no initialisers with preconditions.
        match unsafe { Library::new(name) } {
            Ok(lib) => return Ok((lib, name)),
            Err(e) => {
                debug!(library = name, error = %e, "Library not loadable");
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or(libloading::Error::DlOpenUnknown))
}

/// libcufile bound at run time, with the driver opened.
pub struct CufileLibrary {
    driver_close: ffi::DriverCloseFn,
    handle_register: ffi::HandleRegisterFn,
    handle_deregister: ffi::HandleDeregisterFn,
    read: ffi::ReadFn,
    write: ffi::WriteFn,
    closed: AtomicBool,
    _lib: Library,
}

impl CufileLibrary {
    /// Load libcufile, resolve every entry point and open the driver.
    pub fn load() -> Result<Self, ShimError> {
        Self::load_from(CUFILE_LIBRARY_NAMES)
    }

    /// [`load`](Self::load) from the first loadable library in `names`.
    pub fn load_from(names: &[&'static str]) -> Result<Self, ShimError> {
        let (lib, name) =
            open_first(names).map_err(|e| ShimError::LibraryLoad(e.to_string()))?;

        // SAFETY: the function types mirror the declarations in cufile.h.
        let (driver_open, driver) = unsafe {
            let driver_open: ffi::DriverOpenFn = resolve(&lib, "cuFileDriverOpen")?;
            let driver = Self {
                driver_close: resolve(&lib, "cuFileDriverClose")?,
                handle_register: resolve(&lib, "cuFileHandleRegister")?,
                handle_deregister: resolve(&lib, "cuFileHandleDeregister")?,
                read: resolve(&lib, "cuFileRead")?,
                write: resolve(&lib, "cuFileWrite")?,
                closed: AtomicBool::new(false),
                _lib: lib,
            };
            (driver_open, driver)
        };

        // SAFETY: resolved above; takes no arguments.
        let status = unsafe { driver_open() };
        if status.err != CU_FILE_SUCCESS {
            // Never opened, so there is nothing to close.
            driver.closed.store(true, Ordering::Release);
            return Err(ShimError::DriverInit { code: status.err });
        }

        info!(library = name, "cuFile driver opened");
        Ok(driver)
    }
}

unsafe fn resolve<T: Copy>(lib: &Library, symbol: &'static str) -> Result<T, ShimError> {
    let mut name = Vec::with_capacity(symbol.len() + 1);
    name.extend_from_slice(symbol.as_bytes());
    name.push(0);
    lib.get::<T>(&name)
        .map(|sym| *sym)
        .map_err(|e| ShimError::SymbolResolution {
            symbol,
            reason: e.to_string(),
        })
}

impl BackendDriver for CufileLibrary {
    fn name(&self) -> &'static str {
        "cufile"
    }

    fn register(&self, fd: RawFd) -> Result<BackendHandle, i32> {
        let mut descr = CUfileDescr {
            type_: CU_FILE_HANDLE_TYPE_OPAQUE_FD,
            handle: CUfileHandleUnion { fd: fd as c_int },
            fs_ops: std::ptr::null(),
        };
        let mut handle: CUfileHandle = std::ptr::null_mut();
        // SAFETY: both out-pointers are valid for the duration of the call.
        let status = unsafe { (self.handle_register)(&mut handle, &mut descr) };
        if status.err == CU_FILE_SUCCESS {
            Ok(BackendHandle::from_raw(handle))
        } else {
            Err(status.err)
        }
    }

    fn deregister(&self, handle: BackendHandle) {
        // SAFETY: `handle` came from a successful register call.
        unsafe { (self.handle_deregister)(handle.as_raw()) }
    }

    unsafe fn read(
        &self,
        handle: BackendHandle,
        dst: DevicePtr,
        size: usize,
        file_offset: u64,
    ) -> isize {
        (self.read)(handle.as_raw(), dst.as_raw(), size, file_offset as libc::off_t, 0)
    }

    unsafe fn write(
        &self,
        handle: BackendHandle,
        src: DevicePtr,
        size: usize,
        file_offset: u64,
    ) -> isize {
        (self.write)(handle.as_raw(), src.as_raw(), size, file_offset as libc::off_t, 0)
    }

    fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            // SAFETY: the driver was opened in `load` and is closed only here.
            let status = unsafe { (self.driver_close)() };
            debug!(status = status.err, "cuFile driver closed");
        }
    }
}

impl Drop for CufileLibrary {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Loads [`CufileLibrary`].
#[derive(Debug, Default, Clone, Copy)]
pub struct CufileLoader;

impl DriverLoader for CufileLoader {
    fn load(&self) -> Result<Arc<dyn BackendDriver>, ShimError> {
        Ok(Arc::new(CufileLibrary::load()?))
    }
}

/// Backend emulation over `pread`/`pwrite` into host memory.
#[derive(Debug, Default)]
pub struct PosixDriver {
    registered: AtomicUsize,
}

impl PosixDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of descriptors currently registered.
    pub fn registered(&self) -> usize {
        self.registered.load(Ordering::Acquire)
    }
}

impl BackendDriver for PosixDriver {
    fn name(&self) -> &'static str {
        "posix"
    }

    fn register(&self, fd: RawFd) -> Result<BackendHandle, i32> {
        if fd < 0 {
            return Err(libc::EBADF);
        }
        self.registered.fetch_add(1, Ordering::AcqRel);
        Ok(BackendHandle(fd as usize))
    }

    fn deregister(&self, _handle: BackendHandle) {
        self.registered.fetch_sub(1, Ordering::AcqRel);
    }

    unsafe fn read(
        &self,
        handle: BackendHandle,
        dst: DevicePtr,
        size: usize,
        file_offset: u64,
    ) -> isize {
        let fd = handle.0 as RawFd;
        let mut done = 0usize;
        while done < size {
            let n = libc::pread(
                fd,
                dst.add(done).as_raw(),
                size - done,
                (file_offset + done as u64) as libc::off_t,
            );
            if n < 0 {
                if std::io::Error::last_os_error().kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return -1;
            }
            if n == 0 {
                break;
            }
            done += n as usize;
        }
        done as isize
    }

    unsafe fn write(
        &self,
        handle: BackendHandle,
        src: DevicePtr,
        size: usize,
        file_offset: u64,
    ) -> isize {
        let fd = handle.0 as RawFd;
        let mut done = 0usize;
        while done < size {
            let n = libc::pwrite(
                fd,
                src.add(done).as_raw(),
                size - done,
                (file_offset + done as u64) as libc::off_t,
            );
            if n < 0 {
                if std::io::Error::last_os_error().kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return -1;
            }
            if n == 0 {
                break;
            }
            done += n as usize;
        }
        done as isize
    }
}

/// Loads a fresh [`PosixDriver`].
#[derive(Debug, Default, Clone, Copy)]
pub struct PosixLoader;

impl DriverLoader for PosixLoader {
    fn load(&self) -> Result<Arc<dyn BackendDriver>, ShimError> {
        Ok(Arc::new(PosixDriver::new()))
    }
}
