//! C ABI of libcufile, limited to what gds-io calls.

use std::ffi::{c_int, c_void};

/// `CUfileOpError` value reported on success.
pub const CU_FILE_SUCCESS: c_int = 0;

/// `CUfileFileHandleType` for a plain POSIX descriptor.
pub const CU_FILE_HANDLE_TYPE_OPAQUE_FD: c_int = 1;

/// `CUfileError_t`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CUfileError {
    pub err: c_int,
    pub cu_err: c_int,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union CUfileHandleUnion {
    pub fd: c_int,
    pub handle: *mut c_void,
}

/// `CUfileDescr_t`.
#[repr(C)]
pub struct CUfileDescr {
    pub type_: c_int,
    pub handle: CUfileHandleUnion,
    pub fs_ops: *const c_void,
}

/// `CUfileHandle_t`, an opaque pointer owned by the driver.
pub type CUfileHandle = *mut c_void;

pub type DriverOpenFn = unsafe extern "C" fn() -> CUfileError;
pub type DriverCloseFn = unsafe extern "C" fn() -> CUfileError;
pub type HandleRegisterFn =
    unsafe extern "C" fn(fh: *mut CUfileHandle, descr: *mut CUfileDescr) -> CUfileError;
pub type HandleDeregisterFn = unsafe extern "C" fn(fh: CUfileHandle);
pub type ReadFn = unsafe extern "C" fn(
    fh: CUfileHandle,
    buf_ptr_base: *mut c_void,
    size: usize,
    file_offset: libc::off_t,
    buf_ptr_offset: libc::off_t,
) -> libc::ssize_t;
pub type WriteFn = unsafe extern "C" fn(
    fh: CUfileHandle,
    buf_ptr_base: *const c_void,
    size: usize,
    file_offset: libc::off_t,
    buf_ptr_offset: libc::off_t,
) -> libc::ssize_t;
