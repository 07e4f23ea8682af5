//! Acceleration backend plumbing.
//!
//! - [`ffi`]: C ABI of libcufile
//! - [`driver`]: the driver trait, libcufile binding and POSIX emulation
//! - [`shim`]: one-time capability discovery with captured failure
//! - [`policy`]: off / optional / required enablement and config rewrite

pub mod driver;
pub mod ffi;
pub mod policy;
pub mod shim;
