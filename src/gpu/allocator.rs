//! Device memory allocation.
//!
//! Transfers land in memory owned by a [`DeviceBuffer`]. Where that memory lives
//! is decided by the [`DeviceMemory`] implementation behind the
//! [`DeviceAllocator`]: `cudaMalloc` on a GPU machine, page-aligned host memory
//! otherwise.

use std::alloc::{self, Layout};
use std::ffi::c_void;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::gpu::device::{
    CudaRuntime, DeviceError, MEMCPY_DEVICE_TO_DEVICE, MEMCPY_DEVICE_TO_HOST,
    MEMCPY_HOST_TO_DEVICE,
};

/// Alignment of host allocations; satisfies O_DIRECT on common block devices.
pub const HOST_ALIGNMENT: usize = 4096;

#[derive(Error, Debug, Clone)]
pub enum AllocatorError {
    #[error("Device allocation of {size} bytes failed: {source}")]
    AllocationFailed {
        size: usize,
        #[source]
        source: DeviceError,
    },

    #[error("Host allocation of {0} bytes failed")]
    HostOutOfMemory(usize),

    #[error("Memory copy failed: {0}")]
    Copy(#[from] DeviceError),

    #[error("Range {offset}+{len} exceeds buffer of {size} bytes")]
    OutOfBounds { offset: usize, len: usize, size: usize },
}

/// Address in device memory.
///
/// Plain integer so it can be handed to worker threads; whoever dereferences it
/// is responsible for the allocation still being alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DevicePtr(usize);

impl DevicePtr {
    pub const fn null() -> Self {
        Self(0)
    }

    pub fn from_raw(ptr: *mut c_void) -> Self {
        Self(ptr as usize)
    }

    pub fn as_raw(self) -> *mut c_void {
        self.0 as *mut c_void
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Address `bytes` past this one.
    pub fn add(self, bytes: usize) -> Self {
        Self(self.0 + bytes)
    }
}

/// Raw allocation and copy primitives of one memory space.
pub trait DeviceMemory: Send + Sync {
    fn alloc(&self, size: usize) -> Result<DevicePtr, AllocatorError>;

    /// # Safety
    /// `ptr` must come from `alloc(size)` on this memory and not be used afterwards.
    unsafe fn free(&self, ptr: DevicePtr, size: usize);

    /// # Safety
    /// `dst` must be valid for `src.len()` bytes.
    unsafe fn copy_to_device(&self, dst: DevicePtr, src: &[u8]) -> Result<(), AllocatorError>;

    /// # Safety
    /// `src` must be valid for `dst.len()` bytes.
    unsafe fn copy_to_host(&self, dst: &mut [u8], src: DevicePtr) -> Result<(), AllocatorError>;

    /// # Safety
    /// Both ranges must be valid for `len` bytes and must not overlap.
    unsafe fn copy_device(
        &self,
        dst: DevicePtr,
        src: DevicePtr,
        len: usize,
    ) -> Result<(), AllocatorError>;
}

/// Page-aligned host memory standing in for device memory.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostMemory;

impl HostMemory {
    fn layout(size: usize) -> Result<Layout, AllocatorError> {
        Layout::from_size_align(size, HOST_ALIGNMENT)
            .map_err(|_| AllocatorError::HostOutOfMemory(size))
    }
}

impl DeviceMemory for HostMemory {
    fn alloc(&self, size: usize) -> Result<DevicePtr, AllocatorError> {
        if size == 0 {
            return Ok(DevicePtr::null());
        }
        let layout = Self::layout(size)?;
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(AllocatorError::HostOutOfMemory(size));
        }
        Ok(DevicePtr::from_raw(ptr.cast()))
    }

    unsafe fn free(&self, ptr: DevicePtr, size: usize) {
        if ptr.is_null() || size == 0 {
            return;
        }
        if let Ok(layout) = Self::layout(size) {
            alloc::dealloc(ptr.as_raw().cast(), layout);
        }
    }

    unsafe fn copy_to_device(&self, dst: DevicePtr, src: &[u8]) -> Result<(), AllocatorError> {
        if !src.is_empty() {
            std::ptr::copy_nonoverlapping(src.as_ptr(), dst.as_raw().cast::<u8>(), src.len());
        }
        Ok(())
    }

    unsafe fn copy_to_host(&self, dst: &mut [u8], src: DevicePtr) -> Result<(), AllocatorError> {
        if !dst.is_empty() {
            std::ptr::copy_nonoverlapping(src.as_raw().cast::<u8>(), dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }

    unsafe fn copy_device(
        &self,
        dst: DevicePtr,
        src: DevicePtr,
        len: usize,
    ) -> Result<(), AllocatorError> {
        if len > 0 {
            std::ptr::copy_nonoverlapping(
                src.as_raw().cast::<u8>(),
                dst.as_raw().cast::<u8>(),
                len,
            );
        }
        Ok(())
    }
}

impl DeviceMemory for CudaRuntime {
    fn alloc(&self, size: usize) -> Result<DevicePtr, AllocatorError> {
        if size == 0 {
            return Ok(DevicePtr::null());
        }
        self.malloc(size)
            .map(DevicePtr::from_raw)
            .map_err(|source| AllocatorError::AllocationFailed { size, source })
    }

    unsafe fn free(&self, ptr: DevicePtr, _size: usize) {
        if ptr.is_null() {
            return;
        }
        if let Err(e) = self.device_free(ptr.as_raw()) {
            tracing::warn!(error = %e, "cudaFree failed");
        }
    }

    unsafe fn copy_to_device(&self, dst: DevicePtr, src: &[u8]) -> Result<(), AllocatorError> {
        self.memcpy(dst.as_raw(), src.as_ptr().cast(), src.len(), MEMCPY_HOST_TO_DEVICE)?;
        Ok(())
    }

    unsafe fn copy_to_host(&self, dst: &mut [u8], src: DevicePtr) -> Result<(), AllocatorError> {
        self.memcpy(
            dst.as_mut_ptr().cast(),
            src.as_raw(),
            dst.len(),
            MEMCPY_DEVICE_TO_HOST,
        )?;
        Ok(())
    }

    unsafe fn copy_device(
        &self,
        dst: DevicePtr,
        src: DevicePtr,
        len: usize,
    ) -> Result<(), AllocatorError> {
        self.memcpy(dst.as_raw(), src.as_raw(), len, MEMCPY_DEVICE_TO_DEVICE)?;
        Ok(())
    }
}

/// Owned allocation in a [`DeviceMemory`] space, released on drop.
pub struct DeviceBuffer {
    ptr: DevicePtr,
    len: usize,
    capacity: usize,
    memory: Arc<dyn DeviceMemory>,
}

impl DeviceBuffer {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn as_ptr(&self) -> DevicePtr {
        self.ptr
    }

    /// Copy the buffer's contents back to host memory.
    pub fn to_host(&self) -> Result<Vec<u8>, AllocatorError> {
        let mut out = vec![0u8; self.len];
        // SAFETY: `ptr` is valid for `len` bytes while `self` is alive.
        unsafe { self.memory.copy_to_host(&mut out, self.ptr)? };
        Ok(out)
    }

    /// Overwrite `data.len()` bytes starting at `offset`.
    pub fn copy_from_host(&mut self, offset: usize, data: &[u8]) -> Result<(), AllocatorError> {
        let end = offset.checked_add(data.len()).filter(|&end| end <= self.len);
        if end.is_none() {
            return Err(AllocatorError::OutOfBounds {
                offset,
                len: data.len(),
                size: self.len,
            });
        }
        // SAFETY: range checked against `len` above.
        unsafe { self.memory.copy_to_device(self.ptr.add(offset), data) }
    }
}

impl std::fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        // SAFETY: `ptr` was allocated with `capacity` bytes by `memory`.
        unsafe { self.memory.free(self.ptr, self.capacity) };
    }
}

/// Hands out [`DeviceBuffer`]s from one memory space.
#[derive(Clone)]
pub struct DeviceAllocator {
    memory: Arc<dyn DeviceMemory>,
}

impl DeviceAllocator {
    pub fn new(memory: Arc<dyn DeviceMemory>) -> Self {
        Self { memory }
    }

    /// Allocator backed by [`HostMemory`].
    pub fn host() -> Self {
        Self::new(Arc::new(HostMemory))
    }

    /// Allocate `size` bytes.
    pub fn allocate(&self, size: usize) -> Result<DeviceBuffer, AllocatorError> {
        let ptr = self.memory.alloc(size)?;
        debug!(size, "Allocated device buffer");
        Ok(DeviceBuffer {
            ptr,
            len: size,
            capacity: size,
            memory: self.memory.clone(),
        })
    }

    /// Allocate a buffer holding a copy of `data`.
    pub fn upload(&self, data: &[u8]) -> Result<DeviceBuffer, AllocatorError> {
        let mut buffer = self.allocate(data.len())?;
        buffer.copy_from_host(0, data)?;
        Ok(buffer)
    }

    /// Change the logical size of `buffer`.
    ///
    /// Shrinking keeps the allocation; growing past the capacity moves the
    /// contents into a fresh allocation.
    pub fn resize(&self, buffer: &mut DeviceBuffer, new_size: usize) -> Result<(), AllocatorError> {
        if new_size <= buffer.capacity {
            buffer.len = new_size;
            return Ok(());
        }

        let memory = buffer.memory.clone();
        let ptr = memory.alloc(new_size)?;
        // SAFETY: the new allocation holds `new_size > len` bytes; the old one `len`.
        unsafe {
            if let Err(e) = memory.copy_device(ptr, buffer.ptr, buffer.len) {
                memory.free(ptr, new_size);
                return Err(e);
            }
            memory.free(buffer.ptr, buffer.capacity);
        }
        buffer.ptr = ptr;
        buffer.len = new_size;
        buffer.capacity = new_size;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_allocation_is_aligned() {
        let alloc = DeviceAllocator::host();
        let buf = alloc.allocate(10_000).unwrap();
        assert_eq!(buf.len(), 10_000);
        assert_eq!(buf.as_ptr().as_raw() as usize % HOST_ALIGNMENT, 0);
    }

    #[test]
    fn test_zero_sized_buffer() {
        let alloc = DeviceAllocator::host();
        let buf = alloc.allocate(0).unwrap();
        assert!(buf.is_empty());
        assert!(buf.as_ptr().is_null());
        assert!(buf.to_host().unwrap().is_empty());
    }

    #[test]
    fn test_upload_and_shrink() {
        let alloc = DeviceAllocator::host();
        let mut buf = alloc.upload(b"hello, device").unwrap();

        alloc.resize(&mut buf, 5).unwrap();
        assert_eq!(buf.len(), 5);
        assert_eq!(buf.capacity(), 13);
        assert_eq!(buf.to_host().unwrap(), b"hello");
    }

    #[test]
    fn test_grow_preserves_contents() {
        let alloc = DeviceAllocator::host();
        let mut buf = alloc.upload(&[7u8; 64]).unwrap();

        alloc.resize(&mut buf, 128).unwrap();
        assert_eq!(buf.capacity(), 128);
        let data = buf.to_host().unwrap();
        assert_eq!(&data[..64], &[7u8; 64]);
        assert_eq!(&data[64..], &[0u8; 64]);
    }

    #[test]
    fn test_copy_out_of_bounds() {
        let alloc = DeviceAllocator::host();
        let mut buf = alloc.allocate(8).unwrap();
        let err = buf.copy_from_host(4, &[1u8; 8]).unwrap_err();
        assert!(matches!(err, AllocatorError::OutOfBounds { .. }));
    }
}
