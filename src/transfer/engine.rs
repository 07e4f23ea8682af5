//! Chunked transfer engines over a registered file.
//!
//! A transfer is cut into slices of at most `slice_bytes`; each slice is one
//! backend call on the engine's worker pool. The calling thread's device is
//! captured at dispatch and pinned again inside every slice task, because pool
//! threads carry whatever device the previous task left behind.
//!
//! Calls issued concurrently against the same engine are not ordered relative
//! to each other.

use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use crate::backend::driver::{BackendDriver, BackendHandle};
use crate::file::handle::OpenFlags;
use crate::file::registered::RegisteredFile;
use crate::gpu::allocator::{DeviceAllocator, DeviceBuffer, DevicePtr};
use crate::gpu::device::{DeviceContext, DeviceId};
use crate::metrics::TransferMetrics;
use crate::transfer::deferred::Deferred;
use crate::transfer::error::TransferError;
use crate::transfer::pool::{TaskHandle, WorkerPool};
use crate::transfer::runtime::GdsRuntime;
use crate::transfer::slicing::{plan_slices, range_end, Slice};
use crate::transfer::Direction;

/// What every slice task of one call needs.
#[derive(Clone)]
struct SliceContext {
    driver: Arc<dyn BackendDriver>,
    handle: BackendHandle,
    device_ctx: Arc<dyn DeviceContext>,
    device: DeviceId,
    metrics: Arc<TransferMetrics>,
}

/// Pool and registered file shared by both engine directions.
///
/// Field order matters: the pool is dropped first so in-flight slices finish
/// before the file is deregistered.
struct Engine {
    pool: WorkerPool,
    file: RegisteredFile,
    device_ctx: Arc<dyn DeviceContext>,
    metrics: Arc<TransferMetrics>,
    slice_bytes: usize,
}

impl Engine {
    fn open(
        runtime: &GdsRuntime,
        path: &Path,
        flags: OpenFlags,
        mode: Option<u32>,
    ) -> Result<Self, TransferError> {
        let config = runtime.config();
        let driver = runtime.shim().driver()?;
        let file = RegisteredFile::open(driver, path, flags.direct(config.direct_io), mode)?;
        let pool =
            WorkerPool::new(config.pool_threads, config.idle_poll()).map_err(TransferError::Pool)?;

        debug!(
            path = %path.display(),
            backend = file.driver().name(),
            threads = pool.threads(),
            "Opened accelerated file"
        );
        Ok(Self {
            pool,
            file,
            device_ctx: runtime.device().clone(),
            metrics: runtime.metrics().clone(),
            slice_bytes: config.slice_bytes,
        })
    }

    /// Submit one task per slice with the caller's device captured.
    fn dispatch<T, F>(
        &self,
        direction: Direction,
        offset: u64,
        size: usize,
        task: F,
    ) -> Result<Vec<TaskHandle<T>>, TransferError>
    where
        T: Send + 'static,
        F: Fn(&SliceContext, Slice) -> Result<T, TransferError> + Clone + Send + 'static,
    {
        if range_end(offset, size).is_none() {
            return Err(TransferError::OffsetOutOfRange { offset, size });
        }

        let ctx = SliceContext {
            driver: self.file.driver().clone(),
            handle: self.file.handle(),
            device_ctx: self.device_ctx.clone(),
            device: self.device_ctx.current_device()?,
            metrics: self.metrics.clone(),
        };

        let slices = plan_slices(offset, size, self.slice_bytes);
        debug!(
            %direction,
            offset,
            size,
            slices = slices.len(),
            device = ctx.device,
            "Dispatching slices"
        );
        self.metrics.record_slices(direction, slices.len());

        Ok(slices
            .into_iter()
            .map(|slice| {
                let ctx = ctx.clone();
                let task = task.clone();
                self.pool.submit(move || {
                    ctx.device_ctx.set_device(ctx.device)?;
                    task(&ctx, slice)
                })
            })
            .collect())
    }
}

/// Reads from a registered file into device memory.
pub struct ChunkedInput {
    engine: Engine,
    allocator: DeviceAllocator,
}

impl ChunkedInput {
    /// Open `path` read-only and register it with the backend.
    pub fn open(runtime: &GdsRuntime, path: impl AsRef<Path>) -> Result<Self, TransferError> {
        let engine = Engine::open(runtime, path.as_ref(), OpenFlags::read_only(), None)?;
        Ok(Self {
            engine,
            allocator: runtime.allocator().clone(),
        })
    }

    /// File size at open time.
    pub fn size(&self) -> u64 {
        self.engine.file.size()
    }

    pub fn backend(&self) -> &'static str {
        self.engine.file.driver().name()
    }

    /// Read `size` bytes at `offset` into a new device buffer.
    ///
    /// The buffer is shrunk to the number of bytes the backend returned.
    pub fn read(&self, offset: u64, size: usize) -> Result<DeviceBuffer, TransferError> {
        let mut buffer = self.allocator.allocate(size)?;
        let read = self.read_into(offset, &mut buffer)?;
        self.allocator.resize(&mut buffer, read)?;
        Ok(buffer)
    }

    /// Fill `buffer` from `offset`; returns the bytes read.
    pub fn read_into(&self, offset: u64, buffer: &mut DeviceBuffer) -> Result<usize, TransferError> {
        // SAFETY: `buffer` is borrowed mutably until the deferred result has
        // been waited on below.
        let pending = unsafe { self.read_async(offset, buffer.len(), buffer.as_ptr())? };
        pending.wait()
    }

    /// Start reading `size` bytes at `offset` into `dst`.
    ///
    /// Slices start immediately; the returned value sums their byte counts when
    /// waited on. A slice failure surfaces from the wait, and the contents of
    /// `dst` are then undefined beyond what completed slices wrote.
    ///
    /// # Safety
    /// `dst` must be valid for writes of `size` bytes, and not otherwise
    /// accessed, until the returned [`Deferred`] has been waited on or dropped.
    pub unsafe fn read_async(
        &self,
        offset: u64,
        size: usize,
        dst: DevicePtr,
    ) -> Result<Deferred<usize>, TransferError> {
        let tasks = self
            .engine
            .dispatch(Direction::Read, offset, size, move |ctx, slice| {
                // SAFETY: the caller keeps `dst` valid for `size` bytes and the
                // slice lies within it.
                let result = unsafe {
                    ctx.driver.read(
                        ctx.handle,
                        dst.add(slice.buffer_offset),
                        slice.len,
                        slice.file_offset,
                    )
                };
                if result < 0 {
                    ctx.metrics.record_slice_failure(Direction::Read);
                    return Err(TransferError::BackendIo {
                        direction: Direction::Read,
                        offset: slice.file_offset,
                        size: slice.len,
                        result,
                    });
                }
                ctx.metrics.record_bytes(Direction::Read, result as u64);
                Ok(result as usize)
            })?;

        Ok(Deferred::join(tasks, 0usize, |total, read| total + read))
    }
}

/// Writes device memory to a registered file.
pub struct ChunkedOutput {
    engine: Engine,
}

impl ChunkedOutput {
    /// Open `path` for writing, creating it if needed, and register it.
    pub fn open(runtime: &GdsRuntime, path: impl AsRef<Path>) -> Result<Self, TransferError> {
        let mode = runtime.config().output_mode;
        let engine = Engine::open(
            runtime,
            path.as_ref(),
            OpenFlags::read_write_create(),
            Some(mode),
        )?;
        Ok(Self { engine })
    }

    pub fn backend(&self) -> &'static str {
        self.engine.file.driver().name()
    }

    /// Truncate or extend the file to `len` bytes.
    pub fn set_len(&self, len: u64) -> Result<(), TransferError> {
        self.engine.file.file().as_file().set_len(len)?;
        Ok(())
    }

    /// Write the first `size` bytes of `data` at `offset`.
    pub fn write(&self, data: &DeviceBuffer, offset: u64, size: usize) -> Result<(), TransferError> {
        if size > data.len() {
            return Err(TransferError::SizeOutOfRange {
                size,
                available: data.len(),
            });
        }
        // SAFETY: `data` is borrowed until the deferred result has been waited on.
        let pending = unsafe { self.write_async(data.as_ptr(), offset, size)? };
        pending.wait()
    }

    /// Start writing `size` bytes from `src` at `offset`.
    ///
    /// Each slice must be written in full; a short write fails the call and is
    /// not retried.
    ///
    /// # Safety
    /// `src` must be valid for reads of `size` bytes, and not modified, until
    /// the returned [`Deferred`] has been waited on or dropped.
    pub unsafe fn write_async(
        &self,
        src: DevicePtr,
        offset: u64,
        size: usize,
    ) -> Result<Deferred<()>, TransferError> {
        let tasks = self
            .engine
            .dispatch(Direction::Write, offset, size, move |ctx, slice| {
                // SAFETY: the caller keeps `src` valid for `size` bytes and the
                // slice lies within it.
                let result = unsafe {
                    ctx.driver.write(
                        ctx.handle,
                        src.add(slice.buffer_offset),
                        slice.len,
                        slice.file_offset,
                    )
                };
                if result < 0 {
                    ctx.metrics.record_slice_failure(Direction::Write);
                    return Err(TransferError::BackendIo {
                        direction: Direction::Write,
                        offset: slice.file_offset,
                        size: slice.len,
                        result,
                    });
                }
                if result as usize != slice.len {
                    ctx.metrics.record_slice_failure(Direction::Write);
                    return Err(TransferError::PartialWrite {
                        offset: slice.file_offset,
                        expected: slice.len,
                        written: result as usize,
                    });
                }
                ctx.metrics.record_bytes(Direction::Write, result as u64);
                Ok(())
            })?;

        Ok(Deferred::join(tasks, (), |(), ()| ()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::driver::PosixLoader;
    use crate::backend::policy::{BackendPolicy, PolicyMode, PolicySettings};
    use crate::backend::shim::CapabilityShim;
    use crate::config::TransferConfig;
    use tempfile::TempDir;

    fn runtime(slice_bytes: usize) -> GdsRuntime {
        let policy = BackendPolicy::new(PolicySettings {
            mode: PolicyMode::Off,
            backend_config: "/nonexistent/cufile.json".into(),
            backend_config_env: "GDS_IO_TEST_ENGINE_JSON".to_string(),
        });
        GdsRuntime::builder()
            .policy(Arc::new(policy))
            .shim(Arc::new(CapabilityShim::new(PosixLoader)))
            .host_memory()
            .config(TransferConfig {
                pool_threads: 4,
                slice_bytes,
                idle_poll_ms: 1,
                direct_io: false,
                ..TransferConfig::default()
            })
            .build()
            .unwrap()
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_read_range_across_slices() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("input.bin");
        let data = pattern(10_000);
        std::fs::write(&path, &data).unwrap();

        let rt = runtime(1024);
        let input = ChunkedInput::open(&rt, &path).unwrap();
        assert_eq!(input.size(), 10_000);

        let buf = input.read(100, 5000).unwrap();
        assert_eq!(buf.to_host().unwrap(), &data[100..5100]);
        assert_eq!(rt.metrics().slices(Direction::Read), 5);
        assert_eq!(rt.metrics().bytes(Direction::Read), 5000);
    }

    #[test]
    fn test_read_past_end_shrinks_buffer() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("input.bin");
        std::fs::write(&path, pattern(3000)).unwrap();

        let rt = runtime(1024);
        let input = ChunkedInput::open(&rt, &path).unwrap();
        let buf = input.read(2000, 4096).unwrap();
        assert_eq!(buf.len(), 1000);
        assert_eq!(buf.capacity(), 4096);
    }

    #[test]
    fn test_zero_byte_read() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("input.bin");
        std::fs::write(&path, pattern(10)).unwrap();

        let rt = runtime(1024);
        let input = ChunkedInput::open(&rt, &path).unwrap();
        let pending = unsafe { input.read_async(0, 0, DevicePtr::null()).unwrap() };
        assert_eq!(pending.wait().unwrap(), 0);
        assert_eq!(rt.metrics().slices(Direction::Read), 0);
    }

    #[test]
    fn test_unaddressable_range_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("input.bin");
        std::fs::write(&path, pattern(10)).unwrap();

        let rt = runtime(1024);
        let input = ChunkedInput::open(&rt, &path).unwrap();

        let err = input.read(u64::MAX - 10, 8 * 1024 * 1024).unwrap_err();
        assert!(matches!(
            err,
            TransferError::OffsetOutOfRange { offset, .. } if offset == u64::MAX - 10
        ));

        let err = input.read(i64::MAX as u64, 1).unwrap_err();
        assert!(matches!(err, TransferError::OffsetOutOfRange { size: 1, .. }));
        assert_eq!(rt.metrics().slices(Direction::Read), 0);

        let output = ChunkedOutput::open(&rt, tmp.path().join("output.bin")).unwrap();
        let src = rt.allocator().upload(b"abc").unwrap();
        let err = output.write(&src, u64::MAX, 3).unwrap_err();
        assert!(matches!(err, TransferError::OffsetOutOfRange { .. }));
    }

    #[test]
    fn test_write_then_read_back() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("output.bin");
        let rt = runtime(4096);
        let data = pattern(20_000);

        let output = ChunkedOutput::open(&rt, &path).unwrap();
        let src = rt.allocator().upload(&data).unwrap();
        output.write(&src, 512, data.len()).unwrap();
        drop(output);

        let written = std::fs::read(&path).unwrap();
        assert_eq!(written.len(), 512 + data.len());
        assert_eq!(&written[512..], &data[..]);
        assert_eq!(rt.metrics().bytes(Direction::Write), 20_000);
    }

    #[test]
    fn test_write_size_beyond_buffer() {
        let tmp = TempDir::new().unwrap();
        let rt = runtime(4096);
        let output = ChunkedOutput::open(&rt, tmp.path().join("output.bin")).unwrap();
        let src = rt.allocator().allocate(10).unwrap();

        let err = output.write(&src, 0, 11).unwrap_err();
        assert!(matches!(err, TransferError::SizeOutOfRange { size: 11, available: 10 }));
    }

    #[test]
    fn test_open_missing_input_fails() {
        let rt = runtime(4096);
        let err = ChunkedInput::open(&rt, "/nonexistent/input.bin").err().unwrap();
        assert!(matches!(err, TransferError::Registration(_)));
    }
}
