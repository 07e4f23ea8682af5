//! Host path: ordinary reads and writes staged through host memory.
//!
//! Used when acceleration is off or unavailable. Data is read into a host
//! buffer, then copied into a device buffer; writes go the other way.

use std::fs::File;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::file::handle::FileError;
use crate::gpu::allocator::{DeviceAllocator, DeviceBuffer};
use crate::metrics::TransferMetrics;
use crate::transfer::error::TransferError;
use crate::transfer::runtime::GdsRuntime;
use crate::transfer::slicing::range_end;
use crate::transfer::Direction;

/// Operation and byte counts of one host file.
#[derive(Debug, Default)]
pub struct HostIoStats {
    ops: AtomicU64,
    bytes: AtomicU64,
}

impl HostIoStats {
    fn record(&self, bytes: usize) {
        self.ops.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn ops(&self) -> u64 {
        self.ops.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

pub struct HostSource {
    file: File,
    path: PathBuf,
    size: u64,
    allocator: DeviceAllocator,
    metrics: Arc<TransferMetrics>,
    stats: HostIoStats,
}

impl HostSource {
    pub fn open(runtime: &GdsRuntime, path: impl AsRef<Path>) -> Result<Self, TransferError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|source| FileError::Open {
            path: path.clone(),
            source,
        })?;
        let size = file
            .metadata()
            .map_err(|source| FileError::Stat {
                path: path.clone(),
                source,
            })?
            .len();

        debug!(path = %path.display(), size, "Opened host source");
        Ok(Self {
            file,
            path,
            size,
            allocator: runtime.allocator().clone(),
            metrics: runtime.metrics().clone(),
            stats: HostIoStats::default(),
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stats(&self) -> &HostIoStats {
        &self.stats
    }

    /// Read up to `size` bytes at `offset` into a new device buffer.
    pub fn read(&self, offset: u64, size: usize) -> Result<DeviceBuffer, TransferError> {
        let mut buffer = self.allocator.allocate(size)?;
        let read = self.read_into(offset, &mut buffer)?;
        self.allocator.resize(&mut buffer, read)?;
        Ok(buffer)
    }

    /// Fill `buffer` from `offset`; stops early at end of file.
    pub fn read_into(&self, offset: u64, buffer: &mut DeviceBuffer) -> Result<usize, TransferError> {
        if range_end(offset, buffer.len()).is_none() {
            return Err(TransferError::OffsetOutOfRange {
                offset,
                size: buffer.len(),
            });
        }
        let mut staging = vec![0u8; buffer.len()];
        let mut done = 0;
        while done < staging.len() {
            match self.file.read_at(&mut staging[done..], offset + done as u64) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        buffer.copy_from_host(0, &staging[..done])?;

        self.stats.record(done);
        self.metrics.record_bytes(Direction::Read, done as u64);
        debug!(path = %self.path.display(), offset, bytes = done, "Host read");
        Ok(done)
    }
}

pub struct HostSink {
    file: File,
    path: PathBuf,
    metrics: Arc<TransferMetrics>,
    stats: HostIoStats,
}

impl HostSink {
    /// Open `path` for writing, creating it with the configured mode.
    pub fn open(runtime: &GdsRuntime, path: impl AsRef<Path>) -> Result<Self, TransferError> {
        let path = path.as_ref().to_path_buf();
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(runtime.config().output_mode)
            .open(&path)
            .map_err(|source| FileError::Open {
                path: path.clone(),
                source,
            })?;

        debug!(path = %path.display(), "Opened host sink");
        Ok(Self {
            file,
            path,
            metrics: runtime.metrics().clone(),
            stats: HostIoStats::default(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stats(&self) -> &HostIoStats {
        &self.stats
    }

    /// Truncate or extend the file to `len` bytes.
    pub fn set_len(&self, len: u64) -> Result<(), TransferError> {
        self.file.set_len(len)?;
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
        if range_end(offset, size).is_none() {
            return Err(TransferError::OffsetOutOfRange { offset, size });
        }
        let staging = data.to_host()?;
        self.file.write_all_at(&staging[..size], offset)?;

        self.stats.record(size);
        self.metrics.record_bytes(Direction::Write, size as u64);
        debug!(path = %self.path.display(), offset, bytes = size, "Host write");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn runtime() -> GdsRuntime {
        GdsRuntime::builder().host_memory().build().unwrap()
    }

    #[test]
    fn test_host_read_and_stats() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("in.bin");
        std::fs::write(&path, b"0123456789").unwrap();

        let source = HostSource::open(&runtime(), &path).unwrap();
        assert_eq!(source.size(), 10);

        let buf = source.read(4, 100).unwrap();
        assert_eq!(buf.to_host().unwrap(), b"456789");
        assert_eq!(source.stats().ops(), 1);
        assert_eq!(source.stats().bytes(), 6);
    }

    #[test]
    fn test_host_write_at_offset() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("out.bin");
        let rt = runtime();

        let sink = HostSink::open(&rt, &path).unwrap();
        let data = rt.allocator().upload(b"abcdef").unwrap();
        sink.write(&data, 2, 4).unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"\0\0abcd");
        assert_eq!(rt.metrics().bytes(Direction::Write), 4);
    }

    #[test]
    fn test_host_set_len_drops_stale_tail() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("out.bin");
        std::fs::write(&path, b"previous contents").unwrap();
        let rt = runtime();

        let sink = HostSink::open(&rt, &path).unwrap();
        let data = rt.allocator().upload(b"new").unwrap();
        sink.write(&data, 0, 3).unwrap();
        sink.set_len(3).unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"new");
    }

    #[test]
    fn test_host_unaddressable_offset() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("in.bin");
        std::fs::write(&path, b"0123").unwrap();

        let source = HostSource::open(&runtime(), &path).unwrap();
        let err = source.read(u64::MAX - 1, 4).unwrap_err();
        assert!(matches!(err, TransferError::OffsetOutOfRange { .. }));
    }

    #[test]
    fn test_host_open_missing() {
        let err = HostSource::open(&runtime(), "/nonexistent/in.bin").err().unwrap();
        assert!(matches!(err, TransferError::File(FileError::Open { .. })));
    }
}
