//! A file registered with the acceleration backend.

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::backend::driver::{BackendDriver, BackendHandle};
use crate::file::handle::{FileError, FileHandle, OpenFlags};

#[derive(Error, Debug)]
pub enum RegistrationError {
    #[error(transparent)]
    Open(#[from] FileError),

    #[error("Cannot register {path} with the {backend} backend (status {code})")]
    Rejected {
        path: String,
        backend: &'static str,
        code: i32,
    },
}

/// A [`FileHandle`] paired with the backend's handle for it.
///
/// Deregistration happens in `Drop`, before the descriptor is closed.
pub struct RegisteredFile {
    driver: Arc<dyn BackendDriver>,
    handle: BackendHandle,
    file: FileHandle,
}

impl RegisteredFile {
    pub fn open(
        driver: Arc<dyn BackendDriver>,
        path: impl AsRef<Path>,
        flags: OpenFlags,
        mode: Option<u32>,
    ) -> Result<Self, RegistrationError> {
        let file = FileHandle::open_with_mode(path, flags, mode)?;
        let handle = driver
            .register(file.desc())
            .map_err(|code| RegistrationError::Rejected {
                path: file.path().display().to_string(),
                backend: driver.name(),
                code,
            })?;

        debug!(path = %file.path().display(), backend = driver.name(), "Registered file");
        Ok(Self {
            driver,
            handle,
            file,
        })
    }

    pub fn handle(&self) -> BackendHandle {
        self.handle
    }

    pub fn file(&self) -> &FileHandle {
        &self.file
    }

    pub fn size(&self) -> u64 {
        self.file.size()
    }

    pub fn driver(&self) -> &Arc<dyn BackendDriver> {
        &self.driver
    }
}

impl Drop for RegisteredFile {
    fn drop(&mut self) {
        self.driver.deregister(self.handle);
        debug!(path = %self.file.path().display(), "Deregistered file");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::driver::PosixDriver;
    use std::os::fd::RawFd;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    use crate::gpu::allocator::DevicePtr;

    /// Checks at deregistration time that the descriptor is still open.
    struct OrderCheckingDriver {
        fd_open_at_deregister: AtomicBool,
    }

    impl BackendDriver for OrderCheckingDriver {
        fn name(&self) -> &'static str {
            "order-check"
        }

        fn register(&self, fd: RawFd) -> Result<BackendHandle, i32> {
            Ok(BackendHandle::from_raw(fd as usize as *mut std::ffi::c_void))
        }

        fn deregister(&self, handle: BackendHandle) {
            let fd = handle.as_raw() as usize as RawFd;
            let open = unsafe { libc::fcntl(fd, libc::F_GETFD) } != -1;
            self.fd_open_at_deregister.store(open, Ordering::SeqCst);
        }

        unsafe fn read(&self, _: BackendHandle, _: DevicePtr, _: usize, _: u64) -> isize {
            -1
        }

        unsafe fn write(&self, _: BackendHandle, _: DevicePtr, _: usize, _: u64) -> isize {
            -1
        }
    }

    struct RejectingDriver;

    impl BackendDriver for RejectingDriver {
        fn name(&self) -> &'static str {
            "rejecting"
        }

        fn register(&self, _fd: RawFd) -> Result<BackendHandle, i32> {
            Err(5001)
        }

        fn deregister(&self, _handle: BackendHandle) {
            panic!("nothing was registered");
        }

        unsafe fn read(&self, _: BackendHandle, _: DevicePtr, _: usize, _: u64) -> isize {
            -1
        }

        unsafe fn write(&self, _: BackendHandle, _: DevicePtr, _: usize, _: u64) -> isize {
            -1
        }
    }

    fn scratch_file(tmp: &TempDir) -> std::path::PathBuf {
        let path = tmp.path().join("data.bin");
        std::fs::write(&path, vec![1u8; 100]).unwrap();
        path
    }

    #[test]
    fn test_deregister_before_close() {
        let tmp = TempDir::new().unwrap();
        let path = scratch_file(&tmp);
        let driver = Arc::new(OrderCheckingDriver {
            fd_open_at_deregister: AtomicBool::new(false),
        });

        let file = RegisteredFile::open(driver.clone(), &path, OpenFlags::read_only(), None).unwrap();
        assert_eq!(file.size(), 100);
        drop(file);

        assert!(driver.fd_open_at_deregister.load(Ordering::SeqCst));
    }

    #[test]
    fn test_registration_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = scratch_file(&tmp);

        let err = RegisteredFile::open(Arc::new(RejectingDriver), &path, OpenFlags::read_only(), None)
            .err()
            .unwrap();
        assert!(matches!(err, RegistrationError::Rejected { code: 5001, .. }));
    }

    #[test]
    fn test_open_failure_skips_registration() {
        let driver = Arc::new(PosixDriver::new());
        let err = RegisteredFile::open(
            driver.clone(),
            "/nonexistent/data.bin",
            OpenFlags::read_only(),
            None,
        )
        .err()
        .unwrap();
        assert!(matches!(err, RegistrationError::Open(FileError::Open { .. })));
        assert_eq!(driver.registered(), 0);
    }
}
