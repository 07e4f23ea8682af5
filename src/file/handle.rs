//! Owned OS file descriptor with its size taken at open time.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum FileError {
    #[error("Cannot open file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Cannot query file size of {path}: {source}")]
    Stat {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// How a [`FileHandle`] is opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenFlags {
    pub write: bool,
    pub create: bool,
    /// Bypass the page cache (O_DIRECT).
    pub direct: bool,
}

impl OpenFlags {
    pub fn read_only() -> Self {
        Self::default()
    }

    /// O_CREAT | O_RDWR, without truncation.
    pub fn read_write_create() -> Self {
        Self {
            write: true,
            create: true,
            direct: false,
        }
    }

    pub fn direct(mut self, direct: bool) -> Self {
        self.direct = direct;
        self
    }
}

/// An open file. The descriptor is closed when the handle is dropped.
#[derive(Debug)]
pub struct FileHandle {
    file: File,
    path: PathBuf,
    size: u64,
}

impl FileHandle {
    pub fn open(path: impl AsRef<Path>, flags: OpenFlags) -> Result<Self, FileError> {
        Self::open_with_mode(path, flags, None)
    }

    /// Open with explicit permission bits for a newly created file.
    pub fn open_with_mode(
        path: impl AsRef<Path>,
        flags: OpenFlags,
        mode: Option<u32>,
    ) -> Result<Self, FileError> {
        let path = path.as_ref().to_path_buf();

        let mut options = OpenOptions::new();
        options.read(true).write(flags.write).create(flags.create);
        if flags.direct {
            options.custom_flags(libc::O_DIRECT);
        }
        if let Some(mode) = mode {
            options.mode(mode);
        }

        let file = options.open(&path).map_err(|source| FileError::Open {
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

        debug!(path = %path.display(), size, direct = flags.direct, "Opened file");
        Ok(Self { file, path, size })
    }

    pub fn desc(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Size in bytes when the file was opened.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn as_file(&self) -> &File {
        &self.file
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_size_taken_at_open() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("data.bin");
        std::fs::write(&path, vec![0u8; 12345]).unwrap();

        let handle = FileHandle::open(&path, OpenFlags::read_only()).unwrap();
        assert_eq!(handle.size(), 12345);
        assert!(handle.desc() >= 0);
    }

    #[test]
    fn test_open_missing_file() {
        let err = FileHandle::open("/nonexistent/data.bin", OpenFlags::read_only()).unwrap_err();
        assert!(matches!(err, FileError::Open { .. }));
    }

    #[test]
    fn test_create_with_mode() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("out.bin");
        let handle =
            FileHandle::open_with_mode(&path, OpenFlags::read_write_create(), Some(0o600)).unwrap();
        assert_eq!(handle.size(), 0);

        let perms = std::fs::metadata(&path).unwrap().permissions();
        assert_eq!(perms.mode() & 0o777, 0o600);
    }
}
