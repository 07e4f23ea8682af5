use std::io;

use thiserror::Error;

use crate::backend::shim::ShimError;
use crate::file::handle::FileError;
use crate::file::registered::RegistrationError;
use crate::gpu::allocator::AllocatorError;
use crate::gpu::device::DeviceError;
use crate::transfer::Direction;

#[derive(Error, Debug)]
pub enum TransferError {
    #[error(transparent)]
    Capability(#[from] ShimError),

    #[error(transparent)]
    Registration(#[from] RegistrationError),

    #[error(transparent)]
    File(#[from] FileError),

    #[error("Device context error: {0}")]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Allocation(#[from] AllocatorError),

    #[error("Cannot start transfer workers: {0}")]
    Pool(#[source] io::Error),

    #[error("Backend {direction} of {size} bytes at offset {offset} failed (result {result})")]
    BackendIo {
        direction: Direction,
        offset: u64,
        size: usize,
        result: isize,
    },

    #[error("Backend wrote {written} of {expected} bytes at offset {offset}")]
    PartialWrite {
        offset: u64,
        expected: usize,
        written: usize,
    },

    #[error("Transfer of {size} bytes exceeds buffer of {available} bytes")]
    SizeOutOfRange { size: usize, available: usize },

    #[error("Range of {size} bytes at offset {offset} is not addressable")]
    OffsetOutOfRange { offset: u64, size: usize },

    #[error("Transfer worker exited before reporting a result")]
    WorkerLost,

    #[error("Host I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Metrics registration failed: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl TransferError {
    /// Whether this is a per-slice backend failure.
    pub fn is_backend_io(&self) -> bool {
        matches!(
            self,
            TransferError::BackendIo { .. } | TransferError::PartialWrite { .. }
        )
    }
}
