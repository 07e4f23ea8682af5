//! Readers and writers that pick the accelerated or host path per file.
//!
//! Callers do not need to know which path serves them; the choice is made once
//! at open time by the factory and the runtime's policy.

pub mod host;

use std::path::Path;

use crate::gpu::allocator::DeviceBuffer;
use crate::transfer::engine::{ChunkedInput, ChunkedOutput};
use crate::transfer::error::TransferError;
use crate::transfer::factory::{make_accelerated_input, make_accelerated_output};
use crate::transfer::runtime::GdsRuntime;

pub use host::{HostIoStats, HostSink, HostSource};

pub enum FileReader {
    Accelerated(ChunkedInput),
    Host(HostSource),
}

impl FileReader {
    /// Open `path`, accelerated when the policy and backend allow it.
    pub fn open(path: impl AsRef<Path>, runtime: &GdsRuntime) -> Result<Self, TransferError> {
        let path = path.as_ref();
        match make_accelerated_input(path, runtime)? {
            Some(input) => Ok(FileReader::Accelerated(input)),
            None => Ok(FileReader::Host(HostSource::open(runtime, path)?)),
        }
    }

    pub fn is_accelerated(&self) -> bool {
        matches!(self, FileReader::Accelerated(_))
    }

    pub fn size(&self) -> u64 {
        match self {
            FileReader::Accelerated(input) => input.size(),
            FileReader::Host(source) => source.size(),
        }
    }

    pub fn read(&self, offset: u64, size: usize) -> Result<DeviceBuffer, TransferError> {
        match self {
            FileReader::Accelerated(input) => input.read(offset, size),
            FileReader::Host(source) => source.read(offset, size),
        }
    }

    pub fn read_into(&self, offset: u64, buffer: &mut DeviceBuffer) -> Result<usize, TransferError> {
        match self {
            FileReader::Accelerated(input) => input.read_into(offset, buffer),
            FileReader::Host(source) => source.read_into(offset, buffer),
        }
    }
}

pub enum FileWriter {
    Accelerated(ChunkedOutput),
    Host(HostSink),
}

impl FileWriter {
    /// Open `path` for writing, accelerated when the policy and backend allow it.
    pub fn open(path: impl AsRef<Path>, runtime: &GdsRuntime) -> Result<Self, TransferError> {
        let path = path.as_ref();
        match make_accelerated_output(path, runtime)? {
            Some(output) => Ok(FileWriter::Accelerated(output)),
            None => Ok(FileWriter::Host(HostSink::open(runtime, path)?)),
        }
    }

    pub fn is_accelerated(&self) -> bool {
        matches!(self, FileWriter::Accelerated(_))
    }

    /// Truncate or extend the file to `len` bytes.
    pub fn set_len(&self, len: u64) -> Result<(), TransferError> {
        match self {
            FileWriter::Accelerated(output) => output.set_len(len),
            FileWriter::Host(sink) => sink.set_len(len),
        }
    }

    pub fn write(&self, data: &DeviceBuffer, offset: u64, size: usize) -> Result<(), TransferError> {
        match self {
            FileWriter::Accelerated(output) => output.write(data, offset, size),
            FileWriter::Host(sink) => sink.write(data, offset, size),
        }
    }
}
