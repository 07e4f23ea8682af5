//! Chunked transfers between files and device memory.
//!
//! - [`slicing`]: partitioning a byte range into bounded slices
//! - [`pool`]: fixed-size worker pool owned by each engine
//! - [`deferred`]: results collected when waited on
//! - [`engine`]: accelerated input and output engines
//! - [`runtime`]: the services engines are built from
//! - [`factory`]: policy-driven construction with fallback

pub mod deferred;
pub mod engine;
pub mod error;
pub mod factory;
pub mod pool;
pub mod runtime;
pub mod slicing;

pub use deferred::Deferred;
pub use engine::{ChunkedInput, ChunkedOutput};
pub use error::TransferError;
pub use factory::{make_accelerated_input, make_accelerated_output};
pub use runtime::GdsRuntime;

/// Which way bytes move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Storage to device.
    Read,
    /// Device to storage.
    Write,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Read => "read",
            Direction::Write => "write",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
