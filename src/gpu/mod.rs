//! Compute device access.
//!
//! - [`device`]: per-thread device selection and the run-time bound CUDA runtime
//! - [`allocator`]: device buffers and the memory spaces they come from

pub mod allocator;
pub mod device;
