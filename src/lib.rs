//! # gds-io
//!
//! File transfers straight between storage and GPU memory through NVIDIA
//! GPUDirect Storage (libcufile), with a host-staged fallback.
//!
//! ## Layout
//!
//! - [`backend`]: libcufile binding, capability discovery and enablement policy
//! - [`file`]: descriptors registered with the backend
//! - [`gpu`]: device selection and device buffers
//! - [`transfer`]: sliced, pooled accelerated reads and writes
//! - [`source`]: per-file choice between accelerated and host paths
//! - [`metrics`]: Prometheus counters
//! - [`config`]: tunables and CLI

pub mod backend;
pub mod config;
pub mod file;
pub mod gpu;
pub mod metrics;
pub mod source;
pub mod transfer;
