//! Files opened for accelerated transfer.
//!
//! - [`handle`]: owned descriptor with size at open time
//! - [`registered`]: descriptor registered with the backend driver

pub mod handle;
pub mod registered;
