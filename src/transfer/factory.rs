//! Policy-driven construction of accelerated engines.
//!
//! `Ok(None)` means "use the host path". Under the required policy a failure
//! to build the engine is returned instead; a policy of off never touches the
//! capability shim.

use std::path::Path;

use tracing::warn;

use crate::transfer::engine::{ChunkedInput, ChunkedOutput};
use crate::transfer::error::TransferError;
use crate::transfer::runtime::GdsRuntime;
use crate::transfer::Direction;

/// Accelerated reader for `path`, or `None` when the host path should serve it.
pub fn make_accelerated_input(
    path: impl AsRef<Path>,
    runtime: &GdsRuntime,
) -> Result<Option<ChunkedInput>, TransferError> {
    let path = path.as_ref();
    make_accelerated(path, runtime, Direction::Read, || {
        ChunkedInput::open(runtime, path)
    })
}

/// Accelerated writer for `path`, or `None` when the host path should serve it.
pub fn make_accelerated_output(
    path: impl AsRef<Path>,
    runtime: &GdsRuntime,
) -> Result<Option<ChunkedOutput>, TransferError> {
    let path = path.as_ref();
    make_accelerated(path, runtime, Direction::Write, || {
        ChunkedOutput::open(runtime, path)
    })
}

fn make_accelerated<E>(
    path: &Path,
    runtime: &GdsRuntime,
    direction: Direction,
    open: impl FnOnce() -> Result<E, TransferError>,
) -> Result<Option<E>, TransferError> {
    let policy = runtime.policy();
    if !policy.is_enabled() {
        return Ok(None);
    }

    match open() {
        Ok(engine) => Ok(Some(engine)),
        Err(e) if policy.is_required() => Err(e),
        Err(e) => {
            warn!(
                path = %path.display(),
                %direction,
                error = %e,
                "Accelerated I/O unavailable, using host path"
            );
            runtime.metrics().record_fallback(direction);
            Ok(None)
        }
    }
}
