//! Capability shim: loads the backend once and remembers the outcome.
//!
//! Initialisation runs on the first request for the capability. A failure is
//! captured rather than raised, and every later request reports the same cause
//! without trying again. Invalid stays invalid for the life of the shim.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use thiserror::Error;
use tracing::{info, warn};

use crate::backend::driver::{BackendDriver, CufileLoader, DriverLoader};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShimError {
    /// No candidate library could be opened. Reported separately from
    /// [`SymbolResolution`](Self::SymbolResolution) so that a missing
    /// installation and an incompatible one can be told apart; both mean the
    /// capability is unavailable.
    #[error("Failed to load the cuFile library: {0}")]
    LibraryLoad(String),

    #[error("Could not find cuFile symbol {symbol}: {reason}")]
    SymbolResolution { symbol: &'static str, reason: String },

    #[error("Failed to initialize the cuFile driver (status {code})")]
    DriverInit { code: i32 },

    /// Raised on request while the shim is invalid; wraps the captured cause.
    #[error("GPUDirect Storage unavailable: {0}")]
    Unavailable(Box<ShimError>),
}

impl ShimError {
    /// The failure captured during initialisation.
    pub fn cause(&self) -> &ShimError {
        match self {
            ShimError::Unavailable(inner) => inner.cause(),
            other => other,
        }
    }
}

/// Outcome of the one initialisation attempt.
pub enum CapabilityState {
    Valid(Arc<dyn BackendDriver>),
    Invalid(ShimError),
}

impl std::fmt::Debug for CapabilityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CapabilityState::Valid(driver) => f.debug_tuple("Valid").field(&driver.name()).finish(),
            CapabilityState::Invalid(err) => f.debug_tuple("Invalid").field(err).finish(),
        }
    }
}

pub struct CapabilityShim {
    loader: Box<dyn DriverLoader>,
    state: OnceLock<CapabilityState>,
    attempts: AtomicUsize,
}

static GLOBAL: OnceLock<Arc<CapabilityShim>> = OnceLock::new();

extern "C" fn shutdown_global() {
    if let Some(shim) = GLOBAL.get() {
        shim.shutdown();
    }
}

impl CapabilityShim {
    pub fn new(loader: impl DriverLoader + 'static) -> Self {
        Self {
            loader: Box::new(loader),
            state: OnceLock::new(),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Process-wide shim over libcufile.
    ///
    /// The driver is closed from an `atexit` hook since statics are never dropped.
    pub fn global() -> Arc<CapabilityShim> {
        GLOBAL
            .get_or_init(|| {
                // SAFETY: registering a plain `extern "C"` function.
                if unsafe { libc::atexit(shutdown_global) } != 0 {
                    warn!("Could not register cuFile teardown hook");
                }
                Arc::new(CapabilityShim::new(CufileLoader))
            })
            .clone()
    }

    /// The initialisation outcome, running the loader on first use.
    pub fn state(&self) -> &CapabilityState {
        self.state.get_or_init(|| {
            self.attempts.fetch_add(1, Ordering::AcqRel);
            match self.loader.load() {
                Ok(driver) => {
                    info!(backend = driver.name(), "Acceleration backend initialized");
                    CapabilityState::Valid(driver)
                }
                Err(err) => {
                    warn!(error = %err, "Acceleration backend unavailable");
                    CapabilityState::Invalid(err)
                }
            }
        })
    }

    /// The backend driver, or the captured failure wrapped in [`ShimError::Unavailable`].
    pub fn driver(&self) -> Result<Arc<dyn BackendDriver>, ShimError> {
        match self.state() {
            CapabilityState::Valid(driver) => Ok(driver.clone()),
            CapabilityState::Invalid(cause) => Err(ShimError::Unavailable(Box::new(cause.clone()))),
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self.state(), CapabilityState::Valid(_))
    }

    /// Whether initialisation has run, without triggering it.
    pub fn is_initialized(&self) -> bool {
        self.state.get().is_some()
    }

    /// How many times the loader has been invoked (0 or 1).
    pub fn init_attempts(&self) -> usize {
        self.attempts.load(Ordering::Acquire)
    }

    /// Close the driver if it was opened.
    pub fn shutdown(&self) {
        if let Some(CapabilityState::Valid(driver)) = self.state.get() {
            driver.shutdown();
        }
    }
}

impl std::fmt::Debug for CapabilityShim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityShim")
            .field("state", &self.state.get())
            .finish()
    }
}
