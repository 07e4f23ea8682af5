//! Runtime configuration for gds-io.
//!
//! Transfer tuning knobs live in [`TransferConfig`], loaded from a JSON file or
//! built programmatically. Backend enablement is not part of the file: it comes
//! from the environment (see [`POLICY_ENV_VAR`]) so that every process sharing a
//! host can be switched without touching configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

/// Selects the backend policy: `OFF`, `GDS` (optional) or `ALWAYS` (required).
pub const POLICY_ENV_VAR: &str = "GDS_IO_POLICY";

/// Policy used when [`POLICY_ENV_VAR`] is unset or unrecognised.
pub const DEFAULT_POLICY: &str = env!("GDS_IO_DEFAULT_POLICY");

/// Variable libcufile reads its configuration path from.
pub const CUFILE_CONFIG_ENV_VAR: &str = "CUFILE_ENV_PATH_JSON";

/// Location of the system-wide cufile configuration.
pub const DEFAULT_CUFILE_CONFIG: &str = "/etc/cufile.json";

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "gds-io", about = "GPUDirect Storage accelerated file transfers")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "gds-io.json")]
    pub config: PathBuf,

    /// Override the backend policy (OFF, GDS, ALWAYS).
    #[arg(long)]
    pub policy: Option<String>,

    /// Use the POSIX emulation backend instead of libcufile.
    #[arg(long)]
    pub emulate: bool,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Report the policy and whether the backend can be initialised.
    Probe {
        /// Print the transfer counters in Prometheus text format.
        #[arg(long)]
        metrics: bool,
    },

    /// Read a byte range of a file into device memory.
    Read {
        path: PathBuf,

        #[arg(long, default_value_t = 0)]
        offset: u64,

        /// Bytes to read (defaults to the rest of the file).
        #[arg(long)]
        size: Option<usize>,
    },

    /// Copy a file through device memory.
    Copy {
        src: PathBuf,
        dst: PathBuf,

        /// Bytes staged in device memory per round.
        #[arg(long, default_value_t = 64 * 1024 * 1024)]
        chunk: usize,
    },
}

/// Tuning for the chunked transfer engines.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Worker threads per open file.
    pub pool_threads: usize,

    /// Upper bound of a single backend call in bytes.
    pub slice_bytes: usize,

    /// How long an idle worker sleeps before polling its queue again.
    pub idle_poll_ms: u64,

    /// Open files with O_DIRECT.
    pub direct_io: bool,

    /// Permission bits for files created by the output engine.
    pub output_mode: u32,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            // Parallel reads stop scaling around 16 threads.
            pool_threads: 16,
            slice_bytes: 4 * 1024 * 1024,
            idle_poll_ms: 10,
            direct_io: true,
            output_mode: 0o664,
        }
    }
}

impl TransferConfig {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: TransferConfig = serde_json::from_str(&data)?;
            config.validate()?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(TransferConfig::default())
        }
    }

    /// Reject values the engines cannot work with.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.pool_threads > 0, "pool_threads must be at least 1");
        anyhow::ensure!(self.slice_bytes > 0, "slice_bytes must be at least 1");
        Ok(())
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let cfg = TransferConfig::default();
        assert_eq!(cfg.pool_threads, 16);
        assert_eq!(cfg.slice_bytes, 4 * 1024 * 1024);
        assert!(cfg.direct_io);
    }

    #[test]
    fn test_load_partial_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("gds-io.json");
        std::fs::write(&path, r#"{ "pool_threads": 4, "direct_io": false }"#).unwrap();

        let cfg = TransferConfig::load(&path).unwrap();
        assert_eq!(cfg.pool_threads, 4);
        assert!(!cfg.direct_io);
        assert_eq!(cfg.slice_bytes, 4 * 1024 * 1024);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let cfg = TransferConfig::load(Path::new("/nonexistent/gds-io.json")).unwrap();
        assert_eq!(cfg.pool_threads, 16);
    }

    #[test]
    fn test_zero_threads_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("gds-io.json");
        std::fs::write(&path, r#"{ "pool_threads": 0 }"#).unwrap();
        assert!(TransferConfig::load(&path).is_err());
    }
}
