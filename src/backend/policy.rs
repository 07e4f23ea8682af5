//! Backend policy: whether acceleration is attempted and whether it must succeed.
//!
//! The mode is read from [`POLICY_ENV_VAR`] once. The first time the policy is
//! observed enabled, the backend's own `cufile.json` is copied into a private
//! temporary directory with `allow_compat_mode` forced to match the mode, and
//! libcufile is pointed at the copy. In required mode the driver must not fall
//! back to POSIX I/O behind our back, so compat mode is switched off there.
//!
//! The rewrite is best effort. If the source file is missing or the variable is
//! already set by someone else, the driver keeps its own setting and required
//! mode may still be served by the driver's internal fallback.

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{CUFILE_CONFIG_ENV_VAR, DEFAULT_CUFILE_CONFIG, DEFAULT_POLICY, POLICY_ENV_VAR};

/// Key whose line is rewritten in `cufile.json`.
pub const COMPAT_MODE_KEY: &str = "\"allow_compat_mode\"";

#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("Cannot read backend config {path}: {source}")]
    ReadConfig {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Cannot write rewritten backend config {path}: {source}")]
    WriteConfig {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Cannot create private config directory: {0}")]
    TempDir(#[source] io::Error),
}

/// Enablement mode of the acceleration backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicyMode {
    /// Never touch the backend.
    Off,
    /// Use the backend when it works, fall back silently otherwise.
    Optional,
    /// Use the backend or fail.
    Required,
}

impl PolicyMode {
    /// Parse `OFF`/`GDS`/`ALWAYS` or `off`/`optional`/`required`, ignoring case.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "OFF" => Some(PolicyMode::Off),
            "GDS" | "OPTIONAL" => Some(PolicyMode::Optional),
            "ALWAYS" | "REQUIRED" => Some(PolicyMode::Required),
            _ => None,
        }
    }

    /// The build-time default.
    pub fn default_mode() -> Self {
        Self::parse(DEFAULT_POLICY).unwrap_or(PolicyMode::Optional)
    }

    /// Mode for a raw setting; unset and unrecognised values both give the default.
    pub fn resolve(value: Option<&str>) -> Self {
        match value.and_then(Self::parse) {
            Some(mode) => mode,
            None => {
                if let Some(raw) = value {
                    warn!(value = raw, "Unrecognized backend policy, using default");
                }
                Self::default_mode()
            }
        }
    }

    /// Value `allow_compat_mode` is forced to, if the mode enables the backend.
    pub fn compat_mode(self) -> Option<bool> {
        match self {
            PolicyMode::Off => None,
            PolicyMode::Optional => Some(true),
            PolicyMode::Required => Some(false),
        }
    }
}

impl std::fmt::Display for PolicyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyMode::Off => write!(f, "OFF"),
            PolicyMode::Optional => write!(f, "GDS"),
            PolicyMode::Required => write!(f, "ALWAYS"),
        }
    }
}

/// Inputs of a [`BackendPolicy`].
#[derive(Debug, Clone)]
pub struct PolicySettings {
    pub mode: PolicyMode,

    /// `cufile.json` to copy.
    pub backend_config: PathBuf,

    /// Variable the backend reads its config path from.
    pub backend_config_env: String,
}

impl PolicySettings {
    pub fn from_env() -> Self {
        let mode = PolicyMode::resolve(std::env::var(POLICY_ENV_VAR).ok().as_deref());
        let backend_config = std::env::var_os(CUFILE_CONFIG_ENV_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CUFILE_CONFIG));

        Self {
            mode,
            backend_config,
            backend_config_env: CUFILE_CONFIG_ENV_VAR.to_string(),
        }
    }
}

struct RewrittenConfig {
    _dir: TempDir,
    path: PathBuf,
}

pub struct BackendPolicy {
    settings: PolicySettings,
    rewrite: OnceLock<Option<RewrittenConfig>>,
}

static GLOBAL: OnceLock<Arc<BackendPolicy>> = OnceLock::new();

impl BackendPolicy {
    pub fn new(settings: PolicySettings) -> Self {
        info!(mode = %settings.mode, "Backend policy");
        Self {
            settings,
            rewrite: OnceLock::new(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(PolicySettings::from_env())
    }

    /// Policy from the environment with the mode replaced.
    pub fn with_mode(mode: PolicyMode) -> Self {
        Self::new(PolicySettings {
            mode,
            ..PolicySettings::from_env()
        })
    }

    /// Process-wide policy, derived from the environment on first use.
    pub fn global() -> Arc<BackendPolicy> {
        GLOBAL.get_or_init(|| Arc::new(Self::from_env())).clone()
    }

    pub fn mode(&self) -> PolicyMode {
        self.settings.mode
    }

    /// Whether acceleration should be attempted.
    ///
    /// The first `true` answer also rewrites the backend configuration.
    pub fn is_enabled(&self) -> bool {
        let enabled = self.settings.mode != PolicyMode::Off;
        if enabled {
            self.rewrite.get_or_init(|| self.apply_backend_config());
        }
        enabled
    }

    pub fn is_required(&self) -> bool {
        self.settings.mode == PolicyMode::Required
    }

    /// Path of the rewritten `cufile.json`, if the rewrite has happened and succeeded.
    pub fn rewritten_config(&self) -> Option<&Path> {
        self.rewrite
            .get()
            .and_then(|r| r.as_ref())
            .map(|r| r.path.as_path())
    }

    fn apply_backend_config(&self) -> Option<RewrittenConfig> {
        let allow_compat = self.settings.mode.compat_mode()?;
        match self.write_private_config(allow_compat) {
            Ok(rewritten) => {
                let var = &self.settings.backend_config_env;
                if std::env::var_os(var).is_none() {
                    std::env::set_var(var, &rewritten.path);
                    info!(
                        path = %rewritten.path.display(),
                        allow_compat,
                        "Backend pointed at rewritten config"
                    );
                } else {
                    info!(var = %var, "Backend config variable already set, leaving it");
                }
                Some(rewritten)
            }
            Err(e) => {
                warn!(error = %e, "Backend config not rewritten; driver keeps its own compat setting");
                None
            }
        }
    }

    fn write_private_config(&self, allow_compat: bool) -> Result<RewrittenConfig, PolicyError> {
        let dir = tempfile::Builder::new()
            .prefix("gds-io-")
            .tempdir()
            .map_err(PolicyError::TempDir)?;
        let path = dir.path().join("cufile.json");
        rewrite_backend_config(&self.settings.backend_config, &path, allow_compat)?;
        Ok(RewrittenConfig { _dir: dir, path })
    }
}

impl std::fmt::Debug for BackendPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendPolicy")
            .field("settings", &self.settings)
            .field("rewritten_config", &self.rewritten_config())
            .finish()
    }
}

/// Set the boolean on a line holding [`COMPAT_MODE_KEY`]; `None` for other lines.
///
/// Only the first `true`/`false` after the key changes. A line without one is
/// replaced by `"allow_compat_mode": <value>,` at the same indentation.
pub fn rewrite_compat_line(line: &str, allow_compat: bool) -> Option<String> {
    let key_at = line.find(COMPAT_MODE_KEY)?;
    let after_key = key_at + COMPAT_MODE_KEY.len();
    let rest = &line[after_key..];
    let value = if allow_compat { "true" } else { "false" };

    let literal = ["true", "false"]
        .iter()
        .filter_map(|lit| rest.find(lit).map(|at| (at, lit.len())))
        .min_by_key(|&(at, _)| at);

    Some(match literal {
        Some((at, len)) => format!(
            "{}{}{}{}",
            &line[..after_key],
            &rest[..at],
            value,
            &rest[at + len..]
        ),
        None => {
            let indent = &line[..line.len() - line.trim_start().len()];
            format!("{indent}{COMPAT_MODE_KEY}: {value},")
        }
    })
}

/// Copy `source` to `dest` line by line, rewriting the compat-mode line.
///
/// Returns the number of lines rewritten.
pub fn rewrite_backend_config(
    source: &Path,
    dest: &Path,
    allow_compat: bool,
) -> Result<usize, PolicyError> {
    let read_err = |source_err| PolicyError::ReadConfig {
        path: source.to_path_buf(),
        source: source_err,
    };
    let write_err = |source_err| PolicyError::WriteConfig {
        path: dest.to_path_buf(),
        source: source_err,
    };

    let reader = BufReader::new(File::open(source).map_err(read_err)?);
    let mut writer = BufWriter::new(File::create(dest).map_err(write_err)?);

    let mut rewritten = 0;
    for line in reader.lines() {
        let line = line.map_err(read_err)?;
        match rewrite_compat_line(&line, allow_compat) {
            Some(new_line) => {
                rewritten += 1;
                writeln!(writer, "{new_line}").map_err(write_err)?;
            }
            None => writeln!(writer, "{line}").map_err(write_err)?,
        }
    }
    writer.flush().map_err(write_err)?;

    debug!(
        source = %source.display(),
        dest = %dest.display(),
        rewritten,
        "Backend config copied"
    );
    Ok(rewritten)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_modes() {
        assert_eq!(PolicyMode::parse("OFF"), Some(PolicyMode::Off));
        assert_eq!(PolicyMode::parse("gds"), Some(PolicyMode::Optional));
        assert_eq!(PolicyMode::parse("Optional"), Some(PolicyMode::Optional));
        assert_eq!(PolicyMode::parse("ALWAYS"), Some(PolicyMode::Required));
        assert_eq!(PolicyMode::parse("required"), Some(PolicyMode::Required));
        assert_eq!(PolicyMode::parse("sometimes"), None);
    }

    #[test]
    fn test_unknown_value_uses_default() {
        assert_eq!(PolicyMode::resolve(Some("bogus")), PolicyMode::default_mode());
        assert_eq!(PolicyMode::resolve(None), PolicyMode::default_mode());
        assert_eq!(PolicyMode::resolve(Some("OFF")), PolicyMode::Off);
    }

    #[test]
    fn test_compat_mode_follows_policy() {
        assert_eq!(PolicyMode::Off.compat_mode(), None);
        assert_eq!(PolicyMode::Optional.compat_mode(), Some(true));
        assert_eq!(PolicyMode::Required.compat_mode(), Some(false));
    }

    #[test]
    fn test_rewrite_keeps_indentation_and_comma() {
        let line = r#"        "allow_compat_mode": true, // fall back to POSIX"#;
        assert_eq!(
            rewrite_compat_line(line, false).unwrap(),
            r#"        "allow_compat_mode": false, // fall back to POSIX"#
        );
    }

    #[test]
    fn test_rewrite_ignores_other_lines() {
        assert!(rewrite_compat_line(r#"    "max_direct_io_size_kb": 16384,"#, true).is_none());
    }

    #[test]
    fn test_rewrite_line_without_boolean() {
        assert_eq!(
            rewrite_compat_line(r#"  "allow_compat_mode": "#, true).unwrap(),
            r#"  "allow_compat_mode": true,"#
        );
    }

    #[test]
    fn test_off_policy_is_disabled() {
        let policy = BackendPolicy::new(PolicySettings {
            mode: PolicyMode::Off,
            backend_config: PathBuf::from("/nonexistent/cufile.json"),
            backend_config_env: "GDS_IO_TEST_POLICY_OFF_JSON".to_string(),
        });
        assert!(!policy.is_enabled());
        assert!(!policy.is_required());
        assert!(policy.rewritten_config().is_none());
        assert!(std::env::var_os("GDS_IO_TEST_POLICY_OFF_JSON").is_none());
    }

    #[test]
    fn test_missing_source_config_is_not_fatal() {
        let policy = BackendPolicy::new(PolicySettings {
            mode: PolicyMode::Required,
            backend_config: PathBuf::from("/nonexistent/cufile.json"),
            backend_config_env: "GDS_IO_TEST_POLICY_MISSING_JSON".to_string(),
        });
        assert!(policy.is_enabled());
        assert!(policy.is_required());
        assert!(policy.rewritten_config().is_none());
        assert!(std::env::var_os("GDS_IO_TEST_POLICY_MISSING_JSON").is_none());
    }
}
