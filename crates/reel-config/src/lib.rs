// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

use reel_core::CanonicalId;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during configuration loading or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file was not found.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },

    /// The file could not be parsed as valid TOML.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// Human-readable parse error detail.
        reason: String,
    },

    /// Semantic validation failed (one or more problems).
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

impl From<ConfigError> for reel_error::ForgeError {
    fn from(err: ConfigError) -> Self {
        reel_error::ForgeError::new(reel_error::ErrorCode::InputInvalid, err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Warnings
// ---------------------------------------------------------------------------

/// Advisory-level issues that do not prevent operation but deserve attention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// Concurrency is unusually high for a single-process executor.
    HighConcurrency {
        /// Configured worker count.
        workers: usize,
    },
    /// Live mode is configured without a catalog root.
    MissingCatalogRoot,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::HighConcurrency { workers } => {
                write!(f, "concurrency {workers} is unusually high")
            }
            ConfigWarning::MissingCatalogRoot => {
                write!(f, "live mode without a catalog root; producer specs may not resolve")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// Whether handlers call external services or synthesize stub artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Call the external provider services.
    Live,
    /// Synthesize deterministic stub artifacts satisfying declared schemas.
    #[default]
    Simulated,
}

/// What the executor does when a job fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Continue within the current layer, stop at the barrier.
    #[default]
    FailFast,
    /// Keep going; jobs whose dependencies failed are skipped.
    BestEffort,
}

/// Where per-movie state lives on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct StorageConfig {
    /// Storage root directory.
    pub root: String,
    /// Base path under the root, prepended to every movie id.
    #[serde(default = "default_base_path")]
    pub base_path: String,
}

fn default_base_path() -> String {
    "movies".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: ".reelforge".into(),
            base_path: default_base_path(),
        }
    }
}

/// Persistent Reelforge settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ForgeConfig {
    /// Parallel worker cap for the executor. At least 1.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Execution mode.
    #[serde(default)]
    pub mode: ExecutionMode,

    /// Failure policy.
    #[serde(default)]
    pub failure_mode: FailureMode,

    /// Maximum attempts per job, retries included. At least 1.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Root directory of the command-line installation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cli_root: Option<String>,

    /// Root directory of the producer catalog.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog_root: Option<String>,

    /// Storage layout.
    #[serde(default)]
    pub storage: StorageConfig,
}

fn default_concurrency() -> usize {
    1
}

fn default_max_attempts() -> u32 {
    3
}

impl Default for ForgeConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            mode: ExecutionMode::default(),
            failure_mode: FailureMode::default(),
            max_attempts: default_max_attempts(),
            cli_root: None,
            catalog_root: None,
            storage: StorageConfig::default(),
        }
    }
}

impl ForgeConfig {
    /// Load a config from a TOML file.
    ///
    /// # Errors
    ///
    /// [`ConfigError::FileNotFound`] when the path does not exist,
    /// [`ConfigError::ParseError`] on malformed TOML, and
    /// [`ConfigError::ValidationError`] when semantic validation fails.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound {
                    path: path.display().to_string(),
                }
            } else {
                ConfigError::ParseError {
                    reason: e.to_string(),
                }
            }
        })?;
        let config: Self = toml::from_str(&text).map_err(|e| ConfigError::ParseError {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Semantic validation beyond what serde enforces.
    ///
    /// # Errors
    ///
    /// [`ConfigError::ValidationError`] listing every problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut reasons = Vec::new();
        if self.concurrency == 0 {
            reasons.push("concurrency must be at least 1".to_string());
        }
        if self.max_attempts == 0 {
            reasons.push("max_attempts must be at least 1".to_string());
        }
        if self.storage.root.is_empty() {
            reasons.push("storage.root must not be empty".to_string());
        }
        if reasons.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::ValidationError { reasons })
        }
    }

    /// Advisory warnings for suspicious-but-valid settings.
    #[must_use]
    pub fn warnings(&self) -> Vec<ConfigWarning> {
        let mut out = Vec::new();
        if self.concurrency > 32 {
            out.push(ConfigWarning::HighConcurrency {
                workers: self.concurrency,
            });
        }
        if self.mode == ExecutionMode::Live && self.catalog_root.is_none() {
            out.push(ConfigWarning::MissingCatalogRoot);
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Per-run options
// ---------------------------------------------------------------------------

/// A user override of one virtual-artifact leaf, applied before planning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum OverrideValue {
    /// An inline JSON value.
    Value(serde_json::Value),
    /// A path to a file whose bytes replace the leaf.
    File(String),
}

/// Knobs for a single plan/build invocation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct RunOptions {
    /// Drop all jobs whose layer index is greater than this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub up_to_layer: Option<usize>,

    /// Mark all jobs at this layer or deeper dirty regardless of hashes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub re_run_from: Option<usize>,

    /// Restrict the dirty set to the transitive downstream of this artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_artifact_id: Option<CanonicalId>,

    /// Leaf overrides: `Producer.Field.Path` → replacement value.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub overrides: BTreeMap<String, OverrideValue>,

    /// Plan and persist, but do not execute.
    #[serde(default)]
    pub dry_run: bool,

    /// Report estimated costs instead of executing.
    #[serde(default)]
    pub costs_only: bool,

    /// Never prompt; fail instead of asking.
    #[serde(default)]
    pub non_interactive: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = ForgeConfig::default();
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.mode, ExecutionMode::Simulated);
        assert_eq!(config.failure_mode, FailureMode::FailFast);
        assert!(config.validate().is_ok());
        assert!(config.warnings().is_empty());
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let config = ForgeConfig {
            concurrency: 0,
            ..ForgeConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }

    #[test]
    fn live_without_catalog_warns() {
        let config = ForgeConfig {
            mode: ExecutionMode::Live,
            ..ForgeConfig::default()
        };
        assert_eq!(config.warnings(), vec![ConfigWarning::MissingCatalogRoot]);
    }

    #[test]
    fn load_round_trips_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reelforge.toml");
        std::fs::write(
            &path,
            r#"
concurrency = 4
mode = "simulated"
failure_mode = "best_effort"

[storage]
root = "/tmp/reelforge"
base_path = "movies"
"#,
        )
        .unwrap();
        let config = ForgeConfig::load(&path).unwrap();
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.failure_mode, FailureMode::BestEffort);
        assert_eq!(config.storage.root, "/tmp/reelforge");
    }

    #[test]
    fn load_missing_file_is_not_found() {
        let err = ForgeConfig::load("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn run_options_default_is_a_full_build() {
        let opts = RunOptions::default();
        assert!(opts.up_to_layer.is_none());
        assert!(opts.overrides.is_empty());
        assert!(!opts.dry_run);
    }
}
