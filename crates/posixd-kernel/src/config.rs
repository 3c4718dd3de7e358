//! Kernel configuration.
//!
//! Read from `config/default.toml` (or a path given on the command line).
//! Every field has a default, so a missing file or a partial file is fine.
//!
//! ```toml
//! cancel_lock_shards = 4
//! log_level = "info"
//!
//! [demo]
//! initial_ms = 100
//! interval_ms = 50
//! reads = 3
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::cancel::DEFAULT_LOCK_SHARDS;
use crate::error::{KernelError, Result};

// ---------------------------------------------------------------------------
// Kernel configuration
// ---------------------------------------------------------------------------

/// Top-level settings for the readiness core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Number of cancel-lock shards in the [`CancelRegistry`](crate::CancelRegistry).
    pub cancel_lock_shards: usize,
    /// Default tracing filter when `RUST_LOG` is unset.
    pub log_level: String,
    /// Settings for the `posixd timer` demo.
    pub demo: DemoConfig,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            cancel_lock_shards: DEFAULT_LOCK_SHARDS,
            log_level: "info".into(),
            demo: DemoConfig::default(),
        }
    }
}

/// Settings from the `[demo]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    /// Initial expiration, in milliseconds.
    pub initial_ms: u64,
    /// Period after the first expiration, in milliseconds (0 = one-shot).
    pub interval_ms: u64,
    /// Number of `epoll_wait` + `read` rounds before exiting.
    pub reads: u32,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            initial_ms: 100,
            interval_ms: 50,
            reads: 3,
        }
    }
}

impl KernelConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| KernelError::InvalidConfig {
            reason: e.to_string(),
        })
    }

    /// Load configuration from `path`.
    ///
    /// Falls back to the defaults if the file does not exist.  A file that
    /// exists but cannot be read or parsed is an error.
    pub fn load(path: &Path) -> Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(KernelError::InvalidConfig {
                    reason: format!("{}: {e}", path.display()),
                });
            }
        };

        let config = Self::from_toml_str(&content)?;
        tracing::debug!(path = %path.display(), "config loaded");
        Ok(config)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
