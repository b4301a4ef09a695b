// Lock sync configuration.
//
// Global directory: `~/.folio/` (default offline queue database lives here)
// Project config:   `<project>/.folio/sync.toml`

use std::path::{Path, PathBuf};

use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Root directory for Folio global state: `~/.folio/`.
pub fn global_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".folio"))
}

/// Default location of the durable offline queue: `~/.folio/offline.db`.
pub fn default_storage_path() -> Option<PathBuf> {
    global_dir().map(|d| d.join("offline.db"))
}

/// Path to the project sync config: `<root>/.folio/sync.toml`.
pub fn project_config_path(project_root: &Path) -> PathBuf {
    project_root.join(".folio").join("sync.toml")
}

// ── Sync config ────────────────────────────────────────────────────

/// Per-project sync configuration at `<root>/.folio/sync.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct SyncConfig {
    /// Lock server base URL (handed to the host's transport).
    pub server_url: Option<String>,
    /// Offline queue database; falls back to `~/.folio/offline.db`.
    pub storage_path: Option<PathBuf>,
    pub timeouts: TimeoutConfig,
    pub reconnect: ReconnectConfig,
}

impl SyncConfig {
    /// Load from `<root>/.folio/sync.toml`. Returns defaults if the file
    /// doesn't exist or can't be parsed.
    pub fn load(project_root: &Path) -> Self {
        let path = project_config_path(project_root);
        match Self::load_from(&path) {
            Ok(config) => config,
            Err(ConfigError::Io(_)) => Self::default(),
            Err(error) => {
                tracing::warn!(path = %path.display(), %error, "ignoring invalid sync config");
                Self::default()
            }
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Save to `<root>/.folio/sync.toml`.
    pub fn save(&self, project_root: &Path) -> Result<(), ConfigError> {
        self.save_to(&project_config_path(project_root))
    }

    /// Save to a specific path (creates parent directories).
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Resolved offline queue location.
    pub fn resolved_storage_path(&self) -> Option<PathBuf> {
        self.storage_path.clone().or_else(default_storage_path)
    }
}

/// Timer settings, all in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Rollback deadline for a single-component lock/unlock.
    pub single_operation_ms: u64,
    /// Rollback deadline for a bulk operation.
    pub bulk_operation_ms: u64,
    /// How long a full-sync request may go unanswered.
    pub sync_request_ms: u64,
    /// Age after which the retry sweep picks up an operation.
    pub stale_operation_ms: u64,
    pub retry_sweep_interval_ms: u64,
    /// Periodic full resync cadence.
    pub full_sync_interval_ms: u64,
    /// Remote lock updates for a component with a pending operation younger
    /// than this are treated as echoes of our own write.
    pub echo_window_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            single_operation_ms: 10_000,
            bulk_operation_ms: 15_000,
            sync_request_ms: 10_000,
            stale_operation_ms: 30_000,
            retry_sweep_interval_ms: 10_000,
            full_sync_interval_ms: 30_000,
            echo_window_ms: 5_000,
        }
    }
}

impl TimeoutConfig {
    pub fn single_operation(&self) -> Duration {
        millis(self.single_operation_ms)
    }

    pub fn bulk_operation(&self) -> Duration {
        millis(self.bulk_operation_ms)
    }

    pub fn sync_request(&self) -> Duration {
        millis(self.sync_request_ms)
    }

    pub fn stale_operation(&self) -> Duration {
        millis(self.stale_operation_ms)
    }

    pub fn retry_sweep_interval(&self) -> Duration {
        millis(self.retry_sweep_interval_ms)
    }

    pub fn full_sync_interval(&self) -> Duration {
        millis(self.full_sync_interval_ms)
    }

    pub fn echo_window(&self) -> Duration {
        millis(self.echo_window_ms)
    }
}

/// Reconnection backoff for the realtime channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Consecutive failures before a persistent-failure error is raised.
    /// Reconnection continues past this point at the capped delay.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self { base_delay_ms: 1_000, max_delay_ms: 30_000, max_attempts: 5 }
    }
}

impl ReconnectConfig {
    /// Delay before the reconnect attempt following `failures` consecutive failures.
    pub fn delay_after(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(16); // cap exponent to avoid overflow
        let delay_ms = self.base_delay_ms.saturating_mul(1u64 << exp).min(self.max_delay_ms);
        millis(delay_ms)
    }
}

fn millis(value: u64) -> Duration {
    Duration::milliseconds(i64::try_from(value).unwrap_or(i64::MAX))
}

// ── Errors ─────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("config serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
