//! Client configuration stored as YAML.
//!
//! # Storage layout
//!
//! ```text
//! ~/.kaji/
//!   config.yaml       (mode 0600, may hold the session token)
//! ```
//!
//! # API pattern
//!
//! - `fn_at(home: &Path, …)`: explicit home, used in tests with `TempDir`
//! - `fn(…)`: derives home from `dirs::home_dir()`, delegates to `_at`

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const CONFIG_FILE: &str = "config.yaml";
pub const SESSION_COOKIE: &str = "kaji_session";

/// Everything the sync engine needs to talk to one team API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub api_base_url: String,
    /// Team-scoped server-sent event stream, relative to `api_base_url`.
    pub events_path: String,
    /// Value of the `kaji_session` cookie.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    /// Sent as `Origin` on mutating requests (the server does a same-origin check).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    pub request_timeout_secs: u64,
    pub debounce_ms: u64,
    pub backoff_min_ms: u64,
    pub backoff_max_ms: u64,
    /// `false` models a platform without streaming support: no event stream,
    /// only online/visibility catch-up refreshes.
    pub streaming: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8080".to_string(),
            events_path: "/v1/events/stream".to_string(),
            session_token: None,
            origin: None,
            request_timeout_secs: 30,
            debounce_ms: 300,
            backoff_min_ms: 1_000,
            backoff_max_ms: 30_000,
            streaming: true,
        }
    }
}

impl SyncConfig {
    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn backoff_min(&self) -> Duration {
        Duration::from_millis(self.backoff_min_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Base URL without a trailing slash.
    pub fn base_url(&self) -> &str {
        self.api_base_url.trim_end_matches('/')
    }

    /// `Cookie` header value for the configured session, if any.
    pub fn session_cookie(&self) -> Option<String> {
        self.session_token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(|token| format!("{SESSION_COOKIE}={token}"))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_base_url.trim().is_empty() {
            return Err(ConfigError::Invalid("api_base_url must not be empty".into()));
        }
        if !self.events_path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "events_path must start with '/', got '{}'",
                self.events_path
            )));
        }
        if self.debounce_ms == 0 {
            return Err(ConfigError::Invalid("debounce_ms must be > 0".into()));
        }
        if self.backoff_min_ms == 0 {
            return Err(ConfigError::Invalid("backoff_min_ms must be > 0".into()));
        }
        if self.backoff_min_ms > self.backoff_max_ms {
            return Err(ConfigError::Invalid(format!(
                "backoff_min_ms ({}) exceeds backoff_max_ms ({})",
                self.backoff_min_ms, self.backoff_max_ms
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

/// `<home>/.kaji/config.yaml`. Pure, no I/O.
pub fn config_path_at(home: &Path) -> PathBuf {
    home.join(".kaji").join(CONFIG_FILE)
}

// ---------------------------------------------------------------------------
// Load / save
// ---------------------------------------------------------------------------

/// Load and validate the config under `home`.
///
/// A missing file yields [`SyncConfig::default`]. Malformed YAML yields
/// `ConfigError::Parse` with the file path.
pub fn load_at(home: &Path) -> Result<SyncConfig, ConfigError> {
    let path = config_path_at(home);
    if !path.exists() {
        return Ok(SyncConfig::default());
    }
    let contents = std::fs::read_to_string(&path)?;
    let config: SyncConfig = if contents.trim().is_empty() {
        SyncConfig::default()
    } else {
        serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse { path, source: e })?
    };
    config.validate()?;
    Ok(config)
}

/// `load_at` convenience wrapper.
pub fn load() -> Result<SyncConfig, ConfigError> {
    load_at(&home()?)
}

/// Write flow: validate → serialize → `config.yaml.tmp` → `chmod 0600` → `rename`.
pub fn save_at(home: &Path, config: &SyncConfig) -> Result<PathBuf, ConfigError> {
    config.validate()?;
    let path = config_path_at(home);
    if let Some(dir) = path.parent() {
        if !dir.exists() {
            std::fs::create_dir_all(dir)?;
            set_dir_permissions(dir)?;
        }
    }
    let yaml = serde_yaml::to_string(config)?;
    let tmp_path = path.with_file_name(format!("{CONFIG_FILE}.tmp"));
    std::fs::write(&tmp_path, yaml)?;
    set_file_permissions(&tmp_path)?;
    std::fs::rename(&tmp_path, &path)?;
    Ok(path)
}

/// `save_at` convenience wrapper.
pub fn save(config: &SyncConfig) -> Result<PathBuf, ConfigError> {
    save_at(&home()?, config)
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn home() -> Result<PathBuf, ConfigError> {
    dirs::home_dir().ok_or(ConfigError::HomeNotFound)
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    Ok(())
}
#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
