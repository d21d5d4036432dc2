use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Orchestrator configuration, loaded once at construction and passed by
/// reference into the orchestrator. There are no mutable globals; every
/// tunable lives here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessiondConfig {
    /// Budget for the delayed-locking policy: running sessions plus warm
    /// stopped sessions may not exceed this many unlocked storage keys.
    #[serde(default = "default_max_unlocked")]
    pub max_unlocked: usize,

    /// Global delayed-locking switch. Individual accounts may override it.
    #[serde(default)]
    pub delayed_locking: bool,

    /// When false, switches skip the screen freeze and keyguard
    /// interaction but keep their ordering and notifications.
    #[serde(default = "default_true")]
    pub switch_ui_enabled: bool,

    /// Global timer for the switch observer fan-out.
    #[serde(default = "default_switch_timeout_ms")]
    pub switch_timeout_ms: u64,

    /// Additional delay after the fan-out timer before non-responding
    /// observers are named in the log. Diagnostic only.
    #[serde(default = "default_observer_lag_timeout_ms")]
    pub observer_lag_timeout_ms: u64,

    /// Bound on waiting for keyguard-shown confirmation during a switch.
    #[serde(default = "default_show_keyguard_timeout_ms")]
    pub show_keyguard_timeout_ms: u64,

    /// Bound on waiting for keyguard-dismissed confirmation.
    #[serde(default = "default_dismiss_keyguard_timeout_ms")]
    pub dismiss_keyguard_timeout_ms: u64,

    /// Current platform build fingerprint. A session whose account last
    /// booted under a different fingerprint runs the pre-boot sequence
    /// before its unlock journey completes.
    #[serde(default)]
    pub build_fingerprint: String,

    /// Force the pre-boot sequence on every unlock regardless of
    /// fingerprint.
    #[serde(default)]
    pub force_pre_boot: bool,
}

fn default_max_unlocked() -> usize {
    3
}

fn default_true() -> bool {
    true
}

fn default_switch_timeout_ms() -> u64 {
    3_000
}

fn default_observer_lag_timeout_ms() -> u64 {
    5_000
}

fn default_show_keyguard_timeout_ms() -> u64 {
    20_000
}

fn default_dismiss_keyguard_timeout_ms() -> u64 {
    2_000
}

impl Default for SessiondConfig {
    fn default() -> Self {
        SessiondConfig {
            max_unlocked: default_max_unlocked(),
            delayed_locking: false,
            switch_ui_enabled: true,
            switch_timeout_ms: default_switch_timeout_ms(),
            observer_lag_timeout_ms: default_observer_lag_timeout_ms(),
            show_keyguard_timeout_ms: default_show_keyguard_timeout_ms(),
            dismiss_keyguard_timeout_ms: default_dismiss_keyguard_timeout_ms(),
            build_fingerprint: String::new(),
            force_pre_boot: false,
        }
    }
}

impl SessiondConfig {
    /// Load config from a TOML file path. Returns None if file doesn't exist.
    pub fn load(path: &std::path::Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        Ok(Some(config))
    }

    /// Save config to a TOML file path.
    pub fn save(&self, path: &std::path::Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        }
        let contents = toml::to_string_pretty(self).map_err(ConfigError::SerializeFailed)?;
        std::fs::write(path, contents)
            .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        Ok(())
    }

    pub fn switch_timeout(&self) -> Duration {
        Duration::from_millis(self.switch_timeout_ms)
    }

    pub fn observer_lag_timeout(&self) -> Duration {
        Duration::from_millis(self.observer_lag_timeout_ms)
    }

    pub fn show_keyguard_timeout(&self) -> Duration {
        Duration::from_millis(self.show_keyguard_timeout_ms)
    }

    pub fn dismiss_keyguard_timeout(&self) -> Duration {
        Duration::from_millis(self.dismiss_keyguard_timeout_ms)
    }
}

/// Errors that can occur when loading or saving config.
#[derive(Debug)]
pub enum ConfigError {
    ReadFailed(std::path::PathBuf, std::io::Error),
    ParseFailed(std::path::PathBuf, toml::de::Error),
    WriteFailed(std::path::PathBuf, std::io::Error),
    SerializeFailed(toml::ser::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadFailed(path, e) => {
                write!(f, "Failed to read config {}: {}", path.display(), e)
            }
            Self::ParseFailed(path, e) => {
                write!(f, "Failed to parse config {}: {}", path.display(), e)
            }
            Self::WriteFailed(path, e) => {
                write!(f, "Failed to write config {}: {}", path.display(), e)
            }
            Self::SerializeFailed(e) => write!(f, "Failed to serialize config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}
