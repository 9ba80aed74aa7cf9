//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/sessionreel/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/sessionreel/` (~/.config/sessionreel/)
//! - State/Logs/Session record: `$XDG_STATE_HOME/sessionreel/` (~/.local/state/sessionreel/)

use crate::error::{Error, Result};
use crate::identity::SESSION_STORAGE_KEY;
use crate::lifecycle::TerminationPolicy;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// Capture agent configuration
    #[serde(default)]
    pub agent: AgentConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

/// Capture agent configuration
///
/// Only `api_host` is required. Everything else has a default matching the
/// collector's expectations.
#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    /// Collector base URL (e.g., `https://collector.example`)
    pub api_host: Option<String>,

    /// Project API key, sent as `X-API-Key` (or in-body on the beacon path)
    pub api_key: Option<String>,

    /// Application user id attached to session metadata
    pub user_id: Option<String>,

    /// Application user email attached to session metadata
    pub user_email: Option<String>,

    /// Events accepted per session before new events are dropped
    #[serde(default = "default_max_events_per_session")]
    pub max_events_per_session: u64,

    /// Buffered event count that triggers an immediate flush
    #[serde(default = "default_flush_threshold")]
    pub flush_threshold: usize,

    /// Seconds between periodic flushes
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,

    /// Seconds between heartbeats (0 disables heartbeats)
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Minutes of inactivity after which the persisted session id is rotated
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_mins: u64,

    /// HTTP request timeout in seconds for ordinary requests
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// HTTP request timeout in milliseconds for uploads issued during teardown
    #[serde(default = "default_unload_timeout")]
    pub unload_timeout_ms: u64,

    /// In-place retry attempts for transient upload failures before requeueing
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// When the session-ended signal is sent
    #[serde(default)]
    pub termination: TerminationPolicy,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            api_host: None,
            api_key: None,
            user_id: None,
            user_email: None,
            max_events_per_session: default_max_events_per_session(),
            flush_threshold: default_flush_threshold(),
            flush_interval_secs: default_flush_interval(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            idle_timeout_mins: default_idle_timeout(),
            timeout_secs: default_timeout(),
            unload_timeout_ms: default_unload_timeout(),
            max_retries: default_max_retries(),
            termination: TerminationPolicy::default(),
        }
    }
}

fn default_max_events_per_session() -> u64 {
    10_000
}

fn default_flush_threshold() -> usize {
    100
}

fn default_flush_interval() -> u64 {
    10
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_idle_timeout() -> u64 {
    30
}

fn default_timeout() -> u64 {
    30
}

fn default_unload_timeout() -> u64 {
    2_000
}

fn default_max_retries() -> usize {
    2
}

impl AgentConfig {
    /// Create a configuration pointing at `api_host` with every other field defaulted
    pub fn new(api_host: impl Into<String>) -> Self {
        Self {
            api_host: Some(api_host.into()),
            ..Default::default()
        }
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        let host = self
            .api_host
            .as_deref()
            .ok_or_else(|| Error::Config("agent.api_host is required".to_string()))?;

        if !(host.starts_with("http://") || host.starts_with("https://")) {
            return Err(Error::Config(format!(
                "agent.api_host must be an http(s) URL, got {:?}",
                host
            )));
        }
        if self.max_events_per_session == 0 {
            return Err(Error::Config(
                "agent.max_events_per_session must be greater than 0".to_string(),
            ));
        }
        if self.flush_threshold == 0 {
            return Err(Error::Config(
                "agent.flush_threshold must be greater than 0".to_string(),
            ));
        }
        if self.flush_interval_secs == 0 {
            return Err(Error::Config(
                "agent.flush_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.idle_timeout_mins == 0 {
            return Err(Error::Config(
                "agent.idle_timeout_mins must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Collector base URL without a trailing slash
    pub fn base_url(&self) -> Result<String> {
        self.api_host
            .as_deref()
            .map(|host| host.trim_end_matches('/').to_string())
            .ok_or_else(|| Error::Config("agent.api_host is required".to_string()))
    }

    /// Get the configured flush interval
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    /// Get the configured heartbeat interval, if heartbeats are enabled
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_secs > 0).then(|| Duration::from_secs(self.heartbeat_interval_secs))
    }

    /// Get the configured idle timeout
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_mins * 60)
    }

    /// Get the ordinary request timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Get the request timeout used while the page is unloading
    pub fn unload_timeout(&self) -> Duration {
        Duration::from_millis(self.unload_timeout_ms)
    }
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/sessionreel/config.toml` (~/.config/sessionreel/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("sessionreel").join("config.toml")
    }

    /// Returns the state directory path (for logs and the session record)
    ///
    /// `$XDG_STATE_HOME/sessionreel/` (~/.local/state/sessionreel/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("sessionreel")
    }

    /// Returns the persisted session record path
    ///
    /// `$XDG_STATE_HOME/sessionreel/sessionreel_session.json`
    pub fn session_record_path() -> PathBuf {
        Self::state_dir().join(format!("{}.json", SESSION_STORAGE_KEY))
    }
}
