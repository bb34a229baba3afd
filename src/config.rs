use configparser::ini::Ini;
use dirs::home_dir;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::retry::RetryOptions;
use crate::sync::SyncConfig;

pub const DEFAULT_CONFIG_PATH: &str = "~/.session-sync.cfg";
pub const DEFAULT_API_URL: &str = "https://api.session-sync.dev/v1";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse config file: {0}")]
    ParseError(String),
    #[error("Invalid config path: {0}")]
    InvalidPath(String),
}

type Settings = HashMap<String, Option<String>>;

/// Backoff settings for direct (online) calls
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Retries after the first call, so `3` means up to four calls
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub use_jitter: bool,
    /// Wrap online gate calls in the retry executor
    pub direct_calls: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            use_jitter: false,
            direct_calls: true,
        }
    }
}

impl RetryConfig {
    pub fn to_options(&self) -> RetryOptions {
        RetryOptions {
            max_retries: self.max_retries,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff_multiplier: self.backoff_multiplier,
            use_jitter: self.use_jitter,
            on_retry: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub api_key: Option<String>,
    pub api_url: Option<String>,
    pub debug: bool,
    pub log_file: Option<String>,
    pub queue_file: Option<String>,
    /// Remote call timeout in seconds
    pub timeout: u64,
    pub sync_config: SyncConfig,
    pub retry_config: RetryConfig,
}

impl Config {
    pub fn load(config_path: &str) -> Result<Self, ConfigError> {
        let config_path = Self::resolve_path(config_path)?;

        if !config_path.exists() {
            tracing::debug!(path = %config_path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }

        let mut ini = Ini::new();

        let config_map = ini.load(&config_path).map_err(|e| {
            ConfigError::ParseError(format!(
                "Failed to load config from {}: {}",
                config_path.display(),
                e
            ))
        })?;

        let settings = config_map.get("settings").cloned().unwrap_or_default();
        let defaults = Self::default();

        Ok(Config {
            api_key: settings.get("api_key").and_then(|v| v.clone()),
            api_url: settings
                .get("api_url")
                .and_then(|v| v.clone())
                .or(defaults.api_url),
            debug: setting(&settings, "debug").unwrap_or(defaults.debug),
            log_file: settings.get("log_file").and_then(|v| v.clone()),
            queue_file: settings.get("queue_file").and_then(|v| v.clone()),
            timeout: setting(&settings, "timeout")
                .filter(|t: &u64| *t > 0)
                .unwrap_or(defaults.timeout),
            sync_config: Self::parse_sync_config(&settings),
            retry_config: Self::parse_retry_config(&settings),
        })
    }

    /// Expand `~/` and resolve relative paths against the current directory
    pub fn resolve_path(path: &str) -> Result<PathBuf, ConfigError> {
        if let Some(rest) = path.strip_prefix("~/") {
            if let Some(mut home) = home_dir() {
                home.push(rest);
                return Ok(home);
            }
            return Err(ConfigError::InvalidPath(path.to_string()));
        }

        let candidate = Path::new(path);
        if candidate.is_absolute() {
            return Ok(candidate.to_path_buf());
        }

        std::env::current_dir()
            .map(|current_dir| current_dir.join(candidate))
            .map_err(|_| ConfigError::InvalidPath(path.to_string()))
    }

    pub fn get_api_key(&self, cli_key: Option<&String>) -> Option<String> {
        cli_key.cloned().or_else(|| self.api_key.clone())
    }

    pub fn get_api_url(&self, cli_url: Option<&String>) -> String {
        cli_url
            .cloned()
            .or_else(|| self.api_url.clone())
            .unwrap_or_else(|| DEFAULT_API_URL.to_string())
    }

    /// Queue database location: CLI flag, then config file, then `None` for the default
    pub fn get_queue_path(&self, cli_path: Option<&String>) -> Result<Option<PathBuf>, ConfigError> {
        cli_path
            .or(self.queue_file.as_ref())
            .map(|p| Self::resolve_path(p))
            .transpose()
    }

    pub fn get_log_path(&self) -> Result<Option<PathBuf>, ConfigError> {
        self.log_file
            .as_deref()
            .map(Self::resolve_path)
            .transpose()
    }

    fn parse_sync_config(settings: &Settings) -> SyncConfig {
        let mut sync_config = SyncConfig::default();

        if let Some(enabled) = setting(settings, "sync_enabled") {
            sync_config.enabled = enabled;
        }

        if let Some(max_retries) = setting(settings, "sync_max_retries") {
            sync_config.max_retries = max_retries;
        }

        if let Some(background_sync) = setting(settings, "sync_background") {
            sync_config.background_sync = background_sync;
        }

        if let Some(interval) = setting(settings, "sync_interval").filter(|s: &u64| *s > 0) {
            sync_config.sync_interval_seconds = interval;
        }

        if let Some(interval) = setting(settings, "sync_probe_interval").filter(|s: &u64| *s > 0) {
            sync_config.probe_interval_seconds = interval;
        }

        sync_config
    }

    fn parse_retry_config(settings: &Settings) -> RetryConfig {
        let mut retry_config = RetryConfig::default();

        if let Some(max_retries) = setting(settings, "retry_max_retries") {
            retry_config.max_retries = max_retries;
        }

        if let Some(initial_delay) = setting(settings, "retry_initial_delay_ms") {
            retry_config.initial_delay_ms = initial_delay;
        }

        if let Some(max_delay) = setting(settings, "retry_max_delay_ms") {
            retry_config.max_delay_ms = max_delay;
        }

        if let Some(multiplier) =
            setting(settings, "retry_backoff_multiplier").filter(|m: &f64| m.is_finite() && *m >= 1.0)
        {
            retry_config.backoff_multiplier = multiplier;
        }

        if let Some(use_jitter) = setting(settings, "retry_use_jitter") {
            retry_config.use_jitter = use_jitter;
        }

        if let Some(direct_calls) = setting(settings, "retry_direct_calls") {
            retry_config.direct_calls = direct_calls;
        }

        retry_config
    }
}

/// Parse one `[settings]` value, ignoring missing or malformed entries
fn setting<T: FromStr>(settings: &Settings, key: &str) -> Option<T> {
    settings
        .get(key)
        .and_then(|s| s.as_ref().and_then(|v| v.trim().parse().ok()))
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: None,
            api_url: Some(DEFAULT_API_URL.to_string()),
            debug: false,
            log_file: None,
            queue_file: None,
            timeout: 30,
            sync_config: SyncConfig::default(),
            retry_config: RetryConfig::default(),
        }
    }
}
