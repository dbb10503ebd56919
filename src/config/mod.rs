//! Configuration parsing module
//!
//! Handles the JSON5 configuration file with environment variable
//! substitution, then deserializes it into a typed [`Config`]. Every field has
//! a default, so a missing file or an empty object is a valid configuration.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::reconnect::ReconnectSettings;
use crate::supervisor::SupervisorSettings;
use crate::webhooks::DispatchSettings;

const CONFIG_FILE_NAME: &str = "wamux.json5";
const STATE_DIR_NAME: &str = ".wamux";

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse JSON5 at {path}: {message}")]
    ParseError { path: String, message: String },

    #[error("Failed to read config file {path}: {message}")]
    ReadError { path: String, message: String },

    #[error("Missing environment variable: {var}")]
    MissingEnvVar { var: String },

    #[error("Validation error at {path}: {message}")]
    ValidationError { path: String, message: String },
}

/// Root configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub logging: LoggingConfig,
    pub sessions: SessionsConfig,
    pub reconnect: ReconnectConfig,
    pub webhooks: WebhooksConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// `json` or `plaintext`
    pub format: String,
    /// Default level when neither `WAMUX_LOG` nor `RUST_LOG` is set
    pub level: String,
    /// Write to stderr instead of stdout
    pub stderr: bool,
    /// Write to this file instead of a standard stream
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: "plaintext".to_string(),
            level: "info".to_string(),
            stderr: false,
            file: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionsConfig {
    /// Directory for session records; defaults to the state directory
    pub state_dir: Option<PathBuf>,
    pub qr_timeout_secs: u64,
    pub qr_max_refreshes: u32,
    pub pair_code_timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        let defaults = SupervisorSettings::default();
        Self {
            state_dir: None,
            qr_timeout_secs: defaults.qr_timeout.as_secs(),
            qr_max_refreshes: defaults.qr_max_refreshes,
            pair_code_timeout_secs: defaults.pair_code_timeout.as_secs(),
            connect_timeout_secs: defaults.connect_timeout.as_secs(),
        }
    }
}

impl SessionsConfig {
    pub fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            qr_timeout: Duration::from_secs(self.qr_timeout_secs),
            qr_max_refreshes: self.qr_max_refreshes,
            pair_code_timeout: Duration::from_secs(self.pair_code_timeout_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
        }
    }

    /// Where session records live: the configured directory, else
    /// `<state dir>/sessions`.
    pub fn resolve_state_dir(&self) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(|| get_state_dir().join("sessions"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReconnectConfig {
    pub enabled: bool,
    pub settle_delay_ms: u64,
    pub spacing_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        let defaults = ReconnectSettings::default();
        Self {
            enabled: defaults.enabled,
            settle_delay_ms: defaults.settle_delay.as_millis() as u64,
            spacing_ms: defaults.spacing.as_millis() as u64,
        }
    }
}

impl ReconnectConfig {
    pub fn settings(&self) -> ReconnectSettings {
        ReconnectSettings {
            enabled: self.enabled,
            settle_delay: Duration::from_millis(self.settle_delay_ms),
            spacing: Duration::from_millis(self.spacing_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WebhooksConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub request_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
    /// JSON5 array of webhook endpoint configs
    pub file: Option<PathBuf>,
}

impl Default for WebhooksConfig {
    fn default() -> Self {
        let defaults = DispatchSettings::default();
        Self {
            workers: defaults.workers,
            queue_capacity: defaults.queue_capacity,
            max_attempts: defaults.max_attempts,
            initial_backoff_ms: defaults.initial_backoff.as_millis() as u64,
            max_backoff_ms: defaults.max_backoff.as_millis() as u64,
            request_timeout_ms: 10_000,
            shutdown_timeout_ms: defaults.shutdown_timeout.as_millis() as u64,
            file: None,
        }
    }
}

impl WebhooksConfig {
    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            workers: self.workers,
            queue_capacity: self.queue_capacity,
            max_attempts: self.max_attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            shutdown_timeout: Duration::from_millis(self.shutdown_timeout_ms),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Config {
    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(path: &str, message: &str) -> ConfigError {
            ConfigError::ValidationError {
                path: path.to_string(),
                message: message.to_string(),
            }
        }

        if self.webhooks.workers == 0 {
            return Err(invalid("webhooks.workers", "must be at least 1"));
        }
        if self.webhooks.queue_capacity == 0 {
            return Err(invalid("webhooks.queue_capacity", "must be at least 1"));
        }
        if self.webhooks.max_attempts == 0 {
            return Err(invalid("webhooks.max_attempts", "must be at least 1"));
        }
        if self.webhooks.request_timeout_ms == 0 {
            return Err(invalid("webhooks.request_timeout_ms", "must be positive"));
        }
        if self.webhooks.initial_backoff_ms > self.webhooks.max_backoff_ms {
            return Err(invalid(
                "webhooks.initial_backoff_ms",
                "must not exceed max_backoff_ms",
            ));
        }
        if self.sessions.qr_timeout_secs == 0 {
            return Err(invalid("sessions.qr_timeout_secs", "must be positive"));
        }
        if self.sessions.pair_code_timeout_secs == 0 {
            return Err(invalid("sessions.pair_code_timeout_secs", "must be positive"));
        }
        if self.sessions.connect_timeout_secs == 0 {
            return Err(invalid("sessions.connect_timeout_secs", "must be positive"));
        }
        Ok(())
    }
}

/// The state directory: `WAMUX_STATE_DIR`, else `~/.wamux`.
pub fn get_state_dir() -> PathBuf {
    if let Ok(dir) = env::var("WAMUX_STATE_DIR") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(STATE_DIR_NAME)
}

/// Get the config file path.
/// Priority: WAMUX_CONFIG_PATH > WAMUX_STATE_DIR/wamux.json5 > ~/.wamux/wamux.json5
pub fn get_config_path() -> PathBuf {
    if let Ok(path) = env::var("WAMUX_CONFIG_PATH") {
        return PathBuf::from(path);
    }
    get_state_dir().join(CONFIG_FILE_NAME)
}

/// Load the configuration from [`get_config_path`].
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&get_config_path())
}

/// Load, substitute, deserialize and validate the config at `path`.
/// A missing file yields the defaults.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        debug!(target: "config", path = %path.display(), "config file not found, using defaults");
        return Ok(Config::default());
    }

    let content = fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    let mut value = parse_json5(&content, path)?;
    substitute_env_vars(&mut value)?;

    let config: Config = serde_json::from_value(value).map_err(|e| ConfigError::ParseError {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    config.validate()?;

    debug!(target: "config", path = %path.display(), "config loaded");
    Ok(config)
}

/// Parse JSON5 content
fn parse_json5(content: &str, path: &Path) -> Result<Value, ConfigError> {
    json5::from_str(content).map_err(|e| ConfigError::ParseError {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

/// Substitute environment variables in string values.
/// Pattern: ${VAR} where VAR matches [A-Z_][A-Z0-9_]*
/// Escape with $${VAR} to get literal ${VAR}
fn substitute_env_vars(value: &mut Value) -> Result<(), ConfigError> {
    match value {
        Value::String(s) => {
            *s = substitute_env_in_string(s)?;
        }
        Value::Object(obj) => {
            for (_, v) in obj.iter_mut() {
                substitute_env_vars(v)?;
            }
        }
        Value::Array(arr) => {
            for item in arr.iter_mut() {
                substitute_env_vars(item)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Substitute environment variables in a single string
fn substitute_env_in_string(s: &str) -> Result<String, ConfigError> {
    static ENV_VAR_PATTERN: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\$\$?\{([A-Z_][A-Z0-9_]*)\}").unwrap());

    let mut result = String::with_capacity(s.len());
    let mut last_end = 0;

    for caps in ENV_VAR_PATTERN.captures_iter(s) {
        let (Some(full_match), Some(var_name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let var_name = var_name.as_str();

        result.push_str(&s[last_end..full_match.start()]);

        if full_match.as_str().starts_with("$$") {
            result.push_str(&format!("${{{}}}", var_name));
        } else {
            let value = env::var(var_name).map_err(|_| ConfigError::MissingEnvVar {
                var: var_name.to_string(),
            })?;
            result.push_str(&value);
        }

        last_end = full_match.end();
    }

    result.push_str(&s[last_end..]);

    Ok(result)
}
