//! Configuration loading and validation
//!
//! Configuration is loaded from a TOML file, by default
//! `~/.config/isengard/config.toml`.
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/isengard/` (~/.config/isengard/)
//! - State/Logs: `$XDG_STATE_HOME/isengard/` (~/.local/state/isengard/)
//!
//! ## Example
//!
//! ```toml
//! name = "web-frontend"
//! directory = "/var/log/web"
//! file_pattern = "*.log"
//!
//! [tail]
//! poll_interval_ms = 250
//! missing_timeout_secs = 3600
//!
//! [pattern]
//! template = '^\[{timestamp}\]\[{level}\] {message}$'
//!
//! [pattern.definitions]
//! timestamp = '[^\]]+'
//! level = '[A-Z]+'
//! message = '.*'
//!
//! [[sinks]]
//! type = "s3"
//! name = "archive"
//! endpoint = "http://localhost:4566"
//! bucket = "logs"
//! region = "eu-west-1"
//! key_prefix = "web"
//!
//! [[sinks]]
//! type = "rollbar"
//! name = "errors"
//! url = "https://api.rollbar.com/api/1/item/"
//! levels = ["ERROR"]
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::bus::OverflowPolicy;
use crate::error::{Error, Result};
use crate::pattern::{LinePattern, MismatchPolicy};

/// Severity names a sink may filter on.
pub const SUPPORTED_LEVELS: &[&str] = &["DEBUG", "INFO", "WARNING", "WARN", "ERROR"];

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
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Agent name, used to tag log output
    #[serde(default)]
    pub name: String,

    /// Directory whose files are tailed (non-recursive)
    #[serde(default)]
    pub directory: PathBuf,

    /// Optional glob restricting which file names are tailed (e.g. `*.log`)
    #[serde(default)]
    pub file_pattern: Option<String>,

    /// Tail polling behaviour
    #[serde(default)]
    pub tail: TailConfig,

    /// Optional line structuring pattern
    #[serde(default)]
    pub pattern: Option<PatternConfig>,

    /// Shutdown behaviour
    #[serde(default)]
    pub shutdown: ShutdownConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Remote sinks, in delivery order
    #[serde(default)]
    pub sinks: Vec<SinkConfig>,
}

/// Tail polling configuration
#[derive(Debug, Deserialize, Clone)]
pub struct TailConfig {
    /// How long a tail sleeps at end of file before checking for growth
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Stop following a file whose path has been gone this long; unset waits
    /// for it forever
    #[serde(default)]
    pub missing_timeout_secs: Option<u64>,
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            missing_timeout_secs: None,
        }
    }
}

impl TailConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn missing_timeout(&self) -> Option<Duration> {
        self.missing_timeout_secs.map(Duration::from_secs)
    }
}

fn default_poll_interval_ms() -> u64 {
    250
}

/// Line structuring configuration
///
/// `{name}` placeholders in the template are replaced by the matching
/// definition wrapped in a named capture group.
#[derive(Debug, Deserialize, Clone)]
pub struct PatternConfig {
    /// Regular expression template with `{name}` placeholders
    #[serde(default)]
    pub template: String,

    /// Sub-patterns by name
    #[serde(default)]
    pub definitions: BTreeMap<String, String>,

    /// What to do with lines that do not match
    #[serde(default)]
    pub on_mismatch: MismatchPolicy,
}

impl PatternConfig {
    /// Compile into a [`LinePattern`].
    pub fn compile(&self) -> Result<LinePattern> {
        LinePattern::compile(&self.template, &self.definitions, self.on_mismatch)
    }
}

/// Shutdown configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ShutdownConfig {
    /// Seconds to wait for tails and dispatch loops to finish before aborting them
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_secs: default_grace_secs(),
        }
    }
}

impl ShutdownConfig {
    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }
}

fn default_grace_secs() -> u64 {
    10
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Also write logs to a daily rotated file in the state directory
    #[serde(default)]
    pub file: bool,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: false,
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

/// One configured sink
#[derive(Debug, Deserialize, Clone)]
pub struct SinkConfig {
    /// Unique sink name, used in logs
    #[serde(default)]
    pub name: String,

    /// Backend type and its fields
    #[serde(flatten)]
    pub backend: BackendConfig,

    /// Only deliver lines with one of these levels (empty = everything)
    #[serde(default)]
    pub levels: Vec<String>,

    /// Capacity of this sink's delivery channel
    #[serde(default = "default_sink_buffer")]
    pub buffer: usize,

    /// What the bus does when the channel is full
    #[serde(default)]
    pub overflow: OverflowPolicy,

    /// Deadline for a single send (none = wait forever)
    #[serde(default)]
    pub send_timeout_secs: Option<u64>,
}

fn default_sink_buffer() -> usize {
    1
}

impl SinkConfig {
    /// Backend type discriminant as written in the config file.
    pub fn kind(&self) -> &'static str {
        self.backend.kind()
    }

    pub fn send_timeout(&self) -> Option<Duration> {
        self.send_timeout_secs.map(Duration::from_secs)
    }

    /// Validate common and backend-specific fields.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Config(format!(
                "sinks: a '{}' sink is missing its 'name'",
                self.kind()
            )));
        }
        for level in &self.levels {
            if !SUPPORTED_LEVELS.contains(&level.as_str()) {
                return Err(Error::Config(format!(
                    "sinks.{}: invalid value for level: {}",
                    self.name, level
                )));
            }
        }
        if self.buffer == 0 {
            return Err(Error::Config(format!(
                "sinks.{}.buffer must be at least 1",
                self.name
            )));
        }
        if self.send_timeout_secs == Some(0) {
            return Err(Error::Config(format!(
                "sinks.{}.send_timeout_secs must be greater than 0",
                self.name
            )));
        }

        let missing = self.backend.missing_fields();
        if !missing.is_empty() {
            return Err(Error::Config(format!(
                "sinks.{}: missing field(s) for '{}' sink: {}",
                self.name,
                self.kind(),
                missing.join(", ")
            )));
        }
        Ok(())
    }
}

/// Backend-specific sink configuration, selected by the `type` key.
#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    /// S3-compatible object store
    S3(S3SinkConfig),
    /// Kafka broker
    Kafka(KafkaSinkConfig),
    /// Rollbar-compatible error tracker
    Rollbar(RollbarSinkConfig),
}

impl BackendConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            BackendConfig::S3(_) => "s3",
            BackendConfig::Kafka(_) => "kafka",
            BackendConfig::Rollbar(_) => "rollbar",
        }
    }

    fn missing_fields(&self) -> Vec<&'static str> {
        let fields: Vec<(&'static str, bool)> = match self {
            BackendConfig::S3(c) => vec![
                ("endpoint", c.endpoint.is_empty()),
                ("bucket", c.bucket.is_empty()),
                ("region", c.region.is_empty()),
                ("key_prefix", c.key_prefix.is_empty()),
            ],
            BackendConfig::Kafka(c) => vec![
                ("host", c.host.is_empty()),
                ("port", c.port == 0),
                ("topic", c.topic.is_empty()),
            ],
            BackendConfig::Rollbar(c) => vec![("url", c.url.is_empty())],
        };
        fields
            .into_iter()
            .filter(|(_, missing)| *missing)
            .map(|(name, _)| name)
            .collect()
    }
}

/// S3 sink fields
#[derive(Debug, Deserialize, Clone, Default)]
pub struct S3SinkConfig {
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub key_prefix: String,
}

/// Kafka sink fields
#[derive(Debug, Deserialize, Clone, Default)]
pub struct KafkaSinkConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub topic: String,
}

impl KafkaSinkConfig {
    /// `host:port` for `bootstrap.servers`.
    pub fn bootstrap_servers(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Rollbar sink fields
#[derive(Debug, Deserialize, Clone, Default)]
pub struct RollbarSinkConfig {
    #[serde(default)]
    pub url: String,
    /// Project access token, sent as `X-Rollbar-Access-Token`
    #[serde(default)]
    pub access_token: Option<String>,
    /// Environment name attached to every item
    #[serde(default = "default_rollbar_environment")]
    pub environment: String,
}

fn default_rollbar_environment() -> String {
    "production".to_string()
}

impl Config {
    /// Load configuration from `path`, or from the default path when `None`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from(path),
            None => Self::load_from(&Self::config_path()),
        }
    }

    /// Load and validate configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the whole configuration, returning the first problem found
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Config("name is required".to_string()));
        }

        if self.directory.as_os_str().is_empty() {
            return Err(Error::Config("directory is required".to_string()));
        }
        if !self.directory.exists() {
            return Err(Error::Config(format!(
                "directory {} does not exist",
                self.directory.display()
            )));
        }
        if !self.directory.is_dir() {
            return Err(Error::Config(format!(
                "directory {} is not a directory",
                self.directory.display()
            )));
        }

        if let Some(pattern) = &self.file_pattern {
            glob::Pattern::new(pattern)
                .map_err(|e| Error::Config(format!("file_pattern is not a valid glob: {}", e)))?;
        }

        if self.tail.poll_interval_ms == 0 {
            return Err(Error::Config(
                "tail.poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.tail.missing_timeout_secs == Some(0) {
            return Err(Error::Config(
                "tail.missing_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if let Some(pattern) = &self.pattern {
            if pattern.template.is_empty() {
                return Err(Error::Config(
                    "pattern.template is required when [pattern] is present".to_string(),
                ));
            }
            pattern.compile()?;
        }

        let mut names = HashSet::new();
        for sink in &self.sinks {
            sink.validate()?;
            if !names.insert(sink.name.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate sink name '{}'",
                    sink.name
                )));
            }
        }

        Ok(())
    }

    /// Compiled file name filter, if one is configured.
    pub fn file_filter(&self) -> Result<Option<glob::Pattern>> {
        self.file_pattern
            .as_deref()
            .map(|p| {
                glob::Pattern::new(p)
                    .map_err(|e| Error::Config(format!("file_pattern is not a valid glob: {}", e)))
            })
            .transpose()
    }

    /// Compiled line pattern, if one is configured.
    pub fn line_pattern(&self) -> Result<Option<LinePattern>> {
        self.pattern.as_ref().map(PatternConfig::compile).transpose()
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/isengard/config.toml` (~/.config/isengard/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("isengard").join("config.toml")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/isengard/` (~/.local/state/isengard/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("isengard")
    }

    /// Returns the log file prefix path
    ///
    /// `$XDG_STATE_HOME/isengard/isengard.log` (~/.local/state/isengard/isengard.log)
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("isengard.log")
    }
}
