//! TOML Configuration File Support
//!
//! Centralized configuration loading for the relay, backed by a TOML file at
//! `~/.config/chat-relay/relay.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments (via [`ConfigOverrides`])
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [matrix]
//! homeserver = "https://matrix.example.org"
//! bot_user = "@relay:example.org"
//! access_token_file = "~/.chat-relay/token"
//! encryption = true
//! store_path = "~/.chat-relay/store"
//!
//! [access]
//! allowed_users = ["@alice:example.org"]
//! allowed_rooms = []
//!
//! [assistant]
//! command = "claude"
//! working_directory = "~/.dotfiles"
//! command_timeout = 300
//! max_response_length = 4000
//!
//! [response]
//! context_preamble = "You are running on {env_profile}."
//! truncation_suffix = "... [Response truncated]"
//!
//! [database]
//! path = "~/.chat-relay/sessions.db"
//!
//! [sessions]
//! max_idle_hours = 24
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default continuation-id patterns, tried in order against the assistant's
/// diagnostic output. The first capture group is the id.
pub const DEFAULT_CONTINUATION_PATTERNS: [&str; 2] = [
    r"session[_\s]*(?:id)?[:\s]+([a-zA-Z0-9_-]+)",
    r"resuming\s+([a-zA-Z0-9_-]+)",
];

/// Default suffix appended to truncated responses
pub const DEFAULT_TRUNCATION_SUFFIX: &str = "... [Response truncated]";

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {}: {source}", .path.display())]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// `[matrix]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MatrixToml {
    /// Homeserver base URL
    pub homeserver: Option<String>,
    /// Fully-qualified bot user id
    pub bot_user: Option<String>,
    /// File holding the bot's access token
    pub access_token_file: Option<String>,
    /// Long-poll timeout for sync requests in milliseconds
    pub sync_timeout_ms: Option<u64>,
    /// Use the end-to-end encrypted client
    pub encryption: Option<bool>,
    /// Directory of the persistent crypto store
    pub store_path: Option<String>,
}

/// `[access]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessToml {
    /// Users allowed to talk to the bot
    pub allowed_users: Option<Vec<String>>,
    /// Rooms the bot answers in (empty = all rooms)
    pub allowed_rooms: Option<Vec<String>>,
}

/// `[assistant]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AssistantToml {
    /// Executable to run for each turn
    pub command: Option<String>,
    /// Working directory for new sessions
    pub working_directory: Option<String>,
    /// Per-turn timeout in seconds
    pub command_timeout: Option<u64>,
    /// Pass the permission-bypass flag to the assistant
    pub dangerously_skip_permissions: Option<bool>,
    /// Maximum characters shown to the user per reply
    pub max_response_length: Option<usize>,
    /// Regexes used to find the continuation id in diagnostic output
    pub continuation_patterns: Option<Vec<String>>,
}

/// `[response]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponseToml {
    /// Preamble prepended to every turn; `{env_profile}` is substituted
    pub context_preamble: Option<String>,
    /// Suffix appended to truncated replies
    pub truncation_suffix: Option<String>,
    /// Value substituted for `{env_profile}`
    pub env_profile: Option<String>,
}

/// `[database]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseToml {
    /// SQLite file path
    pub path: Option<String>,
}

/// `[sessions]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsToml {
    /// Idle age after which continuation ids are cleared
    pub max_idle_hours: Option<u64>,
    /// How often the idle sweep runs
    pub sweep_interval_secs: Option<u64>,
}

/// `[logging]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingToml {
    /// Log level (trace, debug, info, warn, error)
    pub level: Option<String>,
    /// Optional log file; stderr when unset
    pub file: Option<String>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayToml {
    /// Homeserver connection
    pub matrix: MatrixToml,
    /// Allow-lists
    pub access: AccessToml,
    /// Assistant process
    pub assistant: AssistantToml,
    /// Reply shaping
    pub response: ResponseToml,
    /// Persistence
    pub database: DatabaseToml,
    /// Session maintenance
    pub sessions: SessionsToml,
    /// Log output
    pub logging: LoggingToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Centralized configuration for the relay
///
/// Use [`load_config_from_path`] to load with proper priority handling and
/// [`RelayConfig::validate`] before starting anything.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Homeserver base URL
    pub homeserver: String,
    /// Bot identity
    pub bot_user: String,
    /// Where the access token is read from
    pub access_token_file: Option<PathBuf>,
    /// Sync long-poll timeout
    pub sync_timeout: Duration,
    /// Whether the end-to-end encrypted client is used
    pub encryption: bool,
    /// Crypto store directory (keys, device trust)
    pub store_path: PathBuf,

    /// Users allowed to use the bot (empty = nobody)
    pub allowed_users: Vec<String>,
    /// Rooms the bot answers in (empty = every room)
    pub allowed_rooms: Vec<String>,

    /// Assistant executable
    pub assistant_command: String,
    /// Working directory given to new sessions
    pub default_working_dir: PathBuf,
    /// Overall timeout for one assistant call
    pub command_timeout: Duration,
    /// Whether the permission-bypass flag is passed
    pub skip_permissions: bool,
    /// Maximum characters shown to the user
    pub max_response_length: usize,
    /// Continuation-id patterns, tried in order
    pub continuation_patterns: Vec<String>,

    /// Preamble template (may contain `{env_profile}`)
    pub context_preamble: Option<String>,
    /// Suffix for truncated replies
    pub truncation_suffix: String,
    /// Substitution for `{env_profile}`
    pub env_profile: String,

    /// Session database location
    pub database_path: PathBuf,

    /// Idle age before the sweep clears a continuation id
    pub max_idle_hours: u64,
    /// Interval between sweeps
    pub sweep_interval: Duration,

    /// Log level
    pub log_level: String,
    /// Log file (stderr when `None`)
    pub log_file: Option<PathBuf>,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    /// Source of configuration values
    source: ConfigSource,
}

impl Default for RelayConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            homeserver: String::new(),
            bot_user: String::new(),
            access_token_file: None,
            sync_timeout: Duration::from_secs(30),
            encryption: true,
            store_path: data_dir.join("store"),
            allowed_users: Vec::new(),
            allowed_rooms: Vec::new(),
            assistant_command: "claude".to_string(),
            default_working_dir: dirs::home_dir().unwrap_or_else(|| PathBuf::from("/")),
            command_timeout: Duration::from_secs(300),
            skip_permissions: false,
            max_response_length: 4000,
            continuation_patterns: DEFAULT_CONTINUATION_PATTERNS
                .iter()
                .map(ToString::to_string)
                .collect(),
            context_preamble: None,
            truncation_suffix: DEFAULT_TRUNCATION_SUFFIX.to_string(),
            env_profile: "relay".to_string(),
            database_path: data_dir.join("sessions.db"),
            max_idle_hours: 24,
            sweep_interval: Duration::from_secs(3600),
            log_level: "info".to_string(),
            log_file: None,
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl RelayConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// The preamble with `{env_profile}` substituted, if one is configured
    #[must_use]
    pub fn rendered_preamble(&self) -> Option<String> {
        self.context_preamble
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .map(|p| p.replace("{env_profile}", &self.env_profile))
    }

    /// Check that the configuration can start a relay
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] naming the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.homeserver.starts_with("https://") || self.homeserver.starts_with("http://")) {
            return Err(ConfigError::ValidationError(format!(
                "matrix.homeserver must be an http(s) URL, got {:?}",
                self.homeserver
            )));
        }
        if !is_user_id(&self.bot_user) {
            return Err(ConfigError::ValidationError(format!(
                "matrix.bot_user must look like @name:server, got {:?}",
                self.bot_user
            )));
        }
        if self.access_token_file.is_none() {
            return Err(ConfigError::ValidationError(
                "matrix.access_token_file is required".to_string(),
            ));
        }
        if self.command_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "assistant.command_timeout must be greater than zero".to_string(),
            ));
        }
        if self.assistant_command.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "assistant.command must not be empty".to_string(),
            ));
        }
        if !self.default_working_dir.is_absolute() {
            return Err(ConfigError::ValidationError(format!(
                "assistant.working_directory must be an absolute path, got {:?}",
                self.default_working_dir
            )));
        }
        if self.truncation_suffix.chars().count() >= self.max_response_length {
            return Err(ConfigError::ValidationError(format!(
                "response.truncation_suffix ({} chars) must be shorter than \
                 assistant.max_response_length ({})",
                self.truncation_suffix.chars().count(),
                self.max_response_length
            )));
        }
        for pattern in &self.continuation_patterns {
            let compiled = Regex::new(pattern).map_err(|e| {
                ConfigError::ValidationError(format!("bad continuation pattern {pattern:?}: {e}"))
            })?;
            if compiled.captures_len() < 2 {
                return Err(ConfigError::ValidationError(format!(
                    "continuation pattern {pattern:?} needs a capture group"
                )));
            }
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "sessions.sweep_interval_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn is_user_id(value: &str) -> bool {
    value
        .strip_prefix('@')
        .and_then(|rest| rest.split_once(':'))
        .is_some_and(|(local, server)| !local.is_empty() && !server.is_empty())
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".chat-relay"))
        .unwrap_or_else(|| PathBuf::from(".chat-relay"))
}

/// Expand a leading `~` to the user's home directory
#[must_use]
pub fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from(path));
    }
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/chat-relay/relay.toml` or
/// `~/.config/chat-relay/relay.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("chat-relay").join("relay.toml"))
}

/// Load configuration from the default path
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed.
pub fn load_config() -> Result<RelayConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// A missing file is not an error (defaults and environment are used); the
/// caller decides whether the result is complete via [`RelayConfig::validate`].
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed,
/// or an environment override is malformed.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<RelayConfig, ConfigError> {
    let mut config = RelayConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: RelayToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config)?;

    Ok(config)
}

/// Parse configuration from a TOML string (no environment applied)
///
/// # Errors
///
/// Returns [`ConfigError::ParseError`] on malformed TOML.
pub fn config_from_toml_str(content: &str) -> Result<RelayConfig, ConfigError> {
    let mut config = RelayConfig::default();
    let toml_config: RelayToml = toml::from_str(content)?;
    apply_toml_config(&mut config, &toml_config);
    config.source = ConfigSource::File;
    Ok(config)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut RelayConfig, toml: &RelayToml) {
    // Matrix
    if let Some(ref homeserver) = toml.matrix.homeserver {
        config.homeserver = homeserver.trim_end_matches('/').to_string();
    }
    if let Some(ref user) = toml.matrix.bot_user {
        config.bot_user.clone_from(user);
    }
    if let Some(ref file) = toml.matrix.access_token_file {
        config.access_token_file = Some(expand_tilde(file));
    }
    if let Some(ms) = toml.matrix.sync_timeout_ms {
        config.sync_timeout = Duration::from_millis(ms);
    }
    if let Some(encryption) = toml.matrix.encryption {
        config.encryption = encryption;
    }
    if let Some(ref path) = toml.matrix.store_path {
        config.store_path = expand_tilde(path);
    }

    // Access
    if let Some(ref users) = toml.access.allowed_users {
        config.allowed_users.clone_from(users);
    }
    if let Some(ref rooms) = toml.access.allowed_rooms {
        config.allowed_rooms.clone_from(rooms);
    }

    // Assistant
    if let Some(ref command) = toml.assistant.command {
        config.assistant_command.clone_from(command);
    }
    if let Some(ref dir) = toml.assistant.working_directory {
        config.default_working_dir = expand_tilde(dir);
    }
    if let Some(secs) = toml.assistant.command_timeout {
        config.command_timeout = Duration::from_secs(secs);
    }
    if let Some(skip) = toml.assistant.dangerously_skip_permissions {
        config.skip_permissions = skip;
    }
    if let Some(max) = toml.assistant.max_response_length {
        config.max_response_length = max;
    }
    if let Some(ref patterns) = toml.assistant.continuation_patterns {
        config.continuation_patterns.clone_from(patterns);
    }

    // Response
    if toml.response.context_preamble.is_some() {
        config.context_preamble.clone_from(&toml.response.context_preamble);
    }
    if let Some(ref suffix) = toml.response.truncation_suffix {
        config.truncation_suffix.clone_from(suffix);
    }
    if let Some(ref profile) = toml.response.env_profile {
        config.env_profile.clone_from(profile);
    }

    // Database
    if let Some(ref path) = toml.database.path {
        config.database_path = expand_tilde(path);
    }

    // Sessions
    if let Some(hours) = toml.sessions.max_idle_hours {
        config.max_idle_hours = hours;
    }
    if let Some(secs) = toml.sessions.sweep_interval_secs {
        config.sweep_interval = Duration::from_secs(secs);
    }

    // Logging
    if let Some(ref level) = toml.logging.level {
        config.log_level.clone_from(level);
    }
    if let Some(ref file) = toml.logging.file {
        config.log_file = Some(expand_tilde(file));
    }
}

/// Apply environment variable overrides to the config
fn apply_env_config(config: &mut RelayConfig) -> Result<(), ConfigError> {
    apply_env_from(config, |name| std::env::var(name).ok())
}

/// Apply overrides from any variable lookup
fn apply_env_from(
    config: &mut RelayConfig,
    var: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    if let Some(homeserver) = var("RELAY_HOMESERVER") {
        config.homeserver = homeserver.trim_end_matches('/').to_string();
        config.source = ConfigSource::Env;
    }
    if let Some(user) = var("RELAY_BOT_USER") {
        config.bot_user = user;
        config.source = ConfigSource::Env;
    }
    if let Some(file) = var("RELAY_ACCESS_TOKEN_FILE") {
        config.access_token_file = Some(expand_tilde(&file));
        config.source = ConfigSource::Env;
    }
    if let Some(timeout) = var("RELAY_COMMAND_TIMEOUT") {
        let secs = timeout.trim().parse::<u64>().map_err(|e| {
            ConfigError::ValidationError(format!(
                "RELAY_COMMAND_TIMEOUT must be a whole number of seconds, got {timeout:?}: {e}"
            ))
        })?;
        config.command_timeout = Duration::from_secs(secs);
        config.source = ConfigSource::Env;
    }
    if let Some(path) = var("RELAY_DATABASE_PATH") {
        config.database_path = expand_tilde(&path);
        config.source = ConfigSource::Env;
    }
    if let Some(level) = var("RELAY_LOG_LEVEL") {
        config.log_level = level;
        config.source = ConfigSource::Env;
    }
    if let Some(profile) = var("ENV_PROFILE") {
        config.env_profile = profile;
        config.source = ConfigSource::Env;
    }
    Ok(())
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Log level override
    pub log_level: Option<String>,
    /// Database path override
    pub database_path: Option<PathBuf>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set log level override
    #[must_use]
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = Some(level.into());
        self
    }

    /// Set database path override
    #[must_use]
    pub fn with_database_path(mut self, path: impl AsRef<Path>) -> Self {
        self.database_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut RelayConfig) {
        if let Some(ref level) = self.log_level {
            config.log_level.clone_from(level);
            config.source = ConfigSource::Cli;
        }
        if let Some(ref path) = self.database_path {
            config.database_path.clone_from(path);
            config.source = ConfigSource::Cli;
        }
    }
}
