//! # Herald Configuration
//!
//! Configuration for the push server and the console-side event client.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     HERALD_PORT=8080                                                   │
//! │     HERALD_HEARTBEAT_SECS=120                                          │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/herald/herald.toml (Linux)                               │
//! │     ~/Library/Application Support/com.herald.herald/herald.toml (macOS)│
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     heartbeat 120s, reconnect 30s fixed, 10 attempts                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # herald.toml
//! [server]
//! bind_addr = "0.0.0.0"
//! port = 8080
//! events_path = "/admin/events"
//!
//! [push]
//! heartbeat_interval_secs = 120
//! write_timeout_ms = 5000
//! queue_capacity = 64
//!
//! [auth]
//! jwt_secret = "change-me"
//! session_cookie = "admin_session"
//!
//! [client]
//! events_url = "http://localhost:8080/admin/events"
//! reconnect = "fixed"              # fixed | exponential
//! reconnect_interval_secs = 30
//! max_reconnect_attempts = 10      # 0 = unlimited (not recommended)
//! idle_timeout_secs = 300          # 0 = never recycle a silent channel
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{BusError, BusResult};

// =============================================================================
// Server Settings
// =============================================================================

/// HTTP listener settings for the push endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Bind address (default: 0.0.0.0 for all interfaces).
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Listener port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Path of the push endpoint.
    #[serde(default = "default_events_path")]
    pub events_path: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_events_path() -> String {
    "/admin/events".to_string()
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            bind_addr: default_bind_addr(),
            port: default_port(),
            events_path: default_events_path(),
        }
    }
}

impl ServerSettings {
    /// Returns the full bind address.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}

// =============================================================================
// Push Settings
// =============================================================================

/// Push transport tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushSettings {
    /// Interval between heartbeat frames (seconds).
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Deadline for a single connection write during broadcast (milliseconds).
    /// A write that misses it counts as a failed write.
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,

    /// Envelopes buffered per connection before writes start waiting.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_heartbeat_interval() -> u64 {
    120
}

fn default_write_timeout() -> u64 {
    5_000
}

fn default_queue_capacity() -> usize {
    64
}

impl Default for PushSettings {
    fn default() -> Self {
        PushSettings {
            heartbeat_interval_secs: default_heartbeat_interval(),
            write_timeout_ms: default_write_timeout(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl PushSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

// =============================================================================
// Auth Settings
// =============================================================================

/// Admission settings for the push endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSettings {
    /// HS256 secret used to verify admin session tokens.
    #[serde(default = "default_jwt_secret")]
    pub jwt_secret: String,

    /// Cookie carrying the session token when no bearer header is sent.
    #[serde(default = "default_session_cookie")]
    pub session_cookie: String,

    /// Lifetime of tokens issued by the admission layer (seconds).
    #[serde(default = "default_session_lifetime")]
    pub session_lifetime_secs: i64,
}

const DEV_JWT_SECRET: &str = "herald-dev-secret-change-in-production";

fn default_jwt_secret() -> String {
    // Development only, override with HERALD_JWT_SECRET in production.
    DEV_JWT_SECRET.to_string()
}

fn default_session_cookie() -> String {
    "admin_session".to_string()
}

fn default_session_lifetime() -> i64 {
    8 * 3600
}

impl AuthSettings {
    /// True while the built-in development secret is in use.
    pub fn uses_dev_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }
}

impl Default for AuthSettings {
    fn default() -> Self {
        AuthSettings {
            jwt_secret: default_jwt_secret(),
            session_cookie: default_session_cookie(),
            session_lifetime_secs: default_session_lifetime(),
        }
    }
}

// =============================================================================
// Client Settings
// =============================================================================

/// Reconnect delay policy for the event client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectMode {
    /// Same delay before every attempt.
    #[default]
    Fixed,

    /// Doubling delay up to a ceiling.
    Exponential,
}

impl std::fmt::Display for ReconnectMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReconnectMode::Fixed => write!(f, "fixed"),
            ReconnectMode::Exponential => write!(f, "exponential"),
        }
    }
}

impl std::str::FromStr for ReconnectMode {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fixed" | "constant" => Ok(ReconnectMode::Fixed),
            "exponential" | "backoff" => Ok(ReconnectMode::Exponential),
            other => Err(BusError::InvalidConfig(format!(
                "Unknown reconnect mode: '{}'. Valid options: fixed, exponential",
                other
            ))),
        }
    }
}

/// Settings for the console-side event client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSettings {
    /// Full URL of the push endpoint.
    #[serde(default = "default_events_url")]
    pub events_url: String,

    /// Reconnect delay policy.
    #[serde(default)]
    pub reconnect: ReconnectMode,

    /// Delay between attempts in fixed mode (seconds).
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_secs: u64,

    /// First delay in exponential mode (milliseconds).
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Delay ceiling in exponential mode (seconds).
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    /// Consecutive failed attempts before giving up (0 = retry forever).
    #[serde(default = "default_max_attempts")]
    pub max_reconnect_attempts: u32,

    /// Silence after which an open channel is treated as dead (0 = never).
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Channel open timeout (seconds).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_events_url() -> String {
    "http://localhost:8080/admin/events".to_string()
}
fn default_reconnect_interval() -> u64 {
    30
}
fn default_initial_backoff() -> u64 {
    1_000
}
fn default_max_backoff() -> u64 {
    60
}
fn default_max_attempts() -> u32 {
    10
}
fn default_idle_timeout() -> u64 {
    300
}
fn default_connect_timeout() -> u64 {
    10
}

impl Default for ClientSettings {
    fn default() -> Self {
        ClientSettings {
            events_url: default_events_url(),
            reconnect: ReconnectMode::default(),
            reconnect_interval_secs: default_reconnect_interval(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
            max_reconnect_attempts: default_max_attempts(),
            idle_timeout_secs: default_idle_timeout(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl ClientSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Attempt cap, `None` when unlimited.
    pub fn reconnect_cap(&self) -> Option<u32> {
        (self.max_reconnect_attempts > 0).then_some(self.max_reconnect_attempts)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}

// =============================================================================
// Main Configuration
// =============================================================================

/// Complete Herald configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeraldConfig {
    /// HTTP listener settings.
    #[serde(default)]
    pub server: ServerSettings,

    /// Push transport settings.
    #[serde(default)]
    pub push: PushSettings,

    /// Admission settings.
    #[serde(default)]
    pub auth: AuthSettings,

    /// Event client settings.
    #[serde(default)]
    pub client: ClientSettings,
}

impl HeraldConfig {
    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (herald.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> BusResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading herald config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load herald config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> BusResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| BusError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Herald config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> BusResult<()> {
        if !self.server.events_path.starts_with('/') {
            return Err(BusError::InvalidConfig(format!(
                "events_path must start with '/', got: {}",
                self.server.events_path
            )));
        }

        if self.push.heartbeat_interval_secs == 0 {
            return Err(BusError::InvalidConfig(
                "heartbeat_interval_secs must be greater than 0".into(),
            ));
        }

        if self.push.write_timeout_ms == 0 {
            return Err(BusError::InvalidConfig(
                "write_timeout_ms must be greater than 0".into(),
            ));
        }

        if self.push.queue_capacity == 0 {
            return Err(BusError::InvalidConfig(
                "queue_capacity must be greater than 0".into(),
            ));
        }

        if self.auth.jwt_secret.is_empty() {
            return Err(BusError::InvalidConfig("jwt_secret must not be empty".into()));
        }

        let url = url::Url::parse(&self.client.events_url)?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(BusError::InvalidUrl(format!(
                "Events URL must start with http:// or https://, got: {}",
                self.client.events_url
            )));
        }

        match self.client.reconnect {
            ReconnectMode::Fixed if self.client.reconnect_interval_secs == 0 => {
                return Err(BusError::InvalidConfig(
                    "reconnect_interval_secs must be greater than 0".into(),
                ));
            }
            ReconnectMode::Exponential if self.client.initial_backoff_ms == 0 => {
                return Err(BusError::InvalidConfig(
                    "initial_backoff_ms must be greater than 0".into(),
                ));
            }
            _ => {}
        }

        if self.client.connect_timeout_secs == 0 {
            return Err(BusError::InvalidConfig(
                "connect_timeout_secs must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("HERALD_BIND_ADDR") {
            self.server.bind_addr = addr;
        }

        if let Ok(port) = std::env::var("HERALD_PORT") {
            if let Ok(p) = port.parse::<u16>() {
                debug!(port = p, "Overriding port from environment");
                self.server.port = p;
            }
        }

        if let Ok(secs) = std::env::var("HERALD_HEARTBEAT_SECS") {
            if let Ok(s) = secs.parse::<u64>() {
                self.push.heartbeat_interval_secs = s;
            }
        }

        if let Ok(ms) = std::env::var("HERALD_WRITE_TIMEOUT_MS") {
            if let Ok(m) = ms.parse::<u64>() {
                self.push.write_timeout_ms = m;
            }
        }

        if let Ok(secret) = std::env::var("HERALD_JWT_SECRET") {
            debug!("Overriding JWT secret from environment");
            self.auth.jwt_secret = secret;
        }

        if let Ok(url) = std::env::var("HERALD_EVENTS_URL") {
            debug!(url = %url, "Overriding events URL from environment");
            self.client.events_url = url;
        }

        if let Ok(mode) = std::env::var("HERALD_RECONNECT_MODE") {
            match mode.parse() {
                Ok(parsed) => self.client.reconnect = parsed,
                Err(_) => warn!(mode = %mode, "Unknown reconnect mode in environment"),
            }
        }

        if let Ok(secs) = std::env::var("HERALD_RECONNECT_SECS") {
            if let Ok(s) = secs.parse::<u64>() {
                self.client.reconnect_interval_secs = s;
            }
        }

        if let Ok(attempts) = std::env::var("HERALD_MAX_RECONNECT_ATTEMPTS") {
            match attempts.to_lowercase().as_str() {
                "unlimited" => self.client.max_reconnect_attempts = 0,
                other => {
                    if let Ok(n) = other.parse::<u32>() {
                        self.client.max_reconnect_attempts = n;
                    }
                }
            }
        }
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "herald", "herald")
            .map(|dirs| dirs.config_dir().join("herald.toml"))
    }
}
