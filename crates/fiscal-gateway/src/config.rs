//! # Gateway Configuration
//!
//! Configuration for the submission service, the authority client and the
//! retry worker.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     FISCAL_AUTHORITY_MODE=live                                         │
//! │     FISCAL_AUTHORITY_URL=https://etims.example.go.ke                   │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/fiscal-gateway/gateway.toml (Linux)                      │
//! │     ~/Library/Application Support/com.fiscal.gateway/gateway.toml      │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     mock authority, 60s/3600s backoff, 5 attempts                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # gateway.toml
//! [authority]
//! mode = "live"
//! base_url = "https://etims.example.go.ke"
//! timeout_secs = 30
//!
//! [retry]
//! base_delay_secs = 60
//! max_delay_secs = 3600
//! max_attempts = 5
//! poll_interval_secs = 30
//! workers = 4
//!
//! [security]
//! secret_key_path = "/etc/fiscal/secret.key"
//! strict_secret_key = true
//!
//! [database]
//! path = "/var/lib/fiscal/gateway.db"
//! ```
//!
//! The 24-hour offline window is statutory and has no setting here.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use fiscal_core::RetryPolicy;

use crate::error::{GatewayError, GatewayResult};

// =============================================================================
// Authority Mode
// =============================================================================

/// Which authority client the worker builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorityMode {
    /// In-process mock; no network.
    #[default]
    Mock,
    /// HTTP calls to `authority.base_url`.
    Live,
}

impl std::fmt::Display for AuthorityMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthorityMode::Mock => write!(f, "mock"),
            AuthorityMode::Live => write!(f, "live"),
        }
    }
}

impl std::str::FromStr for AuthorityMode {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "mock" | "sandbox-mock" => Ok(AuthorityMode::Mock),
            "live" | "http" => Ok(AuthorityMode::Live),
            other => Err(GatewayError::InvalidConfig(format!(
                "Unknown authority mode: '{}'. Valid options: mock, live",
                other
            ))),
        }
    }
}

// =============================================================================
// Authority Settings
// =============================================================================

/// Authority endpoint paths, relative to `base_url`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointPaths {
    #[serde(default = "default_init_path")]
    pub init_device: String,
    #[serde(default = "default_submit_path")]
    pub submit_invoice: String,
    #[serde(default = "default_status_path")]
    pub device_status: String,
}

fn default_init_path() -> String {
    "/api/v1/devices/init".to_string()
}

fn default_submit_path() -> String {
    "/api/v1/invoices".to_string()
}

fn default_status_path() -> String {
    "/api/v1/devices/status".to_string()
}

impl Default for EndpointPaths {
    fn default() -> Self {
        EndpointPaths {
            init_device: default_init_path(),
            submit_invoice: default_submit_path(),
            device_status: default_status_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthoritySettings {
    #[serde(default)]
    pub mode: AuthorityMode,

    /// Required in live mode.
    #[serde(default)]
    pub base_url: Option<String>,

    /// Per-call timeout (seconds).
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    #[serde(default)]
    pub paths: EndpointPaths,
}

fn default_timeout() -> u64 {
    30
}

impl Default for AuthoritySettings {
    fn default() -> Self {
        AuthoritySettings {
            mode: AuthorityMode::default(),
            base_url: None,
            timeout_secs: default_timeout(),
            paths: EndpointPaths::default(),
        }
    }
}

// =============================================================================
// Retry Settings
// =============================================================================

/// Backoff and worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_base_delay")]
    pub base_delay_secs: u64,

    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Interval between queue scans (seconds).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Due entries fetched per scan.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Concurrent retry attempts.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Invoices left in `sent` longer than this are recovered (seconds).
    #[serde(default = "default_stalled_sent")]
    pub stalled_sent_secs: u64,

    /// Consecutive permanent rejections per device before an admin alert.
    #[serde(default = "default_alert_threshold")]
    pub permanent_failure_alert_threshold: u32,
}

fn default_base_delay() -> u64 {
    60
}
fn default_max_delay() -> u64 {
    3600
}
fn default_max_attempts() -> u32 {
    5
}
fn default_poll_interval() -> u64 {
    30
}
fn default_batch_size() -> u32 {
    50
}
fn default_workers() -> usize {
    4
}
fn default_stalled_sent() -> u64 {
    300
}
fn default_alert_threshold() -> u32 {
    3
}

impl Default for RetrySettings {
    fn default() -> Self {
        RetrySettings {
            base_delay_secs: default_base_delay(),
            max_delay_secs: default_max_delay(),
            max_attempts: default_max_attempts(),
            poll_interval_secs: default_poll_interval(),
            batch_size: default_batch_size(),
            workers: default_workers(),
            stalled_sent_secs: default_stalled_sent(),
            permanent_failure_alert_threshold: default_alert_threshold(),
        }
    }
}

// =============================================================================
// Security Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecuritySettings {
    /// 32-byte hex key that encrypts device secrets at rest.
    #[serde(default)]
    pub secret_key_path: Option<PathBuf>,

    /// PKCS#8 PEM key used to sign payloads. Generated if missing.
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,

    #[serde(default)]
    pub public_key_path: Option<PathBuf>,

    /// Refuse to start without a secret key.
    #[serde(default = "default_true")]
    pub strict_secret_key: bool,
}

fn default_true() -> bool {
    true
}

impl Default for SecuritySettings {
    fn default() -> Self {
        SecuritySettings {
            secret_key_path: None,
            private_key_path: None,
            public_key_path: None,
            strict_secret_key: true,
        }
    }
}

// =============================================================================
// Database Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// SQLite file. Defaults to the platform data directory.
    #[serde(default)]
    pub path: Option<PathBuf>,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        DatabaseSettings {
            path: None,
            max_connections: default_max_connections(),
        }
    }
}

/// Mock authority settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MockSettings {
    /// TINs the mock authority accepts.
    #[serde(default)]
    pub registered_tins: Vec<String>,
}

// =============================================================================
// Main Gateway Configuration
// =============================================================================

/// Complete gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub authority: AuthoritySettings,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub security: SecuritySettings,

    #[serde(default)]
    pub database: DatabaseSettings,

    #[serde(default)]
    pub mock: MockSettings,
}

impl GatewayConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (gateway.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> GatewayResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading gateway config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_overrides_from(|key| std::env::var(key).ok());
        config.validate()?;

        Ok(config)
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> GatewayResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| GatewayError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Gateway config saved");
        Ok(())
    }

    pub fn validate(&self) -> GatewayResult<()> {
        if self.authority.mode == AuthorityMode::Live {
            let raw = self.authority.base_url.as_deref().ok_or_else(|| {
                GatewayError::InvalidConfig("authority.base_url is required in live mode".into())
            })?;
            let url = Url::parse(raw)?;
            if url.scheme() != "http" && url.scheme() != "https" {
                return Err(GatewayError::InvalidConfig(format!(
                    "Authority URL must be http or https, got: {}",
                    raw
                )));
            }
        }

        if self.authority.timeout_secs == 0 {
            return Err(GatewayError::InvalidConfig(
                "authority.timeout_secs must be greater than 0".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(GatewayError::InvalidConfig(
                "retry.max_attempts must be greater than 0".into(),
            ));
        }
        if self.retry.base_delay_secs == 0 || self.retry.base_delay_secs > self.retry.max_delay_secs {
            return Err(GatewayError::InvalidConfig(
                "retry delays must satisfy 0 < base_delay_secs <= max_delay_secs".into(),
            ));
        }
        if self.retry.batch_size == 0 || self.retry.workers == 0 {
            return Err(GatewayError::InvalidConfig(
                "retry.batch_size and retry.workers must be greater than 0".into(),
            ));
        }
        if self.retry.permanent_failure_alert_threshold == 0 {
            return Err(GatewayError::InvalidConfig(
                "retry.permanent_failure_alert_threshold must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Applies `FISCAL_*` overrides read through `lookup`.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(mode) = lookup("FISCAL_AUTHORITY_MODE") {
            match mode.parse() {
                Ok(parsed) => {
                    debug!(mode = %mode, "Overriding authority mode from environment");
                    self.authority.mode = parsed;
                }
                Err(_) => warn!(mode = %mode, "Unknown authority mode in environment"),
            }
        }

        if let Some(url) = lookup("FISCAL_AUTHORITY_URL") {
            debug!(url = %url, "Overriding authority URL from environment");
            self.authority.base_url = Some(url);
        }

        if let Some(secs) = lookup("FISCAL_AUTHORITY_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.authority.timeout_secs = secs;
        }

        if let Some(n) = lookup("FISCAL_RETRY_MAX_ATTEMPTS").and_then(|v| v.parse().ok()) {
            self.retry.max_attempts = n;
        }

        if let Some(secs) = lookup("FISCAL_RETRY_POLL_INTERVAL_SECS").and_then(|v| v.parse().ok()) {
            self.retry.poll_interval_secs = secs;
        }

        if let Some(n) = lookup("FISCAL_RETRY_WORKERS").and_then(|v| v.parse().ok()) {
            self.retry.workers = n;
        }

        if let Some(path) = lookup("FISCAL_SECRET_KEY_PATH") {
            self.security.secret_key_path = Some(PathBuf::from(path));
        }

        if let Some(path) = lookup("FISCAL_SIGNING_KEY_PATH") {
            self.security.private_key_path = Some(PathBuf::from(path));
        }

        if let Some(flag) = lookup("FISCAL_STRICT_SECRET_KEY") {
            match flag.to_lowercase().as_str() {
                "1" | "true" | "yes" => self.security.strict_secret_key = true,
                "0" | "false" | "no" => self.security.strict_secret_key = false,
                _ => warn!(value = %flag, "Unrecognised FISCAL_STRICT_SECRET_KEY value"),
            }
        }

        if let Some(path) = lookup("FISCAL_DATABASE_PATH") {
            self.database.path = Some(PathBuf::from(path));
        }

        if let Some(tins) = lookup("FISCAL_MOCK_TINS") {
            self.mock.registered_tins = tins
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect();
        }
    }

    fn default_config_path() -> Option<PathBuf> {
        Self::project_dirs().map(|dirs| dirs.config_dir().join("gateway.toml"))
    }

    fn project_dirs() -> Option<directories::ProjectDirs> {
        directories::ProjectDirs::from("com", "fiscal", "gateway")
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
            .with_delays(self.retry.base_delay_secs, self.retry.max_delay_secs)
            .with_max_attempts(self.retry.max_attempts)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.authority.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.retry.poll_interval_secs)
    }

    pub fn stalled_sent_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.retry.stalled_sent_secs).unwrap_or(i64::MAX))
    }

    /// Database file, falling back to the platform data directory.
    pub fn database_path(&self) -> Option<PathBuf> {
        self.database.path.clone().or_else(|| {
            Self::project_dirs().map(|dirs| dirs.data_dir().join("gateway.db"))
        })
    }

    /// Signing key pair paths, falling back to the platform data directory.
    pub fn signing_key_paths(&self) -> Option<(PathBuf, PathBuf)> {
        let private = self
            .security
            .private_key_path
            .clone()
            .or_else(|| Self::project_dirs().map(|d| d.data_dir().join("signing.pem")))?;
        let public = self
            .security
            .public_key_path
            .clone()
            .unwrap_or_else(|| private.with_extension("pub.pem"));
        Some((private, public))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_mode_parsing() {
        assert_eq!("mock".parse::<AuthorityMode>().unwrap(), AuthorityMode::Mock);
        assert_eq!("LIVE".parse::<AuthorityMode>().unwrap(), AuthorityMode::Live);
        assert!("grpc".parse::<AuthorityMode>().is_err());
    }

    #[test]
    fn test_default_config() {
        let config = GatewayConfig::default();
        assert_eq!(config.authority.mode, AuthorityMode::Mock);
        assert_eq!(config.retry.max_attempts, 5);
        assert!(config.security.strict_secret_key);
        assert!(config.validate().is_ok());

        let policy = config.retry_policy();
        assert_eq!(policy, RetryPolicy::default());
    }

    #[test]
    fn test_live_mode_requires_valid_url() {
        let mut config = GatewayConfig::default();
        config.authority.mode = AuthorityMode::Live;
        assert!(config.validate().is_err());

        config.authority.base_url = Some("not a url".into());
        assert!(config.validate().is_err());

        config.authority.base_url = Some("ftp://authority.example".into());
        assert!(config.validate().is_err());

        config.authority.base_url = Some("https://authority.example".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_retry_bounds_validated() {
        let mut config = GatewayConfig::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = GatewayConfig::default();
        config.retry.base_delay_secs = 7200;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("FISCAL_AUTHORITY_MODE", "live"),
            ("FISCAL_AUTHORITY_URL", "http://127.0.0.1:9000"),
            ("FISCAL_RETRY_MAX_ATTEMPTS", "7"),
            ("FISCAL_STRICT_SECRET_KEY", "false"),
            ("FISCAL_MOCK_TINS", "111, 222,"),
        ]
        .into_iter()
        .collect();

        let mut config = GatewayConfig::default();
        config.apply_overrides_from(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.authority.mode, AuthorityMode::Live);
        assert_eq!(config.authority.base_url.as_deref(), Some("http://127.0.0.1:9000"));
        assert_eq!(config.retry.max_attempts, 7);
        assert!(!config.security.strict_secret_key);
        assert_eq!(config.mock.registered_tins, vec!["111", "222"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.toml");
        std::fs::write(
            &path,
            r#"
[authority]
mode = "live"
base_url = "https://authority.example"

[retry]
max_attempts = 3
workers = 2
"#,
        )
        .unwrap();

        let config = GatewayConfig::load(Some(path.clone())).unwrap();
        assert_eq!(config.authority.mode, AuthorityMode::Live);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.workers, 2);
        // Unset values keep their defaults
        assert_eq!(config.retry.base_delay_secs, 60);
        assert_eq!(config.authority.paths, EndpointPaths::default());

        config.save(Some(path.clone())).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("[authority]"));
        assert!(text.contains("[retry]"));
    }
}
