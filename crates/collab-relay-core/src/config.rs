//! Configuration loading and validation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};

/// Top-level Collab Relay configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<InstanceConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster: Option<ClusterConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<StoreConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub maintenance: Option<MaintenanceConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin: Option<AdminConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

/// Identity overrides for this process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Fixed instance id. Generated from hostname, pid and a random suffix when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default = "default_cluster_prefix")]
    pub key_prefix: String,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Registration TTL; must exceed the heartbeat interval.
    #[serde(default = "default_instance_ttl")]
    pub instance_ttl_secs: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_cluster_prefix(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            instance_ttl_secs: default_instance_ttl(),
        }
    }
}

fn default_cluster_prefix() -> String {
    "collab:cluster".into()
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_instance_ttl() -> u64 {
    60
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Redis,
    Memory,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub url_env: Option<String>,
}

impl StoreConfig {
    /// Resolve the store URL: `url` first, then the `url_env` variable.
    pub fn resolve_url(&self) -> Option<String> {
        resolve_secret_field(&self.url, &self.url_env)
    }
}

/// Longest penalty a config or a manual `apply_penalty` may set (30 days).
pub const MAX_PENALTY_DURATION_MS: u64 = 30 * 24 * 3_600_000;

/// Rate limiting configuration. Every field can be changed at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Bucket capacity before burst (default: 10).
    #[serde(default = "default_max_messages_per_second")]
    pub max_messages_per_second: u32,

    /// Extra tokens above capacity, and the debt allowed below zero (default: 20).
    #[serde(default = "default_burst_allowance")]
    pub burst_allowance: u32,

    #[serde(default = "default_penalty_duration_ms")]
    pub penalty_duration_ms: u64,

    /// Refill rate is `max_messages_per_second / window_size_seconds` tokens per second.
    #[serde(default = "default_window_size_seconds")]
    pub window_size_seconds: u32,

    #[serde(default = "default_max_connections_per_user")]
    pub max_connections_per_user: u32,

    #[serde(default = "default_max_connections_per_ip")]
    pub max_connections_per_ip: u32,

    #[serde(default = "default_connection_ttl_secs")]
    pub connection_ttl_secs: u64,

    #[serde(default = "default_rate_limit_prefix")]
    pub key_prefix: String,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_messages_per_second: default_max_messages_per_second(),
            burst_allowance: default_burst_allowance(),
            penalty_duration_ms: default_penalty_duration_ms(),
            window_size_seconds: default_window_size_seconds(),
            max_connections_per_user: default_max_connections_per_user(),
            max_connections_per_ip: default_max_connections_per_ip(),
            connection_ttl_secs: default_connection_ttl_secs(),
            key_prefix: default_rate_limit_prefix(),
        }
    }
}

fn default_max_messages_per_second() -> u32 {
    10
}

fn default_burst_allowance() -> u32 {
    20
}

fn default_penalty_duration_ms() -> u64 {
    5000
}

fn default_window_size_seconds() -> u32 {
    60
}

fn default_max_connections_per_user() -> u32 {
    10
}

fn default_max_connections_per_ip() -> u32 {
    100
}

fn default_connection_ttl_secs() -> u64 {
    300
}

fn default_rate_limit_prefix() -> String {
    "collab:ratelimit".into()
}

impl RateLimitConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_messages_per_second == 0 {
            return Err(RelayError::Config(
                "rate_limit.max_messages_per_second must be greater than 0".into(),
            ));
        }
        if self.window_size_seconds == 0 {
            return Err(RelayError::Config(
                "rate_limit.window_size_seconds must be greater than 0".into(),
            ));
        }
        if self.penalty_duration_ms > MAX_PENALTY_DURATION_MS {
            return Err(RelayError::Config(format!(
                "rate_limit.penalty_duration_ms must be at most {MAX_PENALTY_DURATION_MS}"
            )));
        }
        if self.max_connections_per_user == 0 || self.max_connections_per_ip == 0 {
            return Err(RelayError::Config(
                "rate_limit connection maxima must be greater than 0".into(),
            ));
        }
        if self.connection_ttl_secs == 0 {
            return Err(RelayError::Config(
                "rate_limit.connection_ttl_secs must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// Return a copy with every field set in `patch` overridden.
    pub fn merged(&self, patch: &RateLimitConfigPatch) -> Self {
        let mut next = self.clone();
        if let Some(v) = patch.max_messages_per_second {
            next.max_messages_per_second = v;
        }
        if let Some(v) = patch.burst_allowance {
            next.burst_allowance = v;
        }
        if let Some(v) = patch.penalty_duration_ms {
            next.penalty_duration_ms = v;
        }
        if let Some(v) = patch.window_size_seconds {
            next.window_size_seconds = v;
        }
        if let Some(v) = patch.max_connections_per_user {
            next.max_connections_per_user = v;
        }
        if let Some(v) = patch.max_connections_per_ip {
            next.max_connections_per_ip = v;
        }
        if let Some(v) = patch.connection_ttl_secs {
            next.connection_ttl_secs = v;
        }
        next
    }
}

/// Partial rate limit update. `None` fields keep their current value.
/// The key prefix is fixed for the life of a limiter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfigPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_messages_per_second: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub burst_allowance: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub penalty_duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_size_seconds: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_connections_per_user: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_connections_per_ip: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_ttl_secs: Option<u64>,
}

impl From<&RateLimitConfig> for RateLimitConfigPatch {
    fn from(config: &RateLimitConfig) -> Self {
        Self {
            max_messages_per_second: Some(config.max_messages_per_second),
            burst_allowance: Some(config.burst_allowance),
            penalty_duration_ms: Some(config.penalty_duration_ms),
            window_size_seconds: Some(config.window_size_seconds),
            max_connections_per_user: Some(config.max_connections_per_user),
            max_connections_per_ip: Some(config.max_connections_per_ip),
            connection_ttl_secs: Some(config.connection_ttl_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    /// Usage counters older than this are deleted by the cleanup job.
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_secs: default_cleanup_interval(),
            retention_hours: default_retention_hours(),
        }
    }
}

fn default_cleanup_interval() -> u64 {
    3600
}

fn default_retention_hours() -> u64 {
    24
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_admin_port")]
    pub port: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,
}

fn default_admin_port() -> u16 {
    18790
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "collab_relay_cluster=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> Result<String> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| RelayError::Config(format!("invalid substitution pattern: {e}")))?;
    Ok(re
        .replace_all(input, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned())
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    /// A missing file yields the default config.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    /// Parse config text (JSON5) after env-var substitution.
    pub fn parse(raw: &str) -> Result<Self> {
        let substituted = substitute_env_vars(raw)?;
        json5::from_str(&substituted).map_err(|e| RelayError::Config(e.to_string()))
    }

    /// Default config file location: `~/.collab_relay/config.json`
    pub fn config_path() -> PathBuf {
        data_dir().join("config.json")
    }

    pub fn cluster(&self) -> ClusterConfig {
        self.cluster.clone().unwrap_or_default()
    }

    pub fn rate_limit(&self) -> RateLimitConfig {
        self.rate_limit.clone().unwrap_or_default()
    }

    pub fn maintenance(&self) -> MaintenanceConfig {
        self.maintenance.clone().unwrap_or_default()
    }

    pub fn store_backend(&self) -> StoreBackend {
        self.store.as_ref().map(|s| s.backend).unwrap_or_default()
    }

    pub fn store_url(&self) -> String {
        self.store
            .as_ref()
            .and_then(|s| s.resolve_url())
            .unwrap_or_else(|| "redis://127.0.0.1:6379".to_string())
    }

    pub fn admin_port(&self) -> u16 {
        self.admin
            .as_ref()
            .map(|a| a.port)
            .unwrap_or_else(default_admin_port)
    }

    pub fn admin_bind(&self) -> String {
        self.admin
            .as_ref()
            .and_then(|a| a.bind.clone())
            .unwrap_or_else(|| "0.0.0.0".to_string())
    }

    /// Get a config value by dotted path (e.g. `rate_limit.burst_allowance`).
    pub fn get_path(&self, path: &str) -> Option<serde_json::Value> {
        let json = serde_json::to_value(self).ok()?;
        let mut current = &json;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(current.clone())
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if let Err(e) = self.rate_limit().validate() {
            errors.push(e.to_string());
        }

        let cluster = self.cluster();
        if cluster.heartbeat_interval_secs == 0 {
            errors.push("cluster.heartbeat_interval_secs cannot be 0".to_string());
        }
        if cluster.instance_ttl_secs <= cluster.heartbeat_interval_secs {
            errors.push(format!(
                "cluster.instance_ttl_secs ({}) must exceed heartbeat_interval_secs ({})",
                cluster.instance_ttl_secs, cluster.heartbeat_interval_secs
            ));
        }

        match self.store_backend() {
            StoreBackend::Redis => {
                if self.store.as_ref().and_then(|s| s.resolve_url()).is_none() {
                    warnings.push(
                        "No store URL configured, falling back to redis://127.0.0.1:6379"
                            .to_string(),
                    );
                }
            }
            StoreBackend::Memory => {
                warnings.push(
                    "Memory store is process-local: instances will not see each other".to_string(),
                );
            }
        }

        if let Some(admin) = &self.admin {
            if admin.port == 0 {
                errors.push("Admin port cannot be 0".to_string());
            }
        }

        (warnings, errors)
    }
}

/// Base directory for Collab Relay data: `~/.collab_relay/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".collab_relay")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        let rl = config.rate_limit();
        assert_eq!(rl.max_messages_per_second, 10);
        assert_eq!(rl.burst_allowance, 20);
        assert_eq!(rl.penalty_duration_ms, 5000);
        assert_eq!(rl.window_size_seconds, 60);
        assert_eq!(rl.max_connections_per_user, 10);
        assert_eq!(rl.max_connections_per_ip, 100);
        assert_eq!(config.cluster().heartbeat_interval_secs, 30);
        assert_eq!(config.cluster().instance_ttl_secs, 60);
        assert_eq!(config.admin_port(), 18790);
        assert_eq!(config.store_backend(), StoreBackend::Redis);
    }

    #[test]
    fn test_partial_rate_limit_section_keeps_defaults() {
        let config = Config::parse(r#"{ rate_limit: { burst_allowance: 5 } }"#).unwrap();
        let rl = config.rate_limit();
        assert_eq!(rl.burst_allowance, 5);
        assert_eq!(rl.max_messages_per_second, 10);
        assert_eq!(rl.key_prefix, "collab:ratelimit");
    }

    #[test]
    fn test_env_var_substitution() {
        // SAFETY: test-only, variable name unique to this test
        unsafe { std::env::set_var("TEST_CR_STORE_URL", "redis://cache:6380") };
        let config = Config::parse(r#"{ store: { url: "${TEST_CR_STORE_URL}" } }"#).unwrap();
        assert_eq!(config.store_url(), "redis://cache:6380");
        unsafe { std::env::remove_var("TEST_CR_STORE_URL") };
    }

    #[test]
    fn test_store_url_env_reference() {
        // SAFETY: test-only, variable name unique to this test
        unsafe { std::env::set_var("TEST_CR_URL_ENV", "redis://from-env:6379") };
        let store = StoreConfig {
            backend: StoreBackend::Redis,
            url: None,
            url_env: Some("TEST_CR_URL_ENV".into()),
        };
        assert_eq!(store.resolve_url(), Some("redis://from-env:6379".into()));
        unsafe { std::env::remove_var("TEST_CR_URL_ENV") };
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("absent.json")).unwrap();
        assert!(config.rate_limit.is_none());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                // json5 comments are allowed
                cluster: { key_prefix: "test:cluster", heartbeat_interval_secs: 5, instance_ttl_secs: 15 },
                store: { backend: "memory" },
            }"#,
        )
        .unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.cluster().key_prefix, "test:cluster");
        assert_eq!(config.store_backend(), StoreBackend::Memory);
    }

    #[test]
    fn test_get_path() {
        let config = Config::parse(r#"{ rate_limit: { max_connections_per_ip: 7 } }"#).unwrap();
        assert_eq!(
            config.get_path("rate_limit.max_connections_per_ip"),
            Some(serde_json::json!(7))
        );
        assert!(config.get_path("rate_limit.nope").is_none());
    }

    #[test]
    fn test_patch_merge_only_touches_set_fields() {
        let base = RateLimitConfig::default();
        let patch = RateLimitConfigPatch {
            burst_allowance: Some(3),
            ..Default::default()
        };
        let merged = base.merged(&patch);
        assert_eq!(merged.burst_allowance, 3);
        assert_eq!(merged.max_messages_per_second, base.max_messages_per_second);
        assert_eq!(merged.key_prefix, base.key_prefix);
    }

    #[test]
    fn test_validate_rejects_zero_window() {
        let rl = RateLimitConfig {
            window_size_seconds: 0,
            ..Default::default()
        };
        assert!(rl.validate().is_err());
    }

    #[test]
    fn test_validate_bounds_penalty_duration() {
        let rl = RateLimitConfig {
            penalty_duration_ms: u64::MAX,
            ..Default::default()
        };
        assert!(rl.validate().is_err());
        let rl = RateLimitConfig {
            penalty_duration_ms: MAX_PENALTY_DURATION_MS,
            ..Default::default()
        };
        assert!(rl.validate().is_ok());
    }

    #[test]
    fn test_validate_ttl_must_exceed_heartbeat() {
        let config = Config {
            cluster: Some(ClusterConfig {
                key_prefix: "x".into(),
                heartbeat_interval_secs: 30,
                instance_ttl_secs: 30,
            }),
            ..Config::default()
        };
        let (_warnings, errors) = config.validate();
        assert!(
            errors.iter().any(|e| e.contains("instance_ttl_secs")),
            "Expected a TTL error, got: {errors:?}"
        );
    }

    #[test]
    fn test_validate_memory_backend_warns() {
        let config = Config::parse(r#"{ store: { backend: "memory" } }"#).unwrap();
        let (warnings, errors) = config.validate();
        assert!(errors.is_empty());
        assert!(warnings.iter().any(|w| w.contains("process-local")));
    }

    #[test]
    fn test_logging_config_defaults() {
        let config = Config::parse(r#"{ "logging": {} }"#).unwrap();
        let logging = config.logging.expect("logging should be present");
        assert_eq!(logging.format, "plain");
        assert!(logging.level.is_none());
        assert_eq!(logging.output, "stderr");
        assert!(logging.filters.is_empty());
    }
}
