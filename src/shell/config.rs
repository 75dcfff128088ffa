// Runtime configuration: an optional TOML file, then environment overrides.
//
// Responsibilities
// - Provide defaults for every tunable so an empty file is a valid config.
// - Apply MARKETPLACE_* overrides after `.env` has been loaded.
// - Reject configurations the workers or the token verifier cannot run with.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::modules::sync::core::retry_policy::RetryPolicy;
use crate::modules::sync::reconciler::ReconcilerSettings;

pub const CONFIG_PATH_VAR: &str = "MARKETPLACE_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "marketplace.toml";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind: default_bind() }
    }
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Memory,
    Sqlite,
}

impl std::str::FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "memory" => Ok(StoreBackend::Memory),
            "sqlite" => Ok(StoreBackend::Sqlite),
            other => anyhow::bail!("unknown store backend '{other}' (expected memory or sqlite)"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            sqlite_path: default_sqlite_path(),
        }
    }
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("data/marketplace.db")
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct SigningKeyConfig {
    pub kid: String,
    pub secret: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    #[serde(default)]
    pub signing_keys: Vec<SigningKeyConfig>,
    #[serde(default = "default_elevated_roles")]
    pub elevated_roles: Vec<String>,
    #[serde(default)]
    pub leeway_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            signing_keys: Vec::new(),
            elevated_roles: default_elevated_roles(),
            leeway_secs: 0,
        }
    }
}

fn default_elevated_roles() -> Vec<String> {
    vec!["admin".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_index_timeout_ms")]
    pub index_timeout_ms: u64,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_retry_window_ms")]
    pub retry_window_ms: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    #[serde(default = "default_sweep_sample_size")]
    pub sweep_sample_size: usize,
    #[serde(default = "default_delivered_retention_ms")]
    pub delivered_retention_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            poll_interval_ms: default_poll_interval_ms(),
            index_timeout_ms: default_index_timeout_ms(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            retry_window_ms: default_retry_window_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            sweep_sample_size: default_sweep_sample_size(),
            delivered_retention_ms: default_delivered_retention_ms(),
        }
    }
}

fn default_batch_size() -> usize {
    100
}
fn default_poll_interval_ms() -> u64 {
    250
}
fn default_index_timeout_ms() -> u64 {
    2_000
}
fn default_initial_backoff_ms() -> u64 {
    500
}
fn default_max_backoff_ms() -> u64 {
    60_000
}
fn default_retry_window_ms() -> u64 {
    900_000
}
fn default_sweep_interval_ms() -> u64 {
    30_000
}
fn default_sweep_sample_size() -> usize {
    200
}
fn default_delivered_retention_ms() -> u64 {
    86_400_000
}

impl SyncConfig {
    pub fn reconciler_settings(&self) -> ReconcilerSettings {
        ReconcilerSettings {
            batch_size: self.batch_size,
            index_timeout: Duration::from_millis(self.index_timeout_ms),
            retry: RetryPolicy::from_durations(
                Duration::from_millis(self.initial_backoff_ms),
                Duration::from_millis(self.max_backoff_ms),
                Duration::from_millis(self.retry_window_ms),
            ),
        }
    }
}

/// Load the config file named by `MARKETPLACE_CONFIG` (or the default path),
/// apply environment overrides and validate the result.
pub fn load_from_env() -> Result<Config> {
    let path = std::env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let mut config = load_config(Path::new(&path))?;
    config.apply_overrides(|name| std::env::var(name).ok())?;
    config.validate()?;
    Ok(config)
}

/// A missing file means defaults. An unreadable or invalid one is an error.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        tracing::info!(path = %path.display(), "no config file, using defaults");
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content).with_context(|| format!("Failed to parse config file: {}", path.display()))
}

pub fn parse_config(content: &str) -> Result<Config> {
    Ok(toml::from_str(content)?)
}

impl Config {
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(bind) = lookup("MARKETPLACE_BIND") {
            self.server.bind = bind;
        }
        if let Some(backend) = lookup("MARKETPLACE_STORE") {
            self.store.backend = backend.parse::<StoreBackend>().context("MARKETPLACE_STORE")?;
        }
        if let Some(path) = lookup("MARKETPLACE_SQLITE_PATH") {
            self.store.sqlite_path = PathBuf::from(path);
        }
        if let Some(keys) = lookup("MARKETPLACE_SIGNING_KEYS") {
            self.auth.signing_keys = parse_signing_keys(&keys).context("MARKETPLACE_SIGNING_KEYS")?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.auth.signing_keys.is_empty() {
            anyhow::bail!("auth.signing_keys must name at least one key");
        }
        if let Some(key) = self.auth.signing_keys.iter().find(|key| key.secret.is_empty()) {
            anyhow::bail!("auth.signing_keys: key '{}' has an empty secret", key.kid);
        }
        if self.sync.batch_size == 0 {
            anyhow::bail!("sync.batch_size must be > 0");
        }
        if self.sync.sweep_sample_size == 0 {
            anyhow::bail!("sync.sweep_sample_size must be > 0");
        }
        if self.sync.initial_backoff_ms > self.sync.max_backoff_ms {
            anyhow::bail!(
                "sync.initial_backoff_ms ({}) must not exceed sync.max_backoff_ms ({})",
                self.sync.initial_backoff_ms,
                self.sync.max_backoff_ms
            );
        }
        Ok(())
    }
}

/// Parse `kid:secret,kid:secret`. Secrets may contain ':' past the first one.
pub fn parse_signing_keys(raw: &str) -> Result<Vec<SigningKeyConfig>> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (kid, secret) = entry
                .split_once(':')
                .with_context(|| format!("signing key entry '{entry}' is not kid:secret"))?;
            if kid.is_empty() {
                anyhow::bail!("signing key entry has an empty kid");
            }
            Ok(SigningKeyConfig {
                kid: kid.to_string(),
                secret: secret.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod config_tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn it_should_fill_defaults_for_an_empty_file() {
        let config = parse_config("").unwrap();
        assert_eq!(config.server.bind, "0.0.0.0:8080");
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.auth.elevated_roles, vec!["admin".to_string()]);
        assert_eq!(config.sync.batch_size, 100);
        assert_eq!(config.sync.retry_window_ms, 900_000);
    }

    #[test]
    fn it_should_read_every_section() {
        let config = parse_config(
            r#"
            [server]
            bind = "127.0.0.1:9000"

            [store]
            backend = "sqlite"
            sqlite_path = "/tmp/catalog.db"

            [auth]
            elevated_roles = ["admin", "ops"]
            leeway_secs = 30
            [[auth.signing_keys]]
            kid = "k-2026"
            secret = "s3cret"

            [sync]
            batch_size = 25
            initial_backoff_ms = 100
            max_backoff_ms = 1000
            "#,
        )
        .unwrap();

        assert_eq!(config.server.bind, "127.0.0.1:9000");
        assert_eq!(config.store.backend, StoreBackend::Sqlite);
        assert_eq!(config.store.sqlite_path, PathBuf::from("/tmp/catalog.db"));
        assert_eq!(config.auth.signing_keys[0].kid, "k-2026");
        assert_eq!(config.auth.leeway_secs, 30);
        assert_eq!(config.sync.batch_size, 25);
        assert!(config.validate().is_ok());

        let settings = config.sync.reconciler_settings();
        assert_eq!(settings.batch_size, 25);
        assert_eq!(settings.retry.backoff_ms(1), 100);
        assert_eq!(settings.retry.backoff_ms(10), 1000);
    }

    #[test]
    fn it_should_let_the_environment_override_the_file() {
        let mut config = parse_config("[server]\nbind = \"127.0.0.1:1\"").unwrap();
        config
            .apply_overrides(env(&[
                ("MARKETPLACE_BIND", "0.0.0.0:7000"),
                ("MARKETPLACE_STORE", "sqlite"),
                ("MARKETPLACE_SQLITE_PATH", "/var/lib/catalog.db"),
                ("MARKETPLACE_SIGNING_KEYS", "old:aaa, new:bb:b"),
            ]))
            .unwrap();

        assert_eq!(config.server.bind, "0.0.0.0:7000");
        assert_eq!(config.store.backend, StoreBackend::Sqlite);
        assert_eq!(config.store.sqlite_path, PathBuf::from("/var/lib/catalog.db"));
        assert_eq!(config.auth.signing_keys.len(), 2);
        assert_eq!(config.auth.signing_keys[1].secret, "bb:b");
    }

    #[test]
    fn it_should_reject_an_unknown_backend() {
        let mut config = Config::default();
        let result = config.apply_overrides(env(&[("MARKETPLACE_STORE", "postgres")]));
        assert!(result.is_err());
    }

    #[test]
    fn it_should_reject_a_key_entry_without_a_separator() {
        assert!(parse_signing_keys("just-a-secret").is_err());
        assert!(parse_signing_keys(":secret").is_err());
    }

    #[test]
    fn it_should_require_a_signing_key() {
        let error = Config::default().validate().unwrap_err();
        assert!(error.to_string().contains("signing_keys"));
    }

    #[test]
    fn it_should_reject_inverted_backoff_bounds() {
        let mut config = Config::default();
        config.auth.signing_keys = parse_signing_keys("k:s").unwrap();
        config.sync.initial_backoff_ms = 10_000;
        config.sync.max_backoff_ms = 1_000;
        assert!(config.validate().is_err());

        config.sync.max_backoff_ms = 10_000;
        config.sync.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn it_should_use_defaults_when_the_file_is_missing() {
        let config = load_config(Path::new("/nonexistent/marketplace.toml")).unwrap();
        assert_eq!(config.sync.sweep_sample_size, 200);
    }
}
