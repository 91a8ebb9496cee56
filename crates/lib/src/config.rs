//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.herald/config.json`) and environment.
//! Every section has conservative defaults so a missing file is a valid setup.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Gateway server settings.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Pairing artifact lifetime and issuance limits.
    #[serde(default)]
    pub pairing: PairingConfig,

    /// Worker pool, timeout and retry settings for bulk sends.
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// HTTP bridge to the messaging network.
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// In-memory credit ledger defaults.
    #[serde(default)]
    pub credits: CreditsConfig,
}

/// Gateway bind, port, and auth settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Port for HTTP and WebSocket (default 15252).
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_gateway_bind")]
    pub bind: String,

    /// Auth settings. When absent, defaults to no auth for loopback bind.
    #[serde(default)]
    pub auth: GatewayAuthConfig,
}

/// Gateway auth: token or none (loopback-only when none).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayAuthConfig {
    /// "none" = no shared secret (only safe when bind is loopback). "token" = require connect.auth.token.
    #[serde(default)]
    pub mode: GatewayAuthMode,

    /// Shared secret for WebSocket connect. Overridden by HERALD_GATEWAY_TOKEN env.
    pub token: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayAuthMode {
    /// No auth; allow only when bind is loopback.
    #[default]
    None,

    /// Require connect.auth.token to match configured token.
    Token,
}

fn default_gateway_port() -> u16 {
    15252
}

fn default_gateway_bind() -> String {
    "127.0.0.1".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            bind: default_gateway_bind(),
            auth: GatewayAuthConfig::default(),
        }
    }
}

/// Pairing settings: how long an issued artifact stays valid and how long issuance may take.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingConfig {
    /// Lifetime applied when the provider does not stamp its own expiry (default 60).
    #[serde(default = "default_artifact_ttl_secs")]
    pub artifact_ttl_secs: u64,

    /// Upper bound on a single `PairingProvider::issue` call (default 10000).
    #[serde(default = "default_issue_timeout_ms")]
    pub issue_timeout_ms: u64,

    /// Period of the background stale-artifact sweep in the gateway (default 5).
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

const MAX_ARTIFACT_TTL_SECS: u64 = 24 * 60 * 60;

fn default_artifact_ttl_secs() -> u64 {
    60
}

fn default_issue_timeout_ms() -> u64 {
    10_000
}

fn default_sweep_interval_secs() -> u64 {
    5
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            artifact_ttl_secs: default_artifact_ttl_secs(),
            issue_timeout_ms: default_issue_timeout_ms(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl PairingConfig {
    /// Artifact lifetime, capped at one day.
    pub fn artifact_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.artifact_ttl_secs.min(MAX_ARTIFACT_TTL_SECS) as i64)
    }

    pub fn issue_timeout(&self) -> Duration {
        Duration::from_millis(self.issue_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Bulk dispatch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchConfig {
    /// Worker pool size used when a request does not ask for one (default 3).
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Hard cap on any requested worker pool size (default 5).
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Timeout for a single send attempt, not the whole job (default 15000).
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,

    /// Retry policy for transient transport errors.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Number of entries kept in the in-memory message log (default 10000).
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,

    /// Seconds a finished job stays queryable when nobody takes its summary (default 3600).
    #[serde(default = "default_job_retention_secs")]
    pub job_retention_secs: u64,
}

fn default_concurrency() -> usize {
    3
}

fn default_max_concurrency() -> usize {
    5
}

fn default_send_timeout_ms() -> u64 {
    15_000
}

fn default_log_capacity() -> usize {
    10_000
}

fn default_job_retention_secs() -> u64 {
    3_600
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_concurrency: default_max_concurrency(),
            send_timeout_ms: default_send_timeout_ms(),
            retry: RetryConfig::default(),
            log_capacity: default_log_capacity(),
            job_retention_secs: default_job_retention_secs(),
        }
    }
}

impl DispatchConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms.max(1))
    }

    /// Finished-job retention, capped at one week.
    pub fn job_retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.job_retention_secs.min(7 * 24 * 60 * 60) as i64)
    }

    /// Clamp a requested pool size to `[1, max_concurrency]`; `None` uses the configured default.
    pub fn effective_concurrency(&self, requested: Option<usize>) -> usize {
        let cap = self.max_concurrency.max(1);
        requested.unwrap_or(self.concurrency).clamp(1, cap)
    }
}

/// Retry parameters for transient send failures (exponential backoff, capped).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    /// Retries after the first attempt (default 3).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry in ms; doubles per retry (default 500).
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound on a single backoff sleep in ms (default 8000).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    8_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Messaging bridge endpoint (pairing + delivery over HTTP).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
    /// Base URL of the bridge (e.g. "http://127.0.0.1:3100"). Overridden by HERALD_BRIDGE_URL env.
    pub base_url: Option<String>,
    /// Shared secret the bridge sends in `X-Herald-Bridge-Secret` on inbound events. When unset, events are accepted unchecked.
    pub webhook_secret: Option<String>,
}

/// Credit ledger defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditsConfig {
    /// Credits granted to a tenant the first time the ledger sees it (default 0).
    #[serde(default)]
    pub initial_balance: u64,
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

/// Resolve the gateway token: env HERALD_GATEWAY_TOKEN overrides config.
pub fn resolve_gateway_token(config: &Config) -> Option<String> {
    non_empty_env("HERALD_GATEWAY_TOKEN").or_else(|| {
        config
            .gateway
            .auth
            .token
            .as_ref()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    })
}

/// Resolve the bridge base URL: env HERALD_BRIDGE_URL overrides config.
pub fn resolve_bridge_url(config: &Config) -> Option<String> {
    non_empty_env("HERALD_BRIDGE_URL").or_else(|| {
        config
            .bridge
            .base_url
            .as_ref()
            .map(|s| s.trim().trim_end_matches('/').to_string())
            .filter(|s| !s.is_empty())
    })
}

/// True if the bind address is loopback (127.0.0.1, ::1, etc.).
pub fn is_loopback_bind(bind: &str) -> bool {
    let b = bind.trim();
    b == "127.0.0.1" || b == "::1" || b == "localhost"
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("HERALD_CONFIG_PATH").map(PathBuf::from).unwrap_or_else(|_| {
        dirs::home_dir()
            .map(|h| h.join(".herald").join("config.json"))
            .unwrap_or_else(|| PathBuf::from("config.json"))
    })
}

/// Load config from the given path, or the default path (or HERALD_CONFIG_PATH). Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        read_config(&path)?
    };
    Ok((config, path))
}

fn read_config(path: &Path) -> Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading config from {}", path.display()))?;
    serde_json::from_str(&s).with_context(|| format!("parsing config from {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_yields_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.gateway.port, 15252);
        assert_eq!(config.dispatch.concurrency, 3);
        assert_eq!(config.dispatch.max_concurrency, 5);
        assert_eq!(config.dispatch.retry.max_retries, 3);
        assert_eq!(config.pairing.artifact_ttl_secs, 60);
        assert_eq!(config.credits.initial_balance, 0);
    }

    #[test]
    fn camel_case_keys_override_defaults() {
        let config: Config = serde_json::from_str(
            r#"{"dispatch": {"maxConcurrency": 8, "retry": {"baseDelayMs": 10}}, "pairing": {"artifactTtlSecs": 20}}"#,
        )
        .unwrap();
        assert_eq!(config.dispatch.max_concurrency, 8);
        assert_eq!(config.dispatch.retry.base_delay_ms, 10);
        assert_eq!(config.dispatch.retry.max_retries, 3);
        assert_eq!(config.pairing.artifact_ttl_secs, 20);
    }

    #[test]
    fn effective_concurrency_is_clamped() {
        let dispatch = DispatchConfig::default();
        assert_eq!(dispatch.effective_concurrency(None), 3);
        assert_eq!(dispatch.effective_concurrency(Some(0)), 1);
        assert_eq!(dispatch.effective_concurrency(Some(50)), 5);
    }

    #[test]
    fn huge_artifact_ttl_is_capped_at_a_day() {
        let pairing: PairingConfig = serde_json::from_str(&format!(r#"{{"artifactTtlSecs": {}}}"#, u64::MAX)).unwrap();
        assert_eq!(pairing.artifact_ttl(), chrono::Duration::days(1));
        assert_eq!(PairingConfig::default().artifact_ttl(), chrono::Duration::seconds(60));
    }

    #[test]
    fn loopback_detection() {
        assert!(is_loopback_bind("127.0.0.1"));
        assert!(is_loopback_bind(" localhost "));
        assert!(!is_loopback_bind("0.0.0.0"));
    }
}
