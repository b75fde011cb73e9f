//! Configuration module for NetSentinel.
//!
//! Loads a TOML file, applies environment overrides on top, then validates.
//! Every section falls back to its defaults, so a partial file is valid.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::diagnosis::EngineThresholds;
use crate::probe::{validate_domain, BandwidthSettings, ProbeTimeouts, TIMEOUT_GRACE};

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/sentinel.toml";

/// Configuration error types.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value {value:?} for {var}")]
    Env { var: String, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Complete service configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SentinelConfig {
    pub server: ServerConfig,
    pub monitoring: MonitoringConfig,
    pub targets: TargetsConfig,
    pub bandwidth: BandwidthConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP port for the JSON API; 0 disables it (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "netsentinel.db")
    pub db_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "netsentinel.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub interval_seconds: u64,
    /// Consecutive unhealthy cycles before a fault is reported.
    pub confirmation_threshold: u32,
    pub router_sample_count: usize,
    pub history_capacity: usize,
    pub jitter_degraded_ms: f64,
    pub router_critical_score: f64,
    pub router_degraded_score: f64,
    pub ping_timeout_ms: u64,
    pub dns_timeout_ms: u64,
    pub http_timeout_ms: u64,
    pub traceroute_on_fault: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 30,
            confirmation_threshold: 3,
            router_sample_count: 5,
            history_capacity: 10,
            jitter_degraded_ms: 50.0,
            router_critical_score: 30.0,
            router_degraded_score: 60.0,
            ping_timeout_ms: 2000,
            dns_timeout_ms: 3000,
            http_timeout_ms: 5000,
            traceroute_on_fault: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetsConfig {
    pub router: String,
    /// Empty means not configured.
    pub isp_gateway: String,
    pub dns_resolvers: Vec<String>,
    pub dns_domains: Vec<String>,
    pub http_endpoints: Vec<String>,
}

impl Default for TargetsConfig {
    fn default() -> Self {
        Self {
            router: "192.168.1.1".to_string(),
            isp_gateway: String::new(),
            dns_resolvers: vec!["8.8.8.8".to_string(), "1.1.1.1".to_string()],
            dns_domains: vec!["google.com".to_string(), "cloudflare.com".to_string()],
            http_endpoints: vec![
                "https://www.google.com".to_string(),
                "https://www.cloudflare.com".to_string(),
                "https://www.amazon.com".to_string(),
                "https://www.microsoft.com".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BandwidthConfig {
    pub enabled: bool,
    pub interval_hours: u64,
    pub download_url: String,
    /// Empty skips the upload measurement.
    pub upload_url: String,
    pub upload_bytes: usize,
    pub timeout_seconds: u64,
    pub speedtest_cli_fallback: bool,
}

impl Default for BandwidthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_hours: 6,
            download_url: "https://speed.cloudflare.com/__down?bytes=25000000".to_string(),
            upload_url: "https://speed.cloudflare.com/__up".to_string(),
            upload_bytes: 5_000_000,
            timeout_seconds: 120,
            speedtest_cli_fallback: true,
        }
    }
}

impl SentinelConfig {
    /// Load configuration from the file named by `SENTINEL_CONFIG` and the environment.
    ///
    /// Environment variables:
    /// - `SENTINEL_CONFIG`: config file (default: "config/sentinel.toml", skipped if absent)
    /// - `SENTINEL_HTTP_PORT`, `SENTINEL_DB_PATH`
    /// - `SENTINEL_ROUTER`, `SENTINEL_ISP_GATEWAY`
    /// - `SENTINEL_INTERVAL_SECONDS`, `SENTINEL_CONFIRMATION_THRESHOLD`
    pub fn load() -> Result<Self, ConfigError> {
        let mut cfg = match env::var("SENTINEL_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_PATH))?
            }
            Err(_) => Self::default(),
        };

        cfg.apply_env(|var| env::var(var).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Apply `SENTINEL_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = parse_var(&lookup, "SENTINEL_HTTP_PORT")? {
            self.server.http_port = port;
        }
        if let Some(db_path) = lookup("SENTINEL_DB_PATH") {
            self.server.db_path = db_path;
        }
        if let Some(router) = lookup("SENTINEL_ROUTER") {
            self.targets.router = router;
        }
        if let Some(gateway) = lookup("SENTINEL_ISP_GATEWAY") {
            self.targets.isp_gateway = gateway;
        }
        if let Some(interval) = parse_var(&lookup, "SENTINEL_INTERVAL_SECONDS")? {
            self.monitoring.interval_seconds = interval;
        }
        if let Some(threshold) = parse_var(&lookup, "SENTINEL_CONFIRMATION_THRESHOLD")? {
            self.monitoring.confirmation_threshold = threshold;
        }
        Ok(())
    }

    /// Reject configurations the service cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let m = &self.monitoring;
        let t = &self.targets;

        if t.router.trim().is_empty() {
            return invalid("targets.router must be set");
        }
        if m.interval_seconds == 0 {
            return invalid("monitoring.interval_seconds must be positive");
        }
        if m.confirmation_threshold == 0 {
            return invalid("monitoring.confirmation_threshold must be at least 1");
        }
        if m.router_sample_count == 0 {
            return invalid("monitoring.router_sample_count must be at least 1");
        }
        if m.history_capacity < 2 {
            return invalid("monitoring.history_capacity must be at least 2");
        }
        if m.jitter_degraded_ms.is_nan() || m.jitter_degraded_ms <= 0.0 {
            return invalid("monitoring.jitter_degraded_ms must be positive");
        }
        if !(0.0 <= m.router_critical_score
            && m.router_critical_score < m.router_degraded_score
            && m.router_degraded_score <= 100.0)
        {
            return Err(ConfigError::Invalid(format!(
                "router score thresholds must satisfy 0 <= critical < degraded <= 100 (got {} / {})",
                m.router_critical_score, m.router_degraded_score
            )));
        }

        let interval = self.interval();
        for (name, timeout) in [
            ("ping_timeout_ms", m.ping_timeout_ms),
            ("dns_timeout_ms", m.dns_timeout_ms),
            ("http_timeout_ms", m.http_timeout_ms),
        ] {
            if timeout == 0 || Duration::from_millis(timeout) >= interval {
                return Err(ConfigError::Invalid(format!(
                    "monitoring.{} must be positive and shorter than the interval",
                    name
                )));
            }
        }
        // Each router ping may run for its timeout plus the outer guard's grace.
        let router_budget = (Duration::from_millis(m.ping_timeout_ms) + TIMEOUT_GRACE)
            .saturating_mul(u32::try_from(m.router_sample_count).unwrap_or(u32::MAX));
        if router_budget >= interval {
            return invalid(
                "router_sample_count * (ping_timeout_ms + 500 ms grace) must be shorter than the interval",
            );
        }

        for domain in &t.dns_domains {
            validate_domain(domain).map_err(|e| {
                ConfigError::Invalid(format!("invalid DNS domain {:?}: {}", domain, e))
            })?;
        }
        if t.dns_resolvers.iter().any(|r| r.trim().is_empty()) {
            return invalid("targets.dns_resolvers must not contain empty entries");
        }
        if t.http_endpoints.iter().any(|e| e.trim().is_empty()) {
            return invalid("targets.http_endpoints must not contain empty entries");
        }

        if self.bandwidth.enabled {
            if self.bandwidth.interval_hours == 0 {
                return invalid("bandwidth.interval_hours must be positive");
            }
            if self.bandwidth.timeout_seconds == 0 {
                return invalid("bandwidth.timeout_seconds must be positive");
            }
        }

        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.monitoring.interval_seconds)
    }

    pub fn bandwidth_interval(&self) -> Duration {
        Duration::from_secs(self.bandwidth.interval_hours.saturating_mul(3600))
    }

    /// The ISP gateway, if configured.
    pub fn isp_gateway(&self) -> Option<&str> {
        let gateway = self.targets.isp_gateway.trim();
        (!gateway.is_empty()).then_some(gateway)
    }

    pub fn thresholds(&self) -> EngineThresholds {
        EngineThresholds {
            router_critical_score: self.monitoring.router_critical_score,
            router_degraded_score: self.monitoring.router_degraded_score,
            jitter_degraded_ms: self.monitoring.jitter_degraded_ms,
        }
    }

    pub fn timeouts(&self) -> ProbeTimeouts {
        ProbeTimeouts {
            ping: Duration::from_millis(self.monitoring.ping_timeout_ms),
            dns: Duration::from_millis(self.monitoring.dns_timeout_ms),
            http: Duration::from_millis(self.monitoring.http_timeout_ms),
        }
    }

    /// Bandwidth settings, or None when bandwidth tests are disabled.
    pub fn bandwidth_settings(&self) -> Option<BandwidthSettings> {
        let bw = &self.bandwidth;
        if !bw.enabled {
            return None;
        }
        Some(BandwidthSettings {
            download_url: bw.download_url.clone(),
            upload_url: (!bw.upload_url.trim().is_empty()).then(|| bw.upload_url.clone()),
            upload_bytes: bw.upload_bytes,
            timeout: Duration::from_secs(bw.timeout_seconds),
            speedtest_cli_fallback: bw.speedtest_cli_fallback,
        })
    }
}

fn invalid(msg: &str) -> Result<(), ConfigError> {
    Err(ConfigError::Invalid(msg.to_string()))
}

fn parse_var<F, T>(lookup: &F, var: &str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(var) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Env {
                var: var.to_string(),
                value,
            }),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tokio_test::{assert_err, assert_ok};

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| vars.get(var).cloned()
    }

    #[test]
    fn test_default_config() {
        let cfg = SentinelConfig::default();
        assert_eq!(cfg.server.http_port, 8080);
        assert_eq!(cfg.server.db_path, "netsentinel.db");
        assert_eq!(cfg.monitoring.confirmation_threshold, 3);
        assert_eq!(cfg.monitoring.router_sample_count, 5);
        assert_eq!(cfg.interval(), Duration::from_secs(30));
        assert_eq!(cfg.bandwidth_interval(), Duration::from_secs(6 * 3600));
        assert_eq!(cfg.isp_gateway(), None);
        assert_eq!(cfg.thresholds(), EngineThresholds::default());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let cfg = SentinelConfig::from_toml(
            r#"
[monitoring]
interval_seconds = 60

[targets]
router = "10.0.0.1"
isp_gateway = "100.64.0.1"
"#,
        )
        .unwrap();
        assert_eq!(cfg.monitoring.interval_seconds, 60);
        assert_eq!(cfg.monitoring.confirmation_threshold, 3);
        assert_eq!(cfg.targets.router, "10.0.0.1");
        assert_eq!(cfg.isp_gateway(), Some("100.64.0.1"));
        assert_eq!(cfg.targets.dns_resolvers.len(), 2);
        assert_eq!(cfg.server, ServerConfig::default());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nhttp_port = 0\n[bandwidth]\nenabled = false").unwrap();

        let cfg = SentinelConfig::from_file(file.path()).unwrap();
        assert_eq!(cfg.server.http_port, 0);
        assert!(cfg.bandwidth_settings().is_none());

        let missing = SentinelConfig::from_file(Path::new("/nonexistent/sentinel.toml"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_malformed_toml() {
        let result = SentinelConfig::from_toml("[monitoring]\ninterval_seconds = \"soon\"");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_env_overrides() {
        let mut cfg = SentinelConfig::default();
        cfg.apply_env(lookup(&[
            ("SENTINEL_HTTP_PORT", "9090"),
            ("SENTINEL_ROUTER", "10.0.0.1"),
            ("SENTINEL_CONFIRMATION_THRESHOLD", "5"),
        ]))
        .unwrap();
        assert_eq!(cfg.server.http_port, 9090);
        assert_eq!(cfg.targets.router, "10.0.0.1");
        assert_eq!(cfg.monitoring.confirmation_threshold, 5);
        assert_eq!(cfg.monitoring.interval_seconds, 30);
    }

    #[test]
    fn test_bad_env_value() {
        let mut cfg = SentinelConfig::default();
        let err = cfg
            .apply_env(lookup(&[("SENTINEL_INTERVAL_SECONDS", "thirty")]))
            .unwrap_err();
        match err {
            ConfigError::Env { var, value } => {
                assert_eq!(var, "SENTINEL_INTERVAL_SECONDS");
                assert_eq!(value, "thirty");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_validation() {
        let mut cfg = SentinelConfig::default();
        cfg.targets.router = "  ".to_string();
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));

        let mut cfg = SentinelConfig::default();
        cfg.monitoring.router_critical_score = 70.0;
        assert_err!(cfg.validate());

        let mut cfg = SentinelConfig::default();
        cfg.monitoring.confirmation_threshold = 0;
        assert_err!(cfg.validate());

        let mut cfg = SentinelConfig::default();
        cfg.monitoring.http_timeout_ms = 30_000;
        assert_err!(cfg.validate());

        // 5 pings x 7 s do not fit in a 30 s cycle.
        let mut cfg = SentinelConfig::default();
        cfg.monitoring.ping_timeout_ms = 7000;
        assert_err!(cfg.validate());

        // 5 x 5.8 s fits, but not once each ping gets its 0.5 s grace.
        let mut cfg = SentinelConfig::default();
        cfg.monitoring.ping_timeout_ms = 5800;
        assert_err!(cfg.validate());

        let mut cfg = SentinelConfig::default();
        cfg.monitoring.ping_timeout_ms = 5400;
        assert_ok!(cfg.validate());

        let mut cfg = SentinelConfig::default();
        cfg.targets.dns_domains.push("bad..domain".to_string());
        assert_err!(cfg.validate());

        let mut cfg = SentinelConfig::default();
        cfg.bandwidth.interval_hours = 0;
        assert_err!(cfg.validate());
        cfg.bandwidth.enabled = false;
        assert_ok!(cfg.validate());
    }

    #[test]
    fn test_bandwidth_settings() {
        let mut cfg = SentinelConfig::default();
        let settings = cfg.bandwidth_settings().unwrap();
        assert_eq!(settings.timeout, Duration::from_secs(120));
        assert!(settings.upload_url.is_some());

        cfg.bandwidth.upload_url = String::new();
        assert!(cfg.bandwidth_settings().unwrap().upload_url.is_none());
    }
}
