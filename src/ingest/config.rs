// src/ingest/config.rs
use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use crate::severity::SeverityThresholds;

pub const ENV_PATH: &str = "SENTINEL_CONFIG_PATH";
const ENV_ENDPOINT: &str = "ECHO_ENDPOINT";
const ENV_INTERVAL: &str = "POLL_INTERVAL_SECS";
const ENV_STATE_DIR: &str = "SENTINEL_STATE_DIR";

/// Longest rolling window accepted, in days.
pub const MAX_LOOKBACK_DAYS: u32 = 3650;

pub const DEFAULT_ECHO_ENDPOINT: &str =
    "https://echodata.epa.gov/echo/sso_rest_services.get_sso_events";

fn default_name() -> String {
    "echo-sso".to_string()
}
fn default_endpoint() -> String {
    DEFAULT_ECHO_ENDPOINT.to_string()
}
fn default_lookback_days() -> u32 {
    30
}
fn default_timeout_secs() -> u64 {
    20
}
fn default_date_param() -> String {
    "p_start_date".to_string()
}
fn default_extra_params() -> BTreeMap<String, String> {
    BTreeMap::from([("output".to_string(), "JSON".to_string())])
}
fn default_interval_secs() -> u64 {
    300
}
fn default_state_dir() -> PathBuf {
    PathBuf::from("state")
}
fn default_dead_after() -> u32 {
    4
}
fn default_degraded_minutes() -> u64 {
    15
}
fn default_dead_minutes() -> u64 {
    60
}
fn default_dead_24h_minutes() -> u64 {
    360
}
fn default_dead_7d_minutes() -> u64 {
    1440
}

/// Upstream request settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EchoConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Rolling window: events since `now - lookback_days`.
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Query parameter carrying the `MM/DD/YYYY` from-date.
    #[serde(default = "default_date_param")]
    pub date_param: String,
    /// Response-format hints sent with every request.
    #[serde(default = "default_extra_params")]
    pub extra_params: BTreeMap<String, String>,
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            lookback_days: default_lookback_days(),
            timeout_secs: default_timeout_secs(),
            date_param: default_date_param(),
            extra_params: default_extra_params(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            state_dir: default_state_dir(),
        }
    }
}

/// Backoff schedule for sources that keep failing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Consecutive failures after which a source counts as dead.
    #[serde(default = "default_dead_after")]
    pub dead_after_failures: u32,
    #[serde(default = "default_degraded_minutes")]
    pub degraded_backoff_minutes: u64,
    #[serde(default = "default_dead_minutes")]
    pub dead_backoff_minutes: u64,
    #[serde(default = "default_dead_24h_minutes")]
    pub dead_24h_backoff_minutes: u64,
    #[serde(default = "default_dead_7d_minutes")]
    pub dead_7d_backoff_minutes: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            dead_after_failures: default_dead_after(),
            degraded_backoff_minutes: default_degraded_minutes(),
            dead_backoff_minutes: default_dead_minutes(),
            dead_24h_backoff_minutes: default_dead_24h_minutes(),
            dead_7d_backoff_minutes: default_dead_7d_minutes(),
        }
    }
}

/// One `[[sources]]` entry: a separately keyed query against the feed.
///
/// Unset fields inherit from the top-level `[echo]` and `[severity]` tables;
/// `extra_params` are merged over the inherited ones (e.g. a state filter).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// State key and health label.
    pub name: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub lookback_days: Option<u32>,
    #[serde(default)]
    pub extra_params: BTreeMap<String, String>,
    /// Replaces the inherited thresholds when present.
    #[serde(default)]
    pub severity: Option<SeverityThresholds>,
}

/// A source with every inherited setting filled in.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSource {
    pub name: String,
    pub echo: EchoConfig,
    pub severity: SeverityThresholds,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollerConfig {
    /// State key for the single source used when `sources` is empty.
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub echo: EchoConfig,
    #[serde(default)]
    pub severity: SeverityThresholds,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub health: HealthConfig,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            echo: EchoConfig::default(),
            severity: SeverityThresholds::default(),
            sources: Vec::new(),
            scheduler: SchedulerConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl PollerConfig {
    /// Sources to poll. Without `[[sources]]` this is the single top-level source.
    pub fn resolved_sources(&self) -> Vec<ResolvedSource> {
        if self.sources.is_empty() {
            return vec![ResolvedSource {
                name: self.name.clone(),
                echo: self.echo.clone(),
                severity: self.severity,
            }];
        }
        self.sources
            .iter()
            .map(|src| {
                let mut echo = self.echo.clone();
                if let Some(ep) = &src.endpoint {
                    echo.endpoint = ep.clone();
                }
                if let Some(days) = src.lookback_days {
                    echo.lookback_days = days;
                }
                echo.extra_params.extend(src.extra_params.clone());
                ResolvedSource {
                    name: src.name.clone(),
                    echo,
                    severity: src.severity.unwrap_or(self.severity),
                }
            })
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            bail!("name must not be empty");
        }
        if self.echo.date_param.trim().is_empty() {
            bail!("echo.date_param must not be empty");
        }
        validate_echo("echo", &self.echo)?;
        if self.scheduler.interval_secs == 0 {
            bail!("scheduler.interval_secs must be > 0");
        }
        if self.health.dead_after_failures == 0 {
            bail!("health.dead_after_failures must be > 0");
        }
        self.severity.validate().map_err(|e| anyhow!(e))?;

        let mut seen = BTreeSet::new();
        for src in self.resolved_sources() {
            if src.name.trim().is_empty() {
                bail!("sources[].name must not be empty");
            }
            if !seen.insert(src.name.clone()) {
                bail!("duplicate source name {:?}", src.name);
            }
            validate_echo(&format!("sources.{}", src.name), &src.echo)?;
            src.severity.validate().map_err(|e| anyhow!("sources.{}.severity: {e}", src.name))?;
        }
        Ok(())
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(ep) = std::env::var(ENV_ENDPOINT) {
            if !ep.trim().is_empty() {
                self.echo.endpoint = ep;
            }
        }
        if let Ok(v) = std::env::var(ENV_INTERVAL) {
            self.scheduler.interval_secs = v
                .trim()
                .parse()
                .with_context(|| format!("{ENV_INTERVAL} is not a number: {v}"))?;
        }
        if let Ok(dir) = std::env::var(ENV_STATE_DIR) {
            if !dir.trim().is_empty() {
                self.scheduler.state_dir = PathBuf::from(dir);
            }
        }
        Ok(())
    }
}

fn validate_echo(scope: &str, echo: &EchoConfig) -> Result<()> {
    if echo.timeout_secs == 0 {
        bail!("{scope}.timeout_secs must be > 0");
    }
    if echo.lookback_days > MAX_LOOKBACK_DAYS {
        bail!("{scope}.lookback_days must be <= {MAX_LOOKBACK_DAYS}");
    }
    Ok(())
}

/// Load config from an explicit path. Supports TOML or JSON formats.
pub fn load_config_from(path: &Path) -> Result<PollerConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading poller config from {}", path.display()))?;
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let mut cfg = parse_config(&content, ext.as_str())
        .with_context(|| format!("parsing poller config {}", path.display()))?;
    cfg.apply_env_overrides()?;
    cfg.validate()?;
    Ok(cfg)
}

/// Load config using env var + fallbacks:
/// 1) $SENTINEL_CONFIG_PATH
/// 2) config/poller.toml
/// 3) config/poller.json
/// 4) built-in defaults
pub fn load_config_default() -> Result<PollerConfig> {
    if let Ok(p) = std::env::var(ENV_PATH) {
        let pb = PathBuf::from(p);
        if pb.exists() {
            return load_config_from(&pb);
        } else {
            return Err(anyhow!("{ENV_PATH} points to non-existent path"));
        }
    }
    let toml_p = PathBuf::from("config/poller.toml");
    if toml_p.exists() {
        return load_config_from(&toml_p);
    }
    let json_p = PathBuf::from("config/poller.json");
    if json_p.exists() {
        return load_config_from(&json_p);
    }
    let mut cfg = PollerConfig::default();
    cfg.apply_env_overrides()?;
    cfg.validate()?;
    Ok(cfg)
}

fn parse_config(s: &str, hint_ext: &str) -> Result<PollerConfig> {
    if hint_ext == "json" {
        return serde_json::from_str(s).context("invalid JSON config");
    }
    // TOML first, JSON fallback for extension-less files.
    match toml::from_str::<PollerConfig>(s) {
        Ok(cfg) => Ok(cfg),
        Err(toml_err) => match serde_json::from_str::<PollerConfig>(s) {
            Ok(cfg) => Ok(cfg),
            Err(_) => Err(anyhow!(toml_err).context("invalid TOML config")),
        },
    }
}
