//! Federation configuration
//!
//! Loaded from an optional JSON file, then overridden by `QUARRY_*`
//! environment variables. Every field has a default, so an empty file (or
//! no file) is a valid configuration.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use quarry_core::{FederationError, FederationResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PushdownConfig {
    /// Row limit applied when a query has no LIMIT.
    pub default_limit: usize,
    /// Upper bound on rows fetched when filtering or sorting happens locally.
    pub max_scan_rows: usize,
}

impl Default for PushdownConfig {
    fn default() -> Self {
        Self {
            default_limit: 20,
            max_scan_rows: 10_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    /// Clustered when a cluster address is configured, otherwise local.
    #[default]
    Auto,
    Clustered,
    Local,
}

impl FromStr for TransportMode {
    type Err = FederationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(TransportMode::Auto),
            "clustered" | "cluster" => Ok(TransportMode::Clustered),
            "local" => Ok(TransportMode::Local),
            other => Err(FederationError::configuration(format!(
                "unknown RPC transport '{other}' (expected auto, clustered or local)"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub transport: TransportMode,
    pub cluster_address: Option<String>,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            transport: TransportMode::Auto,
            cluster_address: None,
            max_attempts: 10,
            base_delay_ms: 3000,
            multiplier: 1.0,
            max_delay_ms: 30_000,
            request_timeout_ms: 30_000,
        }
    }
}

impl RpcConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Directory for daily rolling log files; stderr when unset.
    pub directory: Option<PathBuf>,
    pub json: bool,
    /// Used when `RUST_LOG` is not set.
    pub filter: String,
    pub retention_days: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            directory: None,
            json: false,
            filter: "quarry=info,quarry_lib=info".to_string(),
            retention_days: 14,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FederationConfig {
    pub pushdown: PushdownConfig,
    pub rpc: RpcConfig,
    pub query_timeout_ms: u64,
    pub logging: LogConfig,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            pushdown: PushdownConfig::default(),
            rpc: RpcConfig::default(),
            query_timeout_ms: 60_000,
            logging: LogConfig::default(),
        }
    }
}

fn parse_env<T: FromStr>(key: &str, raw: &str) -> FederationResult<T> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| FederationError::configuration(format!("invalid value for {key}: '{raw}'")))
}

impl FederationConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    /// Reads a JSON configuration file. A missing file yields the defaults.
    pub fn load_file(path: &Path) -> FederationResult<Self> {
        if !path.exists() {
            debug!("No config file at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            FederationError::configuration(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|e| {
            FederationError::configuration(format!("Failed to parse config {}: {}", path.display(), e))
        })?;

        info!("Loaded federation configuration from {:?}", path);
        Ok(config)
    }

    /// Applies `QUARRY_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(mut self, lookup: F) -> FederationResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("QUARRY_DEFAULT_LIMIT") {
            self.pushdown.default_limit = parse_env("QUARRY_DEFAULT_LIMIT", &v)?;
        }
        if let Some(v) = lookup("QUARRY_MAX_SCAN_ROWS") {
            self.pushdown.max_scan_rows = parse_env("QUARRY_MAX_SCAN_ROWS", &v)?;
        }
        if let Some(v) = lookup("QUARRY_RPC_TRANSPORT") {
            self.rpc.transport = v.parse()?;
        }
        if let Some(v) = lookup("QUARRY_CLUSTER_ADDRESS") {
            self.rpc.cluster_address = Some(v).filter(|s| !s.trim().is_empty());
        }
        if let Some(v) = lookup("QUARRY_RPC_MAX_ATTEMPTS") {
            self.rpc.max_attempts = parse_env("QUARRY_RPC_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = lookup("QUARRY_RPC_BASE_DELAY_MS") {
            self.rpc.base_delay_ms = parse_env("QUARRY_RPC_BASE_DELAY_MS", &v)?;
        }
        if let Some(v) = lookup("QUARRY_QUERY_TIMEOUT_MS") {
            self.query_timeout_ms = parse_env("QUARRY_QUERY_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("QUARRY_LOG_DIR") {
            self.logging.directory = Some(PathBuf::from(v)).filter(|p| !p.as_os_str().is_empty());
        }
        if let Some(v) = lookup("QUARRY_LOG_JSON") {
            self.logging.json = parse_env("QUARRY_LOG_JSON", &v)?;
        }
        self.validate()?;
        Ok(self)
    }

    /// File (if given) plus process environment.
    pub fn load(path: Option<&Path>) -> FederationResult<Self> {
        let base = match path {
            Some(path) => Self::load_file(path)?,
            None => Self::default(),
        };
        base.apply_overrides(|key| std::env::var(key).ok())
    }

    pub fn validate(&self) -> FederationResult<()> {
        if self.pushdown.default_limit == 0 {
            return Err(FederationError::configuration("pushdown.default_limit must be positive"));
        }
        if self.pushdown.max_scan_rows == 0 {
            return Err(FederationError::configuration("pushdown.max_scan_rows must be positive"));
        }
        if self.rpc.max_attempts == 0 {
            return Err(FederationError::configuration("rpc.max_attempts must be at least 1"));
        }
        if !self.rpc.multiplier.is_finite() || self.rpc.multiplier < 1.0 {
            return Err(FederationError::configuration("rpc.multiplier must be >= 1.0"));
        }
        Ok(())
    }
}
