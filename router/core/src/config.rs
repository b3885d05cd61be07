//! Router Configuration
//!
//! TOML configuration for the router core with environment overrides.
//!
//! # Configuration Sources (in priority order)
//!
//! 1. Environment variables (`ROUTER_*`, `OLLAMA_*`)
//! 2. TOML file (default: `~/.config/inference-router/config.toml`)
//! 3. Built-in defaults
//!
//! # Example
//!
//! ```toml
//! strategy = "qualityFirst"
//!
//! [circuit]
//! failure_threshold = 5
//! open_timeout_ms = 60000
//!
//! [memory]
//! budget_bytes = 4294967296
//!
//! [memory.pressure_thresholds]
//! warning = 0.75
//! critical = 0.90
//! emergency = 0.95
//!
//! [[models]]
//! id = "llama3.2"
//! quality_score = 0.7
//! cost_per_unit = 0.0
//! average_latency_ms = 800
//! context_limit = 8192
//! capabilities = ["chat", "streaming"]
//! memory_bytes = 2147483648
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::routing::selector::{ModelDescriptor, SelectionStrategy};

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
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
// Sections
// =============================================================================

/// Circuit breaker thresholds
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    /// Consecutive failures that open a circuit
    pub failure_threshold: u32,
    /// How long an open circuit stays open
    pub open_timeout_ms: u64,
    /// Half-open successes needed to close again
    pub success_threshold: u32,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout_ms: 60_000,
            success_threshold: 3,
        }
    }
}

impl CircuitConfig {
    /// Open timeout as a duration
    #[must_use]
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }
}

/// Multi-tier cache settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// TTL given to a zero-cost entry
    pub ttl_base_secs: u64,
    /// Upper bound on any entry's TTL
    pub ttl_max_secs: u64,
    /// Hot tier byte budget
    pub hot_budget_bytes: u64,
    /// Warm tier byte budget
    pub warm_budget_bytes: u64,
    /// Cold tier byte budget
    pub cold_budget_bytes: u64,
    /// Minimum priority score admitted to Hot
    pub hot_admission_floor: f64,
    /// Minimum priority score admitted to Warm
    pub warm_admission_floor: f64,
    /// Minimum priority score admitted to Cold
    pub cold_admission_floor: f64,
    /// Weight of entry age (hours) in the effectiveness denominator
    pub age_weight: f64,
    /// Payloads at least this large are compressed in Warm and Cold
    pub compression_threshold_bytes: usize,
    /// TTL sweep interval
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_base_secs: 300,
            ttl_max_secs: 86_400,
            hot_budget_bytes: 64 * MIB,
            warm_budget_bytes: 256 * MIB,
            cold_budget_bytes: 4 * GIB,
            hot_admission_floor: 0.40,
            warm_admission_floor: 0.20,
            cold_admission_floor: 0.0,
            age_weight: 0.01,
            compression_threshold_bytes: 4096,
            sweep_interval_secs: 60,
        }
    }
}

/// Utilization thresholds for the pressure state machine
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PressureThresholds {
    /// Warning at or above this utilization
    pub warning: f64,
    /// Critical at or above this utilization
    pub critical: f64,
    /// Emergency at or above this utilization
    pub emergency: f64,
}

impl Default for PressureThresholds {
    fn default() -> Self {
        Self {
            warning: 0.75,
            critical: 0.90,
            emergency: 0.95,
        }
    }
}

/// Memory manager and resource pool settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Total managed bytes
    pub budget_bytes: u64,
    /// Pressure thresholds
    pub pressure_thresholds: PressureThresholds,
    /// Share of Hot+Warm bytes evicted under Warning
    pub warning_evict_fraction: f64,
    /// Share of every tier's bytes evicted under Critical
    pub critical_evict_fraction: f64,
    /// Pressure check interval
    pub check_interval_secs: u64,
    /// Pool block sizes, ascending
    pub size_classes: Vec<u64>,
    /// Live block limit per size class
    pub max_blocks_per_class: usize,
    /// Resident models idle this long are unloaded
    pub idle_model_timeout_secs: u64,
    /// Allocations idle this long are swept
    pub idle_allocation_timeout_secs: u64,
    /// Swappable allocations idle this long may be compressed
    pub compress_after_idle_secs: u64,
    /// Execution budget reserved per estimated token
    pub bytes_per_token: u64,
    /// Idle model / allocation scan interval
    pub model_scan_interval_secs: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            budget_bytes: 2 * GIB,
            pressure_thresholds: PressureThresholds::default(),
            warning_evict_fraction: 0.10,
            critical_evict_fraction: 0.30,
            check_interval_secs: 10,
            size_classes: vec![64 * KIB, 512 * KIB, MIB, 4 * MIB, 16 * MIB],
            max_blocks_per_class: 256,
            idle_model_timeout_secs: 300,
            idle_allocation_timeout_secs: 600,
            compress_after_idle_secs: 30,
            bytes_per_token: KIB,
            model_scan_interval_secs: 60,
        }
    }
}

/// Request path settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Per-attempt backend timeout
    pub invoke_timeout_ms: u64,
    /// Fallbacks carried by each decision
    pub max_fallbacks: usize,
    /// Generation allowance when a request sets no max tokens
    pub default_max_tokens: u32,
    /// Catalog refresh interval
    pub catalog_refresh_secs: u64,
    /// Event bus buffer per subscriber
    pub event_capacity: usize,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            invoke_timeout_ms: 120_000,
            max_fallbacks: 2,
            default_max_tokens: 256,
            catalog_refresh_secs: 300,
            event_capacity: 256,
        }
    }
}

/// Backend adapter settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    /// Ollama host
    pub ollama_host: String,
    /// Ollama port
    pub ollama_port: u16,
    /// Models that are never unloaded under pressure
    pub pinned_models: Vec<String>,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            ollama_host: "localhost".to_string(),
            ollama_port: 11434,
            pinned_models: Vec::new(),
        }
    }
}

// =============================================================================
// Router Configuration
// =============================================================================

/// Complete router configuration
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Selection strategy
    pub strategy: SelectionStrategy,
    /// Circuit breaker thresholds
    pub circuit: CircuitConfig,
    /// Cache settings
    pub cache: CacheConfig,
    /// Memory settings
    pub memory: MemoryConfig,
    /// Request path settings
    pub routing: RoutingConfig,
    /// Backend adapter settings
    pub backend: BackendSettings,
    /// Static model catalog
    pub models: Vec<ModelDescriptor>,
}

impl RouterConfig {
    /// Parse a TOML document; absent keys keep their defaults
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = self.memory.pressure_thresholds;
        for (name, value) in [
            ("warning", t.warning),
            ("critical", t.critical),
            ("emergency", t.emergency),
        ] {
            if !(value > 0.0 && value < 1.0) {
                return Err(ConfigError::ValidationError(format!(
                    "pressure threshold {name} must be in (0, 1), got {value}"
                )));
            }
        }
        if !(t.warning < t.critical && t.critical < t.emergency) {
            return Err(ConfigError::ValidationError(format!(
                "pressure thresholds must be increasing: {} < {} < {}",
                t.warning, t.critical, t.emergency
            )));
        }
        if self.circuit.failure_threshold == 0 || self.circuit.success_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "circuit thresholds must be at least 1".to_string(),
            ));
        }
        if self.memory.budget_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "memory budget must be non-zero".to_string(),
            ));
        }
        for (name, fraction) in [
            ("warning_evict_fraction", self.memory.warning_evict_fraction),
            ("critical_evict_fraction", self.memory.critical_evict_fraction),
        ] {
            if !(fraction > 0.0 && fraction <= 1.0) {
                return Err(ConfigError::ValidationError(format!(
                    "{name} must be in (0, 1], got {fraction}"
                )));
            }
        }
        let classes = &self.memory.size_classes;
        if classes.is_empty()
            || classes.contains(&0)
            || classes.windows(2).any(|w| w[0] >= w[1])
        {
            return Err(ConfigError::ValidationError(
                "size classes must be non-empty, non-zero and strictly ascending".to_string(),
            ));
        }
        if self.cache.ttl_max_secs < self.cache.ttl_base_secs {
            return Err(ConfigError::ValidationError(
                "cache ttl_max_secs must not be below ttl_base_secs".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Loading
// =============================================================================

/// Default configuration file location
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("inference-router").join("config.toml"))
}

/// Load configuration from the default path (missing file = defaults)
pub fn load_config() -> Result<RouterConfig, ConfigError> {
    match default_config_path() {
        Some(path) if path.exists() => load_config_from_path(&path),
        _ => {
            let mut config = RouterConfig::default();
            apply_env_overrides(&mut config, |key| std::env::var(key).ok());
            config.validate()?;
            Ok(config)
        }
    }
}

/// Load configuration from an explicit file, then apply env overrides
pub fn load_config_from_path(path: &Path) -> Result<RouterConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.to_path_buf(),
        source: e,
    })?;
    let mut config: RouterConfig = toml::from_str(&content)?;

    tracing::info!(
        path = %path.display(),
        models = config.models.len(),
        "Loaded configuration from file"
    );

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

/// Apply environment overrides using `lookup` to read variables
pub fn apply_env_overrides<F>(config: &mut RouterConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(strategy) = lookup("ROUTER_STRATEGY") {
        match strategy.parse::<SelectionStrategy>() {
            Ok(s) => config.strategy = s,
            Err(e) => tracing::warn!(value = %strategy, error = %e, "Ignoring ROUTER_STRATEGY"),
        }
    }
    if let Some(bytes) = lookup("ROUTER_MEMORY_BUDGET_BYTES").and_then(|v| v.parse().ok()) {
        config.memory.budget_bytes = bytes;
    }
    if let Some(secs) = lookup("ROUTER_CACHE_TTL_MAX_SECS").and_then(|v| v.parse().ok()) {
        config.cache.ttl_max_secs = secs;
    }
    if let Some(host) = lookup("OLLAMA_HOST") {
        config.backend.ollama_host = host;
    }
    if let Some(port) = lookup("OLLAMA_PORT").and_then(|v| v.parse().ok()) {
        config.backend.ollama_port = port;
    }
}
