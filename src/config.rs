//! Configuration management for the cache
//!
//! The cache has one real tunable, the resident-memory ceiling, plus the
//! policy for when eviction runs. Both are process-wide and set once at
//! startup, either from a TOML file, from environment variables, or from the
//! defaults below.
//!
//! ```toml
//! memory_budget_bytes = 1073741824
//! eviction_mode = "background"
//! sweep_interval_ms = 250
//! shrink_policy = "keep_in_place"
//! ```

use crate::error::{Error, Result};
use crate::storage::allocator::ShrinkPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// When the eviction buffer enforces its budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionMode {
    /// Run `ensure_budget` synchronously at the end of every `touch`
    #[default]
    OnTouch,

    /// Leave enforcement to a periodic background sweep
    Background,
}

impl FromStr for EvictionMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "on_touch" | "on-touch" | "sync" => Ok(EvictionMode::OnTouch),
            "background" | "sweep" => Ok(EvictionMode::Background),
            other => Err(Error::Configuration(format!(
                "unknown eviction mode '{}'",
                other
            ))),
        }
    }
}

impl FromStr for ShrinkPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "keep_in_place" | "keep-in-place" | "keep" => Ok(ShrinkPolicy::KeepInPlace),
            "relocate" => Ok(ShrinkPolicy::Relocate),
            other => Err(Error::Configuration(format!(
                "unknown shrink policy '{}'",
                other
            ))),
        }
    }
}

/// Cache configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Resident-memory ceiling in bytes
    #[serde(default = "default_memory_budget")]
    pub memory_budget_bytes: u64,

    /// Synchronous or background budget enforcement
    #[serde(default)]
    pub eviction_mode: EvictionMode,

    /// Background sweep interval in milliseconds
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// What the allocator does when a unit shrinks
    #[serde(default)]
    pub shrink_policy: ShrinkPolicy,

    /// Publish eviction and I/O counters to the prometheus registry
    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    /// Log level for the bundled binaries (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

// Default value functions
fn default_memory_budget() -> u64 { 256 * 1024 * 1024 }
fn default_sweep_interval_ms() -> u64 { 1_000 }
fn default_log_level() -> String { "info".to_string() }
fn default_true() -> bool { true }

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_budget_bytes: default_memory_budget(),
            eviction_mode: EvictionMode::default(),
            sweep_interval_ms: default_sweep_interval_ms(),
            shrink_policy: ShrinkPolicy::default(),
            enable_metrics: true,
            log_level: default_log_level(),
        }
    }
}

impl CacheConfig {
    /// Create a configuration with the given memory budget
    pub fn new(memory_budget_bytes: u64) -> Self {
        Self {
            memory_budget_bytes,
            ..Default::default()
        }
    }

    /// Set the eviction mode
    pub fn with_mode(mut self, mode: EvictionMode) -> Self {
        self.eviction_mode = mode;
        self
    }

    /// Set the background sweep interval
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the allocator's shrink policy
    pub fn with_shrink_policy(mut self, policy: ShrinkPolicy) -> Self {
        self.shrink_policy = policy;
        self
    }

    /// Enable or disable prometheus metrics
    pub fn with_metrics(mut self, enabled: bool) -> Self {
        self.enable_metrics = enabled;
        self
    }

    /// Background sweep interval as a `Duration`
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Load configuration from TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        toml::from_str(&contents).map_err(|e| {
            Error::Configuration(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })
    }

    /// Load configuration with environment variable overrides
    pub fn from_file_with_env(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply environment variable overrides
    ///
    /// Unparseable values are reported instead of silently ignored.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(budget) = std::env::var("BOXCACHE_MEMORY_BUDGET") {
            self.memory_budget_bytes = budget.trim().parse().map_err(|_| {
                Error::Configuration(format!("invalid BOXCACHE_MEMORY_BUDGET '{}'", budget))
            })?;
        }
        if let Ok(mode) = std::env::var("BOXCACHE_EVICTION_MODE") {
            self.eviction_mode = mode.parse()?;
        }
        if let Ok(interval) = std::env::var("BOXCACHE_SWEEP_INTERVAL_MS") {
            self.sweep_interval_ms = interval.trim().parse().map_err(|_| {
                Error::Configuration(format!(
                    "invalid BOXCACHE_SWEEP_INTERVAL_MS '{}'",
                    interval
                ))
            })?;
        }
        if let Ok(policy) = std::env::var("BOXCACHE_SHRINK_POLICY") {
            self.shrink_policy = policy.parse()?;
        }
        if let Ok(log_level) = std::env::var("RUST_LOG") {
            self.log_level = log_level;
        }
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.memory_budget_bytes == 0 {
            return Err(Error::Configuration(
                "Memory budget must be > 0".to_string(),
            ));
        }
        if self.eviction_mode == EvictionMode::Background && self.sweep_interval_ms == 0 {
            return Err(Error::Configuration(
                "Sweep interval must be > 0 in background mode".to_string(),
            ));
        }
        Ok(())
    }

    /// Save configuration to TOML file
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Configuration(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, contents).map_err(|e| {
            Error::Configuration(format!(
                "Failed to write config file {}: {}",
                path.display(),
                e
            ))
        })
    }
}
