//! Host configuration.
//!
//! Loaded from TOML; every table and field is optional and falls back to the
//! defaults below.
//!
//! ```toml
//! [modules]
//! system_module_dir = "/system/lib/module"
//!
//! [engine]
//! create_timeout_ms = 3000
//!
//! [idle]
//! foreground_check_cycles = 15
//! ```

use crate::error::{HostError, HostResult};
use arkhost_loader::ModuleManagerConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level host configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub modules: ModuleManagerConfig,
    pub engine: EngineConfig,
    pub idle: IdleConfig,
}

/// Engine creation and run loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How long to wait for an engine created on a dedicated thread.
    /// Default: 3000
    pub create_timeout_ms: u64,

    /// Name prefix for dedicated engine threads.
    /// Default: `arkhost-engine`
    pub thread_name_prefix: String,

    /// Longest a run loop blocks before reporting another idle window.
    /// Default: 100
    pub loop_wait_slice_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            create_timeout_ms: 3000,
            thread_name_prefix: "arkhost-engine".to_string(),
            loop_wait_slice_ms: 100,
        }
    }
}

impl EngineConfig {
    pub fn create_timeout(&self) -> Duration {
        Duration::from_millis(self.create_timeout_ms)
    }

    pub fn loop_wait_slice(&self) -> Duration {
        Duration::from_millis(self.loop_wait_slice_ms)
    }
}

/// Idle GC heuristic thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdleConfig {
    /// Idle budgets and intervals below this are ignored.
    /// Default: 10
    pub min_trigger_interval_ms: i64,

    /// An interval shorter than `average * multiplier` is a regular cadence.
    /// Default: 2
    pub interval_multiplier: i64,

    /// Period of the low-activity check.
    /// Default: 1000
    pub monitoring_interval_ms: u64,

    /// Period of the low-activity check after a compacting GC.
    /// Default: 90000
    pub sleep_interval_ms: u64,

    /// At most this many idle notifications per period counts as low activity.
    /// Default: 10
    pub low_notify_threshold: u32,

    /// Consecutive low-activity periods required in the foreground.
    /// Default: 15
    pub foreground_check_cycles: u32,

    /// Consecutive low-activity periods required in the background.
    /// Default: 4
    pub background_check_cycles: u32,

    /// Idle share of a foreground period that counts as low activity.
    /// Default: 0.985
    pub foreground_idle_ratio: f64,

    /// Idle share of a background period that counts as low activity.
    /// Default: 0.85
    pub background_idle_ratio: f64,
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            min_trigger_interval_ms: 10,
            interval_multiplier: 2,
            monitoring_interval_ms: 1000,
            sleep_interval_ms: 90_000,
            low_notify_threshold: 10,
            foreground_check_cycles: 15,
            background_check_cycles: 4,
            foreground_idle_ratio: 0.985,
            background_idle_ratio: 0.85,
        }
    }
}

impl IdleConfig {
    pub fn monitoring_interval(&self) -> Duration {
        Duration::from_millis(self.monitoring_interval_ms)
    }

    pub fn sleep_interval(&self) -> Duration {
        Duration::from_millis(self.sleep_interval_ms)
    }

    fn validate(&self) -> HostResult<()> {
        if self.foreground_check_cycles == 0 || self.background_check_cycles == 0 {
            return Err(HostError::config("idle check cycles must be at least 1"));
        }
        for (name, ratio) in [
            ("foreground_idle_ratio", self.foreground_idle_ratio),
            ("background_idle_ratio", self.background_idle_ratio),
        ] {
            if !(ratio > 0.0 && ratio <= 1.0) {
                return Err(HostError::config(format!(
                    "{name} must be in (0, 1], got {ratio}"
                )));
            }
        }
        if self.monitoring_interval_ms == 0 || self.sleep_interval_ms == 0 {
            return Err(HostError::config("idle monitoring intervals must be non-zero"));
        }
        if self.interval_multiplier <= 0 {
            return Err(HostError::config("interval_multiplier must be positive"));
        }
        Ok(())
    }
}

impl HostConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a TOML document.
    pub fn from_toml_str(content: &str) -> HostResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| HostError::config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file.
    pub fn from_file(path: &Path) -> HostResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            HostError::config(format!("Failed to read config '{}': {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    /// Serialize back to TOML.
    pub fn to_toml_string(&self) -> HostResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| HostError::config(format!("Failed to serialize config: {e}")))
    }

    pub fn validate(&self) -> HostResult<()> {
        if self.engine.create_timeout_ms == 0 {
            return Err(HostError::config("engine.create_timeout_ms must be non-zero"));
        }
        if self.engine.loop_wait_slice_ms == 0 {
            return Err(HostError::config("engine.loop_wait_slice_ms must be non-zero"));
        }
        if self.engine.thread_name_prefix.is_empty() {
            return Err(HostError::config("engine.thread_name_prefix must not be empty"));
        }
        if self.modules.max_path_len == 0 {
            return Err(HostError::config("modules.max_path_len must be non-zero"));
        }
        self.idle.validate()
    }

    /// Set the module manager configuration.
    pub fn modules(mut self, modules: ModuleManagerConfig) -> Self {
        self.modules = modules;
        self
    }

    /// Set the dedicated-thread creation timeout.
    pub fn create_timeout(mut self, timeout: Duration) -> Self {
        self.engine.create_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the dedicated thread name prefix.
    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.engine.thread_name_prefix = prefix.into();
        self
    }

    /// Set the idle heuristic thresholds.
    pub fn idle(mut self, idle: IdleConfig) -> Self {
        self.idle = idle;
        self
    }
}
