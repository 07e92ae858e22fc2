use serde::{Deserialize, Serialize};
use std::{collections::HashMap, time::Duration};
use crate::error::{GatekeeperError, Result};

/// Default sweep period for idle caller limiters
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 5 * 60;

/// Default idle age after which a caller limiter is evicted
pub const DEFAULT_MAX_IDLE_SECS: u64 = 15 * 60;

/// Token bucket parameters: refill rate in tokens per second and burst capacity
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LimitSpec {
    pub rate: f64,
    pub burst: u32,
}

impl LimitSpec {
    pub fn new(rate: f64, burst: u32) -> Self {
        Self { rate, burst }
    }

    /// Check that the spec describes a usable bucket
    pub fn validate(&self) -> Result<()> {
        if !self.rate.is_finite() || self.rate <= 0.0 {
            return Err(GatekeeperError::Config(format!(
                "rate must be a positive number, got {}",
                self.rate
            )));
        }
        if self.burst == 0 {
            return Err(GatekeeperError::Config(
                "burst must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Admission configuration as it appears on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    pub global: LimitSpec,
    #[serde(default)]
    pub methods: HashMap<String, LimitSpec>,
    pub per_caller: Option<LimitSpec>,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_max_idle_secs")]
    pub max_idle_secs: u64,
}

fn default_sweep_interval_secs() -> u64 {
    DEFAULT_SWEEP_INTERVAL_SECS
}

fn default_max_idle_secs() -> u64 {
    DEFAULT_MAX_IDLE_SECS
}

/// Validated runtime configuration for the limiter registry
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub global: LimitSpec,
    pub methods: HashMap<String, LimitSpec>,
    pub per_caller: Option<LimitSpec>,
    pub sweep_interval: Duration,
    pub max_idle: Duration,
}

impl RegistryConfig {
    /// Configuration with only a global limit and default eviction timings
    pub fn new(global: LimitSpec) -> Self {
        Self {
            global,
            methods: HashMap::new(),
            per_caller: None,
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            max_idle: Duration::from_secs(DEFAULT_MAX_IDLE_SECS),
        }
    }

    pub fn with_method(mut self, method: impl Into<String>, spec: LimitSpec) -> Self {
        self.methods.insert(method.into(), spec);
        self
    }

    pub fn with_per_caller(mut self, spec: LimitSpec) -> Self {
        self.per_caller = Some(spec);
        self
    }

    pub fn with_eviction(mut self, sweep_interval: Duration, max_idle: Duration) -> Self {
        self.sweep_interval = sweep_interval;
        self.max_idle = max_idle;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.global.validate()?;
        for (method, spec) in &self.methods {
            spec.validate().map_err(|e| {
                GatekeeperError::Config(format!("method {}: {}", method, e))
            })?;
        }
        if let Some(spec) = &self.per_caller {
            spec.validate()?;
        }
        if self.sweep_interval.is_zero() {
            return Err(GatekeeperError::Config(
                "sweep interval must be non-zero".to_string(),
            ));
        }
        if self.max_idle.is_zero() {
            return Err(GatekeeperError::Config(
                "max idle age must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl TryFrom<AdmissionConfig> for RegistryConfig {
    type Error = GatekeeperError;

    fn try_from(config: AdmissionConfig) -> Result<Self> {
        let compiled = Self {
            global: config.global,
            methods: config.methods,
            // A zero rate on disk means per-caller limiting is off
            per_caller: config.per_caller.filter(|spec| spec.rate > 0.0),
            sweep_interval: Duration::from_secs(config.sweep_interval_secs),
            max_idle: Duration::from_secs(config.max_idle_secs),
        };
        compiled.validate()?;
        Ok(compiled)
    }
}

/// Load configuration from YAML string
pub fn load_config_from_yaml(yaml: &str) -> Result<AdmissionConfig> {
    serde_yaml::from_str(yaml).map_err(|e| {
        GatekeeperError::Config(format!("Failed to parse YAML: {}", e))
    })
}

/// Load configuration from YAML file
pub fn load_config_from_file(path: &str) -> Result<AdmissionConfig> {
    let content = std::fs::read_to_string(path)?;
    load_config_from_yaml(&content)
}
