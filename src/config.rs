use serde::{Deserialize, Serialize};

pub const DEFAULT_GC_THRESHOLD: usize = 1024 * 1024;
pub const DEFAULT_GC_GROWTH_FACTOR: f64 = 2.0;

pub const ENV_GC_THRESHOLD: &str = "ORUS_GC_THRESHOLD";
pub const ENV_GC_GROWTH: &str = "ORUS_GC_GROWTH";
pub const ENV_TRACE: &str = "ORUS_TRACE";

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("{var} must be a byte count, got '{value}'")]
    InvalidThreshold { var: &'static str, value: String },
    #[error("{var} must be a number greater than 1.0, got '{value}'")]
    InvalidGrowth { var: &'static str, value: String },
    #[error("{var} must be 0, 1, true or false, got '{value}'")]
    InvalidFlag { var: &'static str, value: String },
}

/// Tunables for one VM instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Allocated bytes that trigger the first collection.
    pub gc_threshold: usize,
    /// Floor for the threshold recomputed after each collection.
    pub gc_min_threshold: usize,
    /// New threshold = live bytes × this factor.
    pub gc_growth_factor: f64,
    /// Emit a trace event per executed instruction.
    pub trace_execution: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            gc_threshold: DEFAULT_GC_THRESHOLD,
            gc_min_threshold: DEFAULT_GC_THRESHOLD,
            gc_growth_factor: DEFAULT_GC_GROWTH_FACTOR,
            trace_execution: false,
        }
    }
}

impl VmConfig {
    /// Defaults overlaid with `ORUS_GC_THRESHOLD`, `ORUS_GC_GROWTH` and `ORUS_TRACE`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env`, reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = VmConfig::default();

        if let Some(raw) = lookup(ENV_GC_THRESHOLD) {
            let bytes = raw
                .trim()
                .parse::<usize>()
                .map_err(|_| ConfigError::InvalidThreshold { var: ENV_GC_THRESHOLD, value: raw.clone() })?;
            config.gc_threshold = bytes;
            config.gc_min_threshold = bytes;
        }

        if let Some(raw) = lookup(ENV_GC_GROWTH) {
            let factor = raw
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite() && *f > 1.0)
                .ok_or_else(|| ConfigError::InvalidGrowth { var: ENV_GC_GROWTH, value: raw.clone() })?;
            config.gc_growth_factor = factor;
        }

        if let Some(raw) = lookup(ENV_TRACE) {
            config.trace_execution = match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" => true,
                "0" | "false" | "" => false,
                _ => return Err(ConfigError::InvalidFlag { var: ENV_TRACE, value: raw }),
            };
        }

        Ok(config)
    }
}
