//! Offload settings snapshot and watermark validation.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Accelerator memory below which the high watermark is considered too tight.
const LOW_MEMORY_BUDGET: u64 = 4 * 1024 * 1024 * 1024;

/// Offload strategy selected by the front end
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OffloadMode {
    /// Everything stays where the loader put it
    None,
    /// Whole-model offload, owned by the pipeline itself
    Model,
    /// Per-layer streaming, owned by the pipeline itself
    Sequential,
    /// Watermark-driven placement and eviction managed by this crate
    #[default]
    Balanced,
}

impl std::fmt::Display for OffloadMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OffloadMode::None => "none",
            OffloadMode::Model => "model",
            OffloadMode::Sequential => "sequential",
            OffloadMode::Balanced => "balanced",
        };
        f.write_str(name)
    }
}

/// Settings consumed by the offload manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OffloadConfig {
    /// Selected offload strategy
    #[serde(default)]
    pub offload_mode: OffloadMode,

    /// Accelerator occupancy fraction above which submodules are evicted
    #[serde(default = "default_low_watermark")]
    pub low_watermark: f64,

    /// Fraction of accelerator memory a single placement may use
    #[serde(default = "default_high_watermark")]
    pub high_watermark: f64,

    /// Fraction of host memory a device map may use
    #[serde(default = "default_host_watermark")]
    pub host_watermark: f64,

    /// Pipeline class names that never get balanced offload
    #[serde(default = "default_excluded_pipeline_types")]
    pub excluded_pipeline_types: Vec<String>,

    /// Root directory for disk spill of parameters that fit nowhere
    #[serde(default = "default_scratch_directory")]
    pub offload_scratch_directory: PathBuf,

    /// Accelerator capacity override (bytes), otherwise read from the backend
    #[serde(default)]
    pub accelerator_memory_bytes: Option<u64>,

    /// Host capacity override (bytes), otherwise read from the backend
    #[serde(default)]
    pub host_memory_bytes: Option<u64>,

    /// Evict allow-listed submodules right after their own invocation
    #[serde(default = "default_forced_eviction")]
    pub forced_eviction: bool,

    /// Error message fragments treated as harmless allocator quirks
    #[serde(default = "default_benign_error_patterns")]
    pub benign_error_patterns: Vec<String>,
}

fn default_low_watermark() -> f64 {
    0.2
}

fn default_high_watermark() -> f64 {
    0.7
}

fn default_host_watermark() -> f64 {
    0.75
}

fn default_excluded_pipeline_types() -> Vec<String> {
    vec!["CogView4Pipeline".to_string()]
}

fn default_scratch_directory() -> PathBuf {
    PathBuf::from("cache").join("offload")
}

fn default_forced_eviction() -> bool {
    true
}

fn default_benign_error_patterns() -> Vec<String> {
    vec!["bitsandbytes".to_string()]
}

impl Default for OffloadConfig {
    fn default() -> Self {
        Self {
            offload_mode: OffloadMode::default(),
            low_watermark: default_low_watermark(),
            high_watermark: default_high_watermark(),
            host_watermark: default_host_watermark(),
            excluded_pipeline_types: default_excluded_pipeline_types(),
            offload_scratch_directory: default_scratch_directory(),
            accelerator_memory_bytes: None,
            host_memory_bytes: None,
            forced_eviction: default_forced_eviction(),
            benign_error_patterns: default_benign_error_patterns(),
        }
    }
}

impl OffloadConfig {
    /// Load settings from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: OffloadConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Set the watermarks
    pub fn with_watermarks(mut self, low: f64, high: f64) -> Self {
        self.low_watermark = low;
        self.high_watermark = high;
        self
    }

    /// Set the offload mode
    pub fn with_mode(mut self, mode: OffloadMode) -> Self {
        self.offload_mode = mode;
        self
    }

    /// Check whether a pipeline class is excluded from balanced offload
    pub fn is_excluded(&self, pipeline_type: &str) -> bool {
        self.excluded_pipeline_types.iter().any(|t| t == pipeline_type)
    }
}

/// Validated watermark triple.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Watermarks {
    pub low: f64,
    pub high: f64,
    pub host: f64,
}

impl Watermarks {
    /// Resolve watermarks from settings, clamping invalid values.
    ///
    /// Returns the corrected triple and one message per correction so the
    /// caller decides whether to log them.
    pub fn resolve(config: &OffloadConfig) -> (Self, Vec<String>) {
        let mut corrections = Vec::new();
        let mut low = config.low_watermark;
        let mut high = config.high_watermark;
        let mut host = config.host_watermark;

        if !(low > 0.0 && low <= 1.0) {
            corrections.push(format!("watermark low={} invalid value, using 0.2", low));
            low = 0.2;
        }
        if !(0.1..=1.0).contains(&high) {
            corrections.push(format!("watermark high={} invalid value, using 0.7", high));
            high = 0.7;
        }
        if !(host > 0.0 && host <= 1.0) {
            corrections.push(format!("watermark host={} invalid value, using 0.75", host));
            host = 0.75;
        }
        if low > high {
            corrections.push(format!("watermark low={} above high={}, reset to high", low, high));
            low = high;
        }

        (Self { low, high, host }, corrections)
    }

    /// Resolve and log every correction as a warning.
    pub fn validate(config: &OffloadConfig) -> Self {
        let (watermarks, corrections) = Self::resolve(config);
        for correction in &corrections {
            tracing::warn!("Offload: type=balanced op=validate: {}", correction);
        }
        watermarks
    }

    /// Warn when the high watermark leaves too little accelerator memory.
    pub fn check_budget(&self, accelerator_total: u64) -> bool {
        let budget = (accelerator_total as f64 * self.high) as u64;
        if budget < LOW_MEMORY_BUDGET {
            tracing::warn!(
                "Offload: type=balanced op=validate: watermark high={} low memory budget={}",
                self.high,
                crate::utils::format_bytes(budget)
            );
            return false;
        }
        true
    }

    /// Same accelerator watermarks (the comparison used for manager reuse)
    pub fn same_accelerator_marks(&self, other: &Watermarks) -> bool {
        self.low == other.low && self.high == other.high
    }
}
