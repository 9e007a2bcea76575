//! VM configuration
//!
//! `VmOptions` is the launch configuration: heap geometry, heuristic
//! selection, verification and fault-injection toggles, archive settings.
//! Options load from TOML; sizes accept either integers or human strings such
//! as `"384M"`, `"1G"` or `"512k"`.
//!
//! ```toml
//! heap_size = "384M"
//! heuristics = "passive"
//! verify = true
//! archive = "app.jsa"
//! ```

use crate::defaults::{
    DEFAULT_CONTROL_INTERVAL_MS, DEFAULT_HEAP_SIZE, DEFAULT_SATB_BUFFER_SIZE, MAX_REGION_SIZE,
    MIN_REGION_SIZE, TARGET_REGION_COUNT,
};
use crate::heuristics::HeuristicKind;
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to parse TOML
    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Malformed size string
    #[error("Invalid size: {0}")]
    InvalidSize(String),

    /// Unknown heuristic name
    #[error("Unknown heuristic: {0}")]
    UnknownHeuristic(String),

    /// Validation error
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Options for creating a VM
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VmOptions {
    /// Maximum heap size in bytes
    #[serde(deserialize_with = "deserialize_size")]
    pub heap_size: usize,

    /// Region size in bytes (0 derives it from the heap size)
    #[serde(deserialize_with = "deserialize_size")]
    pub region_size: usize,

    /// Collection trigger strategy
    pub heuristics: HeuristicKind,

    /// Verify heap consistency after every phase
    pub verify: bool,

    /// Inject allocation failures during evacuation
    pub oom_during_evac_a_lot: bool,

    /// Parallel marking workers
    pub concurrent_workers: usize,

    /// How often the control thread consults the heuristics
    pub control_interval_ms: u64,

    /// Archive to map at startup
    pub archive: Option<PathBuf>,

    /// Materialize archived heap objects
    pub share_heap_objects: bool,

    /// 4-byte reference fields
    pub compressed_refs: bool,

    /// Per-mutator SATB buffer capacity
    pub satb_buffer_size: usize,

    /// Treat OOM after a full collection as fatal (log a heap dump)
    pub fatal_on_oom: bool,
}

impl Default for VmOptions {
    fn default() -> Self {
        Self {
            heap_size: DEFAULT_HEAP_SIZE,
            region_size: 0,
            heuristics: HeuristicKind::Adaptive,
            verify: false,
            oom_during_evac_a_lot: false,
            concurrent_workers: (num_cpus::get() / 4).max(1),
            control_interval_ms: DEFAULT_CONTROL_INTERVAL_MS,
            archive: None,
            share_heap_objects: true,
            compressed_refs: true,
            satb_buffer_size: DEFAULT_SATB_BUFFER_SIZE,
            fatal_on_oom: false,
        }
    }
}

impl VmOptions {
    /// Parse options from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let options: VmOptions = toml::from_str(content)?;
        options.validate()?;
        Ok(options)
    }

    /// Load options from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Region size actually used by the heap
    pub fn effective_region_size(&self) -> usize {
        if self.region_size != 0 {
            return self.region_size;
        }
        let target = (self.heap_size / TARGET_REGION_COUNT).max(1);
        // largest power of two not above the target
        let size = 1usize << (usize::BITS - 1 - target.leading_zeros());
        size.clamp(MIN_REGION_SIZE, MAX_REGION_SIZE)
    }

    /// Validate the options
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.region_size != 0 {
            if !self.region_size.is_power_of_two() {
                return Err(ConfigError::ValidationError(format!(
                    "region size {} is not a power of two",
                    self.region_size
                )));
            }
            if self.region_size < MIN_REGION_SIZE || self.region_size > MAX_REGION_SIZE {
                return Err(ConfigError::ValidationError(format!(
                    "region size {} outside {}..={}",
                    self.region_size, MIN_REGION_SIZE, MAX_REGION_SIZE
                )));
            }
        }

        let region_size = self.effective_region_size();
        if self.heap_size < 2 * region_size {
            return Err(ConfigError::ValidationError(format!(
                "heap size {} must hold at least two regions of {} bytes",
                self.heap_size, region_size
            )));
        }

        if self.concurrent_workers == 0 {
            return Err(ConfigError::ValidationError(
                "concurrent_workers must be at least 1".to_string(),
            ));
        }

        if self.satb_buffer_size == 0 {
            return Err(ConfigError::ValidationError(
                "satb_buffer_size must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

/// Parse a size such as `384M`, `1G`, `512k` or `4096`
pub fn parse_size(text: &str) -> Result<usize, ConfigError> {
    let trimmed = text.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, suffix) = trimmed.split_at(split);
    let value: usize = digits
        .parse()
        .map_err(|_| ConfigError::InvalidSize(text.to_string()))?;
    let multiplier: usize = match suffix.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" | "kib" => 1 << 10,
        "m" | "mb" | "mib" => 1 << 20,
        "g" | "gb" | "gib" => 1 << 30,
        _ => return Err(ConfigError::InvalidSize(text.to_string())),
    };
    value
        .checked_mul(multiplier)
        .ok_or_else(|| ConfigError::InvalidSize(text.to_string()))
}

fn deserialize_size<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum SizeRepr {
        Int(u64),
        Text(String),
    }

    match SizeRepr::deserialize(deserializer)? {
        SizeRepr::Int(v) => usize::try_from(v).map_err(serde::de::Error::custom),
        SizeRepr::Text(s) => parse_size(&s).map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("384M").unwrap(), 384 * 1024 * 1024);
        assert_eq!(parse_size("1G").unwrap(), 1 << 30);
        assert_eq!(parse_size("512k").unwrap(), 512 * 1024);
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert!(parse_size("12q").is_err());
        assert!(parse_size("M").is_err());
    }

    #[test]
    fn test_derived_region_size() {
        let options = VmOptions {
            heap_size: 384 * 1024 * 1024,
            ..VmOptions::default()
        };
        // 384M / 2048 = 192K, rounded down to a power of two
        assert_eq!(options.effective_region_size(), 128 * 1024);

        let tiny = VmOptions {
            heap_size: 1024 * 1024,
            ..VmOptions::default()
        };
        assert_eq!(tiny.effective_region_size(), MIN_REGION_SIZE);
    }

    #[test]
    fn test_from_toml() {
        let options = VmOptions::from_toml_str(
            r#"
            heap_size = "64M"
            heuristics = "Passive"
            verify = true
            oom_during_evac_a_lot = true
            "#,
        )
        .unwrap();
        assert_eq!(options.heap_size, 64 * 1024 * 1024);
        assert_eq!(options.heuristics, HeuristicKind::Passive);
        assert!(options.verify);
        assert!(options.oom_during_evac_a_lot);
        assert!(options.compressed_refs);
    }

    #[test]
    fn test_integer_sizes_and_validation() {
        let options = VmOptions::from_toml_str("heap_size = 8388608\nregion_size = 65536").unwrap();
        assert_eq!(options.heap_size, 8 * 1024 * 1024);
        assert_eq!(options.region_size, 65536);

        assert!(VmOptions::from_toml_str("region_size = 70000").is_err());
        assert!(VmOptions::from_toml_str("heap_size = \"64k\"").is_err());
        assert!(VmOptions::from_toml_str("heuristics = \"bogus\"").is_err());
    }
}
