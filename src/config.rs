//! Runtime configuration for the metadata cache.
//!
//! Configuration can be loaded from a JSON file or constructed
//! programmatically. All cache knobs (size budget, eviction switches,
//! adaptive resize thresholds, load retry policy, collective mode) live here.

use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Command-line arguments for the `mdcache` driver.
#[derive(Parser, Debug, Clone)]
#[command(name = "mdcache", about = "Metadata cache workload driver")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "mdcache.json")]
    pub config: PathBuf,

    /// Backing file the workload reads and writes.
    #[arg(short, long, default_value = "mdcache.bin")]
    pub store: PathBuf,

    /// Number of entries the workload creates.
    #[arg(long, default_value_t = 1024)]
    pub entries: usize,

    /// Number of protect/modify rounds.
    #[arg(long, default_value_t = 8)]
    pub rounds: usize,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Size budget and core switches.
    pub cache: CacheConfig,

    /// Adaptive size controller.
    pub resize: ResizeConfig,

    /// Load retry policy.
    pub load: LoadConfig,

    /// Present when the cache cooperates with other processes.
    pub collective: Option<CollectiveConfig>,
}

/// Size budget and core behaviour switches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Target upper bound on the bytes of all cached entries.
    pub max_size: usize,

    /// Bytes that should be kept clean so eviction never has to write.
    pub min_clean_size: usize,

    /// When false the cache grows without bound until re-enabled.
    pub evictions_enabled: bool,

    /// Whether dirty entries may be written at all right now.
    pub write_permitted: bool,

    /// Keep the address-ordered dirty set. Disabling trades deterministic
    /// flush order for less bookkeeping.
    pub dirty_set_enabled: bool,

    /// log2 of the number of hash index buckets.
    pub hash_bucket_bits: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 2 * 1024 * 1024,      // 2 MiB
            min_clean_size: 1024 * 1024,    // 1 MiB
            evictions_enabled: true,
            write_permitted: true,
            dirty_set_enabled: true,
            hash_bucket_bits: 16,
        }
    }
}

/// Adaptive size controller settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResizeConfig {
    /// Grow `max_size` at the end of a low hit-rate epoch.
    pub incr_enabled: bool,

    /// Shrink `max_size` at the end of a high hit-rate epoch.
    pub decr_enabled: bool,

    /// Accesses per epoch.
    pub epoch_length: u64,

    /// Floor for `max_size`.
    pub min_size: usize,

    /// Ceiling for `max_size`.
    pub max_size: usize,

    /// `min_clean_size` is kept at this fraction of `max_size`.
    pub min_clean_fraction: f64,

    /// Grow when the epoch hit rate falls below this.
    pub lower_hr_threshold: f64,

    /// Growth factor (> 1).
    pub increment: f64,

    pub apply_max_increment: bool,
    pub max_increment: usize,

    /// Shrink when the epoch hit rate exceeds this.
    pub upper_hr_threshold: f64,

    /// Shrink factor (< 1).
    pub decrement: f64,

    pub apply_max_decrement: bool,
    pub max_decrement: usize,

    /// Grow immediately for a single entry large relative to the budget,
    /// independent of the epoch switches.
    pub flash_incr_enabled: bool,

    /// The budget grows by this multiple of the oversized entry.
    pub flash_multiple: f64,

    /// Entry size, as a fraction of `max_size`, that triggers a flash
    /// increase.
    pub flash_threshold: f64,
}

impl Default for ResizeConfig {
    fn default() -> Self {
        Self {
            incr_enabled: false,
            decr_enabled: false,
            epoch_length: 50_000,
            min_size: 1024 * 1024,        // 1 MiB
            max_size: 32 * 1024 * 1024,   // 32 MiB
            min_clean_fraction: 0.5,
            lower_hr_threshold: 0.9,
            increment: 2.0,
            apply_max_increment: true,
            max_increment: 4 * 1024 * 1024,
            upper_hr_threshold: 0.999,
            decrement: 0.9,
            apply_max_decrement: true,
            max_decrement: 1024 * 1024,
            flash_incr_enabled: false,
            flash_multiple: 1.0,
            flash_threshold: 0.25,
        }
    }
}

impl ResizeConfig {
    /// Whether epochs are measured at all.
    pub fn epochs_enabled(&self) -> bool {
        self.incr_enabled || self.decr_enabled
    }

    /// Whether any part of the controller can change `max_size`.
    pub fn is_active(&self) -> bool {
        self.epochs_enabled() || self.flash_incr_enabled
    }
}

/// Speculative load retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    /// Reads attempted before a checksum failure becomes permanent.
    pub max_read_attempts: u32,

    /// Backoff before the first retry; doubles per attempt.
    pub initial_backoff_us: u64,

    /// Upper bound on a single backoff.
    pub max_backoff_us: u64,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            max_read_attempts: 3,
            initial_backoff_us: 100,
            max_backoff_us: 10_000,
        }
    }
}

/// Cooperative multi-process settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectiveConfig {
    /// This process's rank in `0..num_processes`.
    pub rank: usize,

    pub num_processes: usize,

    /// Defer this process's sync-point writes into one vectorized call.
    pub coalesce_writes: bool,
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for
    /// missing fields.
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            config.validate()?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Reject settings the cache cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let cache = &self.cache;
        if cache.min_clean_size > cache.max_size {
            return Err(invalid(
                "cache.min_clean_size",
                format!("{} exceeds max_size {}", cache.min_clean_size, cache.max_size),
            ));
        }
        if !(1..=24).contains(&cache.hash_bucket_bits) {
            return Err(invalid(
                "cache.hash_bucket_bits",
                format!("{} not in 1..=24", cache.hash_bucket_bits),
            ));
        }

        let resize = &self.resize;
        if resize.is_active() {
            if resize.epoch_length == 0 {
                return Err(invalid("resize.epoch_length", "must be positive".into()));
            }
            if resize.min_size > resize.max_size {
                return Err(invalid(
                    "resize.min_size",
                    format!("{} exceeds resize.max_size {}", resize.min_size, resize.max_size),
                ));
            }
            for (field, value) in [
                ("resize.min_clean_fraction", resize.min_clean_fraction),
                ("resize.lower_hr_threshold", resize.lower_hr_threshold),
                ("resize.upper_hr_threshold", resize.upper_hr_threshold),
                ("resize.decrement", resize.decrement),
                ("resize.flash_threshold", resize.flash_threshold),
            ] {
                if !(0.0..=1.0).contains(&value) {
                    return Err(invalid(field, format!("{value} not in [0, 1]")));
                }
            }
            if resize.lower_hr_threshold > resize.upper_hr_threshold {
                return Err(invalid(
                    "resize.lower_hr_threshold",
                    "exceeds upper_hr_threshold".into(),
                ));
            }
            if resize.increment < 1.0 {
                return Err(invalid("resize.increment", "must be at least 1.0".into()));
            }
            if resize.flash_multiple < 0.1 || resize.flash_multiple > 10.0 {
                return Err(invalid(
                    "resize.flash_multiple",
                    format!("{} not in [0.1, 10]", resize.flash_multiple),
                ));
            }
        }

        if self.load.max_read_attempts == 0 {
            return Err(invalid("load.max_read_attempts", "must be positive".into()));
        }

        if let Some(collective) = &self.collective {
            if collective.num_processes == 0 {
                return Err(invalid("collective.num_processes", "must be positive".into()));
            }
            if collective.rank >= collective.num_processes {
                return Err(invalid(
                    "collective.rank",
                    format!("{} >= num_processes {}", collective.rank, collective.num_processes),
                ));
            }
            if !cache.dirty_set_enabled {
                return Err(invalid(
                    "cache.dirty_set_enabled",
                    "collective mode needs the address-ordered dirty set".into(),
                ));
            }
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: String) -> ConfigError {
    ConfigError::Invalid { field, reason }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        let cfg = Config::default();
        cfg.validate().unwrap();
        assert!(cfg.cache.evictions_enabled);
        assert!(cfg.collective.is_none());
    }

    #[test]
    fn test_rejects_min_clean_above_max() {
        let mut cfg = Config::default();
        cfg.cache.min_clean_size = cfg.cache.max_size + 1;
        let err = cfg.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "cache.min_clean_size",
                ..
            }
        ));
    }

    #[test]
    fn test_rejects_bad_rank_and_missing_dirty_set() {
        let mut cfg = Config::default();
        cfg.collective = Some(CollectiveConfig {
            rank: 2,
            num_processes: 2,
            coalesce_writes: false,
        });
        assert!(cfg.validate().is_err());

        cfg.collective = Some(CollectiveConfig {
            rank: 1,
            num_processes: 2,
            coalesce_writes: false,
        });
        cfg.validate().unwrap();
        cfg.cache.dirty_set_enabled = false;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_thresholds_out_of_range() {
        let mut cfg = Config::default();
        cfg.resize.decr_enabled = true;
        cfg.resize.upper_hr_threshold = 1.5;
        assert!(cfg.validate().is_err());

        // Inactive controller settings are not checked.
        cfg.resize.decr_enabled = false;
        cfg.validate().unwrap();
        cfg.resize.flash_incr_enabled = true;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_load_partial_json_fills_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("cfg.json");
        std::fs::write(&path, r#"{ "cache": { "max_size": 4096, "min_clean_size": 1024 } }"#)
            .unwrap();
        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.cache.max_size, 4096);
        assert_eq!(cfg.cache.hash_bucket_bits, 16);
        assert_eq!(cfg.load.max_read_attempts, 3);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let cfg = Config::load(std::path::Path::new("/nonexistent/mdcache.json")).unwrap();
        assert_eq!(cfg.cache.max_size, CacheConfig::default().max_size);
    }
}
