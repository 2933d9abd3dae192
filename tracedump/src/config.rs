use std::fs;
use std::path::PathBuf;

use lazy_static::lazy_static;
use serde::Deserialize;

const DEFAULT_CONFIG_PATH: &str = "/etc/tracedump/product.json";
const ENV_CONFIG_PATH: &str = "TRACEDUMP_PRODUCT_CONFIG";

/// Per-product overrides for buffer sizes, pool budgets and ageing policy.
/// A missing or unparsable file falls back to the defaults below.
#[derive(Debug, Deserialize, Clone)]
pub struct ProductConfig {
    /// Per-CPU ring buffer size programmed at open, in KB.
    #[serde(default = "default_buffer_kb")]
    pub buffer_kb: u32,
    /// Buffer size on kernels with a single aggregated raw pipe, in KB.
    #[serde(default = "default_aggregated_buffer_kb")]
    pub aggregated_buffer_kb: u32,
    /// Maximum number of files kept in the snapshot pool.
    #[serde(default = "default_snapshot_file_limit")]
    pub snapshot_file_limit: usize,
    /// Per-file size cap for recording files, in KB.
    #[serde(default = "default_record_file_kb")]
    pub record_file_kb: u64,
    /// Maximum number of files kept in the recording pool.
    #[serde(default = "default_record_file_limit")]
    pub record_file_limit: usize,
    /// Per-file size cap for cache slices, in KB.
    #[serde(default = "default_cache_file_kb")]
    pub cache_file_kb: u64,
    /// Total size budget of the cache pool, in KB.
    #[serde(default = "default_cache_total_kb")]
    pub cache_total_kb: u64,
    /// Nominal duration of one cache slice, in seconds.
    #[serde(default = "default_cache_slice_secs")]
    pub cache_slice_secs: u64,
    /// Cache files whose end time is older than this are aged out, in seconds.
    #[serde(default = "default_cache_retention_secs")]
    pub cache_retention_secs: u64,
    /// Root builds keep every recording file and allow uncut output.
    #[serde(default)]
    pub root_version: bool,
    /// Master switch for pool ageing.
    #[serde(default = "default_ageing_enabled")]
    pub ageing_enabled: bool,
    /// Minimum free space on the output volume before a snapshot, in KB.
    #[serde(default = "default_free_space_floor_kb")]
    pub free_space_floor_kb: u64,
    /// Trace file pool directory.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

fn default_buffer_kb() -> u32 {
    12 * 1024
}
fn default_aggregated_buffer_kb() -> u32 {
    144 * 1024
}
fn default_snapshot_file_limit() -> usize {
    20
}
fn default_record_file_kb() -> u64 {
    100 * 1024
}
fn default_record_file_limit() -> usize {
    15
}
fn default_cache_file_kb() -> u64 {
    if cfg!(test) {
        15 * 1024
    } else {
        150 * 1024
    }
}
fn default_cache_total_kb() -> u64 {
    800 * 1024
}
fn default_cache_slice_secs() -> u64 {
    60
}
fn default_cache_retention_secs() -> u64 {
    30 * 60
}
fn default_ageing_enabled() -> bool {
    true
}
fn default_free_space_floor_kb() -> u64 {
    300 * 1024
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("/data/log/tracedump/")
}

impl Default for ProductConfig {
    fn default() -> Self {
        ProductConfig {
            buffer_kb: default_buffer_kb(),
            aggregated_buffer_kb: default_aggregated_buffer_kb(),
            snapshot_file_limit: default_snapshot_file_limit(),
            record_file_kb: default_record_file_kb(),
            record_file_limit: default_record_file_limit(),
            cache_file_kb: default_cache_file_kb(),
            cache_total_kb: default_cache_total_kb(),
            cache_slice_secs: default_cache_slice_secs(),
            cache_retention_secs: default_cache_retention_secs(),
            root_version: false,
            ageing_enabled: default_ageing_enabled(),
            free_space_floor_kb: default_free_space_floor_kb(),
            output_dir: default_output_dir(),
        }
    }
}

impl ProductConfig {
    /// Load the product config. The path can be overridden with the
    /// `TRACEDUMP_PRODUCT_CONFIG` environment variable.
    pub fn load() -> ProductConfig {
        let path = std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        match fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                log::warn!("product config {} is malformed: {}", path, e);
                ProductConfig::default()
            }),
            Err(_) => ProductConfig::default(),
        }
    }
}

lazy_static! {
    static ref PRODUCT_CONFIG: ProductConfig = ProductConfig::load();
}

/// Process-wide memoized product config.
pub fn product() -> &'static ProductConfig {
    &PRODUCT_CONFIG
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_applied_per_field() {
        let json = r#"{ "buffer_kb": 2048, "root_version": true }"#;
        let cfg: ProductConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.buffer_kb, 2048);
        assert!(cfg.root_version);
        assert_eq!(cfg.snapshot_file_limit, 20);
        assert_eq!(cfg.cache_slice_secs, 60);
        assert_eq!(cfg.record_file_kb, 100 * 1024);
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json at all").unwrap();
        std::env::set_var(ENV_CONFIG_PATH, file.path());
        let cfg = ProductConfig::load();
        std::env::remove_var(ENV_CONFIG_PATH);
        assert_eq!(cfg.buffer_kb, default_buffer_kb());
        assert!(!cfg.root_version);
    }
}
