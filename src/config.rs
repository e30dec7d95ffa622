use crate::error::{ReforgeError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Bounds for the analyzer's manual tuning endpoints.
pub const RATE_LIMIT_RANGE: (u32, u32) = (200, 1500);
pub const BATCH_SIZE_RANGE: (usize, usize) = (5, 25);

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub analyzer: AnalyzerConfig,
    #[serde(default)]
    pub crf_search: CrfSearchConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("reforge.db")
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PathsConfig {
    /// Working directory for ab-av1 temp output. Encode outputs are named
    /// `<video id>.mkv` inside it; crf-search runs get their own subdirs.
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
}

fn default_temp_dir() -> PathBuf {
    if cfg!(debug_assertions) {
        PathBuf::from("tmp/ab-av1")
    } else {
        std::env::temp_dir().join("ab-av1")
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            temp_dir: default_temp_dir(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AnalyzerConfig {
    /// Messages admitted per interval.
    #[serde(default = "default_analyzer_rate_limit")]
    pub rate_limit: u32,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Paths handed to a single mediainfo invocation.
    #[serde(default = "default_batch_size")]
    pub mediainfo_batch_size: usize,
}

fn default_analyzer_rate_limit() -> u32 {
    500
}

fn default_interval_ms() -> u64 {
    1_000
}

fn default_batch_size() -> usize {
    8
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            rate_limit: default_analyzer_rate_limit(),
            interval_ms: default_interval_ms(),
            mediainfo_batch_size: default_batch_size(),
        }
    }
}

impl AnalyzerConfig {
    /// Clamp operator-supplied tuning values into their supported ranges.
    pub fn apply_override(&mut self, rate_limit: u32, batch_size: usize) {
        self.rate_limit = rate_limit.clamp(RATE_LIMIT_RANGE.0, RATE_LIMIT_RANGE.1);
        self.mediainfo_batch_size = batch_size.clamp(BATCH_SIZE_RANGE.0, BATCH_SIZE_RANGE.1);
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CrfSearchConfig {
    #[serde(default = "default_search_rate_limit")]
    pub rate_limit: u32,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Extra argv appended when a search is retried after producing no samples.
    #[serde(default)]
    pub preset_fallback: Vec<String>,
}

fn default_search_rate_limit() -> u32 {
    1
}

impl Default for CrfSearchConfig {
    fn default() -> Self {
        Self {
            rate_limit: default_search_rate_limit(),
            interval_ms: default_interval_ms(),
            preset_fallback: Vec::new(),
        }
    }
}

impl CrfSearchConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EncoderConfig {
    #[serde(default = "default_search_rate_limit")]
    pub rate_limit: u32,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Wall-clock limit for one encode before the child is killed.
    #[serde(default = "default_encode_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_encode_timeout_secs() -> u64 {
    // 30 days; only very large 4K remuxes come anywhere near this.
    30 * 24 * 60 * 60
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            rate_limit: default_search_rate_limit(),
            interval_ms: default_interval_ms(),
            timeout_secs: default_encode_timeout_secs(),
        }
    }
}

impl EncoderConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file, falling back to defaults when
    /// the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("No configuration file at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| ReforgeError::Config(format!("{}: {}", path.display(), e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.analyzer.rate_limit, 500);
        assert_eq!(config.analyzer.mediainfo_batch_size, 8);
        assert_eq!(config.encoder.timeout_secs, 2_592_000);
    }

    #[test]
    fn override_clamps_to_supported_ranges() {
        let mut analyzer = AnalyzerConfig::default();
        analyzer.apply_override(10_000, 100);
        assert_eq!(analyzer.rate_limit, 1500);
        assert_eq!(analyzer.mediainfo_batch_size, 25);

        analyzer.apply_override(1, 1);
        assert_eq!(analyzer.rate_limit, 200);
        assert_eq!(analyzer.mediainfo_batch_size, 5);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [analyzer]
            mediainfo_batch_size = 12
            "#,
        )
        .unwrap();
        assert_eq!(config.analyzer.mediainfo_batch_size, 12);
        assert_eq!(config.analyzer.rate_limit, 500);
        assert_eq!(config.crf_search.rate_limit, 1);
    }
}
