use config::{Config as ConfigBuilder, ConfigError, File};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::{EngineError, EngineResult};

const KB: u64 = 1024;
const MB: u64 = 1024 * KB;
const GB: u64 = 1024 * MB;

/// Hard cap on the derived default worker count
const MAX_DEFAULT_PARALLEL_OPS: usize = 16;

/// Configuration for an engine instance.
///
/// # Configuration Locations
///
/// The configuration can be loaded from multiple locations in order of precedence:
/// 1. Custom config file specified via `--config` flag
/// 2. Local `.ultrafs.yaml` in the current directory
/// 3. Global `$HOME/.config/ultrafs/config.yaml`
///
/// # Configuration Format
///
/// ```yaml
/// # Directories the engine may touch (required)
/// allowed_dirs:
///   - "/home/me/projects"
///
/// # Memory budget for cached file contents
/// cache_size: "100MB"
///
/// # Worker pool size and how many tasks may wait for a worker
/// parallel_ops: 8
/// queue_bound: 256
///
/// # Results at or above this size are streamed instead of inlined
/// binary_threshold: "1MB"
///
/// # Files at or above this size are memory mapped
/// mmap_threshold: "1MB"
/// mmap_enabled: true
///
/// # How fast cache popularity fades
/// cache_half_life: "5m"
///
/// log_level: "info"
/// ```
///
/// Sizes accept plain byte counts or `KB`/`MB`/`GB` suffixes. Command-line
/// values take precedence over file values, see [`EngineConfig::merge_with_cli`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directories the engine is allowed to serve
    #[serde(default)]
    pub allowed_dirs: Vec<PathBuf>,

    /// Byte budget for the content cache
    #[serde(default = "default_cache_size", deserialize_with = "deserialize_size")]
    pub cache_size: u64,

    /// Number of worker threads executing operations
    #[serde(default = "default_parallel_ops")]
    pub parallel_ops: usize,

    /// Tasks allowed to wait for a worker before submissions are rejected
    #[serde(default = "default_queue_bound")]
    pub queue_bound: usize,

    /// Result size at which payloads are handed out as raw byte streams
    #[serde(
        default = "default_binary_threshold",
        deserialize_with = "deserialize_size"
    )]
    pub binary_threshold: u64,

    /// File size at which reads switch from buffered I/O to memory mapping
    #[serde(
        default = "default_mmap_threshold",
        deserialize_with = "deserialize_size"
    )]
    pub mmap_threshold: u64,

    /// Files this large are searched as several line-aligned chunks
    #[serde(
        default = "default_search_chunk_size",
        deserialize_with = "deserialize_size"
    )]
    pub search_chunk_size: u64,

    /// Half-life of the cache hot score, in humantime syntax ("90s", "5m")
    #[serde(default = "default_half_life")]
    pub cache_half_life: String,

    /// Whether memory mapping may be used at all
    #[serde(default = "default_true")]
    pub mmap_enabled: bool,

    /// Where safe-write backups go; next to the file when unset
    #[serde(default)]
    pub backup_dir: Option<PathBuf>,

    /// Log level (debug, info, warn, error)
    #[serde(default)]
    pub log_level: LogLevel,
}

/// Verbosity accepted by `log_level`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    pub fn parse(s: &str) -> EngineResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(EngineError::config_error(format!(
                "unknown log level '{}'",
                other
            ))),
        }
    }
}

/// Values supplied on the command line; `None` keeps the file value
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub allowed_dirs: Vec<PathBuf>,
    pub cache_size: Option<u64>,
    pub parallel_ops: Option<usize>,
    pub queue_bound: Option<usize>,
    pub binary_threshold: Option<u64>,
    pub mmap_threshold: Option<u64>,
    pub mmap_enabled: Option<bool>,
    pub backup_dir: Option<PathBuf>,
    pub log_level: Option<LogLevel>,
}

fn default_cache_size() -> u64 {
    100 * MB
}

/// Twice the CPU count, since the work is I/O bound
fn default_parallel_ops() -> usize {
    (num_cpus::get() * 2).clamp(1, MAX_DEFAULT_PARALLEL_OPS)
}

fn default_queue_bound() -> usize {
    256
}

fn default_binary_threshold() -> u64 {
    MB
}

fn default_mmap_threshold() -> u64 {
    MB
}

fn default_search_chunk_size() -> u64 {
    8 * MB
}

fn default_half_life() -> String {
    "5m".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            allowed_dirs: Vec::new(),
            cache_size: default_cache_size(),
            parallel_ops: default_parallel_ops(),
            queue_bound: default_queue_bound(),
            binary_threshold: default_binary_threshold(),
            mmap_threshold: default_mmap_threshold(),
            search_chunk_size: default_search_chunk_size(),
            cache_half_life: default_half_life(),
            mmap_enabled: true,
            backup_dir: None,
            log_level: LogLevel::default(),
        }
    }
}

impl EngineConfig {
    /// Default configuration serving the given directories
    pub fn with_allowed_dirs<I, P>(dirs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            allowed_dirs: dirs.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Loads configuration from the default locations
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(None)
    }

    /// Loads configuration, layering an explicit file over the default locations
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        let config_files = [
            dirs::config_dir().map(|p| p.join("ultrafs/config.yaml")),
            Some(PathBuf::from(".ultrafs.yaml")),
        ];

        for path in config_files.iter().flatten() {
            if path.exists() {
                builder = builder.add_source(File::from(path.as_path()));
            }
        }

        // An explicit file must exist
        if let Some(path) = config_path {
            builder = builder.add_source(File::from(path).required(true));
        }

        builder.build()?.try_deserialize()
    }

    /// Merges command-line values over configuration file values
    pub fn merge_with_cli(mut self, cli: ConfigOverrides) -> Self {
        if !cli.allowed_dirs.is_empty() {
            self.allowed_dirs = cli.allowed_dirs;
        }
        if let Some(size) = cli.cache_size {
            self.cache_size = size;
        }
        if let Some(ops) = cli.parallel_ops {
            self.parallel_ops = ops;
        }
        if let Some(bound) = cli.queue_bound {
            self.queue_bound = bound;
        }
        if let Some(threshold) = cli.binary_threshold {
            self.binary_threshold = threshold;
        }
        if let Some(threshold) = cli.mmap_threshold {
            self.mmap_threshold = threshold;
        }
        if let Some(enabled) = cli.mmap_enabled {
            self.mmap_enabled = enabled;
        }
        if cli.backup_dir.is_some() {
            self.backup_dir = cli.backup_dir;
        }
        if let Some(level) = cli.log_level {
            self.log_level = level;
        }
        self
    }

    /// Checks the values an engine cannot start without
    pub fn validate(&self) -> EngineResult<()> {
        if self.allowed_dirs.is_empty() {
            return Err(EngineError::config_error(
                "at least one allowed directory is required",
            ));
        }
        if self.parallel_ops == 0 {
            return Err(EngineError::config_error("parallel_ops must be at least 1"));
        }
        if self.cache_size == 0 {
            return Err(EngineError::config_error("cache_size must be non-zero"));
        }
        if self.search_chunk_size == 0 {
            return Err(EngineError::config_error(
                "search_chunk_size must be non-zero",
            ));
        }
        self.half_life()?;
        Ok(())
    }

    /// Parsed `cache_half_life`
    pub fn half_life(&self) -> EngineResult<Duration> {
        let half_life = humantime::parse_duration(&self.cache_half_life).map_err(|e| {
            EngineError::config_error(format!(
                "invalid cache_half_life '{}': {}",
                self.cache_half_life, e
            ))
        })?;
        if half_life.is_zero() {
            return Err(EngineError::config_error("cache_half_life must be non-zero"));
        }
        Ok(half_life)
    }

    /// Renders the configuration in the same YAML shape `load_from` reads
    pub fn to_yaml(&self) -> EngineResult<String> {
        serde_yaml::to_string(self).map_err(|e| EngineError::config_error(e.to_string()))
    }
}

/// Parses size strings like "512", "64KB", "50MB" or "1GB"
pub fn parse_size(size: &str) -> EngineResult<u64> {
    let upper = size.trim().to_ascii_uppercase();

    let (digits, multiplier) = if let Some(n) = upper.strip_suffix("KB") {
        (n, KB)
    } else if let Some(n) = upper.strip_suffix("MB") {
        (n, MB)
    } else if let Some(n) = upper.strip_suffix("GB") {
        (n, GB)
    } else if let Some(n) = upper.strip_suffix('B') {
        (n, 1)
    } else {
        (upper.as_str(), 1)
    };

    let value: u64 = digits
        .trim()
        .parse()
        .map_err(|_| EngineError::config_error(format!("invalid size format: {}", size)))?;

    value
        .checked_mul(multiplier)
        .ok_or_else(|| EngineError::config_error(format!("size out of range: {}", size)))
}

/// Formats bytes in human readable binary units
pub fn format_size(bytes: u64) -> String {
    const UNITS: [char; 6] = ['K', 'M', 'G', 'T', 'P', 'E'];
    if bytes < KB {
        return format!("{} B", bytes);
    }
    let mut div = KB;
    let mut exp = 0;
    let mut n = bytes / KB;
    while n >= KB {
        div *= KB;
        exp += 1;
        n /= KB;
    }
    format!("{:.1} {}B", bytes as f64 / div as f64, UNITS[exp])
}

fn deserialize_size<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum SizeValue {
        Bytes(u64),
        Text(String),
    }

    match SizeValue::deserialize(deserializer)? {
        SizeValue::Bytes(n) => Ok(n),
        SizeValue::Text(s) => parse_size(&s).map_err(serde::de::Error::custom),
    }
}
