use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

use crate::access::AccessPolicy;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "dbgcache".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Tuning for the generic artifact cache.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct ArtifactsConfig {
    /// Slots of the table mapping producer types to their caches.
    pub registration_slots: usize,
    /// When unreferenced artifacts may be evicted.
    pub access: AccessPolicy,
}

impl Default for ArtifactsConfig {
    fn default() -> Self {
        Self {
            registration_slots: 64,
            access: AccessPolicy::default(),
        }
    }
}

/// Tuning for the content-addressed hash store.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct ContentConfig {
    /// Slots of the blob table, keyed by content hash.
    pub blob_slots: usize,
    /// Slots of the key table, keyed by `(root, id)`.
    pub key_slots: usize,
    /// Slots of the root table.
    pub root_slots: usize,
    /// When blobs without key or downstream references may be evicted.
    ///
    /// Defaults to `5s` and `10` ticks.
    pub blob_access: AccessPolicy,
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            blob_slots: 16384,
            key_slots: 4096,
            root_slots: 4096,
            blob_access: AccessPolicy::new(Duration::from_secs(5), 10),
        }
    }
}

/// Tuning for the file read cache.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct FilesConfig {
    /// Slots of the table tracking file timestamps.
    pub path_slots: usize,
    /// Reads larger than this many bytes are split up and run in parallel.
    ///
    /// Defaults to `4 MiB`.
    pub parallel_read_threshold: u64,
    /// The size of each piece of a parallel read.
    ///
    /// Defaults to `1 MiB`.
    pub read_chunk_size: u64,
}

impl Default for FilesConfig {
    fn default() -> Self {
        let meg = 1024 * 1024;
        Self {
            path_slots: 4096,
            parallel_read_threshold: 4 * meg,
            read_chunk_size: meg,
        }
    }
}

/// Tuning for the debug info cache and its conversion processes.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct DebugInfoConfig {
    /// Slots of the debug info table.
    pub slots: usize,
    /// Slots of the path/timestamp to key tables.
    pub key_slots: usize,
    /// The executable converting native debug info into RDI files.
    pub converter: PathBuf,
    /// Ask the converter to compress its output.
    pub compress: bool,
    /// Conversions running longer than this are killed and count as failed.
    ///
    /// Defaults to `10m`. Set to `null` to wait forever.
    #[serde(with = "humantime_serde")]
    pub conversion_timeout: Option<Duration>,
    /// Upper bound on the threads used by all running conversions together.
    ///
    /// Defaults to eight per logical CPU.
    pub max_conversion_threads: Option<usize>,
    /// When closed debug info may be freed.
    ///
    /// Defaults to freeing immediately once nothing references it.
    pub access: AccessPolicy,
}

impl Default for DebugInfoConfig {
    fn default() -> Self {
        Self {
            slots: 4096,
            key_slots: 4096,
            converter: PathBuf::from("rdiconv"),
            compress: false,
            conversion_timeout: Some(Duration::from_secs(600)),
            max_conversion_threads: None,
            access: AccessPolicy::IMMEDIATE,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// The number of worker threads ticks fan out to.
    ///
    /// Defaults to the number of logical CPUs.
    pub lanes: Option<usize>,

    /// How often the background tick driver runs.
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,

    pub artifacts: ArtifactsConfig,

    pub content: ContentConfig,

    pub files: FilesConfig,

    pub debug_info: DebugInfoConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            logging: Logging::default(),
            metrics: Metrics::default(),
            lanes: None,
            tick_interval: Duration::from_millis(16),
            artifacts: ArtifactsConfig::default(),
            content: ContentConfig::default(),
            files: FilesConfig::default(),
            debug_info: DebugInfoConfig::default(),
        }
    }
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }

    /// The number of lanes to run ticks on.
    pub fn lane_count(&self) -> usize {
        self.lanes.unwrap_or_else(available_cpus).max(1)
    }
}

/// The number of logical CPUs, or one if that cannot be determined.
pub fn available_cpus() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get())
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
