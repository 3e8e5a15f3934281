use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::wire::Framing;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub channel: ChannelConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub bars: BarsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChannelConfig {
    /// Channel name shared by both processes (e.g., "eurusd")
    pub name: String,
    /// Directory holding the channel socket (defaults to the OS temp dir)
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default)]
    pub framing: Framing,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: String,
    #[serde(default = "default_enqueue_timeout")]
    pub enqueue_timeout: String,
    #[serde(default = "default_join_timeout")]
    pub join_timeout: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StorageConfig {
    /// Folder holding {YYYYMMDD}.zticks files
    #[serde(default)]
    pub folder: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BarsConfig {
    #[serde(default = "default_bar_period")]
    pub period: String,
    /// Sealed bars retained by the aggregator
    #[serde(default = "default_bar_history")]
    pub history: usize,
}

impl Default for BarsConfig {
    fn default() -> Self {
        Self {
            period: default_bar_period(),
            history: default_bar_history(),
        }
    }
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_connect_timeout() -> String {
    "10s".to_string()
}

fn default_enqueue_timeout() -> String {
    "1s".to_string()
}

fn default_join_timeout() -> String {
    "5s".to_string()
}

fn default_bar_period() -> String {
    "1m".to_string()
}

fn default_bar_history() -> usize {
    512
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channel.name.trim().is_empty() {
            return Err(ConfigError::Invalid("channel.name is empty".to_string()));
        }
        if self.channel.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "channel.queue_capacity must be greater than zero".to_string(),
            ));
        }
        if self.bars.history == 0 {
            return Err(ConfigError::Invalid(
                "bars.history must be greater than zero".to_string(),
            ));
        }
        self.channel.connect_timeout()?;
        self.channel.enqueue_timeout()?;
        self.channel.join_timeout()?;
        self.bars.period()?;
        Ok(())
    }
}

impl ChannelConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dir: None,
            framing: Framing::default(),
            queue_capacity: default_queue_capacity(),
            connect_timeout: default_connect_timeout(),
            enqueue_timeout: default_enqueue_timeout(),
            join_timeout: default_join_timeout(),
        }
    }

    /// Socket path both processes derive from the channel name
    pub fn socket_path(&self) -> PathBuf {
        let dir = self.dir.clone().unwrap_or_else(std::env::temp_dir);
        dir.join(format!("{}.sock", self.name))
    }

    pub fn connect_timeout(&self) -> Result<Duration, ConfigError> {
        parse_interval(&self.connect_timeout)
    }

    pub fn enqueue_timeout(&self) -> Result<Duration, ConfigError> {
        parse_interval(&self.enqueue_timeout)
    }

    pub fn join_timeout(&self) -> Result<Duration, ConfigError> {
        parse_interval(&self.join_timeout)
    }
}

impl BarsConfig {
    pub fn period(&self) -> Result<Duration, ConfigError> {
        parse_interval(&self.period)
    }
}

/// Parse interval string like "250ms", "15s", "1h", "1d" to Duration
pub fn parse_interval(s: &str) -> Result<Duration, ConfigError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(ConfigError::Invalid("Empty interval".to_string()));
    }

    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| ConfigError::Invalid(format!("Missing unit: {}", s)))?;
    let (num_str, unit) = s.split_at(split);
    let num: u64 = num_str
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("Invalid interval: {}", s)))?;

    if num == 0 {
        return Err(ConfigError::Invalid(
            "Interval must be greater than zero".to_string(),
        ));
    }

    match unit {
        "ms" => Ok(Duration::from_millis(num)),
        "s" => Ok(Duration::from_secs(num)),
        "m" => Ok(Duration::from_secs(num * 60)),
        "h" => Ok(Duration::from_secs(num * 60 * 60)),
        "d" => Ok(Duration::from_secs(num * 60 * 60 * 24)),
        _ => Err(ConfigError::Invalid(format!("Unknown unit: {}", unit))),
    }
}
