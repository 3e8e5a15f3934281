use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RingError {
    #[error("ring buffer capacity must be greater than zero")]
    ZeroCapacity,
    #[error("index {index} out of range (len {len})")]
    OutOfRange { index: usize, len: usize },
    #[error("ring buffer modified during iteration")]
    ConcurrentModification,
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    #[error("producer time {producer_time} is ahead of local time {local_time} on first advance")]
    ClockOrderViolation { producer_time: i64, local_time: i64 },
    #[error("channel broken: {0}")]
    ChannelBroken(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("writer did not drain within its join timeout, {pending} ticks dropped")]
    ShutdownTimeout { pending: usize },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("tick file not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("corrupt tick file {}: {reason}", .path.display())]
    CorruptFile { path: PathBuf, reason: String },
    #[error("price {0} cannot be stored as a scaled unsigned value")]
    InvalidPrice(f64),
    #[error("timestamp {0} ms is outside the platform tick range")]
    InvalidTimestamp(i64),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("quote archive not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("archive entry missing: {0}")]
    MissingEntry(String),
    #[error("malformed quote line {line}: {reason}")]
    Malformed { line: usize, reason: String },
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}
