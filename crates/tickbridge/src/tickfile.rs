//! Daily tick files
//!
//! `{folder}/{YYYYMMDD}.zticks` is a gzip stream of 24-byte records:
//! unix time in ms (i64 LE), bid × 1e5 (u64 LE), ask × 1e5 (u64 LE).
//! A zero price field repeats the previous record's value for that side;
//! the first record borrows the other side instead. A genuine zero quote
//! cannot be stored.

use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use chrono::NaiveDate;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::error::CodecError;
use crate::metrics::inc_tickfile_records;
use crate::time::{checked_unix_ms_to_ticks, ticks_to_unix_ms, unix_ms_to_ticks};
use crate::wire::Tick;

pub const RECORD_LEN: usize = 24;
pub const PRICE_SCALE: f64 = 1e5;
pub const EXTENSION: &str = "zticks";

const WRITE_ATTEMPTS: u32 = 5;
const WRITE_RETRY_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TickRecord {
    pub timestamp_ms: i64,
    pub bid: f64,
    pub ask: f64,
}

impl TickRecord {
    pub fn new(timestamp_ms: i64, bid: f64, ask: f64) -> Self {
        Self {
            timestamp_ms,
            bid,
            ask,
        }
    }
}

impl From<TickRecord> for Tick {
    fn from(record: TickRecord) -> Self {
        Tick::quote(unix_ms_to_ticks(record.timestamp_ms), record.bid, record.ask)
    }
}

impl From<&Tick> for TickRecord {
    fn from(tick: &Tick) -> Self {
        Self::new(ticks_to_unix_ms(tick.time), tick.bid, tick.ask)
    }
}

pub fn day_path(folder: &Path, day: NaiveDate) -> PathBuf {
    folder.join(format!("{}.{}", day.format("%Y%m%d"), EXTENSION))
}

fn scale(price: f64) -> Result<u64, CodecError> {
    let scaled = (price * PRICE_SCALE).round();
    if !scaled.is_finite() || scaled < 0.0 || scaled >= u64::MAX as f64 {
        return Err(CodecError::InvalidPrice(price));
    }
    Ok(scaled as u64)
}

/// Serialize records in order into the uncompressed body
pub fn encode_records(records: &[TickRecord]) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::with_capacity(records.len() * RECORD_LEN);
    for record in records {
        if checked_unix_ms_to_ticks(record.timestamp_ms).is_none() {
            return Err(CodecError::InvalidTimestamp(record.timestamp_ms));
        }
        buf.extend_from_slice(&record.timestamp_ms.to_le_bytes());
        buf.extend_from_slice(&scale(record.bid)?.to_le_bytes());
        buf.extend_from_slice(&scale(record.ask)?.to_le_bytes());
    }
    Ok(buf)
}

/// Decode an uncompressed body, applying the zero fill-forward rule.
/// `body.len()` must be a multiple of `RECORD_LEN`; any tail is ignored.
pub fn decode_records(body: &[u8]) -> Vec<TickRecord> {
    let mut records = Vec::with_capacity(body.len() / RECORD_LEN);
    let mut prev: Option<(u64, u64)> = None;

    for chunk in body.chunks_exact(RECORD_LEN) {
        let field = |at: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&chunk[at..at + 8]);
            raw
        };
        let timestamp_ms = i64::from_le_bytes(field(0));
        let mut bid = u64::from_le_bytes(field(8));
        let mut ask = u64::from_le_bytes(field(16));

        match prev {
            Some((prev_bid, prev_ask)) => {
                if bid == 0 {
                    bid = prev_bid;
                }
                if ask == 0 {
                    ask = prev_ask;
                }
            }
            None => {
                if bid == 0 {
                    bid = ask;
                }
                if ask == 0 {
                    ask = bid;
                }
            }
        }
        prev = Some((bid, ask));

        records.push(TickRecord {
            timestamp_ms,
            bid: bid as f64 / PRICE_SCALE,
            ask: ask as f64 / PRICE_SCALE,
        });
    }
    records
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::PermissionDenied | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Write one day's records atomically (temp file in the same folder, then
/// rename). Returns the final path.
pub fn write_day(
    folder: &Path,
    day: NaiveDate,
    records: &[TickRecord],
) -> Result<PathBuf, CodecError> {
    let body = encode_records(records)?;
    let path = day_path(folder, day);
    fs::create_dir_all(folder)?;

    let mut attempt = 0;
    loop {
        attempt += 1;
        match write_atomic(folder, &path, &body) {
            Ok(()) => break,
            Err(e) if is_transient(&e) && attempt < WRITE_ATTEMPTS => {
                let delay = WRITE_RETRY_DELAY * 2u32.pow(attempt - 1);
                warn!(path = %path.display(), attempt, error = %e, ?delay, "Tick file busy, retrying");
                thread::sleep(delay);
            }
            Err(e) => return Err(e.into()),
        }
    }

    inc_tickfile_records("write", records.len());
    info!(path = %path.display(), records = records.len(), "Wrote tick file");
    Ok(path)
}

fn write_atomic(folder: &Path, path: &Path, body: &[u8]) -> io::Result<()> {
    let tmp = NamedTempFile::new_in(folder)?;
    let mut encoder = GzEncoder::new(BufWriter::new(tmp), Compression::default());
    encoder.write_all(body)?;
    let tmp = encoder
        .finish()?
        .into_inner()
        .map_err(|e| e.into_error())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

pub fn read_day(path: &Path) -> Result<Vec<TickRecord>, CodecError> {
    let file = File::open(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => CodecError::NotFound(path.to_path_buf()),
        _ => CodecError::Io(e),
    })?;

    let corrupt = |reason: String| CodecError::CorruptFile {
        path: path.to_path_buf(),
        reason,
    };

    let mut body = Vec::new();
    if let Err(e) = GzDecoder::new(file).read_to_end(&mut body) {
        return Err(match e.kind() {
            io::ErrorKind::InvalidInput
            | io::ErrorKind::InvalidData
            | io::ErrorKind::UnexpectedEof => corrupt(format!("invalid gzip stream: {}", e)),
            _ => CodecError::Io(e),
        });
    }
    if body.len() % RECORD_LEN != 0 {
        return Err(corrupt(format!(
            "{} bytes is not a whole number of {}-byte records",
            body.len(),
            RECORD_LEN
        )));
    }

    let records = decode_records(&body);
    if let Some((index, record)) = records
        .iter()
        .enumerate()
        .find(|(_, r)| checked_unix_ms_to_ticks(r.timestamp_ms).is_none())
    {
        return Err(corrupt(format!(
            "record {} has out of range timestamp {} ms",
            index, record.timestamp_ms
        )));
    }
    inc_tickfile_records("read", records.len());
    debug!(path = %path.display(), records = records.len(), "Read tick file");
    Ok(records)
}

/// Records for every day in `from..=to`, in day order. Missing days are skipped.
pub fn read_range(
    folder: &Path,
    from: NaiveDate,
    to: NaiveDate,
) -> Result<Vec<TickRecord>, CodecError> {
    let mut records = Vec::new();
    for day in from.iter_days().take_while(|day| *day <= to) {
        match read_day(&day_path(folder, day)) {
            Ok(mut day_records) => records.append(&mut day_records),
            Err(CodecError::NotFound(path)) => {
                debug!(path = %path.display(), "No tick file for day");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(records)
}

/// Days that have a tick file in `folder`, ascending
pub fn list_days(folder: &Path) -> Result<Vec<NaiveDate>, CodecError> {
    let mut days = Vec::new();
    for entry in fs::read_dir(folder)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if let Ok(day) = NaiveDate::parse_from_str(stem, "%Y%m%d") {
            days.push(day);
        }
    }
    days.sort();
    Ok(days)
}
