//! Historical second-bar quote archives
//!
//! `{YYYYMMDD}_quote.zip` holds one CSV per instrument,
//! `{YYYYMMDD}_{instrument}_second_quote.csv`, with 11 columns:
//! ms since midnight, bid OHLC, bid volume, ask OHLC, ask volume.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use tracing::{debug, info};
use zip::result::ZipError;
use zip::ZipArchive;

use crate::aggregator::Bar;
use crate::error::ArchiveError;
use crate::tickfile::TickRecord;
use crate::time::{checked_unix_ms_to_ticks, day_start_ms, ticks_to_unix_ms};

const COLUMNS: usize = 11;
const MS_PER_DAY: i64 = 86_400_000;

pub fn archive_path(folder: &Path, day: NaiveDate) -> PathBuf {
    folder.join(format!("{}_quote.zip", day.format("%Y%m%d")))
}

pub fn entry_name(day: NaiveDate, instrument: &str) -> String {
    format!("{}_{}_second_quote.csv", day.format("%Y%m%d"), instrument)
}

/// Load one instrument's second bars for `day` from the archive at `path`
pub fn read_second_bars(
    path: &Path,
    day: NaiveDate,
    instrument: &str,
) -> Result<Vec<Bar>, ArchiveError> {
    let file = File::open(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => ArchiveError::NotFound(path.to_path_buf()),
        _ => ArchiveError::Io(e),
    })?;
    let mut archive = ZipArchive::new(file)?;

    let name = entry_name(day, instrument);
    let entry = match archive.by_name(&name) {
        Ok(entry) => entry,
        Err(ZipError::FileNotFound) => return Err(ArchiveError::MissingEntry(name)),
        Err(e) => return Err(e.into()),
    };

    let bars = parse_second_quotes(BufReader::new(entry), day)?;
    info!(archive = %path.display(), entry = %name, bars = bars.len(), "Loaded second quotes");
    Ok(bars)
}

/// Parse the CSV body. A leading header line is skipped, as are blank lines.
pub fn parse_second_quotes(reader: impl BufRead, day: NaiveDate) -> Result<Vec<Bar>, ArchiveError> {
    let day_start = day_start_ms(day);
    let mut bars = Vec::new();

    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if idx == 0 && fields[0].parse::<i64>().is_err() {
            debug!(header = line, "Skipping header");
            continue;
        }
        bars.push(parse_line(&fields, day_start, idx + 1)?);
    }
    Ok(bars)
}

fn parse_line(fields: &[&str], day_start: i64, line: usize) -> Result<Bar, ArchiveError> {
    if fields.len() != COLUMNS {
        return Err(ArchiveError::Malformed {
            line,
            reason: format!("expected {} columns, got {}", COLUMNS, fields.len()),
        });
    }
    let price = |i: usize| -> Result<f64, ArchiveError> {
        fields[i].parse().map_err(|_| ArchiveError::Malformed {
            line,
            reason: format!("column {} is not a number: {:?}", i + 1, fields[i]),
        })
    };
    let offset_ms: i64 = fields[0].parse().map_err(|_| ArchiveError::Malformed {
        line,
        reason: format!("bad time offset: {:?}", fields[0]),
    })?;
    if !(0..MS_PER_DAY).contains(&offset_ms) {
        return Err(ArchiveError::Malformed {
            line,
            reason: format!("time offset {} ms is outside the day", offset_ms),
        });
    }
    let time_open = day_start
        .checked_add(offset_ms)
        .and_then(checked_unix_ms_to_ticks)
        .ok_or_else(|| ArchiveError::Malformed {
            line,
            reason: format!("time offset {} ms overflows the day start", offset_ms),
        })?;

    Ok(Bar {
        time_open,
        bid_open: price(1)?,
        bid_high: price(2)?,
        bid_low: price(3)?,
        bid_close: price(4)?,
        bid_volume: price(5)? as i64,
        ask_open: price(6)?,
        ask_high: price(7)?,
        ask_low: price(8)?,
        ask_close: price(9)?,
        ask_volume: price(10)? as i64,
    })
}

/// One tick-file record per bar, stamped at the bar open with the closes
pub fn bars_to_records(bars: &[Bar]) -> Vec<TickRecord> {
    bars.iter()
        .map(|bar| TickRecord::new(ticks_to_unix_ms(bar.time_open), bar.bid_close, bar.ask_close))
        .collect()
}
