//! tickbridge binary entry point

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tickbridge::metrics::{encode_metrics, ChannelMetrics};
use tickbridge::quote_archive::{bars_to_records, read_second_bars};
use tickbridge::tickfile::{self, TickRecord};
use tickbridge::time::{duration_to_ticks, now_ticks, ticks_to_datetime, unix_ms_to_ticks};
use tickbridge::{AdvanceOutcome, Bar, BarAggregator, Config, Tick, TickReader, TickWriter};

type BoxError = Box<dyn std::error::Error>;

#[derive(Parser, Debug)]
#[command(name = "tickbridge")]
#[command(about = "Cross-process tick streaming and bar aggregation")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stream stored tick files into the configured channel
    Publish {
        #[arg(short, long, env = "TICKBRIDGE_CONFIG")]
        config: PathBuf,
        /// First day to publish (default: earliest file)
        #[arg(long)]
        from: Option<NaiveDate>,
        /// Last day to publish (default: latest file)
        #[arg(long)]
        to: Option<NaiveDate>,
        /// Replay at this multiple of recorded pace instead of as fast as possible
        #[arg(long, value_parser = parse_speed)]
        speed: Option<f64>,
        /// Print prometheus metrics to stderr on exit
        #[arg(long)]
        dump_metrics: bool,
    },
    /// Read ticks from the configured channel and print sealed bars as JSON lines
    Consume {
        #[arg(short, long, env = "TICKBRIDGE_CONFIG")]
        config: PathBuf,
        /// Merge ticks this far behind the wall clock
        #[arg(long, default_value_t = 0)]
        lag_ms: u64,
        /// Merge loop period
        #[arg(long, default_value_t = 100)]
        poll_ms: u64,
        #[arg(long)]
        dump_metrics: bool,
    },
    /// Aggregate stored tick files into bars, printed as JSON lines
    Replay {
        #[arg(short, long, env = "TICKBRIDGE_CONFIG")]
        config: PathBuf,
        #[arg(long)]
        from: Option<NaiveDate>,
        #[arg(long)]
        to: Option<NaiveDate>,
    },
    /// Summarize a single .zticks file
    Inspect { path: PathBuf },
    /// Convert one instrument/day of a second-bar quote archive into a tick file
    ImportQuotes {
        /// Path to {YYYYMMDD}_quote.zip
        #[arg(long)]
        archive: PathBuf,
        #[arg(long)]
        day: NaiveDate,
        #[arg(long)]
        instrument: String,
        /// Folder receiving {YYYYMMDD}.zticks
        #[arg(long)]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Command::Publish {
            config,
            from,
            to,
            speed,
            dump_metrics,
        } => {
            let config = load_config(&config)?;
            let shutdown = shutdown_on_signal()?;
            publish(&config, from, to, speed, shutdown).await?;
            if dump_metrics {
                eprint!("{}", encode_metrics()?);
            }
        }
        Command::Consume {
            config,
            lag_ms,
            poll_ms,
            dump_metrics,
        } => {
            let config = load_config(&config)?;
            let shutdown = shutdown_on_signal()?;
            consume(&config, lag_ms, poll_ms, shutdown).await?;
            if dump_metrics {
                eprint!("{}", encode_metrics()?);
            }
        }
        Command::Replay { config, from, to } => {
            let config = load_config(&config)?;
            replay(&config, from, to)?;
        }
        Command::Inspect { path } => inspect(&path)?,
        Command::ImportQuotes {
            archive,
            day,
            instrument,
            out,
        } => {
            let bars = read_second_bars(&archive, day, &instrument)?;
            let path = tickfile::write_day(&out, day, &bars_to_records(&bars))?;
            info!(path = %path.display(), bars = bars.len(), instrument = %instrument, "Imported quotes");
        }
    }

    Ok(())
}

/// Longest pause `publish --speed` inserts between two ticks
const MAX_PACING_DELAY: Duration = Duration::from_secs(60 * 60);

fn parse_speed(s: &str) -> Result<f64, String> {
    let speed: f64 = s.parse().map_err(|e| format!("invalid speed {:?}: {}", s, e))?;
    if !speed.is_finite() || speed <= 0.0 {
        return Err(format!("speed must be a positive number, got {}", s));
    }
    Ok(speed)
}

/// Wall-clock pause for a recorded gap replayed at `speed`, capped at
/// `MAX_PACING_DELAY`
fn pacing_delay(gap_ms: i64, speed: f64) -> Duration {
    let secs = gap_ms.max(0) as f64 / speed / 1000.0;
    Duration::try_from_secs_f64(secs)
        .unwrap_or(MAX_PACING_DELAY)
        .min(MAX_PACING_DELAY)
}

fn load_config(path: &Path) -> Result<Config, BoxError> {
    let config = Config::load(path).map_err(|e| {
        error!(error = %e, path = %path.display(), "Failed to load config");
        e
    })?;
    Ok(config)
}

/// Cancel the returned token on SIGTERM or SIGINT
fn shutdown_on_signal() -> Result<CancellationToken, BoxError> {
    let shutdown = CancellationToken::new();
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let token = shutdown.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("SIGTERM received, shutting down gracefully"),
            _ = sigint.recv() => info!("SIGINT received, shutting down gracefully"),
        }
        token.cancel();
    });
    Ok(shutdown)
}

fn load_records(
    folder: &Path,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
) -> Result<Vec<TickRecord>, BoxError> {
    let days = tickfile::list_days(folder)?;
    let (Some(first), Some(last)) = (from.or(days.first().copied()), to.or(days.last().copied()))
    else {
        warn!(folder = %folder.display(), "No tick files found");
        return Ok(Vec::new());
    };
    Ok(tickfile::read_range(folder, first, last)?)
}

fn print_bar(bar: &Bar) {
    match serde_json::to_string(bar) {
        Ok(line) => println!("{}", line),
        Err(e) => error!(error = %e, "Failed to serialize bar"),
    }
}

async fn publish(
    config: &Config,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
    speed: Option<f64>,
    shutdown: CancellationToken,
) -> Result<(), BoxError> {
    let records = load_records(&config.storage.folder, from, to)?;
    let enqueue_timeout = config.channel.enqueue_timeout()?;
    let writer = TickWriter::start(&config.channel)?;

    info!(
        channel = %config.channel.name,
        records = records.len(),
        speed = ?speed,
        "Publishing ticks"
    );

    let mut prev_ms: Option<i64> = None;
    let mut published = 0usize;
    for record in records {
        if shutdown.is_cancelled() {
            break;
        }
        if let (Some(speed), Some(prev)) = (speed, prev_ms) {
            let delay = pacing_delay(record.timestamp_ms.saturating_sub(prev), speed);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }
        prev_ms = Some(record.timestamp_ms);

        if let Err(e) = writer.enqueue(Tick::from(record), enqueue_timeout).await {
            error!(error = %e, published, "Channel broken, stopping publish");
            writer.shutdown().await?;
            return Err(e.into());
        }
        published += 1;
    }

    // let the worker write everything queued before tearing down
    while writer.pending() > 0 && !writer.is_dead() {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = sleep(Duration::from_millis(20)) => {}
        }
    }

    info!(published, "Publish complete");
    writer.shutdown().await?;
    Ok(())
}

async fn consume(
    config: &Config,
    lag_ms: u64,
    poll_ms: u64,
    shutdown: CancellationToken,
) -> Result<(), BoxError> {
    let mut reader = tokio::select! {
        _ = shutdown.cancelled() => return Ok(()),
        reader = TickReader::connect(&config.channel) => reader?,
    };

    let aggregator = BarAggregator::from_duration(config.bars.period()?, config.bars.history)?
        .with_metrics(ChannelMetrics::new(&config.channel.name))
        .with_sink(|bar| print_bar(&bar));
    let aggregator = Arc::new(Mutex::new(aggregator));
    reader.register_handler(Arc::clone(&aggregator));

    let lag = Duration::from_millis(lag_ms);
    let mut ticker = interval(Duration::from_millis(poll_ms.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let local_time = now_ticks() - duration_to_ticks(lag);
        let outcome = tokio::select! {
            _ = shutdown.cancelled() => break,
            outcome = reader.advance_to(local_time) => outcome?,
        };
        if let AdvanceOutcome::EndOfStream { delivered } = outcome {
            info!(delivered, "Writer closed the channel");
            break;
        }
    }

    let mut aggregator = aggregator.lock().map_err(|e| e.to_string())?;
    aggregator.finish();
    info!(
        bars = aggregator.history().insert_count(),
        out_of_order = aggregator.out_of_order(),
        "Consume complete"
    );
    Ok(())
}

fn replay(config: &Config, from: Option<NaiveDate>, to: Option<NaiveDate>) -> Result<(), BoxError> {
    let records = load_records(&config.storage.folder, from, to)?;
    let mut aggregator = BarAggregator::from_duration(config.bars.period()?, config.bars.history)?
        .with_sink(|bar| print_bar(&bar));
    let record_count = records.len();
    let bars = aggregator.replay(records.into_iter().map(Tick::from));
    info!(
        records = record_count,
        bars = bars.len(),
        out_of_order = aggregator.out_of_order(),
        "Replay complete"
    );
    Ok(())
}

fn inspect(path: &Path) -> Result<(), BoxError> {
    let records = tickfile::read_day(path)?;
    let format_ms = |ms: i64| {
        ticks_to_datetime(unix_ms_to_ticks(ms)).map(|dt| dt.to_rfc3339())
    };
    let min_max = |f: fn(&TickRecord) -> f64| {
        records.iter().map(f).fold(None, |acc: Option<(f64, f64)>, v| match acc {
            None => Some((v, v)),
            Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
        })
    };
    let out_of_order = records
        .windows(2)
        .filter(|w| w[1].timestamp_ms < w[0].timestamp_ms)
        .count();

    let summary = json!({
        "path": path.display().to_string(),
        "records": records.len(),
        "first": records.first().and_then(|r| format_ms(r.timestamp_ms)),
        "last": records.last().and_then(|r| format_ms(r.timestamp_ms)),
        "bid_range": min_max(|r| r.bid),
        "ask_range": min_max(|r| r.ask),
        "out_of_order": out_of_order,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
