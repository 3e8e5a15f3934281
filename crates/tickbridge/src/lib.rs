//! tickbridge: cross-process tick streaming and bar aggregation
//!
//! A producer process streams ticks over a named local channel to a
//! consumer, which merges them against its own clock and folds them into
//! bid/ask OHLC bars. Ticks are persisted as daily gzip `.zticks` files.

pub mod aggregator;
pub mod config;
pub mod error;
pub mod metrics;
pub mod quote_archive;
pub mod ring_buffer;
pub mod tickfile;
pub mod time;
pub mod transport;
pub mod wire;

pub use aggregator::{Bar, BarAggregator, Quote};
pub use config::Config;
pub use error::{ArchiveError, CodecError, ConfigError, RingError, TransportError};
pub use ring_buffer::RingBuffer;
pub use tickfile::TickRecord;
pub use time::Timestamped;
pub use transport::{AdvanceOutcome, TickHandler, TickReader, TickSender, TickWriter};
pub use wire::{Framing, Tick, TickKind};
