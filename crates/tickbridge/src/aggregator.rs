//! Tick to bar aggregation
//!
//! Folds an ordered tick stream into fixed-period bid/ask OHLC bars with
//! directional volume. The same aggregator serves live ticks from a
//! `TickReader` and replayed tick files.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, trace};

use crate::error::ConfigError;
use crate::metrics::ChannelMetrics;
use crate::ring_buffer::RingBuffer;
use crate::time::{duration_to_ticks, Timestamped};
use crate::transport::TickHandler;
use crate::wire::Tick;

/// Bid and ask OHLC for one period. A side whose open is 0.0 has not seen
/// a price yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    /// Period start, floored to the bar period
    pub time_open: i64,
    pub bid_open: f64,
    pub bid_high: f64,
    pub bid_low: f64,
    pub bid_close: f64,
    pub bid_volume: i64,
    pub ask_open: f64,
    pub ask_high: f64,
    pub ask_low: f64,
    pub ask_close: f64,
    pub ask_volume: i64,
}

impl Bar {
    pub fn empty(time_open: i64) -> Self {
        Self {
            time_open,
            ..Self::default()
        }
    }

    fn apply_bid(&mut self, price: f64) {
        apply_side(
            price,
            &mut self.bid_open,
            &mut self.bid_high,
            &mut self.bid_low,
            &mut self.bid_close,
        );
    }

    fn apply_ask(&mut self, price: f64) {
        apply_side(
            price,
            &mut self.ask_open,
            &mut self.ask_high,
            &mut self.ask_low,
            &mut self.ask_close,
        );
    }

    /// Attribute trade volume to the side it hit. Nothing is attributed on a
    /// locked (bid == ask) or incomplete quote.
    fn attribute_volume(&mut self, bid: f64, ask: f64, price: f64, volume: i64) {
        if volume <= 0 || bid <= 0.0 || ask <= 0.0 || bid == ask {
            return;
        }
        if price >= ask {
            self.ask_volume += volume;
        } else if price <= bid {
            self.bid_volume += volume;
        }
    }
}

/// Extremes only ever widen; zero or negative prices are ignored.
fn apply_side(price: f64, open: &mut f64, high: &mut f64, low: &mut f64, close: &mut f64) {
    if price <= 0.0 || !price.is_finite() {
        return;
    }
    if *open == 0.0 {
        *open = price;
        *high = price;
        *low = price;
    } else {
        *high = high.max(price);
        *low = low.min(price);
    }
    *close = price;
}

impl Timestamped for Bar {
    fn timestamp(&self) -> i64 {
        self.time_open
    }
}

/// Anything the aggregator can fold into a bar
pub trait Quote: Timestamped {
    fn bid(&self) -> f64;
    fn ask(&self) -> f64;

    /// Trade price, 0.0 for pure quote updates
    fn trade_price(&self) -> f64 {
        0.0
    }

    fn volume(&self) -> i64 {
        0
    }
}

impl Quote for Tick {
    fn bid(&self) -> f64 {
        self.bid
    }

    fn ask(&self) -> f64 {
        self.ask
    }

    fn trade_price(&self) -> f64 {
        self.price
    }

    fn volume(&self) -> i64 {
        self.volume
    }
}

type BarSink = Box<dyn FnMut(Bar) + Send>;

pub struct BarAggregator {
    /// Bar period in platform ticks
    period: i64,
    current: Option<Bar>,
    last_time: Option<i64>,
    /// Last non-zero quote per side, used when a tick carries a zero field
    last_bid: f64,
    last_ask: f64,
    out_of_order: u64,
    history: RingBuffer<Bar>,
    sink: Option<BarSink>,
    metrics: Option<ChannelMetrics>,
}

impl BarAggregator {
    /// `period` is in the same units as tick timestamps
    pub fn new(period: i64, history: usize) -> Result<Self, ConfigError> {
        if period <= 0 {
            return Err(ConfigError::Invalid(format!(
                "bar period must be positive, got {}",
                period
            )));
        }
        let history = RingBuffer::new(history)
            .map_err(|e| ConfigError::Invalid(format!("bar history: {}", e)))?;
        Ok(Self {
            period,
            current: None,
            last_time: None,
            last_bid: 0.0,
            last_ask: 0.0,
            out_of_order: 0,
            history,
            sink: None,
            metrics: None,
        })
    }

    /// Period given as wall time, for platform-tick timestamps
    pub fn from_duration(period: Duration, history: usize) -> Result<Self, ConfigError> {
        Self::new(duration_to_ticks(period), history)
    }

    /// Hand every sealed bar to `sink` as well as keeping it in history
    pub fn with_sink(mut self, sink: impl FnMut(Bar) + Send + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    pub fn with_metrics(mut self, metrics: ChannelMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn period(&self) -> i64 {
        self.period
    }

    /// The open, still mutating bar
    pub fn current(&self) -> Option<&Bar> {
        self.current.as_ref()
    }

    /// Sealed bars, newest first
    pub fn history(&self) -> &RingBuffer<Bar> {
        &self.history
    }

    /// Newest sealed bar opened at or before `time`
    pub fn bar_at(&self, time: i64) -> Option<&Bar> {
        self.history
            .index_at_or_before(time)
            .and_then(|rel| self.history.get(rel).ok())
    }

    /// Ticks seen with a timestamp earlier than one already processed
    pub fn out_of_order(&self) -> u64 {
        self.out_of_order
    }

    #[inline]
    fn floor(&self, time: i64) -> i64 {
        time.div_euclid(self.period) * self.period
    }

    /// Fold one quote in. Returns the bar it sealed, if it opened a new one.
    ///
    /// A quote floored to a later period seals the open bar. A late quote
    /// (earlier period) is folded into the open bar and never reopens an
    /// older one.
    pub fn update<Q: Quote + ?Sized>(&mut self, quote: &Q) -> Option<Bar> {
        let time = quote.timestamp();
        if quote.bid() > 0.0 {
            self.last_bid = quote.bid();
        }
        if quote.ask() > 0.0 {
            self.last_ask = quote.ask();
        }
        let (bid, ask) = (self.last_bid, self.last_ask);

        match self.last_time {
            Some(last) if time < last => {
                self.out_of_order += 1;
                trace!(time, last, "Out of order tick folded into open bar");
            }
            Some(last) if time == last => {}
            _ => self.last_time = Some(time),
        }

        let bar_open = self.floor(time);
        let sealed = match self.current {
            Some(ref bar) if bar_open > bar.time_open => self.current.take(),
            _ => None,
        };

        let bar = self.current.get_or_insert_with(|| Bar::empty(bar_open));
        bar.apply_bid(bid);
        bar.apply_ask(ask);
        bar.attribute_volume(bid, ask, quote.trade_price(), quote.volume());

        if let Some(bar) = sealed {
            self.seal(bar);
        }
        sealed
    }

    /// Seal the open bar, e.g. at the end of a replay
    pub fn finish(&mut self) -> Option<Bar> {
        let bar = self.current.take()?;
        self.seal(bar);
        Some(bar)
    }

    fn seal(&mut self, bar: Bar) {
        debug!(
            time_open = bar.time_open,
            bid_open = bar.bid_open,
            bid_close = bar.bid_close,
            bid_volume = bar.bid_volume,
            ask_volume = bar.ask_volume,
            "Bar sealed"
        );
        self.history.push(bar);
        if let Some(ref metrics) = self.metrics {
            metrics.inc_bar_sealed();
        }
        if let Some(ref mut sink) = self.sink {
            sink(bar);
        }
    }

    /// Run a whole sequence through and seal the trailing bar
    pub fn replay<Q: Quote>(&mut self, quotes: impl IntoIterator<Item = Q>) -> Vec<Bar> {
        let mut bars = Vec::new();
        for quote in quotes {
            if let Some(bar) = self.update(&quote) {
                bars.push(bar);
            }
        }
        bars.extend(self.finish());
        bars
    }
}

impl TickHandler for BarAggregator {
    fn on_tick(&mut self, tick: &Tick) {
        self.update(tick);
    }
}
