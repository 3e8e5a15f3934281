//! Consumer side of a tick channel
//!
//! Single-threaded discipline: every method takes `&mut self`. `peek`
//! caches one tick of lookahead so the merge loop can decide whether to
//! consume before committing.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::net::UnixStream;
use tokio::time::Instant;
use tokio_util::codec::FramedRead;
use tracing::{debug, error, info, warn};

use crate::config::ChannelConfig;
use crate::error::TransportError;
use crate::metrics::ChannelMetrics;
use crate::wire::{Framing, Tick, TickCodec};

use super::channel_label;

/// Cap on the pause between connect attempts
const MAX_CONNECT_BACKOFF: Duration = Duration::from_millis(500);

/// Receives every tick the merge loop consumes
pub trait TickHandler {
    fn on_tick(&mut self, tick: &Tick);
}

impl<H: TickHandler + ?Sized> TickHandler for Box<H> {
    fn on_tick(&mut self, tick: &Tick) {
        (**self).on_tick(tick)
    }
}

/// Lets the caller keep a handle on a handler it registered
impl<H: TickHandler> TickHandler for Arc<Mutex<H>> {
    fn on_tick(&mut self, tick: &Tick) {
        match self.lock() {
            Ok(mut handler) => handler.on_tick(tick),
            Err(poisoned) => poisoned.into_inner().on_tick(tick),
        }
    }
}

struct FnHandler<F>(F);

impl<F: FnMut(&Tick)> TickHandler for FnHandler<F> {
    fn on_tick(&mut self, tick: &Tick) {
        (self.0)(tick)
    }
}

/// Result of one `advance_to` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceOutcome {
    /// The next producer tick is ahead of local time and stays queued
    CaughtUp { delivered: usize },
    /// The channel closed or broke; no more ticks will arrive
    EndOfStream { delivered: usize },
}

impl AdvanceOutcome {
    pub fn delivered(&self) -> usize {
        match *self {
            AdvanceOutcome::CaughtUp { delivered } | AdvanceOutcome::EndOfStream { delivered } => {
                delivered
            }
        }
    }
}

pub struct TickReader {
    frames: FramedRead<UnixStream, TickCodec>,
    lookahead: Option<Tick>,
    handlers: Vec<Box<dyn TickHandler + Send>>,
    /// First advance_to has run
    started: bool,
    /// Set by a clock order violation; every later advance fails the same way
    violation: Option<(i64, i64)>,
    closed: bool,
    last_sequence: u64,
    metrics: ChannelMetrics,
}

impl TickReader {
    /// Connect to the channel named in `config`, retrying until its connect
    /// timeout elapses.
    pub async fn connect(config: &ChannelConfig) -> Result<Self, TransportError> {
        let timeout = config
            .connect_timeout()
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
        Self::connect_path(&config.socket_path(), config.framing, timeout).await
    }

    pub async fn connect_path(
        socket_path: &Path,
        framing: Framing,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut backoff = Duration::from_millis(10);
        let mut attempts = 0u32;

        let stream = loop {
            attempts += 1;
            match UnixStream::connect(socket_path).await {
                Ok(stream) => break stream,
                Err(e) => {
                    let now = Instant::now();
                    if now >= deadline {
                        error!(
                            path = %socket_path.display(),
                            attempts,
                            error = %e,
                            "No writer accepted the connection"
                        );
                        return Err(TransportError::ConnectFailed(format!(
                            "{}: {}",
                            socket_path.display(),
                            e
                        )));
                    }
                    debug!(path = %socket_path.display(), attempts, error = %e, "Writer not ready, retrying");
                    tokio::time::sleep(backoff.min(deadline - now)).await;
                    backoff = (backoff * 2).min(MAX_CONNECT_BACKOFF);
                }
            }
        };

        info!(path = %socket_path.display(), attempts, "Connected to tick channel");
        Ok(Self::from_stream(stream, framing, &channel_label(socket_path)))
    }

    /// Wrap an already connected stream
    pub fn from_stream(stream: UnixStream, framing: Framing, channel: &str) -> Self {
        let metrics = ChannelMetrics::new(channel);
        metrics.set_connected("reader", true);
        Self {
            frames: FramedRead::new(stream, TickCodec::new(framing)),
            lookahead: None,
            handlers: Vec::new(),
            started: false,
            violation: None,
            closed: false,
            last_sequence: 0,
            metrics,
        }
    }

    pub fn register_handler(&mut self, handler: impl TickHandler + Send + 'static) {
        self.handlers.push(Box::new(handler));
    }

    pub fn on_tick(&mut self, f: impl FnMut(&Tick) + Send + 'static) {
        self.register_handler(FnHandler(f));
    }

    pub fn is_closed(&self) -> bool {
        self.closed && self.lookahead.is_none()
    }

    /// Next tick without consuming it. `None` once the channel has closed.
    pub async fn peek(&mut self) -> Option<Tick> {
        if self.lookahead.is_none() {
            self.lookahead = self.read_next().await;
        }
        self.lookahead
    }

    /// Consume the cached tick, or read the next one.
    pub async fn dequeue(&mut self) -> Option<Tick> {
        match self.lookahead.take() {
            Some(tick) => Some(tick),
            None => self.read_next().await,
        }
    }

    async fn read_next(&mut self) -> Option<Tick> {
        if self.closed {
            return None;
        }
        loop {
            match self.frames.next().await {
                Some(Ok(tick)) => {
                    if tick.sequence <= self.last_sequence {
                        self.metrics.inc_duplicate();
                        debug!(
                            sequence = tick.sequence,
                            last_sequence = self.last_sequence,
                            "Dropping redelivered tick"
                        );
                        continue;
                    }
                    self.last_sequence = tick.sequence;
                    return Some(tick);
                }
                Some(Err(e)) => {
                    warn!(channel = %self.metrics.channel(), error = %e, "Tick channel broken, treating as end of stream");
                    self.mark_closed();
                    return None;
                }
                None => {
                    info!(channel = %self.metrics.channel(), last_sequence = self.last_sequence, "Tick channel closed by writer");
                    self.mark_closed();
                    return None;
                }
            }
        }
    }

    fn mark_closed(&mut self) {
        self.closed = true;
        self.metrics.set_connected("reader", false);
    }

    /// Deliver every producer tick stamped at or before `local_time` to the
    /// registered handlers, stopping at the first tick ahead of it (which
    /// stays cached for the next call).
    ///
    /// Fails with `ClockOrderViolation` when the very first call already sees
    /// the producer ahead of local time: the two sides were started over
    /// inconsistent history.
    pub async fn advance_to(&mut self, local_time: i64) -> Result<AdvanceOutcome, TransportError> {
        if let Some((producer_time, local_time)) = self.violation {
            return Err(TransportError::ClockOrderViolation {
                producer_time,
                local_time,
            });
        }
        let first_call = !self.started;
        self.started = true;

        let mut delivered = 0usize;
        loop {
            let Some(next) = self.peek().await else {
                return Ok(AdvanceOutcome::EndOfStream { delivered });
            };

            if next.time > local_time {
                if first_call && delivered == 0 {
                    error!(
                        producer_time = next.time,
                        local_time,
                        "Producer is ahead of local clock on first advance"
                    );
                    self.violation = Some((next.time, local_time));
                    return Err(TransportError::ClockOrderViolation {
                        producer_time: next.time,
                        local_time,
                    });
                }
                return Ok(AdvanceOutcome::CaughtUp { delivered });
            }

            let Some(tick) = self.lookahead.take() else {
                continue;
            };
            for handler in &mut self.handlers {
                handler.on_tick(&tick);
            }
            self.metrics.inc_read();
            delivered += 1;
        }
    }
}
