//! Producer side of a tick channel
//!
//! Any thread or task queues ticks through a cloneable `TickSender`. The
//! queue itself is unbounded; a semaphore of `queue_capacity` send slots
//! gates it, and a slot only comes back once its tick has been written and
//! flushed. A single worker task owns the socket.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::SinkExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ChannelConfig;
use crate::error::TransportError;
use crate::metrics::ChannelMetrics;
use crate::wire::{Framing, Tick, TickCodec};

use super::channel_label;

/// State shared between senders and the worker
#[derive(Debug)]
struct SendSlots {
    slots: Semaphore,
    /// Ticks queued without a slot because their wait timed out
    overdraft: AtomicUsize,
    /// Queued, not yet written
    pending: AtomicUsize,
    dead: AtomicBool,
}

impl SendSlots {
    fn new(capacity: usize) -> Self {
        Self {
            slots: Semaphore::new(capacity),
            overdraft: AtomicUsize::new(0),
            pending: AtomicUsize::new(0),
            dead: AtomicBool::new(false),
        }
    }

    /// Give back one slot after a write, repaying overdraft first so the
    /// slot count never exceeds the configured capacity.
    fn release_one(&self) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
        let mut owed = self.overdraft.load(Ordering::Acquire);
        while owed > 0 {
            match self.overdraft.compare_exchange_weak(
                owed,
                owed - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => owed = actual,
            }
        }
        self.slots.add_permits(1);
    }

    /// Permanent. Wakes every sender blocked on a slot.
    fn mark_dead(&self) {
        self.dead.store(true, Ordering::SeqCst);
        self.slots.close();
    }

    fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }
}

/// Cloneable handle for queuing ticks onto a writer
#[derive(Clone)]
pub struct TickSender {
    tx: mpsc::UnboundedSender<Tick>,
    shared: Arc<SendSlots>,
    runtime: Handle,
    metrics: ChannelMetrics,
}

impl TickSender {
    /// Queue a tick, waiting up to `timeout` for a send slot. Once the wait
    /// is over the tick is queued regardless; this only fails when the
    /// worker has stopped for good.
    pub async fn enqueue(&self, tick: Tick, timeout: Duration) -> Result<(), TransportError> {
        if self.shared.is_dead() {
            return Err(worker_stopped());
        }

        match tokio::time::timeout(timeout, self.shared.slots.acquire()).await {
            Ok(Ok(permit)) => permit.forget(),
            Ok(Err(_closed)) => return Err(worker_stopped()),
            Err(_elapsed) => {
                self.shared.overdraft.fetch_add(1, Ordering::AcqRel);
                self.metrics.inc_backpressure_timeout();
                warn!(
                    channel = %self.metrics.channel(),
                    timeout_ms = timeout.as_millis() as u64,
                    "Send queue full past timeout, queuing anyway"
                );
            }
        }

        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(tick).is_err() {
            self.shared.pending.fetch_sub(1, Ordering::AcqRel);
            self.shared.mark_dead();
            return Err(worker_stopped());
        }
        self.metrics.inc_enqueued();
        Ok(())
    }

    /// Blocking form of [`enqueue`](Self::enqueue) for threads outside the
    /// runtime (or inside `spawn_blocking`). Panics if called from async code.
    pub fn enqueue_blocking(&self, tick: Tick, timeout: Duration) -> Result<(), TransportError> {
        self.runtime.block_on(self.enqueue(tick, timeout))
    }

    pub fn is_dead(&self) -> bool {
        self.shared.is_dead()
    }

    /// Ticks queued but not yet written
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    /// Send slots currently free
    pub fn available_slots(&self) -> usize {
        self.shared.slots.available_permits()
    }
}

fn worker_stopped() -> TransportError {
    TransportError::ChannelBroken("writer worker has stopped".to_string())
}

/// Owns the channel endpoint and its worker task
pub struct TickWriter {
    socket_path: PathBuf,
    sender: TickSender,
    cancel: CancellationToken,
    worker: Option<JoinHandle<Result<(), TransportError>>>,
    join_timeout: Duration,
}

impl TickWriter {
    /// Bind the channel socket and start the worker. Must be called from
    /// within a Tokio runtime.
    pub fn start(config: &ChannelConfig) -> Result<Self, TransportError> {
        let join_timeout = config
            .join_timeout()
            .map_err(|e| TransportError::Io(io::Error::other(e.to_string())))?;
        Self::bind(
            &config.socket_path(),
            config.queue_capacity,
            config.framing,
            join_timeout,
        )
    }

    pub fn bind(
        socket_path: &Path,
        queue_capacity: usize,
        framing: Framing,
        join_timeout: Duration,
    ) -> Result<Self, TransportError> {
        if queue_capacity == 0 {
            return Err(TransportError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "queue capacity must be greater than zero",
            )));
        }
        let runtime = Handle::try_current().map_err(|e| TransportError::Io(io::Error::other(e)))?;

        if let Some(dir) = socket_path.parent() {
            fs::create_dir_all(dir)?;
        }
        remove_socket_file(socket_path)?;
        let listener = UnixListener::bind(socket_path)?;

        let metrics = ChannelMetrics::new(channel_label(socket_path));
        let shared = Arc::new(SendSlots::new(queue_capacity));
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        info!(
            path = %socket_path.display(),
            queue_capacity,
            framing = ?framing,
            "Tick channel bound, waiting for reader"
        );

        let worker = runtime.spawn(run_worker(
            listener,
            rx,
            framing,
            Arc::clone(&shared),
            cancel.clone(),
            metrics.clone(),
        ));

        Ok(Self {
            socket_path: socket_path.to_path_buf(),
            sender: TickSender {
                tx,
                shared,
                runtime,
                metrics,
            },
            cancel,
            worker: Some(worker),
            join_timeout,
        })
    }

    pub fn sender(&self) -> TickSender {
        self.sender.clone()
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub async fn enqueue(&self, tick: Tick, timeout: Duration) -> Result<(), TransportError> {
        self.sender.enqueue(tick, timeout).await
    }

    pub fn enqueue_blocking(&self, tick: Tick, timeout: Duration) -> Result<(), TransportError> {
        self.sender.enqueue_blocking(tick, timeout)
    }

    pub fn is_dead(&self) -> bool {
        self.sender.is_dead()
    }

    pub fn pending(&self) -> usize {
        self.sender.pending()
    }

    /// Cancel the worker and wait up to the join timeout for it to finish
    /// writing what is already queued. Past the timeout the task is aborted.
    pub async fn shutdown(mut self) -> Result<(), TransportError> {
        self.cancel.cancel();
        let result = match self.worker.take() {
            Some(worker) => {
                let abort = worker.abort_handle();
                match tokio::time::timeout(self.join_timeout, worker).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(join_err)) => {
                        error!(error = %join_err, "Writer worker panicked");
                        Err(TransportError::ChannelBroken(join_err.to_string()))
                    }
                    Err(_) => {
                        abort.abort();
                        let pending = self.sender.pending();
                        error!(
                            join_timeout_ms = self.join_timeout.as_millis() as u64,
                            pending,
                            "Writer worker did not stop in time, aborted with ticks still queued"
                        );
                        Err(TransportError::ShutdownTimeout { pending })
                    }
                }
            }
            None => Ok(()),
        };
        self.sender.shared.mark_dead();
        if let Err(e) = remove_socket_file(&self.socket_path) {
            warn!(error = %e, path = %self.socket_path.display(), "Failed to remove socket file");
        }
        info!(path = %self.socket_path.display(), "Tick writer stopped");
        result
    }
}

impl Drop for TickWriter {
    fn drop(&mut self) {
        self.cancel.cancel();
        if self.worker.is_some() {
            let _ = remove_socket_file(&self.socket_path);
        }
    }
}

fn remove_socket_file(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "Removed socket file");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

async fn run_worker(
    listener: UnixListener,
    rx: mpsc::UnboundedReceiver<Tick>,
    framing: Framing,
    shared: Arc<SendSlots>,
    cancel: CancellationToken,
    metrics: ChannelMetrics,
) -> Result<(), TransportError> {
    let result = serve(listener, rx, framing, &shared, &cancel, &metrics).await;
    if let Err(ref e) = result {
        error!(channel = %metrics.channel(), error = %e, "Writer worker failed, channel is dead");
    }
    shared.mark_dead();
    metrics.set_connected("writer", false);
    result
}

async fn serve(
    listener: UnixListener,
    mut rx: mpsc::UnboundedReceiver<Tick>,
    framing: Framing,
    shared: &SendSlots,
    cancel: &CancellationToken,
    metrics: &ChannelMetrics,
) -> Result<(), TransportError> {
    let stream = tokio::select! {
        _ = cancel.cancelled() => {
            let pending = shared.pending.load(Ordering::Acquire);
            if pending > 0 {
                warn!(channel = %metrics.channel(), pending, "Writer cancelled before a reader connected, queued ticks dropped");
            } else {
                info!(channel = %metrics.channel(), "Writer cancelled before a reader connected");
            }
            return Ok(());
        }
        accepted = listener.accept() => accepted?.0,
    };
    info!(channel = %metrics.channel(), "Reader connected");
    metrics.set_connected("writer", true);

    let mut frames = FramedWrite::new(stream, TickCodec::new(framing));
    let mut sequence: u64 = 0;

    loop {
        let tick = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(tick) => tick,
                None => return Ok(()),
            },
        };
        sequence += 1;
        write_tick(&mut frames, tick, sequence, shared, metrics).await?;
    }

    // Cancelled: write out whatever was queued before the signal
    let mut drained = 0usize;
    while let Ok(tick) = rx.try_recv() {
        sequence += 1;
        write_tick(&mut frames, tick, sequence, shared, metrics).await?;
        drained += 1;
    }
    info!(channel = %metrics.channel(), drained, last_sequence = sequence, "Writer drained on shutdown");
    Ok(())
}

async fn write_tick(
    frames: &mut FramedWrite<UnixStream, TickCodec>,
    tick: Tick,
    sequence: u64,
    shared: &SendSlots,
    metrics: &ChannelMetrics,
) -> Result<(), TransportError> {
    let stamped = Tick { sequence, ..tick };
    // send() flushes before returning
    frames
        .send(stamped)
        .await
        .map_err(|e| TransportError::ChannelBroken(e.to_string()))?;
    shared.release_one();
    metrics.inc_written();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_repays_overdraft_before_adding_slots() {
        let slots = SendSlots::new(2);
        slots.pending.store(3, Ordering::Release);
        slots.overdraft.store(1, Ordering::Release);

        slots.release_one();
        assert_eq!(slots.overdraft.load(Ordering::Acquire), 0);
        assert_eq!(slots.slots.available_permits(), 2);

        slots.release_one();
        assert_eq!(slots.slots.available_permits(), 3);
        assert_eq!(slots.pending.load(Ordering::Acquire), 1);
    }

    #[test]
    fn test_mark_dead_closes_slots() {
        let slots = SendSlots::new(1);
        assert!(!slots.is_dead());
        slots.mark_dead();
        assert!(slots.is_dead());
        assert!(slots.slots.try_acquire().is_err());
    }

    #[tokio::test]
    async fn test_zero_capacity_rejected() {
        let tmp = tempfile::TempDir::new().unwrap();
        let result = TickWriter::bind(
            &tmp.path().join("zero.sock"),
            0,
            Framing::Raw,
            Duration::from_secs(1),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_bind_replaces_stale_socket_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("stale.sock");
        fs::write(&path, b"left over").unwrap();

        let writer = TickWriter::bind(&path, 4, Framing::Raw, Duration::from_secs(1)).unwrap();
        assert!(path.exists());
        writer.shutdown().await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_enqueue_after_shutdown_fails() {
        let tmp = tempfile::TempDir::new().unwrap();
        let writer = TickWriter::bind(
            &tmp.path().join("closed.sock"),
            4,
            Framing::Raw,
            Duration::from_secs(1),
        )
        .unwrap();
        let sender = writer.sender();
        writer.shutdown().await.unwrap();

        assert!(sender.is_dead());
        let result = sender
            .enqueue(Tick::quote(1, 1.0, 1.1), Duration::from_millis(10))
            .await;
        assert!(matches!(result, Err(TransportError::ChannelBroken(_))));
    }

    #[tokio::test]
    async fn test_shutdown_reports_undrained_ticks() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("stalled.sock");
        let writer = TickWriter::bind(&path, 100_000, Framing::Raw, Duration::from_millis(100))
            .unwrap();

        // connected but never reads, so the socket buffer fills and the worker stalls
        let _stalled = UnixStream::connect(&path).await.unwrap();
        for time in 0..20_000 {
            writer
                .enqueue(Tick::quote(time, 1.0, 1.1), Duration::from_millis(10))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(writer.pending() > 0);

        match writer.shutdown().await {
            Err(TransportError::ShutdownTimeout { pending }) => assert!(pending > 0),
            other => panic!("expected ShutdownTimeout, got {:?}", other),
        }
    }
}
