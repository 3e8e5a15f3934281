//! Writer and reader over a real Unix socket in one process

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tickbridge::config::ChannelConfig;
use tickbridge::{AdvanceOutcome, Framing, Tick, TickReader, TickWriter, TransportError};

fn channel(tmp: &TempDir, name: &str, capacity: usize) -> ChannelConfig {
    let mut config = ChannelConfig::new(name);
    config.dir = Some(tmp.path().to_path_buf());
    config.queue_capacity = capacity;
    config.connect_timeout = "2s".to_string();
    config
}

async fn wait_for(mut cond: impl FnMut() -> bool, limit: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < limit {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

#[tokio::test]
async fn test_stream_merge_and_close() {
    let tmp = TempDir::new().unwrap();
    let config = channel(&tmp, "eurusd", 8);
    let writer = TickWriter::start(&config).unwrap();
    assert!(config.socket_path().exists());

    let mut reader = TickReader::connect(&config).await.unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    reader.on_tick(move |t| sink.lock().unwrap().push((t.time, t.sequence)));

    let sender = writer.sender();
    let producer = tokio::spawn(async move {
        for time in 100..120 {
            sender
                .enqueue(Tick::quote(time, 1.1, 1.2), Duration::from_secs(1))
                .await
                .unwrap();
        }
    });

    let outcome = reader.advance_to(109).await.unwrap();
    assert_eq!(outcome, AdvanceOutcome::CaughtUp { delivered: 10 });
    assert_eq!(reader.peek().await.map(|t| t.time), Some(110));

    producer.await.unwrap();
    writer.shutdown().await.unwrap();
    assert!(!config.socket_path().exists());

    let outcome = reader.advance_to(1_000).await.unwrap();
    assert_eq!(outcome, AdvanceOutcome::EndOfStream { delivered: 10 });
    assert!(reader.is_closed());

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 20);
    for (i, (time, sequence)) in seen.iter().enumerate() {
        assert_eq!(*time, 100 + i as i64);
        assert_eq!(*sequence, i as u64 + 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_full_queue_blocks_until_timeout() {
    let tmp = TempDir::new().unwrap();
    let config = channel(&tmp, "backpressure", 2);
    let writer = TickWriter::start(&config).unwrap();
    let sender = writer.sender();

    // no reader yet, so nothing drains
    for time in 0..2 {
        sender
            .enqueue(Tick::quote(time, 1.0, 1.1), Duration::from_millis(50))
            .await
            .unwrap();
    }
    assert_eq!(sender.available_slots(), 0);

    let blocking = sender.clone();
    let waited = tokio::task::spawn_blocking(move || {
        let start = Instant::now();
        blocking
            .enqueue_blocking(Tick::quote(2, 1.0, 1.1), Duration::from_millis(200))
            .unwrap();
        start.elapsed()
    })
    .await
    .unwrap();
    assert!(waited >= Duration::from_millis(200), "returned after {:?}", waited);
    assert_eq!(sender.pending(), 3);

    // a reader drains the queue and the overdraft is repaid first
    let mut reader = TickReader::connect(&config).await.unwrap();
    for expected in 1..=3u64 {
        assert_eq!(reader.dequeue().await.map(|t| t.sequence), Some(expected));
    }
    assert!(wait_for(|| sender.pending() == 0, Duration::from_secs(2)).await);
    assert_eq!(sender.available_slots(), 2);

    writer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_blocked_enqueue_wakes_when_slot_frees() {
    let tmp = TempDir::new().unwrap();
    let config = channel(&tmp, "wake", 1);
    let writer = TickWriter::start(&config).unwrap();
    let sender = writer.sender();

    sender
        .enqueue(Tick::quote(1, 1.0, 1.1), Duration::from_millis(50))
        .await
        .unwrap();

    let waiter = sender.clone();
    let second = tokio::spawn(async move {
        let start = Instant::now();
        waiter
            .enqueue(Tick::quote(2, 1.0, 1.1), Duration::from_secs(5))
            .await
            .unwrap();
        start.elapsed()
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut reader = TickReader::connect(&config).await.unwrap();
    let waited = second.await.unwrap();
    assert!(waited < Duration::from_secs(5));

    assert_eq!(reader.dequeue().await.map(|t| t.time), Some(1));
    assert_eq!(reader.dequeue().await.map(|t| t.time), Some(2));
    writer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_writer_dies_when_reader_goes_away() {
    let tmp = TempDir::new().unwrap();
    let config = channel(&tmp, "broken", 4);
    let writer = TickWriter::start(&config).unwrap();

    let reader = TickReader::connect(&config).await.unwrap();
    drop(reader);

    let start = Instant::now();
    let mut failure = None;
    while start.elapsed() < Duration::from_secs(2) {
        if let Err(e) = writer
            .enqueue(Tick::quote(1, 1.0, 1.1), Duration::from_millis(20))
            .await
        {
            failure = Some(e);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(matches!(failure, Some(TransportError::ChannelBroken(_))));
    assert!(writer.is_dead());
    // fails fast from now on
    let start = Instant::now();
    assert!(writer
        .enqueue(Tick::quote(2, 1.0, 1.1), Duration::from_secs(5))
        .await
        .is_err());
    assert!(start.elapsed() < Duration::from_secs(1));
    assert!(writer.shutdown().await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_length_prefixed_from_plain_threads() {
    let tmp = TempDir::new().unwrap();
    let mut config = channel(&tmp, "framed", 16);
    config.framing = Framing::LengthPrefixed;
    let writer = TickWriter::start(&config).unwrap();
    let mut reader = TickReader::connect(&config).await.unwrap();

    let sender = writer.sender();
    tokio::task::spawn_blocking(move || {
        for time in 0..5 {
            let tick = Tick::trade(time, 1.2, 10, 1.1, 1.2);
            sender
                .enqueue_blocking(tick, Duration::from_secs(1))
                .unwrap();
        }
    })
    .await
    .unwrap();

    let mut received = Vec::new();
    while received.len() < 5 {
        let tick = reader.dequeue().await.unwrap();
        received.push(tick);
    }
    assert!(received.iter().all(|t| t.volume == 10 && t.price == 1.2));
    assert_eq!(
        received.iter().map(|t| t.sequence).collect::<Vec<_>>(),
        vec![1, 2, 3, 4, 5]
    );
    writer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_producer_ahead_of_reader_clock() {
    let tmp = TempDir::new().unwrap();
    let config = channel(&tmp, "clock", 4);
    let writer = TickWriter::start(&config).unwrap();
    let mut reader = TickReader::connect(&config).await.unwrap();

    writer
        .enqueue(Tick::quote(500, 1.0, 1.1), Duration::from_secs(1))
        .await
        .unwrap();

    match reader.advance_to(100).await {
        Err(TransportError::ClockOrderViolation {
            producer_time,
            local_time,
        }) => {
            assert_eq!(producer_time, 500);
            assert_eq!(local_time, 100);
        }
        other => panic!("expected ClockOrderViolation, got {:?}", other),
    }
    // sticky
    assert!(reader.advance_to(1_000).await.is_err());
    writer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_connect_without_writer_fails() {
    let tmp = TempDir::new().unwrap();
    let mut config = channel(&tmp, "nobody", 4);
    config.connect_timeout = "100ms".to_string();

    match TickReader::connect(&config).await {
        Err(TransportError::ConnectFailed(_)) => {}
        Err(other) => panic!("expected ConnectFailed, got {}", other),
        Ok(_) => panic!("connected without a writer"),
    }
}
