//! Prometheus metrics for the tick bridge
//!
//! Per-channel counters for the transport, plus aggregator and tick file totals.

use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter_vec, register_int_gauge_vec, Encoder, IntCounterVec, IntGaugeVec,
    TextEncoder,
};

const LABEL_CHANNEL: &str = "channel";
const LABEL_DIRECTION: &str = "direction";

/// Ticks accepted into the writer queue
static TICKS_ENQUEUED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "tickbridge_ticks_enqueued_total",
        "Ticks accepted into the writer send queue",
        &[LABEL_CHANNEL]
    )
    .expect("Failed to register ticks_enqueued_total metric")
});

/// Ticks written to the channel by the writer worker
static TICKS_WRITTEN_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "tickbridge_ticks_written_total",
        "Ticks serialized and flushed to the channel",
        &[LABEL_CHANNEL]
    )
    .expect("Failed to register ticks_written_total metric")
});

/// Enqueue calls whose slot wait timed out
static BACKPRESSURE_TIMEOUTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "tickbridge_backpressure_timeouts_total",
        "Enqueue calls that waited out their timeout for a send slot",
        &[LABEL_CHANNEL]
    )
    .expect("Failed to register backpressure_timeouts_total metric")
});

/// Items queued but not yet written
static QUEUE_DEPTH: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "tickbridge_queue_depth",
        "Ticks waiting in the writer queue",
        &[LABEL_CHANNEL]
    )
    .expect("Failed to register queue_depth metric")
});

/// Ticks delivered to handlers by the reader
static TICKS_READ_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "tickbridge_ticks_read_total",
        "Ticks delivered by the reader",
        &[LABEL_CHANNEL]
    )
    .expect("Failed to register ticks_read_total metric")
});

/// Redelivered ticks dropped by sequence
static DUPLICATES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "tickbridge_duplicates_total",
        "Ticks dropped because their sequence was already delivered",
        &[LABEL_CHANNEL]
    )
    .expect("Failed to register duplicates_total metric")
});

/// Channel connected status (1 = connected)
static CONNECTED: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "tickbridge_channel_connected",
        "Channel connection status per side (1=connected, 0=disconnected)",
        &[LABEL_CHANNEL, LABEL_DIRECTION]
    )
    .expect("Failed to register channel_connected metric")
});

static BARS_SEALED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "tickbridge_bars_sealed_total",
        "Bars sealed by the aggregator",
        &[LABEL_CHANNEL]
    )
    .expect("Failed to register bars_sealed_total metric")
});

/// Tick file records read or written
static TICKFILE_RECORDS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "tickbridge_tickfile_records_total",
        "Tick file records read or written",
        &[LABEL_DIRECTION]
    )
    .expect("Failed to register tickfile_records_total metric")
});

/// Handle for recording metrics for one channel
#[derive(Clone, Debug)]
pub struct ChannelMetrics {
    channel: String,
}

impl ChannelMetrics {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn inc_enqueued(&self) {
        TICKS_ENQUEUED_TOTAL
            .with_label_values(&[&self.channel])
            .inc();
        QUEUE_DEPTH.with_label_values(&[&self.channel]).inc();
    }

    pub fn inc_written(&self) {
        TICKS_WRITTEN_TOTAL
            .with_label_values(&[&self.channel])
            .inc();
        QUEUE_DEPTH.with_label_values(&[&self.channel]).dec();
    }

    pub fn inc_backpressure_timeout(&self) {
        BACKPRESSURE_TIMEOUTS_TOTAL
            .with_label_values(&[&self.channel])
            .inc();
    }

    pub fn inc_read(&self) {
        TICKS_READ_TOTAL.with_label_values(&[&self.channel]).inc();
    }

    pub fn inc_duplicate(&self) {
        DUPLICATES_TOTAL.with_label_values(&[&self.channel]).inc();
    }

    pub fn inc_bar_sealed(&self) {
        BARS_SEALED_TOTAL.with_label_values(&[&self.channel]).inc();
    }

    pub fn set_connected(&self, direction: &str, connected: bool) {
        CONNECTED
            .with_label_values(&[&self.channel, direction])
            .set(if connected { 1 } else { 0 });
    }

    pub fn get_written_total(&self) -> u64 {
        TICKS_WRITTEN_TOTAL
            .with_label_values(&[&self.channel])
            .get()
    }

    pub fn get_read_total(&self) -> u64 {
        TICKS_READ_TOTAL.with_label_values(&[&self.channel]).get()
    }

    pub fn get_duplicates_total(&self) -> u64 {
        DUPLICATES_TOTAL.with_label_values(&[&self.channel]).get()
    }
}

pub fn inc_tickfile_records(direction: &str, count: usize) {
    TICKFILE_RECORDS_TOTAL
        .with_label_values(&[direction])
        .inc_by(count as u64);
}

/// Encode all registered metrics in Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    exposition_text(buffer)
}

fn exposition_text(buffer: Vec<u8>) -> Result<String, prometheus::Error> {
    String::from_utf8(buffer)
        .map_err(|e| prometheus::Error::Msg(format!("metrics output is not UTF-8: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_counters() {
        let metrics = ChannelMetrics::new("test-metrics-counters");
        metrics.inc_enqueued();
        metrics.inc_written();
        metrics.inc_read();
        metrics.inc_read();
        metrics.inc_duplicate();

        assert_eq!(metrics.get_written_total(), 1);
        assert_eq!(metrics.get_read_total(), 2);
        assert_eq!(metrics.get_duplicates_total(), 1);
    }

    #[test]
    fn test_non_utf8_exposition_is_an_error() {
        assert_eq!(exposition_text(b"up 1\n".to_vec()).unwrap(), "up 1\n");
        match exposition_text(vec![b'u', 0xff, 0xfe]) {
            Err(prometheus::Error::Msg(msg)) => assert!(msg.contains("UTF-8")),
            other => panic!("expected Msg error, got {:?}", other),
        }
    }

    #[test]
    fn test_encode_metrics_contains_registered_names() {
        let metrics = ChannelMetrics::new("test-metrics-encode");
        metrics.inc_bar_sealed();
        metrics.set_connected("reader", true);
        inc_tickfile_records("read", 3);

        let output = encode_metrics().unwrap();
        assert!(output.contains("tickbridge_bars_sealed_total"));
        assert!(output.contains("tickbridge_channel_connected"));
        assert!(output.contains("tickbridge_tickfile_records_total"));
    }
}
