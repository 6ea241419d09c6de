//! Per-call usage reporting, pushed off the request path.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

/// One record per model-client call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub latency_ms: u64,
}

/// Receives usage records. Implementations must not block: the request path
/// calls `record` inline.
pub trait UsageSink: Send + Sync {
    fn record(&self, record: UsageRecord);
}

/// Drops everything; the default when no collector is wired up.
pub struct NoopUsageSink;

impl UsageSink for NoopUsageSink {
    fn record(&self, _record: UsageRecord) {}
}

/// Pushes records into an unbounded channel for an out-of-band consumer.
/// A lagging (or dropped) consumer never slows a request down.
pub struct ChannelUsageSink {
    tx: mpsc::UnboundedSender<UsageRecord>,
}

impl ChannelUsageSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<UsageRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl UsageSink for ChannelUsageSink {
    fn record(&self, record: UsageRecord) {
        if self.tx.send(record).is_err() {
            debug!("usage consumer gone, dropping record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_sink_delivers_records() {
        let (sink, mut rx) = ChannelUsageSink::new();
        sink.record(UsageRecord {
            model: "test".into(),
            prompt_tokens: 10,
            completion_tokens: 2,
            latency_ms: 5,
        });
        let record = rx.recv().await.unwrap();
        assert_eq!(record.prompt_tokens, 10);
    }

    #[test]
    fn dropped_consumer_does_not_panic() {
        let (sink, rx) = ChannelUsageSink::new();
        drop(rx);
        sink.record(UsageRecord {
            model: "test".into(),
            prompt_tokens: 1,
            completion_tokens: 1,
            latency_ms: 1,
        });
    }
}
