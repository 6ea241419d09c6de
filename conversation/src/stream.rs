//! Stream-event plumbing: ordered delivery with exactly one terminal event.

use futures::Stream;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use corpora_models::conversation::TokenUsage;
use corpora_models::events::StreamEvent;

/// Wraps the event channel and enforces the per-message protocol: events go
/// out in emission order and nothing follows the terminal event.
pub struct EventEmitter {
    tx: mpsc::Sender<StreamEvent>,
    message_id: Uuid,
    terminated: bool,
}

impl EventEmitter {
    pub fn new(tx: mpsc::Sender<StreamEvent>, message_id: Uuid) -> Self {
        Self {
            tx,
            message_id,
            terminated: false,
        }
    }

    pub fn message_id(&self) -> Uuid {
        self.message_id
    }

    /// Send one event; returns false when the consumer is gone.
    async fn send(&mut self, event: StreamEvent) -> bool {
        if self.terminated {
            return false;
        }
        if event.is_terminal() {
            self.terminated = true;
        }
        self.tx.send(event).await.is_ok()
    }

    pub async fn text(&mut self, delta: impl Into<String>) -> bool {
        let event = StreamEvent::Text {
            message_id: self.message_id,
            delta: delta.into(),
        };
        self.send(event).await
    }

    pub async fn knowledge(&mut self, content: serde_json::Value) -> bool {
        let event = StreamEvent::Knowledge {
            message_id: self.message_id,
            content,
        };
        self.send(event).await
    }

    pub async fn tool_call(&mut self, name: impl Into<String>, arguments: serde_json::Value) -> bool {
        let event = StreamEvent::ToolCall {
            message_id: self.message_id,
            name: name.into(),
            arguments,
        };
        self.send(event).await
    }

    pub async fn error(&mut self, kind: &str, message: impl Into<String>, is_final: bool) -> bool {
        let event = StreamEvent::Error {
            message_id: Some(self.message_id),
            kind: kind.to_string(),
            message: message.into(),
            is_final,
        };
        self.send(event).await
    }

    pub async fn done(&mut self, usage: Option<TokenUsage>, cancelled: bool) -> bool {
        let event = StreamEvent::Done {
            message_id: self.message_id,
            usage,
            cancelled,
        };
        let delivered = self.send(event).await;
        if !delivered {
            debug!(message_id = %self.message_id, "terminal event not delivered");
        }
        delivered
    }
}

/// Adapt the receiver into a `Stream` for transports that forward events as
/// line-delimited records.
pub fn event_stream(mut rx: mpsc::Receiver<StreamEvent>) -> impl Stream<Item = StreamEvent> {
    async_stream::stream! {
        while let Some(event) = rx.recv().await {
            let terminal = event.is_terminal();
            yield event;
            if terminal {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn nothing_follows_the_terminal_event() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut emitter = EventEmitter::new(tx, Uuid::new_v4());

        assert!(emitter.text("hello").await);
        assert!(emitter.done(None, false).await);
        assert!(!emitter.text("late").await);

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, StreamEvent::Text { .. }));
        let second = rx.recv().await.unwrap();
        assert!(second.is_terminal());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn final_error_terminates() {
        let (tx, _rx) = mpsc::channel(16);
        let mut emitter = EventEmitter::new(tx, Uuid::new_v4());
        assert!(emitter.error("transient", "retrying", false).await);
        assert!(emitter.error("dependency_failure", "llm gone", true).await);
        assert!(!emitter.done(None, false).await);
    }

    #[tokio::test]
    async fn stream_adapter_stops_at_terminal() {
        let (tx, rx) = mpsc::channel(16);
        let mut emitter = EventEmitter::new(tx, Uuid::new_v4());
        emitter.text("a").await;
        emitter.done(None, false).await;

        let events: Vec<StreamEvent> = event_stream(rx).collect().await;
        assert_eq!(events.len(), 2);
        assert!(events.last().unwrap().is_terminal());
    }
}
