use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::conversation::TokenUsage;

/// Typed events delivered over a message stream.
///
/// Every consumer pattern-matches on `type`; the transport writes each event
/// as one line-delimited JSON record. Events for a single message are strictly
/// ordered and terminated by exactly one `Done` or one final `Error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Incremental answer text.
    Text { message_id: Uuid, delta: String },

    /// A tool invocation surfaced mid-stream.
    ToolCall {
        message_id: Uuid,
        name: String,
        arguments: serde_json::Value,
    },

    /// Retrieved source passages attached to the answer.
    Knowledge {
        message_id: Uuid,
        content: serde_json::Value,
    },

    Error {
        message_id: Option<Uuid>,
        kind: String,
        message: String,
        /// True when no further events will follow.
        #[serde(rename = "final")]
        is_final: bool,
    },

    /// Terminal event for a successfully (or partially) delivered message.
    Done {
        message_id: Uuid,
        usage: Option<TokenUsage>,
        #[serde(default)]
        cancelled: bool,
    },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamEvent::Done { .. } | StreamEvent::Error { is_final: true, .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_type_tag() {
        let id = Uuid::new_v4();
        let event = StreamEvent::Text {
            message_id: id,
            delta: "Par".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "text");
        assert_eq!(json["delta"], "Par");
    }

    #[test]
    fn final_error_is_terminal() {
        let err = StreamEvent::Error {
            message_id: None,
            kind: "dependency_failure".into(),
            message: "llm unavailable".into(),
            is_final: true,
        };
        assert!(err.is_terminal());
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["final"], true);

        let non_final = StreamEvent::Error {
            message_id: None,
            kind: "transient".into(),
            message: "retrying".into(),
            is_final: false,
        };
        assert!(!non_final.is_terminal());
    }

    #[test]
    fn done_round_trips() {
        let done = StreamEvent::Done {
            message_id: Uuid::new_v4(),
            usage: Some(TokenUsage {
                prompt_tokens: 100,
                completion_tokens: 42,
            }),
            cancelled: false,
        };
        let json = serde_json::to_string(&done).unwrap();
        let back: StreamEvent = serde_json::from_str(&json).unwrap();
        assert!(back.is_terminal());
    }
}
