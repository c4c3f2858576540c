//! Control-bus wire protocol for distributed builds.
//!
//! Messages are self-describing JSON with a `type` tag, so both bus
//! dialects (raw sockets and the queue broker) share one encoding.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A control message between the manager and a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BusMessage {
    /// Worker announces itself and asks for work.
    Ready { worker_id: String, num_workers: usize },
    /// Manager hands a worker one chunk of a builder description.
    Chunk {
        index: usize,
        total: usize,
        builder: Value,
    },
    /// Manager releases a worker: no work remains.
    Exit,
    /// Worker liveness signal while a chunk is running.
    Heartbeat { worker_id: String },
    /// Worker finished its chunk successfully.
    Done { worker_id: String, index: usize },
    /// Worker failed its chunk.
    Failed {
        worker_id: String,
        index: usize,
        error: String,
    },
}

impl BusMessage {
    /// The worker that sent this message, when the type carries one.
    #[must_use]
    pub fn worker_id(&self) -> Option<&str> {
        match self {
            Self::Ready { worker_id, .. }
            | Self::Heartbeat { worker_id }
            | Self::Done { worker_id, .. }
            | Self::Failed { worker_id, .. } => Some(worker_id),
            Self::Chunk { .. } | Self::Exit => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn messages_carry_a_type_tag() {
        let msg = BusMessage::Ready {
            worker_id: "w1".into(),
            num_workers: 2,
        };
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], json!("READY"));
        assert_eq!(v["worker_id"], json!("w1"));
    }

    #[test]
    fn chunk_roundtrip() {
        let msg = BusMessage::Chunk {
            index: 1,
            total: 3,
            builder: json!({"type": "copy", "chunk_size": 10}),
        };
        let s = serde_json::to_string(&msg).unwrap();
        let back: BusMessage = serde_json::from_str(&s).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn exit_is_bare() {
        let s = serde_json::to_string(&BusMessage::Exit).unwrap();
        assert_eq!(s, r#"{"type":"EXIT"}"#);
    }

    #[test]
    fn unknown_type_is_rejected() {
        let res: Result<BusMessage, _> =
            serde_json::from_str(r#"{"type":"BOGUS"}"#);
        assert!(res.is_err());
    }
}
