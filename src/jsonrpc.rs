//! JSON-RPC envelope handling
//!
//! The bridge never interprets payloads. It only peeks at the envelope
//! (`id`, `method`, `error`) to pair requests with responses for latency
//! metrics, and it builds the one message it originates itself: the
//! restart notification.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

/// Method of the out-of-band notification sent after a successful restart
pub const RESTARTED_METHOD: &str = "$/bridge/restarted";

// ============================================================================
// Outgoing Notifications
// ============================================================================

/// A JSON-RPC notification (no `id`)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonRpcNotification<P> {
    pub jsonrpc: String,
    pub method: String,
    pub params: P,
}

impl<P: Serialize> JsonRpcNotification<P> {
    pub fn new(method: impl Into<String>, params: P) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }

    /// Serialize to a single line without a terminator
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Parameters of `$/bridge/restarted`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartedParams {
    /// Why the previous process ended, e.g. `Exit code 1`
    pub reason: String,
    /// Restarts performed so far in this session
    pub restart_count: u32,
}

/// Build the restart notification sent to the client
pub fn restarted_notification(
    reason: impl Into<String>,
    restart_count: u32,
) -> JsonRpcNotification<RestartedParams> {
    JsonRpcNotification::new(
        RESTARTED_METHOD,
        RestartedParams {
            reason: reason.into(),
            restart_count,
        },
    )
}

// ============================================================================
// Envelope Peeking
// ============================================================================

/// Request id in canonical JSON form, so `1` and `"1"` stay distinct
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(String);

impl RequestId {
    fn from_value(value: &Value) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a single message is, judged from its envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    Request { id: RequestId, method: String },
    Notification { method: String },
    Response { id: RequestId, is_error: bool },
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    error: Option<Value>,
}

/// Classify one message body.
///
/// Returns `None` for anything that is not a single JSON-RPC object
/// (batches, malformed lines, bare values).
pub fn classify(body: &[u8]) -> Option<MessageKind> {
    let envelope: Envelope = serde_json::from_slice(body).ok()?;
    match (envelope.id, envelope.method) {
        (Some(id), Some(method)) => Some(MessageKind::Request {
            id: RequestId::from_value(&id),
            method,
        }),
        (None, Some(method)) => Some(MessageKind::Notification { method }),
        (Some(id), None) => Some(MessageKind::Response {
            id: RequestId::from_value(&id),
            is_error: envelope.error.is_some(),
        }),
        (None, None) => None,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restarted_notification_wire_format() {
        let line = restarted_notification("Exit code 1", 1).to_line().unwrap();
        assert_eq!(
            line,
            r#"{"jsonrpc":"2.0","method":"$/bridge/restarted","params":{"reason":"Exit code 1","restartCount":1}}"#
        );
    }

    #[test]
    fn test_classify_messages() {
        assert_eq!(
            classify(br#"{"jsonrpc":"2.0","id":7,"method":"tools/list"}"#),
            Some(MessageKind::Request {
                id: RequestId("7".to_string()),
                method: "tools/list".to_string()
            })
        );
        assert_eq!(
            classify(br#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#),
            Some(MessageKind::Notification {
                method: "notifications/initialized".to_string()
            })
        );
        assert_eq!(
            classify(br#"{"jsonrpc":"2.0","id":"a","result":{}}"#),
            Some(MessageKind::Response {
                id: RequestId("\"a\"".to_string()),
                is_error: false
            })
        );
        assert_eq!(
            classify(br#"{"jsonrpc":"2.0","id":7,"error":{"code":-32601,"message":"x"}}"#),
            Some(MessageKind::Response {
                id: RequestId("7".to_string()),
                is_error: true
            })
        );
    }

    #[test]
    fn test_classify_rejects_non_messages() {
        assert_eq!(classify(b"not json"), None);
        assert_eq!(classify(br#"[{"id":1,"method":"a"}]"#), None);
        assert_eq!(classify(br#"{"jsonrpc":"2.0"}"#), None);
        // A null id is treated like an absent one
        assert_eq!(
            classify(br#"{"id":null,"method":"m"}"#),
            Some(MessageKind::Notification {
                method: "m".to_string()
            })
        );
    }

    #[test]
    fn test_numeric_and_string_ids_differ() {
        let MessageKind::Response { id: numeric, .. } = classify(br#"{"id":1,"result":1}"#).unwrap()
        else {
            panic!("expected response");
        };
        let MessageKind::Response { id: string, .. } = classify(br#"{"id":"1","result":1}"#).unwrap()
        else {
            panic!("expected response");
        };
        assert_ne!(numeric, string);
    }
}
