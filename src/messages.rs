//! Node ↔ hub wire protocol.
//!
//! All frames are JSON text over the websocket, discriminated by a `type`
//! tag. The agent opens the socket and speaks first with `register`; after
//! that the hub drives `ping` and `rpc_request`, the node answers with
//! `pong` and `rpc_response`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    /// First frame from a node after opening the socket.
    Register {
        wallet: String,
        #[serde(rename = "displayName", default)]
        display_name: String,
        timestamp: i64,
        signature: String,
        /// Region detected by the node at startup, for dashboards.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        region: Option<String>,
    },

    /// Hub accepted the node and it is eligible for routed traffic.
    Registered {
        wallet: String,
        #[serde(rename = "bondAmount")]
        bond_amount: f64,
    },

    /// Wallet is not bonded/active on-chain. Socket stays open but the node
    /// receives no routed traffic.
    NotRegistered { reason: String },

    /// Auth failure. The hub closes the socket after sending this.
    AuthFailed { reason: String },

    Ping,
    Pong,

    /// Routed RPC call forwarded to a node.
    RpcRequest { id: String, payload: Value },

    /// Node's answer to a routed call. Exactly one of `result`/`error` is
    /// set. `cached` reports whether the node's local cache served it.
    RpcResponse {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<Value>,
        #[serde(rename = "latencyMs", default)]
        latency_ms: u64,
        #[serde(default)]
        cached: bool,
    },
}

impl WireMessage {
    pub fn to_json(&self) -> String {
        // WireMessage contains only serializable fields; failure here would
        // be a programming error, so fall back to an empty object.
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_register_frame_roundtrip() {
        let msg = WireMessage::Register {
            wallet: "wallet1".to_string(),
            display_name: "node-a".to_string(),
            timestamp: 1700000000,
            signature: "ab".repeat(64),
            region: None,
        };
        let text = msg.to_json();
        assert!(text.contains("\"type\":\"register\""));
        assert!(text.contains("displayName"));

        match WireMessage::from_json(&text).unwrap() {
            WireMessage::Register { wallet, .. } => assert_eq!(wallet, "wallet1"),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_rpc_response_optional_fields() {
        let text = r#"{"type":"rpc_response","id":"abc","result":{"ok":true},"latencyMs":12}"#;
        match WireMessage::from_json(text).unwrap() {
            WireMessage::RpcResponse { id, result, error, latency_ms, cached } => {
                assert_eq!(id, "abc");
                assert_eq!(result, Some(json!({"ok": true})));
                assert!(error.is_none());
                assert_eq!(latency_ms, 12);
                assert!(!cached);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_is_error() {
        assert!(WireMessage::from_json(r#"{"type":"bogus"}"#).is_err());
    }
}
