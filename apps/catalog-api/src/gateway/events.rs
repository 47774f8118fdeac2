//! Wire-format messages pushed to realtime clients.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::models::variant::VariantPayload;

/// A message sent from the server to every client over WebSocket.
///
/// Serialized as `{"type": "<TAG>", ...fields}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboundMessage {
    /// First frame on every connection.
    ConnectionEstablished { message: String },
    /// Heartbeat. `timestamp` is seconds since the connection opened.
    Ping { timestamp: String },
    /// Fresh state of a product variant after a committed change.
    EntityUpdate { payload: VariantPayload },
}

impl OutboundMessage {
    pub fn connection_established() -> Self {
        Self::ConnectionEstablished {
            message: "Connected to realtime updates".to_string(),
        }
    }

    pub fn ping(since_open: Duration) -> Self {
        Self::Ping {
            timestamp: format!("{:.3}", since_open.as_secs_f64()),
        }
    }

    pub fn entity_update(payload: VariantPayload) -> Self {
        Self::EntityUpdate { payload }
    }

    /// The `type` tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectionEstablished { .. } => "CONNECTION_ESTABLISHED",
            Self::Ping { .. } => "PING",
            Self::EntityUpdate { .. } => "ENTITY_UPDATE",
        }
    }

    /// Serialize once into a frame that can be shared by every recipient.
    pub fn encode(&self) -> Result<Arc<str>, serde_json::Error> {
        serde_json::to_string(self).map(Arc::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_established_wire_format() {
        let frame = OutboundMessage::connection_established().encode().unwrap();
        let json: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(json["type"], "CONNECTION_ESTABLISHED");
        assert!(json["message"].as_str().is_some());
    }

    #[test]
    fn ping_carries_timestamp_string() {
        let msg = OutboundMessage::ping(Duration::from_millis(25_000));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "PING");
        assert_eq!(json["timestamp"], "25.000");
        assert_eq!(msg.kind(), "PING");
    }
}
