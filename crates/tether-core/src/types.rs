use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;

/// Listener family a channel message is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Application traffic.
    Message,
    /// Traffic produced by the channel machinery itself.
    Internal,
}

/// Envelope carried by every transport variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMessage {
    /// Strictly increasing micro-timestamp from the posting transport's clock.
    pub time: u64,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Opaque payload.
    pub data: Value,
}

impl ChannelMessage {
    pub fn new(time: u64, kind: MessageKind, data: Value) -> Self {
        Self { time, kind, data }
    }

    /// Encodes the envelope as JSON text.
    pub fn to_json(&self) -> Result<String, CoreError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes an envelope from JSON text.
    pub fn from_json(text: &str) -> Result<Self, CoreError> {
        Ok(serde_json::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{ChannelMessage, MessageKind};

    #[test]
    fn wire_shape_uses_type_field() {
        let msg = ChannelMessage::new(1_000_001, MessageKind::Internal, json!({"a": 1}));
        let value = serde_json::to_value(&msg).expect("message should encode");
        assert_eq!(
            value,
            json!({"time": 1_000_001, "type": "internal", "data": {"a": 1}})
        );
    }

    #[test]
    fn from_json_rejects_unknown_kind() {
        let err = ChannelMessage::from_json(r#"{"time":1,"type":"bogus","data":null}"#);
        assert!(err.is_err());
        let ok = ChannelMessage::from_json(r#"{"time":1,"type":"message","data":null}"#)
            .expect("valid envelope should decode");
        assert_eq!(ok.kind, MessageKind::Message);
    }
}
