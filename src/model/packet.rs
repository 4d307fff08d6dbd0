//! Viewer protocol packets
//!
//! Every websocket text message between a viewer and the relay is one JSON
//! encoded [`ProtocolPacket`]. The `type` tag is the only thing used to route
//! a packet.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CodecError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PacketType {
    Offer,
    Answer,
    Chat,
    Error,
    Heartbeat,
    /// Input or output events opaque to the relay.
    Other(String),
}

impl From<String> for PacketType {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "OFFER" => PacketType::Offer,
            "ANSWER" => PacketType::Answer,
            "CHAT" => PacketType::Chat,
            "ERROR" => PacketType::Error,
            "HEARTBEAT" => PacketType::Heartbeat,
            _ => PacketType::Other(tag),
        }
    }
}

impl From<PacketType> for String {
    fn from(kind: PacketType) -> Self {
        match kind {
            PacketType::Other(tag) => tag,
            known => known.as_str().to_string(),
        }
    }
}

impl PacketType {
    pub fn as_str(&self) -> &str {
        match self {
            PacketType::Offer => "OFFER",
            PacketType::Answer => "ANSWER",
            PacketType::Chat => "CHAT",
            PacketType::Error => "ERROR",
            PacketType::Heartbeat => "HEARTBEAT",
            PacketType::Other(tag) => tag,
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolPacket {
    #[serde(rename = "type")]
    pub kind: PacketType,
    #[serde(default)]
    pub data: String,
}

impl ProtocolPacket {
    pub fn new(kind: PacketType, data: impl Into<String>) -> ProtocolPacket {
        ProtocolPacket {
            kind,
            data: data.into(),
        }
    }

    pub fn answer(encoded: String) -> ProtocolPacket {
        ProtocolPacket::new(PacketType::Answer, encoded)
    }

    pub fn error(message: impl fmt::Display) -> ProtocolPacket {
        ProtocolPacket::new(PacketType::Error, message.to_string())
    }

    pub fn heartbeat() -> ProtocolPacket {
        ProtocolPacket::new(PacketType::Heartbeat, "")
    }

    /// Parse one websocket text message.
    pub fn from_text(text: &str) -> Result<ProtocolPacket, CodecError> {
        serde_json::from_str(text).map_err(|e| CodecError::MalformedPayload(e.to_string()))
    }

    pub fn to_text(&self) -> Result<String, CodecError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_tags_map_to_variants() {
        let packet = ProtocolPacket::from_text(r#"{"type":"OFFER","data":"abc"}"#).unwrap();
        assert_eq!(packet.kind, PacketType::Offer);
        assert_eq!(packet.data, "abc");
    }

    #[test]
    fn unknown_tags_are_kept_verbatim() {
        let packet = ProtocolPacket::from_text(r#"{"type":"KEYDOWN","data":"65"}"#).unwrap();
        assert_eq!(packet.kind, PacketType::Other("KEYDOWN".into()));

        let text = packet.to_text().unwrap();
        assert_eq!(text, r#"{"type":"KEYDOWN","data":"65"}"#);
    }

    #[test]
    fn missing_data_defaults_to_empty() {
        let packet = ProtocolPacket::from_text(r#"{"type":"HEARTBEAT"}"#).unwrap();
        assert_eq!(packet, ProtocolPacket::heartbeat());
    }

    #[test]
    fn garbage_is_malformed() {
        let err = ProtocolPacket::from_text("not json").unwrap_err();
        assert!(matches!(err, CodecError::MalformedPayload(_)));
    }
}
