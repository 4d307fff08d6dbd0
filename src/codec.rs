//! Signaling payload codec
//!
//! Session descriptions travel inside protocol packets as base64 encoded JSON,
//! which keeps them free of quoting issues in the outer JSON message.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::CodecError;

/// Browser-shaped session description (`RTCSessionDescriptionInit`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> SessionDescription {
        SessionDescription {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> SessionDescription {
        SessionDescription {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

pub fn encode<T: Serialize>(value: &T) -> Result<String, CodecError> {
    let json = serde_json::to_vec(value)?;
    Ok(STANDARD.encode(json))
}

pub fn decode<T: DeserializeOwned>(input: &str) -> Result<T, CodecError> {
    let bytes = STANDARD
        .decode(input.trim())
        .map_err(|e| CodecError::MalformedPayload(format!("base64: {e}")))?;

    serde_json::from_slice(&bytes).map_err(|e| CodecError::MalformedPayload(format!("json: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::host::AppHost;

    #[test]
    fn description_round_trips() {
        let offer = SessionDescription::offer("v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\n");
        let encoded = encode(&offer).unwrap();

        assert!(encoded.chars().all(|c| c.is_ascii_alphanumeric() || "+/=".contains(c)));
        assert_eq!(decode::<SessionDescription>(&encoded).unwrap(), offer);
    }

    #[test]
    fn request_bodies_round_trip() {
        let host = AppHost::new("10.0.0.7:8080", "Minesweeper");
        assert_eq!(decode::<AppHost>(&encode(&host).unwrap()).unwrap(), host);
    }

    #[test]
    fn decodes_browser_payload() {
        // btoa(JSON.stringify({type: "offer", sdp: "v=0"}))
        let desc: SessionDescription = decode("eyJ0eXBlIjoib2ZmZXIiLCJzZHAiOiJ2PTAifQ==").unwrap();
        assert_eq!(desc, SessionDescription::offer("v=0"));
    }

    #[test]
    fn invalid_base64_is_malformed() {
        let err = decode::<SessionDescription>("%%% not base64").unwrap_err();
        assert!(matches!(err, CodecError::MalformedPayload(_)));
    }

    #[test]
    fn wrong_shape_is_malformed() {
        let encoded = encode(&serde_json::json!({ "kind": "offer" })).unwrap();
        let err = decode::<SessionDescription>(&encoded).unwrap_err();
        assert!(matches!(err, CodecError::MalformedPayload(_)));
    }
}
