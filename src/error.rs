//! Error types for the relay
//!
//! Each concern owns its own error enum so a failure can be handled by the
//! task that caused it. Only the binary collapses them into `anyhow`.

use thiserror::Error;

use crate::model::session::{SessionId, SignalingState};

/// Failures of the signaling payload codec.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("payload could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Failures talking to the directory service.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("directory unavailable: {0}")]
    DirectoryUnavailable(#[from] reqwest::Error),
}

/// Failures building or driving a viewer's real-time transport session.
#[derive(Error, Debug)]
pub enum NegotiationError {
    #[error("could not create transport session: {0}")]
    Transport(String),

    #[error("remote description rejected: {0}")]
    Description(String),
}

/// Outcome of an offer the signaling engine refused.
#[derive(Error, Debug)]
pub enum SignalingError {
    #[error(transparent)]
    MalformedOffer(#[from] CodecError),

    #[error("expected an offer, received {0}")]
    UnexpectedDescription(String),

    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    #[error("session already negotiated")]
    AlreadyNegotiated,

    #[error("negotiation closed")]
    NegotiationClosed,
}

impl SignalingError {
    /// State the engine is left in after this error.
    pub fn next_state(&self) -> SignalingState {
        match self {
            SignalingError::AlreadyNegotiated => SignalingState::Established,
            _ => SignalingState::Closed,
        }
    }
}

/// Failures on a viewer's protocol channel or media transport.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,

    #[error("read failed: {0}")]
    Read(String),

    #[error("write failed: {0}")]
    Write(String),

    #[error("rtc: {0}")]
    Rtc(#[from] str0m::RtcError),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("session {0} already registered")]
    DuplicateId(SessionId),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Upstream datagrams that could not be turned into media.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum IngestError {
    #[error("bad RTP packet: {0}")]
    Packet(String),

    #[error("bad VP8 payload: {0}")]
    Payload(String),
}
