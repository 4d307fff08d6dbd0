//! Real-time transport seam
//!
//! The signaling engine only talks to a [`Negotiator`], which turns a remote
//! offer into a local answer plus a live [`MediaTransport`]. The production
//! implementation lives in [`rtc`] and is built on str0m.

use async_trait::async_trait;

use crate::codec::SessionDescription;
use crate::error::{NegotiationError, TransportError};
use crate::model::media::{MediaPacket, TrackBinding};

pub mod rtc;

pub use rtc::{RtcNegotiator, RtcTransport};

/// Result of a successful negotiation.
pub struct Negotiated<T> {
    pub answer: SessionDescription,
    pub transport: T,
}

pub trait Negotiator: Send + Sync + 'static {
    type Transport: MediaTransport;

    /// Create a fresh transport session for one viewer, apply `offer` as its
    /// remote description, add an outbound track carrying `binding`'s stream
    /// and return the local answer.
    fn negotiate(
        &self,
        offer: &SessionDescription,
        binding: TrackBinding,
    ) -> Result<Negotiated<Self::Transport>, NegotiationError>;
}

#[async_trait]
pub trait MediaTransport: Send + 'static {
    /// Send one upstream packet to the viewer. Packets for other streams, or
    /// arriving before the track is ready, are ignored.
    fn write(&mut self, packet: &MediaPacket) -> Result<(), TransportError>;

    /// Wait for network input or a transport timer and advance the session.
    /// Must be cancel safe.
    async fn poll(&mut self) -> Result<(), TransportError>;

    fn close(&mut self);
}
