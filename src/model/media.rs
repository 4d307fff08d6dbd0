//! Upstream media
//!
//! A [`MediaPacket`] is one encoded video frame as produced by the application
//! host. The fan-out shares it between viewers behind an `Arc`.

use std::fmt;
use std::time::Instant;

use bytes::Bytes;

/// Identifier the upstream encoder stamps on every packet of a stream (the
/// RTP SSRC). Viewer tracks are bound to exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(pub u32);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaPacket {
    pub stream_id: StreamId,
    /// Presentation time in 90kHz units.
    pub rtp_time: u64,
    /// When the relay received the last fragment of the frame.
    pub received_at: Instant,
    pub payload: Bytes,
}

impl MediaPacket {
    pub fn new(stream_id: StreamId, rtp_time: u64, payload: impl Into<Bytes>) -> MediaPacket {
        MediaPacket {
            stream_id,
            rtp_time,
            received_at: Instant::now(),
            payload: payload.into(),
        }
    }
}

/// Which upstream stream a viewer's outbound track carries.
///
/// Passed explicitly into every negotiation so a relay may bind all viewers to
/// one shared stream, or each viewer group to its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackBinding {
    pub stream_id: StreamId,
}

impl TrackBinding {
    pub fn new(stream_id: StreamId) -> TrackBinding {
        TrackBinding { stream_id }
    }

    pub fn carries(&self, packet: &MediaPacket) -> bool {
        packet.stream_id == self.stream_id
    }
}
