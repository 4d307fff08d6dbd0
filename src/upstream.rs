//! Upstream application plumbing
//!
//! The application's encoder sends VP8 over RTP to a local UDP port.
//! [`RtpIngest`] reassembles that into whole frames for the fan-out, and
//! [`InputForwarder`] sends viewer input back to the application.

use std::net::SocketAddr;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use serde_json::json;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use webrtc::rtp::codecs::vp8::Vp8Packet;
use webrtc::rtp::packet::Packet;
use webrtc::rtp::packetizer::Depacketizer;
use webrtc::util::marshal::Unmarshal;

use crate::error::IngestError;
use crate::model::media::{MediaPacket, StreamId};
use crate::session::ViewerEvent;

/// Parse one upstream datagram as an RTP packet.
pub fn parse_rtp(buf: &[u8]) -> Result<Packet, IngestError> {
    let mut raw = buf;
    Packet::unmarshal(&mut raw).map_err(|e| IngestError::Packet(e.to_string()))
}

/// Rebuilds frames from RTP packets of one stream. Frames with a sequence gap
/// are discarded rather than forwarded damaged.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    vp8: Vp8Packet,
    frame: BytesMut,
    timestamp: Option<u32>,
    next_sequence: Option<u16>,
    damaged: bool,
    last_timestamp: Option<u32>,
    rollovers: u64,
}

impl FrameAssembler {
    pub fn new() -> FrameAssembler {
        FrameAssembler::default()
    }

    /// Feed one packet. Returns the extended timestamp and frame bytes when
    /// the packet completes a frame.
    pub fn push(&mut self, packet: &Packet) -> Result<Option<(u64, Bytes)>, IngestError> {
        let header = &packet.header;
        let data = self
            .vp8
            .depacketize(&packet.payload)
            .map_err(|e| IngestError::Payload(e.to_string()))?;
        // S bit on partition 0 opens a new frame.
        let start = self.vp8.s == 1 && self.vp8.pid == 0;

        let in_order = self
            .next_sequence
            .map_or(true, |n| n == header.sequence_number);
        self.next_sequence = Some(header.sequence_number.wrapping_add(1));

        if start {
            self.frame.clear();
            self.timestamp = Some(header.timestamp);
            self.damaged = false;
        } else if !in_order || self.timestamp != Some(header.timestamp) {
            self.damaged = true;
        }

        if !self.damaged {
            self.frame.extend_from_slice(&data);
        }

        if !header.marker {
            return Ok(None);
        }

        let complete = !self.damaged && self.timestamp.is_some();
        self.timestamp = None;
        if !complete {
            self.frame.clear();
            trace!("Discarding damaged frame at {}", header.timestamp);
            return Ok(None);
        }

        let frame = self.frame.split().freeze();
        Ok(Some((self.extend(header.timestamp), frame)))
    }

    fn extend(&mut self, timestamp: u32) -> u64 {
        if let Some(last) = self.last_timestamp {
            if timestamp < last && last - timestamp > u32::MAX / 2 {
                self.rollovers += 1;
            }
        }
        self.last_timestamp = Some(timestamp);
        (self.rollovers << 32) | timestamp as u64
    }
}

pub struct RtpIngest {
    socket: UdpSocket,
}

impl RtpIngest {
    pub async fn bind(addr: SocketAddr) -> std::io::Result<RtpIngest> {
        let socket = UdpSocket::bind(addr).await?;
        info!("Listening for upstream RTP on {}", socket.local_addr()?);
        Ok(RtpIngest { socket })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receive until `frames` is closed or the socket fails.
    pub async fn run(self, frames: mpsc::Sender<MediaPacket>) -> std::io::Result<()> {
        let mut buf = vec![0; 2000];
        let mut assembler = FrameAssembler::new();

        loop {
            let n = self.socket.recv(&mut buf).await?;

            let packet = match parse_rtp(&buf[..n]) {
                Ok(packet) => packet,
                Err(e) => {
                    debug!("Skipping upstream datagram: {e}");
                    continue;
                }
            };
            let ssrc = packet.header.ssrc;

            let frame = match assembler.push(&packet) {
                Ok(Some(frame)) => frame,
                Ok(None) => continue,
                Err(e) => {
                    debug!("Skipping upstream packet: {e}");
                    continue;
                }
            };

            let (rtp_time, payload) = frame;
            let media = MediaPacket {
                stream_id: StreamId(ssrc),
                rtp_time,
                received_at: Instant::now(),
                payload,
            };

            if frames.send(media).await.is_err() {
                info!("Upstream consumer gone, ingest stopped");
                return Ok(());
            }
        }
    }
}

/// Sends viewer input to the application as JSON datagrams.
pub struct InputForwarder {
    socket: UdpSocket,
    target: SocketAddr,
}

impl InputForwarder {
    pub async fn connect(target: SocketAddr) -> std::io::Result<InputForwarder> {
        let bind: SocketAddr = if target.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(bind).await?;
        Ok(InputForwarder { socket, target })
    }

    pub async fn run(self, mut events: mpsc::Receiver<ViewerEvent>) {
        while let Some(event) = events.recv().await {
            let message = json!({
                "session": event.session,
                "type": event.packet.kind,
                "data": event.packet.data,
            });

            if let Err(e) = self.socket.send_to(message.to_string().as_bytes(), self.target).await {
                warn!("Forwarding input to {} failed: {e}", self.target);
            }
        }
    }
}
