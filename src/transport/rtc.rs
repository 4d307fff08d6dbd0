//! str0m backed viewer transport
//!
//! Each viewer gets its own `Rtc` instance and UDP socket. str0m is sans-IO:
//! [`RtcTransport`] owns the socket and drives the `Rtc` forward from network
//! input, its own timeouts, and the upstream frames written to it.

use std::net::{IpAddr, SocketAddr, UdpSocket as StdUdpSocket};
use std::time::Instant;

use async_trait::async_trait;
use str0m::change::SdpOffer;
use str0m::format::Codec;
use str0m::media::{Frequency, MediaKind, MediaTime, Mid};
use str0m::net::{Protocol, Receive};
use str0m::{Event, IceConnectionState, Input, Output, Rtc};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use super::{MediaTransport, Negotiated, Negotiator};
use crate::codec::{SdpType, SessionDescription};
use crate::error::{NegotiationError, TransportError};
use crate::model::media::{MediaPacket, TrackBinding};
use crate::util::host_candidates;

/// Negotiates one str0m session per viewer.
#[derive(Debug, Clone)]
pub struct RtcNegotiator {
    host_addr: IpAddr,
    public_ip: Option<IpAddr>,
}

impl RtcNegotiator {
    pub fn new(host_addr: IpAddr, public_ip: Option<IpAddr>) -> RtcNegotiator {
        RtcNegotiator {
            host_addr,
            public_ip,
        }
    }

    fn bind(&self) -> Result<(StdUdpSocket, SocketAddr), std::io::Error> {
        let socket = StdUdpSocket::bind(SocketAddr::new(self.host_addr, 0))?;
        socket.set_nonblocking(true)?;
        let addr = socket.local_addr()?;
        Ok((socket, addr))
    }
}

impl Negotiator for RtcNegotiator {
    type Transport = RtcTransport;

    fn negotiate(
        &self,
        offer: &SessionDescription,
        binding: TrackBinding,
    ) -> Result<Negotiated<RtcTransport>, NegotiationError> {
        let (socket, addr) = self
            .bind()
            .map_err(|e| NegotiationError::Transport(format!("binding UDP socket: {e}")))?;

        let mut rtc = Rtc::builder().build();
        for candidate in host_candidates(addr, self.public_ip) {
            rtc.add_local_candidate(candidate);
        }

        // Both sides use the browser's {type, sdp} JSON shape.
        let offer: SdpOffer = serde_json::to_value(offer)
            .and_then(serde_json::from_value)
            .map_err(|e| NegotiationError::Description(format!("unreadable offer: {e}")))?;

        let answer = rtc
            .sdp_api()
            .accept_offer(offer)
            .map_err(|e| NegotiationError::Description(e.to_string()))?;

        let answer: SessionDescription = serde_json::to_value(&answer)
            .and_then(serde_json::from_value)
            .map_err(|e| NegotiationError::Description(format!("unreadable answer: {e}")))?;

        if answer.kind != SdpType::Answer {
            return Err(NegotiationError::Description(format!(
                "local description is {:?}, not an answer",
                answer.kind
            )));
        }

        let socket = UdpSocket::from_std(socket)
            .map_err(|e| NegotiationError::Transport(format!("registering UDP socket: {e}")))?;

        info!(%addr, stream = %binding.stream_id, "Transport session bound");

        Ok(Negotiated {
            answer,
            transport: RtcTransport::new(rtc, socket, addr, binding),
        })
    }
}

pub struct RtcTransport {
    rtc: Rtc,
    socket: UdpSocket,
    local_addr: SocketAddr,
    binding: TrackBinding,
    video_mid: Option<Mid>,
    next_timeout: Instant,
    buf: Vec<u8>,
}

impl RtcTransport {
    fn new(rtc: Rtc, socket: UdpSocket, local_addr: SocketAddr, binding: TrackBinding) -> Self {
        RtcTransport {
            rtc,
            socket,
            local_addr,
            binding,
            video_mid: None,
            next_timeout: Instant::now(),
            buf: vec![0; 2000],
        }
    }

    /// Poll all the output from the rtc until it returns a timeout, sending
    /// datagrams as they are produced.
    fn drain_output(&mut self) -> Result<(), TransportError> {
        loop {
            if !self.rtc.is_alive() {
                return Err(TransportError::Closed);
            }

            match self.rtc.poll_output()? {
                Output::Timeout(t) => {
                    self.next_timeout = t;
                    return Ok(());
                }
                Output::Transmit(transmit) => {
                    if let Err(e) = self
                        .socket
                        .try_send_to(&transmit.contents, transmit.destination)
                    {
                        // Same as a loss on the wire, congestion control copes.
                        debug!("Dropped datagram to {}: {e}", transmit.destination);
                    }
                }
                Output::Event(event) => self.handle_event(event),
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::IceConnectionStateChange(state) => {
                info!(local = %self.local_addr, "ICE state = {:?}", state);
                if state == IceConnectionState::Disconnected {
                    self.rtc.disconnect();
                }
            }
            Event::MediaAdded(added) => {
                if added.kind == MediaKind::Video && self.video_mid.is_none() {
                    debug!("Outbound video track on mid {:?}", added.mid);
                    self.video_mid = Some(added.mid);
                }
            }
            Event::KeyframeRequest(req) => {
                // The upstream encoder runs on a fixed keyframe interval.
                debug!("Viewer requested keyframe: {:?}", req.kind);
            }
            _ => {}
        }
    }
}

#[async_trait]
impl MediaTransport for RtcTransport {
    fn write(&mut self, packet: &MediaPacket) -> Result<(), TransportError> {
        if !self.binding.carries(packet) {
            return Ok(());
        }
        let Some(mid) = self.video_mid else {
            return Ok(());
        };
        let Some(writer) = self.rtc.writer(mid) else {
            return Ok(());
        };
        let Some(pt) = writer
            .payload_params()
            .find(|p| p.spec().codec == Codec::Vp8)
            .map(|p| p.pt())
        else {
            warn!("Viewer did not offer VP8, dropping frame");
            return Ok(());
        };

        let time = MediaTime::new(packet.rtp_time, Frequency::NINETY_KHZ);
        writer.write(pt, packet.received_at, time, packet.payload.to_vec())?;

        self.drain_output()
    }

    async fn poll(&mut self) -> Result<(), TransportError> {
        let deadline = tokio::time::Instant::from_std(self.next_timeout);

        let received = tokio::select! {
            received = self.socket.recv_from(&mut self.buf) => Some(received?),
            _ = tokio::time::sleep_until(deadline) => None,
        };

        let now = Instant::now();
        let input = match received {
            Some((n, source)) => {
                // STUN, DTLS and RTP share the port; anything else is noise.
                let Ok(contents) = self.buf[..n].try_into() else {
                    return Ok(());
                };
                Input::Receive(
                    now,
                    Receive {
                        proto: Protocol::Udp,
                        source,
                        destination: self.local_addr,
                        contents,
                    },
                )
            }
            None => Input::Timeout(now),
        };

        self.rtc.handle_input(input)?;
        self.drain_output()
    }

    fn close(&mut self) {
        if self.rtc.is_alive() {
            self.rtc.disconnect();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, UdpSocket as StdUdpSocket};
    use std::time::Duration;

    use str0m::change::{SdpAnswer, SdpPendingOffer};
    use str0m::media::Direction;
    use str0m::Candidate;

    use super::*;
    use crate::model::media::StreamId;

    const STREAM: StreamId = StreamId(42);

    // Key frame tag, start code, 320x240.
    const KEYFRAME: [u8; 10] = [0x50, 0x02, 0x00, 0x9d, 0x01, 0x2a, 0x40, 0x01, 0xf0, 0x00];

    /// Receive-only peer playing the browser, driven by hand.
    struct Browser {
        rtc: Rtc,
        socket: StdUdpSocket,
        local_addr: SocketAddr,
        frames: usize,
        buf: Vec<u8>,
    }

    impl Browser {
        fn new() -> Browser {
            let socket = StdUdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
            socket.set_nonblocking(true).unwrap();
            let local_addr = socket.local_addr().unwrap();

            let mut rtc = Rtc::builder().build();
            rtc.add_local_candidate(Candidate::host(local_addr, Protocol::Udp).unwrap());

            Browser {
                rtc,
                socket,
                local_addr,
                frames: 0,
                buf: vec![0; 2000],
            }
        }

        fn offer(&mut self) -> (SessionDescription, SdpPendingOffer) {
            let mut change = self.rtc.sdp_api();
            change.add_media(MediaKind::Video, Direction::RecvOnly, None, None, None);
            let (offer, pending) = change.apply().unwrap();

            let offer = serde_json::from_value(serde_json::to_value(&offer).unwrap()).unwrap();
            (offer, pending)
        }

        fn accept(&mut self, answer: &SessionDescription, pending: SdpPendingOffer) {
            let answer: SdpAnswer =
                serde_json::from_value(serde_json::to_value(answer).unwrap()).unwrap();
            self.rtc.sdp_api().accept_answer(pending, answer).unwrap();
        }

        fn drive(&mut self) {
            while let Ok((n, source)) = self.socket.recv_from(&mut self.buf) {
                let Ok(contents) = self.buf[..n].try_into() else {
                    continue;
                };
                let receive = Receive {
                    proto: Protocol::Udp,
                    source,
                    destination: self.local_addr,
                    contents,
                };
                self.rtc
                    .handle_input(Input::Receive(Instant::now(), receive))
                    .unwrap();
            }
            self.rtc.handle_input(Input::Timeout(Instant::now())).unwrap();

            loop {
                match self.rtc.poll_output().unwrap() {
                    Output::Timeout(_) => break,
                    Output::Transmit(t) => {
                        let _ = self.socket.send_to(&t.contents, t.destination);
                    }
                    Output::Event(Event::MediaData(_)) => self.frames += 1,
                    Output::Event(_) => {}
                }
            }
        }
    }

    #[tokio::test]
    async fn negotiated_transport_delivers_frames() {
        let mut browser = Browser::new();
        let (offer, pending) = browser.offer();

        let negotiator = RtcNegotiator::new(IpAddr::V4(Ipv4Addr::LOCALHOST), None);
        let Negotiated {
            answer,
            mut transport,
        } = negotiator.negotiate(&offer, TrackBinding::new(STREAM)).unwrap();
        assert_eq!(answer.kind, SdpType::Answer);
        browser.accept(&answer, pending);

        // The outbound track only shows up once ICE and DTLS are through.
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut written = 0u64;
        while browser.frames == 0 {
            assert!(
                Instant::now() < deadline,
                "no frame reached the viewer, video mid {:?}, {written} written",
                transport.video_mid
            );

            browser.drive();
            if let Ok(polled) = tokio::time::timeout(Duration::from_millis(5), transport.poll()).await {
                polled.unwrap();
            }

            if transport.video_mid.is_some() {
                let mut payload = KEYFRAME.to_vec();
                payload.resize(200, 0);
                transport
                    .write(&MediaPacket::new(STREAM, written * 3000, payload))
                    .unwrap();
                written += 1;
            }
        }

        assert!(transport.video_mid.is_some());
        transport.close();
    }

    #[tokio::test]
    async fn offer_without_media_is_rejected() {
        let negotiator = RtcNegotiator::new(IpAddr::V4(Ipv4Addr::LOCALHOST), None);
        let offer = SessionDescription::offer("v=0\r\n");

        let err = negotiator
            .negotiate(&offer, TrackBinding::new(STREAM))
            .err()
            .unwrap();
        assert!(matches!(err, NegotiationError::Description(_)));
    }
}
