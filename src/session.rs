//! Viewer sessions
//!
//! A [`ViewerSession`] is one connected viewer. It runs four tasks: the reader
//! (protocol channel in, offers and events dispatched), the writer (outbound
//! queue to the protocol channel), the forwarder (upstream media to the viewer's
//! transport) and the heartbeat. All of them stop on the session's
//! [`Termination`] signal.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::model::media::{MediaPacket, TrackBinding};
use crate::model::packet::{PacketType, ProtocolPacket};
use crate::model::session::{SessionId, SessionInfo, SignalingState};
use crate::signaling::SignalingEngine;
use crate::transport::{MediaTransport, Negotiator};

const OUTBOUND_CAPACITY: usize = 64;
const INBOUND_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Frames buffered per viewer before new ones are dropped.
    pub media_queue: usize,
    pub heartbeat: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            media_queue: 128,
            heartbeat: Duration::from_secs(1),
        }
    }
}

/// A chat or input packet sent by a viewer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewerEvent {
    pub session: SessionId,
    pub packet: ProtocolPacket,
}

impl ViewerEvent {
    pub fn is_chat(&self) -> bool {
        self.packet.kind == PacketType::Chat
    }
}

/// Once-only termination signal shared by a session's tasks.
#[derive(Debug, Clone)]
pub struct Termination {
    inner: Arc<TerminationInner>,
}

#[derive(Debug)]
struct TerminationInner {
    fired: AtomicBool,
    tx: watch::Sender<bool>,
}

impl Termination {
    pub fn new() -> Termination {
        let (tx, _) = watch::channel(false);
        Termination {
            inner: Arc::new(TerminationInner {
                fired: AtomicBool::new(false),
                tx,
            }),
        }
    }

    /// Fire the signal. Returns true only for the first caller.
    pub fn fire(&self) -> bool {
        let first = !self.inner.fired.swap(true, Ordering::SeqCst);
        if first {
            self.inner.tx.send_replace(true);
        }
        first
    }

    pub fn is_fired(&self) -> bool {
        self.inner.fired.load(Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        let mut rx = self.inner.tx.subscribe();
        // The sender lives as long as `self`, so this only returns once fired.
        let _ = rx.wait_for(|fired| *fired).await;
    }
}

impl Default for Termination {
    fn default() -> Self {
        Termination::new()
    }
}

/// Result of offering one media packet to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// Queue full, the packet was dropped for this viewer.
    Dropped,
    /// Session is shutting down.
    Closed,
}

pub struct ViewerSession {
    id: SessionId,
    connected_at: DateTime<Utc>,
    outbound: mpsc::Sender<ProtocolPacket>,
    media: mpsc::Sender<Arc<MediaPacket>>,
    inbound: Mutex<Option<mpsc::Receiver<ViewerEvent>>>,
    state: watch::Receiver<SignalingState>,
    termination: Termination,
}

impl fmt::Debug for ViewerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewerSession")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

impl ViewerSession {
    /// Build a session and its queues without starting any task.
    pub fn create<N: Negotiator>(
        id: SessionId,
        config: &SessionConfig,
        negotiator: Arc<N>,
        binding: TrackBinding,
    ) -> PendingSession<N> {
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (media, media_rx) = mpsc::channel(config.media_queue.max(1));
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);

        let engine = SignalingEngine::new(negotiator, binding);

        let session = Arc::new(ViewerSession {
            id,
            connected_at: Utc::now(),
            outbound,
            media,
            inbound: Mutex::new(Some(inbound_rx)),
            state: engine.subscribe(),
            termination: Termination::new(),
        });

        PendingSession {
            session,
            engine,
            outbound_rx,
            media_rx,
            inbound_tx,
            heartbeat: config.heartbeat,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn state(&self) -> SignalingState {
        *self.state.borrow()
    }

    /// Watch the signaling state of this session.
    pub fn state_changes(&self) -> watch::Receiver<SignalingState> {
        self.state.clone()
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            connected_at: self.connected_at,
            state: self.state(),
        }
    }

    /// Ask every task of this session to stop. Only the first call has any
    /// effect; its reason is the one logged.
    pub fn terminate(&self, reason: impl fmt::Display) {
        if self.termination.fire() {
            info!(session = %self.id, "Session terminating: {reason}");
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.termination.is_fired()
    }

    /// Resolves once the session has been terminated.
    pub async fn terminated(&self) {
        self.termination.wait().await
    }

    /// Queue a protocol packet for the viewer, waiting for queue space.
    pub async fn send(&self, packet: ProtocolPacket) -> Result<(), TransportError> {
        self.outbound
            .send(packet)
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Queue a protocol packet for the viewer without waiting.
    pub fn try_send(&self, packet: ProtocolPacket) -> Delivery {
        match self.outbound.try_send(packet) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Full(_)) => Delivery::Dropped,
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    /// Offer a media packet to this viewer's queue; never waits.
    pub fn deliver(&self, packet: Arc<MediaPacket>) -> Delivery {
        if self.is_terminated() {
            return Delivery::Closed;
        }
        match self.media.try_send(packet) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Full(_)) => Delivery::Dropped,
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    /// Hand out the viewer's inbound event queue. Only the first caller gets it.
    pub fn take_inbound(&self) -> Option<mpsc::Receiver<ViewerEvent>> {
        self.inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// A session whose queues exist but whose tasks have not been spawned.
pub struct PendingSession<N: Negotiator> {
    session: Arc<ViewerSession>,
    engine: SignalingEngine<N>,
    outbound_rx: mpsc::Receiver<ProtocolPacket>,
    media_rx: mpsc::Receiver<Arc<MediaPacket>>,
    inbound_tx: mpsc::Sender<ViewerEvent>,
    heartbeat: Duration,
}

impl<N: Negotiator> PendingSession<N> {
    pub fn session(&self) -> &Arc<ViewerSession> {
        &self.session
    }

    #[cfg(test)]
    pub(crate) fn inbound_sender(&self) -> &mpsc::Sender<ViewerEvent> {
        &self.inbound_tx
    }

    #[cfg(test)]
    pub(crate) fn into_media(self) -> mpsc::Receiver<Arc<MediaPacket>> {
        self.media_rx
    }

    /// Spawn the session's tasks on the current runtime.
    pub fn start<R, W>(self, reader: R, writer: W) -> Arc<ViewerSession>
    where
        R: Stream<Item = Result<String, TransportError>> + Unpin + Send + 'static,
        W: Sink<String, Error = TransportError> + Unpin + Send + 'static,
    {
        let PendingSession {
            session,
            engine,
            outbound_rx,
            media_rx,
            inbound_tx,
            heartbeat,
        } = self;

        let (transport_tx, transport_rx) = oneshot::channel();

        tokio::spawn(read_loop(
            session.clone(),
            reader,
            engine,
            inbound_tx,
            transport_tx,
        ));
        tokio::spawn(write_loop(session.clone(), writer, outbound_rx));
        tokio::spawn(forward_loop(session.clone(), media_rx, transport_rx));
        tokio::spawn(heartbeat_loop(session.clone(), heartbeat));

        debug!(session = %session.id, "Session started");
        session
    }
}

async fn read_loop<N, R>(
    session: Arc<ViewerSession>,
    mut reader: R,
    mut engine: SignalingEngine<N>,
    inbound: mpsc::Sender<ViewerEvent>,
    transport_tx: oneshot::Sender<N::Transport>,
) where
    N: Negotiator,
    R: Stream<Item = Result<String, TransportError>> + Unpin,
{
    let mut transport_tx = Some(transport_tx);

    loop {
        let text = tokio::select! {
            _ = session.terminated() => break,
            next = reader.next() => match next {
                Some(Ok(text)) => text,
                Some(Err(e)) => {
                    session.terminate(e);
                    break;
                }
                None => {
                    session.terminate(TransportError::Closed);
                    break;
                }
            },
        };

        let packet = match ProtocolPacket::from_text(&text) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(session = %session.id, "Dropping message: {e}");
                continue;
            }
        };

        let reply = match packet.kind {
            PacketType::Offer => match engine.handle_offer(&packet.data) {
                Ok(established) => {
                    if let Some(tx) = transport_tx.take() {
                        // Forwarder already gone means the session is terminating.
                        let _ = tx.send(established.transport);
                    }
                    established.answer
                }
                Err(e) => ProtocolPacket::error(e),
            },
            PacketType::Heartbeat => continue,
            _ => {
                let event = ViewerEvent {
                    session: session.id.clone(),
                    packet,
                };
                tokio::select! {
                    _ = session.terminated() => break,
                    sent = inbound.send(event) => {
                        if sent.is_err() {
                            debug!(session = %session.id, "No input consumer, event dropped");
                        }
                    }
                }
                continue;
            }
        };

        if let Err(e) = session.send(reply).await {
            session.terminate(e);
            break;
        }
    }

    engine.close();
}

async fn write_loop<W>(
    session: Arc<ViewerSession>,
    mut writer: W,
    mut outbound: mpsc::Receiver<ProtocolPacket>,
) where
    W: Sink<String, Error = TransportError> + Unpin,
{
    loop {
        let packet = tokio::select! {
            _ = session.terminated() => break,
            packet = outbound.recv() => match packet {
                Some(packet) => packet,
                None => break,
            },
        };

        let text = match packet.to_text() {
            Ok(text) => text,
            Err(e) => {
                warn!(session = %session.id, "Could not encode {} packet: {e}", packet.kind);
                continue;
            }
        };

        if let Err(e) = writer.send(text).await {
            session.terminate(e);
            break;
        }
    }

    let _ = writer.close().await;
}

async fn forward_loop<T: MediaTransport>(
    session: Arc<ViewerSession>,
    mut media: mpsc::Receiver<Arc<MediaPacket>>,
    mut transport_rx: oneshot::Receiver<T>,
) {
    // Until negotiation completes there is no track to write to.
    let mut transport = loop {
        tokio::select! {
            biased;
            _ = session.terminated() => return,
            negotiated = &mut transport_rx => match negotiated {
                Ok(transport) => break transport,
                Err(_) => return,
            },
            packet = media.recv() => {
                if packet.is_none() {
                    return;
                }
            }
        }
    };

    debug!(session = %session.id, "Forwarding media");

    loop {
        let result = tokio::select! {
            biased;
            _ = session.terminated() => break,
            packet = media.recv() => match packet {
                Some(packet) => transport.write(&packet),
                None => break,
            },
            polled = transport.poll() => polled,
        };

        if let Err(e) = result {
            session.terminate(format!("media transport: {e}"));
            break;
        }
    }

    transport.close();
}

async fn heartbeat_loop(session: Arc<ViewerSession>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // First tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = session.terminated() => break,
            _ = ticker.tick() => {
                if session.try_send(ProtocolPacket::heartbeat()) == Delivery::Closed {
                    session.terminate("heartbeat: outbound queue closed");
                    break;
                }
            }
        }
    }
}
