//! Relay composition root
//!
//! Binds the single upstream source to the session registry: one fan-out task
//! for upstream media, one drain task per viewer for inbound events, and the
//! per-viewer tasks started by [`RelayService::connect_viewer`].

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::{Sink, Stream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{AppMode, Settings};
use crate::discovery::DiscoveryClient;
use crate::error::{DiscoveryError, RegistryError, TransportError};
use crate::model::host::AppHost;
use crate::model::media::{MediaPacket, StreamId, TrackBinding};
use crate::model::packet::ProtocolPacket;
use crate::model::session::{SessionId, SessionInfo};
use crate::registry::{BroadcastReport, SessionRegistry};
use crate::session::{SessionConfig, ViewerEvent, ViewerSession};
use crate::transport::Negotiator;

/// The upstream application's media, and which stream viewers are bound to.
pub struct Upstream {
    pub media: mpsc::Receiver<MediaPacket>,
    pub binding: TrackBinding,
}

/// Where viewer-originated events go.
#[derive(Clone)]
pub struct EventSinks {
    pub input: mpsc::Sender<ViewerEvent>,
    pub chat: mpsc::Sender<ViewerEvent>,
}

pub struct RelayService<N: Negotiator> {
    registry: Arc<SessionRegistry>,
    negotiator: Arc<N>,
    binding: TrackBinding,
    session_config: SessionConfig,
    sinks: EventSinks,
    discovery: DiscoveryClient,
    app_name: String,
    mode: AppMode,
    fan_out: Mutex<Option<JoinHandle<()>>>,
}

impl<N: Negotiator> RelayService<N> {
    /// Wire the relay and start the fan-out loop. Must be called from within a
    /// tokio runtime.
    pub fn start(
        settings: &Settings,
        negotiator: Arc<N>,
        upstream: Upstream,
        sinks: EventSinks,
        discovery: DiscoveryClient,
    ) -> Arc<RelayService<N>> {
        let registry = Arc::new(SessionRegistry::new());
        let fan_out = tokio::spawn(fan_out(registry.clone(), upstream.media, upstream.binding));

        info!(
            mode = ?settings.app_mode,
            app = %settings.app_name,
            stream = %upstream.binding.stream_id,
            "Relay started"
        );

        Arc::new(RelayService {
            registry,
            negotiator,
            binding: upstream.binding,
            session_config: settings.session_config(),
            sinks,
            discovery,
            app_name: settings.app_name.clone(),
            mode: settings.app_mode,
            fan_out: Mutex::new(Some(fan_out)),
        })
    }

    pub fn mode(&self) -> AppMode {
        self.mode
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Accept a viewer connection: register a new session, start its tasks,
    /// and remove it from the registry once it terminates.
    pub fn connect_viewer<R, W>(
        &self,
        reader: R,
        writer: W,
    ) -> Result<Arc<ViewerSession>, RegistryError>
    where
        R: Stream<Item = Result<String, TransportError>> + Unpin + Send + 'static,
        W: Sink<String, Error = TransportError> + Unpin + Send + 'static,
    {
        let pending = ViewerSession::create(
            SessionId::next(),
            &self.session_config,
            self.negotiator.clone(),
            self.binding,
        );

        self.registry.add(pending.session().clone())?;
        self.pump_input();

        let session = pending.start(reader, writer);

        let registry = self.registry.clone();
        let watched = session.clone();
        tokio::spawn(async move {
            watched.terminated().await;
            registry.remove(watched.id());
        });

        Ok(session)
    }

    fn pump_input(&self) {
        let sinks = self.sinks.clone();
        self.registry.for_each_input(move |event: ViewerEvent| {
            let sinks = sinks.clone();
            async move {
                let sink = if event.is_chat() {
                    &sinks.chat
                } else {
                    &sinks.input
                };
                if sink.send(event).await.is_err() {
                    debug!("Event consumer gone, dropping viewer event");
                }
            }
        });
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.registry.sessions()
    }

    pub fn send_all(&self, packet: &ProtocolPacket) -> BroadcastReport {
        self.registry.send_all(packet)
    }

    pub async fn register(&self, addr: &str) -> Result<(), DiscoveryError> {
        self.discovery.register(addr, &self.app_name).await
    }

    pub async fn list_hosts(&self) -> Result<Vec<AppHost>, DiscoveryError> {
        self.discovery.list_hosts().await
    }

    /// Terminate every session and stop the fan-out loop.
    pub fn shutdown(&self) {
        self.registry.terminate_all("relay shutting down");
        if let Some(handle) = self
            .fan_out
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

async fn fan_out(
    registry: Arc<SessionRegistry>,
    mut media: mpsc::Receiver<MediaPacket>,
    binding: TrackBinding,
) {
    let mut unbound = UnboundStreams::default();

    while let Some(packet) = media.recv().await {
        if !binding.carries(&packet) {
            if unbound.first_sighting(packet.stream_id) {
                warn!(
                    stream = %packet.stream_id,
                    bound = %binding.stream_id,
                    "Upstream stream is not bound to viewer tracks, check upstream.stream_id against the encoder SSRC"
                );
            }
            continue;
        }

        let report = registry.broadcast(Arc::new(packet));
        if report.dropped > 0 {
            debug!(dropped = report.dropped, "Slow viewers lost a frame");
        }
    }

    warn!("Upstream media closed, fan-out stopped");
}

/// Upstream streams already reported as unbound.
#[derive(Debug, Default)]
struct UnboundStreams {
    reported: HashSet<StreamId>,
}

impl UnboundStreams {
    /// True only the first time `stream` is seen.
    fn first_sighting(&mut self, stream: StreamId) -> bool {
        self.reported.insert(stream)
    }
}
