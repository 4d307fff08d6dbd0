//! Session registry
//!
//! The registry is the only owner of the id → session map and the single
//! source of truth for fan-out targets. Every access goes through a method
//! that takes the lock; broadcasts work on a snapshot so add/remove never wait
//! on delivery.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, info, trace};

use crate::error::RegistryError;
use crate::model::media::MediaPacket;
use crate::model::packet::ProtocolPacket;
use crate::model::session::{SessionId, SessionInfo};
use crate::session::{Delivery, ViewerEvent, ViewerSession};

/// Per-packet fan-out outcome.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub queued: usize,
    pub dropped: usize,
    pub closed: usize,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<ViewerSession>>>,
}

impl SessionRegistry {
    pub fn new() -> SessionRegistry {
        SessionRegistry::default()
    }

    // Every critical section leaves the map consistent, so a poisoned lock is
    // still safe to use.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<SessionId, Arc<ViewerSession>>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<SessionId, Arc<ViewerSession>>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, session: Arc<ViewerSession>) -> Result<(), RegistryError> {
        let mut sessions = self.write();
        let id = session.id().clone();

        if sessions.contains_key(&id) {
            return Err(RegistryError::DuplicateId(id));
        }
        sessions.insert(id.clone(), session);

        info!(session = %id, viewers = sessions.len(), "Session registered");
        Ok(())
    }

    /// Remove a session. Removing an absent id is a no-op.
    pub fn remove(&self, id: &SessionId) -> Option<Arc<ViewerSession>> {
        let mut sessions = self.write();
        let removed = sessions.remove(id);

        if removed.is_some() {
            info!(session = %id, viewers = sessions.len(), "Session removed");
        }
        removed
    }

    pub fn get(&self, id: &SessionId) -> Option<Arc<ViewerSession>> {
        self.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn snapshot(&self) -> Vec<Arc<ViewerSession>> {
        self.read().values().cloned().collect()
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self.snapshot().iter().map(|s| s.info()).collect();
        infos.sort_by_key(|info| info.connected_at);
        infos
    }

    /// Hand one upstream packet to every session present right now. Never
    /// waits: a viewer whose queue is full loses this packet.
    pub fn broadcast(&self, packet: Arc<MediaPacket>) -> BroadcastReport {
        let mut report = BroadcastReport::default();

        for session in self.snapshot() {
            match session.deliver(packet.clone()) {
                Delivery::Queued => report.queued += 1,
                Delivery::Dropped => {
                    trace!(session = %session.id(), "Media queue full, frame dropped");
                    report.dropped += 1;
                }
                Delivery::Closed => report.closed += 1,
            }
        }

        report
    }

    /// Best-effort protocol packet to every session.
    pub fn send_all(&self, packet: &ProtocolPacket) -> BroadcastReport {
        let mut report = BroadcastReport::default();

        for session in self.snapshot() {
            match session.try_send(packet.clone()) {
                Delivery::Queued => report.queued += 1,
                Delivery::Dropped => report.dropped += 1,
                Delivery::Closed => report.closed += 1,
            }
        }

        report
    }

    /// Drain the inbound events of every session not drained yet, each on its
    /// own task, feeding them to `f`.
    pub fn for_each_input<F, Fut>(&self, f: F)
    where
        F: Fn(ViewerEvent) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        for session in self.snapshot() {
            let Some(mut inbound) = session.take_inbound() else {
                continue;
            };

            let f = f.clone();
            let id = session.id().clone();
            tokio::spawn(async move {
                while let Some(event) = inbound.recv().await {
                    f(event).await;
                }
                debug!(session = %id, "Inbound events drained");
            });
        }
    }

    /// Terminate every registered session.
    pub fn terminate_all(&self, reason: &str) {
        for session in self.snapshot() {
            session.terminate(reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::model::media::{StreamId, TrackBinding};
    use crate::model::packet::PacketType;
    use crate::session::{PendingSession, SessionConfig};
    use crate::signaling::tests::FakeNegotiator;

    fn pending(id: &str, media_queue: usize) -> PendingSession<FakeNegotiator> {
        let config = SessionConfig {
            media_queue,
            ..SessionConfig::default()
        };
        ViewerSession::create(
            SessionId::from(id),
            &config,
            Arc::new(FakeNegotiator::default()),
            TrackBinding::new(StreamId(1)),
        )
    }

    fn packet(rtp_time: u64) -> Arc<MediaPacket> {
        Arc::new(MediaPacket::new(StreamId(1), rtp_time, vec![0xAB]))
    }

    #[test]
    fn duplicate_add_leaves_existing_entry() {
        let registry = SessionRegistry::new();
        let first = pending("a", 4);
        let second = pending("a", 4);

        registry.add(first.session().clone()).unwrap();
        let err = registry.add(second.session().clone()).unwrap_err();

        assert!(matches!(err, RegistryError::DuplicateId(_)));
        assert_eq!(registry.len(), 1);
        let kept = registry.get(&SessionId::from("a")).unwrap();
        assert!(Arc::ptr_eq(&kept, first.session()));
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = SessionRegistry::new();
        let a = pending("a", 4);
        registry.add(a.session().clone()).unwrap();

        assert!(registry.remove(&SessionId::from("a")).is_some());
        assert!(registry.remove(&SessionId::from("a")).is_none());
        assert!(registry.remove(&SessionId::from("never")).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn broadcast_reaches_every_session_once() {
        let registry = SessionRegistry::new();
        let sessions: Vec<_> = ["a", "b", "c"].iter().map(|id| pending(id, 8)).collect();
        for s in &sessions {
            registry.add(s.session().clone()).unwrap();
        }

        let p = packet(1);
        let report = registry.broadcast(p.clone());
        assert_eq!(report.queued, 3);

        // Every sink holds the same allocation, exactly once.
        assert_eq!(Arc::strong_count(&p), 4);
    }

    #[test]
    fn full_queue_only_loses_for_that_session() {
        let registry = SessionRegistry::new();
        let slow = pending("slow", 1);
        let fast = pending("fast", 8);
        registry.add(slow.session().clone()).unwrap();
        registry.add(fast.session().clone()).unwrap();

        registry.broadcast(packet(1));
        let report = registry.broadcast(packet(2));

        assert_eq!(report.queued, 1);
        assert_eq!(report.dropped, 1);
    }

    #[test]
    fn late_joiner_gets_no_replay() {
        let registry = SessionRegistry::new();
        let early = pending("early", 8);
        registry.add(early.session().clone()).unwrap();

        let p = packet(1);
        registry.broadcast(p.clone());

        let late = pending("late", 8);
        registry.add(late.session().clone()).unwrap();

        // Only the early session holds a reference besides ours.
        assert_eq!(Arc::strong_count(&p), 2);
    }

    #[test]
    fn terminated_sessions_count_as_closed() {
        let registry = SessionRegistry::new();
        let a = pending("a", 8);
        registry.add(a.session().clone()).unwrap();
        a.session().terminate("test");

        let report = registry.broadcast(packet(1));
        assert_eq!(report.closed, 1);
        assert_eq!(report.queued, 0);
    }

    #[tokio::test]
    async fn for_each_input_drains_each_session_once() {
        let registry = SessionRegistry::new();
        let a = pending("a", 8);
        let b = pending("b", 8);
        registry.add(a.session().clone()).unwrap();
        registry.add(b.session().clone()).unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let sink = move |event: ViewerEvent| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event).await;
            }
        };
        registry.for_each_input(sink.clone());
        // Already claimed, second pump gets nothing.
        registry.for_each_input(sink);

        // Feed events straight into the pending sessions' inbound queues.
        for (session, id) in [(&a, "a"), (&b, "b")] {
            session
                .inbound_sender()
                .send(ViewerEvent {
                    session: SessionId::from(id),
                    packet: ProtocolPacket::new(PacketType::Other("KEY".into()), id),
                })
                .await
                .unwrap();
        }

        let mut seen = vec![];
        for _ in 0..2 {
            let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            seen.push(event.packet.data);
        }
        seen.sort();
        assert_eq!(seen, vec!["a", "b"]);
        assert!(rx.try_recv().is_err());
    }
}
