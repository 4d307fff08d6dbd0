use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Allocate a process-unique id.
    pub fn next() -> SessionId {
        static ID_COUNTER: AtomicU64 = AtomicU64::new(1);
        let next_id = ID_COUNTER.fetch_add(1, Ordering::SeqCst);
        SessionId(format!("viewer-{next_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        SessionId(id.to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Offer/answer progress of one viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalingState {
    New,
    Negotiating,
    Established,
    /// Terminal.
    Closed,
}

/// Snapshot of a registered session, for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub connected_at: DateTime<Utc>,
    pub state: SignalingState,
}
