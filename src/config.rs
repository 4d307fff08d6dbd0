//! Relay settings
//!
//! Loaded from a TOML file. Every field has a default so an empty file (or no
//! file at all) gives a relay listening on port 8080 in collaborative mode.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::model::media::StreamId;
use crate::session::SessionConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppMode {
    /// All viewers share one application session.
    #[default]
    Collaborative,
    /// Each viewer group gets its own application instance.
    OnDemand,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub app_mode: AppMode,
    pub app_name: String,
    /// Used as the application name when `app_name` is empty.
    pub window_title: String,
    pub discovery_host: String,
    pub discovery_timeout_secs: u64,
    pub listen_addr: SocketAddr,
    /// Address registered with the directory; registration is skipped when unset.
    pub public_addr: Option<String>,
    pub heartbeat_secs: u64,
    pub media_queue: usize,
    pub upstream: UpstreamSettings,
    pub webrtc: WebRtcSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpstreamSettings {
    /// Where the application's encoder sends RTP.
    pub media_addr: SocketAddr,
    /// Where viewer input is forwarded to.
    pub input_addr: SocketAddr,
    /// SSRC the encoder is configured with.
    pub stream_id: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WebRtcSettings {
    /// Interface to bind viewer sockets on; picked automatically when unset.
    pub host_ip: Option<IpAddr>,
    /// Extra candidate address for hosts behind a 1:1 NAT.
    pub public_ip: Option<IpAddr>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            app_mode: AppMode::default(),
            app_name: String::new(),
            window_title: String::new(),
            discovery_host: "http://localhost:9000".to_string(),
            discovery_timeout_secs: 10,
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            public_addr: None,
            heartbeat_secs: 1,
            media_queue: 128,
            upstream: UpstreamSettings::default(),
            webrtc: WebRtcSettings::default(),
        }
    }
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        UpstreamSettings {
            media_addr: SocketAddr::from(([127, 0, 0, 1], 5004)),
            input_addr: SocketAddr::from(([127, 0, 0, 1], 5005)),
            stream_id: 42,
        }
    }
}

impl Settings {
    pub fn load(path: impl AsRef<Path>) -> Result<Settings, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Settings::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Settings, ConfigError> {
        let mut settings: Settings = toml::from_str(text)?;
        if settings.app_name.is_empty() {
            settings.app_name = settings.window_title.clone();
        }
        Ok(settings)
    }

    pub fn stream_id(&self) -> StreamId {
        StreamId(self.upstream.stream_id)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout_secs.max(1))
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            media_queue: self.media_queue.max(1),
            heartbeat: Duration::from_secs(self.heartbeat_secs.max(1)),
        }
    }
}
