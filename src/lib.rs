//! Game stream relay
//!
//! Relays one application host's live video to many browser viewers over
//! WebRTC, negotiating each viewer's transport through an offer/answer
//! exchange on a websocket, and carries viewer input back to the application.

pub mod codec;
pub mod config;
pub mod discovery;
pub mod error;
pub mod model;
pub mod registry;
pub mod relay;
pub mod server;
pub mod session;
pub mod signaling;
pub mod transport;
pub mod upstream;

mod util;

pub use util::select_host_address;
