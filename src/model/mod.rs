//! Data models shared by the relay
//!
//! This module contains the values that cross task boundaries: the viewer
//! protocol packets, upstream media packets, session identity, and the hosts
//! exchanged with the directory service.

pub mod host;
pub mod media;
pub mod packet;
pub mod session;
