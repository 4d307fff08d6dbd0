use std::net::{IpAddr, SocketAddr};

use str0m::{net::Protocol, Candidate};
use systemstat::{Platform, System};
use tracing::{debug, warn};

/// Pick an IPv4 address that can be shared with a remote ICE peer.
///
/// Iterates over all network interfaces provided by `systemstat`, skipping any
/// loopback, link-local or broadcast addresses. When that finds nothing the
/// address of the default route interface is used instead.
pub fn select_host_address() -> Option<IpAddr> {
    let system = System::new();

    match system.networks() {
        Ok(networks) => {
            for net in networks.values() {
                for n in &net.addrs {
                    if let systemstat::IpAddr::V4(v) = n.addr {
                        if !v.is_loopback() && !v.is_link_local() && !v.is_broadcast() {
                            return Some(IpAddr::V4(v));
                        }
                    }
                }
            }
        }
        Err(e) => warn!("Listing network interfaces failed: {e}"),
    }

    match local_ip_address::local_ip() {
        Ok(ip) => {
            debug!("Falling back to default route address {ip}");
            Some(ip)
        }
        Err(e) => {
            warn!("No default route address: {e}");
            None
        }
    }
}

/// ICE host candidates for a socket bound at `local`, plus an optional
/// externally reachable address on the same port (e.g. behind a 1:1 NAT).
pub fn host_candidates(local: SocketAddr, public_ip: Option<IpAddr>) -> Vec<Candidate> {
    let mut addrs = vec![local];

    if let Some(ip) = public_ip.filter(|ip| *ip != local.ip()) {
        addrs.push(SocketAddr::new(ip, local.port()));
    }

    addrs
        .into_iter()
        .filter_map(|addr| match Candidate::host(addr, Protocol::Udp) {
            Ok(candidate) => Some(candidate),
            Err(e) => {
                warn!("Skipping candidate {addr}: {e:?}");
                None
            }
        })
        .collect()
}
