//! Client address resolution behind a reverse proxy.

use axum::http::HeaderMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Proxy headers consulted in order.
const PROXY_HEADERS: [&str; 3] = ["x-forwarded-for", "x-real-ip", "client-ip"];

/// Pick the address used as the client identifier.
///
/// With `trust_proxy_headers`, the first public address found in the proxy
/// headers wins; otherwise (or when none qualifies) the socket peer is used.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>, trust_proxy_headers: bool) -> String {
    if trust_proxy_headers {
        for name in PROXY_HEADERS {
            for value in headers.get_all(name) {
                let Ok(value) = value.to_str() else {
                    continue;
                };
                for candidate in value.split(',') {
                    if let Ok(ip) = candidate.trim().parse::<IpAddr>()
                        && is_public(&ip)
                    {
                        return ip.to_string();
                    }
                }
            }
        }
    }

    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Not private, loopback, link-local or otherwise reserved.
pub fn is_public(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_public_v4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_public_v4(&v4),
            None => is_public_v6(v6),
        },
    }
}

fn is_public_v4(ip: &Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    !(ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || a == 0
        || a >= 240
        // Carrier-grade NAT 100.64.0.0/10
        || (a == 100 && (64..128).contains(&b)))
}

fn is_public_v6(ip: &Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    !(ip.is_loopback()
        || ip.is_unspecified()
        || ip.is_multicast()
        // fc00::/7 unique local
        || (first & 0xfe00) == 0xfc00
        // fe80::/10 link local
        || (first & 0xffc0) == 0xfe80)
}
