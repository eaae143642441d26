//! Moderation gate: resolves a connection's network origin and checks it
//! against the blocklist before any session exists.

use std::net::{IpAddr, SocketAddr};

use axum::http::HeaderMap;

use crate::db::Db;
use crate::error::{ChatError, ChatResult};

pub const BLOCKED_MESSAGE: &str = "You are blocked from this chat.";

/// Client address for an incoming request.
///
/// Behind a reverse proxy the socket peer is the proxy itself, so when
/// `trust_proxy` is set the first `X-Forwarded-For` hop (then `X-Real-IP`)
/// wins. Unparseable headers fall through to the socket address.
pub fn client_ip(headers: &HeaderMap, peer: SocketAddr, trust_proxy: bool) -> IpAddr {
    if trust_proxy {
        if let Some(ip) = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|first| first.trim().parse::<IpAddr>().ok())
        {
            return canonical(ip);
        }
        if let Some(ip) = headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<IpAddr>().ok())
        {
            return canonical(ip);
        }
    }
    canonical(peer.ip())
}

/// Fold IPv4-mapped IPv6 addresses (`::ffff:a.b.c.d`) to plain IPv4 so a
/// block on `a.b.c.d` holds on dual-stack listeners.
pub fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        v4 => v4,
    }
}

/// Deny a blocked origin.
pub fn admit(db: &Db, ip: &str) -> ChatResult<()> {
    if let Some(blocked) = db.find_blocked_ip(ip)? {
        tracing::warn!(%ip, reason = ?blocked.reason, "Blocked address attempted to connect");
        return Err(ChatError::unauthorized(BLOCKED_MESSAGE));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn peer() -> SocketAddr {
        "192.0.2.10:5555".parse().unwrap()
    }

    #[test]
    fn ignores_forwarded_headers_unless_trusted() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.7"));
        assert_eq!(client_ip(&headers, peer(), false).to_string(), "192.0.2.10");
        assert_eq!(client_ip(&headers, peer(), true).to_string(), "203.0.113.7");
    }

    #[test]
    fn first_forwarded_hop_wins() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.1, 10.0.0.2"),
        );
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.1"));
        assert_eq!(client_ip(&headers, peer(), true).to_string(), "203.0.113.7");
    }

    #[test]
    fn real_ip_then_socket_fallback() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("garbage"));
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.1"));
        assert_eq!(client_ip(&headers, peer(), true).to_string(), "198.51.100.1");

        assert_eq!(client_ip(&HeaderMap::new(), peer(), true).to_string(), "192.0.2.10");
    }

    #[test]
    fn mapped_ipv6_is_folded() {
        let peer: SocketAddr = "[::ffff:192.0.2.33]:80".parse().unwrap();
        assert_eq!(client_ip(&HeaderMap::new(), peer, false).to_string(), "192.0.2.33");

        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("::ffff:203.0.113.7"));
        assert_eq!(client_ip(&headers, peer, true).to_string(), "203.0.113.7");

        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("::ffff:198.51.100.1"));
        assert_eq!(client_ip(&headers, peer, true).to_string(), "198.51.100.1");
    }

    #[test]
    fn blocked_address_is_unauthorized() {
        let db = Db::open_memory().unwrap();
        assert!(admit(&db, "203.0.113.7").is_ok());
        db.block_ip("203.0.113.7", Some("spam"), chrono::Utc::now()).unwrap();
        let err = admit(&db, "203.0.113.7").unwrap_err();
        assert!(err.forces_disconnect());
        assert!(admit(&db, "203.0.113.8").is_ok());
    }
}
