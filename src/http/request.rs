//! Inbound request inspection.
//!
//! # Responsibilities
//! - Generate a request ID (UUID v4) for tracing
//! - Derive the client key used to partition admission state
//! - Build the upstream URI and header set, without body framing when the
//!   body is not forwarded
//!
//! # Design Decisions
//! - `Cf-Connecting-Ip` wins over `X-Forwarded-For`, which wins over the peer
//! - Only the first `X-Forwarded-For` hop is used
//! - `Host` is always rewritten to the upstream authority

use axum::http::header::{self, HeaderMap, HeaderValue};
use axum::http::{Request, Uri};
use std::net::SocketAddr;
use tower_http::request_id::{MakeRequestId, RequestId};
use uuid::Uuid;

/// Header carrying the request ID.
pub const X_REQUEST_ID: &str = "x-request-id";

const CF_CONNECTING_IP: &str = "cf-connecting-ip";
const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Generates a fresh UUID v4 for requests that arrive without an ID.
#[derive(Debug, Clone, Copy, Default)]
pub struct MakeRequestUuid;

impl MakeRequestId for MakeRequestUuid {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<RequestId> {
        HeaderValue::from_str(&Uuid::new_v4().to_string())
            .ok()
            .map(RequestId::new)
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Identity used to partition admission state.
pub fn client_key(headers: &HeaderMap, peer: SocketAddr) -> String {
    if let Some(ip) = header_str(headers, CF_CONNECTING_IP) {
        return ip.to_string();
    }
    if let Some(first) = header_str(headers, X_FORWARDED_FOR)
        .and_then(|forwarded| forwarded.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return first.to_string();
    }
    peer.ip().to_string()
}

/// Upstream URI: plain HTTP, fixed authority, inbound path and query.
pub fn upstream_uri(authority: &str, inbound: &Uri) -> Result<Uri, axum::http::Error> {
    let path_and_query = inbound
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    Uri::builder()
        .scheme("http")
        .authority(authority)
        .path_and_query(path_and_query)
        .build()
}

/// Point `Host` at the upstream.
pub fn rewrite_host(headers: &mut HeaderMap, host: &HeaderValue) {
    headers.insert(header::HOST, host.clone());
}

/// Remove framing headers for a request whose body is not forwarded.
pub fn drop_body_framing(headers: &mut HeaderMap) {
    headers.remove(header::CONTENT_LENGTH);
    headers.remove(header::TRANSFER_ENCODING);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "192.0.2.10:53211".parse().unwrap()
    }

    #[test]
    fn cloudflare_header_wins() {
        let mut headers = HeaderMap::new();
        headers.insert(CF_CONNECTING_IP, "203.0.113.7".parse().unwrap());
        headers.insert(X_FORWARDED_FOR, "198.51.100.1".parse().unwrap());
        assert_eq!(client_key(&headers, peer()), "203.0.113.7");
    }

    #[test]
    fn first_forwarded_hop_is_used() {
        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_FOR, "198.51.100.1, 10.0.0.1".parse().unwrap());
        assert_eq!(client_key(&headers, peer()), "198.51.100.1");
    }

    #[test]
    fn falls_back_to_peer_ip() {
        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_FOR, " ".parse().unwrap());
        assert_eq!(client_key(&headers, peer()), "192.0.2.10");
    }

    #[test]
    fn upstream_uri_keeps_path_and_query() {
        let inbound: Uri = "/v1/items?page=2".parse().unwrap();
        let uri = upstream_uri("127.0.0.1:3000", &inbound).unwrap();
        assert_eq!(uri.to_string(), "http://127.0.0.1:3000/v1/items?page=2");

        let absolute: Uri = "http://proxy.example/x".parse().unwrap();
        let uri = upstream_uri("backend:80", &absolute).unwrap();
        assert_eq!(uri.to_string(), "http://backend:80/x");
    }

    #[test]
    fn host_is_rewritten() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, "proxy.example".parse().unwrap());
        rewrite_host(&mut headers, &HeaderValue::from_static("backend:80"));
        assert_eq!(headers[header::HOST], "backend:80");
    }

    #[test]
    fn body_framing_is_dropped() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_LENGTH, "3".parse().unwrap());
        headers.insert(header::TRANSFER_ENCODING, "chunked".parse().unwrap());
        headers.insert(header::ACCEPT, "*/*".parse().unwrap());

        drop_body_framing(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key(header::ACCEPT));
    }

    #[test]
    fn request_ids_are_unique() {
        let request = Request::new(());
        let mut make = MakeRequestUuid;
        let a = make.make_request_id(&request).unwrap();
        let b = make.make_request_id(&request).unwrap();
        assert_ne!(a.header_value(), b.header_value());
    }
}
