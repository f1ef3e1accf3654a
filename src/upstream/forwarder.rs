//! Hyper-based upstream forwarder.
//!
//! # Responsibilities
//! - Issue GET/POST/OPTIONS to the fixed upstream
//! - Bound the whole exchange (connect, send, read body) by the hard timeout
//! - Strip hop-by-hop headers in both directions
//! - Classify failures into `ForwardError`
//!
//! The legacy hyper client never follows redirects; 3xx answers are returned
//! to the inbound client untouched.

use axum::body::Body;
use axum::http::header::{self, HeaderMap, HeaderName};
use axum::http::Request;
use axum::response::Response;
use futures_util::future::BoxFuture;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use std::error::Error as _;
use std::time::Instant;

use crate::observability::metrics;
use crate::upstream::{Forward, ForwardError, UpstreamRequest};

const HOP_BY_HOP: [HeaderName; 7] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Remove headers that describe a single connection rather than the message.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP.iter() {
        headers.remove(name);
    }
    headers.remove("keep-alive");
}

/// Forwards dispatched units over a pooled hyper client.
#[derive(Clone)]
pub struct HyperForwarder {
    client: Client<HttpConnector, Body>,
}

impl HyperForwarder {
    pub fn new() -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        let client = Client::builder(TokioExecutor::new()).build(connector);
        Self { client }
    }

    async fn exchange(&self, request: UpstreamRequest) -> Result<Response, ForwardError> {
        let UpstreamRequest {
            context,
            uri,
            mut headers,
            body,
            timeout,
        } = request;
        strip_hop_by_hop(&mut headers);

        let mut req = Request::new(body);
        *req.method_mut() = context.method;
        *req.uri_mut() = uri;
        *req.headers_mut() = headers;

        let call = async {
            let response = self
                .client
                .request(req)
                .await
                .map_err(|e| ForwardError::Transport(describe(&e)))?;

            let (mut parts, body) = response.into_parts();
            if parts.status.is_client_error() || parts.status.is_server_error() {
                return Err(ForwardError::Status(parts.status));
            }

            let bytes = axum::body::to_bytes(Body::new(body), usize::MAX)
                .await
                .map_err(|e| ForwardError::Transport(describe(&e)))?;
            strip_hop_by_hop(&mut parts.headers);
            Ok(Response::from_parts(parts, Body::from(bytes)))
        };

        match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ForwardError::Timeout(timeout)),
        }
    }
}

impl Default for HyperForwarder {
    fn default() -> Self {
        Self::new()
    }
}

impl Forward for HyperForwarder {
    fn forward(&self, request: UpstreamRequest) -> BoxFuture<'_, Result<Response, ForwardError>> {
        Box::pin(async move {
            let method = request.context.method.clone();
            let path = request.context.log_path();
            let start = Instant::now();

            let result = self.exchange(request).await;
            metrics::record_upstream_duration(start);

            if let Err(e) = &result {
                tracing::error!(
                    method = %method,
                    path = %path,
                    status = e.status().as_u16(),
                    error = %e,
                    "Upstream request failed"
                );
            }
            result
        })
    }
}

/// Error message including its source chain; hyper's top-level text is terse.
fn describe(error: &(dyn std::error::Error + 'static)) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
