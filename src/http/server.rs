//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create the Axum router with a single catch-all handler
//! - Wire up middleware (request ID, tracing)
//! - Turn each inbound request into a pending admission unit
//! - Spawn the client reaper and the config-update loop
//! - Serve until the shutdown broadcast fires

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderName, HeaderValue, Method, Request, StatusCode},
    response::Response,
    routing::any,
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tower::ServiceBuilder;
use tower_http::{
    request_id::{PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::admission::{AdmissionQueue, ClientReaper, Outcome, PendingRequest, RequestBody, RequestContext, StreamingBody};
use crate::config::ProxyConfig;
use crate::http::request::{
    client_key, drop_body_framing, rewrite_host, upstream_uri, MakeRequestUuid, X_REQUEST_ID,
};
use crate::http::response::local_response;
use crate::observability::metrics;
use crate::upstream::{Forward, HyperForwarder};

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub queue: AdmissionQueue,
    /// Upstream `host:port`; used for both the URI authority and `Host`.
    pub upstream: Arc<str>,
    pub upstream_host: HeaderValue,
    /// Buffer POST bodies before queueing and log their RPC method.
    pub eager_body: bool,
}

/// HTTP server for the admission proxy.
pub struct HttpServer {
    router: Router,
    config: ProxyConfig,
    queue: AdmissionQueue,
}

impl HttpServer {
    /// Create a server that forwards over a pooled hyper client.
    pub fn new(config: ProxyConfig) -> Result<Self, axum::http::header::InvalidHeaderValue> {
        Self::with_forwarder(config, Arc::new(HyperForwarder::new()))
    }

    /// Create a server around any forwarder.
    pub fn with_forwarder(
        config: ProxyConfig,
        forwarder: Arc<dyn Forward>,
    ) -> Result<Self, axum::http::header::InvalidHeaderValue> {
        let debug = config.observability.debug;
        let queue = AdmissionQueue::new(config.admission.clone(), forwarder, debug);

        let state = AppState {
            queue: queue.clone(),
            upstream: Arc::from(config.upstream.address.as_str()),
            upstream_host: HeaderValue::from_str(&config.upstream.address)?,
            eager_body: debug,
        };

        let router = Self::build_router(state);
        Ok(Self {
            router,
            config,
            queue,
        })
    }

    /// Build the Axum router with all middleware layers.
    fn build_router(state: AppState) -> Router {
        let request_id = HeaderName::from_static(X_REQUEST_ID);
        Router::new()
            .route("/{*path}", any(proxy_handler))
            .route("/", any(proxy_handler))
            .with_state(state)
            .layer(
                ServiceBuilder::new()
                    .layer(SetRequestIdLayer::new(request_id.clone(), MakeRequestUuid))
                    .layer(TraceLayer::new_for_http())
                    .layer(PropagateRequestIdLayer::new(request_id)),
            )
    }

    /// Run the server, accepting connections on the given listener.
    ///
    /// `config_updates` carries validated reloads; only the admission section
    /// is applied live.
    pub async fn run(
        self,
        listener: TcpListener,
        mut config_updates: mpsc::UnboundedReceiver<ProxyConfig>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(
            address = %addr,
            upstream = %self.config.upstream.address,
            "HTTP server starting"
        );

        tokio::spawn(ClientReaper::new(self.queue.clone()).run(shutdown.resubscribe()));

        let queue = self.queue.clone();
        let current = self.config.clone();
        let mut updates_shutdown = shutdown.resubscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    update = config_updates.recv() => {
                        let Some(new_config) = update else { break };
                        if new_config.listener != current.listener || new_config.upstream != current.upstream {
                            tracing::warn!("Listener or upstream changed; restart required to apply");
                        }
                        if new_config.admission != *queue.settings() {
                            queue.update_settings(new_config.admission);
                        }
                    }
                    _ = updates_shutdown.recv() => break,
                }
            }
        });

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                tracing::info!("Shutdown signal received");
            })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }

    /// Get a reference to the config.
    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// The admission queue behind this server.
    pub fn queue(&self) -> &AdmissionQueue {
        &self.queue
    }
}

/// Main proxy handler.
/// Builds a pending unit and waits for the admission queue to settle it.
async fn proxy_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    let method = request.method().clone();
    if !matches!(method, Method::GET | Method::POST | Method::OPTIONS) {
        tracing::debug!(method = %method, "Method not allowed");
        metrics::record_outcome(Outcome::NotAllowed.label());
        return local_response(StatusCode::METHOD_NOT_ALLOWED);
    }

    let (parts, body) = request.into_parts();
    let key = client_key(&parts.headers, peer);
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let uri = match upstream_uri(&state.upstream, &parts.uri) {
        Ok(uri) => uri,
        Err(e) => {
            tracing::error!(client = %key, path = %path, error = %e, "Cannot build upstream URI");
            metrics::record_outcome(Outcome::UpstreamUnavailable.label());
            return local_response(StatusCode::SERVICE_UNAVAILABLE);
        }
    };

    let mut headers = parts.headers;
    rewrite_host(&mut headers, &state.upstream_host);

    let mut context = RequestContext::new(method.clone(), path);
    let max_body_bytes = state.queue.settings().max_body_bytes;
    let body = if method == Method::POST {
        if state.eager_body {
            match axum::body::to_bytes(body, max_body_bytes).await {
                Ok(bytes) => {
                    context = context.with_rpc_method_from(&bytes);
                    RequestBody::Buffered(bytes)
                }
                Err(e) => {
                    tracing::warn!(client = %key, path = %context.log_path(), max_body_bytes, error = %e, "Request body too large");
                    metrics::record_outcome(Outcome::BodyOverflow.label());
                    return local_response(StatusCode::PAYLOAD_TOO_LARGE);
                }
            }
        } else {
            RequestBody::Streaming(StreamingBody::spawn(body, max_body_bytes))
        }
    } else {
        // Only POST bodies go upstream.
        drop_body_framing(&mut headers);
        RequestBody::Empty
    };

    let pending = PendingRequest {
        context,
        uri,
        headers,
        body,
    };
    state.queue.admit(key, pending).into_response().await
}
