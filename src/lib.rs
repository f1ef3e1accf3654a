//! Per-client admission proxy.
//!
//! Every inbound request is queued per client and released to a single fixed
//! upstream after a delay derived from that client's recent consumption of
//! upstream time. Clients that keep more than the target number of requests
//! in flight are stretched out instead of refused; clients with a full queue
//! get 429.

// Core subsystems
pub mod admission;
pub mod config;
pub mod http;
pub mod upstream;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;

pub use admission::AdmissionQueue;
pub use config::schema::ProxyConfig;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
pub use upstream::{Forward, HyperForwarder};
