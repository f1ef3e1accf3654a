//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, request ID and trace layers)
//!     → request.rs (client key, upstream URI, Host rewrite)
//!     → admission queue (429 / queued)
//!     → response.rs (locally generated answers) or upstream passthrough
//!     → Send to client
//! ```

pub mod request;
pub mod response;
pub mod server;

pub use request::{client_key, MakeRequestUuid, X_REQUEST_ID};
pub use response::{local_response, SERVER_NAME};
pub use server::HttpServer;
