//! Streamable HTTP transport for JSON-RPC 2.0 / MCP servers.
//!
//! - **jsonrpc**: envelope types and classification of raw JSON bodies
//! - **transport**: the HTTP endpoint, batch and SSE response delivery,
//!   sessions and stream resumability
//! - **auth**: API key, JWT and custom authentication providers
//! - **config**: transport settings with environment variable overrides
//! - **bootstrap**: tracing initialization
//!
//! # Features
//!
//! - `jwt` - JWT bearer token provider (enabled by default)
//! - `bootstrap` - Tracing setup via `init_tracing` (enabled by default)
//! - `full` - All features
//!
//! # Example
//!
//! ```rust,no_run
//! use mcp_http_stream::{Envelope, HttpStreamTransport, TransportConfig};
//! use mcp_http_stream::transport::IncomingMessage;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = HttpStreamTransport::new(TransportConfig::from_env())?;
//! let replies = transport.clone();
//! transport.set_handler(move |incoming: IncomingMessage| {
//!     if let Envelope::Request(request) = incoming.message {
//!         replies.send(Envelope::success(request.id, serde_json::json!({})));
//!     }
//! });
//! transport.serve(transport.bind().await?).await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod config;
pub mod error;
pub mod jsonrpc;
pub mod transport;

#[cfg(feature = "bootstrap")]
pub mod bootstrap;

pub use auth::{AuthProvider, Authenticator};
pub use config::{ResponseMode, ResumabilityMode, TransportConfig};
pub use error::TransportError;
pub use jsonrpc::{Envelope, RequestId};
pub use transport::{HttpStreamTransport, IncomingMessage, MessageHandler};

#[cfg(feature = "bootstrap")]
pub use bootstrap::{init_tracing, try_init_tracing};
