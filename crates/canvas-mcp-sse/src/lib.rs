//! Canvas LMS MCP server over Server-Sent Events.
//!
//! Every client that opens the SSE endpoint gets its own protocol server,
//! built from the configured Canvas credentials and torn down when the stream
//! closes. Client-to-server messages arrive on a separate `POST` endpoint and
//! are routed to the owning session by its `sessionId`.
//!
//! ```ignore
//! use std::sync::Arc;
//! use canvas_mcp_sse::{CanvasClient, SseServer, SseServerConfig, canvas_server_factory};
//!
//! let config = SseServerConfig::new("127.0.0.1:3000".parse()?, credentials.clone());
//! let probe = Arc::new(CanvasClient::new(&credentials)?);
//! let server = SseServer::serve_with_config(config, canvas_server_factory, probe).await?;
//! ```

pub mod canvas;
pub mod config;
mod error;
pub mod handler;
pub mod model;
pub mod server;
pub mod service;
pub mod session;
pub mod transport;

pub use canvas::{CanvasClient, CanvasError, HealthProbe};
pub use error::{BoxError, ServerError, SessionError};
pub use handler::{CanvasServer, canvas_server_factory};
pub use server::{DEFAULT_AUTO_PING_INTERVAL, SseServer, SseServerConfig};
pub use service::{Credentials, ProtocolServer, ServerFactory};
pub use session::{OpenedSession, RouteOutcome, SessionId, SessionRegistry};
pub use transport::{OutboundStream, SseServerTransport};
