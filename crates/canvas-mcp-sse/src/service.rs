//! The capabilities a session needs from a protocol server implementation.
//!
//! The registry never looks inside a server: it builds one per session through a
//! [`ServerFactory`], hands it the session's transport with
//! [`ProtocolServer::connect`], and releases it with [`ProtocolServer::close`].

use std::fmt;

use async_trait::async_trait;

use crate::{error::ServerError, transport::SseServerTransport};

/// Downstream API credentials, handed to every new server by value.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub token: String,
    pub domain: String,
}

impl Credentials {
    pub fn new(token: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            domain: domain.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("token", &"<redacted>")
            .field("domain", &self.domain)
            .finish()
    }
}

#[async_trait]
pub trait ProtocolServer: Send + Sync {
    /// Bind the server to `transport`. Once this returns `Ok`, the server is
    /// processing inbound messages. The server owns the transport from here on;
    /// dropping it ends the session.
    async fn connect(&self, transport: SseServerTransport) -> Result<(), ServerError>;

    /// Stop processing and release held resources. Called once, after the
    /// session has been removed from the registry and its transport cancelled.
    async fn close(&self) -> Result<(), ServerError>;
}

pub trait ServerFactory: Send + Sync + 'static {
    fn create_server(&self, credentials: Credentials)
    -> Result<Box<dyn ProtocolServer>, ServerError>;
}

impl<F> ServerFactory for F
where
    F: Fn(Credentials) -> Result<Box<dyn ProtocolServer>, ServerError> + Send + Sync + 'static,
{
    fn create_server(
        &self,
        credentials: Credentials,
    ) -> Result<Box<dyn ProtocolServer>, ServerError> {
        (self)(credentials)
    }
}
