use std::borrow::Cow;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised by a protocol server while being built, connected or closed.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("transport closed: {0}")]
    TransportClosed(Cow<'static, str>),
    #[error("server task failed: {0}")]
    Runtime(#[from] tokio::task::JoinError),
    #[error("{context}: {error}")]
    Other {
        context: Cow<'static, str>,
        #[source]
        error: BoxError,
    },
}

impl ServerError {
    pub fn other(context: impl Into<Cow<'static, str>>, error: impl Into<BoxError>) -> Self {
        ServerError::Other {
            context: context.into(),
            error: error.into(),
        }
    }
}

/// Reasons a session could not be opened. No session is registered when one
/// of these is returned.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("failed to create protocol server: {0}")]
    Factory(#[source] ServerError),
    #[error("failed to connect protocol server: {0}")]
    Connect(#[source] ServerError),
    #[error("session {0} was closed or the registry shut down before registration")]
    ClosedDuringSetup(crate::session::SessionId),
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;

    #[test]
    fn test_server_error_other_display() {
        let error = ServerError::other("connect", io::Error::other("connection failed"));
        assert_eq!(error.to_string(), "connect: connection failed");
    }

    #[test]
    fn test_session_error_keeps_source() {
        use std::error::Error;
        let error = SessionError::Connect(ServerError::TransportClosed("eof".into()));
        assert!(error.to_string().contains("failed to connect"));
        assert!(error.source().is_some());
    }
}
