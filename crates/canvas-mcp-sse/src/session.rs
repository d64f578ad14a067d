//! Session registry for the SSE transport.
//!
//! A *session* pairs one open SSE stream with one dedicated protocol server.
//! The registry is the only owner of the id → session mapping:
//!
//! * [`SessionRegistry::create_session`] builds the transport binding, asks the
//!   [`ServerFactory`] for a fresh server, connects the two and registers them.
//! * [`SessionRegistry::route_inbound`] forwards a `POST /messages` payload to
//!   the session named by its `sessionId`.
//! * [`SessionRegistry::close_session`] tears a session down; it is idempotent.
//!
//! The mapping lives behind a mutex that is never held across an `.await`.
//! Lookup-and-enqueue and remove-and-cancel each happen inside one critical
//! section, so a message is either queued before teardown starts or rejected.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    error::SessionError,
    model::{ClientJsonRpcMessage, ServerJsonRpcMessage},
    service::{Credentials, ProtocolServer, ServerFactory},
    transport::{self, OutboundStream, TransportHandle},
};

pub type SessionId = Arc<str>;

struct Session {
    transport: TransportHandle,
    server: Box<dyn ProtocolServer>,
}

#[derive(Default)]
struct SessionTable {
    sessions: HashMap<SessionId, Session>,
    /// Set by [`SessionRegistry::close_all`]; nothing is registered afterwards.
    shut_down: bool,
}

/// What happened to an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Delivered,
    /// The request carried no `sessionId`.
    MissingSessionId,
    /// No live session has that id, e.g. its stream already closed.
    UnknownSession,
    /// The session is registered but its server stopped reading.
    SessionClosed,
    /// The session's server is too far behind; the message was dropped.
    QueueFull,
}

/// A newly registered session and the messages to stream back to its client.
pub struct OpenedSession {
    pub id: SessionId,
    pub outbound: OutboundStream,
}

impl std::fmt::Debug for OpenedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenedSession")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

pub struct SessionRegistry {
    table: Mutex<SessionTable>,
    factory: Box<dyn ServerFactory>,
    next_seq: AtomicU64,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.len())
            .finish_non_exhaustive()
    }
}

impl SessionRegistry {
    pub fn new(factory: impl ServerFactory) -> Self {
        Self {
            table: Mutex::new(SessionTable::default()),
            factory: Box::new(factory),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Ids are `<counter>-<uuid>`: the counter makes them unique for the life
    /// of the process, the uuid makes them hard to guess.
    fn next_session_id(&self) -> SessionId {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        format!("{seq:x}-{}", uuid::Uuid::new_v4().simple()).into()
    }

    pub async fn create_session(
        self: &Arc<Self>,
        credentials: Credentials,
    ) -> Result<OpenedSession, SessionError> {
        let id = self.next_session_id();
        let (transport, handle, outbound) = transport::bind(id.clone());
        // cancels the transport if this future is dropped before registration
        let setup_guard = handle.cancellation_token().drop_guard();
        if self.table.lock().shut_down {
            return Err(SessionError::ClosedDuringSetup(id));
        }

        let server = self
            .factory
            .create_server(credentials)
            .map_err(SessionError::Factory)?;
        if let Err(e) = server.connect(transport).await {
            handle.cancel();
            if let Err(close_error) = server.close().await {
                tracing::debug!(session_id = %id, error = %close_error, "close after failed connect");
            }
            return Err(SessionError::Connect(e));
        }

        {
            let mut table = self.table.lock();
            if !handle.is_closed() && !table.shut_down {
                setup_guard.disarm();
                let watch = handle.outbound_watch();
                let ct = handle.cancellation_token();
                table.sessions.insert(
                    id.clone(),
                    Session {
                        transport: handle,
                        server,
                    },
                );
                drop(table);
                self.spawn_watcher(id.clone(), watch, ct);
                tracing::info!(session_id = %id, "session established");
                return Ok(OpenedSession { id, outbound });
            }
        }

        handle.cancel();
        if let Err(close_error) = server.close().await {
            tracing::debug!(session_id = %id, error = %close_error, "close after early shutdown");
        }
        Err(SessionError::ClosedDuringSetup(id))
    }

    /// Waits for the client to drop the SSE body or for the transport to be
    /// cancelled, then tears the session down.
    fn spawn_watcher(
        self: &Arc<Self>,
        id: SessionId,
        watch: mpsc::Sender<ServerJsonRpcMessage>,
        ct: CancellationToken,
    ) {
        let registry = Arc::clone(self);
        let span = tracing::debug_span!("session-watcher", session_id = %id);
        tokio::spawn(
            async move {
                tokio::select! {
                    _ = watch.closed() => {
                        tracing::info!("client disconnected");
                    }
                    _ = ct.cancelled() => {
                        tracing::debug!("transport closed");
                    }
                }
                drop(watch);
                registry.close_session(&id).await;
            }
            .instrument(span),
        );
    }

    pub fn route_inbound(
        &self,
        session_id: Option<&str>,
        message: ClientJsonRpcMessage,
    ) -> RouteOutcome {
        let Some(session_id) = session_id else {
            tracing::warn!(method = ?message.method(), "inbound message without session id");
            return RouteOutcome::MissingSessionId;
        };
        let table = self.table.lock();
        let Some(session) = table.sessions.get(session_id) else {
            tracing::warn!(session_id, method = ?message.method(), "inbound message for unknown session");
            return RouteOutcome::UnknownSession;
        };
        match session.transport.send(message) {
            Ok(()) => RouteOutcome::Delivered,
            Err(TrySendError::Full(message)) => {
                tracing::warn!(session_id, method = ?message.method(), "inbound queue full, dropping message");
                RouteOutcome::QueueFull
            }
            Err(TrySendError::Closed(message)) => {
                tracing::warn!(session_id, method = ?message.method(), "inbound message for closed session");
                RouteOutcome::SessionClosed
            }
        }
    }

    /// Remove the session and release its server. Returns `false` when there
    /// was nothing to close.
    pub async fn close_session(&self, id: &str) -> bool {
        let session = {
            let mut table = self.table.lock();
            let session = table.sessions.remove(id);
            if let Some(session) = &session {
                session.transport.cancel();
            }
            session
        };
        let Some(Session { transport, server }) = session else {
            return false;
        };
        drop(transport);
        if let Err(e) = server.close().await {
            tracing::warn!(session_id = id, error = %e, "protocol server close failed");
        }
        tracing::info!(session_id = id, "session closed");
        true
    }

    /// Close every session and refuse new ones. Used on shutdown.
    pub async fn close_all(&self) {
        let drained: Vec<(SessionId, Session)> = {
            let mut table = self.table.lock();
            table.shut_down = true;
            let drained: Vec<_> = table.sessions.drain().collect();
            for (_, session) in &drained {
                session.transport.cancel();
            }
            drained
        };
        if drained.is_empty() {
            return;
        }
        tracing::info!(count = drained.len(), "closing all sessions");
        let closes = drained.into_iter().map(|(id, Session { transport, server })| {
            drop(transport);
            async move {
                if let Err(e) = server.close().await {
                    tracing::warn!(session_id = %id, error = %e, "protocol server close failed");
                }
            }
        });
        futures::future::join_all(closes).await;
    }

    pub fn len(&self) -> usize {
        self.table.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().sessions.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.table.lock().sessions.contains_key(id)
    }
}
