//! Test doubles: a protocol server that records everything it sees, and
//! health probes with fixed answers.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use canvas_mcp_sse::{
    CanvasError, Credentials, HealthProbe, ProtocolServer, ServerError, ServerFactory, SessionId,
    SseServerTransport,
    model::{ClientJsonRpcMessage, JsonRpcMessage},
};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Created(Credentials),
    Connected(SessionId),
    Received(SessionId, ClientJsonRpcMessage),
    Closed(SessionId),
}

/// Hands out [`RecordingServer`]s that all write to one shared log.
///
/// Every request a server receives is answered with an empty result, so the
/// reply shows up on the session's event stream.
#[derive(Clone, Default)]
pub struct RecordingFactory {
    log: Arc<Mutex<Vec<Record>>>,
    connect_delay: Duration,
}

impl RecordingFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Servers from this factory wait `delay` inside `connect`.
    pub fn with_connect_delay(delay: Duration) -> Self {
        Self {
            connect_delay: delay,
            ..Self::default()
        }
    }

    pub fn records(&self) -> Vec<Record> {
        self.log.lock().clone()
    }

    pub fn received(&self, session_id: &str) -> Vec<ClientJsonRpcMessage> {
        self.log
            .lock()
            .iter()
            .filter_map(|record| match record {
                Record::Received(id, message) if &**id == session_id => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn created(&self) -> usize {
        self.count(|record| matches!(record, Record::Created(_)))
    }

    pub fn closed(&self) -> usize {
        self.count(|record| matches!(record, Record::Closed(_)))
    }

    pub fn is_closed(&self, session_id: &str) -> bool {
        self.log
            .lock()
            .iter()
            .any(|record| matches!(record, Record::Closed(id) if &**id == session_id))
    }

    fn count(&self, predicate: impl Fn(&Record) -> bool) -> usize {
        self.log.lock().iter().filter(|record| predicate(record)).count()
    }
}

impl ServerFactory for RecordingFactory {
    fn create_server(
        &self,
        credentials: Credentials,
    ) -> Result<Box<dyn ProtocolServer>, ServerError> {
        self.log.lock().push(Record::Created(credentials));
        Ok(Box::new(RecordingServer {
            log: self.log.clone(),
            connect_delay: self.connect_delay,
            session: Mutex::new(None),
        }))
    }
}

pub struct RecordingServer {
    log: Arc<Mutex<Vec<Record>>>,
    connect_delay: Duration,
    session: Mutex<Option<(SessionId, JoinHandle<()>)>>,
}

#[async_trait]
impl ProtocolServer for RecordingServer {
    async fn connect(&self, mut transport: SseServerTransport) -> Result<(), ServerError> {
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        let id = transport.session_id().clone();
        self.log.lock().push(Record::Connected(id.clone()));
        let log = self.log.clone();
        let session_id = id.clone();
        let task = tokio::spawn(async move {
            while let Some(message) = transport.next().await {
                log.lock()
                    .push(Record::Received(session_id.clone(), message.clone()));
                if let JsonRpcMessage::Request(request) = message {
                    let reply = JsonRpcMessage::response(request.id, json!({}));
                    if transport.send(reply).await.is_err() {
                        break;
                    }
                }
            }
        });
        *self.session.lock() = Some((id, task));
        Ok(())
    }

    async fn close(&self) -> Result<(), ServerError> {
        let Some((id, task)) = self.session.lock().take() else {
            return Ok(());
        };
        if tokio::time::timeout(Duration::from_secs(2), task).await.is_err() {
            return Err(ServerError::TransportClosed("recording loop did not stop".into()));
        }
        self.log.lock().push(Record::Closed(id));
        Ok(())
    }
}

/// A server that gives its transport back right away, as if it crashed
/// while connecting.
pub fn dropping_factory(_: Credentials) -> Result<Box<dyn ProtocolServer>, ServerError> {
    struct Dropping;

    #[async_trait]
    impl ProtocolServer for Dropping {
        async fn connect(&self, transport: SseServerTransport) -> Result<(), ServerError> {
            drop(transport);
            Ok(())
        }
        async fn close(&self) -> Result<(), ServerError> {
            Ok(())
        }
    }

    Ok(Box::new(Dropping))
}

pub struct StaticProbe(pub Value);

#[async_trait]
impl HealthProbe for StaticProbe {
    async fn health_check(&self) -> Result<Value, CanvasError> {
        Ok(self.0.clone())
    }
}

pub struct FailingProbe;

#[async_trait]
impl HealthProbe for FailingProbe {
    async fn health_check(&self) -> Result<Value, CanvasError> {
        Err(CanvasError::InvalidDomain("unreachable.invalid".to_string()))
    }
}

pub fn credentials() -> Credentials {
    Credentials::new("test-token", "canvas.example.edu")
}
