//! Transport binding between one SSE stream and its `POST /messages` channel.
//!
//! [`SseServerTransport`] is the duplex end handed to the protocol server: a
//! [`Stream`] of client messages and a [`Sink`] into the session's event
//! stream. The registry keeps the other end, a [`TransportHandle`], which is
//! the only way inbound messages reach the session.

use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use futures::{Sink, SinkExt, Stream, StreamExt, stream::BoxStream};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, PollSender, WaitForCancellationFutureOwned};

use crate::{
    model::{ClientJsonRpcMessage, ServerJsonRpcMessage},
    session::SessionId,
};

const INBOUND_CHANNEL_SIZE: usize = 64;
const OUTBOUND_CHANNEL_SIZE: usize = 64;

/// Server-to-client messages for one session, ending when the session closes.
pub type OutboundStream = BoxStream<'static, ServerJsonRpcMessage>;

pub struct SseServerTransport {
    stream: ReceiverStream<ClientJsonRpcMessage>,
    sink: PollSender<ServerJsonRpcMessage>,
    session_id: SessionId,
    ct: CancellationToken,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl SseServerTransport {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Cancelled when the session is torn down, for whatever reason.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.ct
    }
}

impl std::fmt::Debug for SseServerTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SseServerTransport")
            .field("session_id", &self.session_id)
            .field("cancelled", &self.ct.is_cancelled())
            .finish()
    }
}

impl Drop for SseServerTransport {
    fn drop(&mut self) {
        self.ct.cancel();
    }
}

impl Sink<ServerJsonRpcMessage> for SseServerTransport {
    type Error = io::Error;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.sink.poll_ready_unpin(cx).map_err(io::Error::other)
    }

    fn start_send(mut self: Pin<&mut Self>, item: ServerJsonRpcMessage) -> Result<(), Self::Error> {
        self.sink.start_send_unpin(item).map_err(io::Error::other)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.sink.poll_flush_unpin(cx).map_err(io::Error::other)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let inner_close_result = self.sink.poll_close_unpin(cx).map_err(io::Error::other);
        if inner_close_result.is_ready() {
            self.ct.cancel();
        }
        inner_close_result
    }
}

impl Stream for SseServerTransport {
    type Item = ClientJsonRpcMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        // nothing is delivered once teardown has started, even if queued
        if self.cancelled.as_mut().poll(cx).is_ready() {
            return Poll::Ready(None);
        }
        self.stream.poll_next_unpin(cx)
    }
}

/// Registry-side end of a transport binding.
#[derive(Debug)]
pub(crate) struct TransportHandle {
    inbound: mpsc::Sender<ClientJsonRpcMessage>,
    outbound: mpsc::Sender<ServerJsonRpcMessage>,
    ct: CancellationToken,
}

impl TransportHandle {
    /// Enqueue a client message without waiting. Fails if the server side
    /// has gone away or has a full queue.
    pub(crate) fn send(
        &self,
        message: ClientJsonRpcMessage,
    ) -> Result<(), TrySendError<ClientJsonRpcMessage>> {
        if self.ct.is_cancelled() {
            return Err(TrySendError::Closed(message));
        }
        self.inbound.try_send(message)
    }

    pub(crate) fn cancel(&self) {
        self.ct.cancel();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.ct.is_cancelled()
    }

    pub(crate) fn cancellation_token(&self) -> CancellationToken {
        self.ct.clone()
    }

    /// A sender for the outbound channel, used to notice when the SSE
    /// response body is dropped.
    pub(crate) fn outbound_watch(&self) -> mpsc::Sender<ServerJsonRpcMessage> {
        self.outbound.clone()
    }
}

/// Create both ends of a binding plus the outbound stream for the SSE body.
pub(crate) fn bind(session_id: SessionId) -> (SseServerTransport, TransportHandle, OutboundStream) {
    let ct = CancellationToken::new();
    let (from_client_tx, from_client_rx) = mpsc::channel(INBOUND_CHANNEL_SIZE);
    let (to_client_tx, to_client_rx) = mpsc::channel(OUTBOUND_CHANNEL_SIZE);

    let transport = SseServerTransport {
        stream: ReceiverStream::new(from_client_rx),
        sink: PollSender::new(to_client_tx.clone()),
        session_id,
        ct: ct.clone(),
        cancelled: Box::pin(ct.clone().cancelled_owned()),
    };
    let handle = TransportHandle {
        inbound: from_client_tx,
        outbound: to_client_tx,
        ct: ct.clone(),
    };
    let outbound = ReceiverStream::new(to_client_rx)
        .take_until(ct.cancelled_owned())
        .boxed();
    (transport, handle, outbound)
}
