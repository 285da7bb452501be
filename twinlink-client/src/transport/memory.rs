//! In-process transport
//!
//! [`MemoryTransport::pair`] returns the client side plus a [`RemoteEnd`]
//! that plays the registry: it sees every outbound frame and can push
//! replies, events and connection loss/restore notifications.

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::mpsc;

use twinlink_protocol::{
    ClientFrame, CorrelationId, ErrorCode, ReplyOutcome, ServerFrame, ThingEvent, ThingOperation,
};
use twinlink_utils::{Result, TwinError};

use super::{Transport, TransportEvent, TransportSession, EVENT_CHANNEL_CAPACITY};
use crate::config::ClientConfig;

/// Client half of an in-memory connection
#[derive(Debug)]
pub struct MemoryTransport {
    outbound: mpsc::UnboundedSender<ClientFrame>,
    events: mpsc::Receiver<TransportEvent>,
    reject: Option<String>,
}

/// Registry half of an in-memory connection
#[derive(Debug)]
pub struct RemoteEnd {
    inbound: mpsc::UnboundedReceiver<ClientFrame>,
    events: mpsc::Sender<TransportEvent>,
}

impl MemoryTransport {
    pub fn pair() -> (Self, RemoteEnd) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        (
            Self {
                outbound: outbound_tx,
                events: events_rx,
                reject: None,
            },
            RemoteEnd {
                inbound: outbound_rx,
                events: events_tx,
            },
        )
    }

    /// Make the handshake fail with the given reason
    pub fn rejecting(mut self, reason: impl Into<String>) -> Self {
        self.reject = Some(reason.into());
        self
    }
}

impl Transport for MemoryTransport {
    fn open(self, config: &ClientConfig) -> BoxFuture<'static, Result<TransportSession>> {
        let connect = ClientFrame::Connect {
            client_id: config.client_id.clone(),
            protocol_version: twinlink_protocol::PROTOCOL_VERSION,
            credentials: config.auth.credentials(),
        };

        async move {
            self.outbound
                .send(connect)
                .map_err(|_| TwinError::connection("Remote end dropped"))?;

            if let Some(reason) = self.reject {
                return Err(TwinError::AuthenticationFailed(reason));
            }

            let session_id = uuid::Uuid::new_v4().to_string();
            Ok(TransportSession::new(
                session_id,
                self.outbound,
                self.events,
                None,
            ))
        }
        .boxed()
    }
}

impl RemoteEnd {
    /// Next frame sent by the client
    pub async fn recv(&mut self) -> Option<ClientFrame> {
        self.inbound.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ClientFrame> {
        self.inbound.try_recv().ok()
    }

    /// Next correlated request, skipping handshake frames
    pub async fn next_request(&mut self) -> Option<(CorrelationId, ThingOperation)> {
        while let Some(frame) = self.inbound.recv().await {
            match frame {
                ClientFrame::Request {
                    correlation_id,
                    operation,
                } => return Some((correlation_id, operation)),
                ClientFrame::Disconnect => return None,
                ClientFrame::Connect { .. } => continue,
            }
        }
        None
    }

    pub async fn send(&self, frame: ServerFrame) -> Result<()> {
        self.push(TransportEvent::Frame(frame)).await
    }

    pub async fn reply(&self, correlation_id: CorrelationId, outcome: ReplyOutcome) -> Result<()> {
        self.send(ServerFrame::Reply {
            correlation_id,
            outcome,
        })
        .await
    }

    pub async fn reply_ok(
        &self,
        correlation_id: CorrelationId,
        payload: Option<serde_json::Value>,
    ) -> Result<()> {
        self.reply(correlation_id, ReplyOutcome::Success(payload.map(Into::into)))
            .await
    }

    pub async fn reply_err(
        &self,
        correlation_id: CorrelationId,
        code: ErrorCode,
        message: impl Into<String>,
    ) -> Result<()> {
        self.reply(
            correlation_id,
            ReplyOutcome::Failure {
                code,
                message: message.into(),
            },
        )
        .await
    }

    pub async fn push_event(&self, event: ThingEvent) -> Result<()> {
        self.send(ServerFrame::Event(event)).await
    }

    /// Simulate a dropped connection
    pub async fn lose(&self, reason: impl Into<String>) -> Result<()> {
        self.push(TransportEvent::Lost(reason.into())).await
    }

    /// Simulate a successful reconnect
    pub async fn restore(&self) -> Result<()> {
        self.push(TransportEvent::Restored).await
    }

    async fn push(&self, event: TransportEvent) -> Result<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| TwinError::ConnectionClosed)
    }
}
