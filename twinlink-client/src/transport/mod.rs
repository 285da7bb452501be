//! Transport session boundary
//!
//! The client core only produces [`ClientFrame`]s and consumes
//! [`TransportEvent`]s. A [`Transport`] owns everything below that line:
//! sockets, codecs, handshake and reconnecting.

mod framed;
mod memory;

pub use framed::FramedTransport;
pub use memory::{MemoryTransport, RemoteEnd};

use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use twinlink_protocol::{ClientFrame, ServerFrame};
use twinlink_utils::{Result, TwinError};

use crate::config::ClientConfig;

/// Capacity of the inbound event channel
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 256;

/// How long `close` waits for the I/O task to flush the disconnect
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// What a transport reports to the client
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A frame arrived from the registry
    Frame(ServerFrame),
    /// The connection dropped; outstanding requests will not be answered
    Lost(String),
    /// The connection was re-established after a loss
    Restored,
}

/// Opens authenticated sessions to the registry
pub trait Transport: Send + 'static {
    /// Connect and authenticate, resolving once the session is usable
    fn open(self, config: &ClientConfig) -> BoxFuture<'static, Result<TransportSession>>;
}

/// Cloneable handle for queueing outbound frames
#[derive(Debug, Clone)]
pub struct FrameSender {
    tx: mpsc::UnboundedSender<ClientFrame>,
}

impl FrameSender {
    pub fn new(tx: mpsc::UnboundedSender<ClientFrame>) -> Self {
        Self { tx }
    }

    /// Queue a frame without waiting
    pub fn send(&self, frame: ClientFrame) -> Result<()> {
        self.tx.send(frame).map_err(|_| TwinError::ConnectionClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// An open session: outbound frame queue, inbound event stream and the
/// task driving the I/O
pub struct TransportSession {
    session_id: String,
    sender: FrameSender,
    events: Option<mpsc::Receiver<TransportEvent>>,
    task: Option<JoinHandle<()>>,
}

impl TransportSession {
    pub fn new(
        session_id: impl Into<String>,
        outbound: mpsc::UnboundedSender<ClientFrame>,
        events: mpsc::Receiver<TransportEvent>,
        task: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            sender: FrameSender::new(outbound),
            events: Some(events),
            task,
        }
    }

    /// Session id assigned by the registry during the handshake
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn sender(&self) -> FrameSender {
        self.sender.clone()
    }

    pub fn send(&self, frame: ClientFrame) -> Result<()> {
        self.sender.send(frame)
    }

    /// Take the inbound event stream; only the first call returns it
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.events.take()
    }

    /// Send a graceful disconnect and wait briefly for the I/O task to end
    pub async fn close(mut self) {
        let _ = self.sender.send(ClientFrame::Disconnect);

        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(CLOSE_TIMEOUT, &mut task).await.is_err() {
                tracing::debug!(session = %self.session_id, "Transport task did not stop, aborting");
                task.abort();
            }
        }
        tracing::debug!(session = %self.session_id, "Transport session closed");
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for TransportSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSession")
            .field("session_id", &self.session_id)
            .field("has_task", &self.task.is_some())
            .finish()
    }
}
