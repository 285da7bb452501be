//! Integration client facade
//!
//! Owns the transport session, the correlation table and the subscription
//! registry, and runs the two background tasks that feed them: the
//! dispatch loop (inbound frames) and the timeout sweeper.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use twinlink_protocol::{AttributeChange, AttributePath, LifecycleEvent, ServerFrame, ThingOperation};
use twinlink_utils::{OperationError, Result, TwinError};

use crate::config::ClientConfig;
use crate::correlation::{Continuations, CorrelationTable};
use crate::handle::{ThingHandle, Things};
use crate::operation::{OperationBuilder, OperationHandle};
use crate::registry::{Filter, Handler, SubscriptionRegistry};
use crate::transport::{FrameSender, FramedTransport, Transport, TransportEvent, TransportSession};

/// Connection state of the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
    Closed,
}

/// State shared by the client and every handle derived from it
pub(crate) struct ClientShared {
    config: ClientConfig,
    session_id: String,
    state: watch::Sender<ConnectionState>,
    correlations: Arc<CorrelationTable>,
    subscriptions: SubscriptionRegistry,
    sender: FrameSender,
}

impl ClientShared {
    pub(crate) fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Submit a correlated request if the client is connected
    pub(crate) fn submit(
        &self,
        operation: ThingOperation,
        timeout: Duration,
        continuations: Continuations,
    ) -> Result<OperationHandle> {
        match self.state() {
            ConnectionState::Connected => {}
            ConnectionState::Disconnected | ConnectionState::Connecting => {
                return Err(TwinError::NotConnected)
            }
            ConnectionState::Closing | ConnectionState::Closed => {
                return Err(TwinError::ClientClosed)
            }
        }

        let handle = self
            .correlations
            .submit(operation, timeout, continuations, &self.sender)?;

        // The connection may have dropped between the check and the insert
        match self.state() {
            ConnectionState::Connected => {}
            ConnectionState::Disconnected | ConnectionState::Connecting => {
                self.correlations
                    .fail(handle.correlation_id(), OperationError::ConnectionLost);
            }
            ConnectionState::Closing | ConnectionState::Closed => {
                self.correlations
                    .fail(handle.correlation_id(), OperationError::ShuttingDown);
            }
        }
        Ok(handle)
    }

    pub(crate) fn register(&self, registration_id: String, filter: Filter, handler: Handler) -> Result<()> {
        if matches!(
            self.state(),
            ConnectionState::Closing | ConnectionState::Closed
        ) {
            return Err(TwinError::ClientClosed);
        }
        self.subscriptions.register(registration_id, filter, handler)
    }

    pub(crate) fn deregister(&self, registration_id: &str) -> bool {
        self.subscriptions.deregister(registration_id)
    }

    fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Frame(ServerFrame::Reply {
                correlation_id,
                outcome,
            }) => {
                self.correlations.on_reply(correlation_id, outcome);
            }
            TransportEvent::Frame(ServerFrame::Event(event)) => {
                self.subscriptions.dispatch(&event);
            }
            TransportEvent::Frame(other) => {
                tracing::warn!(frame = ?other, "Unexpected frame after handshake");
            }
            TransportEvent::Lost(reason) => self.on_connection_lost(&reason),
            TransportEvent::Restored => {
                let restored = self.state.send_if_modified(|state| {
                    if *state == ConnectionState::Disconnected {
                        *state = ConnectionState::Connected;
                        true
                    } else {
                        false
                    }
                });
                if restored {
                    tracing::info!(
                        subscriptions = self.subscriptions.len(),
                        "Connection restored"
                    );
                }
            }
        }
    }

    fn on_connection_lost(&self, reason: &str) {
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Connected {
                *state = ConnectionState::Disconnected;
                true
            } else {
                false
            }
        });
        let failed = self.correlations.fail_all(OperationError::ConnectionLost);
        tracing::warn!(reason, failed, "Connection lost");
    }
}

/// Background tasks and the session they serve
struct Background {
    session: TransportSession,
    dispatch: JoinHandle<()>,
    sweeper: JoinHandle<()>,
}

/// Client for the twin registry
pub struct IntegrationClient {
    shared: Arc<ClientShared>,
    background: Mutex<Option<Background>>,
}

impl IntegrationClient {
    /// Connect to the configured endpoint over TCP or a Unix socket
    pub async fn create(config: ClientConfig) -> Result<Self> {
        Self::create_with_transport(config, FramedTransport::new()).await
    }

    /// Connect through any [`Transport`]
    pub async fn create_with_transport<T: Transport>(config: ClientConfig, transport: T) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current()
            .map_err(|_| TwinError::internal("IntegrationClient must be created inside a Tokio runtime"))?;

        let (state, _) = watch::channel(ConnectionState::Disconnected);
        state.send_replace(ConnectionState::Connecting);
        tracing::info!(endpoint = %config.endpoint, client_id = %config.client_id, "Connecting");
        let mut session = transport.open(&config).await.map_err(|e| {
            state.send_replace(ConnectionState::Disconnected);
            tracing::error!(endpoint = %config.endpoint, error = %e, "Failed to connect");
            e
        })?;
        let events = session
            .take_events()
            .ok_or_else(|| TwinError::internal("Transport session has no event stream"))?;

        state.send_replace(ConnectionState::Connected);
        let shared = Arc::new(ClientShared {
            session_id: session.session_id().to_string(),
            sender: session.sender(),
            config,
            state,
            correlations: Arc::new(CorrelationTable::new()),
            subscriptions: SubscriptionRegistry::new(runtime.clone()),
        });

        let dispatch = runtime.spawn(dispatch_loop(shared.clone(), events));
        let sweeper = runtime.spawn(shared.correlations.clone().run_sweeper());

        tracing::info!(session = %shared.session_id, "Client connected");
        Ok(Self {
            shared,
            background: Mutex::new(Some(Background {
                session,
                dispatch,
                sweeper,
            })),
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Subscribe to state transitions
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// Number of operations awaiting a reply
    pub fn pending_operations(&self) -> usize {
        self.shared.correlations.len()
    }

    /// Number of active registrations
    pub fn registrations(&self) -> usize {
        self.shared.subscriptions.len()
    }

    pub fn things(&self) -> Things {
        Things::new(self.shared.clone())
    }

    pub fn for_thing(&self, thing_id: impl Into<String>) -> ThingHandle {
        ThingHandle::new(self.shared.clone(), thing_id.into())
    }

    pub fn create_thing(&self, thing_id: impl Into<String>) -> OperationBuilder {
        self.things().create_with_id(thing_id)
    }

    pub fn register_for_thing_lifecycle_event<F>(
        &self,
        registration_id: impl Into<String>,
        handler: F,
    ) -> Result<()>
    where
        F: FnMut(LifecycleEvent) + Send + 'static,
    {
        self.things().register_for_lifecycle_event(registration_id, handler)
    }

    pub fn register_for_thing_attribute_change<F>(
        &self,
        registration_id: impl Into<String>,
        handler: F,
    ) -> Result<()>
    where
        F: FnMut(AttributeChange) + Send + 'static,
    {
        self.things().register_for_attribute_change(registration_id, handler)
    }

    pub fn register_for_thing_attribute_path_change<F>(
        &self,
        registration_id: impl Into<String>,
        path: impl Into<AttributePath>,
        handler: F,
    ) -> Result<()>
    where
        F: FnMut(AttributeChange) + Send + 'static,
    {
        self.things()
            .register_for_attribute_path_change(registration_id, path, handler)
    }

    /// Terminate a registration; returns whether it existed
    pub fn deregister(&self, registration_id: &str) -> bool {
        self.shared.deregister(registration_id)
    }

    /// Shut down, giving outstanding operations up to `timeout` to finish
    ///
    /// Operations still outstanding afterwards fail with
    /// `OperationError::ShuttingDown`. Calling this again is a no-op.
    pub async fn destroy(&self, timeout: Duration) {
        let Some(background) = self.background.lock().take() else {
            tracing::debug!("Client already destroyed");
            return;
        };

        self.shared.state.send_replace(ConnectionState::Closing);
        tracing::info!(
            outstanding = self.shared.correlations.len(),
            grace_ms = timeout.as_millis() as u64,
            "Destroying client"
        );

        if tokio::time::timeout(timeout, self.shared.correlations.wait_idle())
            .await
            .is_err()
        {
            let failed = self.shared.correlations.fail_all(OperationError::ShuttingDown);
            tracing::warn!(failed, "Grace period elapsed, failing outstanding operations");
        }

        let removed = self.shared.subscriptions.clear();
        background.dispatch.abort();
        background.sweeper.abort();
        background.session.close().await;

        self.shared.state.send_replace(ConnectionState::Closed);
        tracing::info!(removed_subscriptions = removed, "Client closed");
    }

    /// [`destroy`](Self::destroy) with the configured shutdown grace
    pub async fn destroy_default(&self) {
        self.destroy(self.shared.config.shutdown_grace()).await
    }
}

impl Drop for IntegrationClient {
    fn drop(&mut self) {
        if let Some(background) = self.background.get_mut().take() {
            tracing::debug!("Client dropped without destroy, stopping tasks");
            self.shared.state.send_replace(ConnectionState::Closed);
            background.dispatch.abort();
            background.sweeper.abort();
            self.shared.correlations.fail_all(OperationError::ShuttingDown);
            self.shared.subscriptions.clear();
        }
    }
}

impl std::fmt::Debug for IntegrationClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntegrationClient")
            .field("session_id", &self.shared.session_id)
            .field("state", &self.state())
            .field("correlations", &self.shared.correlations)
            .field("subscriptions", &self.shared.subscriptions)
            .finish()
    }
}

/// Route inbound transport events until the stream ends
async fn dispatch_loop(shared: Arc<ClientShared>, mut events: mpsc::Receiver<TransportEvent>) {
    while let Some(event) = events.recv().await {
        shared.handle_transport_event(event);
    }
    shared.on_connection_lost("Transport stream ended");
}
