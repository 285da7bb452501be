//! Deferred remote operations
//!
//! An [`OperationBuilder`] collects continuations and a timeout; nothing is
//! sent until [`OperationBuilder::apply`]. The resulting [`OperationHandle`]
//! is a future that resolves when the correlated reply arrives, the
//! deadline passes, the connection drops or the client shuts down.

use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::oneshot;

use twinlink_protocol::{CorrelationId, ThingOperation};
use twinlink_utils::{OperationError, Result};

use crate::client::ClientShared;
use crate::correlation::{Continuations, Outcome};

/// Builder for a single remote operation
#[must_use = "operations are only sent by `apply()` or `.await`"]
pub struct OperationBuilder {
    shared: Arc<ClientShared>,
    operation: ThingOperation,
    timeout: Option<Duration>,
    continuations: Continuations,
}

impl OperationBuilder {
    pub(crate) fn new(shared: Arc<ClientShared>, operation: ThingOperation) -> Self {
        Self {
            shared,
            operation,
            timeout: None,
            continuations: Continuations::default(),
        }
    }

    /// Run `f` with the reply payload (`Value::Null` if the reply was empty)
    pub fn on_success<F>(mut self, f: F) -> Self
    where
        F: FnOnce(Value) + Send + 'static,
    {
        self.continuations.on_success = Some(Box::new(f));
        self
    }

    /// Run `f` when the operation fails for any reason
    pub fn on_failure<F>(mut self, f: F) -> Self
    where
        F: FnOnce(OperationError) + Send + 'static,
    {
        self.continuations.on_failure = Some(Box::new(f));
        self
    }

    /// Override the configured request timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn operation(&self) -> &ThingOperation {
        &self.operation
    }

    /// Submit the operation
    ///
    /// Fails with `NotConnected` or `ClientClosed` without sending anything
    /// when the client cannot currently accept requests.
    pub fn apply(self) -> Result<OperationHandle> {
        let timeout = self
            .timeout
            .unwrap_or_else(|| self.shared.config().request_timeout());
        self.shared
            .submit(self.operation, timeout, self.continuations)
    }
}

impl IntoFuture for OperationBuilder {
    type Output = Result<Value>;
    type IntoFuture = BoxFuture<'static, Result<Value>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move {
            let handle = self.apply()?;
            Ok(handle.await?)
        })
    }
}

impl std::fmt::Debug for OperationBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationBuilder")
            .field("operation", &self.operation)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Completion of a submitted operation
///
/// Dropping the handle does not cancel the remote operation.
#[derive(Debug)]
pub struct OperationHandle {
    correlation_id: CorrelationId,
    rx: oneshot::Receiver<Outcome>,
}

impl OperationHandle {
    pub(crate) fn new(correlation_id: CorrelationId, rx: oneshot::Receiver<Outcome>) -> Self {
        Self { correlation_id, rx }
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }
}

impl Future for OperationHandle {
    type Output = std::result::Result<Value, OperationError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(OperationError::Abandoned)))
    }
}
