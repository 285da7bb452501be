//! twinlink-client: Client runtime for the twinlink digital twin registry
//!
//! One [`IntegrationClient`] holds a single authenticated connection and
//! multiplexes over it:
//! - event subscriptions, registered through [`Things`] or a
//!   [`ThingHandle`] and routed by the [`registry`]
//! - correlated request/response operations, built with an
//!   [`OperationBuilder`] and resolved through the [`correlation`] table
//!
//! ```no_run
//! # async fn demo() -> twinlink_utils::Result<()> {
//! use std::time::Duration;
//! use twinlink_client::{ClientConfig, IntegrationClient};
//!
//! let client = IntegrationClient::create(ClientConfig::load_default()?).await?;
//! client.register_for_thing_lifecycle_event("allThings", |event| {
//!     tracing::info!(thing_id = %event.thing_id, "lifecycle received");
//! })?;
//!
//! let thing = client.for_thing("myThing");
//! thing
//!     .change_attribute("address/city", "Berlin")
//!     .on_failure(|err| tracing::error!(error = %err, "change failed"))
//!     .apply()?;
//!
//! client.destroy(Duration::from_secs(30)).await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod correlation;
pub mod handle;
pub mod operation;
pub mod registry;
pub mod transport;

pub use client::{ConnectionState, IntegrationClient};
pub use config::{AuthConfig, ClientConfig, Endpoint, ProxyConfig, ReconnectConfig, TrustStoreConfig};
pub use correlation::{CorrelationTable, FailureFn, SuccessFn};
pub use handle::{ThingHandle, Things};
pub use operation::{OperationBuilder, OperationHandle};
pub use registry::{Filter, Handler, SubscriptionRegistry, DELIVERY_QUEUE_CAPACITY};
pub use transport::{
    FrameSender, FramedTransport, MemoryTransport, RemoteEnd, Transport, TransportEvent,
    TransportSession,
};
