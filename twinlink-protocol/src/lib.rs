//! twinlink-protocol: Wire records exchanged with the twin registry
//!
//! This crate defines the structured frames the client runtime produces and
//! consumes, plus the length-prefixed codec a transport uses to put them on
//! the wire.

pub mod codec;
pub mod messages;
pub mod types;

// Re-export main types at crate root
pub use codec::{ClientCodec, CodecError, ServerCodec};
pub use messages::{ClientFrame, Credentials, ErrorCode, ReplyOutcome, ServerFrame};
pub use types::{
    AttributeChange, AttributePath, CorrelationId, EventCategory, JsonValue, LifecycleAction,
    LifecycleEvent, ThingEvent, ThingOperation,
};

/// Current protocol version
pub const PROTOCOL_VERSION: u32 = 1;
