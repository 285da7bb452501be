//! Shared data types for the twinlink protocol

mod common;
mod event;
mod operation;

pub use common::{CorrelationId, JsonValue};
pub use event::{
    AttributeChange, AttributePath, EventCategory, LifecycleAction, LifecycleEvent, ThingEvent,
};
pub use operation::ThingOperation;
