//! Views over the shared client state
//!
//! [`Things`] addresses the whole registry, [`ThingHandle`] one Thing.
//! Both are cheap to clone and only hold a reference to the client plus
//! their scope.

use std::sync::Arc;

use serde_json::Value;

use twinlink_protocol::{
    AttributeChange, AttributePath, JsonValue, LifecycleEvent, ThingEvent, ThingOperation,
};
use twinlink_utils::Result;

use crate::client::ClientShared;
use crate::operation::OperationBuilder;
use crate::registry::{Filter, Handler};

fn lifecycle_handler<F>(mut f: F) -> Handler
where
    F: FnMut(LifecycleEvent) + Send + 'static,
{
    Box::new(move |event| {
        if let ThingEvent::Lifecycle(lifecycle) = event {
            f(lifecycle)
        }
    })
}

fn attribute_handler<F>(mut f: F) -> Handler
where
    F: FnMut(AttributeChange) + Send + 'static,
{
    Box::new(move |event| {
        if let ThingEvent::AttributeChange(change) = event {
            f(change)
        }
    })
}

/// Global view: all Things
#[derive(Clone)]
pub struct Things {
    shared: Arc<ClientShared>,
}

impl Things {
    pub(crate) fn new(shared: Arc<ClientShared>) -> Self {
        Self { shared }
    }

    /// Handle scoped to one Thing
    pub fn for_id(&self, thing_id: impl Into<String>) -> ThingHandle {
        ThingHandle::new(self.shared.clone(), thing_id.into())
    }

    /// Lifecycle events of every Thing
    pub fn register_for_lifecycle_event<F>(
        &self,
        registration_id: impl Into<String>,
        handler: F,
    ) -> Result<()>
    where
        F: FnMut(LifecycleEvent) + Send + 'static,
    {
        self.shared
            .register(registration_id.into(), Filter::lifecycle(), lifecycle_handler(handler))
    }

    /// Attribute changes of every Thing
    pub fn register_for_attribute_change<F>(
        &self,
        registration_id: impl Into<String>,
        handler: F,
    ) -> Result<()>
    where
        F: FnMut(AttributeChange) + Send + 'static,
    {
        self.shared.register(
            registration_id.into(),
            Filter::attribute_changes(),
            attribute_handler(handler),
        )
    }

    /// Changes at or below `path` on every Thing
    pub fn register_for_attribute_path_change<F>(
        &self,
        registration_id: impl Into<String>,
        path: impl Into<AttributePath>,
        handler: F,
    ) -> Result<()>
    where
        F: FnMut(AttributeChange) + Send + 'static,
    {
        self.shared.register(
            registration_id.into(),
            Filter::attribute_path(path),
            attribute_handler(handler),
        )
    }

    pub fn deregister(&self, registration_id: &str) -> bool {
        self.shared.deregister(registration_id)
    }

    /// Create a Thing with a registry-assigned id
    pub fn create(&self) -> OperationBuilder {
        self.operation(ThingOperation::Create {
            thing_id: None,
            thing: None,
        })
    }

    pub fn create_with_id(&self, thing_id: impl Into<String>) -> OperationBuilder {
        self.operation(ThingOperation::Create {
            thing_id: Some(thing_id.into()),
            thing: None,
        })
    }

    /// Create a Thing from a full JSON document
    pub fn create_from(&self, thing: Value) -> OperationBuilder {
        self.operation(ThingOperation::Create {
            thing_id: None,
            thing: Some(JsonValue::new(thing)),
        })
    }

    pub fn retrieve(&self, thing_id: impl Into<String>) -> OperationBuilder {
        self.for_id(thing_id).retrieve()
    }

    pub fn update(&self, thing_id: impl Into<String>, thing: Value) -> OperationBuilder {
        self.for_id(thing_id).update(thing)
    }

    pub fn delete(&self, thing_id: impl Into<String>) -> OperationBuilder {
        self.for_id(thing_id).delete()
    }

    fn operation(&self, operation: ThingOperation) -> OperationBuilder {
        OperationBuilder::new(self.shared.clone(), operation)
    }
}

impl std::fmt::Debug for Things {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Things").finish_non_exhaustive()
    }
}

/// Scoped view: one Thing
#[derive(Clone)]
pub struct ThingHandle {
    shared: Arc<ClientShared>,
    thing_id: String,
}

impl ThingHandle {
    pub(crate) fn new(shared: Arc<ClientShared>, thing_id: String) -> Self {
        Self { shared, thing_id }
    }

    pub fn thing_id(&self) -> &str {
        &self.thing_id
    }

    pub fn register_for_lifecycle_event<F>(
        &self,
        registration_id: impl Into<String>,
        handler: F,
    ) -> Result<()>
    where
        F: FnMut(LifecycleEvent) + Send + 'static,
    {
        self.shared.register(
            registration_id.into(),
            Filter::lifecycle().for_thing(&self.thing_id),
            lifecycle_handler(handler),
        )
    }

    pub fn register_for_attribute_change<F>(
        &self,
        registration_id: impl Into<String>,
        handler: F,
    ) -> Result<()>
    where
        F: FnMut(AttributeChange) + Send + 'static,
    {
        self.shared.register(
            registration_id.into(),
            Filter::attribute_changes().for_thing(&self.thing_id),
            attribute_handler(handler),
        )
    }

    pub fn register_for_attribute_path_change<F>(
        &self,
        registration_id: impl Into<String>,
        path: impl Into<AttributePath>,
        handler: F,
    ) -> Result<()>
    where
        F: FnMut(AttributeChange) + Send + 'static,
    {
        self.shared.register(
            registration_id.into(),
            Filter::attribute_path(path).for_thing(&self.thing_id),
            attribute_handler(handler),
        )
    }

    pub fn deregister(&self, registration_id: &str) -> bool {
        self.shared.deregister(registration_id)
    }

    pub fn retrieve(&self) -> OperationBuilder {
        self.operation(ThingOperation::Retrieve {
            thing_id: self.thing_id.clone(),
        })
    }

    /// Replace the whole Thing
    pub fn update(&self, thing: Value) -> OperationBuilder {
        self.operation(ThingOperation::Update {
            thing_id: self.thing_id.clone(),
            thing: JsonValue::new(thing),
        })
    }

    pub fn delete(&self) -> OperationBuilder {
        self.operation(ThingOperation::Delete {
            thing_id: self.thing_id.clone(),
        })
    }

    /// Set (or create) the attribute at `path`
    pub fn change_attribute(
        &self,
        path: impl Into<AttributePath>,
        value: impl Into<Value>,
    ) -> OperationBuilder {
        self.operation(ThingOperation::ChangeAttribute {
            thing_id: self.thing_id.clone(),
            path: path.into(),
            value: JsonValue::new(value.into()),
        })
    }

    pub fn delete_attribute(&self, path: impl Into<AttributePath>) -> OperationBuilder {
        self.operation(ThingOperation::DeleteAttribute {
            thing_id: self.thing_id.clone(),
            path: path.into(),
        })
    }

    fn operation(&self, operation: ThingOperation) -> OperationBuilder {
        OperationBuilder::new(self.shared.clone(), operation)
    }
}

impl std::fmt::Debug for ThingHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThingHandle")
            .field("thing_id", &self.thing_id)
            .finish_non_exhaustive()
    }
}
