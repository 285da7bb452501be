//! Events pushed by the registry to connected clients

use serde::{Deserialize, Serialize};

use super::JsonValue;

/// Category an inbound event belongs to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventCategory {
    /// A Thing was created, replaced or deleted
    Lifecycle,
    /// A single attribute of a Thing changed
    AttributeChange,
}

/// What happened to a Thing in a lifecycle event
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LifecycleAction {
    Created,
    Updated,
    Deleted,
}

/// Slash-separated path to an attribute inside a Thing
///
/// Leading, trailing and repeated separators are dropped on construction, so
/// `"/address//city/"` and `"address/city"` are the same path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct AttributePath(String);

impl AttributePath {
    pub fn new(path: impl AsRef<str>) -> Self {
        let normalized = path
            .as_ref()
            .split('/')
            .filter(|segment| !segment.is_empty())
            .collect::<Vec<_>>()
            .join("/");
        Self(normalized)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for the empty path, which addresses all attributes
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|segment| !segment.is_empty())
    }

    /// Whether `other` equals this path or lies below it
    ///
    /// Comparison is per segment: `address/city` covers `address/city/zip`
    /// but not `address/cityhall`.
    pub fn covers(&self, other: &AttributePath) -> bool {
        let mut mine = self.segments();
        let mut theirs = other.segments();
        loop {
            match (mine.next(), theirs.next()) {
                (None, _) => return true,
                (Some(_), None) => return false,
                (Some(a), Some(b)) if a != b => return false,
                _ => {}
            }
        }
    }
}

impl std::fmt::Display for AttributePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AttributePath {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

impl From<String> for AttributePath {
    fn from(path: String) -> Self {
        Self::new(path)
    }
}

/// Lifecycle change of one Thing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LifecycleEvent {
    pub thing_id: String,
    pub action: LifecycleAction,
    /// Thing state after the change; absent for deletions
    pub thing: Option<JsonValue>,
    pub revision: u64,
}

/// Change of a single attribute of one Thing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttributeChange {
    pub thing_id: String,
    pub path: AttributePath,
    /// New value; `None` when the attribute was removed
    pub value: Option<JsonValue>,
    pub revision: u64,
}

/// Event pushed by the registry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ThingEvent {
    Lifecycle(LifecycleEvent),
    AttributeChange(AttributeChange),
}

impl ThingEvent {
    pub fn category(&self) -> EventCategory {
        match self {
            ThingEvent::Lifecycle(_) => EventCategory::Lifecycle,
            ThingEvent::AttributeChange(_) => EventCategory::AttributeChange,
        }
    }

    pub fn thing_id(&self) -> &str {
        match self {
            ThingEvent::Lifecycle(e) => &e.thing_id,
            ThingEvent::AttributeChange(c) => &c.thing_id,
        }
    }

    /// Attribute path for attribute changes, `None` for lifecycle events
    pub fn attribute_path(&self) -> Option<&AttributePath> {
        match self {
            ThingEvent::Lifecycle(_) => None,
            ThingEvent::AttributeChange(c) => Some(&c.path),
        }
    }

    pub fn revision(&self) -> u64 {
        match self {
            ThingEvent::Lifecycle(e) => e.revision,
            ThingEvent::AttributeChange(c) => c.revision,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_attribute_path_normalizes() {
        assert_eq!(AttributePath::new("/address//city/").as_str(), "address/city");
        assert_eq!(AttributePath::new("address/city"), AttributePath::from("address/city/"));
        assert!(AttributePath::new("/").is_root());
    }

    #[test]
    fn test_attribute_path_covers() {
        let address = AttributePath::new("address");
        let city = AttributePath::new("address/city");

        assert!(city.covers(&city));
        assert!(address.covers(&city));
        assert!(city.covers(&AttributePath::new("address/city/zip")));
        assert!(!city.covers(&address));
        assert!(!city.covers(&AttributePath::new("address/country")));
        assert!(!city.covers(&AttributePath::new("address/cityhall")));
        assert!(AttributePath::new("").covers(&city));
    }

    #[test]
    fn test_thing_event_accessors() {
        let lifecycle = ThingEvent::Lifecycle(LifecycleEvent {
            thing_id: "myThing".into(),
            action: LifecycleAction::Created,
            thing: Some(JsonValue::new(json!({"thingId": "myThing"}))),
            revision: 1,
        });
        assert_eq!(lifecycle.category(), EventCategory::Lifecycle);
        assert_eq!(lifecycle.thing_id(), "myThing");
        assert!(lifecycle.attribute_path().is_none());
        assert_eq!(lifecycle.revision(), 1);

        let change = ThingEvent::AttributeChange(AttributeChange {
            thing_id: "myThing".into(),
            path: "address/city".into(),
            value: Some(JsonValue::new(json!("Berlin"))),
            revision: 2,
        });
        assert_eq!(change.category(), EventCategory::AttributeChange);
        assert_eq!(change.attribute_path().map(|p| p.as_str()), Some("address/city"));
        assert_eq!(change.revision(), 2);
    }
}
