//! Remote operations a client can request

use serde::{Deserialize, Serialize};

use super::{AttributePath, JsonValue};

/// A request/response operation against the registry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ThingOperation {
    /// Create a Thing; the registry assigns an id when `thing_id` is `None`
    Create {
        thing_id: Option<String>,
        thing: Option<JsonValue>,
    },
    Retrieve {
        thing_id: String,
    },
    /// Replace the whole Thing
    Update {
        thing_id: String,
        thing: JsonValue,
    },
    Delete {
        thing_id: String,
    },
    ChangeAttribute {
        thing_id: String,
        path: AttributePath,
        value: JsonValue,
    },
    DeleteAttribute {
        thing_id: String,
        path: AttributePath,
    },
}

impl ThingOperation {
    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            ThingOperation::Create { .. } => "create",
            ThingOperation::Retrieve { .. } => "retrieve",
            ThingOperation::Update { .. } => "update",
            ThingOperation::Delete { .. } => "delete",
            ThingOperation::ChangeAttribute { .. } => "change_attribute",
            ThingOperation::DeleteAttribute { .. } => "delete_attribute",
        }
    }

    /// Target Thing id, if the operation names one
    pub fn thing_id(&self) -> Option<&str> {
        match self {
            ThingOperation::Create { thing_id, .. } => thing_id.as_deref(),
            ThingOperation::Retrieve { thing_id }
            | ThingOperation::Update { thing_id, .. }
            | ThingOperation::Delete { thing_id }
            | ThingOperation::ChangeAttribute { thing_id, .. }
            | ThingOperation::DeleteAttribute { thing_id, .. } => Some(thing_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_names() {
        let ops = [
            (ThingOperation::Create { thing_id: None, thing: None }, "create"),
            (ThingOperation::Retrieve { thing_id: "t".into() }, "retrieve"),
            (ThingOperation::Delete { thing_id: "t".into() }, "delete"),
            (
                ThingOperation::DeleteAttribute {
                    thing_id: "t".into(),
                    path: "a/b".into(),
                },
                "delete_attribute",
            ),
        ];
        for (op, name) in ops {
            assert_eq!(op.name(), name);
        }
    }

    #[test]
    fn test_operation_thing_id() {
        assert_eq!(
            ThingOperation::Create { thing_id: None, thing: None }.thing_id(),
            None
        );
        assert_eq!(
            ThingOperation::Create {
                thing_id: Some("myThing".into()),
                thing: None
            }
            .thing_id(),
            Some("myThing")
        );
        assert_eq!(
            ThingOperation::ChangeAttribute {
                thing_id: "myThing".into(),
                path: "address/city".into(),
                value: JsonValue::new(serde_json::json!("Berlin")),
            }
            .thing_id(),
            Some("myThing")
        );
    }
}
