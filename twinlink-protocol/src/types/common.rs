use serde::{Deserialize, Serialize};

/// Token linking one outbound request to its one inbound reply
pub type CorrelationId = u64;

/// Wrapper for serde_json::Value that serializes as a JSON string
///
/// bincode cannot deserialize self-describing values, so opaque Thing
/// payloads travel as JSON text inside the bincode frame.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct JsonValue(pub serde_json::Value);

impl JsonValue {
    /// Create a new JsonValue from a serde_json::Value
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    /// Get a reference to the inner value
    pub fn inner(&self) -> &serde_json::Value {
        &self.0
    }

    /// Consume the wrapper and return the inner value
    pub fn into_inner(self) -> serde_json::Value {
        self.0
    }
}

impl From<serde_json::Value> for JsonValue {
    fn from(value: serde_json::Value) -> Self {
        Self(value)
    }
}

impl From<JsonValue> for serde_json::Value {
    fn from(value: JsonValue) -> Self {
        value.0
    }
}

impl std::ops::Deref for JsonValue {
    type Target = serde_json::Value;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for JsonValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for JsonValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let json_string = serde_json::to_string(&self.0).map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&json_string)
    }
}

impl<'de> Deserialize<'de> for JsonValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let json_string = String::deserialize(deserializer)?;
        let value: serde_json::Value =
            serde_json::from_str(&json_string).map_err(serde::de::Error::custom)?;
        Ok(Self(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_value_bincode_roundtrip() {
        let value = JsonValue::new(json!({
            "thingId": "com.acme:myThing",
            "attributes": { "address": { "city": "Berlin" }, "counter": 3 }
        }));

        let bytes = bincode::serialize(&value).unwrap();
        let decoded: JsonValue = bincode::deserialize(&bytes).unwrap();
        assert_eq!(value, decoded);
    }

    #[test]
    fn test_json_value_deref_and_display() {
        let value = JsonValue::from(json!({"a": 1}));
        assert_eq!(value["a"], 1);
        assert_eq!(value.to_string(), r#"{"a":1}"#);
        assert_eq!(serde_json::Value::from(value), json!({"a": 1}));
    }

    #[test]
    fn test_json_value_rejects_invalid_text() {
        let bytes = bincode::serialize("{not json").unwrap();
        assert!(bincode::deserialize::<JsonValue>(&bytes).is_err());
    }
}
