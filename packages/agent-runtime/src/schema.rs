//! Canonical JSON-schema generation for tool arguments (§4.5, §6), via
//! the `schemars` crate.

use schemars::{schema_for, JsonSchema};
use serde::de::DeserializeOwned;

/// Any type usable as a tool's `input_schema`. Blanket-implemented for
/// anything `JsonSchema + DeserializeOwned`, same pattern the teacher
/// used for OpenAI structured-output extraction.
pub trait ToolSchema: JsonSchema + DeserializeOwned {
    /// `additionalProperties: false` is forced on every object node —
    /// several providers' strict tool-calling modes require it; providers
    /// that don't check it simply ignore the extra field.
    fn tool_schema() -> serde_json::Value {
        let schema = schema_for!(Self);
        let mut value = serde_json::to_value(schema).unwrap_or_default();
        ensure_no_additional_properties(&mut value);
        value
    }

    fn type_name() -> String {
        <Self as JsonSchema>::schema_name()
    }
}

impl<T: JsonSchema + DeserializeOwned> ToolSchema for T {}

fn ensure_no_additional_properties(value: &mut serde_json::Value) {
    if let serde_json::Value::Object(map) = value {
        if map.get("type") == Some(&serde_json::Value::String("object".to_string())) {
            map.insert("additionalProperties".to_string(), serde_json::Value::Bool(false));
        }
        for (_, v) in map.iter_mut() {
            ensure_no_additional_properties(v);
        }
    } else if let serde_json::Value::Array(arr) = value {
        for item in arr.iter_mut() {
            ensure_no_additional_properties(item);
        }
    }
}
