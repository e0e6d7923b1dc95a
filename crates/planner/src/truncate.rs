//! Payload clipping before transcription.
//!
//! One verbose tool must not blow the model's context: top-level arrays and
//! arrays nested one level under object keys are clipped to a maximum item
//! count, with a marker so the model knows it saw a prefix.

use serde_json::Value;

/// Clip arrays in `payload` to at most `max_items` elements.
pub fn truncate_payload(payload: Value, max_items: usize) -> Value {
    match payload {
        Value::Array(items) if items.len() > max_items => {
            Value::Array(items.into_iter().take(max_items).collect())
        }
        Value::Object(mut map) => {
            let clipped: Vec<String> = map
                .iter()
                .filter_map(|(key, value)| match value {
                    Value::Array(items) if items.len() > max_items => Some(key.clone()),
                    _ => None,
                })
                .collect();

            for key in &clipped {
                if let Some(Value::Array(items)) = map.get_mut(key) {
                    items.truncate(max_items);
                }
            }
            for key in clipped {
                map.insert(format!("{key}_truncated"), Value::Bool(true));
            }
            Value::Object(map)
        }
        other => other,
    }
}
