//! Configuration merge logic
//!
//! Layers are merged as JSON values:
//! - Objects: deep-merge by key
//! - Arrays: REPLACE (last wins)
//! - Scalars: override (last wins)

use serde_json::{Map, Value};

use super::ConfigError;

/// Deep merge two JSON values, `overlay` taking precedence.
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                let merged = match base_map.remove(&key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => overlay_value,
                };
                base_map.insert(key, merged);
            }
            Value::Object(base_map)
        }
        (_, overlay) => overlay,
    }
}

/// Merge layers in order (first is base, last has highest precedence)
pub fn merge_layers(layers: Vec<Value>) -> Value {
    layers.into_iter().fold(Value::Null, deep_merge)
}

/// Parse the right-hand side of a `--set` flag.
///
/// Accepts any TOML literal (`42`, `true`, `"text"`, `[1, 2]`); anything
/// else is taken as a bare string.
fn parse_literal(raw: &str) -> Value {
    let wrapped = format!("v = {}", raw);
    match toml::from_str::<Map<String, Value>>(&wrapped) {
        Ok(mut table) => table
            .remove("v")
            .unwrap_or_else(|| Value::String(raw.to_string())),
        Err(_) => Value::String(raw.to_string()),
    }
}

/// Turn `section.key=value` overrides into one JSON layer.
pub fn overrides_layer(overrides: &[String]) -> Result<Value, ConfigError> {
    let mut layer = Value::Object(Map::new());
    for item in overrides {
        let (path, raw) = item
            .split_once('=')
            .ok_or_else(|| ConfigError::InvalidOverride(item.clone()))?;
        let path = path.trim();
        if path.is_empty() || path.split('.').any(str::is_empty) {
            return Err(ConfigError::InvalidOverride(item.clone()));
        }

        let value = path
            .rsplit('.')
            .fold(parse_literal(raw.trim()), |inner, key| {
                let mut map = Map::new();
                map.insert(key.to_string(), inner);
                Value::Object(map)
            });
        layer = deep_merge(layer, value);
    }
    Ok(layer)
}
