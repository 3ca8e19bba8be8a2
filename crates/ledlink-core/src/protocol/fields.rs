//! Lenient field accessors for controller JSON.
//!
//! Firmware revisions disagree on key names (`dvr` vs `drv` vs `driver`) and on
//! value types (`true` vs `1` vs `"on"`), so every accessor takes a list of
//! candidate keys and coerces what it finds.

use serde_json::{Map, Value};

/// First present value among `keys`.
pub(crate) fn field<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| obj.get(*key))
}

/// Sub-object among `keys`.
pub(crate) fn object<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Map<String, Value>> {
    field(obj, keys).and_then(Value::as_object)
}

/// Array among `keys`, empty when absent.
pub(crate) fn array<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> &'a [Value] {
    field(obj, keys)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

pub(crate) fn to_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

pub(crate) fn int(obj: &Map<String, Value>, keys: &[&str]) -> Option<i64> {
    field(obj, keys).and_then(to_i64)
}

pub(crate) fn u8_field(obj: &Map<String, Value>, keys: &[&str]) -> Option<u8> {
    int(obj, keys).and_then(|v| u8::try_from(v).ok())
}

pub(crate) fn to_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        Value::String(s) => Some(matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )),
        _ => None,
    }
}

pub(crate) fn boolean(obj: &Map<String, Value>, keys: &[&str]) -> Option<bool> {
    field(obj, keys).and_then(to_bool)
}

pub(crate) fn text(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    match field(obj, keys)? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

pub(crate) fn float(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(value: Value) -> Map<String, Value> {
        value.as_object().cloned().expect("object")
    }

    #[test]
    fn test_field_prefers_first_key() {
        let o = obj(json!({"drv": 1, "dvr": 2}));
        assert_eq!(int(&o, &["dvr", "drv"]), Some(2));
    }

    #[test]
    fn test_boolean_coerces_strings_and_numbers() {
        let o = obj(json!({"a": "On", "b": 0, "c": "nope"}));
        assert_eq!(boolean(&o, &["a"]), Some(true));
        assert_eq!(boolean(&o, &["b"]), Some(false));
        assert_eq!(boolean(&o, &["c"]), Some(false));
        assert_eq!(boolean(&o, &["missing"]), None);
    }

    #[test]
    fn test_u8_field_rejects_out_of_range() {
        let o = obj(json!({"pwm": 300, "lvl": "12"}));
        assert_eq!(u8_field(&o, &["pwm"]), None);
        assert_eq!(u8_field(&o, &["lvl"]), Some(12));
    }
}
