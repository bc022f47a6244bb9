use chrono::{DateTime, NaiveDateTime, Utc};
use indexmap::IndexMap;

use crate::error::{OrmError, OrmResult};

/// A row as returned by the driver adapter: column name to raw value,
/// in SELECT projection order.
pub type Row = IndexMap<String, Value>;

/// A dynamically typed database value.
///
/// Every parameter bound into a statement and every cell decoded out of a
/// result set passes through this type. `Json` holds an already-parsed
/// document; `DateTime` is a naive UTC timestamp.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    Json(serde_json::Value),
    DateTime(NaiveDateTime),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Float(v) => Some(*v as i64),
            Value::Bool(v) => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            Value::Int(v) => Some(*v != 0),
            _ => None,
        }
    }

    /// Truthiness used by the `bool` cast: `NULL`, `0`, `0.0`, `""`, and
    /// `false` are falsy, everything else is truthy.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Int(v) => *v != 0,
            Value::Float(v) => *v != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Bool(b) => *b,
            Value::Json(j) => !j.is_null(),
            Value::DateTime(_) => true,
            Value::Bytes(b) => !b.is_empty(),
        }
    }

    /// Stable string form used to group rows by a key column during eager
    /// loading. `None` for NULL keys, which never match a parent.
    pub fn as_key(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Int(v) => Some(v.to_string()),
            Value::Float(v) => Some(v.to_string()),
            Value::Str(s) => Some(s.clone()),
            Value::Bool(b) => Some((*b as i64).to_string()),
            Value::Json(j) => Some(j.to_string()),
            Value::DateTime(d) => Some(d.format("%Y-%m-%d %H:%M:%S%.f").to_string()),
            Value::Bytes(_) => None,
        }
    }

    /// Renders the value for serialization.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Int(v) => serde_json::Value::from(*v),
            Value::Float(v) => serde_json::Number::from_f64(*v)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Str(s) => serde_json::Value::String(s.clone()),
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Json(j) => j.clone(),
            Value::DateTime(d) => {
                serde_json::Value::String(d.format("%Y-%m-%dT%H:%M:%S").to_string())
            }
            Value::Bytes(b) => serde_json::Value::String(String::from_utf8_lossy(b).into_owned()),
        }
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Int(value as i64)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Self::Int(value as i64)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<f32> for Value {
    fn from(value: f32) -> Self {
        Self::Float(value as f64)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(value: NaiveDateTime) -> Self {
        Self::DateTime(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Self::DateTime(value.naive_utc())
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        from_json(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => v.into(),
            None => Self::Null,
        }
    }
}

/// Maps a JSON scalar onto the matching [`Value`] variant; arrays and
/// objects stay JSON documents.
pub fn from_json(json: serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(b),
        serde_json::Value::Number(n) => {
            if let Some(v) = n.as_i64() {
                Value::Int(v)
            } else {
                Value::Float(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => Value::Str(s),
        other => Value::Json(other),
    }
}

/// Converts a JSON object into an ordered attribute map. Anything other
/// than an object is refused; this backs every `fill`/`update`/`insert`
/// entry point that accepts `serde_json::json!` literals.
pub fn attrs_from_json(json: &serde_json::Value) -> OrmResult<IndexMap<String, Value>> {
    let obj = json.as_object().ok_or_else(|| OrmError::Query {
        code: None,
        message: "attribute payload must be a JSON object".to_string(),
    })?;
    Ok(obj
        .iter()
        .map(|(k, v)| (k.clone(), from_json(v.clone())))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_scalars_map_to_native_variants() {
        assert_eq!(from_json(json!(null)), Value::Null);
        assert_eq!(from_json(json!(42)), Value::Int(42));
        assert_eq!(from_json(json!(1.5)), Value::Float(1.5));
        assert_eq!(from_json(json!("a")), Value::Str("a".to_string()));
        assert_eq!(from_json(json!(true)), Value::Bool(true));
        assert_eq!(from_json(json!([1, 2])), Value::Json(json!([1, 2])));
    }

    #[test]
    fn truthiness_matches_ingress_rules() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Int(0).is_truthy());
        assert!(!Value::Str(String::new()).is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(Value::Int(-1).is_truthy());
        assert!(Value::Str("0".to_string()).is_truthy());
    }

    #[test]
    fn attrs_from_json_preserves_key_order() {
        let attrs = attrs_from_json(&json!({"name": "Alice", "age": 30})).unwrap();
        let keys: Vec<_> = attrs.keys().cloned().collect();
        assert_eq!(keys, vec!["name", "age"]);
        assert_eq!(attrs["age"], Value::Int(30));
    }

    #[test]
    fn attrs_from_json_rejects_non_objects() {
        assert!(attrs_from_json(&json!([1, 2])).is_err());
    }

    #[test]
    fn null_keys_never_group() {
        assert_eq!(Value::Null.as_key(), None);
        assert_eq!(Value::Int(7).as_key().as_deref(), Some("7"));
    }
}
