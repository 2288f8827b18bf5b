//! Dynamic attribute values exchanged with provider plugins.
//!
//! Provider plugins speak msgpack on the wire: every state object crosses the
//! protocol boundary as a `DynamicValue` whose msgpack payload encodes nulls
//! as nil, unknown values as extension type 0, and attribute objects as
//! string-keyed maps.

use std::collections::BTreeMap;

use thiserror::Error;

/// Extension type used by the msgpack encoding to mark unknown values.
const UNKNOWN_EXT_TYPE: i8 = 0;

#[derive(Debug, Error)]
pub enum ValueError {
    #[error("failed to decode msgpack value: {0}")]
    Decode(String),

    #[error("failed to encode msgpack value: {0}")]
    Encode(String),

    #[error("msgpack map key is not a string")]
    NonStringKey,
}

/// An attribute tree as stored in a state file or returned by a provider.
///
/// The tree is structural: lists, sets and tuples all decode to `List`, maps
/// and object blocks to `Object`. That is enough to hand a prior state back
/// to a provider unchanged.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    /// A value the plugin has not computed yet; treated as unset.
    Unknown,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    List(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Looks up a top-level attribute if this value is an object.
    pub fn attribute(&self, name: &str) -> Option<&Value> {
        match self {
            Value::Object(map) => map.get(name),
            _ => None,
        }
    }

    /// Converts a JSON attribute tree (as found in a v4 state file) into a
    /// value tree.
    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => Value::Number(n.clone()),
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => {
                Value::List(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Encodes the value as a msgpack payload for a `DynamicValue`.
    pub fn to_msgpack(&self) -> Result<Vec<u8>, ValueError> {
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &self.to_rmpv())
            .map_err(|err| ValueError::Encode(err.to_string()))?;
        Ok(buf)
    }

    /// Decodes a msgpack `DynamicValue` payload.
    pub fn from_msgpack(bytes: &[u8]) -> Result<Value, ValueError> {
        let mut cursor = bytes;
        let raw = rmpv::decode::read_value(&mut cursor)
            .map_err(|err| ValueError::Decode(err.to_string()))?;
        Value::from_rmpv(raw)
    }

    fn to_rmpv(&self) -> rmpv::Value {
        match self {
            Value::Null => rmpv::Value::Nil,
            Value::Unknown => rmpv::Value::Ext(UNKNOWN_EXT_TYPE, vec![0]),
            Value::Bool(b) => rmpv::Value::Boolean(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    rmpv::Value::from(i)
                } else if let Some(u) = n.as_u64() {
                    rmpv::Value::from(u)
                } else {
                    rmpv::Value::F64(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(s) => rmpv::Value::String(s.clone().into()),
            Value::List(items) => {
                rmpv::Value::Array(items.iter().map(Value::to_rmpv).collect())
            }
            Value::Object(map) => rmpv::Value::Map(
                map.iter()
                    .map(|(k, v)| (rmpv::Value::String(k.clone().into()), v.to_rmpv()))
                    .collect(),
            ),
        }
    }

    fn from_rmpv(raw: rmpv::Value) -> Result<Value, ValueError> {
        match raw {
            rmpv::Value::Nil => Ok(Value::Null),
            rmpv::Value::Ext(UNKNOWN_EXT_TYPE, _) => Ok(Value::Unknown),
            rmpv::Value::Ext(kind, _) => Err(ValueError::Decode(format!(
                "unexpected msgpack extension type {kind}"
            ))),
            rmpv::Value::Boolean(b) => Ok(Value::Bool(b)),
            rmpv::Value::Integer(i) => {
                let number = if let Some(v) = i.as_i64() {
                    serde_json::Number::from(v)
                } else if let Some(v) = i.as_u64() {
                    serde_json::Number::from(v)
                } else {
                    return Err(ValueError::Decode(format!("unrepresentable integer {i:?}")));
                };
                Ok(Value::Number(number))
            }
            rmpv::Value::F32(f) => Value::number_from_f64(f64::from(f)),
            rmpv::Value::F64(f) => Value::number_from_f64(f),
            rmpv::Value::String(s) => match s.into_str() {
                Some(s) => Ok(Value::String(s)),
                None => Err(ValueError::Decode("invalid UTF-8 string".to_string())),
            },
            rmpv::Value::Binary(_) => {
                Err(ValueError::Decode("unexpected binary value".to_string()))
            }
            rmpv::Value::Array(items) => Ok(Value::List(
                items
                    .into_iter()
                    .map(Value::from_rmpv)
                    .collect::<Result<_, _>>()?,
            )),
            rmpv::Value::Map(entries) => {
                let mut map = BTreeMap::new();
                for (key, value) in entries {
                    let key = match key {
                        rmpv::Value::String(s) => {
                            s.into_str().ok_or(ValueError::NonStringKey)?
                        }
                        _ => return Err(ValueError::NonStringKey),
                    };
                    map.insert(key, Value::from_rmpv(value)?);
                }
                Ok(Value::Object(map))
            }
        }
    }

    fn number_from_f64(f: f64) -> Result<Value, ValueError> {
        serde_json::Number::from_f64(f)
            .map(Value::Number)
            .ok_or_else(|| ValueError::Decode(format!("unrepresentable float {f}")))
    }
}
