//! Resource schemas as declared by provider plugins.
//!
//! A schema describes the attribute block of one resource type. The engine
//! uses it to shape raw state-file attributes into wire values and to build
//! the id-only synthetic state used when a resource cannot be imported.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::provider::proto::tfplugin5;
use crate::value::Value;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("schema has no block definition")]
    MissingBlock,

    #[error("invalid attribute type for '{name}': {message}")]
    InvalidAttributeType { name: String, message: String },

    #[error("invalid nesting mode {mode} for block '{name}'")]
    InvalidNestingMode { name: String, mode: i32 },
}

/// Schema of a single resource type (or of the provider configuration).
#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    pub version: i64,
    pub block: Block,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Block {
    pub attributes: BTreeMap<String, Attribute>,
    pub block_types: BTreeMap<String, NestedBlock>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub attr_type: AttributeType,
    pub required: bool,
    pub optional: bool,
    pub computed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NestedBlock {
    pub block: Block,
    pub nesting: NestingMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NestingMode {
    Single,
    Group,
    List,
    Set,
    Map,
}

/// Attribute types arrive on the wire as JSON-encoded type expressions,
/// either a bare name (`"string"`) or a constructor pair (`["list","string"]`).
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeType {
    String,
    Number,
    Bool,
    Dynamic,
    List(Box<AttributeType>),
    Set(Box<AttributeType>),
    Map(Box<AttributeType>),
    Object(BTreeMap<String, AttributeType>),
    Tuple(Vec<AttributeType>),
}

impl Schema {
    /// Converts a schema received over the plugin protocol.
    pub fn from_proto(proto: &tfplugin5::Schema) -> Result<Schema, SchemaError> {
        let block = proto.block.as_ref().ok_or(SchemaError::MissingBlock)?;
        Ok(Schema {
            version: proto.version,
            block: Block::from_proto(block)?,
        })
    }
}

impl Block {
    fn from_proto(proto: &tfplugin5::schema::Block) -> Result<Block, SchemaError> {
        let mut attributes = BTreeMap::new();
        for attr in &proto.attributes {
            let attr_type = AttributeType::parse(&attr.r#type).map_err(|message| {
                SchemaError::InvalidAttributeType {
                    name: attr.name.clone(),
                    message,
                }
            })?;
            attributes.insert(
                attr.name.clone(),
                Attribute {
                    attr_type,
                    required: attr.required,
                    optional: attr.optional,
                    computed: attr.computed,
                },
            );
        }

        let mut block_types = BTreeMap::new();
        for nested in &proto.block_types {
            let block = match &nested.block {
                Some(block) => Block::from_proto(block)?,
                None => Block::default(),
            };
            let nesting = NestingMode::from_proto(nested.nesting).ok_or_else(|| {
                SchemaError::InvalidNestingMode {
                    name: nested.type_name.clone(),
                    mode: nested.nesting,
                }
            })?;
            block_types.insert(nested.type_name.clone(), NestedBlock { block, nesting });
        }

        Ok(Block {
            attributes,
            block_types,
        })
    }

    /// Returns the block's empty value: every attribute null, every nested
    /// collection block empty.
    pub fn empty_value(&self) -> Value {
        let mut vals = BTreeMap::new();
        for name in self.attributes.keys() {
            vals.insert(name.clone(), Value::Null);
        }
        for (name, nested) in &self.block_types {
            vals.insert(name.clone(), nested.empty_value());
        }
        Value::Object(vals)
    }

    /// Returns the empty value of the block with only the `id` attribute set.
    ///
    /// Some resource types cannot be imported but can be refreshed from an
    /// id-only shell; the refresh then populates the remaining attributes.
    pub fn empty_value_with_id(&self, id: &str) -> Value {
        match self.empty_value() {
            Value::Object(mut vals) => {
                vals.insert("id".to_string(), Value::String(id.to_string()));
                Value::Object(vals)
            }
            other => other,
        }
    }

    /// Shapes a JSON attribute object from a state file into a value the
    /// provider can decode against this block.
    ///
    /// Attributes unknown to the schema are dropped, attributes missing from
    /// the JSON become null. Nested blocks are shaped recursively.
    pub fn shape_json(&self, attrs: &serde_json::Value) -> Value {
        let map = match attrs.as_object() {
            Some(map) => map,
            None => return Value::Null,
        };

        let mut vals = BTreeMap::new();
        for name in self.attributes.keys() {
            let value = map.get(name).map(Value::from_json).unwrap_or(Value::Null);
            vals.insert(name.clone(), value);
        }
        for (name, nested) in &self.block_types {
            vals.insert(name.clone(), nested.shape_json(map.get(name)));
        }
        Value::Object(vals)
    }
}

impl NestedBlock {
    fn empty_value(&self) -> Value {
        match self.nesting {
            NestingMode::Single => Value::Null,
            NestingMode::Group => self.block.empty_value(),
            NestingMode::List | NestingMode::Set => Value::List(Vec::new()),
            NestingMode::Map => Value::Object(BTreeMap::new()),
        }
    }

    fn shape_json(&self, json: Option<&serde_json::Value>) -> Value {
        match self.nesting {
            NestingMode::Single | NestingMode::Group => match json {
                Some(value) if !value.is_null() => self.block.shape_json(value),
                _ => self.empty_value(),
            },
            NestingMode::List | NestingMode::Set => match json.and_then(|v| v.as_array()) {
                Some(items) => {
                    Value::List(items.iter().map(|item| self.block.shape_json(item)).collect())
                }
                None => Value::List(Vec::new()),
            },
            NestingMode::Map => match json.and_then(|v| v.as_object()) {
                Some(entries) => Value::Object(
                    entries
                        .iter()
                        .map(|(k, v)| (k.clone(), self.block.shape_json(v)))
                        .collect(),
                ),
                None => Value::Object(BTreeMap::new()),
            },
        }
    }
}

impl NestingMode {
    fn from_proto(mode: i32) -> Option<NestingMode> {
        use tfplugin5::schema::nested_block::NestingMode as Proto;
        match Proto::try_from(mode).ok()? {
            Proto::Single => Some(NestingMode::Single),
            Proto::Group => Some(NestingMode::Group),
            Proto::List => Some(NestingMode::List),
            Proto::Set => Some(NestingMode::Set),
            Proto::Map => Some(NestingMode::Map),
            Proto::Invalid => None,
        }
    }
}

impl AttributeType {
    fn parse(raw: &[u8]) -> Result<AttributeType, String> {
        let json: serde_json::Value =
            serde_json::from_slice(raw).map_err(|err| err.to_string())?;
        AttributeType::from_type_json(&json)
    }

    fn from_type_json(json: &serde_json::Value) -> Result<AttributeType, String> {
        match json {
            serde_json::Value::String(name) => match name.as_str() {
                "string" => Ok(AttributeType::String),
                "number" => Ok(AttributeType::Number),
                "bool" => Ok(AttributeType::Bool),
                "dynamic" => Ok(AttributeType::Dynamic),
                other => Err(format!("unknown primitive type '{other}'")),
            },
            serde_json::Value::Array(parts) => {
                let kind = parts
                    .first()
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| "missing type constructor".to_string())?;
                let arg = parts
                    .get(1)
                    .ok_or_else(|| format!("missing argument for '{kind}'"))?;
                match kind {
                    "list" => Ok(AttributeType::List(Box::new(Self::from_type_json(arg)?))),
                    "set" => Ok(AttributeType::Set(Box::new(Self::from_type_json(arg)?))),
                    "map" => Ok(AttributeType::Map(Box::new(Self::from_type_json(arg)?))),
                    "object" => {
                        let fields = arg
                            .as_object()
                            .ok_or_else(|| "object type argument must be a map".to_string())?;
                        let mut out = BTreeMap::new();
                        for (name, ty) in fields {
                            out.insert(name.clone(), Self::from_type_json(ty)?);
                        }
                        Ok(AttributeType::Object(out))
                    }
                    "tuple" => {
                        let elems = arg
                            .as_array()
                            .ok_or_else(|| "tuple type argument must be a list".to_string())?;
                        Ok(AttributeType::Tuple(
                            elems
                                .iter()
                                .map(Self::from_type_json)
                                .collect::<Result<_, _>>()?,
                        ))
                    }
                    other => Err(format!("unknown type constructor '{other}'")),
                }
            }
            _ => Err("type must be a string or constructor pair".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attribute(ty: &str) -> tfplugin5::schema::Attribute {
        tfplugin5::schema::Attribute {
            name: String::new(),
            r#type: ty.as_bytes().to_vec(),
            description: String::new(),
            required: false,
            optional: true,
            computed: false,
            sensitive: false,
        }
    }

    fn vpc_schema() -> tfplugin5::Schema {
        tfplugin5::Schema {
            version: 1,
            block: Some(tfplugin5::schema::Block {
                version: 1,
                attributes: vec![
                    tfplugin5::schema::Attribute {
                        name: "id".to_string(),
                        ..attribute("\"string\"")
                    },
                    tfplugin5::schema::Attribute {
                        name: "cidr_block".to_string(),
                        ..attribute("\"string\"")
                    },
                    tfplugin5::schema::Attribute {
                        name: "tags".to_string(),
                        ..attribute("[\"map\",\"string\"]")
                    },
                ],
                block_types: vec![tfplugin5::schema::NestedBlock {
                    type_name: "timeouts".to_string(),
                    block: Some(tfplugin5::schema::Block {
                        version: 0,
                        attributes: vec![tfplugin5::schema::Attribute {
                            name: "delete".to_string(),
                            ..attribute("\"string\"")
                        }],
                        block_types: vec![],
                    }),
                    nesting: tfplugin5::schema::nested_block::NestingMode::Single as i32,
                    min_items: 0,
                    max_items: 1,
                }],
            }),
        }
    }

    #[test]
    fn test_from_proto_parses_attributes_and_blocks() {
        let schema = Schema::from_proto(&vpc_schema()).unwrap();
        assert_eq!(schema.version, 1);
        assert_eq!(
            schema.block.attributes["id"].attr_type,
            AttributeType::String
        );
        assert_eq!(
            schema.block.attributes["tags"].attr_type,
            AttributeType::Map(Box::new(AttributeType::String))
        );
        assert_eq!(
            schema.block.block_types["timeouts"].nesting,
            NestingMode::Single
        );
    }

    #[test]
    fn test_from_proto_rejects_missing_block() {
        let proto = tfplugin5::Schema {
            version: 0,
            block: None,
        };
        assert!(matches!(
            Schema::from_proto(&proto),
            Err(SchemaError::MissingBlock)
        ));
    }

    #[test]
    fn test_attribute_type_parse_object() {
        let parsed =
            AttributeType::parse(br#"["object",{"name":"string","ports":["list","number"]}]"#)
                .unwrap();
        match parsed {
            AttributeType::Object(fields) => {
                assert_eq!(fields["name"], AttributeType::String);
                assert_eq!(
                    fields["ports"],
                    AttributeType::List(Box::new(AttributeType::Number))
                );
            }
            other => panic!("expected object type, got {other:?}"),
        }
    }

    #[test]
    fn test_attribute_type_parse_rejects_garbage() {
        assert!(AttributeType::parse(b"\"frob\"").is_err());
        assert!(AttributeType::parse(b"[\"list\"]").is_err());
        assert!(AttributeType::parse(b"42").is_err());
    }

    #[test]
    fn test_empty_value_with_id() {
        let schema = Schema::from_proto(&vpc_schema()).unwrap();
        let value = schema.block.empty_value_with_id("vpc-aaaa");

        assert_eq!(
            value.attribute("id"),
            Some(&Value::String("vpc-aaaa".to_string()))
        );
        assert_eq!(value.attribute("cidr_block"), Some(&Value::Null));
        assert_eq!(value.attribute("tags"), Some(&Value::Null));
        // single-nested block defaults to null
        assert_eq!(value.attribute("timeouts"), Some(&Value::Null));
    }

    #[test]
    fn test_shape_json_fills_missing_and_drops_extra() {
        let schema = Schema::from_proto(&vpc_schema()).unwrap();
        let attrs = serde_json::json!({
            "id": "vpc-aaaa",
            "tags": {"Name": "main"},
            "left_over_from_old_schema": true,
        });

        let shaped = schema.block.shape_json(&attrs);
        assert_eq!(
            shaped.attribute("id"),
            Some(&Value::String("vpc-aaaa".to_string()))
        );
        assert_eq!(shaped.attribute("cidr_block"), Some(&Value::Null));
        assert_eq!(shaped.attribute("left_over_from_old_schema"), None);
    }

    #[test]
    fn test_shape_json_nested_list_block() {
        let proto = tfplugin5::Schema {
            version: 0,
            block: Some(tfplugin5::schema::Block {
                version: 0,
                attributes: vec![tfplugin5::schema::Attribute {
                    name: "id".to_string(),
                    ..attribute("\"string\"")
                }],
                block_types: vec![tfplugin5::schema::NestedBlock {
                    type_name: "ingress".to_string(),
                    block: Some(tfplugin5::schema::Block {
                        version: 0,
                        attributes: vec![tfplugin5::schema::Attribute {
                            name: "port".to_string(),
                            ..attribute("\"number\"")
                        }],
                        block_types: vec![],
                    }),
                    nesting: tfplugin5::schema::nested_block::NestingMode::List as i32,
                    min_items: 0,
                    max_items: 0,
                }],
            }),
        };
        let schema = Schema::from_proto(&proto).unwrap();

        let shaped = schema
            .block
            .shape_json(&serde_json::json!({"id": "sg-1", "ingress": [{"port": 443}]}));
        match shaped.attribute("ingress") {
            Some(Value::List(items)) => {
                assert_eq!(items.len(), 1);
                assert_eq!(
                    items[0].attribute("port"),
                    Some(&Value::Number(serde_json::Number::from(443)))
                );
            }
            other => panic!("expected shaped ingress list, got {other:?}"),
        }

        // absent block key shapes to an empty list
        let shaped = schema.block.shape_json(&serde_json::json!({"id": "sg-1"}));
        assert_eq!(shaped.attribute("ingress"), Some(&Value::List(Vec::new())));
    }
}
