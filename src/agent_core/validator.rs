//! Parameter validation — checks parsed arguments against a tool's schema.
//!
//! A schema is an ordered list of fields. Validation walks the fields in
//! declaration order and reports the first one that is missing or has the
//! wrong type, naming both the tool and the field. On success it returns a
//! normalized mapping: declared fields only, defaults filled in.
//!
//! A string value for a field declared as a number, boolean or structure is
//! converted when its text spells that type (`"30"` for an integer). The
//! tagged dialect delivers every parameter as text, so this is where its
//! values get their types. String fields are never converted.

use serde_json::{json, Map, Value};

use super::errors::AgentError;
use crate::stream::tool_call_parser::json_type_name;

// ─── Schema Types ───────────────────────────────────────────────────────────

/// JSON type a field must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
    Any,
}

impl FieldType {
    fn from_json_schema(name: &str) -> Self {
        match name {
            "string" => FieldType::String,
            "integer" => FieldType::Integer,
            "number" => FieldType::Number,
            "boolean" => FieldType::Boolean,
            "array" => FieldType::Array,
            "object" => FieldType::Object,
            _ => FieldType::Any,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Integer => "integer",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::Array => "array",
            FieldType::Object => "object",
            FieldType::Any => "any",
        }
    }

    fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Number => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Array => value.is_array(),
            FieldType::Object => value.is_object(),
            FieldType::Any => true,
        }
    }

    /// The value `text` spells for this type, if any.
    fn coerce_text(&self, text: &str) -> Option<Value> {
        let trimmed = text.trim();
        match self {
            FieldType::Integer => trimmed
                .parse::<i64>()
                .map(Value::from)
                .or_else(|_| trimmed.parse::<u64>().map(Value::from))
                .ok(),
            FieldType::Number => match trimmed.parse::<i64>() {
                Ok(n) => Some(Value::from(n)),
                Err(_) => trimmed
                    .parse::<f64>()
                    .ok()
                    .and_then(serde_json::Number::from_f64)
                    .map(Value::Number),
            },
            FieldType::Boolean => match trimmed {
                "true" => Some(Value::Bool(true)),
                "false" => Some(Value::Bool(false)),
                _ => None,
            },
            FieldType::Array | FieldType::Object => serde_json::from_str::<Value>(trimmed)
                .ok()
                .filter(|value| self.accepts(value)),
            FieldType::String | FieldType::Any => None,
        }
    }
}

/// One declared parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub name: String,
    pub field_type: FieldType,
    pub required: bool,
    /// Filled in when an optional field is absent.
    pub default: Option<Value>,
    pub description: Option<String>,
}

/// The parameters a tool accepts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolSchema {
    fields: Vec<FieldSpec>,
}

impl ToolSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a required field.
    pub fn required(mut self, name: &str, field_type: FieldType) -> Self {
        self.fields.push(FieldSpec {
            name: name.to_string(),
            field_type,
            required: true,
            default: None,
            description: None,
        });
        self
    }

    /// Declare an optional field, with an optional default.
    pub fn optional(mut self, name: &str, field_type: FieldType, default: Option<Value>) -> Self {
        self.fields.push(FieldSpec {
            name: name.to_string(),
            field_type,
            required: false,
            default,
            description: None,
        });
        self
    }

    /// Attach a description to the most recently declared field.
    pub fn describe(mut self, description: &str) -> Self {
        if let Some(field) = self.fields.last_mut() {
            field.description = Some(description.to_string());
        }
        self
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    /// Build a schema from a JSON-Schema `object` definition.
    ///
    /// Reads `properties` (with `type`, `default`, `description`) and
    /// `required`. Required fields are ordered as listed in `required`, then
    /// optional fields in property order.
    pub fn from_json_schema(tool: &str, schema: &Value) -> Result<Self, AgentError> {
        let properties = match schema.get("properties") {
            None => return Ok(Self::new()),
            Some(Value::Object(props)) => props,
            Some(_) => {
                return Err(AgentError::Config {
                    reason: format!("schema for tool '{tool}': 'properties' must be an object"),
                })
            }
        };

        let required: Vec<&str> = schema
            .get("required")
            .and_then(Value::as_array)
            .map(|names| names.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        let spec = |name: &str, prop: &Value, required: bool| FieldSpec {
            name: name.to_string(),
            field_type: prop
                .get("type")
                .and_then(Value::as_str)
                .map(FieldType::from_json_schema)
                .unwrap_or(FieldType::Any),
            required,
            default: if required { None } else { prop.get("default").cloned() },
            description: prop
                .get("description")
                .and_then(Value::as_str)
                .map(String::from),
        };

        let mut fields = Vec::with_capacity(properties.len());
        for name in &required {
            let prop = properties.get(*name).ok_or_else(|| AgentError::Config {
                reason: format!("schema for tool '{tool}': required field '{name}' has no property"),
            })?;
            fields.push(spec(name, prop, true));
        }
        for (name, prop) in properties {
            if !required.contains(&name.as_str()) {
                fields.push(spec(name, prop, false));
            }
        }

        Ok(Self { fields })
    }

    /// Render as a JSON-Schema `object` definition for the service.
    pub fn to_json_schema(&self) -> Value {
        let mut properties = Map::new();
        for field in &self.fields {
            let mut prop = Map::new();
            if field.field_type != FieldType::Any {
                prop.insert("type".into(), json!(field.field_type.as_str()));
            }
            if let Some(description) = &field.description {
                prop.insert("description".into(), json!(description));
            }
            if let Some(default) = &field.default {
                prop.insert("default".into(), default.clone());
            }
            properties.insert(field.name.clone(), Value::Object(prop));
        }

        let required: Vec<&str> = self
            .fields
            .iter()
            .filter(|f| f.required)
            .map(|f| f.name.as_str())
            .collect();

        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}

// ─── Validation ─────────────────────────────────────────────────────────────

/// Validate `arguments` for `tool` and return the normalized mapping.
///
/// `null` on an optional field counts as absent. Fields the schema does not
/// declare are dropped, not rejected.
pub fn validate(
    tool: &str,
    schema: &ToolSchema,
    arguments: &Map<String, Value>,
) -> Result<Map<String, Value>, AgentError> {
    let mut normalized = Map::new();

    for field in &schema.fields {
        match arguments.get(&field.name) {
            None | Some(Value::Null) if !field.required => {
                if let Some(default) = &field.default {
                    normalized.insert(field.name.clone(), default.clone());
                }
            }
            None => {
                return Err(AgentError::Validation {
                    tool: tool.to_string(),
                    field: field.name.clone(),
                    reason: "is required but missing".into(),
                });
            }
            Some(value) => {
                let value = match value {
                    Value::String(text) if !field.field_type.accepts(value) => field
                        .field_type
                        .coerce_text(text)
                        .unwrap_or_else(|| value.clone()),
                    other => other.clone(),
                };
                if !field.field_type.accepts(&value) {
                    return Err(AgentError::Validation {
                        tool: tool.to_string(),
                        field: field.name.clone(),
                        reason: format!(
                            "must be {}, got {}",
                            field.field_type.as_str(),
                            json_type_name(&value)
                        ),
                    });
                }
                normalized.insert(field.name.clone(), value);
            }
        }
    }

    let ignored: Vec<&str> = arguments
        .keys()
        .filter(|key| !schema.fields.iter().any(|f| &f.name == *key))
        .map(String::as_str)
        .collect();
    if !ignored.is_empty() {
        tracing::debug!(tool, ignored = ?ignored, "ignoring undeclared arguments");
    }

    Ok(normalized)
}

// ─── Tests ──────────────────────────────────────────────────────────────────
