//! Parameter schemas for tools and services.
//!
//! Serializes to the `type`/`properties`/`required`/`enum` shape that
//! tool-calling integrations expect.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// JSON value type of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

impl SchemaType {
    /// Whether `value` has this type.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
        }
    }
}

/// Schema of a single property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertySchema {
    #[serde(rename = "type")]
    pub schema_type: SchemaType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<Value>>,
    /// Element schema for arrays
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<PropertySchema>>,
}

impl PropertySchema {
    pub fn new(schema_type: SchemaType) -> Self {
        Self {
            schema_type,
            description: None,
            allowed: None,
            items: None,
        }
    }

    pub fn string() -> Self {
        Self::new(SchemaType::String)
    }

    pub fn number() -> Self {
        Self::new(SchemaType::Number)
    }

    pub fn integer() -> Self {
        Self::new(SchemaType::Integer)
    }

    pub fn boolean() -> Self {
        Self::new(SchemaType::Boolean)
    }

    pub fn array(items: PropertySchema) -> Self {
        Self {
            items: Some(Box::new(items)),
            ..Self::new(SchemaType::Array)
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Restrict the property to a fixed set of string values.
    pub fn one_of<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed = Some(values.into_iter().map(|s| Value::String(s.into())).collect());
        self
    }

    fn check(&self, path: &str, value: &Value) -> Result<(), String> {
        if !self.schema_type.matches(value) {
            return Err(format!(
                "'{}' must be of type {}",
                path,
                self.schema_type.name()
            ));
        }
        if let Some(allowed) = &self.allowed {
            if !allowed.contains(value) {
                let options: Vec<String> = allowed.iter().map(|v| v.to_string()).collect();
                return Err(format!("'{}' must be one of {}", path, options.join(", ")));
            }
        }
        if let (Some(items), Some(array)) = (&self.items, value.as_array()) {
            for (i, item) in array.iter().enumerate() {
                items.check(&format!("{}[{}]", path, i), item)?;
            }
        }
        Ok(())
    }
}

/// Object schema describing tool or service arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSchema {
    /// Always `"object"`
    #[serde(rename = "type")]
    pub schema_type: SchemaType,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertySchema>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
}

impl Default for ParameterSchema {
    fn default() -> Self {
        Self {
            schema_type: SchemaType::Object,
            properties: BTreeMap::new(),
            required: Vec::new(),
        }
    }
}

impl ParameterSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an optional property.
    pub fn property(mut self, name: impl Into<String>, schema: PropertySchema) -> Self {
        self.properties.insert(name.into(), schema);
        self
    }

    /// Add a required property.
    pub fn required_property(mut self, name: impl Into<String>, schema: PropertySchema) -> Self {
        let name = name.into();
        if !self.required.contains(&name) {
            self.required.push(name.clone());
        }
        self.properties.insert(name, schema);
        self
    }

    /// Validate arguments against this schema.
    ///
    /// Unknown properties are accepted. `null` arguments are treated as an
    /// empty object.
    pub fn validate(&self, args: &Value) -> Result<(), String> {
        let empty = serde_json::Map::new();
        let object = match args {
            Value::Object(map) => map,
            Value::Null => &empty,
            _ => return Err("arguments must be an object".to_string()),
        };

        for name in &self.required {
            match object.get(name) {
                None | Some(Value::Null) => {
                    return Err(format!("missing required parameter '{}'", name));
                }
                Some(_) => {}
            }
        }

        for (name, value) in object {
            if value.is_null() {
                continue;
            }
            if let Some(schema) = self.properties.get(name) {
                schema.check(name, value)?;
            }
        }
        Ok(())
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
