//! Schema definition and validation.
//!
//! Each object type carries a property descriptor table built once at schema
//! registration. Everything that needs to name a property (queries, key-path
//! filters, diffs) resolves it through this table by index.

use crate::{error::Result, Error, SchemaVersion, TableName};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Property types supported in schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyType {
    String,
    Int,
    Float,
    Bool,
    Timestamp,
    /// Arbitrary nested JSON
    Json,
    /// Key of an object in the target table
    Link,
    /// Ordered list of keys in the target table
    List,
}

impl PropertyType {
    /// Whether values of this type have a meaningful ordering.
    pub fn is_ordered(&self) -> bool {
        matches!(
            self,
            PropertyType::String | PropertyType::Int | PropertyType::Float | PropertyType::Timestamp
        )
    }
}

impl std::fmt::Display for PropertyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PropertyType::String => write!(f, "String"),
            PropertyType::Int => write!(f, "Int"),
            PropertyType::Float => write!(f, "Float"),
            PropertyType::Bool => write!(f, "Bool"),
            PropertyType::Timestamp => write!(f, "Timestamp"),
            PropertyType::Json => write!(f, "Json"),
            PropertyType::Link => write!(f, "Link"),
            PropertyType::List => write!(f, "List"),
        }
    }
}

/// Descriptor of one persisted property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyDescriptor {
    /// Property name
    pub name: String,
    /// Property type
    pub property_type: PropertyType,
    /// Whether the property may be absent or null
    pub optional: bool,
    /// Target table for `Link` and `List` properties
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<TableName>,
}

impl PropertyDescriptor {
    /// Create a new required property descriptor.
    pub fn required(name: impl Into<String>, property_type: PropertyType) -> Self {
        Self {
            name: name.into(),
            property_type,
            optional: false,
            target: None,
        }
    }

    /// Create a new optional property descriptor.
    pub fn optional(name: impl Into<String>, property_type: PropertyType) -> Self {
        Self {
            name: name.into(),
            property_type,
            optional: true,
            target: None,
        }
    }

    /// An optional link to an object of `target`.
    pub fn link(name: impl Into<String>, target: impl Into<TableName>) -> Self {
        Self {
            name: name.into(),
            property_type: PropertyType::Link,
            optional: true,
            target: Some(target.into()),
        }
    }

    /// An ordered list of objects of `target`. Lists default to empty.
    pub fn list(name: impl Into<String>, target: impl Into<TableName>) -> Self {
        Self {
            name: name.into(),
            property_type: PropertyType::List,
            optional: true,
            target: Some(target.into()),
        }
    }

    /// Validate a JSON value against this descriptor.
    pub fn validate(&self, value: Option<&Value>) -> Result<()> {
        match value {
            None if !self.optional => Err(Error::MissingRequiredProperty(self.name.clone())),
            None => Ok(()),
            Some(Value::Null) if !self.optional => {
                Err(Error::MissingRequiredProperty(self.name.clone()))
            }
            Some(Value::Null) => Ok(()),
            Some(v) => self.validate_type(v),
        }
    }

    fn validate_type(&self, value: &Value) -> Result<()> {
        let valid = match self.property_type {
            PropertyType::String => value.is_string(),
            PropertyType::Int => value.is_i64() || value.is_u64(),
            PropertyType::Float => value.is_f64() || value.is_i64() || value.is_u64(),
            PropertyType::Bool => value.is_boolean(),
            PropertyType::Timestamp => value.is_u64() || value.is_i64(),
            PropertyType::Json => true,
            PropertyType::Link => value.is_string(),
            PropertyType::List => value
                .as_array()
                .is_some_and(|items| items.iter().all(Value::is_string)),
        };

        if valid {
            Ok(())
        } else {
            Err(Error::TypeMismatch {
                property: self.name.clone(),
                expected: self.property_type.to_string(),
                got: json_type_name(value).to_string(),
            })
        }
    }

    /// The value a property holds when it was never written.
    pub fn default_value(&self) -> Value {
        match self.property_type {
            PropertyType::List => Value::Array(Vec::new()),
            _ => Value::Null,
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "Null",
        Value::Bool(_) => "Bool",
        Value::Number(n) if n.is_i64() || n.is_u64() => "Int",
        Value::Number(_) => "Float",
        Value::String(_) => "String",
        Value::Array(_) => "Array",
        Value::Object(_) => "Object",
    }
}

/// Schema for one object type (one table).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSchema {
    /// Table name
    pub name: TableName,
    /// Name of the string property holding the primary key
    pub primary_key: String,
    /// Property descriptor table, in declaration order
    pub properties: Vec<PropertyDescriptor>,
}

impl ObjectSchema {
    /// Create a new object schema.
    ///
    /// A required `String` primary key property is added at index 0 if the
    /// descriptor list does not declare it.
    pub fn new(
        name: impl Into<TableName>,
        primary_key: impl Into<String>,
        properties: Vec<PropertyDescriptor>,
    ) -> Self {
        let primary_key = primary_key.into();
        let mut properties = properties;
        if !properties.iter().any(|p| p.name == primary_key) {
            properties.insert(
                0,
                PropertyDescriptor::required(primary_key.clone(), PropertyType::String),
            );
        }
        Self {
            name: name.into(),
            primary_key,
            properties,
        }
    }

    /// Index of `name` in the descriptor table.
    pub fn property_index(&self, name: &str) -> Option<usize> {
        self.properties.iter().position(|p| p.name == name)
    }

    /// Descriptor for `name`.
    pub fn descriptor(&self, name: &str) -> Option<&PropertyDescriptor> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Descriptor for `name`, or an `UnknownProperty` error.
    pub fn require(&self, name: &str) -> Result<&PropertyDescriptor> {
        self.descriptor(name).ok_or_else(|| Error::UnknownProperty {
            table: self.name.clone(),
            property: name.to_string(),
        })
    }

    /// Validate a full object payload.
    pub fn validate_object(&self, payload: &Value) -> Result<()> {
        let obj = payload
            .as_object()
            .ok_or_else(|| Error::InvalidPayload("payload must be an object".into()))?;

        for key in obj.keys() {
            self.require(key)?;
        }
        for property in &self.properties {
            property.validate(obj.get(&property.name))?;
        }

        Ok(())
    }

    /// Validate a single property value.
    pub fn validate_value(&self, name: &str, value: &Value) -> Result<()> {
        self.require(name)?.validate(Some(value))
    }
}

/// Schema for the entire store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    /// Schema version for migrations
    pub version: SchemaVersion,
    /// Object schemas by table name
    pub objects: BTreeMap<TableName, ObjectSchema>,
}

impl Schema {
    /// Create a new schema.
    pub fn new(version: SchemaVersion) -> Self {
        Self {
            version,
            objects: BTreeMap::new(),
        }
    }

    /// Add an object type to the schema.
    pub fn add_object(&mut self, object: ObjectSchema) -> &mut Self {
        self.objects.insert(object.name.clone(), object);
        self
    }

    /// Builder-style method to add an object type.
    pub fn with_object(mut self, object: ObjectSchema) -> Self {
        self.add_object(object);
        self
    }

    /// Get an object schema by table name.
    pub fn get_object(&self, name: &str) -> Option<&ObjectSchema> {
        self.objects.get(name)
    }

    /// Get an object schema by table name, or a `TableNotFound` error.
    pub fn require(&self, name: &str) -> Result<&ObjectSchema> {
        self.objects
            .get(name)
            .ok_or_else(|| Error::TableNotFound(name.to_string()))
    }
}
