use crate::topic::{self, META_ELEMENT};
use crate::Error;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyType {
    Boolean,
    Integer,
    Number,
    String,
    Object,
    #[serde(alias = "list")]
    Array,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PropertyDefinition {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_of: Option<PropertyType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "readOnly", default, skip_serializing_if = "Option::is_none")]
    pub read_only: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<PropertyDefinition>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<HashMap<String, PropertyDefinition>>,
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<Value>>,
}

impl PropertyDefinition {
    pub fn of_type(type_of: PropertyType) -> Self {
        PropertyDefinition {
            type_of: Some(type_of),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EventDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<HashMap<String, PropertyDefinition>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct OperationDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<HashMap<String, PropertyDefinition>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<PropertyDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubModelDefinition {
    pub name: String,
    #[serde(rename = "rev", alias = "revision", alias = "version", default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<HashMap<String, PropertyDefinition>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub events: Option<HashMap<String, EventDefinition>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operations: Option<HashMap<String, OperationDefinition>>,
}

impl SubModelDefinition {
    /// Rejects descriptors the runtime cannot bind: an unusable name, element
    /// names that could not appear as an address segment, names used by more
    /// than one element kind, or a user-defined `_meta`.
    pub fn check_shape(&self) -> Result<(), Error> {
        if !topic::is_valid_name(&self.name) {
            return Err(Error::SubmodelDefinitionError(format!(
                "invalid submodel name '{}'",
                self.name
            )));
        }
        let mut seen = HashSet::new();
        let names = self
            .properties
            .iter()
            .flat_map(|m| m.keys())
            .chain(self.operations.iter().flat_map(|m| m.keys()))
            .chain(self.events.iter().flat_map(|m| m.keys()));
        for name in names {
            if !topic::is_valid_name(name) {
                return Err(Error::SubmodelDefinitionError(format!(
                    "invalid element name '{}' in submodel '{}'",
                    name, self.name
                )));
            }
            if name == META_ELEMENT {
                return Err(Error::SubmodelDefinitionError(format!(
                    "submodel '{}' must not define '{}'",
                    self.name, META_ELEMENT
                )));
            }
            if !seen.insert(name.as_str()) {
                return Err(Error::SubmodelDefinitionError(format!(
                    "element name '{}' used twice in submodel '{}'",
                    name, self.name
                )));
            }
        }
        Ok(())
    }
}

/// A parsed descriptor together with where it came from and its raw JSON,
/// which is what `_meta` republishes verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmodelDescriptor {
    pub url: String,
    pub definition: SubModelDefinition,
    pub raw: Value,
}

impl SubmodelDescriptor {
    pub fn from_value(raw: Value, url: impl Into<String>) -> Result<Self, Error> {
        let definition: SubModelDefinition = serde_json::from_value(raw.clone())?;
        definition.check_shape()?;
        Ok(SubmodelDescriptor {
            url: url.into(),
            definition,
            raw,
        })
    }

    pub fn parse(text: &str, url: impl Into<String>) -> Result<Self, Error> {
        let raw: Value = serde_json::from_str(text)?;
        Self::from_value(raw, url)
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }
}

/// Payload of the retained `_meta` property every owned submodel publishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaDescriptor {
    pub source: String,
    pub submodel_url: String,
    pub submodel_definition: Value,
}

pub(crate) fn meta_property_definition() -> PropertyDefinition {
    let mut properties = HashMap::new();
    properties.insert("source".to_string(), PropertyDefinition::of_type(PropertyType::String));
    properties.insert("submodel_url".to_string(), PropertyDefinition::of_type(PropertyType::String));
    properties.insert(
        "submodel_definition".to_string(),
        PropertyDefinition::of_type(PropertyType::Object),
    );
    PropertyDefinition {
        type_of: Some(PropertyType::Object),
        read_only: Some(true),
        properties: Some(properties),
        ..Default::default()
    }
}

fn mismatch(expected: &str, value: &Value) -> Error {
    Error::InvalidParameter {
        context: "value".to_string(),
        reason: format!("type mismatch: expected {}, got {}", expected, value),
    }
}

/// Checks `value` against a declared type: nested object members, array items
/// and enumerations included. Members not declared in an object definition
/// are tolerated.
pub fn validate_value(value: &Value, def: &PropertyDefinition) -> Result<(), Error> {
    match def.type_of {
        Some(PropertyType::Boolean) => {
            if !value.is_boolean() {
                return Err(mismatch("boolean", value));
            }
        }
        Some(PropertyType::Integer) => {
            if !(value.is_i64() || value.is_u64()) {
                return Err(mismatch("integer", value));
            }
        }
        Some(PropertyType::Number) => {
            if !value.is_number() {
                return Err(mismatch("number", value));
            }
        }
        Some(PropertyType::String) => {
            if !value.is_string() {
                return Err(mismatch("string", value));
            }
        }
        Some(PropertyType::Object) => {
            let Some(members) = value.as_object() else {
                return Err(mismatch("object", value));
            };
            if let Some(defined) = def.properties.as_ref() {
                for (key, member) in members {
                    match defined.get(key) {
                        Some(sub_def) => validate_value(member, sub_def)?,
                        None => log::debug!("Validation: undeclared member '{}' in object value", key),
                    }
                }
            }
        }
        Some(PropertyType::Array) => {
            let Some(items) = value.as_array() else {
                return Err(mismatch("array", value));
            };
            if let Some(item_def) = def.items.as_ref() {
                for item in items {
                    validate_value(item, item_def)?;
                }
            }
        }
        None => {}
    }
    if let Some(allowed) = def.enum_values.as_ref() {
        if !allowed.contains(value) {
            return Err(Error::InvalidParameter {
                context: "value".to_string(),
                reason: format!("{} not in allowed values {:?}", value, allowed),
            });
        }
    }
    Ok(())
}

/// Validates a parameter map against declared parameters. Every declared
/// parameter must be present; undeclared ones are logged and passed through.
pub(crate) fn validate_parameters(
    context: &str,
    params: &HashMap<String, Value>,
    declared: Option<&HashMap<String, PropertyDefinition>>,
) -> Result<(), Error> {
    let Some(declared) = declared else {
        if !params.is_empty() {
            log::warn!("'{}' declares no parameters but got {:?}", context, params.keys());
        }
        return Ok(());
    };
    for (name, def) in declared {
        let Some(value) = params.get(name) else {
            return Err(Error::InvalidParameter {
                context: context.to_string(),
                reason: format!("missing parameter '{}'", name),
            });
        };
        validate_value(value, def).map_err(|e| Error::InvalidParameter {
            context: format!("{}.{}", context, name),
            reason: e.to_string(),
        })?;
    }
    for name in params.keys().filter(|k| !declared.contains_key(*k)) {
        log::warn!("Unknown parameter '{}' for '{}'", name, context);
    }
    Ok(())
}
