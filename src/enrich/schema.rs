//! Typed structured-output contract for a single output field.
//!
//! Properties keep their declaration order. The extractor stores the first
//! declared property only, so a schema is expected to carry one property of
//! interest; extra properties are still sent to the model.
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyType {
    #[default]
    String,
    Number,
    Integer,
    Boolean,
}

impl PropertyType {
    fn as_str(self) -> &'static str {
        match self {
            PropertyType::String => "string",
            PropertyType::Number => "number",
            PropertyType::Integer => "integer",
            PropertyType::Boolean => "boolean",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchemaProperty {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: PropertyType,
    #[serde(rename = "enum", default, skip_serializing_if = "Vec::is_empty")]
    pub allowed: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResponseSchema {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub properties: Vec<SchemaProperty>,
}

impl ResponseSchema {
    /// The property whose value is stored in the cell.
    pub fn primary_property(&self) -> Option<&SchemaProperty> {
        self.properties.first()
    }

    /// Name sent with the request, falling back to one derived from the field.
    pub fn request_name(&self, field: &str) -> String {
        match self.name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => slug(name),
            _ => default_schema_name(field),
        }
    }

    /// JSON Schema object handed to the completion service.
    pub fn to_json_schema(&self) -> Value {
        let mut properties = Map::new();
        for property in &self.properties {
            let mut spec = Map::new();
            spec.insert("type".to_string(), json!(property.kind.as_str()));
            if !property.allowed.is_empty() {
                spec.insert("enum".to_string(), Value::Array(property.allowed.clone()));
            }
            if let Some(description) = &property.description {
                spec.insert("description".to_string(), json!(description));
            }
            properties.insert(property.name.clone(), Value::Object(spec));
        }
        let required: Vec<&str> = self
            .properties
            .iter()
            .map(|property| property.name.as_str())
            .collect();
        let mut schema = json!({
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": false,
        });
        if let (Some(description), Some(object)) = (&self.description, schema.as_object_mut()) {
            object.insert("description".to_string(), json!(description));
        }
        schema
    }

    pub fn validate(&self, field: &str) -> Result<()> {
        if self.properties.is_empty() {
            return Err(anyhow!(
                "response_format for {field:?} must declare at least one property"
            ));
        }
        let mut seen = BTreeSet::new();
        for property in &self.properties {
            let name = property.name.trim();
            if name.is_empty() {
                return Err(anyhow!("response_format for {field:?} has an unnamed property"));
            }
            if !seen.insert(name) {
                return Err(anyhow!(
                    "response_format for {field:?} declares property {name:?} twice"
                ));
            }
        }
        if self.properties.len() > 1 {
            tracing::warn!(
                field,
                property = %self.properties[0].name,
                "schema declares several properties; only the first is stored"
            );
        }
        Ok(())
    }
}

/// `<field>_response`, restricted to the characters schema names allow.
pub fn default_schema_name(field: &str) -> String {
    let base = slug(field);
    if base.is_empty() {
        "field_response".to_string()
    } else {
        format!("{base}_response")
    }
}

fn slug(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() || ch == '-' {
            out.push(ch.to_ascii_lowercase());
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    out.trim_matches('_').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn difficulty_schema() -> ResponseSchema {
        ResponseSchema {
            name: None,
            description: None,
            properties: vec![SchemaProperty {
                name: "difficulty".to_string(),
                kind: PropertyType::String,
                allowed: vec![json!("easy"), json!("medium"), json!("hard")],
                description: None,
            }],
        }
    }

    #[test]
    fn json_schema_lists_properties_in_order_and_requires_all() {
        let mut schema = difficulty_schema();
        schema.properties.push(SchemaProperty {
            name: "reason".to_string(),
            kind: PropertyType::String,
            allowed: Vec::new(),
            description: Some("why".to_string()),
        });
        let value = schema.to_json_schema();
        assert_eq!(value["type"], "object");
        assert_eq!(value["required"], json!(["difficulty", "reason"]));
        assert_eq!(value["additionalProperties"], json!(false));
        assert_eq!(
            value["properties"]["difficulty"]["enum"],
            json!(["easy", "medium", "hard"])
        );
        assert_eq!(value["properties"]["reason"]["description"], "why");
        assert_eq!(schema.primary_property().map(|p| p.name.as_str()), Some("difficulty"));
    }

    #[test]
    fn unnamed_schema_gets_field_derived_name() {
        let schema = difficulty_schema();
        assert_eq!(schema.request_name("Risk Level"), "risk_level_response");
        assert_eq!(default_schema_name("???"), "field_response");
        let named = ResponseSchema {
            name: Some("Classify Difficulty".to_string()),
            ..difficulty_schema()
        };
        assert_eq!(named.request_name("Difficulty"), "classify_difficulty");
    }

    #[test]
    fn validate_rejects_empty_and_duplicate_properties() {
        let empty = ResponseSchema {
            name: None,
            description: None,
            properties: Vec::new(),
        };
        assert!(empty.validate("Difficulty").is_err());

        let mut duplicate = difficulty_schema();
        duplicate.properties.push(duplicate.properties[0].clone());
        let err = duplicate.validate("Difficulty").expect_err("duplicate");
        assert!(err.to_string().contains("twice"));
    }
}
