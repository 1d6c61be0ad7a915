//! Turn a completion into the single value stored in a cell.
use crate::config::OutputFieldSpec;
use crate::enrich::schema::ResponseSchema;
use crate::gateway::{parse_json_object, Completion};
use serde_json::Value;

/// Stored when a structured response omits the schema's first property.
pub const MISSING_PROPERTY_DEFAULT: &str = "N/A";

/// Value to store for `field`, or `None` when the completion yields nothing usable.
pub fn extract(completion: &Completion, field: &OutputFieldSpec) -> Option<String> {
    let schema = field.response_format.as_ref();
    let value = match (completion, schema) {
        (Completion::Structured(value), Some(schema)) => from_schema(value, schema),
        (Completion::Structured(value), None) => value.to_string(),
        (Completion::Text(text), Some(schema)) => match parse_json_object(text) {
            Some(value) => from_schema(&value, schema),
            None => text.trim().to_string(),
        },
        (Completion::Text(text), None) => text.trim().to_string(),
    };
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

fn from_schema(value: &Value, schema: &ResponseSchema) -> String {
    let property = schema
        .primary_property()
        .and_then(|property| value.get(&property.name));
    match property {
        None | Some(Value::Null) => MISSING_PROPERTY_DEFAULT.to_string(),
        Some(Value::String(text)) => text.trim().to_string(),
        Some(other) => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrich::schema::{PropertyType, SchemaProperty};
    use serde_json::json;

    fn field(schema: Option<ResponseSchema>) -> OutputFieldSpec {
        OutputFieldSpec {
            name: "Difficulty".to_string(),
            prompt: "Classify.".to_string(),
            input_columns: vec!["Task".to_string()],
            max_tokens: 50,
            temperature: 0.7,
            fetch_all: false,
            response_format: schema,
        }
    }

    fn schema(names: &[&str]) -> ResponseSchema {
        ResponseSchema {
            name: None,
            description: None,
            properties: names
                .iter()
                .map(|name| SchemaProperty {
                    name: name.to_string(),
                    kind: PropertyType::String,
                    allowed: Vec::new(),
                    description: None,
                })
                .collect(),
        }
    }

    #[test]
    fn text_is_trimmed() {
        let completion = Completion::Text("  medium \n".to_string());
        assert_eq!(extract(&completion, &field(None)).as_deref(), Some("medium"));
    }

    #[test]
    fn blank_text_yields_nothing() {
        let completion = Completion::Text(" \n\t".to_string());
        assert_eq!(extract(&completion, &field(None)), None);
    }

    #[test]
    fn structured_reads_first_declared_property() {
        let spec = field(Some(schema(&["difficulty", "reason"])));
        let completion = Completion::Structured(json!({"reason": "long", "difficulty": " hard "}));
        assert_eq!(extract(&completion, &spec).as_deref(), Some("hard"));
    }

    #[test]
    fn missing_or_null_property_stores_default() {
        let spec = field(Some(schema(&["difficulty"])));
        let missing = Completion::Structured(json!({}));
        assert_eq!(extract(&missing, &spec).as_deref(), Some(MISSING_PROPERTY_DEFAULT));
        let null = Completion::Structured(json!({"difficulty": null}));
        assert_eq!(extract(&null, &spec).as_deref(), Some(MISSING_PROPERTY_DEFAULT));
    }

    #[test]
    fn literal_na_answer_is_stored_as_is() {
        let completion = Completion::Structured(json!({"risk_level": "N/A", "other_prop": "x"}));
        let field = field(Some(schema(&["risk_level", "other_prop"])));
        assert_eq!(extract(&completion, &field).as_deref(), Some("N/A"));
    }

    #[test]
    fn non_string_scalars_use_json_rendering() {
        let spec = field(Some(schema(&["score"])));
        let number = Completion::Structured(json!({"score": 4.5}));
        assert_eq!(extract(&number, &spec).as_deref(), Some("4.5"));
        let flag = Completion::Structured(json!({"score": true}));
        assert_eq!(extract(&flag, &spec).as_deref(), Some("true"));
    }

    #[test]
    fn structured_without_schema_is_compact_json() {
        let completion = Completion::Structured(json!({"a": 1}));
        assert_eq!(extract(&completion, &field(None)).as_deref(), Some(r#"{"a":1}"#));
    }

    #[test]
    fn text_answer_to_schema_request_is_parsed_when_possible() {
        let spec = field(Some(schema(&["difficulty"])));
        let fenced = Completion::Text("```json\n{\"difficulty\": \"easy\"}\n```".to_string());
        assert_eq!(extract(&fenced, &spec).as_deref(), Some("easy"));
        let prose = Completion::Text(" easy ".to_string());
        assert_eq!(extract(&prose, &spec).as_deref(), Some("easy"));
    }
}
