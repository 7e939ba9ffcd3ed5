use serde_json::{json, Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    String,
    Enum(Vec<String>),
    /// A JSON number or `null`.
    NullableNumber,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaField {
    pub name: String,
    pub field_type: FieldType,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaViolation {
    #[error("response is not a JSON object")]
    NotAnObject,
    #[error("required field '{0}' is missing")]
    MissingField(String),
    #[error("field '{field}' must be {expected}")]
    WrongType { field: String, expected: &'static str },
    #[error("field '{field}' has value '{value}', expected one of [{allowed}]")]
    NotInEnum {
        field: String,
        value: String,
        allowed: String,
    },
}

/// A flat object schema where every field is required.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputSchema {
    pub fields: Vec<SchemaField>,
}

impl OutputSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn string(self, name: &str, description: &str) -> Self {
        self.field(name, FieldType::String, description)
    }

    pub fn enumeration(self, name: &str, values: &[&str], description: &str) -> Self {
        let values = values.iter().map(|value| value.to_string()).collect();
        self.field(name, FieldType::Enum(values), description)
    }

    pub fn nullable_number(self, name: &str, description: &str) -> Self {
        self.field(name, FieldType::NullableNumber, description)
    }

    fn field(mut self, name: &str, field_type: FieldType, description: &str) -> Self {
        self.fields.push(SchemaField {
            name: name.to_string(),
            field_type,
            description: description.to_string(),
        });
        self
    }

    /// Checks `value` against the schema without coercing anything. Unknown
    /// extra keys are dropped from the returned object.
    pub fn validate(&self, value: &Value) -> Result<Map<String, Value>, SchemaViolation> {
        let Some(object) = value.as_object() else {
            return Err(SchemaViolation::NotAnObject);
        };
        let mut out = Map::new();
        for field in &self.fields {
            let Some(raw) = object.get(&field.name) else {
                return Err(SchemaViolation::MissingField(field.name.clone()));
            };
            match &field.field_type {
                FieldType::String => {
                    if !raw.is_string() {
                        return Err(SchemaViolation::WrongType {
                            field: field.name.clone(),
                            expected: "a string",
                        });
                    }
                }
                FieldType::Enum(allowed) => {
                    let Some(text) = raw.as_str() else {
                        return Err(SchemaViolation::WrongType {
                            field: field.name.clone(),
                            expected: "a string",
                        });
                    };
                    if !allowed.iter().any(|candidate| candidate == text) {
                        return Err(SchemaViolation::NotInEnum {
                            field: field.name.clone(),
                            value: text.to_string(),
                            allowed: allowed.join(", "),
                        });
                    }
                }
                FieldType::NullableNumber => {
                    if !(raw.is_null() || raw.is_number()) {
                        return Err(SchemaViolation::WrongType {
                            field: field.name.clone(),
                            expected: "a number or null",
                        });
                    }
                }
            }
            out.insert(field.name.clone(), raw.clone());
        }
        Ok(out)
    }

    /// The OpenAPI-subset dialect Gemini accepts as `responseSchema`.
    pub fn to_gemini_schema(&self) -> Value {
        let mut properties = Map::new();
        for field in &self.fields {
            let property = match &field.field_type {
                FieldType::String => json!({
                    "type": "STRING",
                    "description": field.description,
                }),
                FieldType::Enum(values) => json!({
                    "type": "STRING",
                    "format": "enum",
                    "enum": values,
                    "description": field.description,
                }),
                FieldType::NullableNumber => json!({
                    "type": "NUMBER",
                    "nullable": true,
                    "description": field.description,
                }),
            };
            properties.insert(field.name.clone(), property);
        }
        let names: Vec<&str> = self.fields.iter().map(|field| field.name.as_str()).collect();
        json!({
            "type": "OBJECT",
            "properties": properties,
            "required": names,
            "propertyOrdering": names,
        })
    }

    /// A conforming object with neutral values, for offline providers.
    pub fn placeholder(&self, seed_text: &str) -> Value {
        let mut out = Map::new();
        for field in &self.fields {
            let value = match &field.field_type {
                FieldType::String => Value::String(format!("{} for: {}", field.name, seed_text)),
                FieldType::Enum(values) => values
                    .first()
                    .map(|value| Value::String(value.clone()))
                    .unwrap_or(Value::Null),
                FieldType::NullableNumber => Value::Null,
            };
            out.insert(field.name.clone(), value);
        }
        Value::Object(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> OutputSchema {
        OutputSchema::new()
            .string("prompt", "what to draw")
            .enumeration("kind", &["none", "character"], "subject kind")
            .nullable_number("anchor", "frame index")
    }

    #[test]
    fn conforming_payload_passes_and_extras_are_dropped() -> anyhow::Result<()> {
        let validated = schema().validate(&json!({
            "prompt": "a lighthouse",
            "kind": "character",
            "anchor": null,
            "chatter": "ignored",
        }))?;
        assert_eq!(validated.len(), 3);
        assert!(!validated.contains_key("chatter"));
        Ok(())
    }

    #[test]
    fn each_kind_of_mismatch_is_reported() {
        let schema = schema();
        assert_eq!(
            schema.validate(&json!(["prompt"])),
            Err(SchemaViolation::NotAnObject)
        );
        assert_eq!(
            schema.validate(&json!({"prompt": "x", "kind": "none"})),
            Err(SchemaViolation::MissingField("anchor".to_string()))
        );
        assert!(matches!(
            schema.validate(&json!({"prompt": 3, "kind": "none", "anchor": null})),
            Err(SchemaViolation::WrongType { .. })
        ));
        assert!(matches!(
            schema.validate(&json!({"prompt": "x", "kind": "dragon", "anchor": null})),
            Err(SchemaViolation::NotInEnum { .. })
        ));
        assert!(matches!(
            schema.validate(&json!({"prompt": "x", "kind": "none", "anchor": "2"})),
            Err(SchemaViolation::WrongType { .. })
        ));
    }

    #[test]
    fn gemini_schema_lists_every_field_as_required() {
        let rendered = schema().to_gemini_schema();
        assert_eq!(rendered["type"], "OBJECT");
        assert_eq!(rendered["required"], json!(["prompt", "kind", "anchor"]));
        assert_eq!(rendered["properties"]["kind"]["enum"], json!(["none", "character"]));
        assert_eq!(rendered["properties"]["anchor"]["nullable"], json!(true));
    }

    #[test]
    fn placeholder_always_validates() {
        let schema = schema();
        let placeholder = schema.placeholder("sketch");
        assert!(schema.validate(&placeholder).is_ok());
        assert_eq!(placeholder["kind"], "none");
    }
}
