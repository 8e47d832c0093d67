//! JSON Schema validation seam.

use serde_json::Value;

use volley_types::{Result, VolleyError};

pub trait SchemaValidator: Send + Sync {
    /// `Ok(None)` when `value` conforms to `schema`, otherwise the list of
    /// violations. `Err` only for a schema that cannot be compiled.
    fn validate(&self, schema: &Value, value: &Value) -> Result<Option<Vec<String>>>;
}

/// Validator backed by the `jsonschema` crate; the draft is picked from the
/// schema's `$schema` keyword.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSchemaValidator;

impl SchemaValidator for JsonSchemaValidator {
    fn validate(&self, schema: &Value, value: &Value) -> Result<Option<Vec<String>>> {
        let validator =
            jsonschema::validator_for(schema).map_err(|e| VolleyError::Schema(e.to_string()))?;
        let errors: Vec<String> = validator
            .iter_errors(value)
            .map(|e| {
                let location = e.instance_path.to_string();
                if location.is_empty() {
                    e.to_string()
                } else {
                    format!("{location}: {e}")
                }
            })
            .collect();
        Ok((!errors.is_empty()).then_some(errors))
    }
}
