//! Input and output checks against a spec's [`IoSchema`].
//!
//! A field counts as present when the key exists and is not `null`.

use serde_json::Value;

use crate::capabilities::CapabilityOutput;
use crate::registry::IoSchema;

fn missing_fields<'a>(fields: &'a [String], value: Option<&Value>) -> Vec<&'a str> {
    fields
        .iter()
        .filter(|field| {
            value
                .and_then(|v| v.get(field.as_str()))
                .map_or(true, Value::is_null)
        })
        .map(String::as_str)
        .collect()
}

/// Check that every required input is present. Returns the problems found.
pub fn validate_input(schema: &IoSchema, input: &Value) -> Result<(), Vec<String>> {
    if schema.required_inputs.is_empty() {
        return Ok(());
    }
    if !input.is_object() {
        return Err(vec!["input must be a JSON object".to_string()]);
    }

    let missing = missing_fields(&schema.required_inputs, Some(input));
    if missing.is_empty() {
        Ok(())
    } else {
        Err(missing
            .into_iter()
            .map(|field| format!("missing required input '{field}'"))
            .collect())
    }
}

/// Check a successful output for its `success_fields`, or a failed one for
/// an error message or its `failure_fields`.
pub fn validate_output(schema: &IoSchema, output: &CapabilityOutput) -> Result<(), Vec<String>> {
    if output.success {
        let missing = missing_fields(&schema.success_fields, output.data.as_ref());
        if missing.is_empty() {
            return Ok(());
        }
        return Err(missing
            .into_iter()
            .map(|field| format!("missing success field '{field}'"))
            .collect());
    }

    if output.error.is_some() {
        return Ok(());
    }
    let missing = missing_fields(&schema.failure_fields, output.data.as_ref());
    if missing.is_empty() && !schema.failure_fields.is_empty() {
        Ok(())
    } else {
        let mut problems = vec!["failed output carries no error".to_string()];
        problems.extend(
            missing
                .into_iter()
                .map(|field| format!("missing failure field '{field}'")),
        );
        Err(problems)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> IoSchema {
        IoSchema {
            required_inputs: vec!["path".to_string()],
            optional_inputs: vec!["force".to_string()],
            success_fields: vec!["deleted".to_string()],
            failure_fields: vec!["reason".to_string()],
        }
    }

    #[test]
    fn test_input_requires_fields() {
        assert!(validate_input(&schema(), &json!({ "path": "/tmp/x" })).is_ok());

        let problems = validate_input(&schema(), &json!({ "path": null })).unwrap_err();
        assert_eq!(problems, vec!["missing required input 'path'"]);

        assert!(validate_input(&schema(), &json!("nope")).is_err());
        assert!(validate_input(&IoSchema::default(), &json!("anything")).is_ok());
    }

    #[test]
    fn test_output_fields() {
        let ok = CapabilityOutput::ok(json!({ "deleted": true }));
        assert!(validate_output(&schema(), &ok).is_ok());

        let incomplete = CapabilityOutput::ok(json!({ "other": 1 }));
        assert_eq!(
            validate_output(&schema(), &incomplete).unwrap_err(),
            vec!["missing success field 'deleted'"]
        );

        assert!(validate_output(&schema(), &CapabilityOutput::fail("nope")).is_ok());

        let structured_failure = CapabilityOutput {
            success: false,
            data: Some(json!({ "reason": "locked" })),
            ..Default::default()
        };
        assert!(validate_output(&schema(), &structured_failure).is_ok());

        let silent_failure = CapabilityOutput::default();
        assert!(validate_output(&schema(), &silent_failure).is_err());
    }
}
