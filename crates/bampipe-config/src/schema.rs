use serde_json::Value;

use crate::error::{ConfigError, Result};

/// JSON Schema (2020-12) every pipe table must satisfy.
pub const PIPE_TABLE_SCHEMA: &str = include_str!("../schemas/pipe-table.schema.json");

/// Validate a parsed document against [`PIPE_TABLE_SCHEMA`].
///
/// The first violation and up to three more are joined into one message.
pub fn validate_document(value: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(PIPE_TABLE_SCHEMA)?;
    let validator = jsonschema::validator_for(&schema)
        .map_err(|err| ConfigError::SchemaCompile(err.to_string()))?;

    let mut errors = validator.iter_errors(value);
    if let Some(first) = errors.next() {
        let mut message = first.to_string();
        for err in errors.take(3) {
            message.push_str("; ");
            message.push_str(&err.to_string());
        }
        return Err(ConfigError::Invalid { message });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn embedded_schema_compiles() {
        let schema: Value = serde_json::from_str(PIPE_TABLE_SCHEMA).unwrap();
        assert!(jsonschema::validator_for(&schema).is_ok());
    }

    #[test]
    fn missing_required_pipe_field_is_reported() {
        let doc = json!({
            "num_pipes": 4,
            "pipes": [{
                "label": "hsusb-a2-out-0",
                "mem_type": "system",
                "bam": "hsusb",
                "peer": "a2",
                "dir": "local_to_peer",
                "data_fifo_size": 1024,
                "desc_fifo_size": 256
            }]
        });
        let err = validate_document(&doc).unwrap_err();
        match err {
            ConfigError::Invalid { message } => assert!(message.contains("pipe_num")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn empty_pipe_list_is_rejected() {
        let doc = json!({ "num_pipes": 4, "pipes": [] });
        assert!(matches!(
            validate_document(&doc),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn unknown_memory_type_is_rejected() {
        let doc = json!({
            "num_pipes": 4,
            "pipes": [{
                "label": "x", "mem_type": "flash", "bam": "hsusb", "peer": "a2",
                "dir": "local_to_peer", "pipe_num": 0,
                "data_fifo_size": 1024, "desc_fifo_size": 256
            }]
        });
        assert!(validate_document(&doc).is_err());
    }
}
