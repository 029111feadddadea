use anyhow::{anyhow, Result};
use include_dir::{include_dir, Dir};
use jsonschema::{Draft, JSONSchema};
use serde_json::Value;
use std::sync::OnceLock;

pub const SESSION_MANIFEST_SCHEMA: &str = "session_manifest_v1.json";

static SCHEMAS_DIR: Dir = include_dir!("$CARGO_MANIFEST_DIR/schemas");

pub fn schema_names() -> Vec<String> {
    SCHEMAS_DIR
        .files()
        .filter_map(|f| {
            f.path()
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
        })
        .collect()
}

pub fn load_schema(name: &str) -> Result<Value> {
    let file = SCHEMAS_DIR
        .get_file(name)
        .ok_or_else(|| anyhow!("schema not found: {}", name))?;
    let data = std::str::from_utf8(file.contents())?;
    Ok(serde_json::from_str(data)?)
}

pub fn compile_schema(name: &str) -> Result<JSONSchema> {
    let schema = load_schema(name)?;
    let schema = Box::leak(Box::new(schema));
    let compiled = JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(schema)
        .map_err(|e| anyhow!("schema {} does not compile: {}", name, e))?;
    Ok(compiled)
}

static SESSION_MANIFEST_COMPILED: OnceLock<std::result::Result<JSONSchema, String>> =
    OnceLock::new();

/// Session manifest schema, compiled on first use and shared afterwards.
pub fn session_manifest_schema() -> Result<&'static JSONSchema> {
    SESSION_MANIFEST_COMPILED
        .get_or_init(|| compile_schema(SESSION_MANIFEST_SCHEMA).map_err(|e| format!("{:#}", e)))
        .as_ref()
        .map_err(|e| anyhow!("{}", e))
}

/// Check a manifest document (already parsed into a JSON value) against the
/// session manifest schema, collecting every violation into one error.
pub fn validate_session_manifest(manifest: &Value) -> Result<()> {
    let schema = session_manifest_schema()?;
    if let Err(errors) = schema.validate(manifest) {
        let msgs: Vec<String> = errors
            .map(|e| format!("{} at {}", e, e.instance_path))
            .collect();
        return Err(anyhow!(
            "session manifest failed schema validation: {}",
            msgs.join("; ")
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn manifest_schema_is_embedded() {
        assert!(schema_names().contains(&SESSION_MANIFEST_SCHEMA.to_string()));
        compile_schema(SESSION_MANIFEST_SCHEMA).expect("schema compiles");
    }

    #[test]
    fn manifest_schema_compiles_once() {
        let first = session_manifest_schema().expect("schema");
        validate_session_manifest(&json!({"board_type": "TB3", "board_id": "1", "results": []}))
            .expect("valid");
        let second = session_manifest_schema().expect("schema");
        assert!(std::ptr::eq(first, second));
    }

    #[test]
    fn accepts_minimal_and_populated_manifests() {
        validate_session_manifest(&json!({
            "board_type": "TB3",
            "board_id": "0001",
            "results": []
        }))
        .expect("empty session");

        validate_session_manifest(&json!({
            "board_type": "TB3",
            "board_id": "0001",
            "results": [{
                "name": "dummy_procedure",
                "start_time": "2026-01-01T00:00:00Z",
                "end_time": "2026-01-01T00:00:01Z",
                "input": {"target": 70},
                "status_code": [0, ""],
                "data_files": [{
                    "path": "run/a.json",
                    "desc": "Initial readout",
                    "timestamp": "2026-01-01T00:00:00Z",
                    "shift": 0
                }],
                "board_summary": {"status": 0, "desc": "SUCCESS", "channel": -999},
                "channel_summary": []
            }]
        }))
        .expect("populated session");
    }

    #[test]
    fn rejects_malformed_status_code() {
        let err = validate_session_manifest(&json!({
            "board_type": "TB3",
            "board_id": "0001",
            "results": [{
                "name": "p",
                "start_time": "t",
                "end_time": "t",
                "input": {},
                "status_code": ["zero", 0]
            }]
        }))
        .expect_err("status code must be [int, str]");
        assert!(err.to_string().contains("schema validation"), "{}", err);
    }

    #[test]
    fn rejects_missing_board_identity() {
        assert!(validate_session_manifest(&json!({"results": []})).is_err());
    }
}
