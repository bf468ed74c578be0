//! JSON Schema validation of job submissions and job results, guarding the
//! wire contract at the points where it crosses process boundaries (the
//! intake gateway, the CLI, the callback sender).

use jsonschema::Validator;
use once_cell::sync::Lazy;
use serde_json::Value;

use crate::error::{CoreError, Result};

const JOB_SCHEMA_STR: &str = include_str!("../schemas/job.schema.json");
const RESULT_SCHEMA_STR: &str = include_str!("../schemas/result.schema.json");

static JOB_SCHEMA: Lazy<Validator> = Lazy::new(|| compile(JOB_SCHEMA_STR, "job.schema.json"));
static RESULT_SCHEMA: Lazy<Validator> =
    Lazy::new(|| compile(RESULT_SCHEMA_STR, "result.schema.json"));
static STEP_RESULT_SCHEMA: Lazy<Validator> = Lazy::new(|| {
    let mut document: Value = serde_json::from_str(RESULT_SCHEMA_STR).expect("result.schema.json is valid json");
    let definitions = document["definitions"].clone();
    document["$ref"] = Value::String("#/definitions/step_result".to_string());
    document["definitions"] = definitions;
    jsonschema::validator_for(&document).expect("step_result sub-schema compiles")
});

fn compile(raw: &str, name: &'static str) -> Validator {
    let document: Value =
        serde_json::from_str(raw).unwrap_or_else(|err| panic!("{name} is not valid json: {err}"));
    jsonschema::validator_for(&document)
        .unwrap_or_else(|err| panic!("{name} is not a valid json schema: {err}"))
}

/// Validate a job submission document against the bundled job schema.
pub fn validate_job(value: &Value) -> Result<()> {
    validate(&JOB_SCHEMA, value, "job")
}

/// Validate a job result document against the bundled result schema.
pub fn validate_job_result(value: &Value) -> Result<()> {
    validate(&RESULT_SCHEMA, value, "result")
}

/// Validate a single step result against the `step_result` definition nested
/// inside the result schema (the runner validates each step result before
/// persisting it, independently of the final job-level result).
pub fn validate_step_result(value: &Value) -> Result<()> {
    validate(&STEP_RESULT_SCHEMA, value, "step_result")
}

fn validate(validator: &Validator, value: &Value, kind: &'static str) -> Result<()> {
    let messages: Vec<String> = validator
        .iter_errors(value)
        .map(|e| format!("{e} (at {})", e.instance_path))
        .collect();
    if messages.is_empty() {
        Ok(())
    } else {
        Err(CoreError::SchemaValidation { kind, messages })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_minimal_valid_job() {
        let job = json!({
            "job_id": "0198abc-def0",
            "goal": "fix the flaky test",
            "workdir": "/repo",
            "steps": [
                { "step_id": "s1", "agent": "claude", "prompt": "do it" }
            ]
        });
        assert!(validate_job(&job).is_ok());
    }

    #[test]
    fn rejects_job_missing_steps() {
        let job = json!({
            "job_id": "0198abc-def0",
            "goal": "fix the flaky test",
            "workdir": "/repo",
            "steps": []
        });
        assert!(validate_job(&job).is_err());
    }

    #[test]
    fn rejects_job_with_overlong_goal() {
        let job = json!({
            "job_id": "0198abc-def0",
            "goal": "x".repeat(5001),
            "workdir": "/repo",
            "steps": [{ "step_id": "s1", "agent": "claude", "prompt": "do it" }]
        });
        assert!(validate_job(&job).is_err());
    }

    #[test]
    fn accepts_minimal_valid_result() {
        let result = json!({
            "job_id": "0198abc-def0",
            "status": "success",
            "steps": [],
            "secrets_check": "passed",
            "started_at": "2026-01-01T00:00:00Z",
            "finished_at": "2026-01-01T00:01:00Z"
        });
        assert!(validate_job_result(&result).is_ok());
    }

    #[test]
    fn rejects_result_with_bad_status() {
        let result = json!({
            "job_id": "0198abc-def0",
            "status": "not_a_real_status",
            "steps": [],
            "secrets_check": "passed",
            "started_at": "2026-01-01T00:00:00Z",
            "finished_at": "2026-01-01T00:01:00Z"
        });
        assert!(validate_job_result(&result).is_err());
    }
}
