use std::collections::BTreeMap;

use ft_runtime::ExecutionMode;
use serde::Serialize;
use serde_json::Value;

pub const STRUCTURED_LOG_SCHEMA_VERSION: &str = "ft-conformance-log-v1";

/// One JSONL forensic record per conformance case.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StructuredCaseLog {
    pub schema_version: &'static str,
    pub ts_unix_ms: u128,
    pub suite_id: String,
    pub scenario_id: String,
    pub fixture_id: String,
    pub packet_id: String,
    pub case_id: String,
    pub mode: &'static str,
    pub artifact_refs: Vec<String>,
    pub replay_command: String,
    pub outcome: String,
    pub reason_code: String,
    #[serde(flatten)]
    pub extra_fields: BTreeMap<String, Value>,
}

impl StructuredCaseLog {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        suite_id: &str,
        fixture_id: &str,
        packet_id: &str,
        case_id: &str,
        mode: ExecutionMode,
        artifact_refs: Vec<String>,
        replay_command: String,
        outcome: &str,
        reason_code: &str,
    ) -> Self {
        Self {
            schema_version: STRUCTURED_LOG_SCHEMA_VERSION,
            ts_unix_ms: now_unix_ms(),
            suite_id: suite_id.to_string(),
            scenario_id: format!("{suite_id}/{}:{case_id}", mode_label(mode)),
            fixture_id: fixture_id.to_string(),
            packet_id: packet_id.to_string(),
            case_id: case_id.to_string(),
            mode: mode_label(mode),
            artifact_refs,
            replay_command,
            outcome: outcome.to_string(),
            reason_code: reason_code.to_string(),
            extra_fields: BTreeMap::new(),
        }
    }

    /// Attaches case-specific fields. Keys that would shadow envelope fields
    /// under `flatten` are dropped.
    #[must_use]
    pub fn with_extra_fields(mut self, extra_fields: BTreeMap<String, Value>) -> Self {
        for (key, value) in extra_fields {
            if !is_envelope_key(key.as_str()) {
                self.extra_fields.insert(key, value);
            }
        }
        self
    }

    pub fn to_json_line(&self) -> Result<String, String> {
        serde_json::to_string(self).map_err(|error| format!("failed encoding case log: {error}"))
    }
}

#[must_use]
pub fn mode_label(mode: ExecutionMode) -> &'static str {
    match mode {
        ExecutionMode::Strict => "strict",
        ExecutionMode::Hardened => "hardened",
    }
}

fn is_envelope_key(key: &str) -> bool {
    matches!(
        key,
        "schema_version"
            | "ts_unix_ms"
            | "suite_id"
            | "scenario_id"
            | "fixture_id"
            | "packet_id"
            | "case_id"
            | "mode"
            | "artifact_refs"
            | "replay_command"
            | "outcome"
            | "reason_code"
    )
}

fn now_unix_ms() -> u128 {
    let now = std::time::SystemTime::now();
    now.duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis())
}
