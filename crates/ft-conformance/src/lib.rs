#![forbid(unsafe_code)]

mod logging;

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use ft_runtime::{ExecutionMode, InplaceError, RuntimeContext, StorageId};
use ft_schema::{SchemaError, decode_schema_json};
use ft_schema_info::{SchemaArgument, SchemaInfo, SchemaInfoError};
pub use logging::{StructuredCaseLog, mode_label};
use serde::Deserialize;
use serde_json::{Value, json};

const DEFAULT_MAX_FIXTURE_BYTES: u64 = 1_048_576;
const SCHEMA_INFO_FIXTURE: &str = "schema_info_cases.json";
const SCHEMA_INFO_PACKET: &str = "FT-SI-001";

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub fixture_root: PathBuf,
    pub report_path: PathBuf,
    pub max_fixture_bytes: u64,
    pub strict_mode: bool,
}

impl HarnessConfig {
    #[must_use]
    pub fn default_paths() -> Self {
        let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        Self {
            fixture_root: manifest_dir.join("fixtures"),
            report_path: manifest_dir.join("../../artifacts/schema_info/forensics.jsonl"),
            max_fixture_bytes: DEFAULT_MAX_FIXTURE_BYTES,
            strict_mode: true,
        }
    }

    #[must_use]
    pub fn with_fixture_root(mut self, fixture_root: impl Into<PathBuf>) -> Self {
        self.fixture_root = fixture_root.into();
        self
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::default_paths()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchemaInfoCaseReport {
    pub name: String,
    pub mode: ExecutionMode,
    pub schema_ok: bool,
    pub mutation_ok: bool,
    pub name_lookup_ok: bool,
    pub aliasing_ok: bool,
    pub inplace_ok: bool,
    pub forensic_log: StructuredCaseLog,
}

impl SchemaInfoCaseReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.schema_ok
            && self.mutation_ok
            && self.name_lookup_ok
            && self.aliasing_ok
            && self.inplace_ok
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessReport {
    pub suite: &'static str,
    pub fixture_count: usize,
    pub strict_mode: bool,
    pub cases_total: usize,
    pub cases_passed: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct SchemaInfoFixtureFile {
    cases: Vec<SchemaInfoCase>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct SchemaInfoCase {
    name: String,
    schema: Value,
    expect_schema_error: Option<String>,
    #[serde(default)]
    mutation_by_index: Vec<IndexQuery>,
    #[serde(default)]
    mutation_by_name: Vec<NameQuery>,
    #[serde(default)]
    aliasing: Vec<AliasQuery>,
    inplace: Option<InplaceQuery>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct IndexQuery {
    index: usize,
    expected: Option<bool>,
    expected_error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct NameQuery {
    name: String,
    expected: Option<bool>,
    expected_error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct AliasQuery {
    lhs: SchemaArgument,
    rhs: SchemaArgument,
    expected: Option<bool>,
    expected_error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct InplaceQuery {
    storages: Vec<Option<u64>>,
    expect_strict_ok: bool,
    expect_hardened_copy: bool,
}

#[must_use]
pub fn run_smoke(config: &HarnessConfig) -> HarnessReport {
    let fixture_count = fs::read_dir(&config.fixture_root)
        .ok()
        .into_iter()
        .flat_map(|it| it.filter_map(Result::ok))
        .count();

    let mode = if config.strict_mode {
        ExecutionMode::Strict
    } else {
        ExecutionMode::Hardened
    };

    let (cases_total, cases_passed) = run_schema_info_conformance(config, mode)
        .map_or((0, 0), |(_, cases)| {
            summarize_passes(cases.iter().map(SchemaInfoCaseReport::passed))
        });

    HarnessReport {
        suite: "smoke",
        fixture_count,
        strict_mode: config.strict_mode,
        cases_total,
        cases_passed,
    }
}

pub fn run_schema_info_conformance(
    config: &HarnessConfig,
    mode: ExecutionMode,
) -> Result<(HarnessReport, Vec<SchemaInfoCaseReport>), String> {
    let fixture_path = config.fixture_root.join(SCHEMA_INFO_FIXTURE);
    let fixture: SchemaInfoFixtureFile = load_fixture(&fixture_path, config.max_fixture_bytes)?;

    let mut case_reports = Vec::with_capacity(fixture.cases.len());
    for case in &fixture.cases {
        case_reports.push(run_schema_info_case(case, mode)?);
    }

    let (cases_total, cases_passed) =
        summarize_passes(case_reports.iter().map(SchemaInfoCaseReport::passed));

    Ok((
        HarnessReport {
            suite: "schema_info",
            fixture_count: 1,
            strict_mode: mode == ExecutionMode::Strict,
            cases_total,
            cases_passed,
        },
        case_reports,
    ))
}

/// Runs the suite in every requested mode and writes one JSONL line per case.
pub fn emit_schema_info_report(
    config: &HarnessConfig,
    modes: &[ExecutionMode],
    output_path: &Path,
) -> Result<HarnessReport, String> {
    let mut lines = Vec::new();
    let mut cases_total = 0usize;
    let mut cases_passed = 0usize;
    for &mode in modes {
        let (report, cases) = run_schema_info_conformance(config, mode)?;
        cases_total += report.cases_total;
        cases_passed += report.cases_passed;
        for case in &cases {
            lines.push(case.forensic_log.to_json_line()?);
        }
    }

    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent)
            .map_err(|error| format!("failed creating {}: {error}", parent.display()))?;
    }
    let mut file = fs::File::create(output_path)
        .map_err(|error| format!("failed creating {}: {error}", output_path.display()))?;
    for line in &lines {
        writeln!(file, "{line}")
            .map_err(|error| format!("failed writing {}: {error}", output_path.display()))?;
    }

    Ok(HarnessReport {
        suite: "schema_info",
        fixture_count: 1,
        strict_mode: modes.contains(&ExecutionMode::Strict),
        cases_total,
        cases_passed,
    })
}

fn run_schema_info_case(
    case: &SchemaInfoCase,
    mode: ExecutionMode,
) -> Result<SchemaInfoCaseReport, String> {
    let mut runtime = RuntimeContext::new(mode);
    let loaded = decode_schema_json(case.schema.to_string().as_str())
        .map_err(SchemaInfoError::from)
        .and_then(SchemaInfo::new);

    let observed_schema_error = loaded.as_ref().err().map(error_label);
    let schema_ok = observed_schema_error.as_deref() == case.expect_schema_error.as_deref();

    let (mutation_ok, name_lookup_ok, aliasing_ok, inplace_ok) = match &loaded {
        Ok(info) => (
            case.mutation_by_index.iter().all(|query| {
                outcome_matches(
                    &info.is_mutating(query.index),
                    query.expected,
                    query.expected_error.as_deref(),
                )
            }),
            case.mutation_by_name.iter().all(|query| {
                outcome_matches(
                    &info.is_mutating_by_name(query.name.as_str()),
                    query.expected,
                    query.expected_error.as_deref(),
                )
            }),
            case.aliasing.iter().all(|query| {
                let forward = info.are_aliasing(query.lhs, query.rhs);
                let backward = info.are_aliasing(query.rhs, query.lhs);
                forward == backward
                    && outcome_matches(&forward, query.expected, query.expected_error.as_deref())
            }),
            case.inplace
                .as_ref()
                .is_none_or(|query| inplace_matches(&mut runtime, info, query, mode)),
        ),
        Err(error) => {
            runtime.record_schema_load_failure(case.name.as_str(), error);
            (true, true, true, true)
        }
    };

    let passed = schema_ok && mutation_ok && name_lookup_ok && aliasing_ok && inplace_ok;
    let reason_code = if passed {
        if case.expect_schema_error.is_some() {
            "schema_info_invalid_schema_fail_closed_ok"
        } else {
            "schema_info_parity_ok"
        }
    } else if !schema_ok {
        "schema_info_schema_expectation_mismatch"
    } else if !mutation_ok {
        "schema_info_mutation_mismatch"
    } else if !name_lookup_ok {
        "schema_info_name_lookup_mismatch"
    } else if !aliasing_ok {
        "schema_info_aliasing_mismatch"
    } else {
        "schema_info_inplace_policy_mismatch"
    };

    let signature = loaded
        .as_ref()
        .map_or_else(|_| "unavailable".to_string(), |info| info.schema().to_string());
    let evidence: Vec<Value> = runtime
        .ledger()
        .entries()
        .iter()
        .map(|entry| json!(format!("{:?}: {}", entry.kind, entry.summary)))
        .collect();

    Ok(SchemaInfoCaseReport {
        name: case.name.clone(),
        mode,
        schema_ok,
        mutation_ok,
        name_lookup_ok,
        aliasing_ok,
        inplace_ok,
        forensic_log: StructuredCaseLog::new(
            "schema_info",
            SCHEMA_INFO_FIXTURE,
            SCHEMA_INFO_PACKET,
            case.name.as_str(),
            mode,
            vec![format!("crates/ft-conformance/fixtures/{SCHEMA_INFO_FIXTURE}")],
            format!(
                "cargo run -p ft-conformance --bin run_schema_info_report -- --mode {}",
                mode_label(mode),
            ),
            if passed { "pass" } else { "fail" },
            reason_code,
        )
        .with_extra_fields(BTreeMap::from([
            ("schema_signature".to_string(), json!(signature)),
            (
                "schema_error_observed".to_string(),
                json!(observed_schema_error.unwrap_or_else(|| "none".to_string())),
            ),
            ("runtime_evidence".to_string(), Value::Array(evidence)),
        ])),
    })
}

fn inplace_matches(
    runtime: &mut RuntimeContext,
    info: &SchemaInfo,
    query: &InplaceQuery,
    mode: ExecutionMode,
) -> bool {
    let storages: Vec<Option<StorageId>> = query
        .storages
        .iter()
        .map(|storage| storage.map(StorageId))
        .collect();
    match (mode, runtime.check_inplace(info, storages.as_slice())) {
        (ExecutionMode::Strict, Ok(_)) => query.expect_strict_ok,
        (ExecutionMode::Strict, Err(InplaceError::UndeclaredOverlap { .. })) => {
            !query.expect_strict_ok
        }
        (ExecutionMode::Hardened, Ok(decision)) => {
            decision.copy_required == query.expect_hardened_copy
        }
        (_, Err(_)) => false,
    }
}

fn outcome_matches(
    observed: &Result<bool, SchemaInfoError>,
    expected: Option<bool>,
    expected_error: Option<&str>,
) -> bool {
    match observed {
        Ok(value) => expected_error.is_none() && expected == Some(*value),
        Err(error) => expected.is_none() && expected_error == Some(error_label(error).as_str()),
    }
}

fn error_label(error: &SchemaInfoError) -> String {
    match error {
        SchemaInfoError::OutOfRange { .. } => "out_of_range".to_string(),
        SchemaInfoError::NotFound { .. } => "not_found".to_string(),
        SchemaInfoError::InvalidSchema(inner) => format!("invalid_schema:{}", schema_error_label(inner)),
    }
}

fn schema_error_label(error: &SchemaError) -> &'static str {
    match error {
        SchemaError::EmptyOperatorName => "empty_operator_name",
        SchemaError::EmptyArgumentName { .. } => "empty_argument_name",
        SchemaError::DuplicateArgumentName { .. } => "duplicate_argument_name",
        SchemaError::DuplicateReturnName { .. } => "duplicate_return_name",
        SchemaError::InvalidAliasSymbol { .. } => "invalid_alias_symbol",
        SchemaError::MixedWildcardSet { .. } => "mixed_wildcard_set",
        SchemaError::WriteWithoutAliasSet { .. } => "write_without_alias_set",
        SchemaError::InvalidJson { .. } => "invalid_json",
        SchemaError::UnknownField { .. } => "unknown_field",
        SchemaError::PayloadTooLarge { .. } => "payload_too_large",
        SchemaError::IncompatiblePayload { .. } => "incompatible_payload",
    }
}

fn load_fixture<T>(path: &Path, max_bytes: u64) -> Result<T, String>
where
    T: for<'de> Deserialize<'de>,
{
    let metadata = fs::metadata(path).map_err(|error| {
        format!(
            "failed reading fixture metadata {}: {error}",
            path.display()
        )
    })?;
    let size = metadata.len();
    if size > max_bytes {
        return Err(format!(
            "fixture {} exceeds max bytes: actual={size} max={max_bytes}",
            path.display()
        ));
    }

    let raw = fs::read_to_string(path)
        .map_err(|error| format!("failed reading fixture {}: {error}", path.display()))?;
    serde_json::from_str::<T>(&raw)
        .map_err(|error| format!("failed parsing fixture {}: {error}", path.display()))
}

fn summarize_passes<I>(iter: I) -> (usize, usize)
where
    I: Iterator<Item = bool>,
{
    let mut total = 0usize;
    let mut passed = 0usize;
    for is_passed in iter {
        total += 1;
        if is_passed {
            passed += 1;
        }
    }
    (total, passed)
}
