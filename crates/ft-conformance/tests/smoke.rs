use std::path::Path;

use ft_conformance::{
    HarnessConfig, emit_schema_info_report, run_schema_info_conformance, run_smoke,
};
use ft_runtime::{EvidenceKind, ExecutionMode, RuntimeContext, StorageId};
use ft_schema::decode_schema_json;
use ft_schema_info::{SchemaArgument, SchemaInfo};

#[test]
fn smoke_report_is_stable() {
    let cfg = HarnessConfig::default_paths();
    let report = run_smoke(&cfg);
    assert_eq!(report.suite, "smoke");
    assert!(report.fixture_count >= 1);
    assert!(report.cases_total > 0);
    assert_eq!(report.cases_total, report.cases_passed);

    let fixture_path = cfg.fixture_root.join("schema_info_cases.json");
    assert!(Path::new(&fixture_path).exists());
}

#[test]
fn schema_info_fixture_executes_in_both_modes() {
    let cfg = HarnessConfig::default_paths();
    let (strict_report, strict_cases) = run_schema_info_conformance(&cfg, ExecutionMode::Strict)
        .expect("strict schema info should run");
    let (hardened_report, _) = run_schema_info_conformance(&cfg, ExecutionMode::Hardened)
        .expect("hardened schema info should run");

    for case in &strict_cases {
        assert!(
            case.passed(),
            "case {} failed: {:?}",
            case.name,
            case.forensic_log.reason_code
        );
    }
    assert_eq!(strict_report.cases_total, strict_report.cases_passed);
    assert_eq!(hardened_report.cases_total, hardened_report.cases_passed);
}

#[test]
fn invalid_schema_cases_are_logged_as_fail_closed() {
    let cfg = HarnessConfig::default_paths();
    let (_, cases) = run_schema_info_conformance(&cfg, ExecutionMode::Strict)
        .expect("strict schema info should run");
    let rejected = cases
        .iter()
        .find(|case| case.name == "duplicate_input_names_fail_construction")
        .expect("duplicate-name case should be present");
    assert_eq!(
        rejected.forensic_log.reason_code,
        "schema_info_invalid_schema_fail_closed_ok"
    );
    assert_eq!(
        rejected.forensic_log.extra_fields["schema_error_observed"],
        "invalid_schema:duplicate_argument_name"
    );
}

#[test]
fn report_binary_path_writes_one_line_per_case_and_mode() {
    let cfg = HarnessConfig::default_paths();
    let output = std::env::temp_dir().join(format!(
        "ft_schema_info_report_{}.jsonl",
        std::process::id()
    ));
    let report = emit_schema_info_report(
        &cfg,
        &[ExecutionMode::Strict, ExecutionMode::Hardened],
        output.as_path(),
    )
    .expect("report should be emitted");
    let raw = std::fs::read_to_string(&output).expect("report should be readable");
    assert_eq!(raw.lines().count(), report.cases_total);
    for line in raw.lines() {
        let value: serde_json::Value = serde_json::from_str(line).expect("each line is json");
        assert_eq!(value["suite_id"], "schema_info");
        assert_eq!(value["outcome"], "pass");
    }
    let _ = std::fs::remove_file(output);
}

#[test]
fn missing_fixture_root_fails_with_context() {
    let cfg = HarnessConfig::default_paths().with_fixture_root("/nonexistent/ft-schema-info");
    let err = run_schema_info_conformance(&cfg, ExecutionMode::Strict)
        .expect_err("missing fixtures must fail");
    assert!(err.contains("failed reading fixture metadata"));
    assert_eq!(run_smoke(&cfg).cases_total, 0);
}

#[test]
fn decoded_schema_drives_inplace_policy_end_to_end() {
    let payload = r#"{
        "name": "aten::mul_",
        "overload_name": "Tensor",
        "arguments": [
            {"name": "self", "ty": "tensor", "alias_info": {"sets": ["a"], "is_write": true}},
            {"name": "other", "ty": "tensor"}
        ],
        "returns": [{"ty": "tensor", "alias_info": {"sets": ["a"], "is_write": true}}]
    }"#;
    let schema = decode_schema_json(payload).expect("schema should decode");
    let info = SchemaInfo::new(schema).expect("schema should load");
    assert_eq!(
        info.schema().to_string(),
        "aten::mul_.Tensor(Tensor(a!) self, Tensor other) -> Tensor(a!)"
    );
    assert!(
        info.are_aliasing(SchemaArgument::input(0), SchemaArgument::output(0))
            .expect("locators are in range")
    );

    let mut ctx = RuntimeContext::new(ExecutionMode::Hardened);
    let decision = ctx
        .check_inplace(&info, &[Some(StorageId(11)), Some(StorageId(11))])
        .expect("hardened check should succeed");
    assert!(decision.copy_required);
    assert!(
        ctx.ledger()
            .entries()
            .iter()
            .any(|entry| entry.kind == EvidenceKind::Alias)
    );
}
