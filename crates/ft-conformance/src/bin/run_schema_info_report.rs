#![forbid(unsafe_code)]

use std::path::PathBuf;

use ft_conformance::{HarnessConfig, emit_schema_info_report, mode_label};
use ft_runtime::ExecutionMode;
use serde_json::json;

fn main() -> Result<(), String> {
    let mut mode = String::from("both");
    let mut output: Option<PathBuf> = None;
    let mut fixtures: Option<PathBuf> = None;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--mode" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--mode requires one of: strict|hardened|both".to_string())?;
                mode = value;
            }
            "--output" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--output requires a file path".to_string())?;
                output = Some(PathBuf::from(value));
            }
            "--fixtures" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--fixtures requires a directory path".to_string())?;
                fixtures = Some(PathBuf::from(value));
            }
            other => {
                return Err(format!(
                    "unknown arg '{other}'. usage: run_schema_info_report [--mode strict|hardened|both] [--fixtures dir] [--output path]"
                ));
            }
        }
    }

    let modes = parse_modes(mode.as_str())?;
    let mut config = HarnessConfig::default_paths();
    if let Some(fixture_root) = fixtures {
        config = config.with_fixture_root(fixture_root);
    }
    let output_path = output.unwrap_or_else(|| config.report_path.clone());

    let report = emit_schema_info_report(&config, modes.as_slice(), output_path.as_path())?;
    let mode_labels: Vec<&str> = modes.iter().map(|m| mode_label(*m)).collect();

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "status": if report.cases_passed == report.cases_total { "ok" } else { "failed" },
            "output_path": output_path.display().to_string(),
            "cases_total": report.cases_total,
            "cases_passed": report.cases_passed,
            "modes": mode_labels,
        }))
        .map_err(|error| format!("failed to serialize summary: {error}"))?
    );

    if report.cases_passed != report.cases_total {
        return Err(format!(
            "schema info conformance failed: {}/{} cases passed",
            report.cases_passed, report.cases_total
        ));
    }
    Ok(())
}

fn parse_modes(raw: &str) -> Result<Vec<ExecutionMode>, String> {
    match raw {
        "strict" => Ok(vec![ExecutionMode::Strict]),
        "hardened" => Ok(vec![ExecutionMode::Hardened]),
        "both" => Ok(vec![ExecutionMode::Strict, ExecutionMode::Hardened]),
        _ => Err(format!(
            "unsupported mode '{raw}'; expected strict|hardened|both"
        )),
    }
}
