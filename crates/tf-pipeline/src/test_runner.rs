//! Invokes `pytest` against a generated test file and parses its output
//! plus the coverage JSON it produces alongside.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::coverage::analyze_coverage;
use crate::error::PipelineError;
use crate::types::{CoverageReport, ExecutionSummary};

const RUN_TIMEOUT: Duration = Duration::from_secs(120);
const PER_TEST_TIMEOUT_SECS: u32 = 30;

pub struct TestRunner {
    pub source_dir: PathBuf,
    pub test_dirs: Vec<String>,
}

pub struct RunOutcome {
    pub summary: ExecutionSummary,
    pub coverage: Option<CoverageReport>,
}

impl TestRunner {
    pub fn new(source_dir: PathBuf) -> Self {
        Self {
            source_dir,
            test_dirs: vec!["tests".to_string(), "test".to_string()],
        }
    }

    /// Writes a `.coveragerc` excluding test directories from the coverage
    /// measurement, then runs pytest with branch coverage and a JSON
    /// report. A degenerate zero-result outcome is returned (never an
    /// error) on timeout or a pytest invocation we couldn't even start —
    /// the controller treats "ran but found nothing" and "couldn't run" the
    /// same way: no progress this iteration.
    pub async fn run_tests(&self, test_file: &Path) -> RunOutcome {
        if let Err(e) = self.write_coveragerc().await {
            tracing::warn!(error = %e, "failed to write .coveragerc");
        }

        let coverage_json = self.source_dir.join("coverage.json");
        let _ = tokio::fs::remove_file(&coverage_json).await;

        let mut command = tokio::process::Command::new("pytest");
        command
            .arg(test_file)
            .arg("-v")
            .arg("--tb=short")
            .arg(format!("--timeout={PER_TEST_TIMEOUT_SECS}"))
            .arg(format!("--cov={}", self.source_dir.display()))
            .arg("--cov-branch")
            .arg("--cov-report=term-missing")
            .arg("--cov-report=json")
            .current_dir(&self.source_dir);

        let output = match tokio::time::timeout(RUN_TIMEOUT, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return degenerate_outcome(format!("failed to spawn pytest: {e}")),
            Err(_) => return degenerate_outcome("pytest run exceeded the 120s timeout".to_string()),
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let summary = parse_pytest_output(&stdout, output.status.code().unwrap_or(-1));
        let coverage = self.read_coverage_json(&coverage_json).await;

        RunOutcome { summary, coverage }
    }

    async fn write_coveragerc(&self) -> Result<(), PipelineError> {
        let exclude = self
            .test_dirs
            .iter()
            .map(|d| format!("*/{d}/*"))
            .collect::<Vec<_>>()
            .join(",\n    ");
        let content = format!("[run]\nomit =\n    {exclude}\n");
        tokio::fs::write(self.source_dir.join(".coveragerc"), content).await?;
        Ok(())
    }

    async fn read_coverage_json(&self, path: &Path) -> Option<CoverageReport> {
        let content = tokio::fs::read_to_string(path).await.ok()?;
        let parsed: serde_json::Value = serde_json::from_str(&content).ok()?;
        let files = parsed.get("files")?.as_object()?;
        // Aggregate across every source file the coverage run touched —
        // the controller only needs a project-wide percentage and a single
        // combined gap listing.
        let mut executed = Vec::new();
        let mut missing = Vec::new();
        let mut excluded = Vec::new();
        let mut combined_source = String::new();
        for (path_str, file_data) in files {
            if self.test_dirs.iter().any(|d| path_str.contains(d)) {
                continue;
            }
            if let Some(lines) = file_data.get("executed_lines").and_then(|v| v.as_array()) {
                executed.extend(lines.iter().filter_map(|v| v.as_u64()).map(|v| v as usize));
            }
            if let Some(lines) = file_data.get("missing_lines").and_then(|v| v.as_array()) {
                missing.extend(lines.iter().filter_map(|v| v.as_u64()).map(|v| v as usize));
            }
            if let Some(lines) = file_data.get("excluded_lines").and_then(|v| v.as_array()) {
                excluded.extend(lines.iter().filter_map(|v| v.as_u64()).map(|v| v as usize));
            }
            if let Ok(source) = std::fs::read_to_string(path_str) {
                combined_source.push_str(&source);
                combined_source.push('\n');
            }
        }
        Some(analyze_coverage(&combined_source, &executed, &missing, &excluded))
    }
}

fn degenerate_outcome(reason: String) -> RunOutcome {
    tracing::warn!(reason, "test run produced no usable result");
    RunOutcome {
        summary: ExecutionSummary::new(0, 0, 0, 0, -1, reason),
        coverage: None,
    }
}

/// Parses pytest's summary line, e.g. `3 passed, 1 failed, 2 errors in
/// 1.23s`. Counts failures and errors together in the `failed` total, as
/// the original shell wrapper does — an error is still a red run.
pub fn parse_pytest_output(output: &str, exit_code: i32) -> ExecutionSummary {
    let passed = extract_count(output, "passed");
    let failed = extract_count(output, "failed");
    let errors = extract_count(output, "error");
    let total = passed + failed + errors;
    let tail: String = output.lines().rev().take(40).collect::<Vec<_>>().into_iter().rev().collect::<Vec<_>>().join("\n");
    ExecutionSummary::new(total, passed, failed, errors, exit_code, tail)
}

fn extract_count(output: &str, label: &str) -> u32 {
    let re = regex::Regex::new(&format!(r"(\d+)\s+{label}")).unwrap();
    re.captures(output)
        .and_then(|c| c[1].parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_pytest_output_reads_summary_counts() {
        let output = "===== 3 passed, 1 failed, 2 errors in 1.23s =====";
        let summary = parse_pytest_output(output, 1);
        assert_eq!(summary.passed, 3);
        assert_eq!(summary.failed, 3);
        assert_eq!(summary.errors, 2);
    }

    #[test]
    fn parse_pytest_output_all_passed() {
        let output = "===== 5 passed in 0.50s =====";
        let summary = parse_pytest_output(output, 0);
        assert!(summary.all_passed());
    }

    #[test]
    fn parse_pytest_output_missing_counts_default_to_zero() {
        let output = "no test run happened";
        let summary = parse_pytest_output(output, 1);
        assert_eq!(summary.total_tests, 0);
    }
}
