//! Wraps the external `mutmut` mutation-testing tool.
//!
//! Mutation testing is expensive, so it only runs when `should_enable`
//! says the current iteration's coverage trajectory justifies the cost —
//! there is no point mutating code the test suite barely exercises yet, or
//! re-running it on every iteration once it has already run once.

use std::path::Path;
use std::time::Duration;

use regex::Regex;

use crate::error::PipelineError;
use crate::types::{MutantInfo, MutantStatus, MutationReport};

/// Coverage percentage at or above which mutation testing always runs,
/// regardless of how much the iteration improved coverage.
pub const HIGH_COVERAGE_THRESHOLD: f64 = 92.0;

/// When an iteration's coverage gain over the previous one falls below this
/// delta, the suite has plateaued and mutation testing runs to see whether
/// the existing tests are actually asserting anything.
pub const STALL_DELTA_THRESHOLD: f64 = 3.0;

/// Mutation testing never runs before this iteration — there's no point
/// mutating a suite that hasn't had a chance to reach meaningful coverage.
pub const MIN_ITERATION: u32 = 3;

/// Per-file gate: a file is only included in a mutation run once its own
/// line coverage reaches this percentage.
pub const PER_FILE_COVERAGE_GATE: f64 = 95.0;

/// Upper bound on mutants inspected per run, keeping wall-clock bounded
/// regardless of codebase size.
pub const MAX_MUTANTS: usize = 20;

const MUTMUT_TIMEOUT: Duration = Duration::from_secs(180);

/// Whether mutation testing should run this iteration, per spec's gating
/// rule: never before iteration 3; always once coverage has plateaued
/// (gained less than `STALL_DELTA_THRESHOLD` over the previous iteration)
/// or once it has crossed `HIGH_COVERAGE_THRESHOLD`; skipped otherwise.
pub fn should_enable(iteration: u32, current_coverage: f64, previous_coverage: f64) -> bool {
    if iteration < MIN_ITERATION {
        return false;
    }
    if current_coverage - previous_coverage < STALL_DELTA_THRESHOLD {
        return true;
    }
    current_coverage >= HIGH_COVERAGE_THRESHOLD
}

/// Filters `files` (path, line-coverage-percent pairs) down to the subset
/// eligible for mutation under the per-file gate.
pub fn eligible_files<'a>(files: &'a [(String, f64)]) -> Vec<&'a str> {
    files
        .iter()
        .filter(|(_, pct)| *pct >= PER_FILE_COVERAGE_GATE)
        .map(|(path, _)| path.as_str())
        .collect()
}

pub struct MutationHarness;

impl MutationHarness {
    /// Runs `mutmut run` then `mutmut results` against `source_dir`,
    /// followed by `mutmut show <id>` for up to `MAX_MUTANTS` mutants to
    /// capture the original/mutated code snippets. Any subprocess failure
    /// degrades to an empty, `skipped` report rather than propagating —
    /// mutation testing is an enrichment signal, not a hard requirement for
    /// the pipeline to make progress. `paths` restricts the run to files
    /// that passed the per-file coverage gate; empty means "whole tree".
    pub async fn run(&self, source_dir: &Path, paths: &[&str]) -> MutationReport {
        match self.run_mutmut(source_dir, paths).await {
            Ok(report) => report,
            Err(e) => MutationReport {
                mutants: Vec::new(),
                skipped: true,
                skip_reason: Some(e.to_string()),
            },
        }
    }

    async fn run_mutmut(&self, source_dir: &Path, paths: &[&str]) -> Result<MutationReport, PipelineError> {
        let mut run_args = vec!["mutmut", "run", "--max-children", "2"];
        for path in paths {
            run_args.push("--paths-to-mutate");
            run_args.push(path);
        }
        run_subprocess(source_dir, &run_args).await.ok();

        let results_output = run_subprocess(source_dir, &["mutmut", "results"]).await?;
        let ids = parse_mutant_ids(&results_output);

        let mut mutants = Vec::new();
        for (mutant_id, status) in ids.into_iter().take(MAX_MUTANTS) {
            let show_output = run_subprocess(source_dir, &["mutmut", "show", &mutant_id])
                .await
                .unwrap_or_default();
            let (file_path, line_number, original_code, mutated_code) = parse_mutant_diff(&show_output);
            mutants.push(MutantInfo {
                mutant_id,
                status,
                file_path,
                line_number,
                original_code,
                mutated_code,
            });
        }

        Ok(MutationReport {
            mutants,
            skipped: false,
            skip_reason: None,
        })
    }
}

async fn run_subprocess(cwd: &Path, argv: &[&str]) -> Result<String, PipelineError> {
    let mut command = tokio::process::Command::new(argv[0]);
    command.args(&argv[1..]).current_dir(cwd);
    let output = tokio::time::timeout(MUTMUT_TIMEOUT, command.output())
        .await
        .map_err(|_| PipelineError::TimeoutExpired(format!("{} timed out", argv.join(" "))))??;
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Parses lines like `1-10: killed` / `11: survived` out of `mutmut
/// results` output.
fn parse_mutant_ids(output: &str) -> Vec<(String, MutantStatus)> {
    let re = Regex::new(r"(?m)^(\d+)(?:-(\d+))?:\s*(killed|survived|timeout|suspicious)$").unwrap();
    let mut out = Vec::new();
    for caps in re.captures_iter(output) {
        let start: u32 = caps[1].parse().unwrap_or(0);
        let end: u32 = caps
            .get(2)
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(start);
        let status = match &caps[3] {
            "killed" => MutantStatus::Killed,
            "survived" => MutantStatus::Survived,
            "timeout" => MutantStatus::Timeout,
            _ => MutantStatus::Suspicious,
        };
        for id in start..=end {
            out.push((id.to_string(), status.clone()));
        }
    }
    out
}

/// Extracts the file path, line number, and before/after snippets from
/// `mutmut show <id>`'s unified-diff-style output.
fn parse_mutant_diff(output: &str) -> (std::path::PathBuf, usize, String, String) {
    let mut file_path = std::path::PathBuf::new();
    let mut line_number = 0usize;
    let mut original = String::new();
    let mut mutated = String::new();

    for line in output.lines() {
        if let Some(rest) = line.strip_prefix("--- ") {
            file_path = std::path::PathBuf::from(rest.trim());
        } else if let Some(rest) = line.strip_prefix("@@") {
            if let Some(num) = rest
                .split(|c: char| !c.is_ascii_digit())
                .find(|s| !s.is_empty())
            {
                line_number = num.parse().unwrap_or(0);
            }
        } else if let Some(rest) = line.strip_prefix('-') {
            if !line.starts_with("---") {
                original.push_str(rest.trim_start());
                original.push('\n');
            }
        } else if let Some(rest) = line.strip_prefix('+') {
            if !line.starts_with("+++") {
                mutated.push_str(rest.trim_start());
                mutated.push('\n');
            }
        }
    }

    (file_path, line_number, original.trim().to_string(), mutated.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_enable_false_before_iteration_three() {
        assert!(!should_enable(1, 95.0, 0.0));
        assert!(!should_enable(2, 95.0, 0.0));
    }

    #[test]
    fn should_enable_true_once_coverage_plateaus() {
        assert!(should_enable(4, 61.0, 60.0));
    }

    #[test]
    fn should_enable_true_above_high_coverage_threshold() {
        assert!(should_enable(3, 93.0, 70.0));
    }

    #[test]
    fn should_enable_false_when_still_improving_and_below_threshold() {
        assert!(!should_enable(4, 70.0, 60.0));
    }

    #[test]
    fn eligible_files_filters_by_per_file_gate() {
        let files = vec![("a.py".to_string(), 96.0), ("b.py".to_string(), 80.0)];
        let eligible = eligible_files(&files);
        assert_eq!(eligible, vec!["a.py"]);
    }

    #[tokio::test]
    async fn empty_report_on_subprocess_failure() {
        let harness = MutationHarness;
        let report = harness.run(Path::new("/nonexistent-path-xyz"), &[]).await;
        assert!(report.skipped);
    }

    #[test]
    fn parse_mutant_ids_expands_ranges() {
        let output = "1-3: killed\n4: survived\n5: timeout\n";
        let ids = parse_mutant_ids(output);
        assert_eq!(ids.len(), 5);
        assert_eq!(ids[0].0, "1");
        assert_eq!(ids[3].0, "4");
    }

    #[test]
    fn parse_mutant_diff_extracts_snippets() {
        let output = "--- src/foo.py\n@@ -10,1 +10,1 @@\n-    return x + 1\n+    return x - 1\n";
        let (path, line, original, mutated) = parse_mutant_diff(output);
        assert_eq!(path, std::path::PathBuf::from("src/foo.py"));
        assert_eq!(line, 10);
        assert_eq!(original, "return x + 1");
        assert_eq!(mutated, "return x - 1");
    }

    #[test]
    fn mutation_report_score_is_percent_killed() {
        let report = MutationReport {
            mutants: vec![
                MutantInfo {
                    mutant_id: "1".into(),
                    status: MutantStatus::Killed,
                    file_path: std::path::PathBuf::new(),
                    line_number: 1,
                    original_code: String::new(),
                    mutated_code: String::new(),
                },
                MutantInfo {
                    mutant_id: "2".into(),
                    status: MutantStatus::Survived,
                    file_path: std::path::PathBuf::new(),
                    line_number: 2,
                    original_code: String::new(),
                    mutated_code: String::new(),
                },
            ],
            skipped: false,
            skip_reason: None,
        };
        assert_eq!(report.score(), 50.0);
        assert_eq!(report.survivors().count(), 1);
    }
}
