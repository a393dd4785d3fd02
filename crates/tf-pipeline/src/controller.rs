//! Drives the identify → approve → implement → run tests → evaluate →
//! (improve) loop to completion, an iteration cap, or a no-progress abort.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncBufReadExt, BufReader};

use crate::agent::evaluation::EvaluationAgent;
use crate::agent::identification::IdentificationAgent;
use crate::agent::implementation::ImplementationAgent;
use crate::approval::{ApprovalAgent, ApprovalIntent};
use crate::config::PipelineConfig;
use crate::dependency::{DependencyResolver, extract_dependencies};
use crate::file_scanner::{chunk, gather_files};
use crate::governance::GovernanceLog;
use crate::llm::LlmClient;
use crate::metrics::PipelineMetrics;
use crate::mutation::{self, MutationHarness};
use crate::prompts::PromptLog;
use crate::safety::SafetyChecker;
use crate::test_runner::TestRunner;
use crate::types::{CoverageReport, EvaluationOutput, ExecutionSummary, FailureReason, RunArtifacts, ScenarioSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    Aborted,
    NoProgress,
}

pub struct RunResult {
    pub status: RunStatus,
    pub iterations_run: u32,
    pub best_coverage: f64,
    pub best_mutation: Option<f64>,
    pub best_test_code: String,
    pub artifacts: RunArtifacts,
}

pub struct PipelineController {
    pub config: PipelineConfig,
    llm: Arc<dyn LlmClient>,
    governance: Arc<GovernanceLog>,
    prompts: Arc<PromptLog>,
    metrics: Arc<PipelineMetrics>,
    safety: SafetyChecker,
}

impl PipelineController {
    pub fn new(config: PipelineConfig, llm: Arc<dyn LlmClient>, metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            config,
            llm: Arc::clone(&llm),
            governance: Arc::new(GovernanceLog::new()),
            prompts: Arc::new(PromptLog::new()),
            metrics,
            safety: SafetyChecker::new(Some(llm)),
        }
    }

    /// Prints the bit-exact stdout progress markers the CLI's consumers
    /// parse. These are plain `println!` lines, never routed through
    /// `tracing` — they are a wire contract, not a log record.
    fn emit(&self, marker: &str) {
        println!("{marker}");
    }

    pub async fn run(&self, codebase_path: &PathBuf, output_dir: &PathBuf, run_tests: bool) -> std::io::Result<RunResult> {
        let started_at = Instant::now();
        self.metrics.record_run_started();

        let run_id = uuid::Uuid::new_v4().to_string();
        let artifacts = RunArtifacts {
            run_id: run_id.clone(),
            test_file: output_dir.join(format!("test_generated_{run_id}.py")),
            coverage_report: output_dir.join("coverage_report.json"),
            mutation_report: Some(output_dir.join("mutation_report.json")),
            evaluation_report: output_dir.join("evaluation_report.json"),
            governance_log: output_dir.join("governance_log.json"),
            prompts_log: output_dir.join(format!("prompts_{run_id}.json")),
            report: output_dir.join(format!("report_{run_id}.md")),
        };
        tokio::fs::create_dir_all(output_dir).await?;

        self.emit("Identifying test scenarios...");
        let files = gather_files(codebase_path)?;
        let chunks = chunk(files);
        let identification = IdentificationAgent::new(Arc::clone(&self.llm), Arc::clone(&self.governance), Arc::clone(&self.prompts));
        let mut scenarios = identification.run(chunks.clone()).await;
        self.emit(&format!("Identified {} scenarios", scenarios.len()));

        if scenarios.is_empty() {
            self.emit("Pipeline Aborted — no scenarios identified");
            self.metrics.record_run_aborted();
            self.finalize(&artifacts, RunStatus::Aborted, started_at, 0).await?;
            return Ok(RunResult {
                status: RunStatus::Aborted,
                iterations_run: 0,
                best_coverage: 0.0,
                best_mutation: None,
                best_test_code: String::new(),
                artifacts,
            });
        }

        self.check_safety(&scenarios).await;
        scenarios = self.approve(scenarios).await;

        let (actual_modules, actual_symbols) = known_symbols(&chunks);
        let implementation = ImplementationAgent::new(Arc::clone(&self.llm), Arc::clone(&self.governance), Arc::clone(&self.prompts));
        let evaluation = EvaluationAgent::new(Arc::clone(&self.llm), Arc::clone(&self.governance), Arc::clone(&self.prompts));
        let mutation_harness = MutationHarness;
        let dependency_resolver = DependencyResolver::new(Arc::clone(&self.llm));
        let test_runner = TestRunner::new(codebase_path.clone());

        let mut best_coverage = 0.0f64;
        let mut best_mutation: Option<f64> = None;
        let mut best_test_code = String::new();
        let mut best_severe_count = usize::MAX;
        let mut best_coverage_report: Option<CoverageReport> = None;
        let mut best_evaluation: Option<EvaluationOutput> = None;
        let mut best_summary: Option<ExecutionSummary> = None;
        let mut previous_coverage = 0.0f64;
        let mut no_progress_rounds = 0u32;
        let mut current_code = String::new();
        let mut iteration = 0u32;
        let mut iteration_times: Vec<(u32, f64)> = Vec::new();
        let mut status = RunStatus::Aborted;

        while iteration < self.config.max_iterations {
            iteration += 1;
            let iteration_start = Instant::now();
            self.emit(&format!("Iteration {iteration}"));
            self.emit("Generating PyTest suite...");

            current_code = if current_code.is_empty() {
                implementation.run(&scenarios, &chunks, &actual_modules, &actual_symbols, iteration).await
            } else {
                let last_eval = last_evaluation_context(&best_test_code, best_coverage);
                let security_notes = best_evaluation
                    .as_ref()
                    .map(|e| e.summary.clone())
                    .unwrap_or_default();
                implementation
                    .improve_tests(&current_code, best_coverage, &last_eval, &security_notes, iteration)
                    .await
            };
            tokio::fs::write(&artifacts.test_file, &current_code).await?;

            let evaluation_output = if run_tests {
                let deps = extract_dependencies(&current_code, &python_stdlib());
                let _ = dependency_resolver.install_with_retry(&deps, codebase_path).await;

                let outcome = test_runner.run_tests(&artifacts.test_file).await;
                let coverage_pct = outcome.coverage.as_ref().map(|c| c.overall_percent).unwrap_or(0.0);
                self.emit(&format!("Tests: {}/{} passed", outcome.summary.passed, outcome.summary.total_tests));
                self.emit(&format!("Coverage: {coverage_pct:.1}% (coverage measured: {coverage_pct:.1}%)"));

                let run_mutation = self.config.mutation_target > 0.0
                    && mutation::should_enable(iteration, coverage_pct, previous_coverage);
                let mutation_report = if run_mutation {
                    Some(mutation_harness.run(codebase_path, &[]).await)
                } else {
                    None
                };
                if mutation_report.as_ref().is_some_and(|m| m.skipped) {
                    self.metrics.record_mutation_skipped();
                }
                previous_coverage = coverage_pct;

                let eval = evaluation
                    .run(&current_code, coverage_pct, mutation_report.as_ref(), outcome.summary.total_tests, iteration)
                    .await;
                self.emit(&format!("Security issues found: {}", eval.issues.len()));
                let severe_count = eval.issues.iter().filter(|i| i.severity.is_severe()).count();
                self.emit(&format!(
                    "Severe security issues: {}",
                    if severe_count == 0 { "None".to_string() } else { severe_count.to_string() }
                ));

                best_summary = Some(outcome.summary);
                if outcome.coverage.is_some() {
                    best_coverage_report = outcome.coverage;
                }
                eval
            } else {
                EvaluationOutput {
                    coverage_percent: 0.0,
                    mutation_score: None,
                    test_count: 0,
                    has_severe: false,
                    issues: Vec::new(),
                    summary: "test execution disabled".to_string(),
                }
            };

            let severe_count = evaluation_output.issues.iter().filter(|i| i.severity.is_severe()).count();
            let improved = evaluation_output.coverage_percent > best_coverage || severe_count < best_severe_count;

            if improved {
                no_progress_rounds = 0;
                best_coverage = best_coverage.max(evaluation_output.coverage_percent);
                best_mutation = evaluation_output.mutation_score.or(best_mutation);
                best_test_code = current_code.clone();
                best_severe_count = severe_count;
            } else {
                no_progress_rounds += 1;
            }
            best_evaluation = Some(evaluation_output.clone());

            let meets_coverage = evaluation_output.coverage_percent >= self.config.coverage_target;
            let meets_security = !evaluation_output.has_severe;
            let meets_mutation = evaluation_output
                .mutation_score
                .map(|m| m >= self.config.mutation_target)
                .unwrap_or(true);

            iteration_times.push((iteration, iteration_start.elapsed().as_secs_f64()));

            if meets_coverage && meets_security && meets_mutation {
                status = RunStatus::Completed;
                break;
            }

            if !meets_security {
                self.governance.log_failure(
                    FailureReason::Security,
                    &format!("{} severe issue(s) remain", evaluation_output.issues.len()),
                    iteration,
                );
            }
            if !meets_coverage {
                self.governance.log_failure(
                    FailureReason::Coverage,
                    &format!("coverage {:.1}% below target {:.1}%", evaluation_output.coverage_percent, self.config.coverage_target),
                    iteration,
                );
            }

            if no_progress_rounds >= self.config.no_progress_limit {
                status = RunStatus::NoProgress;
                self.metrics.record_no_progress_stop();
                break;
            }
        }

        if status == RunStatus::Completed {
            self.emit("Pipeline Complete — All targets met");
            self.metrics.record_run_completed(iteration);
        } else {
            self.emit("Pipeline Aborted");
            self.metrics.record_run_aborted();
        }

        tokio::fs::write(
            &artifacts.coverage_report,
            serde_json::to_string_pretty(&best_coverage_report).unwrap_or_else(|_| "null".to_string()),
        )
        .await?;
        if let Some(eval) = &best_evaluation {
            tokio::fs::write(&artifacts.evaluation_report, serde_json::to_string_pretty(eval).unwrap_or_default()).await?;
        }

        let report_md = render_report(&run_id, status, &artifacts, best_coverage, best_mutation, &best_evaluation, &best_summary, &iteration_times);
        tokio::fs::write(&artifacts.report, &report_md).await?;
        self.emit(&format!("Report saved: {}", artifacts.report.display()));

        self.finalize(&artifacts, status, started_at, iteration).await?;

        Ok(RunResult {
            status,
            iterations_run: iteration,
            best_coverage,
            best_mutation,
            best_test_code,
            artifacts,
        })
    }

    /// Writes the governance and prompts artifacts and emits the run's
    /// closing timing marker. Split out so the empty-scenario early return
    /// can share it without duplicating the final_status mapping.
    async fn finalize(&self, artifacts: &RunArtifacts, status: RunStatus, started_at: Instant, iteration: u32) -> std::io::Result<()> {
        let final_status = match status {
            RunStatus::Completed => "PASS",
            RunStatus::NoProgress => "REVIEW_NEEDED",
            RunStatus::Aborted => "ABORTED",
        };
        tokio::fs::write(&artifacts.governance_log, self.governance.to_json(final_status).unwrap_or_default()).await?;

        let last_model = self
            .prompts
            .entries()
            .last()
            .map(|e| e.model.clone())
            .unwrap_or_else(|| "unknown".to_string());
        tokio::fs::write(&artifacts.prompts_log, self.prompts.to_json(&artifacts.run_id, &last_model).unwrap_or_default()).await?;
        self.emit(&format!("Prompts saved: {}", artifacts.prompts_log.display()));

        let elapsed = started_at.elapsed().as_secs_f64();
        self.emit(&format!("Total time: {elapsed:.1}s ({iteration} iterations)"));
        Ok(())
    }

    async fn check_safety(&self, scenarios: &ScenarioSet) {
        for scenario in scenarios.as_slice() {
            let (safe, detail) = self.safety.check(&scenario.description).await;
            self.governance.log_validation("prompt_safety", safe, &detail);
        }
    }

    /// Runs the operator approval loop (spec's interactive-approval flow).
    /// Auto-approves immediately when `auto_approve` is set. Otherwise reads
    /// lines from stdin, classifying each into approve/remove/refine via
    /// `ApprovalAgent`, looping until approved. EOF on stdin (a
    /// non-interactive environment, e.g. CI) degrades to auto-approval
    /// rather than hanging forever.
    async fn approve(&self, scenarios: ScenarioSet) -> ScenarioSet {
        if self.config.auto_approve {
            self.governance.log_decision("approval", "auto-approved scenario set", 1.0);
            return scenarios;
        }

        let approval_agent = ApprovalAgent::new(Arc::clone(&self.llm), Arc::clone(&self.governance), Arc::clone(&self.prompts));
        let mut current = scenarios;
        let mut stdin = BufReader::new(tokio::io::stdin()).lines();

        loop {
            self.emit(&format!("{} scenarios pending approval", current.len()));
            for (i, s) in current.as_slice().iter().enumerate() {
                self.emit(&format!("  [{i}] {}", s.description));
            }
            self.emit("Approve, remove <indices>, or describe changes:");

            let line = match stdin.next_line().await {
                Ok(Some(line)) => line,
                _ => {
                    self.governance.log_decision("approval", "stdin closed, auto-approving", 0.5);
                    return current;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            match approval_agent.classify(&line, 0).await {
                ApprovalIntent::Approve => return current,
                ApprovalIntent::Remove(indices) => {
                    current = remove_indices(current, &indices);
                }
                ApprovalIntent::Refine(feedback) => {
                    current = approval_agent.refine(&current, &feedback, 0).await;
                }
            }
        }
    }
}

/// Drops the scenarios at `indices` (0-based), preserving the order of the
/// rest.
fn remove_indices(scenarios: ScenarioSet, indices: &[usize]) -> ScenarioSet {
    let drop: HashSet<usize> = indices.iter().copied().collect();
    let mut set = ScenarioSet::new();
    for (i, s) in scenarios.into_vec().into_iter().enumerate() {
        if !drop.contains(&i) {
            set.insert(s);
        }
    }
    set
}

fn known_symbols(chunks: &[crate::file_scanner::Chunk]) -> (HashSet<String>, HashSet<String>) {
    let mut modules = HashSet::new();
    let mut symbols = HashSet::new();
    for chunk in chunks {
        for file in &chunk.files {
            if let Some(stem) = file.path.file_stem() {
                modules.insert(stem.to_string_lossy().to_string());
            }
            for def in crate::code_utils::extract_definitions(&file.content) {
                symbols.insert(def.name);
            }
        }
    }
    (modules, symbols)
}

fn last_evaluation_context(_best_test_code: &str, best_coverage: f64) -> String {
    format!("Coverage is currently {best_coverage:.1}%; focus new tests on untested branches and edge cases.")
}

fn python_stdlib() -> HashSet<String> {
    [
        "os", "sys", "re", "json", "math", "itertools", "functools", "collections", "typing",
        "datetime", "time", "unittest", "abc", "dataclasses", "enum", "pathlib", "io", "logging",
        "asyncio", "subprocess", "shutil", "tempfile", "random", "string", "copy", "threading",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[allow(clippy::too_many_arguments)]
fn render_report(
    run_id: &str,
    status: RunStatus,
    artifacts: &RunArtifacts,
    best_coverage: f64,
    best_mutation: Option<f64>,
    best_evaluation: &Option<EvaluationOutput>,
    best_summary: &Option<ExecutionSummary>,
    iteration_times: &[(u32, f64)],
) -> String {
    let summary_text = best_evaluation
        .as_ref()
        .map(|e| e.summary.clone())
        .unwrap_or_else(|| "No evaluation was completed for this run.".to_string());

    let mutation_text = best_mutation.map(|m| format!("{m:.1}%")).unwrap_or_else(|| "not run".to_string());
    let (passed, total) = best_summary.as_ref().map(|s| (s.passed, s.total_tests)).unwrap_or((0, 0));

    let top_issues = best_evaluation
        .as_ref()
        .map(|e| {
            let mut issues = e.issues.clone();
            issues.sort_by(|a, b| b.severity.cmp(&a.severity));
            issues
                .into_iter()
                .take(5)
                .map(|i| format!("- **{:?}**: {} ({})", i.severity, i.description, i.location.unwrap_or_else(|| "unknown location".into())))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "No security issues reported.".to_string());

    let timing_rows = iteration_times
        .iter()
        .map(|(n, secs)| format!("| {n} | {secs:.1}s |"))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "# Test Generation Report\n\nRun `{run_id}` — status **{status:?}**\n\n{summary_text}\n\n\
         ## Metrics\n\n| Metric | Value |\n|---|---|\n| Coverage | {best_coverage:.1}% |\n\
         | Mutation score | {mutation_text} |\n| Tests | {passed}/{total} passed |\n\
         | Iterations | {iter_count} |\n\n## Top security issues\n\n{top_issues}\n\n\
         ## Iteration timing\n\n| Iteration | Duration |\n|---|---|\n{timing_rows}\n\n\
         Generated test file: `{test_file}`\n",
        iter_count = iteration_times.len(),
        test_file = artifacts.test_file.display(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::StubLlmClient;

    fn config() -> PipelineConfig {
        PipelineConfig {
            max_iterations: 3,
            no_progress_limit: 2,
            coverage_target: 90.0,
            mutation_target: 80.0,
            conventions_path: None,
            auto_approve: true,
        }
    }

    #[tokio::test]
    async fn aborts_when_identification_finds_nothing() {
        let llm = Arc::new(StubLlmClient::constant("not json"));
        let metrics = Arc::new(PipelineMetrics::new());
        let controller = PipelineController::new(config(), llm, metrics);

        let src_dir = tempfile::tempdir().unwrap();
        let out_dir = tempfile::tempdir().unwrap();
        std::fs::write(src_dir.path().join("app.py"), "def f():\n    pass\n").unwrap();

        let result = controller
            .run(&src_dir.path().to_path_buf(), &out_dir.path().to_path_buf(), false)
            .await
            .unwrap();
        assert_eq!(result.status, RunStatus::Aborted);
    }

    #[tokio::test]
    async fn completes_without_running_tests_when_disabled() {
        let scenario_response = r#"{"scenarios": [{"description": "basic", "target_module": "app", "target_symbol": "f", "rationale": "x", "edge_case": false}]}"#;
        let llm = Arc::new(StubLlmClient::new(vec![
            scenario_response.to_string(),
            "safe".to_string(),
            "def test_f():\n    assert True\n".to_string(),
        ]));
        let metrics = Arc::new(PipelineMetrics::new());
        let controller = PipelineController::new(config(), llm, metrics);

        let src_dir = tempfile::tempdir().unwrap();
        let out_dir = tempfile::tempdir().unwrap();
        std::fs::write(src_dir.path().join("app.py"), "def f():\n    pass\n").unwrap();

        let result = controller
            .run(&src_dir.path().to_path_buf(), &out_dir.path().to_path_buf(), false)
            .await
            .unwrap();
        // With tests disabled, coverage stays 0 and the run hits its
        // no-progress guard rather than "completing" — asserting it
        // terminates rather than looping forever is the property under
        // test here.
        assert_ne!(result.status, RunStatus::Completed);
    }

    #[test]
    fn remove_indices_preserves_order_of_the_rest() {
        let mut set = ScenarioSet::new();
        for d in ["a", "b", "c"] {
            set.insert(crate::types::TestScenario {
                description: d.to_string(),
                target_module: "m".into(),
                target_symbol: None,
                rationale: "r".into(),
                edge_case: false,
                priority: crate::types::Priority::Medium,
            });
        }
        let result = remove_indices(set, &[1]);
        let descriptions: Vec<&str> = result.as_slice().iter().map(|s| s.description.as_str()).collect();
        assert_eq!(descriptions, vec!["a", "c"]);
    }
}
