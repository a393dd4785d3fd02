//! Data model shared by every pipeline component.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

impl Priority {
    /// Higher first, for ordering a scenario list before it's handed to the
    /// implementation agent.
    pub fn rank(self) -> u8 {
        match self {
            Priority::High => 0,
            Priority::Medium => 1,
            Priority::Low => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestScenario {
    pub description: String,
    pub target_module: String,
    pub target_symbol: Option<String>,
    pub rationale: String,
    #[serde(default)]
    pub edge_case: bool,
    /// Defaults to `Medium` when the LLM omits it.
    #[serde(default)]
    pub priority: Priority,
}

/// De-duplicated collection of scenarios, keyed by a normalized description
/// (lowercased, trimmed) so near-identical scenarios from different chunks
/// collapse into one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScenarioSet {
    scenarios: Vec<TestScenario>,
}

impl ScenarioSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, scenario: TestScenario) -> bool {
        let key = scenario.description.trim().to_lowercase();
        if self
            .scenarios
            .iter()
            .any(|s| s.description.trim().to_lowercase() == key)
        {
            return false;
        }
        self.scenarios.push(scenario);
        true
    }

    pub fn extend(&mut self, scenarios: impl IntoIterator<Item = TestScenario>) {
        for s in scenarios {
            self.insert(s);
        }
    }

    pub fn as_slice(&self) -> &[TestScenario] {
        &self.scenarios
    }

    pub fn len(&self) -> usize {
        self.scenarios.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenarios.is_empty()
    }

    pub fn into_vec(self) -> Vec<TestScenario> {
        self.scenarios
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn is_severe(self) -> bool {
        matches!(self, Severity::Critical | Severity::High)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityIssue {
    pub severity: Severity,
    pub description: String,
    pub location: Option<String>,
    pub recommendation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub total_tests: u32,
    pub passed: u32,
    pub failed: u32,
    pub errors: u32,
    pub exit_code: i32,
    pub stdout_tail: String,
}

impl ExecutionSummary {
    /// `failed` counts failures and errors combined, per the original
    /// pytest-output parser which folds `error` lines into the failure
    /// count rather than tracking them separately in the headline number.
    pub fn new(total_tests: u32, passed: u32, failed: u32, errors: u32, exit_code: i32, stdout_tail: String) -> Self {
        Self {
            total_tests,
            passed,
            failed: failed + errors,
            errors,
            exit_code,
            stdout_tail,
        }
    }

    pub fn all_passed(&self) -> bool {
        self.failed == 0 && self.total_tests > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionKind {
    Function,
    AsyncFunction,
    Class,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCoverage {
    pub name: String,
    pub kind: FunctionKind,
    pub start_line: usize,
    pub end_line: usize,
    /// Executable lines within `[start_line, end_line]` that the test run
    /// either executed or reported missing.
    pub total: usize,
    pub covered: usize,
    pub uncovered: Vec<usize>,
    /// `covered / total * 100`, or `0.0` when `total == 0`.
    pub pct: f64,
}

impl FunctionCoverage {
    pub fn is_covered(&self) -> bool {
        self.covered > 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoverageReport {
    pub overall_percent: f64,
    pub executed_lines: Vec<usize>,
    pub missing_lines: Vec<usize>,
    pub excluded_lines: Vec<usize>,
    pub functions: Vec<FunctionCoverage>,
    pub uncovered_areas_text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchConstruct {
    If,
    Try,
    For,
    While,
    Match,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchArm {
    pub line: usize,
    pub construct: BranchConstruct,
    pub label: String,
    pub covered: bool,
}

/// One `if`/`try`/`for`/`while`/`match` construct and all of its arms.
/// `fully_covered` is `true` iff every arm in `arms` is covered — it exists
/// as a stored field rather than a derived method so a construct's pass/fail
/// classification can be read directly off a serialized report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstructReport {
    pub line: usize,
    pub construct: BranchConstruct,
    pub arms: Vec<BranchArm>,
    pub fully_covered: bool,
}

impl ConstructReport {
    pub fn new(line: usize, construct: BranchConstruct, arms: Vec<BranchArm>) -> Self {
        let fully_covered = arms.iter().all(|a| a.covered);
        Self {
            line,
            construct,
            arms,
            fully_covered,
        }
    }
}

/// A module's branch-coverage report: one `ConstructReport` per `if`/`try`/
/// `for`/`while`/`match` node found, rather than a flat bag of arms — the
/// aggregate percentage is construct-level (`fully_covered_constructs /
/// total_constructs`), matching how the original reports partial vs.
/// uncovered constructs rather than an arm-by-arm ratio.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BranchReport {
    pub constructs: Vec<ConstructReport>,
}

impl BranchReport {
    /// Pushes a construct's arms as a single `ConstructReport`, unconditionally.
    /// The dedup guard for "have I already generated arms for this
    /// `(line, construct)` at all" lives one level up, in the walker's `seen`
    /// set — a single `if`/`try` node legitimately contributes several arms
    /// (if-arm and else-arm both anchor to the node's own line) that must all
    /// land in the same `ConstructReport`.
    pub fn push_construct(&mut self, line: usize, construct: BranchConstruct, arms: Vec<BranchArm>) {
        self.constructs.push(ConstructReport::new(line, construct, arms));
    }

    pub fn coverage_percent(&self) -> f64 {
        if self.constructs.is_empty() {
            return 100.0;
        }
        let fully_covered = self.constructs.iter().filter(|c| c.fully_covered).count();
        100.0 * fully_covered as f64 / self.constructs.len() as f64
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutantStatus {
    Killed,
    Survived,
    Timeout,
    Suspicious,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutantInfo {
    pub mutant_id: String,
    pub status: MutantStatus,
    pub file_path: PathBuf,
    pub line_number: usize,
    pub original_code: String,
    pub mutated_code: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MutationReport {
    pub mutants: Vec<MutantInfo>,
    pub skipped: bool,
    pub skip_reason: Option<String>,
}

impl MutationReport {
    /// `killed / (killed + survived) * 100`, excluding timeouts and
    /// suspicious mutants from the denominator — a mutant the harness
    /// couldn't definitively classify shouldn't dilute the score either
    /// way. Zero when no mutant was definitively killed or survived.
    pub fn score(&self) -> f64 {
        let killed = self
            .mutants
            .iter()
            .filter(|m| m.status == MutantStatus::Killed)
            .count();
        let survived = self
            .mutants
            .iter()
            .filter(|m| m.status == MutantStatus::Survived)
            .count();
        let denom = killed + survived;
        if denom == 0 {
            return 0.0;
        }
        100.0 * killed as f64 / denom as f64
    }

    pub fn survivors(&self) -> impl Iterator<Item = &MutantInfo> {
        self.mutants.iter().filter(|m| m.status == MutantStatus::Survived)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationOutput {
    pub coverage_percent: f64,
    pub mutation_score: Option<f64>,
    pub test_count: u32,
    pub has_severe: bool,
    pub issues: Vec<SecurityIssue>,
    pub summary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptRecord {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub iteration: u32,
    pub agent: String,
    pub model: String,
    pub system_prompt: String,
    pub user_prompt: String,
    pub response: String,
    pub is_fallback_model: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Coverage,
    Syntax,
    Security,
    Hallucination,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub agent: String,
    pub action: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Validation {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub check: String,
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Failure {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub reason: FailureReason,
    pub detail: String,
    pub iteration: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum GovernanceEntry {
    Decision(Decision),
    Validation(Validation),
    Failure(Failure),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunArtifacts {
    pub run_id: String,
    pub test_file: PathBuf,
    pub coverage_report: PathBuf,
    pub mutation_report: Option<PathBuf>,
    pub evaluation_report: PathBuf,
    pub governance_log: PathBuf,
    pub prompts_log: PathBuf,
    pub report: PathBuf,
}
