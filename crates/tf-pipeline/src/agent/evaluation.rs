//! Judges a completed test run: asks the LLM for a security/quality
//! review, then overrides its self-reported numbers with the measured
//! coverage, mutation, and test-count values the controller already has.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::agent::extract_json;
use crate::governance::GovernanceLog;
use crate::llm::{LlmClient, LlmMessage, LlmRequest};
use crate::prompts::PromptLog;
use crate::types::{EvaluationOutput, MutationReport, SecurityIssue, Severity};

const SYSTEM_PROMPT: &str = "You review a generated pytest file and its run results for security \
    issues (injection, unsafe deserialization, missing auth checks, etc.) and general test \
    quality. Respond with JSON: {\"issues\": [{\"severity\": \"low\"|\"medium\"|\"high\"|\
    \"critical\", \"description\": ..., \"location\": ..., \"recommendation\": ...}], \
    \"summary\": \"...\"}.";

#[derive(Debug, Deserialize)]
struct RawIssue {
    severity: Option<String>,
    description: Option<String>,
    location: Option<String>,
    recommendation: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawEvaluation {
    #[serde(default)]
    issues: Vec<Value>,
    #[serde(default)]
    summary: String,
}

pub struct EvaluationAgent {
    llm: Arc<dyn LlmClient>,
    governance: Arc<GovernanceLog>,
    prompts: Arc<PromptLog>,
}

impl EvaluationAgent {
    pub fn new(llm: Arc<dyn LlmClient>, governance: Arc<GovernanceLog>, prompts: Arc<PromptLog>) -> Self {
        Self { llm, governance, prompts }
    }

    /// `coverage_percent`, `mutation`, and `test_count` are the measured
    /// values from the actual test run — the LLM's own numeric claims
    /// about them are always discarded in favor of these, since only the
    /// controller has ground truth.
    pub async fn run(
        &self,
        test_code: &str,
        coverage_percent: f64,
        mutation: Option<&MutationReport>,
        test_count: u32,
        iteration: u32,
    ) -> EvaluationOutput {
        let mutation_section = match mutation {
            Some(report) if !report.skipped => format!(
                "Mutation score: {:.1}% ({} survivors)",
                report.score(),
                report.survivors().count()
            ),
            Some(report) => format!("Mutation testing skipped: {}", report.skip_reason.as_deref().unwrap_or("unknown")),
            None => "Mutation testing not run this iteration.".to_string(),
        };

        let user_prompt = format!(
            "Coverage: {coverage_percent:.1}%\n{mutation_section}\nTest count: {test_count}\n\nTest file:\n{test_code}"
        );
        let request = LlmRequest {
            system_prompt: SYSTEM_PROMPT.to_string(),
            messages: vec![LlmMessage {
                role: "user".into(),
                content: user_prompt.clone(),
            }],
            max_tokens: 2048,
        };

        let response = match self.llm.chat(&request).await {
            Ok(r) => r,
            Err(e) => {
                return degenerate_output(coverage_percent, mutation, test_count, &format!("evaluation call failed: {e}"));
            }
        };

        self.governance.log_decision("evaluation", "reviewed test run", if response.is_fallback { 0.0 } else { 0.85 });
        self.prompts.record(iteration, "evaluation", &response.model, SYSTEM_PROMPT, &user_prompt, &response.content, response.is_fallback);

        // Tolerate the LLM wrapping its object in a single-element list,
        // a shape some models default to for "respond with JSON" prompts.
        let mut raw_text = response.content.clone();
        if let Some(trimmed) = raw_text.trim().strip_prefix('[') {
            if let Some(inner) = trimmed.strip_suffix(']') {
                raw_text = inner.trim().to_string();
            }
        }

        let parsed: Option<RawEvaluation> = extract_json(&raw_text);
        let Some(parsed) = parsed else {
            self.governance.log_validation("evaluation_json_parse", false, &response.content);
            return degenerate_output(coverage_percent, mutation, test_count, "could not parse evaluation response");
        };

        let issues: Vec<SecurityIssue> = parsed
            .issues
            .into_iter()
            .filter_map(|v| v.as_object().cloned())
            .filter_map(|obj| serde_json::from_value::<RawIssue>(Value::Object(obj)).ok())
            .map(|raw| SecurityIssue {
                severity: parse_severity(raw.severity.as_deref()),
                description: raw.description.unwrap_or_default(),
                location: raw.location,
                recommendation: raw.recommendation.unwrap_or_default(),
            })
            .collect();

        let has_severe = issues.iter().any(|i| i.severity.is_severe());

        EvaluationOutput {
            coverage_percent,
            mutation_score: mutation.filter(|m| !m.skipped).map(|m| m.score()),
            test_count,
            has_severe,
            issues,
            summary: parsed.summary,
        }
    }
}

fn parse_severity(raw: Option<&str>) -> Severity {
    match raw.map(str::to_lowercase).as_deref() {
        Some("critical") => Severity::Critical,
        Some("high") => Severity::High,
        Some("medium") => Severity::Medium,
        _ => Severity::Low,
    }
}

fn degenerate_output(
    coverage_percent: f64,
    mutation: Option<&MutationReport>,
    test_count: u32,
    diagnostic: &str,
) -> EvaluationOutput {
    EvaluationOutput {
        coverage_percent,
        mutation_score: mutation.filter(|m| !m.skipped).map(|m| m.score()),
        test_count,
        has_severe: false,
        issues: vec![SecurityIssue {
            severity: Severity::Low,
            description: diagnostic.to_string(),
            location: None,
            recommendation: "re-run evaluation".to_string(),
        }],
        summary: diagnostic.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::StubLlmClient;

    #[tokio::test]
    async fn parses_issues_and_forces_severe_flag() {
        let response = r#"{"issues": [{"severity": "critical", "description": "sql injection", "location": "app.py:10", "recommendation": "parameterize"}], "summary": "found one critical issue"}"#;
        let llm = Arc::new(StubLlmClient::constant(response));
        let agent = EvaluationAgent::new(llm, Arc::new(GovernanceLog::new()), Arc::new(crate::prompts::PromptLog::new()));
        let output = agent.run("code", 92.0, None, 5, 1).await;
        assert!(output.has_severe);
        assert_eq!(output.issues.len(), 1);
    }

    #[tokio::test]
    async fn tolerates_list_wrapped_response() {
        let response = r#"[{"issues": [], "summary": "clean"}]"#;
        let llm = Arc::new(StubLlmClient::constant(response));
        let agent = EvaluationAgent::new(llm, Arc::new(GovernanceLog::new()), Arc::new(crate::prompts::PromptLog::new()));
        let output = agent.run("code", 92.0, None, 5, 1).await;
        assert!(!output.has_severe);
        assert_eq!(output.summary, "clean");
    }

    #[tokio::test]
    async fn measured_coverage_overrides_any_llm_claim() {
        let response = r#"{"issues": [], "summary": "ok"}"#;
        let llm = Arc::new(StubLlmClient::constant(response));
        let agent = EvaluationAgent::new(llm, Arc::new(GovernanceLog::new()), Arc::new(crate::prompts::PromptLog::new()));
        let output = agent.run("code", 77.5, None, 5, 1).await;
        assert_eq!(output.coverage_percent, 77.5);
    }

    #[tokio::test]
    async fn degenerate_output_on_parse_failure() {
        let llm = Arc::new(StubLlmClient::constant("not json"));
        let agent = EvaluationAgent::new(llm, Arc::new(GovernanceLog::new()), Arc::new(crate::prompts::PromptLog::new()));
        let output = agent.run("code", 50.0, None, 3, 1).await;
        assert_eq!(output.issues.len(), 1);
        assert!(!output.has_severe);
    }
}
