//! Interactive scenario approval: classifies an operator's free-form
//! response into approve / remove(indices) / refine(feedback) via the LLM
//! rather than a hand-rolled parser, since natural language resists regexes
//! more than it resists a model with a strict JSON schema.

use std::sync::Arc;

use serde::Deserialize;

use crate::agent::extract_json;
use crate::governance::GovernanceLog;
use crate::llm::{LlmClient, LlmMessage, LlmRequest};
use crate::prompts::PromptLog;
use crate::types::{ScenarioSet, TestScenario};

const CLASSIFY_SYSTEM_PROMPT: &str = "You classify an operator's response to a proposed test \
    scenario list. Respond with JSON: {\"intent\": \"approve\"|\"remove\"|\"refine\", \
    \"indices\": [int, ...], \"feedback\": \"...\"}. Use \"remove\" with the zero-based indices \
    to drop when the operator names specific scenarios to cut. Use \"refine\" with their \
    feedback verbatim in \"feedback\" for anything else that isn't a plain approval.";

const REFINE_SYSTEM_PROMPT: &str = "You rewrite a test scenario list given operator feedback. \
    Respond with JSON: {\"scenarios\": [{\"description\": ..., \"target_module\": ..., \
    \"target_symbol\": ..., \"rationale\": ..., \"edge_case\": bool, \"priority\": \
    \"High\"|\"Medium\"|\"Low\"}]}.";

#[derive(Debug, Deserialize)]
struct RawIntent {
    intent: String,
    #[serde(default)]
    indices: Vec<usize>,
    #[serde(default)]
    feedback: String,
}

#[derive(Debug, Deserialize)]
struct RefineResponse {
    scenarios: Vec<TestScenario>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApprovalIntent {
    Approve,
    Remove(Vec<usize>),
    Refine(String),
}

pub struct ApprovalAgent {
    llm: Arc<dyn LlmClient>,
    governance: Arc<GovernanceLog>,
    prompts: Arc<PromptLog>,
}

impl ApprovalAgent {
    pub fn new(llm: Arc<dyn LlmClient>, governance: Arc<GovernanceLog>, prompts: Arc<PromptLog>) -> Self {
        Self { llm, governance, prompts }
    }

    /// Classifies one line of operator input. Any LLM or parse failure
    /// degrades to `Refine` carrying the raw utterance — never panics the
    /// approval loop, never silently approves something the operator didn't
    /// actually approve.
    pub async fn classify(&self, utterance: &str, iteration: u32) -> ApprovalIntent {
        let request = LlmRequest {
            system_prompt: CLASSIFY_SYSTEM_PROMPT.to_string(),
            messages: vec![LlmMessage {
                role: "user".into(),
                content: utterance.to_string(),
            }],
            max_tokens: 256,
        };

        let response = match self.llm.chat(&request).await {
            Ok(r) => r,
            Err(e) => {
                self.governance.log_decision("approval", &format!("intent classification failed: {e}"), 0.0);
                return ApprovalIntent::Refine(utterance.to_string());
            }
        };
        self.prompts.record(
            iteration,
            "approval",
            &response.model,
            CLASSIFY_SYSTEM_PROMPT,
            utterance,
            &response.content,
            response.is_fallback,
        );

        match extract_json::<RawIntent>(&response.content) {
            Some(raw) => match raw.intent.to_lowercase().as_str() {
                "approve" => ApprovalIntent::Approve,
                "remove" => ApprovalIntent::Remove(raw.indices),
                _ => ApprovalIntent::Refine(if raw.feedback.is_empty() {
                    utterance.to_string()
                } else {
                    raw.feedback
                }),
            },
            None => ApprovalIntent::Refine(utterance.to_string()),
        }
    }

    /// Rewrites `scenarios` given operator `feedback`. Falls back to the
    /// unmodified set on any LLM or parse failure — a failed refinement
    /// should never silently empty the approved list.
    pub async fn refine(&self, scenarios: &ScenarioSet, feedback: &str, iteration: u32) -> ScenarioSet {
        let current_json = serde_json::to_string_pretty(scenarios.as_slice()).unwrap_or_default();
        let user_prompt = format!("Current scenarios:\n{current_json}\n\nOperator feedback:\n{feedback}");
        let request = LlmRequest {
            system_prompt: REFINE_SYSTEM_PROMPT.to_string(),
            messages: vec![LlmMessage {
                role: "user".into(),
                content: user_prompt.clone(),
            }],
            max_tokens: 2048,
        };

        let response = match self.llm.chat(&request).await {
            Ok(r) => r,
            Err(e) => {
                self.governance.log_decision("approval", &format!("refinement call failed: {e}"), 0.0);
                return scenarios.clone();
            }
        };
        self.prompts.record(
            iteration,
            "approval",
            &response.model,
            REFINE_SYSTEM_PROMPT,
            &user_prompt,
            &response.content,
            response.is_fallback,
        );

        match extract_json::<RefineResponse>(&response.content) {
            Some(parsed) => {
                let mut set = ScenarioSet::new();
                set.extend(parsed.scenarios);
                self.governance.log_decision("approval", "refined scenario set from operator feedback", 0.85);
                set
            }
            None => {
                self.governance.log_validation("approval_refine_parse", false, &response.content);
                scenarios.clone()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::StubLlmClient;

    fn agent(response: &str) -> ApprovalAgent {
        ApprovalAgent::new(
            Arc::new(StubLlmClient::constant(response)),
            Arc::new(GovernanceLog::new()),
            Arc::new(PromptLog::new()),
        )
    }

    #[tokio::test]
    async fn classifies_approve() {
        let agent = agent(r#"{"intent": "approve"}"#);
        assert_eq!(agent.classify("looks good", 0).await, ApprovalIntent::Approve);
    }

    #[tokio::test]
    async fn classifies_remove_with_indices() {
        let agent = agent(r#"{"intent": "remove", "indices": [0, 2]}"#);
        assert_eq!(agent.classify("drop the first and third", 0).await, ApprovalIntent::Remove(vec![0, 2]));
    }

    #[tokio::test]
    async fn classifies_refine_with_feedback() {
        let agent = agent(r#"{"intent": "refine", "feedback": "add one for negative numbers"}"#);
        assert_eq!(
            agent.classify("what about negatives", 0).await,
            ApprovalIntent::Refine("add one for negative numbers".to_string())
        );
    }

    #[tokio::test]
    async fn unparseable_response_falls_back_to_refine_with_raw_utterance() {
        let agent = agent("not json");
        assert_eq!(agent.classify("hmm", 0).await, ApprovalIntent::Refine("hmm".to_string()));
    }

    #[tokio::test]
    async fn refine_rewrites_scenario_set() {
        let response = r#"{"scenarios": [{"description": "new one", "target_module": "m", "target_symbol": null, "rationale": "r", "edge_case": false}]}"#;
        let agent = agent(response);
        let mut scenarios = ScenarioSet::new();
        scenarios.insert(TestScenario {
            description: "old".into(),
            target_module: "m".into(),
            target_symbol: None,
            rationale: "r".into(),
            edge_case: false,
            priority: crate::types::Priority::Medium,
        });
        let refined = agent.refine(&scenarios, "replace with something else", 0).await;
        assert_eq!(refined.len(), 1);
        assert_eq!(refined.as_slice()[0].description, "new one");
    }

    #[tokio::test]
    async fn refine_keeps_original_set_on_parse_failure() {
        let agent = agent("not json");
        let mut scenarios = ScenarioSet::new();
        scenarios.insert(TestScenario {
            description: "old".into(),
            target_module: "m".into(),
            target_symbol: None,
            rationale: "r".into(),
            edge_case: false,
            priority: crate::types::Priority::Medium,
        });
        let refined = agent.refine(&scenarios, "feedback", 0).await;
        assert_eq!(refined.len(), 1);
        assert_eq!(refined.as_slice()[0].description, "old");
    }
}
