//! Reads chunks of the target codebase and proposes test scenarios for
//! them, running one LLM call per chunk concurrently.

use std::sync::Arc;

use serde::Deserialize;
use tokio::task::JoinSet;

use crate::agent::extract_json;
use crate::file_scanner::Chunk;
use crate::governance::GovernanceLog;
use crate::llm::{LlmClient, LlmMessage, LlmRequest};
use crate::prompts::PromptLog;
use crate::types::{ScenarioSet, TestScenario};

const SYSTEM_PROMPT: &str = "You identify test scenarios for the given Python source. For each \
    function, method, and notable branch, propose a scenario covering its normal behavior and \
    at least one edge case. Respond with JSON: {\"scenarios\": [{\"description\": ..., \
    \"target_module\": ..., \"target_symbol\": ..., \"rationale\": ..., \"edge_case\": bool, \
    \"priority\": \"High\"|\"Medium\"|\"Low\"}]}. Omit priority if unsure; it defaults to Medium.";

#[derive(Debug, Deserialize)]
struct ScenarioResponse {
    scenarios: Vec<TestScenario>,
}

/// Bounds how many chunks are sent to the LLM concurrently, mirroring the
/// original's `ThreadPoolExecutor(max_workers=min(5, chunks))`.
const MAX_CONCURRENT_CHUNKS: usize = 5;

pub struct IdentificationAgent {
    llm: Arc<dyn LlmClient>,
    governance: Arc<GovernanceLog>,
    prompts: Arc<PromptLog>,
}

impl IdentificationAgent {
    pub fn new(llm: Arc<dyn LlmClient>, governance: Arc<GovernanceLog>, prompts: Arc<PromptLog>) -> Self {
        Self { llm, governance, prompts }
    }

    pub async fn run(&self, chunks: Vec<Chunk>) -> ScenarioSet {
        let mut set = ScenarioSet::new();
        let mut join_set = JoinSet::new();
        let mut pending: Vec<Chunk> = chunks;
        pending.reverse();

        let mut in_flight = 0;
        while !pending.is_empty() || in_flight > 0 {
            while in_flight < MAX_CONCURRENT_CHUNKS {
                let Some(chunk) = pending.pop() else { break };
                let llm = Arc::clone(&self.llm);
                let governance = Arc::clone(&self.governance);
                let prompts = Arc::clone(&self.prompts);
                join_set.spawn(async move { process_chunk(llm, governance, prompts, chunk).await });
                in_flight += 1;
            }
            if let Some(result) = join_set.join_next().await {
                in_flight -= 1;
                if let Ok(scenarios) = result {
                    set.extend(scenarios);
                }
            } else {
                break;
            }
        }
        set
    }
}

async fn process_chunk(
    llm: Arc<dyn LlmClient>,
    governance: Arc<GovernanceLog>,
    prompts: Arc<PromptLog>,
    chunk: Chunk,
) -> Vec<TestScenario> {
    let user_prompt = format!(
        "Files: {:?}\n\nSource:\n{}",
        chunk.file_list(),
        chunk.code_context()
    );
    let request = LlmRequest {
        system_prompt: SYSTEM_PROMPT.to_string(),
        messages: vec![LlmMessage {
            role: "user".into(),
            content: user_prompt.clone(),
        }],
        max_tokens: 2048,
    };

    let response = match llm.chat(&request).await {
        Ok(r) => r,
        Err(e) => {
            governance.log_decision("identification", &format!("llm call failed: {e}"), 0.0);
            return Vec::new();
        }
    };

    governance.log_decision(
        "identification",
        "proposed scenarios for chunk",
        if response.is_fallback { 0.0 } else { 0.85 },
    );
    prompts.record(
        0,
        "identification",
        &response.model,
        SYSTEM_PROMPT,
        &user_prompt,
        &response.content,
        response.is_fallback,
    );

    match extract_json::<ScenarioResponse>(&response.content) {
        Some(parsed) => parsed.scenarios,
        None => {
            governance.log_validation("identification_json_parse", false, &response.content);
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_scanner::SourceFile;
    use crate::llm::StubLlmClient;
    use std::path::PathBuf;

    fn chunk() -> Chunk {
        Chunk {
            files: vec![SourceFile {
                path: PathBuf::from("app.py"),
                content: "def add(a, b):\n    return a + b\n".to_string(),
            }],
        }
    }

    #[tokio::test]
    async fn run_collects_scenarios_from_response() {
        let response = r#"{"scenarios": [{"description": "adds two positives", "target_module": "app", "target_symbol": "add", "rationale": "basic", "edge_case": false}]}"#;
        let llm = Arc::new(StubLlmClient::constant(response));
        let agent = IdentificationAgent::new(llm, Arc::new(GovernanceLog::new()), Arc::new(crate::prompts::PromptLog::new()));

        let scenarios = agent.run(vec![chunk()]).await;
        assert_eq!(scenarios.len(), 1);
    }

    #[tokio::test]
    async fn run_deduplicates_across_chunks() {
        let response = r#"{"scenarios": [{"description": "Adds Two Positives", "target_module": "app", "target_symbol": "add", "rationale": "basic", "edge_case": false}]}"#;
        let llm = Arc::new(StubLlmClient::constant(response));
        let agent = IdentificationAgent::new(llm, Arc::new(GovernanceLog::new()), Arc::new(crate::prompts::PromptLog::new()));

        let scenarios = agent.run(vec![chunk(), chunk()]).await;
        assert_eq!(scenarios.len(), 1);
    }

    #[tokio::test]
    async fn run_tolerates_unparseable_response() {
        let llm = Arc::new(StubLlmClient::constant("not json at all"));
        let agent = IdentificationAgent::new(llm, Arc::new(GovernanceLog::new()), Arc::new(crate::prompts::PromptLog::new()));
        let scenarios = agent.run(vec![chunk()]).await;
        assert!(scenarios.is_empty());
    }
}
