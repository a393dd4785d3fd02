//! Append-only, order-preserving record of every LLM call made during a
//! run, serialized to the prompts JSON artifact at run end.
//!
//! Ordering is observable: under parallel identification, entries land in
//! completion order, not dispatch order — callers append as each response
//! arrives rather than pre-allocating slots.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::types::PromptRecord;

#[derive(Default)]
pub struct PromptLog {
    entries: Mutex<Vec<PromptRecord>>,
}

impl PromptLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &self,
        iteration: u32,
        agent: &str,
        model: &str,
        system_prompt: &str,
        user_prompt: &str,
        response: &str,
        is_fallback_model: bool,
    ) {
        let record = PromptRecord {
            timestamp: chrono::Utc::now(),
            iteration,
            agent: agent.to_string(),
            model: model.to_string(),
            system_prompt: system_prompt.to_string(),
            user_prompt: user_prompt.to_string(),
            response: response.to_string(),
            is_fallback_model,
        };
        self.entries.lock().expect("prompt log poisoned").push(record);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("prompt log poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entries(&self) -> Vec<PromptRecord> {
        self.entries.lock().expect("prompt log poisoned").clone()
    }

    /// Serializes to the `tests/prompts_<run_id>.json` shape from spec §6:
    /// `{run_id, timestamp, model, total_prompts, prompts}`.
    pub fn to_json(&self, run_id: &str, model: &str) -> serde_json::Result<String> {
        let prompts = self.entries();
        let doc = PromptsDocument {
            run_id: run_id.to_string(),
            timestamp: chrono::Utc::now(),
            model: model.to_string(),
            total_prompts: prompts.len(),
            prompts,
        };
        serde_json::to_string_pretty(&doc)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PromptsDocument {
    run_id: String,
    timestamp: chrono::DateTime<chrono::Utc>,
    model: String,
    total_prompts: usize,
    prompts: Vec<PromptRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_accumulate_in_append_order() {
        let log = PromptLog::new();
        log.record(1, "identification", "m1", "sys", "user1", "resp1", false);
        log.record(1, "identification", "m1", "sys", "user2", "resp2", true);

        let entries = log.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].user_prompt, "user1");
        assert_eq!(entries[1].is_fallback_model, true);
    }

    #[test]
    fn to_json_total_prompts_matches_len() {
        let log = PromptLog::new();
        log.record(1, "implementation", "m1", "sys", "user", "resp", false);
        let json = log.to_json("run-1", "m1").unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["total_prompts"], 1);
        assert_eq!(parsed["prompts"].as_array().unwrap().len(), 1);
    }
}
