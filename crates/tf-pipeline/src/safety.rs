//! Optional prompt-safety classifier gate, run before a prompt is handed to
//! the generation model.

use std::sync::Arc;

use crate::llm::{LlmClient, LlmMessage, LlmRequest};

/// Hazard taxonomy the classifier maps its `unsafe\n<code>` response onto.
/// Advisory only: the pipeline never blocks on these, it only records them.
pub fn hazard_label(code: &str) -> &'static str {
    match code {
        "S1" => "violent_crimes",
        "S2" => "non_violent_crimes",
        "S3" => "sex_crimes",
        "S4" => "child_exploitation",
        "S5" => "defamation",
        "S6" => "specialized_advice",
        "S7" => "privacy",
        "S8" => "intellectual_property",
        "S9" => "indiscriminate_weapons",
        "S10" => "hate",
        "S11" => "self_harm",
        "S12" => "sexual_content",
        "S13" => "elections",
        "S14" => "code_interpreter_abuse",
        _ => "unknown",
    }
}

/// Wraps a moderation-model call. Without a configured client, `check`
/// always returns `(true, "skipped")` — safety classification degrades to
/// a no-op rather than blocking the pipeline when no moderation model is
/// configured.
pub struct SafetyChecker {
    client: Option<Arc<dyn LlmClient>>,
}

impl SafetyChecker {
    pub fn new(client: Option<Arc<dyn LlmClient>>) -> Self {
        Self { client }
    }

    pub fn disabled() -> Self {
        Self { client: None }
    }

    /// Returns `(is_safe, detail)`. A transport error is treated as
    /// non-blocking too — `(true, "error: ...")` — since a classifier
    /// outage should never stall test generation.
    pub async fn check(&self, prompt: &str) -> (bool, String) {
        let Some(client) = &self.client else {
            return (true, "skipped".to_string());
        };

        let request = LlmRequest {
            system_prompt: "You are a content safety classifier. Respond with exactly \"safe\" \
                or \"unsafe\" followed by a newline and a hazard code (S1-S14) on the next line."
                .to_string(),
            messages: vec![LlmMessage {
                role: "user".into(),
                content: prompt.to_string(),
            }],
            max_tokens: 16,
        };

        match client.chat(&request).await {
            Ok(response) => parse_verdict(&response.content),
            Err(e) => (true, format!("error: {e}")),
        }
    }
}

fn parse_verdict(content: &str) -> (bool, String) {
    let mut lines = content.trim().lines();
    match lines.next() {
        Some(first) if first.trim().eq_ignore_ascii_case("safe") => (true, "safe".to_string()),
        Some(first) if first.trim().eq_ignore_ascii_case("unsafe") => {
            let code = lines.next().unwrap_or("").trim();
            (false, format!("unsafe: {}", hazard_label(code)))
        }
        _ => (true, format!("unrecognized response: {content}")),
    }
}
