//! Writes and iteratively repairs the generated pytest file: first to valid
//! syntax, then away from hallucinated symbols, then toward better
//! coverage.

use std::collections::HashSet;
use std::sync::Arc;

use crate::code_utils::{detect_hallucinations, sanitize, validate_syntax};
use crate::file_scanner::Chunk;
use crate::governance::GovernanceLog;
use crate::llm::{LlmClient, LlmMessage, LlmRequest};
use crate::prompts::PromptLog;
use crate::types::{FailureReason, Priority, ScenarioSet};

const SYSTEM_PROMPT: &str = "You write a single pytest test file implementing the given test \
    scenarios against the given source. Add `sys.path` insertion for local imports if needed. \
    Prefer real calls over mocks; only mock external I/O. Respond with the complete Python file \
    contents only, no explanation, no markdown fence.";

const MAX_SYNTAX_FIX_ATTEMPTS: u32 = 3;

pub struct ImplementationAgent {
    llm: Arc<dyn LlmClient>,
    governance: Arc<GovernanceLog>,
    prompts: Arc<PromptLog>,
}

impl ImplementationAgent {
    pub fn new(llm: Arc<dyn LlmClient>, governance: Arc<GovernanceLog>, prompts: Arc<PromptLog>) -> Self {
        Self { llm, governance, prompts }
    }

    /// Generates an initial test file from the approved scenario set, then
    /// drives it through up to `MAX_SYNTAX_FIX_ATTEMPTS` syntax-repair
    /// rounds and one hallucination-repair pass.
    pub async fn run(
        &self,
        scenarios: &ScenarioSet,
        chunks: &[Chunk],
        actual_modules: &HashSet<String>,
        actual_symbols: &HashSet<String>,
        iteration: u32,
    ) -> String {
        // High-priority scenarios first, so a model with a truncated context
        // budget still sees the ones that matter most.
        let mut ordered: Vec<_> = scenarios.as_slice().to_vec();
        ordered.sort_by_key(|s| s.priority.rank());
        let scenarios_json = serde_json::to_string_pretty(&ordered).unwrap_or_default();
        let file_list: Vec<String> = chunks.iter().flat_map(|c| c.file_list()).collect();
        let code_context: String = chunks.iter().map(|c| c.code_context()).collect::<Vec<_>>().join("\n\n");
        let user_prompt = format!(
            "Scenarios:\n{scenarios_json}\n\nFiles: {file_list:?}\n\nSource:\n{code_context}"
        );

        let request = LlmRequest {
            system_prompt: SYSTEM_PROMPT.to_string(),
            messages: vec![LlmMessage {
                role: "user".into(),
                content: user_prompt.clone(),
            }],
            max_tokens: 4096,
        };

        let response = self.llm.chat(&request).await;
        let mut code = match response {
            Ok(r) => {
                self.governance.log_decision(
                    "implementation",
                    "generated initial test file",
                    if r.is_fallback { 0.0 } else { 0.85 },
                );
                self.prompts.record(iteration, "implementation", &r.model, SYSTEM_PROMPT, &user_prompt, &r.content, r.is_fallback);
                sanitize(&r.content)
            }
            Err(e) => {
                self.governance.log_failure(FailureReason::Syntax, &format!("llm call failed: {e}"), iteration);
                String::new()
            }
        };

        code = self.fix_syntax_errors(code, iteration).await;
        code = self.fix_hallucinations(code, actual_modules, actual_symbols, iteration).await;
        code
    }

    /// Rewrites `code` with coverage-gap, uncovered-security, and prior
    /// syntax-error context appended to the prompt, for the improve loop.
    pub async fn improve_tests(
        &self,
        code: &str,
        coverage_pct: f64,
        uncovered_areas: &str,
        security_notes: &str,
        iteration: u32,
    ) -> String {
        let system_prompt = format!(
            "{SYSTEM_PROMPT}\n\nYou are improving an existing test file rather than writing \
             one from scratch. Keep passing tests; add or adjust tests to close the gaps \
             described below."
        );
        let user_prompt = format!(
            "Current coverage: {coverage_pct:.1}%\nUncovered areas:\n{uncovered_areas}\n\n\
             Security notes:\n{security_notes}\n\nCurrent test file:\n{code}"
        );
        let request = LlmRequest {
            system_prompt: system_prompt.clone(),
            messages: vec![LlmMessage {
                role: "user".into(),
                content: user_prompt.clone(),
            }],
            max_tokens: 4096,
        };

        match self.llm.chat(&request).await {
            Ok(r) => {
                self.governance.log_decision("implementation", "improved test file", if r.is_fallback { 0.0 } else { 0.85 });
                self.prompts.record(iteration, "implementation", &r.model, &system_prompt, &user_prompt, &r.content, r.is_fallback);
                let improved = sanitize(&r.content);
                self.fix_syntax_errors(improved, iteration).await
            }
            Err(e) => {
                self.governance.log_failure(FailureReason::Coverage, &format!("improve call failed: {e}"), iteration);
                code.to_string()
            }
        }
    }

    /// Up to `MAX_SYNTAX_FIX_ATTEMPTS` rounds of: validate, and if invalid,
    /// ask the LLM to fix the specific error with a marked ±5-line context
    /// window (falling back to the first 20 lines if the error location is
    /// unknown). Returns the last candidate regardless of outcome — the
    /// caller re-validates before acting on it.
    async fn fix_syntax_errors(&self, mut code: String, iteration: u32) -> String {
        let system_prompt = "Fix the syntax error in this Python file. Respond with the complete \
            corrected file contents only.";
        for _attempt in 0..MAX_SYNTAX_FIX_ATTEMPTS {
            match validate_syntax(&code) {
                Ok(()) => return code,
                Err(issue) => {
                    self.governance.log_validation("syntax", false, &issue.message);
                    let context = marked_context(&code, issue.line);
                    let user_prompt = format!("Error: {}\n\n{context}", issue.message);
                    let request = LlmRequest {
                        system_prompt: system_prompt.to_string(),
                        messages: vec![LlmMessage {
                            role: "user".into(),
                            content: user_prompt.clone(),
                        }],
                        max_tokens: 4096,
                    };
                    match self.llm.chat(&request).await {
                        Ok(r) => {
                            self.prompts.record(iteration, "implementation", &r.model, system_prompt, &user_prompt, &r.content, r.is_fallback);
                            code = sanitize(&r.content);
                        }
                        Err(_) => break,
                    }
                }
            }
        }
        code
    }

    /// Detects hallucinated symbols and asks the LLM to replace them with
    /// real ones. Reverts to the pre-fix code if the fix introduces a new
    /// syntax error — a broken fix is worse than a file with an unresolved
    /// reference that at least still parses.
    async fn fix_hallucinations(
        &self,
        code: String,
        actual_modules: &HashSet<String>,
        actual_symbols: &HashSet<String>,
        iteration: u32,
    ) -> String {
        let hallucinated = detect_hallucinations(&code, actual_modules, actual_symbols);
        if hallucinated.is_empty() {
            return code;
        }
        self.governance.log_failure(
            FailureReason::Hallucination,
            &format!("references unknown symbols: {hallucinated:?}"),
            iteration,
        );

        let system_prompt = "The following test file references symbols that don't exist in the \
            target codebase. Replace each with an equivalent real symbol, or remove the test if \
            no equivalent exists. Respond with the complete corrected file contents only.";
        let user_prompt = format!(
            "Unknown symbols: {hallucinated:?}\nKnown modules: {actual_modules:?}\nKnown symbols: {actual_symbols:?}\n\nFile:\n{code}"
        );
        let request = LlmRequest {
            system_prompt: system_prompt.to_string(),
            messages: vec![LlmMessage {
                role: "user".into(),
                content: user_prompt.clone(),
            }],
            max_tokens: 4096,
        };

        match self.llm.chat(&request).await {
            Ok(r) => {
                self.prompts.record(iteration, "implementation", &r.model, system_prompt, &user_prompt, &r.content, r.is_fallback);
                let fixed = sanitize(&r.content);
                if validate_syntax(&fixed).is_ok() {
                    fixed
                } else {
                    self.governance.log_validation("hallucination_fix", false, "fix introduced a syntax error, reverting");
                    code
                }
            }
            Err(_) => code,
        }
    }
}

/// Builds a ±5-line window around `error_line` with `>>>` / `^ ERROR HERE`
/// markers, falling back to the file's first 20 lines when the error
/// location can't be trusted (e.g. line 0/1 on a parser that couldn't even
/// tokenize).
fn marked_context(code: &str, error_line: usize) -> String {
    let lines: Vec<&str> = code.lines().collect();
    if error_line == 0 || error_line > lines.len() {
        return lines.iter().take(20).cloned().collect::<Vec<_>>().join("\n");
    }
    let start = error_line.saturating_sub(6);
    let end = (error_line + 5).min(lines.len());
    let mut out = String::new();
    for (i, line) in lines[start..end].iter().enumerate() {
        let lineno = start + i + 1;
        if lineno == error_line {
            out.push_str(&format!(">>> {line}\n    ^ ERROR HERE\n"));
        } else {
            out.push_str(&format!("    {line}\n"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::StubLlmClient;
    use crate::types::TestScenario;

    fn scenarios() -> ScenarioSet {
        let mut set = ScenarioSet::new();
        set.insert(TestScenario {
            description: "adds".into(),
            target_module: "app".into(),
            target_symbol: Some("add".into()),
            rationale: "basic".into(),
            edge_case: false,
            priority: Priority::Medium,
        });
        set
    }

    #[tokio::test]
    async fn run_returns_valid_code_untouched() {
        let llm = Arc::new(StubLlmClient::constant("def test_add():\n    assert add(1, 2) == 3\n"));
        let agent = ImplementationAgent::new(llm, Arc::new(GovernanceLog::new()), Arc::new(crate::prompts::PromptLog::new()));
        let mut symbols = HashSet::new();
        symbols.insert("add".to_string());
        let code = agent.run(&scenarios(), &[], &HashSet::new(), &symbols, 1).await;
        assert!(code.contains("def test_add"));
    }

    #[tokio::test]
    async fn run_strips_markdown_fence() {
        let llm = Arc::new(StubLlmClient::constant("```python\ndef test_add():\n    assert add(1, 2) == 3\n```"));
        let agent = ImplementationAgent::new(llm, Arc::new(GovernanceLog::new()), Arc::new(crate::prompts::PromptLog::new()));
        let mut symbols = HashSet::new();
        symbols.insert("add".to_string());
        let code = agent.run(&scenarios(), &[], &HashSet::new(), &symbols, 1).await;
        assert!(!code.contains("```"));
    }

    #[test]
    fn marked_context_flags_the_error_line() {
        let code = "a\nb\nc\nd\n";
        let context = marked_context(code, 2);
        assert!(context.contains(">>> b"));
        assert!(context.contains("ERROR HERE"));
    }

    #[test]
    fn marked_context_falls_back_for_unknown_line() {
        let code = "a\nb\n";
        let context = marked_context(code, 0);
        assert_eq!(context, "a\nb");
    }
}
