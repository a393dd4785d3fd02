use thiserror::Error;

/// Abstract error kinds from the pipeline's error handling design.
///
/// Most variants are recovered locally (logged to the governance trail and
/// downgraded to a degenerate result) rather than propagated — see each
/// component for its specific recovery policy. `LlmExhausted` is the only
/// variant that aborts a whole pipeline iteration rather than just the call
/// that raised it.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// All candidate models were cooled down or the admission retry budget
    /// (20 rounds) was spent.
    #[error("all LLM models exhausted after retries: {0}")]
    LlmExhausted(String),

    /// A single provider returned a rate-limit response. Carries the
    /// cooldown applied to that model; other models remain usable.
    #[error("rate limited on model {model}, cooling down {cooldown_secs}s")]
    LlmRateLimit { model: String, cooldown_secs: u64 },

    /// JSON returned by an LLM could not be parsed even after code-fence
    /// stripping and list-unwrapping heuristics.
    #[error("failed to parse LLM response as JSON: {0}")]
    ParseError(String),

    /// Generated code failed to parse as a program in the target language.
    #[error("generated code has invalid syntax: {0}")]
    SyntaxInvalid(String),

    /// Generated code references a module or symbol that does not exist.
    #[error("generated code references non-existent symbol(s): {0}")]
    Hallucination(String),

    /// The test runner produced no coverage data.
    #[error("coverage data missing: {0}")]
    CoverageMissing(String),

    /// A subprocess (test run, dependency install, mutation run, coverage
    /// generation) exceeded its wall-clock budget.
    #[error("operation timed out: {0}")]
    TimeoutExpired(String),

    /// Dependency installation failed after all retries.
    #[error("dependency installation failed: {0}")]
    DependencyInstallFailed(String),

    /// The safety classifier flagged a prompt. Advisory only — the pipeline
    /// proceeds regardless, recording the outcome in the governance log.
    #[error("safety classifier flagged prompt: {0}")]
    SafetyBlocked(String),

    /// No LLM credentials were configured at startup.
    #[error("no LLM credentials configured: {0}")]
    ConfigMissing(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
