use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;

use crate::error::PipelineError;
use crate::llm::{LlmClient, StubLlmClient};

#[cfg(feature = "http")]
use crate::llm::HttpLlmClient;

#[derive(Debug, Deserialize)]
pub struct TfConfig {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
}

/// Safety-classifier configuration.
#[derive(Debug, Default, Deserialize)]
pub struct SafetyConfig {
    /// When `false`, `SafetyChecker` skips the classifier call entirely and
    /// reports `(true, "skipped")`, mirroring the original's no-client path.
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Pipeline-level configuration: iteration budget and quality gates.
#[derive(Debug, Deserialize)]
pub struct PipelineConfig {
    /// Maximum identify→implement→evaluate iterations before aborting.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Consecutive non-improving iterations before the no-progress guard
    /// halts the run and restores the best-so-far test file.
    #[serde(default = "default_no_progress_limit")]
    pub no_progress_limit: u32,

    /// Minimum coverage percentage required to finish.
    #[serde(default = "default_coverage_target")]
    pub coverage_target: f64,

    /// Minimum mutation score required to finish, only enforced when
    /// mutation testing actually ran for this iteration.
    #[serde(default = "default_mutation_target")]
    pub mutation_target: f64,

    /// Path to a project conventions file (analogous to a coding-standards
    /// doc) injected into the implementation agent's system prompt.
    pub conventions_path: Option<String>,

    /// When `true`, the proposed scenario set is approved automatically and
    /// the operator is never prompted. When `false`, `run` reads lines from
    /// stdin and classifies each into approve/remove/refine until approved,
    /// falling back to auto-approval if stdin is closed (non-interactive
    /// environments such as CI).
    #[serde(default = "default_true")]
    pub auto_approve: bool,
}

fn default_max_iterations() -> u32 {
    15
}
fn default_no_progress_limit() -> u32 {
    5
}
fn default_coverage_target() -> f64 {
    90.0
}
fn default_mutation_target() -> f64 {
    80.0
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            no_progress_limit: default_no_progress_limit(),
            coverage_target: default_coverage_target(),
            mutation_target: default_mutation_target(),
            conventions_path: None,
            auto_approve: default_true(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub provider: LlmProvider,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_models")]
    pub models: Vec<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::default(),
            base_url: default_base_url(),
            models: default_models(),
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_base_url() -> String {
    "https://api.groq.com/openai/v1".into()
}
fn default_models() -> Vec<String> {
    vec![
        "llama-3.3-70b-versatile".into(),
        "llama-3.1-8b-instant".into(),
    ]
}
fn default_max_tokens() -> u32 {
    4096
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum LlmProvider {
    #[serde(rename = "http")]
    #[default]
    Http,
    #[serde(rename = "stub")]
    Stub,
}

impl TfConfig {
    pub fn from_file(path: &Path) -> Result<Self, PipelineError> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| PipelineError::ConfigMissing(format!("failed to parse config: {e}")))
    }

    /// Loads project conventions text, if configured. Expands a leading `~`
    /// to the home directory. Missing files are non-fatal: conventions are
    /// an optional enrichment to the implementation prompt.
    pub fn load_conventions(&self) -> Option<String> {
        let raw = self.pipeline.conventions_path.as_deref()?;
        let expanded = if let Some(rest) = raw.strip_prefix("~/") {
            dirs::home_dir()?.join(rest)
        } else {
            PathBuf::from(raw)
        };
        match std::fs::read_to_string(&expanded) {
            Ok(content) => {
                tracing::info!(path = %expanded.display(), "loaded project conventions");
                Some(content)
            }
            Err(e) => {
                tracing::warn!(path = %expanded.display(), error = %e, "could not load project conventions — continuing without them");
                None
            }
        }
    }

    /// Builds the configured `LlmClient`, discovering credentials from the
    /// environment: any variable whose name contains `API_KEY` is a
    /// candidate, collected in sorted-name order for deterministic
    /// round-robin rotation.
    pub fn build_llm_client(&self) -> Result<Arc<dyn LlmClient>, PipelineError> {
        match self.llm.provider {
            LlmProvider::Stub => Ok(Arc::new(StubLlmClient::constant("stub response"))),
            LlmProvider::Http => {
                #[cfg(feature = "http")]
                {
                    let keys = discover_api_keys();
                    if keys.is_empty() {
                        return Err(PipelineError::ConfigMissing(
                            "no *_API_KEY environment variable found".into(),
                        ));
                    }
                    Ok(Arc::new(HttpLlmClient::new(
                        self.llm.base_url.clone(),
                        self.llm.models.clone(),
                        keys,
                    )))
                }
                #[cfg(not(feature = "http"))]
                {
                    Err(PipelineError::ConfigMissing(
                        "http LLM provider requested but the `http` feature is disabled".into(),
                    ))
                }
            }
        }
    }
}

/// Discovers credentials from the environment without requiring a fixed
/// variable name: any `*_API_KEY*` variable is a candidate, sorted by name
/// so rotation order is stable across runs.
pub fn discover_api_keys() -> Vec<String> {
    let mut keys: Vec<(String, String)> = std::env::vars()
        .filter(|(k, _)| k.contains("API_KEY"))
        .collect();
    keys.sort_by(|a, b| a.0.cmp(&b.0));
    keys.into_iter().map(|(_, v)| v).collect()
}

/// Loads a `.env` file into the process environment without overwriting
/// variables already set — the shell's own exports always win.
pub fn load_dotenv(path: &Path) {
    let Ok(content) = std::fs::read_to_string(path) else {
        return;
    };
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            let value = value.trim().trim_matches('"');
            if std::env::var(key).is_err() {
                // SAFETY: single-threaded at startup, before any spawned work.
                unsafe {
                    std::env::set_var(key, value);
                }
            }
        }
    }
}
