//! Resolves and installs third-party packages a generated test file
//! imports that aren't already available in the target environment.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;

use crate::agent::extract_json;
use crate::error::PipelineError;
use crate::llm::{LlmClient, LlmMessage, LlmRequest};

const INSTALL_TIMEOUT: Duration = Duration::from_secs(120);
const MAX_RETRIES: u32 = 3;

/// import-name → PyPI-package-name corrections for the common cases where
/// they differ, used as a fallback when the LLM-based analysis is
/// unavailable or returns nothing useful.
fn import_to_package(import_name: &str) -> &str {
    match import_name {
        "cv2" => "opencv-python",
        "bs4" => "beautifulsoup4",
        "yaml" => "PyYAML",
        "PIL" => "Pillow",
        "sklearn" => "scikit-learn",
        "pytest_asyncio" => "pytest-asyncio",
        other => other,
    }
}

/// Regex over `import x` / `from x import y` lines, restricted to
/// third-party-looking top-level names (stdlib modules are filtered by the
/// caller-supplied `stdlib` set).
pub fn extract_dependencies(source: &str, stdlib: &HashSet<String>) -> Vec<String> {
    let import_re = Regex::new(r"(?m)^\s*(?:import|from)\s+([A-Za-z_][A-Za-z0-9_]*)").unwrap();
    let mut found: HashSet<String> = import_re
        .captures_iter(source)
        .map(|c| c[1].to_string())
        .filter(|name| !stdlib.contains(name))
        .collect();

    // The test runner always needs these regardless of what's imported.
    found.insert("pytest".to_string());
    found.insert("pytest-cov".to_string());
    found.insert("pytest-timeout".to_string());

    let mut packages: Vec<String> = found
        .into_iter()
        .map(|name| import_to_package(&name).to_string())
        .collect();
    packages.sort();
    packages
}

#[derive(Debug, Deserialize)]
struct DependencyFix {
    packages: Vec<String>,
    #[allow(dead_code)]
    reason: String,
}

pub struct DependencyResolver {
    llm: Arc<dyn LlmClient>,
}

impl DependencyResolver {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// Installs `packages` with pip, already-installed packages skipped.
    /// On failure, asks the LLM to propose a corrected package list (e.g.
    /// swap `cv2` for `opencv-python`) and retries up to `MAX_RETRIES`
    /// times before giving up.
    pub async fn install_with_retry(
        &self,
        packages: &[String],
        project_dir: &Path,
    ) -> Result<(), PipelineError> {
        let installed = installed_distributions();
        let mut to_install: Vec<String> = packages
            .iter()
            .filter(|p| !installed.contains(&normalize(p)))
            .cloned()
            .collect();

        if to_install.is_empty() {
            return Ok(());
        }

        let mut last_error = String::new();
        for attempt in 0..MAX_RETRIES {
            match self.pip_install(&to_install, project_dir).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    last_error = e.to_string();
                    tracing::warn!(attempt, error = %last_error, "dependency install failed, asking LLM for a correction");
                    if let Some(fix) = self.suggest_fix(&to_install, &last_error).await {
                        to_install = fix.packages;
                    }
                }
            }
        }
        Err(PipelineError::DependencyInstallFailed(last_error))
    }

    async fn pip_install(&self, packages: &[String], project_dir: &Path) -> Result<(), PipelineError> {
        let mut command = tokio::process::Command::new("pip");
        command
            .arg("install")
            .arg("--quiet")
            .args(packages)
            .current_dir(project_dir);
        let output = tokio::time::timeout(INSTALL_TIMEOUT, command.output())
            .await
            .map_err(|_| PipelineError::TimeoutExpired("pip install timed out".into()))??;
        if !output.status.success() {
            return Err(PipelineError::DependencyInstallFailed(
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }
        Ok(())
    }

    async fn suggest_fix(&self, packages: &[String], error: &str) -> Option<DependencyFix> {
        let request = LlmRequest {
            system_prompt: "You fix Python dependency installation failures. Given a list of \
                package names and the pip error they produced, return corrected package names \
                as JSON: {\"packages\": [...], \"reason\": \"...\"}."
                .to_string(),
            messages: vec![LlmMessage {
                role: "user".into(),
                content: format!("packages: {packages:?}\nerror:\n{error}"),
            }],
            max_tokens: 512,
        };
        let response = self.llm.chat(&request).await.ok()?;
        extract_json(&response.content)
    }
}

fn normalize(package: &str) -> String {
    package.to_lowercase().replace('_', "-")
}

/// Queries the environment for already-installed package names. Falls back
/// to an empty set if `pip list` can't be run (e.g. in a test sandbox with
/// no Python on PATH), which just means every package is attempted again —
/// safe, if slightly redundant.
fn installed_distributions() -> HashSet<String> {
    let Ok(output) = std::process::Command::new("pip").args(["list", "--format=freeze"]).output() else {
        return HashSet::new();
    };
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(|line| line.split("==").next())
        .map(normalize)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn import_to_package_maps_known_aliases() {
        assert_eq!(import_to_package("cv2"), "opencv-python");
        assert_eq!(import_to_package("yaml"), "PyYAML");
        assert_eq!(import_to_package("requests"), "requests");
    }

    #[test]
    fn extract_dependencies_always_includes_pytest_trio() {
        let stdlib: HashSet<String> = ["os", "sys"].iter().map(|s| s.to_string()).collect();
        let deps = extract_dependencies("import os\nimport requests\n", &stdlib);
        assert!(deps.contains(&"pytest".to_string()));
        assert!(deps.contains(&"pytest-cov".to_string()));
        assert!(deps.contains(&"requests".to_string()));
        assert!(!deps.contains(&"os".to_string()));
    }

    #[test]
    fn extract_dependencies_maps_aliases() {
        let stdlib = HashSet::new();
        let deps = extract_dependencies("import cv2\n", &stdlib);
        assert!(deps.contains(&"opencv-python".to_string()));
    }

    #[test]
    fn normalize_lowercases_and_hyphenates() {
        assert_eq!(normalize("PyYAML"), "pyyaml");
        assert_eq!(normalize("pytest_asyncio"), "pytest-asyncio");
    }
}
