//! Append-only audit trail of every LLM-backed decision, validation, and
//! failure the pipeline records during a run.

use std::collections::BTreeSet;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Decision, Failure, FailureReason, GovernanceEntry, Validation};

pub struct GovernanceLog {
    pipeline_start: DateTime<Utc>,
    entries: Mutex<Vec<GovernanceEntry>>,
}

impl GovernanceLog {
    pub fn new() -> Self {
        Self {
            pipeline_start: Utc::now(),
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn log_decision(&self, agent: &str, action: &str, confidence: f64) {
        let entry = GovernanceEntry::Decision(Decision {
            timestamp: chrono::Utc::now(),
            agent: agent.to_string(),
            action: action.to_string(),
            confidence,
        });
        self.entries.lock().expect("governance log poisoned").push(entry);
    }

    pub fn log_validation(&self, check: &str, passed: bool, detail: &str) {
        let entry = GovernanceEntry::Validation(Validation {
            timestamp: chrono::Utc::now(),
            check: check.to_string(),
            passed,
            detail: detail.to_string(),
        });
        self.entries.lock().expect("governance log poisoned").push(entry);
    }

    pub fn log_failure(&self, reason: FailureReason, detail: &str, iteration: u32) {
        let entry = GovernanceEntry::Failure(Failure {
            timestamp: chrono::Utc::now(),
            reason,
            detail: detail.to_string(),
            iteration,
        });
        self.entries.lock().expect("governance log poisoned").push(entry);
    }

    pub fn entries(&self) -> Vec<GovernanceEntry> {
        self.entries.lock().expect("governance log poisoned").clone()
    }

    /// Serializes to the `tests/governance_<run_id>.json` shape from spec
    /// §6: decisions/validations/failures split into their own arrays, plus
    /// a rollup `summary`. `status` is `"REVIEW_NEEDED"` whenever any
    /// validation failed or any failure was logged, `"PASS"` otherwise.
    pub fn to_json(&self, final_status: &str) -> serde_json::Result<String> {
        let mut decisions = Vec::new();
        let mut validations = Vec::new();
        let mut failures = Vec::new();
        for entry in self.entries() {
            match entry {
                GovernanceEntry::Decision(d) => decisions.push(d),
                GovernanceEntry::Validation(v) => validations.push(v),
                GovernanceEntry::Failure(f) => failures.push(f),
            }
        }

        let agents_involved: BTreeSet<String> = decisions.iter().map(|d| d.agent.clone()).collect();
        let total_decisions = decisions.len();
        let average_confidence = if total_decisions == 0 {
            0.0
        } else {
            decisions.iter().map(|d| d.confidence).sum::<f64>() / total_decisions as f64
        };
        let failed_validations = validations.iter().filter(|v| !v.passed).count();
        let status = if failed_validations == 0 && failures.is_empty() {
            "PASS".to_string()
        } else {
            final_status.to_string()
        };

        let doc = GovernanceDocument {
            governance_version: "1.0".to_string(),
            pipeline_start: self.pipeline_start,
            decisions,
            validations,
            failures,
            summary: GovernanceSummary {
                agents_involved: agents_involved.into_iter().collect(),
                total_decisions,
                average_confidence,
                failed_validations,
                status,
            },
        };
        serde_json::to_string_pretty(&doc)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct GovernanceDocument {
    governance_version: String,
    pipeline_start: DateTime<Utc>,
    decisions: Vec<Decision>,
    validations: Vec<Validation>,
    failures: Vec<Failure>,
    summary: GovernanceSummary,
}

#[derive(Debug, Serialize, Deserialize)]
struct GovernanceSummary {
    agents_involved: Vec<String>,
    total_decisions: usize,
    average_confidence: f64,
    failed_validations: usize,
    status: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logs_accumulate_in_order() {
        let log = GovernanceLog::new();
        log.log_decision("identification", "approved scenario set", 0.85);
        log.log_validation("syntax", true, "parsed cleanly");
        log.log_failure(FailureReason::Hallucination, "unknown symbol foo", 2);

        let entries = log.entries();
        assert_eq!(entries.len(), 3);
        assert!(matches!(entries[0], GovernanceEntry::Decision(_)));
        assert!(matches!(entries[1], GovernanceEntry::Validation(_)));
        assert!(matches!(entries[2], GovernanceEntry::Failure(_)));
    }

    #[test]
    fn to_json_produces_valid_json_with_rollup_summary() {
        let log = GovernanceLog::new();
        log.log_decision("implementation", "wrote test file", 0.5);
        log.log_decision("implementation", "wrote test file", 1.0);
        let json = log.to_json("REVIEW_NEEDED").unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["governance_version"], "1.0");
        assert_eq!(parsed["summary"]["total_decisions"], 2);
        assert_eq!(parsed["summary"]["average_confidence"], 0.75);
        assert_eq!(parsed["summary"]["status"], "PASS");
    }

    #[test]
    fn status_is_review_needed_when_a_validation_failed() {
        let log = GovernanceLog::new();
        log.log_validation("syntax", false, "bad");
        let json = log.to_json("REVIEW_NEEDED").unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["summary"]["status"], "REVIEW_NEEDED");
    }
}
