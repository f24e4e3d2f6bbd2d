// SPDX-License-Identifier: MIT
//! Consistency validation.
//!
//! The validator folds one cycle's inputs — the service reachability signal
//! and the sample fetch result — into exactly one [`CheckResult`]. What
//! "consistent" means is supplied by the caller as [`ConsistencyRule`]
//! implementations; the validator never hard-codes field semantics.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::error::CheckError;
use crate::probe::ServiceStatus;
use crate::sampler::Sample;

/// Cap on failing rows enumerated in alert detail. Keeps Slack messages readable.
const MAX_REPORTED_VIOLATIONS: usize = 5;

// ─── CheckResult ──────────────────────────────────────────────────────────────

/// Outcome of a single check cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckOutcome {
    /// The service answered and the sample satisfied every rule.
    Ok,
    /// The service answered but the sample violated a consistency rule.
    DataInconsistent,
    /// The service or store could not be reached.
    ServiceUnreachable,
    /// The query failed, timed out, or could not produce a full sample.
    QueryError,
}

impl CheckOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, CheckOutcome::Ok)
    }
}

impl std::fmt::Display for CheckOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckOutcome::Ok => write!(f, "ok"),
            CheckOutcome::DataInconsistent => write!(f, "data_inconsistent"),
            CheckOutcome::ServiceUnreachable => write!(f, "service_unreachable"),
            CheckOutcome::QueryError => write!(f, "query_error"),
        }
    }
}

/// Produced once per cycle by the validator, consumed once by the state machine.
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub outcome: CheckOutcome,
    /// Human-readable diagnostic. Empty for `Ok`.
    pub detail: String,
    pub latency_ms: u64,
    pub checked_at: DateTime<Utc>,
}

impl CheckResult {
    pub fn new(outcome: CheckOutcome, detail: impl Into<String>, latency: Duration) -> Self {
        Self {
            outcome,
            detail: detail.into(),
            latency_ms: latency.as_millis() as u64,
            checked_at: Utc::now(),
        }
    }

    /// Synthetic result for a cycle the scheduler had to cancel.
    pub fn timed_out(budget: Duration) -> Self {
        Self::new(
            CheckOutcome::QueryError,
            CheckError::Timeout(budget).to_string(),
            budget,
        )
    }
}

// ─── ConsistencyRule ──────────────────────────────────────────────────────────

/// One inconsistent row found by a rule.
#[derive(Debug, Clone)]
pub struct Violation {
    pub row_id: i64,
    pub description: String,
}

/// A domain-supplied definition of "consistent".
///
/// Implementations inspect one cycle's sample and report the rows that break
/// the rule. Implementations must be cheap and side-effect free — they run on
/// every cycle.
pub trait ConsistencyRule: Send + Sync {
    fn name(&self) -> &str;
    fn evaluate(&self, sample: &Sample) -> Vec<Violation>;
}

/// Every sampled row's materialized root id must equal the root id the graph
/// currently resolves its supervoxel to. This is the core drift signal: a
/// mismatch means the materialization lagged or diverged from the graph.
pub struct RootMappingRule;

impl ConsistencyRule for RootMappingRule {
    fn name(&self) -> &str {
        "root_mapping"
    }

    fn evaluate(&self, sample: &Sample) -> Vec<Violation> {
        sample
            .rows
            .iter()
            .filter_map(|row| match (row.expected_root_id, row.materialized_root_id) {
                (Some(expected), Some(actual)) if expected != actual => Some(Violation {
                    row_id: row.id,
                    description: format!("materialized root {actual} != expected {expected}"),
                }),
                _ => None,
            })
            .collect()
    }
}

/// Foreign fields a materialized row must always carry. A null here means the
/// materialization dropped or never resolved the reference.
pub struct RequiredFieldsRule;

impl ConsistencyRule for RequiredFieldsRule {
    fn name(&self) -> &str {
        "required_fields"
    }

    fn evaluate(&self, sample: &Sample) -> Vec<Violation> {
        sample
            .rows
            .iter()
            .filter_map(|row| {
                let missing = match (row.supervoxel_id, row.materialized_root_id) {
                    (None, _) => Some("supervoxel_id"),
                    (_, None) => Some("materialized_root_id"),
                    _ => None,
                };
                missing.map(|field| Violation {
                    row_id: row.id,
                    description: format!("{field} is null"),
                })
            })
            .collect()
    }
}

// ─── Validator ────────────────────────────────────────────────────────────────

pub struct Validator {
    rules: Vec<Arc<dyn ConsistencyRule>>,
}

impl Validator {
    pub fn new(rules: Vec<Arc<dyn ConsistencyRule>>) -> Self {
        Self { rules }
    }

    /// The rule set used against a standard materialization datastack.
    pub fn standard() -> Self {
        Self::new(vec![
            Arc::new(RequiredFieldsRule) as Arc<dyn ConsistencyRule>,
            Arc::new(RootMappingRule) as Arc<dyn ConsistencyRule>,
        ])
    }

    /// Fold one cycle's inputs into a single [`CheckResult`].
    pub fn evaluate(
        &self,
        service: &ServiceStatus,
        fetched: Result<Sample, CheckError>,
        latency: Duration,
    ) -> CheckResult {
        if !service.reachable {
            return CheckResult::new(
                CheckOutcome::ServiceUnreachable,
                service.detail.clone(),
                latency,
            );
        }

        let sample = match fetched {
            Ok(sample) => sample,
            Err(err @ CheckError::Connection(_)) => {
                return CheckResult::new(CheckOutcome::ServiceUnreachable, err.to_string(), latency);
            }
            Err(err) => {
                // Query, Timeout, InsufficientData — the store answered the
                // connection but not the question. Detail preserves which.
                return CheckResult::new(CheckOutcome::QueryError, err.to_string(), latency);
            }
        };

        for rule in &self.rules {
            let violations = rule.evaluate(&sample);
            if !violations.is_empty() {
                return CheckResult::new(
                    CheckOutcome::DataInconsistent,
                    format_violations(rule.name(), &violations, sample.len()),
                    latency,
                );
            }
        }

        CheckResult::new(CheckOutcome::Ok, "", latency)
    }
}

fn format_violations(rule: &str, violations: &[Violation], sample_len: usize) -> String {
    let shown = violations
        .iter()
        .take(MAX_REPORTED_VIOLATIONS)
        .map(|v| format!("row {}: {}", v.row_id, v.description))
        .collect::<Vec<_>>()
        .join("; ");
    let suffix = if violations.len() > MAX_REPORTED_VIOLATIONS {
        format!(" (+{} more)", violations.len() - MAX_REPORTED_VIOLATIONS)
    } else {
        String::new()
    };
    format!(
        "rule '{rule}': {}/{sample_len} sampled rows inconsistent — {shown}{suffix}",
        violations.len()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::SampleRow;

    fn reachable() -> ServiceStatus {
        ServiceStatus {
            reachable: true,
            detail: String::new(),
        }
    }

    fn row(id: i64, expected: Option<i64>, actual: Option<i64>) -> SampleRow {
        SampleRow {
            id,
            supervoxel_id: Some(id * 10),
            expected_root_id: expected,
            materialized_root_id: actual,
        }
    }

    fn consistent_sample(n: i64) -> Sample {
        Sample {
            rows: (1..=n).map(|i| row(i, Some(i * 100), Some(i * 100))).collect(),
        }
    }

    #[test]
    fn consistent_sample_is_ok() {
        let result = Validator::standard().evaluate(
            &reachable(),
            Ok(consistent_sample(3)),
            Duration::from_millis(12),
        );
        assert_eq!(result.outcome, CheckOutcome::Ok);
        assert!(result.detail.is_empty());
        assert_eq!(result.latency_ms, 12);
    }

    #[test]
    fn root_mismatch_is_data_inconsistent() {
        let mut sample = consistent_sample(3);
        sample.rows[1].materialized_root_id = Some(999);
        let result =
            Validator::standard().evaluate(&reachable(), Ok(sample), Duration::from_millis(1));
        assert_eq!(result.outcome, CheckOutcome::DataInconsistent);
        assert!(result.detail.contains("root_mapping"));
        assert!(result.detail.contains("row 2"));
    }

    #[test]
    fn null_foreign_field_is_data_inconsistent() {
        let mut sample = consistent_sample(2);
        sample.rows[0].materialized_root_id = None;
        let result =
            Validator::standard().evaluate(&reachable(), Ok(sample), Duration::from_millis(1));
        assert_eq!(result.outcome, CheckOutcome::DataInconsistent);
        assert!(result.detail.contains("required_fields"));
    }

    #[test]
    fn detail_caps_reported_rows() {
        let sample = Sample {
            rows: (1..=20).map(|i| row(i, Some(1), Some(2))).collect(),
        };
        let result =
            Validator::standard().evaluate(&reachable(), Ok(sample), Duration::from_millis(1));
        assert_eq!(result.outcome, CheckOutcome::DataInconsistent);
        assert!(result.detail.contains("20/20"));
        assert!(result.detail.contains("+15 more"));
        // Only the first five rows are enumerated.
        assert!(result.detail.contains("row 5"));
        assert!(!result.detail.contains("row 6:"));
    }

    #[test]
    fn unreachable_service_wins_over_sample() {
        let status = ServiceStatus {
            reachable: false,
            detail: "connect refused".to_string(),
        };
        let result = Validator::standard().evaluate(
            &status,
            Ok(consistent_sample(1)),
            Duration::from_millis(1),
        );
        assert_eq!(result.outcome, CheckOutcome::ServiceUnreachable);
        assert_eq!(result.detail, "connect refused");
    }

    #[test]
    fn connection_error_maps_to_service_unreachable() {
        let result = Validator::standard().evaluate(
            &reachable(),
            Err(CheckError::Connection("no route to host".to_string())),
            Duration::from_millis(1),
        );
        assert_eq!(result.outcome, CheckOutcome::ServiceUnreachable);
    }

    #[test]
    fn query_and_insufficient_data_map_to_query_error() {
        let v = Validator::standard();
        for err in [
            CheckError::Query("syntax error".to_string()),
            CheckError::Timeout(Duration::from_secs(60)),
            CheckError::InsufficientData {
                available: 10,
                requested: 1000,
            },
        ] {
            let detail = err.to_string();
            let result = v.evaluate(&reachable(), Err(err), Duration::from_millis(1));
            assert_eq!(result.outcome, CheckOutcome::QueryError);
            assert_eq!(result.detail, detail);
        }
    }

    #[test]
    fn custom_rule_is_pluggable() {
        struct EvenIdsOnly;
        impl ConsistencyRule for EvenIdsOnly {
            fn name(&self) -> &str {
                "even_ids_only"
            }
            fn evaluate(&self, sample: &Sample) -> Vec<Violation> {
                sample
                    .rows
                    .iter()
                    .filter(|r| r.id % 2 != 0)
                    .map(|r| Violation {
                        row_id: r.id,
                        description: "odd id".to_string(),
                    })
                    .collect()
            }
        }

        let v = Validator::new(vec![Arc::new(EvenIdsOnly)]);
        let result = v.evaluate(
            &reachable(),
            Ok(consistent_sample(3)),
            Duration::from_millis(1),
        );
        assert_eq!(result.outcome, CheckOutcome::DataInconsistent);
        assert!(result.detail.contains("even_ids_only"));
    }
}
