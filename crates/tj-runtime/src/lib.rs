#![forbid(unsafe_code)]

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeMode {
    Strict,
    Hardened,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    Allow,
    Reject,
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    EmptySource,
    JoinCardinality,
    KeyspaceSynthesis,
    NullKeys,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinIssue {
    pub kind: IssueKind,
    pub subject: String,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub ts_unix_ms: u64,
    pub mode: RuntimeMode,
    pub action: DecisionAction,
    pub issue: JoinIssue,
}

/// Every decision taken during one join, in the order it was taken.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceLedger {
    records: Vec<DecisionRecord>,
}

impl EvidenceLedger {
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
        }
    }

    pub fn push(&mut self, record: DecisionRecord) {
        self.records.push(record);
    }

    #[must_use]
    pub fn records(&self) -> &[DecisionRecord] {
        &self.records
    }

    #[must_use]
    pub fn count(&self, kind: IssueKind) -> usize {
        self.records
            .iter()
            .filter(|record| record.issue.kind == kind)
            .count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimePolicy {
    pub mode: RuntimeMode,
    /// Largest row count a single merge step may materialize.
    pub join_row_cap: Option<usize>,
}

impl RuntimePolicy {
    #[must_use]
    pub fn strict() -> Self {
        Self {
            mode: RuntimeMode::Strict,
            join_row_cap: None,
        }
    }

    #[must_use]
    pub fn hardened(join_row_cap: Option<usize>) -> Self {
        Self {
            mode: RuntimeMode::Hardened,
            join_row_cap,
        }
    }

    /// A source without data rows is always skipped; the run continues with
    /// the remaining sources.
    pub fn decide_empty_source(
        &self,
        source: &str,
        detail: impl Into<String>,
        ledger: &mut EvidenceLedger,
    ) -> DecisionAction {
        let detail = detail.into();
        warn!(source, %detail, "skipping empty input source");
        self.record(
            ledger,
            DecisionAction::Skip,
            JoinIssue {
                kind: IssueKind::EmptySource,
                subject: source.to_owned(),
                detail,
            },
        )
    }

    /// Admits a merge step by its exact output size. Only a hardened policy
    /// with a cap ever rejects.
    pub fn decide_join_admission(
        &self,
        source: &str,
        estimated_rows: usize,
        ledger: &mut EvidenceLedger,
    ) -> DecisionAction {
        let over_cap = matches!(self.mode, RuntimeMode::Hardened)
            && self.join_row_cap.is_some_and(|cap| estimated_rows > cap);
        let action = if over_cap {
            warn!(source, estimated_rows, cap = ?self.join_row_cap, "merge step exceeds row cap");
            DecisionAction::Reject
        } else {
            debug!(source, estimated_rows, "merge step admitted");
            DecisionAction::Allow
        };
        self.record(
            ledger,
            action,
            JoinIssue {
                kind: IssueKind::JoinCardinality,
                subject: source.to_owned(),
                detail: format!("estimated_rows={estimated_rows}"),
            },
        )
    }

    pub fn note_keyspace_synthesis(
        &self,
        distinct_keys: usize,
        synthesized_rows: usize,
        ledger: &mut EvidenceLedger,
    ) -> DecisionAction {
        info!(distinct_keys, synthesized_rows, "outer join keyspace built");
        self.record(
            ledger,
            DecisionAction::Allow,
            JoinIssue {
                kind: IssueKind::KeyspaceSynthesis,
                subject: "keyspace".to_owned(),
                detail: format!("distinct_keys={distinct_keys} synthesized_rows={synthesized_rows}"),
            },
        )
    }

    pub fn note_null_keys(
        &self,
        source: &str,
        skipped_rows: usize,
        ledger: &mut EvidenceLedger,
    ) -> DecisionAction {
        debug!(source, skipped_rows, "rows with empty keys excluded from matching");
        self.record(
            ledger,
            DecisionAction::Skip,
            JoinIssue {
                kind: IssueKind::NullKeys,
                subject: source.to_owned(),
                detail: format!("skipped_rows={skipped_rows}"),
            },
        )
    }

    fn record(
        &self,
        ledger: &mut EvidenceLedger,
        action: DecisionAction,
        issue: JoinIssue,
    ) -> DecisionAction {
        ledger.push(DecisionRecord {
            ts_unix_ms: now_unix_ms().unwrap_or_default(),
            mode: self.mode,
            action,
            issue,
        });
        action
    }
}

impl Default for RuntimePolicy {
    fn default() -> Self {
        Self::strict()
    }
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("system clock is before UNIX_EPOCH")]
    ClockSkew,
}

fn now_unix_ms() -> Result<u64, RuntimeError> {
    let ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| RuntimeError::ClockSkew)?
        .as_millis();
    Ok(ms as u64)
}

#[cfg(test)]
mod tests {
    use super::{DecisionAction, EvidenceLedger, IssueKind, RuntimeMode, RuntimePolicy};

    #[test]
    fn strict_policy_admits_any_cardinality() {
        let policy = RuntimePolicy::strict();
        let mut ledger = EvidenceLedger::new();
        let action = policy.decide_join_admission("b.csv", usize::MAX, &mut ledger);
        assert_eq!(action, DecisionAction::Allow);
        assert_eq!(ledger.records().len(), 1);
        assert_eq!(ledger.records()[0].mode, RuntimeMode::Strict);
    }

    #[test]
    fn hardened_policy_rejects_over_cap() {
        let policy = RuntimePolicy::hardened(Some(10));
        let mut ledger = EvidenceLedger::new();
        assert_eq!(
            policy.decide_join_admission("b.csv", 10, &mut ledger),
            DecisionAction::Allow
        );
        assert_eq!(
            policy.decide_join_admission("b.csv", 11, &mut ledger),
            DecisionAction::Reject
        );
        assert_eq!(ledger.count(IssueKind::JoinCardinality), 2);
        assert_eq!(ledger.records()[1].issue.detail, "estimated_rows=11");
    }

    #[test]
    fn hardened_policy_without_cap_allows() {
        let policy = RuntimePolicy::hardened(None);
        let mut ledger = EvidenceLedger::new();
        assert_eq!(
            policy.decide_join_admission("b.csv", 1_000_000, &mut ledger),
            DecisionAction::Allow
        );
    }

    #[test]
    fn empty_source_is_skipped_and_recorded() {
        let policy = RuntimePolicy::default();
        let mut ledger = EvidenceLedger::new();
        let action = policy.decide_empty_source("empty.csv", "no data rows", &mut ledger);
        assert_eq!(action, DecisionAction::Skip);
        let record = &ledger.records()[0];
        assert_eq!(record.issue.kind, IssueKind::EmptySource);
        assert_eq!(record.issue.subject, "empty.csv");
    }

    #[test]
    fn ledger_serializes_with_snake_case_tags() {
        let policy = RuntimePolicy::strict();
        let mut ledger = EvidenceLedger::new();
        policy.note_keyspace_synthesis(3, 1, &mut ledger);
        let value = serde_json::to_value(&ledger).expect("serialize ledger");
        let record = &value["records"][0];
        assert_eq!(record["mode"], "strict");
        assert_eq!(record["action"], "allow");
        assert_eq!(record["issue"]["kind"], "keyspace_synthesis");
        assert_eq!(
            record["issue"]["detail"],
            "distinct_keys=3 synthesized_rows=1"
        );
    }
}
