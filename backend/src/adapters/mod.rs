//! Contract between the engine and external scanning tools.
//!
//! An adapter launches its tool against a target (`submit`), waits for the
//! job (`await_result`) and translates each raw record the tool emitted into
//! a normalized finding (`normalize`). The engine only ever sees this trait.

mod mock;
mod nikto;
mod nmap;
mod process;
mod queued;
mod sqlmap;

pub use mock::MockAdapter;
pub use nikto::NiktoAdapter;
pub use nmap::NmapAdapter;
pub use queued::QueuedAdapter;
pub use sqlmap::SqlmapAdapter;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::time::Duration;
use tracing::warn;
use url::Url;
use uuid::Uuid;

use crate::models::{FailureKind, Finding, ScanId, Severity};

/// One tool-specific record, opaque to the engine.
pub type RawRecord = Value;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobHandle {
    pub tool: String,
    pub job_id: Uuid,
}

impl JobHandle {
    pub fn new(tool: &str) -> Self {
        Self {
            tool: tool.to_string(),
            job_id: Uuid::new_v4(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolFailure {
    pub kind: FailureKind,
    pub detail: String,
}

impl ToolFailure {
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn tool_error(detail: impl Into<String>) -> Self {
        Self::new(FailureKind::ToolError, detail)
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            FailureKind::Timeout,
            format!("no result after {}s", after.as_secs()),
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolResult {
    Success(Vec<RawRecord>),
    Failure(ToolFailure),
}

impl ToolResult {
    pub fn failure(kind: FailureKind, detail: impl Into<String>) -> Self {
        ToolResult::Failure(ToolFailure::new(kind, detail))
    }
}

/// Engine-facing shape of a single vulnerability, before it is bound to a scan.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedFinding {
    pub severity: Severity,
    pub vulnerability_type: String,
    pub description: String,
    pub remediation: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    Finding(NormalizedFinding),
    Dropped(String),
}

#[async_trait]
pub trait ToolAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Overrides the engine's default await timeout for this tool.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    async fn submit(&self, target: &Url) -> Result<JobHandle, ToolFailure>;

    async fn await_result(&self, handle: &JobHandle, timeout: Duration) -> ToolResult;

    /// Release whatever the job still holds after the engine gave up on it.
    async fn abandon(&self, _handle: &JobHandle) {}

    fn normalize(&self, record: &RawRecord) -> Normalized;
}

/// Map every raw record to exactly one finding, or drop it with a logged reason.
pub fn normalize_records(
    adapter: &dyn ToolAdapter,
    scan_id: ScanId,
    records: Vec<RawRecord>,
) -> (Vec<Finding>, usize) {
    let mut findings = Vec::with_capacity(records.len());
    let mut dropped = 0;

    for record in records {
        match adapter.normalize(&record) {
            Normalized::Finding(normalized) => findings.push(Finding {
                id: Uuid::new_v4(),
                scan_id,
                tool: adapter.name().to_string(),
                severity: normalized.severity,
                vulnerability_type: normalized.vulnerability_type,
                description: normalized.description,
                remediation: normalized.remediation,
                raw: record,
                found_at: Utc::now(),
            }),
            Normalized::Dropped(reason) => {
                dropped += 1;
                warn!(
                    scan_id = %scan_id,
                    tool = adapter.name(),
                    reason = %reason,
                    "Dropped raw tool record"
                );
            }
        }
    }

    (findings, dropped)
}

/// Shared reading of `{type, description, severity, remediation}` records.
/// A missing severity falls back to `default_severity`; an unrecognized one drops the record.
pub(crate) fn normalize_labeled(
    record: &RawRecord,
    default_type: &str,
    default_severity: Severity,
    default_remediation: Option<&str>,
) -> Normalized {
    let Some(object) = record.as_object() else {
        return Normalized::Dropped("record is not an object".to_string());
    };

    let severity = match object.get("severity").and_then(Value::as_str) {
        Some(label) => match Severity::from_label(label) {
            Some(severity) => severity,
            None => return Normalized::Dropped(format!("unknown severity {label:?}")),
        },
        None => default_severity,
    };

    let text = |key: &str| {
        object
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    Normalized::Finding(NormalizedFinding {
        severity,
        vulnerability_type: text("type").unwrap_or_else(|| default_type.to_string()),
        description: text("description").unwrap_or_default(),
        remediation: text("remediation").or_else(|| default_remediation.map(str::to_string)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_records_is_total() {
        let adapter = MockAdapter::succeeding("mock", vec![]);
        let scan_id = Uuid::new_v4();
        let records = vec![
            json!({"severity": "high", "type": "XSS"}),
            json!("not an object"),
            json!({"severity": "apocalyptic"}),
            json!({"type": "Header"}),
        ];

        let (findings, dropped) = normalize_records(&adapter, scan_id, records);
        assert_eq!(findings.len() + dropped, 4);
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[0].severity, Severity::High);
        assert_eq!(findings[0].vulnerability_type, "XSS");
        assert_eq!(findings[0].tool, "mock");
        assert_eq!(findings[0].scan_id, scan_id);
        assert_eq!(findings[1].severity, Severity::Medium);
    }

    #[test]
    fn test_normalize_labeled_defaults() {
        let result = normalize_labeled(
            &json!({"description": "  outdated server  "}),
            "Web Vulnerability",
            Severity::Medium,
            Some("Patch it"),
        );
        assert_eq!(
            result,
            Normalized::Finding(NormalizedFinding {
                severity: Severity::Medium,
                vulnerability_type: "Web Vulnerability".to_string(),
                description: "outdated server".to_string(),
                remediation: Some("Patch it".to_string()),
            })
        );
    }
}
