use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

pub type AccountId = Uuid;
pub type ScanId = Uuid;
pub type FindingId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 4] = [
        Severity::Low,
        Severity::Medium,
        Severity::High,
        Severity::Critical,
    ];

    /// Weight used by the risk score.
    pub fn weight(self) -> u32 {
        match self {
            Severity::Critical => 10,
            Severity::High => 7,
            Severity::Medium => 4,
            Severity::Low => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    /// Parse a tool's severity label. Informational findings count as low.
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "critical" | "crit" => Some(Severity::Critical),
            "high" => Some(Severity::High),
            "medium" | "moderate" | "med" => Some(Severity::Medium),
            "low" | "info" | "informational" => Some(Severity::Low),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ScanStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ScanStatus::Completed | ScanStatus::Failed)
    }

    /// Legal lifecycle edges. Pending may fail directly (dispatch-time
    /// validation, cancellation before dispatch) but never complete.
    pub fn can_transition_to(self, next: ScanStatus) -> bool {
        matches!(
            (self, next),
            (ScanStatus::Pending, ScanStatus::Running)
                | (ScanStatus::Pending, ScanStatus::Failed)
                | (ScanStatus::Running, ScanStatus::Completed)
                | (ScanStatus::Running, ScanStatus::Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Pending => "pending",
            ScanStatus::Running => "running",
            ScanStatus::Completed => "completed",
            ScanStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    AllToolsFailed,
    InvalidTarget,
    Cancelled,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::AllToolsFailed => "all_tools_failed",
            FailureReason::InvalidTarget => "invalid_target",
            FailureReason::Cancelled => "cancelled",
        }
    }
}

/// Why a single adapter produced no usable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    InvalidTarget,
    Timeout,
    ToolError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "kind", rename_all = "snake_case")]
pub enum ToolRunState {
    Dispatched,
    Succeeded,
    Failed(FailureKind),
}

/// One dispatched adapter's contribution to a scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRun {
    pub tool: String,
    #[serde(flatten)]
    pub state: ToolRunState,
    pub findings: usize,
    pub dropped: usize,
    pub detail: Option<String>,
    pub elapsed_ms: Option<u64>,
}

impl ToolRun {
    pub fn dispatched(tool: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            state: ToolRunState::Dispatched,
            findings: 0,
            dropped: 0,
            detail: None,
            elapsed_ms: None,
        }
    }

    pub fn has_returned(&self) -> bool {
        self.state != ToolRunState::Dispatched
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self.state, ToolRunState::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub is_guest: bool,
    /// Only meaningful for guests.
    pub scan_quota_remaining: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scan {
    pub id: ScanId,
    pub account_id: AccountId,
    pub target_url: String,
    pub status: ScanStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failure: Option<FailureReason>,
    pub tools: Vec<ToolRun>,
}

impl Scan {
    pub fn new(account_id: AccountId, target_url: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            account_id,
            target_url: target_url.into(),
            status: ScanStatus::Pending,
            started_at: Utc::now(),
            finished_at: None,
            failure: None,
            tools: Vec::new(),
        }
    }

    /// Share of dispatched tools that have returned, as a percentage.
    pub fn progress(&self) -> u8 {
        match self.status {
            ScanStatus::Pending => 0,
            ScanStatus::Completed | ScanStatus::Failed => 100,
            ScanStatus::Running if self.tools.is_empty() => 0,
            ScanStatus::Running => {
                let returned = self.tools.iter().filter(|t| t.has_returned()).count();
                (returned * 100 / self.tools.len()) as u8
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub id: FindingId,
    pub scan_id: ScanId,
    pub tool: String,
    pub severity: Severity,
    pub vulnerability_type: String,
    pub description: String,
    pub remediation: Option<String>,
    /// Raw tool record, opaque to the engine.
    pub raw: serde_json::Value,
    pub found_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub counts: BTreeMap<Severity, usize>,
    pub total: usize,
    pub risk: f64,
    pub level: Option<Severity>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub scan: Scan,
    pub progress: u8,
    pub findings: Vec<Finding>,
    pub risk: RiskAssessment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Remaining {
    Unlimited,
    Limited(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaView {
    pub is_guest: bool,
    pub remaining: Remaining,
}

#[derive(Debug, Deserialize)]
pub struct SubmitScanInput {
    pub account_id: AccountId,
    pub target_url: String,
}

#[derive(Debug, Serialize)]
pub struct SubmitScanOutput {
    pub scan_id: ScanId,
}

#[derive(Debug, Deserialize)]
pub struct CreateAccountInput {
    #[serde(default)]
    pub is_guest: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        assert!(ScanStatus::Pending.can_transition_to(ScanStatus::Running));
        assert!(ScanStatus::Pending.can_transition_to(ScanStatus::Failed));
        assert!(ScanStatus::Running.can_transition_to(ScanStatus::Completed));
        assert!(!ScanStatus::Pending.can_transition_to(ScanStatus::Completed));
        assert!(!ScanStatus::Completed.can_transition_to(ScanStatus::Failed));
        assert!(!ScanStatus::Failed.can_transition_to(ScanStatus::Running));
        assert!(!ScanStatus::Running.can_transition_to(ScanStatus::Pending));
    }

    #[test]
    fn test_severity_labels() {
        assert_eq!(Severity::from_label("HIGH"), Some(Severity::High));
        assert_eq!(Severity::from_label(" info "), Some(Severity::Low));
        assert_eq!(Severity::from_label("moderate"), Some(Severity::Medium));
        assert_eq!(Severity::from_label("bogus"), None);
    }

    #[test]
    fn test_progress() {
        let mut scan = Scan::new(Uuid::new_v4(), "http://x.com");
        assert_eq!(scan.progress(), 0);

        scan.status = ScanStatus::Running;
        scan.tools = vec![
            ToolRun::dispatched("a"),
            ToolRun::dispatched("b"),
            ToolRun::dispatched("c"),
            ToolRun::dispatched("d"),
        ];
        scan.tools[0].state = ToolRunState::Succeeded;
        assert_eq!(scan.progress(), 25);

        scan.status = ScanStatus::Completed;
        assert_eq!(scan.progress(), 100);
    }

    #[test]
    fn test_tool_run_serialization() {
        let mut run = ToolRun::dispatched("nmap");
        run.state = ToolRunState::Failed(FailureKind::Timeout);
        let json = serde_json::to_value(&run).unwrap();
        assert_eq!(json["state"], "failed");
        assert_eq!(json["kind"], "timeout");
        assert_eq!(json["tool"], "nmap");
    }
}
