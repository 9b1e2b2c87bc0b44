use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::process::ProcessJobs;
use super::{normalize_labeled, JobHandle, Normalized, RawRecord, ToolAdapter, ToolFailure, ToolResult};
use crate::models::Severity;

const REMEDIATION: &str = "Update software and configure security headers";

pub struct NiktoAdapter {
    jobs: ProcessJobs,
    timeout: Option<Duration>,
}

impl NiktoAdapter {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self::with_program("nikto", timeout)
    }

    /// Run a nikto binary from a specific path.
    pub fn with_program(program: impl Into<String>, timeout: Option<Duration>) -> Self {
        Self {
            jobs: ProcessJobs::new(program),
            timeout,
        }
    }

    fn report_path(handle: &JobHandle) -> PathBuf {
        std::env::temp_dir().join(format!("nikto-{}.json", handle.job_id))
    }
}

#[async_trait]
impl ToolAdapter for NiktoAdapter {
    fn name(&self) -> &str {
        "nikto"
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    async fn submit(&self, target: &Url) -> Result<JobHandle, ToolFailure> {
        let handle = JobHandle::new(self.name());
        let args = vec![
            "-h".to_string(),
            target.to_string(),
            "-ask".to_string(),
            "no".to_string(),
            "-o".to_string(),
            Self::report_path(&handle).display().to_string(),
            "-Format".to_string(),
            "json".to_string(),
        ];
        self.jobs.spawn(handle, &args)
    }

    async fn await_result(&self, handle: &JobHandle, _timeout: Duration) -> ToolResult {
        let output = match self.jobs.wait(handle).await {
            Ok(output) => output,
            Err(failure) => return ToolResult::Failure(failure),
        };

        let path = Self::report_path(handle);
        let report = tokio::fs::read_to_string(&path).await;
        if let Err(e) = tokio::fs::remove_file(&path).await {
            debug!(path = %path.display(), error = %e, "Nikto report not removed");
        }

        match report {
            Ok(contents) => ToolResult::Success(parse_report(&contents)),
            Err(_) => ToolResult::Failure(ToolFailure::tool_error(output.failure_detail("nikto"))),
        }
    }

    async fn abandon(&self, handle: &JobHandle) {
        self.jobs.abandon(handle).await;
        let _ = tokio::fs::remove_file(Self::report_path(handle)).await;
    }

    fn normalize(&self, record: &RawRecord) -> Normalized {
        normalize_labeled(record, "Web Vulnerability", Severity::Medium, Some(REMEDIATION))
    }
}

/// Nikto's JSON is either one host object or an array of them, each with a
/// `vulnerabilities` list. Entries use `msg` where older reports used `description`.
pub(crate) fn parse_report(contents: &str) -> Vec<RawRecord> {
    let data: Value = match serde_json::from_str(contents) {
        Ok(data) => data,
        Err(_) => {
            if contents.contains("ERROR") || contents.contains("OSVDB") {
                return vec![json!({
                    "type": "Web Vulnerability",
                    "description": "Nikto found potential issues",
                    "severity": "medium",
                })];
            }
            return Vec::new();
        }
    };

    let hosts = match data {
        Value::Array(hosts) => hosts,
        other => vec![other],
    };

    hosts
        .iter()
        .filter_map(|host| host.get("vulnerabilities").and_then(Value::as_array))
        .flatten()
        .map(|entry| {
            let field = |key: &str| entry.get(key).cloned().unwrap_or(Value::Null);
            let description = entry
                .get("description")
                .or_else(|| entry.get("msg"))
                .cloned()
                .unwrap_or(Value::Null);
            let mut record = json!({
                "type": field("type"),
                "description": description,
                "url": field("url"),
            });
            if let Some(severity) = entry.get("severity") {
                record["severity"] = severity.clone();
            }
            if let Some(id) = entry.get("id") {
                record["id"] = id.clone();
            }
            record
        })
        .collect()
}
