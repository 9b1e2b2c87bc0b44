use async_trait::async_trait;
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::process::ProcessJobs;
use super::{normalize_labeled, JobHandle, Normalized, RawRecord, ToolAdapter, ToolFailure, ToolResult};
use crate::models::Severity;

const REMEDIATION: &str = "Use parameterized queries and input validation";

pub struct SqlmapAdapter {
    jobs: ProcessJobs,
    timeout: Option<Duration>,
}

impl SqlmapAdapter {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self::with_program("sqlmap", timeout)
    }

    /// Run a sqlmap binary from a specific path.
    pub fn with_program(program: impl Into<String>, timeout: Option<Duration>) -> Self {
        Self {
            jobs: ProcessJobs::new(program),
            timeout,
        }
    }

    fn output_dir(handle: &JobHandle) -> PathBuf {
        std::env::temp_dir().join(format!("sqlmap-{}", handle.job_id))
    }

    async fn remove_output_dir(handle: &JobHandle) {
        let dir = Self::output_dir(handle);
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            debug!(path = %dir.display(), error = %e, "Sqlmap output not removed");
        }
    }
}

#[async_trait]
impl ToolAdapter for SqlmapAdapter {
    fn name(&self) -> &str {
        "sqlmap"
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    async fn submit(&self, target: &Url) -> Result<JobHandle, ToolFailure> {
        let handle = JobHandle::new(self.name());
        let output_dir = Self::output_dir(&handle);
        let args = vec![
            "-u".to_string(),
            target.to_string(),
            "--batch".to_string(),
            "--level=2".to_string(),
            "--risk=1".to_string(),
            format!("--output-dir={}", output_dir.display()),
        ];
        self.jobs.spawn(handle, &args)
    }

    async fn await_result(&self, handle: &JobHandle, _timeout: Duration) -> ToolResult {
        let output = self.jobs.wait(handle).await;
        Self::remove_output_dir(handle).await;
        let output = match output {
            Ok(output) => output,
            Err(failure) => return ToolResult::Failure(failure),
        };

        if output.code != Some(0) && output.stdout.trim().is_empty() {
            return ToolResult::Failure(ToolFailure::tool_error(output.failure_detail("sqlmap")));
        }
        ToolResult::Success(parse_output(&output.stdout))
    }

    async fn abandon(&self, handle: &JobHandle) {
        self.jobs.abandon(handle).await;
        Self::remove_output_dir(handle).await;
    }

    fn normalize(&self, record: &RawRecord) -> Normalized {
        normalize_labeled(record, "SQL Injection", Severity::High, Some(REMEDIATION))
    }
}

/// sqlmap has no machine-readable console output; lines mentioning an
/// injection are taken as findings once the run reports anything vulnerable.
pub(crate) fn parse_output(stdout: &str) -> Vec<RawRecord> {
    if !stdout.to_lowercase().contains("vulnerable") {
        return Vec::new();
    }

    stdout
        .lines()
        .map(str::trim)
        .filter(|line| {
            let lower = line.to_lowercase();
            lower.contains("vulnerable") || lower.contains("injection")
        })
        .map(|line| {
            json!({
                "type": "SQL Injection",
                "description": line,
                "severity": "high",
            })
        })
        .collect()
}
