use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use url::Url;

use super::{normalize_labeled, JobHandle, Normalized, RawRecord, ToolAdapter, ToolFailure, ToolResult};
use crate::models::{FailureKind, Severity};

/// Scripted adapter with a fixed outcome and latency. Used by the test suite
/// and by `SCANNER_TOOLS=mock` for running the service without scanner binaries.
pub struct MockAdapter {
    name: String,
    result: ToolResult,
    delay: Duration,
    submit_failure: Option<ToolFailure>,
    submitted: AtomicUsize,
    abandoned: AtomicUsize,
}

impl MockAdapter {
    pub fn succeeding(name: &str, records: Vec<RawRecord>) -> Self {
        Self::with_result(name, ToolResult::Success(records))
    }

    pub fn failing(name: &str, kind: FailureKind) -> Self {
        Self::with_result(name, ToolResult::failure(kind, format!("{name} failed")))
    }

    pub fn with_result(name: &str, result: ToolResult) -> Self {
        Self {
            name: name.to_string(),
            result,
            delay: Duration::ZERO,
            submit_failure: None,
            submitted: AtomicUsize::new(0),
            abandoned: AtomicUsize::new(0),
        }
    }

    /// A canned web finding set, handy for demos.
    pub fn demo(name: &str) -> Self {
        Self::succeeding(
            name,
            vec![
                serde_json::json!({
                    "type": "Missing Security Header",
                    "description": "X-Frame-Options header is not present",
                    "severity": "low",
                }),
                serde_json::json!({
                    "type": "Outdated Server",
                    "description": "Server banner reports an end-of-life version",
                    "severity": "medium",
                }),
            ],
        )
        .with_delay(Duration::from_millis(500))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn rejecting_submit(mut self, kind: FailureKind) -> Self {
        self.submit_failure = Some(ToolFailure::new(kind, format!("{} refused target", self.name)));
        self
    }

    pub fn submit_count(&self) -> usize {
        self.submitted.load(Ordering::SeqCst)
    }

    pub fn abandon_count(&self) -> usize {
        self.abandoned.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ToolAdapter for MockAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn submit(&self, _target: &Url) -> Result<JobHandle, ToolFailure> {
        self.submitted.fetch_add(1, Ordering::SeqCst);
        match &self.submit_failure {
            Some(failure) => Err(failure.clone()),
            None => Ok(JobHandle::new(&self.name)),
        }
    }

    async fn await_result(&self, _handle: &JobHandle, _timeout: Duration) -> ToolResult {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.result.clone()
    }

    async fn abandon(&self, _handle: &JobHandle) {
        self.abandoned.fetch_add(1, Ordering::SeqCst);
    }

    fn normalize(&self, record: &RawRecord) -> Normalized {
        normalize_labeled(record, "Mock Finding", Severity::Medium, None)
    }
}
