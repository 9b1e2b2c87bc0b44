use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use url::Url;

use super::{normalize_labeled, JobHandle, Normalized, RawRecord, ToolAdapter, ToolFailure, ToolResult};
use crate::models::Severity;
use crate::redis_queue::{JobOptions, JobPayload, RedisQueue};

/// Dispatches a tool to remote workers through the Redis job queue.
pub struct QueuedAdapter {
    tool: String,
    queue: Arc<RedisQueue>,
    poll_interval: Duration,
    timeout: Option<Duration>,
}

impl QueuedAdapter {
    pub fn new(tool: &str, queue: Arc<RedisQueue>, poll_interval: Duration) -> Self {
        Self {
            tool: tool.to_string(),
            queue,
            poll_interval,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    async fn fetch_results(&self, job_id: &str) -> ToolResult {
        let result = match self.queue.get_job_results(job_id).await {
            Ok(records) => ToolResult::Success(records),
            Err(e) => ToolResult::Failure(ToolFailure::tool_error(format!(
                "Unreadable results for job {job_id}: {e:#}"
            ))),
        };
        if let Err(e) = self.queue.finish_job(job_id).await {
            warn!(tool = %self.tool, job_id, error = %e, "Failed to clear finished job");
        }
        result
    }
}

#[async_trait]
impl ToolAdapter for QueuedAdapter {
    fn name(&self) -> &str {
        &self.tool
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    async fn submit(&self, target: &Url) -> Result<JobHandle, ToolFailure> {
        let handle = JobHandle::new(&self.tool);
        let payload = JobPayload {
            job_id: handle.job_id.to_string(),
            tool: self.tool.clone(),
            target: target.to_string(),
            options: JobOptions {
                max_duration: self.timeout.map(|t| t.as_secs()).unwrap_or_default(),
            },
        };

        self.queue
            .enqueue_job(&payload)
            .await
            .map_err(|e| ToolFailure::tool_error(format!("Failed to enqueue {} job: {e:#}", self.tool)))?;
        debug!(tool = %self.tool, job_id = %handle.job_id, "Enqueued remote scan job");
        Ok(handle)
    }

    async fn await_result(&self, handle: &JobHandle, timeout: Duration) -> ToolResult {
        let job_id = handle.job_id.to_string();
        let deadline = Instant::now() + timeout;

        loop {
            match self.queue.get_job_status(&job_id).await {
                Ok(Some(status)) => match status.get("state").map(String::as_str) {
                    Some("completed") => return self.fetch_results(&job_id).await,
                    Some("failed") => {
                        let detail = status
                            .get("error")
                            .cloned()
                            .unwrap_or_else(|| format!("{} worker reported failure", self.tool));
                        return ToolResult::Failure(ToolFailure::tool_error(detail));
                    }
                    _ => {}
                },
                Ok(None) => {}
                Err(e) => {
                    return ToolResult::Failure(ToolFailure::tool_error(format!(
                        "Job status unavailable: {e:#}"
                    )))
                }
            }

            if Instant::now() + self.poll_interval > deadline {
                return ToolResult::Failure(ToolFailure::timeout(timeout));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn abandon(&self, handle: &JobHandle) {
        if let Err(e) = self.queue.cancel_job(&handle.job_id.to_string()).await {
            warn!(tool = %self.tool, job_id = %handle.job_id, error = %e, "Failed to cancel remote job");
        }
    }

    fn normalize(&self, record: &RawRecord) -> Normalized {
        normalize_labeled(record, "Web Vulnerability", Severity::Medium, None)
    }
}
