use redis::{AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Job handed to a remote scanner worker.
#[derive(Debug, Serialize, Deserialize)]
pub struct JobPayload {
    pub job_id: String,
    pub tool: String,
    pub target: String,
    pub options: JobOptions,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JobOptions {
    pub max_duration: u64,
}

/// Workers pop `scan:jobs`, report progress in `scan:status:{id}` (with a
/// `state` field) and leave a JSON array of records in `scan:results:{id}`.
pub struct RedisQueue {
    client: Client,
}

impl RedisQueue {
    pub fn new(url: &str) -> anyhow::Result<Self> {
        let client = Client::open(url)?;
        Ok(Self { client })
    }

    pub async fn enqueue_job(&self, payload: &JobPayload) -> anyhow::Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let json = serde_json::to_string(payload)?;

        // Details, in-flight marker and queue entry land together
        let _: () = redis::pipe()
            .atomic()
            .hset("scan:job_details", &payload.job_id, &json)
            .hset("scan:inflight", &payload.job_id, &payload.tool)
            .lpush("scan:jobs", &json)
            .query_async(&mut conn)
            .await?;

        Ok(())
    }

    pub async fn get_job_status(&self, job_id: &str) -> anyhow::Result<Option<HashMap<String, String>>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let key = format!("scan:status:{}", job_id);
        let status: HashMap<String, String> = conn.hgetall(key).await?;

        if status.is_empty() {
            Ok(None)
        } else {
            Ok(Some(status))
        }
    }

    pub async fn get_job_results(&self, job_id: &str) -> anyhow::Result<Vec<serde_json::Value>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let key = format!("scan:results:{}", job_id);
        let raw: Option<String> = conn.get(key).await?;

        match raw {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(Vec::new()),
        }
    }

    /// Drop the in-flight marker once the engine is done with a job.
    pub async fn finish_job(&self, job_id: &str) -> anyhow::Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: () = redis::pipe()
            .atomic()
            .hdel("scan:inflight", job_id)
            .hdel("scan:job_details", job_id)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn cancel_job(&self, job_id: &str) -> anyhow::Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: () = redis::pipe()
            .atomic()
            .hset(format!("scan:status:{}", job_id), "state", "cancelled")
            .hdel("scan:inflight", job_id)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn get_active_jobs(&self) -> anyhow::Result<Vec<HashMap<String, String>>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let inflight: HashMap<String, String> = conn.hgetall("scan:inflight").await?;

        let mut active = vec![];
        for (job_id, tool) in inflight {
            let mut status = self.get_job_status(&job_id).await?.unwrap_or_default();
            status.insert("job_id".to_string(), job_id);
            status.insert("tool".to_string(), tool);
            active.push(status);
        }
        Ok(active)
    }
}
