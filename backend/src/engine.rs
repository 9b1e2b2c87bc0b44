//! Scan lifecycle: submission, fan-out to every tool adapter, the join
//! barrier that decides the terminal state, and cancellation.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::adapters::{normalize_records, JobHandle, ToolAdapter, ToolFailure, ToolResult};
use crate::archive::ScanArchive;
use crate::error::{ConfigError, RegistryError, SubmitError};
use crate::models::{
    AccountId, FailureKind, FailureReason, QuotaView, Scan, ScanId, ScanReport, ScanStatus,
    ToolRun, ToolRunState,
};
use crate::quota::{Authorization, DenyReason, QuotaLedger};
use crate::registry::{Completion, ScanRegistry};

const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(300);

/// Accept only absolute `http`/`https` URLs with a host.
pub fn validate_target(raw: &str) -> Result<Url, SubmitError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(SubmitError::invalid_target(raw, "target URL is empty"));
    }

    let url = Url::parse(trimmed).map_err(|e| SubmitError::invalid_target(raw, e.to_string()))?;
    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(SubmitError::invalid_target(
                raw,
                format!("scheme {other:?} is not allowed"),
            ))
        }
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(SubmitError::invalid_target(raw, "target URL has no host"));
    }
    Ok(url)
}

enum AdapterOutcome {
    Returned(ToolResult),
    Cancelled,
}

struct AdapterReturn {
    index: usize,
    outcome: AdapterOutcome,
    returned_at: DateTime<Utc>,
    elapsed: Duration,
}

pub struct ScanEngineBuilder {
    ledger: Arc<QuotaLedger>,
    registry: Arc<ScanRegistry>,
    adapters: Vec<Arc<dyn ToolAdapter>>,
    archive: Option<ScanArchive>,
    default_timeout: Duration,
}

impl ScanEngineBuilder {
    pub fn registry(mut self, registry: Arc<ScanRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn adapter<A: ToolAdapter + 'static>(mut self, adapter: A) -> Self {
        self.adapters.push(Arc::new(adapter));
        self
    }

    pub fn shared_adapter(mut self, adapter: Arc<dyn ToolAdapter>) -> Self {
        self.adapters.push(adapter);
        self
    }

    pub fn archive(mut self, archive: ScanArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<Arc<ScanEngine>, ConfigError> {
        if self.adapters.is_empty() {
            return Err(ConfigError::invalid("adapters", "At least one tool adapter is required"));
        }
        let mut names = HashSet::new();
        for adapter in &self.adapters {
            if !names.insert(adapter.name().to_string()) {
                return Err(ConfigError::invalid(
                    "adapters",
                    format!("Duplicate tool adapter {:?}", adapter.name()),
                ));
            }
        }

        Ok(Arc::new(ScanEngine {
            ledger: self.ledger,
            registry: self.registry,
            adapters: self.adapters,
            archive: self.archive,
            default_timeout: self.default_timeout,
            shutdown: CancellationToken::new(),
            active: Mutex::new(HashMap::new()),
        }))
    }
}

pub struct ScanEngine {
    ledger: Arc<QuotaLedger>,
    registry: Arc<ScanRegistry>,
    adapters: Vec<Arc<dyn ToolAdapter>>,
    archive: Option<ScanArchive>,
    default_timeout: Duration,
    shutdown: CancellationToken,
    active: Mutex<HashMap<ScanId, CancellationToken>>,
}

impl ScanEngine {
    pub fn builder(ledger: Arc<QuotaLedger>) -> ScanEngineBuilder {
        ScanEngineBuilder {
            ledger,
            registry: Arc::new(ScanRegistry::new()),
            adapters: Vec::new(),
            archive: None,
            default_timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    pub fn ledger(&self) -> &QuotaLedger {
        &self.ledger
    }

    pub fn registry(&self) -> &ScanRegistry {
        &self.registry
    }

    pub fn archive(&self) -> Option<&ScanArchive> {
        self.archive.as_ref()
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.adapters.iter().map(|a| a.name()).collect()
    }

    /// Validate, charge quota and create a Pending scan. Dispatch runs in the
    /// background; the id is returned without waiting for any tool.
    pub fn submit(self: &Arc<Self>, account_id: AccountId, target_url: &str) -> Result<ScanId, SubmitError> {
        validate_target(target_url)?;

        match self.ledger.authorize(&account_id) {
            Authorization::Allowed => {}
            Authorization::Denied(DenyReason::QuotaExhausted) => {
                return Err(SubmitError::QuotaExhausted(account_id))
            }
            Authorization::Denied(DenyReason::UnknownAccount) => {
                return Err(SubmitError::UnknownAccount(account_id))
            }
        }

        if self.shutdown.is_cancelled() {
            self.ledger.release(&account_id);
            return Err(SubmitError::ShuttingDown);
        }

        let target = target_url.trim().to_string();
        let scan = self.registry.create(account_id, &target);
        let token = self.shutdown.child_token();
        self.active.lock().insert(scan.id, token.clone());

        info!(scan_id = %scan.id, account_id = %account_id, target = %target, "Scan submitted");
        tokio::spawn(self.clone().run(scan.id, target, token));
        Ok(scan.id)
    }

    pub fn report(&self, scan_id: &ScanId) -> Result<ScanReport, RegistryError> {
        self.registry.get(scan_id)
    }

    pub fn list(&self, account_id: &AccountId) -> Vec<Scan> {
        self.registry.list_by_account(account_id)
    }

    pub fn quota(&self, account_id: &AccountId) -> Option<QuotaView> {
        self.ledger.view(account_id)
    }

    /// Resolve once the scan is Completed or Failed.
    pub async fn wait(&self, scan_id: &ScanId) -> Result<Scan, RegistryError> {
        let mut rx = self.registry.subscribe(scan_id)?;
        let _ = rx.wait_for(|status| status.is_terminal()).await;
        self.registry.scan(scan_id)
    }

    /// Fail a Pending or Running scan and abandon its in-flight tools.
    pub async fn cancel(&self, scan_id: &ScanId) -> Result<Scan, RegistryError> {
        let scan = self.registry.transition(
            scan_id,
            ScanStatus::Failed,
            Utc::now(),
            Some(FailureReason::Cancelled),
        )?;
        let token = self.active.lock().remove(scan_id);
        if let Some(token) = token {
            token.cancel();
        }

        info!(scan_id = %scan_id, "Scan cancelled");
        self.archive_scan(scan_id).await;
        Ok(scan)
    }

    /// Delete a terminal scan and everything recorded for it.
    pub async fn purge(&self, scan_id: &ScanId) -> Result<Scan, RegistryError> {
        let scan = self.registry.purge(scan_id)?;
        if let Some(archive) = &self.archive {
            if let Err(e) = archive.delete(scan_id).await {
                error!(scan_id = %scan_id, error = %e, "Failed to delete archived scan");
            }
        }
        info!(scan_id = %scan_id, "Scan purged");
        Ok(scan)
    }

    /// Stop accepting submissions and cancel every scan still in flight.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let in_flight: Vec<ScanId> = self.active.lock().keys().copied().collect();
        info!(scans = in_flight.len(), "Shutting down scan engine");

        for scan_id in in_flight {
            if let Err(e) = self.cancel(&scan_id).await {
                debug!(scan_id = %scan_id, error = %e, "Scan already finished at shutdown");
            }
        }
    }

    async fn run(self: Arc<Self>, scan_id: ScanId, target: String, token: CancellationToken) {
        let result = self.drive(scan_id, &target, &token).await;
        self.active.lock().remove(&scan_id);

        match result {
            Ok(scan) => {
                info!(
                    scan_id = %scan_id,
                    status = %scan.status,
                    degraded = scan.tools.iter().filter(|t| t.is_degraded()).count(),
                    "Scan finished"
                );
                self.archive_scan(&scan_id).await;
            }
            // Cancellation won the race to a terminal state
            Err(RegistryError::ScanNotMutable { .. }) | Err(RegistryError::InvalidTransition { .. }) => {
                debug!(scan_id = %scan_id, "Scan already terminal, results discarded");
            }
            Err(e) => error!(scan_id = %scan_id, error = %e, "Scan bookkeeping failed"),
        }
    }

    async fn drive(&self, scan_id: ScanId, target: &str, token: &CancellationToken) -> Result<Scan, RegistryError> {
        // Registry records hold the target as text; adapters only ever get a parsed URL
        let url = match validate_target(target) {
            Ok(url) => url,
            Err(e) => {
                warn!(scan_id = %scan_id, error = %e, "Target rejected at dispatch");
                return self.registry.transition(
                    &scan_id,
                    ScanStatus::Failed,
                    Utc::now(),
                    Some(FailureReason::InvalidTarget),
                );
            }
        };

        let runs = self.adapters.iter().map(|a| ToolRun::dispatched(a.name())).collect();
        self.registry.start(&scan_id, runs)?;
        info!(scan_id = %scan_id, tools = self.adapters.len(), "Dispatching tools");

        let mut tasks = JoinSet::new();
        for (index, adapter) in self.adapters.iter().enumerate() {
            let timeout = adapter.timeout().unwrap_or(self.default_timeout);
            tasks.spawn(run_adapter(
                index,
                adapter.clone(),
                url.clone(),
                timeout,
                token.clone(),
            ));
        }

        let mut outstanding: HashSet<usize> = (0..self.adapters.len()).collect();
        let mut findings = Vec::new();
        let mut succeeded = 0usize;
        let mut last_return: Option<DateTime<Utc>> = None;

        while let Some(joined) = tasks.join_next().await {
            let returned = match joined {
                Ok(returned) => returned,
                Err(e) => {
                    error!(scan_id = %scan_id, error = %e, "Tool adapter task aborted");
                    last_return = last_return.max(Some(Utc::now()));
                    continue;
                }
            };
            outstanding.remove(&returned.index);
            last_return = last_return.max(Some(returned.returned_at));

            let adapter = &self.adapters[returned.index];
            let mut run = ToolRun::dispatched(adapter.name());
            run.elapsed_ms = Some(returned.elapsed.as_millis() as u64);

            match returned.outcome {
                AdapterOutcome::Returned(ToolResult::Success(records)) => {
                    let (normalized, dropped) = normalize_records(adapter.as_ref(), scan_id, records);
                    run.state = ToolRunState::Succeeded;
                    run.findings = normalized.len();
                    run.dropped = dropped;
                    findings.extend(normalized);
                    succeeded += 1;
                    debug!(scan_id = %scan_id, tool = adapter.name(), findings = run.findings, "Tool returned");
                }
                AdapterOutcome::Returned(ToolResult::Failure(failure)) => {
                    warn!(
                        scan_id = %scan_id,
                        tool = adapter.name(),
                        kind = ?failure.kind,
                        detail = %failure.detail,
                        "Tool failed, continuing without it"
                    );
                    run.state = ToolRunState::Failed(failure.kind);
                    run.detail = Some(failure.detail);
                }
                AdapterOutcome::Cancelled => continue,
            }

            if let Err(e) = self.registry.record_tool_run(&scan_id, run) {
                debug!(scan_id = %scan_id, error = %e, "Tool run not recorded");
            }
        }

        if token.is_cancelled() {
            return self.registry.transition(
                &scan_id,
                ScanStatus::Failed,
                Utc::now(),
                Some(FailureReason::Cancelled),
            );
        }

        for index in outstanding {
            let mut run = ToolRun::dispatched(self.adapters[index].name());
            run.state = ToolRunState::Failed(FailureKind::ToolError);
            run.detail = Some("adapter task aborted".to_string());
            let _ = self.registry.record_tool_run(&scan_id, run);
        }

        let (status, failure) = if succeeded > 0 {
            (ScanStatus::Completed, None)
        } else {
            (ScanStatus::Failed, Some(FailureReason::AllToolsFailed))
        };

        self.registry.complete(
            &scan_id,
            Completion {
                status,
                finished_at: last_return.unwrap_or_else(Utc::now),
                failure,
                findings,
            },
        )
    }

    async fn archive_scan(&self, scan_id: &ScanId) {
        let Some(archive) = &self.archive else {
            return;
        };
        match self.registry.get(scan_id) {
            Ok(report) => {
                if let Err(e) = archive.record(&report).await {
                    error!(scan_id = %scan_id, error = %e, "Failed to archive scan");
                }
            }
            Err(e) => debug!(scan_id = %scan_id, error = %e, "Nothing to archive"),
        }
    }
}

/// Submit to one adapter and await it under its timeout, giving up early on cancellation.
async fn run_adapter(
    index: usize,
    adapter: Arc<dyn ToolAdapter>,
    target: Url,
    timeout: Duration,
    token: CancellationToken,
) -> AdapterReturn {
    let started = Instant::now();
    let finish = |outcome| AdapterReturn {
        index,
        outcome,
        returned_at: Utc::now(),
        elapsed: started.elapsed(),
    };

    let submitted: Result<JobHandle, ToolFailure> = tokio::select! {
        _ = token.cancelled() => return finish(AdapterOutcome::Cancelled),
        submitted = adapter.submit(&target) => submitted,
    };
    let handle = match submitted {
        Ok(handle) => handle,
        Err(failure) => return finish(AdapterOutcome::Returned(ToolResult::Failure(failure))),
    };

    tokio::select! {
        _ = token.cancelled() => {
            adapter.abandon(&handle).await;
            finish(AdapterOutcome::Cancelled)
        }
        result = tokio::time::timeout(timeout, adapter.await_result(&handle, timeout)) => match result {
            Ok(result) => finish(AdapterOutcome::Returned(result)),
            Err(_) => {
                adapter.abandon(&handle).await;
                finish(AdapterOutcome::Returned(ToolResult::Failure(ToolFailure::timeout(timeout))))
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_target() {
        assert!(validate_target("http://x.com").is_ok());
        assert!(validate_target("https://x.com").is_ok());
        assert!(validate_target("  https://x.com/login?next=/  ").is_ok());

        for bad in ["ftp://x.com", "not a url", "", "   ", "http://", "file:///etc/passwd", "javascript:alert(1)"] {
            assert!(
                matches!(validate_target(bad), Err(SubmitError::InvalidTarget { .. })),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_builder_requires_adapters() {
        let ledger = Arc::new(QuotaLedger::new(3));
        assert!(ScanEngine::builder(ledger).build().is_err());
    }

    #[test]
    fn test_builder_rejects_duplicate_names() {
        use crate::adapters::MockAdapter;

        let ledger = Arc::new(QuotaLedger::new(3));
        let result = ScanEngine::builder(ledger)
            .adapter(MockAdapter::succeeding("nmap", vec![]))
            .adapter(MockAdapter::succeeding("nmap", vec![]))
            .build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_dispatch_rejects_unparsable_record() {
        use crate::adapters::MockAdapter;

        let ledger = Arc::new(QuotaLedger::new(3));
        let member = ledger.register_verified();
        let adapter = Arc::new(MockAdapter::succeeding("nmap", vec![]));
        let engine = ScanEngine::builder(ledger)
            .shared_adapter(adapter.clone())
            .build()
            .unwrap();

        let scan = engine.registry().create(member.id, "ftp://x.com");
        engine
            .clone()
            .run(scan.id, scan.target_url.clone(), CancellationToken::new())
            .await;

        let scan = engine.registry().scan(&scan.id).unwrap();
        assert_eq!(scan.status, ScanStatus::Failed);
        assert_eq!(scan.failure, Some(FailureReason::InvalidTarget));
        assert!(scan.finished_at.is_some());
        assert!(scan.tools.is_empty());
        assert_eq!(adapter.submit_count(), 0);
    }
}
