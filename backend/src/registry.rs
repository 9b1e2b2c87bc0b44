//! Process-wide store of scan records.
//!
//! Each scan lives behind its own mutex, so finding appends and status
//! changes on one scan never contend with another. The maps themselves are
//! only write-locked to insert or purge a record.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

use crate::error::RegistryError;
use crate::models::{
    AccountId, FailureReason, Finding, RiskAssessment, Scan, ScanId, ScanReport, ScanStatus,
    ToolRun,
};
use crate::risk;

type Result<T> = std::result::Result<T, RegistryError>;

struct ScanEntry {
    scan: Scan,
    findings: Vec<Finding>,
    /// Filled once the scan is terminal; findings are frozen from then on.
    frozen_risk: Option<RiskAssessment>,
    status_tx: watch::Sender<ScanStatus>,
}

impl ScanEntry {
    fn ensure_running(&self) -> Result<()> {
        if self.scan.status == ScanStatus::Running {
            Ok(())
        } else {
            Err(RegistryError::ScanNotMutable {
                id: self.scan.id,
                status: self.scan.status,
            })
        }
    }

    fn transition(
        &mut self,
        next: ScanStatus,
        at: DateTime<Utc>,
        failure: Option<FailureReason>,
    ) -> Result<()> {
        let current = self.scan.status;
        if !current.can_transition_to(next) {
            return Err(RegistryError::InvalidTransition {
                id: self.scan.id,
                from: current,
                to: next,
            });
        }

        self.scan.status = next;
        if next.is_terminal() {
            // finished_at never precedes started_at
            self.scan.finished_at = Some(at.max(self.scan.started_at));
            self.scan.failure = if next == ScanStatus::Failed {
                Some(failure.unwrap_or(FailureReason::AllToolsFailed))
            } else {
                None
            };
            self.frozen_risk = Some(risk::score(&self.findings));
        }
        self.status_tx.send_replace(next);
        debug!(scan_id = %self.scan.id, from = %current, to = %next, "Scan transitioned");
        Ok(())
    }

    fn risk(&self) -> RiskAssessment {
        match &self.frozen_risk {
            Some(cached) => cached.clone(),
            None => risk::score(&self.findings),
        }
    }

    fn report(&self) -> ScanReport {
        ScanReport {
            scan: self.scan.clone(),
            progress: self.scan.progress(),
            findings: self.findings.clone(),
            risk: self.risk(),
        }
    }
}

/// Everything the engine commits when a scan's join barrier completes.
pub struct Completion {
    pub status: ScanStatus,
    pub finished_at: DateTime<Utc>,
    pub failure: Option<FailureReason>,
    pub findings: Vec<Finding>,
}

#[derive(Default)]
pub struct ScanRegistry {
    scans: RwLock<HashMap<ScanId, Arc<Mutex<ScanEntry>>>>,
    by_account: RwLock<HashMap<AccountId, Vec<ScanId>>>,
}

impl ScanRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, id: &ScanId) -> Result<Arc<Mutex<ScanEntry>>> {
        self.scans
            .read()
            .get(id)
            .cloned()
            .ok_or(RegistryError::NotFound(*id))
    }

    /// Create a Pending scan for an already-authorized submission.
    pub fn create(&self, account_id: AccountId, target_url: &str) -> Scan {
        // Held across creation so each account's index stays in started_at order
        let mut by_account = self.by_account.write();
        let scan = Scan::new(account_id, target_url);
        let (status_tx, _) = watch::channel(scan.status);
        let entry = ScanEntry {
            scan: scan.clone(),
            findings: Vec::new(),
            frozen_risk: None,
            status_tx,
        };

        self.scans
            .write()
            .insert(scan.id, Arc::new(Mutex::new(entry)));
        by_account.entry(account_id).or_default().push(scan.id);
        scan
    }

    pub fn get(&self, id: &ScanId) -> Result<ScanReport> {
        Ok(self.entry(id)?.lock().report())
    }

    pub fn scan(&self, id: &ScanId) -> Result<Scan> {
        Ok(self.entry(id)?.lock().scan.clone())
    }

    pub fn risk(&self, id: &ScanId) -> Result<RiskAssessment> {
        Ok(self.entry(id)?.lock().risk())
    }

    /// The account's scans, most recent first.
    pub fn list_by_account(&self, account_id: &AccountId) -> Vec<Scan> {
        let ids: Vec<ScanId> = match self.by_account.read().get(account_id) {
            Some(ids) => ids.iter().rev().copied().collect(),
            None => return Vec::new(),
        };
        ids.iter().filter_map(|id| self.scan(id).ok()).collect()
    }

    pub fn append_finding(&self, id: &ScanId, finding: Finding) -> Result<()> {
        let entry = self.entry(id)?;
        let mut entry = entry.lock();
        entry.ensure_running()?;
        entry.findings.push(finding);
        Ok(())
    }

    pub fn set_status(&self, id: &ScanId, status: ScanStatus) -> Result<Scan> {
        self.transition(id, status, Utc::now(), None)
    }

    pub fn transition(
        &self,
        id: &ScanId,
        status: ScanStatus,
        at: DateTime<Utc>,
        failure: Option<FailureReason>,
    ) -> Result<Scan> {
        let entry = self.entry(id)?;
        let mut entry = entry.lock();
        entry.transition(status, at, failure)?;
        Ok(entry.scan.clone())
    }

    /// Move a Pending scan to Running with one dispatched run per tool.
    pub fn start(&self, id: &ScanId, tools: Vec<ToolRun>) -> Result<Scan> {
        let entry = self.entry(id)?;
        let mut entry = entry.lock();
        entry.transition(ScanStatus::Running, Utc::now(), None)?;
        entry.scan.tools = tools;
        Ok(entry.scan.clone())
    }

    /// Replace the run record of a returned tool. Rejected once terminal.
    pub fn record_tool_run(&self, id: &ScanId, run: ToolRun) -> Result<()> {
        let entry = self.entry(id)?;
        let mut entry = entry.lock();
        entry.ensure_running()?;
        if let Some(slot) = entry.scan.tools.iter_mut().find(|t| t.tool == run.tool) {
            *slot = run;
        } else {
            entry.scan.tools.push(run);
        }
        Ok(())
    }

    /// Attach findings and take the terminal transition under one lock, so a
    /// concurrent cancellation either wins outright or not at all.
    pub fn complete(&self, id: &ScanId, completion: Completion) -> Result<Scan> {
        let entry = self.entry(id)?;
        let mut entry = entry.lock();
        entry.ensure_running()?;
        if !entry.scan.status.can_transition_to(completion.status) {
            return Err(RegistryError::InvalidTransition {
                id: *id,
                from: entry.scan.status,
                to: completion.status,
            });
        }
        entry.findings.extend(completion.findings);
        entry.transition(completion.status, completion.finished_at, completion.failure)?;
        Ok(entry.scan.clone())
    }

    pub fn subscribe(&self, id: &ScanId) -> Result<watch::Receiver<ScanStatus>> {
        Ok(self.entry(id)?.lock().status_tx.subscribe())
    }

    /// Remove a terminal scan together with its findings.
    pub fn purge(&self, id: &ScanId) -> Result<Scan> {
        let entry = self.entry(id)?;
        let scan = {
            let entry = entry.lock();
            if !entry.scan.status.is_terminal() {
                return Err(RegistryError::ScanActive(*id));
            }
            entry.scan.clone()
        };

        self.scans.write().remove(id);
        if let Some(ids) = self.by_account.write().get_mut(&scan.account_id) {
            ids.retain(|other| other != id);
        }
        Ok(scan)
    }

    pub fn len(&self) -> usize {
        self.scans.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
