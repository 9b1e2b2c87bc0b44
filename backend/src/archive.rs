//! Durable record of scans that reached a terminal state.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqlitePoolOptions, FromRow, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use crate::models::{ScanId, ScanReport, Severity};

#[derive(Debug, Serialize, Deserialize, FromRow, Clone)]
pub struct ScanSummary {
    pub id: Uuid,
    pub account_id: Uuid,
    pub url: String,
    pub status: String,
    pub failure: Option<String>,
    pub total_vulnerabilities: i64,
    pub critical_sev: i64,
    pub high_sev: i64,
    pub medium_sev: i64,
    pub low_sev: i64,
    pub risk_score: f64,
    pub started_at: i64,
    pub finished_at: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize, FromRow, Clone)]
pub struct ArchivedFinding {
    pub id: Uuid,
    pub scan_id: Uuid,
    pub tool: String,
    pub severity: String,
    pub vulnerability_type: String,
    pub description: String,
    pub remediation: Option<String>,
    pub raw: String, // JSON
    pub found_at: i64,
}

#[derive(Clone)]
pub struct ScanArchive {
    db: SqlitePool,
}

impl ScanArchive {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .with_context(|| format!("Failed to open archive database {database_url}"))?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(db: SqlitePool) -> anyhow::Result<Self> {
        let archive = Self { db };
        archive.migrate().await?;
        Ok(archive)
    }

    async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS scan_results (
                id BLOB PRIMARY KEY,
                account_id BLOB NOT NULL,
                url TEXT NOT NULL,
                status TEXT NOT NULL,
                failure TEXT,
                total_vulnerabilities INTEGER NOT NULL,
                critical_sev INTEGER NOT NULL,
                high_sev INTEGER NOT NULL,
                medium_sev INTEGER NOT NULL,
                low_sev INTEGER NOT NULL,
                risk_score REAL NOT NULL,
                started_at INTEGER NOT NULL,
                finished_at INTEGER
            )"
        ).execute(&self.db).await.context("Failed to create scan_results table")?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS findings (
                id BLOB PRIMARY KEY,
                scan_id BLOB NOT NULL REFERENCES scan_results(id) ON DELETE CASCADE,
                tool TEXT NOT NULL,
                severity TEXT NOT NULL,
                vulnerability_type TEXT NOT NULL,
                description TEXT NOT NULL,
                remediation TEXT,
                raw TEXT NOT NULL,
                found_at INTEGER NOT NULL
            )"
        ).execute(&self.db).await.context("Failed to create findings table")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS findings_scan_id ON findings (scan_id)")
            .execute(&self.db)
            .await?;

        Ok(())
    }

    /// Store a terminal scan, replacing any earlier copy of it.
    pub async fn record(&self, report: &ScanReport) -> anyhow::Result<()> {
        let scan = &report.scan;
        let count = |severity: Severity| report.risk.counts.get(&severity).copied().unwrap_or(0) as i64;

        let mut tx = self.db.begin().await?;

        sqlx::query(
            "INSERT OR REPLACE INTO scan_results (id, account_id, url, status, failure, total_vulnerabilities, critical_sev, high_sev, medium_sev, low_sev, risk_score, started_at, finished_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        )
        .bind(scan.id)
        .bind(scan.account_id)
        .bind(&scan.target_url)
        .bind(scan.status.as_str())
        .bind(scan.failure.map(|f| f.as_str()))
        .bind(report.risk.total as i64)
        .bind(count(Severity::Critical))
        .bind(count(Severity::High))
        .bind(count(Severity::Medium))
        .bind(count(Severity::Low))
        .bind(report.risk.risk)
        .bind(scan.started_at.timestamp_millis())
        .bind(scan.finished_at.map(|t| t.timestamp_millis()))
        .execute(&mut *tx)
        .await
        .context("Failed to store scan summary")?;

        sqlx::query("DELETE FROM findings WHERE scan_id = ?")
            .bind(scan.id)
            .execute(&mut *tx)
            .await?;

        for finding in &report.findings {
            sqlx::query(
                "INSERT INTO findings (id, scan_id, tool, severity, vulnerability_type, description, remediation, raw, found_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"
            )
            .bind(finding.id)
            .bind(finding.scan_id)
            .bind(&finding.tool)
            .bind(finding.severity.as_str())
            .bind(&finding.vulnerability_type)
            .bind(&finding.description)
            .bind(&finding.remediation)
            .bind(finding.raw.to_string())
            .bind(finding.found_at.timestamp_millis())
            .execute(&mut *tx)
            .await
            .context("Failed to store finding")?;
        }

        tx.commit().await?;
        debug!(scan_id = %scan.id, findings = report.findings.len(), "Archived scan");
        Ok(())
    }

    pub async fn list_results(&self) -> anyhow::Result<Vec<ScanSummary>> {
        let results = sqlx::query_as::<_, ScanSummary>(
            "SELECT * FROM scan_results ORDER BY started_at DESC",
        )
        .fetch_all(&self.db)
        .await?;
        Ok(results)
    }

    pub async fn summary(&self, scan_id: &ScanId) -> anyhow::Result<Option<ScanSummary>> {
        let summary = sqlx::query_as::<_, ScanSummary>("SELECT * FROM scan_results WHERE id = ?")
            .bind(scan_id)
            .fetch_optional(&self.db)
            .await?;
        Ok(summary)
    }

    pub async fn findings(&self, scan_id: &ScanId) -> anyhow::Result<Vec<ArchivedFinding>> {
        let findings = sqlx::query_as::<_, ArchivedFinding>(
            "SELECT * FROM findings WHERE scan_id = ? ORDER BY found_at ASC",
        )
        .bind(scan_id)
        .fetch_all(&self.db)
        .await?;
        Ok(findings)
    }

    /// Remove a scan and its findings. Returns whether anything was stored.
    pub async fn delete(&self, scan_id: &ScanId) -> anyhow::Result<bool> {
        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM findings WHERE scan_id = ?")
            .bind(scan_id)
            .execute(&mut *tx)
            .await?;
        let removed = sqlx::query("DELETE FROM scan_results WHERE id = ?")
            .bind(scan_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(removed > 0)
    }
}
