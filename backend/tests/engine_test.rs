use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use vulnscan_backend::adapters::{MockAdapter, ToolAdapter, ToolResult};
use vulnscan_backend::models::{FailureKind, FailureReason, Remaining, ScanStatus, Severity, ToolRunState};
use vulnscan_backend::{QuotaLedger, RegistryError, ScanEngine, SubmitError};

fn engine_with(ledger: Arc<QuotaLedger>, adapters: Vec<MockAdapter>) -> Arc<ScanEngine> {
    let mut builder = ScanEngine::builder(ledger).default_timeout(Duration::from_secs(5));
    for adapter in adapters {
        builder = builder.adapter(adapter);
    }
    builder.build().unwrap()
}

#[tokio::test]
async fn test_exhausted_guest_creates_no_scan() {
    let ledger = Arc::new(QuotaLedger::new(3));
    let guest = ledger.register_guest_with_quota(0);
    let engine = engine_with(ledger, vec![MockAdapter::demo("mock")]);

    let result = engine.submit(guest.id, "https://example.com");
    assert_eq!(result.unwrap_err(), SubmitError::QuotaExhausted(guest.id));
    assert!(engine.list(&guest.id).is_empty());
    assert!(engine.registry().is_empty());
}

#[tokio::test]
async fn test_unknown_account_rejected() {
    let ledger = Arc::new(QuotaLedger::new(3));
    let engine = engine_with(ledger, vec![MockAdapter::demo("mock")]);

    let stranger = Uuid::new_v4();
    assert_eq!(
        engine.submit(stranger, "https://example.com").unwrap_err(),
        SubmitError::UnknownAccount(stranger)
    );
}

#[tokio::test]
async fn test_invalid_targets_rejected_without_charge() {
    let ledger = Arc::new(QuotaLedger::new(3));
    let guest = ledger.register_guest();
    let engine = engine_with(ledger, vec![MockAdapter::demo("mock")]);

    for target in ["ftp://x.com", "not a url", ""] {
        assert!(matches!(
            engine.submit(guest.id, target),
            Err(SubmitError::InvalidTarget { .. })
        ));
    }
    assert_eq!(engine.quota(&guest.id).unwrap().remaining, Remaining::Limited(3));
    assert!(engine.list(&guest.id).is_empty());

    assert!(engine.submit(guest.id, "http://x.com").is_ok());
    assert!(engine.submit(guest.id, "https://x.com").is_ok());
    assert_eq!(engine.quota(&guest.id).unwrap().remaining, Remaining::Limited(1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_submissions_respect_quota() {
    let ledger = Arc::new(QuotaLedger::new(3));
    let guest = ledger.register_guest_with_quota(5);
    let engine = engine_with(ledger, vec![MockAdapter::demo("mock")]);

    let mut handles = Vec::new();
    for _ in 0..20 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine.submit(guest.id, "https://example.com")
        }));
    }

    let mut allowed = 0;
    let mut denied = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => allowed += 1,
            Err(SubmitError::QuotaExhausted(_)) => denied += 1,
            Err(e) => panic!("unexpected rejection: {e}"),
        }
    }

    assert_eq!(allowed, 5);
    assert_eq!(denied, 15);
    assert_eq!(engine.quota(&guest.id).unwrap().remaining, Remaining::Limited(0));
    assert_eq!(engine.list(&guest.id).len(), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_submissions_within_quota() {
    let ledger = Arc::new(QuotaLedger::new(3));
    let guest = ledger.register_guest_with_quota(12);
    let engine = engine_with(ledger, vec![MockAdapter::demo("mock")]);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.submit(guest.id, "https://example.com") })
        })
        .collect();
    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }

    assert_eq!(engine.quota(&guest.id).unwrap().remaining, Remaining::Limited(4));
    assert_eq!(engine.list(&guest.id).len(), 8);
}

#[tokio::test]
async fn test_verified_account_is_unlimited() {
    let ledger = Arc::new(QuotaLedger::new(1));
    let member = ledger.register_verified();
    let engine = engine_with(ledger, vec![MockAdapter::demo("mock")]);

    for _ in 0..10 {
        engine.submit(member.id, "https://example.com").unwrap();
    }
    let view = engine.quota(&member.id).unwrap();
    assert!(!view.is_guest);
    assert_eq!(view.remaining, Remaining::Unlimited);
}

#[tokio::test]
async fn test_all_adapters_fail() {
    let ledger = Arc::new(QuotaLedger::new(3));
    let member = ledger.register_verified();
    let engine = engine_with(
        ledger,
        vec![
            MockAdapter::failing("sqlmap", FailureKind::ToolError),
            MockAdapter::failing("nmap", FailureKind::InvalidTarget),
        ],
    );

    let scan_id = engine.submit(member.id, "https://example.com").unwrap();
    let scan = engine.wait(&scan_id).await.unwrap();

    assert_eq!(scan.status, ScanStatus::Failed);
    assert_eq!(scan.failure, Some(FailureReason::AllToolsFailed));
    assert!(scan.finished_at.is_some());
    assert!(scan.started_at <= scan.finished_at.unwrap());
    assert!(scan.tools.iter().all(|t| t.is_degraded()));

    let report = engine.report(&scan_id).unwrap();
    assert!(report.findings.is_empty());
    assert_eq!(report.risk.risk, 0.0);
    assert_eq!(report.progress, 100);
}

#[tokio::test]
async fn test_partial_success_completes() {
    let ledger = Arc::new(QuotaLedger::new(3));
    let member = ledger.register_verified();
    let engine = engine_with(
        ledger,
        vec![
            MockAdapter::succeeding(
                "sqlmap",
                vec![
                    json!({"severity": "high", "type": "SQL Injection"}),
                    json!({"severity": "critical", "type": "Auth Bypass"}),
                ],
            ),
            MockAdapter::failing("nikto", FailureKind::ToolError),
            MockAdapter::failing("nmap", FailureKind::InvalidTarget),
        ],
    );

    let scan_id = engine.submit(member.id, "https://example.com").unwrap();
    let scan = engine.wait(&scan_id).await.unwrap();
    assert_eq!(scan.status, ScanStatus::Completed);
    assert_eq!(scan.failure, None);

    let report = engine.report(&scan_id).unwrap();
    assert_eq!(report.findings.len(), 2);
    assert!(report.findings.iter().all(|f| f.tool == "sqlmap"));
    assert!((report.risk.risk - 8.5).abs() < f64::EPSILON);
    assert_eq!(report.risk.level, Some(Severity::Critical));

    let degraded: Vec<_> = scan.tools.iter().filter(|t| t.is_degraded()).map(|t| t.tool.as_str()).collect();
    assert_eq!(degraded.len(), 2);
    assert!(degraded.contains(&"nikto"));
    assert!(degraded.contains(&"nmap"));
}

#[tokio::test]
async fn test_empty_success_still_completes() {
    let ledger = Arc::new(QuotaLedger::new(3));
    let member = ledger.register_verified();
    let engine = engine_with(ledger, vec![MockAdapter::succeeding("nmap", vec![])]);

    let scan_id = engine.submit(member.id, "https://example.com").unwrap();
    let scan = engine.wait(&scan_id).await.unwrap();
    assert_eq!(scan.status, ScanStatus::Completed);
    assert_eq!(engine.report(&scan_id).unwrap().risk.level, None);
}

#[tokio::test]
async fn test_mixed_severities_score() {
    let ledger = Arc::new(QuotaLedger::new(3));
    let member = ledger.register_verified();
    let engine = engine_with(
        ledger,
        vec![MockAdapter::succeeding(
            "scanner",
            vec![
                json!({"severity": "critical"}),
                json!({"severity": "high"}),
                json!({"severity": "medium"}),
                json!({"severity": "low"}),
            ],
        )],
    );

    let scan_id = engine.submit(member.id, "https://example.com").unwrap();
    engine.wait(&scan_id).await.unwrap();

    let risk = engine.report(&scan_id).unwrap().risk;
    assert_eq!(risk.total, 4);
    assert!((risk.risk - 5.5).abs() < f64::EPSILON);
    assert_eq!(risk.level, Some(Severity::High));
}

#[tokio::test]
async fn test_dropped_records_are_counted() {
    let ledger = Arc::new(QuotaLedger::new(3));
    let member = ledger.register_verified();
    let engine = engine_with(
        ledger,
        vec![MockAdapter::succeeding(
            "scanner",
            vec![json!({"severity": "low"}), json!(42), json!({"severity": "catastrophic"})],
        )],
    );

    let scan_id = engine.submit(member.id, "https://example.com").unwrap();
    let scan = engine.wait(&scan_id).await.unwrap();

    let run = &scan.tools[0];
    assert_eq!(run.state, ToolRunState::Succeeded);
    assert_eq!(run.findings, 1);
    assert_eq!(run.dropped, 2);
}

#[tokio::test]
async fn test_no_findings_after_terminal() {
    let ledger = Arc::new(QuotaLedger::new(3));
    let member = ledger.register_verified();
    let engine = engine_with(ledger, vec![MockAdapter::demo("mock")]);

    let scan_id = engine.submit(member.id, "https://example.com").unwrap();
    engine.wait(&scan_id).await.unwrap();

    let before = engine.report(&scan_id).unwrap();
    let extra = before.findings[0].clone();
    assert!(matches!(
        engine.registry().append_finding(&scan_id, extra),
        Err(RegistryError::ScanNotMutable { .. })
    ));
    assert_eq!(engine.report(&scan_id).unwrap().findings.len(), before.findings.len());
}

#[tokio::test]
async fn test_adapter_timeout_is_a_tool_failure() {
    let ledger = Arc::new(QuotaLedger::new(3));
    let member = ledger.register_verified();
    let slow = Arc::new(MockAdapter::demo("slow").with_delay(Duration::from_secs(30)));
    let engine = ScanEngine::builder(ledger)
        .default_timeout(Duration::from_millis(50))
        .shared_adapter(slow.clone() as Arc<dyn ToolAdapter>)
        .adapter(MockAdapter::succeeding("fast", vec![json!({"severity": "high"})]))
        .build()
        .unwrap();

    let scan_id = engine.submit(member.id, "https://example.com").unwrap();
    let scan = tokio::time::timeout(Duration::from_secs(5), engine.wait(&scan_id))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(scan.status, ScanStatus::Completed);
    let slow_run = scan.tools.iter().find(|t| t.tool == "slow").unwrap();
    assert_eq!(slow_run.state, ToolRunState::Failed(FailureKind::Timeout));
    assert_eq!(slow.abandon_count(), 1);
    assert!(engine.report(&scan_id).unwrap().findings.iter().all(|f| f.tool == "fast"));
}

#[tokio::test]
async fn test_cancel_discards_findings() {
    let ledger = Arc::new(QuotaLedger::new(3));
    let member = ledger.register_verified();
    let slow = Arc::new(MockAdapter::demo("slow").with_delay(Duration::from_secs(30)));
    let engine = ScanEngine::builder(ledger)
        .shared_adapter(slow.clone() as Arc<dyn ToolAdapter>)
        .adapter(MockAdapter::succeeding("fast", vec![json!({"severity": "high"})]))
        .build()
        .unwrap();

    let scan_id = engine.submit(member.id, "https://example.com").unwrap();
    // Let the fast adapter return before cancelling
    let mut rx = engine.registry().subscribe(&scan_id).unwrap();
    rx.wait_for(|s| *s == ScanStatus::Running).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let cancelled = engine.cancel(&scan_id).await.unwrap();
    assert_eq!(cancelled.status, ScanStatus::Failed);
    assert_eq!(cancelled.failure, Some(FailureReason::Cancelled));

    let scan = engine.wait(&scan_id).await.unwrap();
    assert_eq!(scan.status, ScanStatus::Failed);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let report = engine.report(&scan_id).unwrap();
    assert!(report.findings.is_empty());
    assert_eq!(report.scan.failure, Some(FailureReason::Cancelled));
    assert_eq!(slow.abandon_count(), 1);

    assert!(matches!(
        engine.cancel(&scan_id).await,
        Err(RegistryError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn test_list_most_recent_first() {
    let ledger = Arc::new(QuotaLedger::new(3));
    let member = ledger.register_verified();
    let engine = engine_with(ledger, vec![MockAdapter::demo("mock")]);

    let first = engine.submit(member.id, "https://a.example.com").unwrap();
    let second = engine.submit(member.id, "https://b.example.com").unwrap();
    let third = engine.submit(member.id, "https://c.example.com").unwrap();

    let ids: Vec<_> = engine.list(&member.id).into_iter().map(|s| s.id).collect();
    assert_eq!(ids, vec![third, second, first]);
}

#[tokio::test]
async fn test_purge_only_after_terminal() {
    let ledger = Arc::new(QuotaLedger::new(3));
    let member = ledger.register_verified();
    let engine = engine_with(
        ledger,
        vec![MockAdapter::demo("mock").with_delay(Duration::from_millis(100))],
    );

    let scan_id = engine.submit(member.id, "https://example.com").unwrap();
    assert_eq!(
        engine.purge(&scan_id).await.unwrap_err(),
        RegistryError::ScanActive(scan_id)
    );

    engine.wait(&scan_id).await.unwrap();
    engine.purge(&scan_id).await.unwrap();
    assert!(matches!(engine.report(&scan_id), Err(RegistryError::NotFound(_))));
    assert!(engine.list(&member.id).is_empty());
}

#[tokio::test]
async fn test_shutdown_cancels_and_refunds() {
    let ledger = Arc::new(QuotaLedger::new(3));
    let guest = ledger.register_guest();
    let engine = engine_with(
        ledger,
        vec![MockAdapter::with_result("slow", ToolResult::Success(vec![])).with_delay(Duration::from_secs(30))],
    );

    let scan_id = engine.submit(guest.id, "https://example.com").unwrap();
    engine.shutdown().await;

    let scan = engine.wait(&scan_id).await.unwrap();
    assert_eq!(scan.status, ScanStatus::Failed);
    assert_eq!(scan.failure, Some(FailureReason::Cancelled));

    // Rejected after authorization, so the charge is returned
    assert_eq!(
        engine.submit(guest.id, "https://example.com").unwrap_err(),
        SubmitError::ShuttingDown
    );
    assert_eq!(engine.quota(&guest.id).unwrap().remaining, Remaining::Limited(2));
}

#[tokio::test]
async fn test_submit_failure_counts_as_tool_failure() {
    let ledger = Arc::new(QuotaLedger::new(3));
    let member = ledger.register_verified();
    let engine = engine_with(
        ledger,
        vec![MockAdapter::demo("picky").rejecting_submit(FailureKind::InvalidTarget)],
    );

    let scan_id = engine.submit(member.id, "https://example.com").unwrap();
    let scan = engine.wait(&scan_id).await.unwrap();
    assert_eq!(scan.status, ScanStatus::Failed);
    assert_eq!(scan.tools[0].state, ToolRunState::Failed(FailureKind::InvalidTarget));
}
