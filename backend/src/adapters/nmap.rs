use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use std::time::Duration;
use url::Url;

use super::process::ProcessJobs;
use super::{JobHandle, Normalized, NormalizedFinding, RawRecord, ToolAdapter, ToolFailure, ToolResult};
use crate::models::{FailureKind, Severity};

const REMEDIATION: &str = "Close unnecessary ports and secure services";

static PORT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)<port\s+protocol="([^"]+)"\s+portid="(\d+)"\s*>(.*?)</port>"#)
        .expect("valid port regex")
});
static STATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"<state\s+state="([^"]+)""#).expect("valid state regex"));
static SERVICE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"<service\s+name="([^"]+)""#).expect("valid service regex"));

/// Services whose exposure alone is a serious finding: databases, caches,
/// remote administration and file sharing.
const HIGH_RISK_SERVICES: &[&str] = &[
    "ftp",
    "telnet",
    "netbios-ssn",
    "microsoft-ds",
    "ms-wbt-server",
    "vnc",
    "mysql",
    "postgresql",
    "ms-sql-s",
    "oracle",
    "mongodb",
    "mongod",
    "redis",
    "memcached",
    "elasticsearch",
];
const HIGH_RISK_PORTS: &[u64] = &[
    21, 23, 139, 445, 1433, 1521, 3306, 3389, 5432, 5900, 6379, 9200, 11211, 27017,
];
const EXPECTED_SERVICES: &[&str] = &["ssh", "http", "https", "http-alt", "https-alt"];
const EXPECTED_PORTS: &[u64] = &[22, 80, 443, 8080, 8443];

pub struct NmapAdapter {
    jobs: ProcessJobs,
    timeout: Option<Duration>,
}

impl NmapAdapter {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self::with_program("nmap", timeout)
    }

    /// Run an nmap binary from a specific path.
    pub fn with_program(program: impl Into<String>, timeout: Option<Duration>) -> Self {
        Self {
            jobs: ProcessJobs::new(program),
            timeout,
        }
    }
}

#[async_trait]
impl ToolAdapter for NmapAdapter {
    fn name(&self) -> &str {
        "nmap"
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    async fn submit(&self, target: &Url) -> Result<JobHandle, ToolFailure> {
        let host = target
            .host_str()
            .ok_or_else(|| ToolFailure::new(FailureKind::InvalidTarget, "target has no host"))?;
        let args = vec![
            "-T4".to_string(),
            "-F".to_string(),
            "-Pn".to_string(),
            host.to_string(),
            "-oX".to_string(),
            "-".to_string(),
        ];
        self.jobs.spawn(JobHandle::new(self.name()), &args)
    }

    async fn await_result(&self, handle: &JobHandle, _timeout: Duration) -> ToolResult {
        let output = match self.jobs.wait(handle).await {
            Ok(output) => output,
            Err(failure) => return ToolResult::Failure(failure),
        };

        if !output.stdout.contains("<nmaprun") {
            return ToolResult::Failure(ToolFailure::tool_error(output.failure_detail("nmap")));
        }
        ToolResult::Success(parse_xml(&output.stdout))
    }

    async fn abandon(&self, handle: &JobHandle) {
        self.jobs.abandon(handle).await;
    }

    fn normalize(&self, record: &RawRecord) -> Normalized {
        let Some(port) = record.get("port").and_then(Value::as_u64) else {
            return Normalized::Dropped("record has no port number".to_string());
        };
        let protocol = record.get("protocol").and_then(Value::as_str).unwrap_or("tcp");
        let state = record.get("state").and_then(Value::as_str).unwrap_or("unknown");
        if state != "open" {
            return Normalized::Dropped(format!("port {port}/{protocol} is {state}"));
        }
        let service = record.get("service").and_then(Value::as_str).unwrap_or("unknown");

        Normalized::Finding(NormalizedFinding {
            severity: classify(port, service),
            vulnerability_type: "Open Port".to_string(),
            description: format!("{port}/{protocol} is open ({service})"),
            remediation: Some(REMEDIATION.to_string()),
        })
    }
}

fn classify(port: u64, service: &str) -> Severity {
    if HIGH_RISK_SERVICES.contains(&service) || HIGH_RISK_PORTS.contains(&port) {
        Severity::High
    } else if EXPECTED_SERVICES.contains(&service) || EXPECTED_PORTS.contains(&port) {
        Severity::Low
    } else {
        Severity::Medium
    }
}

/// One record per `<port>` element of nmap's XML report, whatever its state.
pub(crate) fn parse_xml(xml: &str) -> Vec<RawRecord> {
    PORT_RE
        .captures_iter(xml)
        .filter_map(|caps| {
            let port: u64 = caps[2].parse().ok()?;
            let body = &caps[3];
            let state = STATE_RE
                .captures(body)
                .map(|c| c[1].to_string())
                .unwrap_or_else(|| "unknown".to_string());
            let service = SERVICE_RE
                .captures(body)
                .map(|c| c[1].to_string())
                .unwrap_or_else(|| "unknown".to_string());
            Some(json!({
                "port": port,
                "protocol": &caps[1],
                "state": state,
                "service": service,
            }))
        })
        .collect()
}
