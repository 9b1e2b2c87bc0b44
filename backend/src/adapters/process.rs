use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::debug;
use uuid::Uuid;

use super::{JobHandle, ToolFailure};

pub(crate) struct ProcessOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Child processes of one scanner binary, keyed by job. A child is killed
/// when its entry is abandoned or its wait is dropped.
pub(crate) struct ProcessJobs {
    program: String,
    children: Mutex<HashMap<Uuid, Child>>,
}

impl ProcessJobs {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            children: Mutex::new(HashMap::new()),
        }
    }

    pub fn spawn(&self, handle: JobHandle, args: &[String]) -> Result<JobHandle, ToolFailure> {
        let child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => ToolFailure::tool_error(format!(
                    "{0} not found. Please install {0}.",
                    self.program
                )),
                _ => ToolFailure::tool_error(format!("Failed to start {}: {}", self.program, e)),
            })?;

        debug!(tool = %handle.tool, job_id = %handle.job_id, args = ?args, "Spawned scanner process");
        self.children.lock().insert(handle.job_id, child);
        Ok(handle)
    }

    pub async fn wait(&self, handle: &JobHandle) -> Result<ProcessOutput, ToolFailure> {
        let child = self
            .children
            .lock()
            .remove(&handle.job_id)
            .ok_or_else(|| ToolFailure::tool_error(format!("Unknown job {}", handle.job_id)))?;

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ToolFailure::tool_error(format!("{} did not exit cleanly: {}", self.program, e)))?;

        Ok(ProcessOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Kill the job's child and reap it. Returns whether a child was still tracked.
    pub async fn abandon(&self, handle: &JobHandle) -> bool {
        let child = self.children.lock().remove(&handle.job_id);
        let Some(mut child) = child else {
            return false;
        };
        if let Err(e) = child.kill().await {
            debug!(tool = %handle.tool, job_id = %handle.job_id, error = %e, "Scanner process already gone");
        }
        true
    }
}

impl ProcessOutput {
    /// Failure detail for an exit that produced nothing to parse.
    pub fn failure_detail(&self, program: &str) -> String {
        let stderr = self.stderr.trim();
        match self.code {
            Some(code) if stderr.is_empty() => format!("{program} exited with status {code}"),
            Some(code) => format!("{program} exited with status {code}: {stderr}"),
            None => format!("{program} was terminated by a signal"),
        }
    }
}

/// Stand-in scanner binaries for adapter tests.
#[cfg(all(test, unix))]
pub(crate) mod fake {
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use uuid::Uuid;

    /// Write an executable `sh` script and return its path.
    pub fn tool(name: &str, body: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("fake-{name}-{}", Uuid::new_v4()));
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let jobs = ProcessJobs::new("no-such-scanner-binary");
        let failure = jobs
            .spawn(JobHandle::new("ghost"), &[])
            .unwrap_err();
        assert_eq!(failure.kind, crate::models::FailureKind::ToolError);
        assert_eq!(
            failure.detail,
            "no-such-scanner-binary not found. Please install no-such-scanner-binary."
        );
    }

    #[tokio::test]
    async fn test_wait_collects_output() {
        let jobs = ProcessJobs::new("sh");
        let handle = jobs
            .spawn(JobHandle::new("sh"), &args(&["-c", "echo found; echo warn >&2"]))
            .unwrap();

        let output = jobs.wait(&handle).await.unwrap();
        assert_eq!(output.code, Some(0));
        assert_eq!(output.stdout.trim(), "found");
        assert_eq!(output.stderr.trim(), "warn");
    }

    #[tokio::test]
    async fn test_nonzero_exit_detail() {
        let jobs = ProcessJobs::new("sh");
        let handle = jobs
            .spawn(JobHandle::new("sh"), &args(&["-c", "echo 'connection refused' >&2; exit 3"]))
            .unwrap();

        let output = jobs.wait(&handle).await.unwrap();
        assert_eq!(output.code, Some(3));
        assert!(output.stdout.is_empty());
        assert_eq!(
            output.failure_detail("scanner"),
            "scanner exited with status 3: connection refused"
        );

        let silent = ProcessOutput {
            code: Some(1),
            stdout: String::new(),
            stderr: "  ".to_string(),
        };
        assert_eq!(silent.failure_detail("nmap"), "nmap exited with status 1");
    }

    #[tokio::test]
    async fn test_wait_unknown_job() {
        let jobs = ProcessJobs::new("sh");
        let stranger = JobHandle::new("sh");
        let failure = jobs.wait(&stranger).await.err().unwrap();
        assert_eq!(failure.detail, format!("Unknown job {}", stranger.job_id));
    }

    #[tokio::test]
    async fn test_abandon_kills_child() {
        let jobs = ProcessJobs::new("sh");
        let handle = jobs
            .spawn(JobHandle::new("sh"), &args(&["-c", "sleep 30"]))
            .unwrap();

        let killed = tokio::time::timeout(Duration::from_secs(5), jobs.abandon(&handle))
            .await
            .unwrap();
        assert!(killed);
        assert!(!jobs.abandon(&handle).await);
        assert!(jobs.wait(&handle).await.is_err());
    }
}
