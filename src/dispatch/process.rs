//! Subprocess transform dispatcher.
//!
//! Each transform is an executable in the processors directory. The input
//! payload is piped to stdin as JSON; the transform writes its result as
//! JSON on stdout. Exit status and stderr are folded into the error
//! taxonomy.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use super::{DispatchError, TransformDispatcher};

/// Runs transforms as local executables
pub struct ProcessDispatcher {
    /// Directory holding one executable per transform name
    processors_dir: PathBuf,
}

impl ProcessDispatcher {
    pub fn new(processors_dir: impl Into<PathBuf>) -> Self {
        Self {
            processors_dir: processors_dir.into(),
        }
    }

    fn processor_path(&self, transform: &str) -> PathBuf {
        self.processors_dir.join(transform)
    }
}

#[async_trait]
impl TransformDispatcher for ProcessDispatcher {
    fn name(&self) -> &str {
        "process"
    }

    async fn invoke(
        &self,
        transform: &str,
        input: &Value,
        deadline: Duration,
    ) -> Result<Value, DispatchError> {
        let path = self.processor_path(transform);
        if !path.exists() {
            return Err(DispatchError::ProcessorNotFound {
                transform: transform.to_string(),
            });
        }

        debug!(transform, path = %path.display(), "Spawning processor");

        let mut child = Command::new(&path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DispatchError::ExecutionFailure {
                transform: transform.to_string(),
                exit_code: None,
                stderr: format!("failed to spawn processor: {e}"),
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(input.to_string().as_bytes())
                .await
                .map_err(|e| DispatchError::ExecutionFailure {
                    transform: transform.to_string(),
                    exit_code: None,
                    stderr: format!("failed to write processor stdin: {e}"),
                })?;
            // Drop stdin to signal EOF
        }

        let output = match timeout(deadline, child.wait_with_output()).await {
            Err(_) => {
                return Err(DispatchError::Timeout {
                    transform: transform.to_string(),
                    elapsed: deadline,
                })
            }
            Ok(Err(e)) => {
                return Err(DispatchError::ExecutionFailure {
                    transform: transform.to_string(),
                    exit_code: None,
                    stderr: format!("failed to wait for processor: {e}"),
                })
            }
            Ok(Ok(output)) => output,
        };

        if !output.status.success() {
            return Err(DispatchError::ExecutionFailure {
                transform: transform.to_string(),
                exit_code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        serde_json::from_str(stdout.trim()).map_err(|e| DispatchError::OutputParseError {
            transform: transform.to_string(),
            detail: e.to_string(),
        })
    }

    async fn health_check(&self) -> Result<(), DispatchError> {
        if self.processors_dir.is_dir() {
            Ok(())
        } else {
            Err(DispatchError::ProcessorNotFound {
                transform: self.processors_dir.display().to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn write_processor(dir: &TempDir, name: &str, script: &str) {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh").unwrap();
        writeln!(file, "{script}").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[tokio::test]
    async fn test_missing_processor() {
        let dir = TempDir::new().unwrap();
        let dispatcher = ProcessDispatcher::new(dir.path());

        let err = dispatcher
            .invoke("nope", &json!({}), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::ProcessorNotFound { .. }));
    }

    #[tokio::test]
    async fn test_json_round_trip() {
        let dir = TempDir::new().unwrap();
        write_processor(&dir, "echo_wrap", r#"echo "{\"wrapped\": true}""#);
        let dispatcher = ProcessDispatcher::new(dir.path());

        let out = dispatcher
            .invoke("echo_wrap", &json!({"in": 1}), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out, json!({"wrapped": true}));
    }

    #[tokio::test]
    async fn test_failing_processor_reports_exit_and_stderr() {
        let dir = TempDir::new().unwrap();
        write_processor(&dir, "boom", "echo 'it broke' >&2; exit 3");
        let dispatcher = ProcessDispatcher::new(dir.path());

        let err = dispatcher
            .invoke("boom", &json!({}), Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            DispatchError::ExecutionFailure {
                exit_code, stderr, ..
            } => {
                assert_eq!(exit_code, Some(3));
                assert_eq!(stderr, "it broke");
            }
            other => panic!("expected ExecutionFailure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_garbage_stdout_is_a_parse_error() {
        let dir = TempDir::new().unwrap();
        write_processor(&dir, "garbage", "echo 'this is not json'");
        let dispatcher = ProcessDispatcher::new(dir.path());

        let err = dispatcher
            .invoke("garbage", &json!({}), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::OutputParseError { .. }));
    }

    #[tokio::test]
    async fn test_slow_processor_times_out() {
        let dir = TempDir::new().unwrap();
        write_processor(&dir, "slow", "sleep 5; echo '{}'");
        let dispatcher = ProcessDispatcher::new(dir.path());

        let err = dispatcher
            .invoke("slow", &json!({}), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Timeout { .. }));
    }
}
