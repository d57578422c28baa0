//! Tracker/classifier subprocess execution.
//!
//! The classifier writes its structured result to a sidecar file (the input
//! path with a `.txt` extension) so that ordinary stdout diagnostics cannot
//! corrupt it. Nothing on stdout is parsed.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::process::Command;

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("command exited with {status}\nstdout: {stdout}\nstderr: {stderr}")]
    Exit {
        status: std::process::ExitStatus,
        stdout: String,
        stderr: String,
    },
    #[error("command timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("invalid JSON in result file: {0}")]
    MalformedOutput(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Run a shell command under a timeout, then read and JSON-decode the
/// result file it wrote on exit.
pub async fn run_for_json<T>(
    command: &str,
    result_file: &Path,
    timeout: Duration,
) -> Result<T, CommandError>
where
    T: DeserializeOwned,
{
    run(command, timeout).await?;
    let raw = tokio::fs::read(result_file).await?;
    Ok(serde_json::from_slice(&raw)?)
}

/// Run a shell command under a timeout, requiring a zero exit code.
pub async fn run(command: &str, timeout: Duration) -> Result<(), CommandError> {
    let child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => output?,
        // Dropping the in-flight child kills it (kill_on_drop).
        Err(_) => return Err(CommandError::Timeout(timeout)),
    };

    if !output.status.success() {
        return Err(CommandError::Exit {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::Value;

    #[tokio::test]
    async fn reads_result_file_and_ignores_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let result_file = dir.path().join("recording.txt");
        let command = format!(
            "echo 'progress chatter'; printf '{{\"tracks\": []}}' > {}",
            result_file.display()
        );
        let value: Value = run_for_json(&command, &result_file, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(value["tracks"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn nonzero_exit_carries_output() {
        let err = run("echo oops >&2; exit 3", Duration::from_secs(10))
            .await
            .unwrap_err();
        match err {
            CommandError::Exit { status, stderr, .. } => {
                assert_eq!(status.code(), Some(3));
                assert!(stderr.contains("oops"));
            }
            other => panic!("expected Exit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeout_kills_the_command() {
        let err = run("sleep 30", Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, CommandError::Timeout(_)));
    }

    #[tokio::test]
    async fn malformed_result_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let result_file = dir.path().join("recording.txt");
        let command = format!("printf 'not json' > {}", result_file.display());
        let err = run_for_json::<Value>(&command, &result_file, Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::MalformedOutput(_)));
    }
}
