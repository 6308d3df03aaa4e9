//! Spawns a Service's deploy command, captures stdout/stderr concurrently,
//! and reports the outcome (§4.D of the spec).
//!
//! Log lines are wrapped with a `[YYYY-MM-DD HH:MM:SS]` timestamp and
//! synthetic `[DEPLOY START]`/`[DEPLOY END]` markers, matching the format
//! the reference deployer writes into its stdout/stderr blobs.

use std::process::Stdio;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{instrument, warn};

use crate::deployment::broadcaster::{DeploymentLog, LogEvent};
use crate::persistence::Status;

const GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(5);

fn timestamp() -> String {
    Utc::now().format("[%Y-%m-%d %H:%M:%S]").to_string()
}

pub struct RunOutcome {
    pub status: Status,
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

/// A handle to a deployment's live child process, used by the Scheduler to
/// request it be stopped.
pub struct Handle {
    stop_tx: mpsc::Sender<()>,
}

impl Handle {
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(()).await;
    }
}

/// Run `command` in `cwd`, streaming each line of output into `log` as it
/// is produced, and returning once the process exits (or is stopped).
///
/// Returns the outcome alongside a `Handle` the caller can use to request
/// an early stop; the handle is delivered through `handle_tx` as soon as
/// the child process has actually spawned, so callers can register it
/// before the deploy command has had a chance to finish.
#[instrument(skip(log, handle_tx), fields(deployment_id, %command))]
pub async fn run(
    deployment_id: i64,
    service_name: &str,
    command: &str,
    cwd: &str,
    triggered_by_description: &str,
    log: DeploymentLog,
    handle_tx: mpsc::Sender<Handle>,
) -> RunOutcome {
    let start_line = format!(
        "{} [DEPLOY START] Service: {service_name}, Command: {command}, triggered by {triggered_by_description}",
        timestamp()
    );
    log.push(LogEvent::Stdout { line: start_line }).await;

    let start = std::time::Instant::now();

    let spawned = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .env("PYTHONUNBUFFERED", "1")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();

    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            let line = format!("{} [ERROR] Failed to start command: {e}", timestamp());
            log.push(LogEvent::Stderr { line }).await;
            let end = format!(
                "{} [DEPLOY END] Status: FAILED, Exit Code: -1, Duration: {:.2}s",
                timestamp(),
                start.elapsed().as_secs_f64()
            );
            log.push(LogEvent::Stdout { line: end }).await;
            let (ring, _rx) = log.subscribe().await;
            let (stdout, stderr) = split_ring(&ring);
            return RunOutcome {
                status: Status::Failed,
                exit_code: -1,
                stdout,
                stderr,
            };
        }
    };

    let (stop_tx, mut stop_rx) = mpsc::channel(1);
    let _ = handle_tx.send(Handle { stop_tx }).await;

    let stdout = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");

    let stdout_task = {
        let log = log.clone();
        tokio::spawn(async move { drain(stdout, true, log).await })
    };
    let stderr_task = {
        let log = log.clone();
        tokio::spawn(async move { drain(stderr, false, log).await })
    };

    let exit_status = tokio::select! {
        status = child.wait() => status,
        _ = stop_rx.recv() => {
            stop_gracefully(&mut child).await;
            child.wait().await
        }
    };

    let _ = stdout_task.await;
    let _ = stderr_task.await;

    let exit_code = exit_status
        .ok()
        .and_then(|status| status.code())
        .map(i64::from)
        .unwrap_or(-1);
    let status = if exit_code == 0 {
        Status::Success
    } else {
        Status::Failed
    };

    let end_line = format!(
        "{} [DEPLOY END] Status: {}, Exit Code: {exit_code}, Duration: {:.2}s",
        timestamp(),
        if status == Status::Success { "SUCCESS" } else { "FAILED" },
        start.elapsed().as_secs_f64()
    );
    log.push(LogEvent::Stdout { line: end_line }).await;

    // Per spec step 6: the persisted blobs are derived from the same
    // ordered ring that live subscribers see, not from a separately
    // tracked buffer, so nothing (DEPLOY START included) can go missing
    // from one without going missing from the other.
    let (ring, _rx) = log.subscribe().await;
    let (stdout, stderr) = split_ring(&ring);

    RunOutcome {
        status,
        exit_code,
        stdout,
        stderr,
    }
}

/// Split an ordered ring of events into the per-stream text blobs
/// `finalize` persists, one line per entry with a trailing newline.
fn split_ring(ring: &[LogEvent]) -> (String, String) {
    let mut stdout = String::new();
    let mut stderr = String::new();
    for event in ring {
        match event {
            LogEvent::Stdout { line } => {
                stdout.push_str(line);
                stdout.push('\n');
            }
            LogEvent::Stderr { line } => {
                stderr.push_str(line);
                stderr.push('\n');
            }
            LogEvent::Status { .. } => {}
        }
    }
    (stdout, stderr)
}

async fn drain<R>(reader: R, is_stdout: bool, log: DeploymentLog)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader).lines();
    loop {
        match reader.next_line().await {
            Ok(Some(raw)) => {
                let formatted = format!("{} {raw}", timestamp());
                if is_stdout {
                    log.push(LogEvent::Stdout { line: formatted }).await;
                } else {
                    log.push(LogEvent::Stderr { line: formatted }).await;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "error reading deployment output stream");
                break;
            }
        }
    }
}

async fn stop_gracefully(child: &mut Child) {
    if let Some(pid) = child.id() {
        // SAFETY: `pid` was handed to us by `tokio::process::Child::id`
        // while the child is still alive; sending SIGTERM to a live pid we
        // own is always valid.
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }

    if tokio::time::timeout(GRACEFUL_STOP_TIMEOUT, child.wait())
        .await
        .is_err()
    {
        let _ = child.kill().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines_of(events: &[LogEvent]) -> Vec<&str> {
        events
            .iter()
            .filter_map(|e| match e {
                LogEvent::Stdout { line } | LogEvent::Stderr { line } => Some(line.as_str()),
                LogEvent::Status { .. } => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn successful_command_produces_ordered_start_and_end_markers() {
        let log = DeploymentLog::new();
        let (tx, _rx) = mpsc::channel(1);

        let outcome = run(1, "web", "echo hi", ".", "webhook", log.clone(), tx).await;

        assert_eq!(outcome.status, Status::Success);
        assert_eq!(outcome.exit_code, 0);
        assert!(outcome.stdout.contains("hi"));

        // The persisted blob must carry the same synthetic markers the live
        // ring does — it is derived from the ring, not a separate buffer.
        assert!(outcome.stdout.contains("[DEPLOY START] Service: web, Command: echo hi, triggered by webhook"));
        assert!(outcome.stdout.contains("[DEPLOY END] Status: SUCCESS, Exit Code: 0"));

        let (replayed, _rx) = log.subscribe().await;
        let text = lines_of(&replayed);
        assert!(text[0].contains("[DEPLOY START] Service: web, Command: echo hi, triggered by webhook"));
        assert!(text.last().unwrap().contains("[DEPLOY END] Status: SUCCESS, Exit Code: 0"));
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_as_failed() {
        let log = DeploymentLog::new();
        let (tx, _rx) = mpsc::channel(1);

        let outcome = run(2, "web", "exit 3", ".", "manual", log, tx).await;

        assert_eq!(outcome.status, Status::Failed);
        assert_eq!(outcome.exit_code, 3);
    }

    #[tokio::test]
    async fn stdout_and_stderr_are_both_captured() {
        let log = DeploymentLog::new();
        let (tx, _rx) = mpsc::channel(1);

        let outcome = run(3, "web", "echo out; echo err 1>&2", ".", "webhook", log, tx).await;

        assert!(outcome.stdout.contains("out"));
        assert!(outcome.stderr.contains("err"));
    }

    #[tokio::test]
    async fn stop_terminates_a_long_running_command() {
        let log = DeploymentLog::new();
        let (tx, mut rx) = mpsc::channel(1);

        let run_fut = run(4, "web", "sleep 30", ".", "webhook", log, tx);
        tokio::pin!(run_fut);

        let handle = tokio::select! {
            handle = rx.recv() => handle.expect("handle sent before completion"),
            _ = &mut run_fut => panic!("command should not exit on its own"),
        };

        let started = std::time::Instant::now();
        let stop = async {
            handle.stop().await;
            run_fut.await
        };
        let outcome = tokio::time::timeout(Duration::from_secs(10), stop)
            .await
            .expect("stop should complete well within the grace period");

        assert!(started.elapsed() < GRACEFUL_STOP_TIMEOUT);
        assert_eq!(outcome.status, Status::Failed);
    }
}
