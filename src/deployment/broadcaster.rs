//! Fan-out of live log lines to SSE subscribers, with replay of everything
//! produced before a subscriber attached.
//!
//! Modeled on the build-log broadcaster pattern: a small ring buffer holds
//! everything seen so far, and a `broadcast::Sender` fans out new lines to
//! anyone currently subscribed. The subscribe path holds the buffer's write
//! lock across both "clone what's already there" and "start receiving what
//! comes next", so a line can never be missed or duplicated across the
//! replay/live boundary.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LogEvent {
    Stdout { line: String },
    Stderr { line: String },
    Status {
        status: crate::persistence::Status,
        exit_code: Option<i64>,
    },
}

struct Ring {
    lines: Vec<LogEvent>,
    tx: broadcast::Sender<LogEvent>,
}

/// Per-deployment log state, created when a deployment starts running and
/// torn down once every subscriber has drained the final status event.
#[derive(Clone)]
pub struct DeploymentLog {
    ring: Arc<RwLock<Ring>>,
}

impl DeploymentLog {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        DeploymentLog {
            ring: Arc::new(RwLock::new(Ring { lines: Vec::new(), tx })),
        }
    }

    pub async fn push(&self, event: LogEvent) {
        let mut guard = self.ring.write().await;
        guard.lines.push(event.clone());
        // A send error just means nobody is currently subscribed; the line
        // is still retained in the buffer for the next subscriber to replay.
        let _ = guard.tx.send(event);
    }

    /// Replay everything seen so far, then yield new events as they arrive.
    pub async fn subscribe(&self) -> (Vec<LogEvent>, broadcast::Receiver<LogEvent>) {
        let guard = self.ring.read().await;
        (guard.lines.clone(), guard.tx.subscribe())
    }
}

impl Default for DeploymentLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry of live `DeploymentLog`s, keyed by deployment id. A deployment
/// is removed once it reaches a terminal status and its log has been
/// persisted to the `deployments` table, at which point subscribers fall
/// back to replaying the persisted `stdout`/`stderr` columns.
#[derive(Clone, Default)]
pub struct LogBroadcaster {
    active: Arc<RwLock<HashMap<i64, DeploymentLog>>>,
}

impl LogBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn start(&self, deployment_id: i64) -> DeploymentLog {
        let log = DeploymentLog::new();
        self.active.write().await.insert(deployment_id, log.clone());
        log
    }

    pub async fn get(&self, deployment_id: i64) -> Option<DeploymentLog> {
        self.active.read().await.get(&deployment_id).cloned()
    }

    pub async fn finish(&self, deployment_id: i64) {
        self.active.write().await.remove(&deployment_id);
    }
}

/// Recover SSE events for a deployment whose Runner has already exited, by
/// splitting the persisted `stdout`/`stderr` blobs on newline and merging
/// them by the `[YYYY-MM-DD HH:MM:SS]` prefix each line carries. A line
/// missing the prefix sorts first (treated as epoch); the sort is stable,
/// so lines sharing a timestamp keep their within-stream order.
pub fn replay_persisted(stdout: &str, stderr: &str) -> Vec<LogEvent> {
    fn timestamp_of(line: &str) -> chrono::NaiveDateTime {
        line.strip_prefix('[')
            .and_then(|rest| rest.split_once(']'))
            .and_then(|(ts, _)| {
                chrono::NaiveDateTime::parse_from_str(ts, "%Y-%m-%d %H:%M:%S").ok()
            })
            .unwrap_or_else(|| chrono::DateTime::<chrono::Utc>::from_timestamp(0, 0).unwrap().naive_utc())
    }

    let mut merged: Vec<(chrono::NaiveDateTime, LogEvent)> = stdout
        .lines()
        .filter(|l| !l.is_empty())
        .map(|l| (timestamp_of(l), LogEvent::Stdout { line: l.to_owned() }))
        .chain(
            stderr
                .lines()
                .filter(|l| !l.is_empty())
                .map(|l| (timestamp_of(l), LogEvent::Stderr { line: l.to_owned() })),
        )
        .collect();

    merged.sort_by_key(|(ts, _)| *ts);
    merged.into_iter().map(|(_, event)| event).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replay_then_live_sees_every_line_exactly_once() {
        let log = DeploymentLog::new();
        log.push(LogEvent::Stdout { line: "one".into() }).await;

        let (replayed, mut rx) = log.subscribe().await;
        assert_eq!(replayed.len(), 1);

        log.push(LogEvent::Stdout { line: "two".into() }).await;
        let next = rx.recv().await.unwrap();
        assert_eq!(next, LogEvent::Stdout { line: "two".into() });
    }

    #[tokio::test]
    async fn broadcaster_forgets_finished_deployments() {
        let broadcaster = LogBroadcaster::new();
        broadcaster.start(1).await;
        assert!(broadcaster.get(1).await.is_some());
        broadcaster.finish(1).await;
        assert!(broadcaster.get(1).await.is_none());
    }

    #[test]
    fn replay_persisted_merges_by_timestamp_stably() {
        let stdout = "[2026-01-01 00:00:00] a\n[2026-01-01 00:00:02] c\n";
        let stderr = "[2026-01-01 00:00:01] b\n[2026-01-01 00:00:02] d\n";

        let events = replay_persisted(stdout, stderr);
        let lines: Vec<String> = events
            .into_iter()
            .map(|e| match e {
                LogEvent::Stdout { line } | LogEvent::Stderr { line } => line,
                LogEvent::Status { .. } => unreachable!(),
            })
            .collect();

        assert_eq!(
            lines,
            vec![
                "[2026-01-01 00:00:00] a".to_string(),
                "[2026-01-01 00:00:01] b".to_string(),
                "[2026-01-01 00:00:02] c".to_string(),
                "[2026-01-01 00:00:02] d".to_string(),
            ]
        );
    }

    #[test]
    fn replay_persisted_treats_missing_prefix_as_earliest() {
        let stdout = "no timestamp here\n";
        let stderr = "[2026-01-01 00:00:00] b\n";

        let events = replay_persisted(stdout, stderr);
        assert_eq!(events[0], LogEvent::Stdout { line: "no timestamp here".into() });
    }
}
