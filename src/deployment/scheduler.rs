//! Per-service FIFO dispatch (§4.E of the spec).
//!
//! Each service may have at most one deployment in `running` state at a
//! time; everything else triggered while one is running sits `queued`
//! until the current run finishes, at which point the oldest queued
//! deployment for that service is promoted and dispatched.
//!
//! Deployments for different services run fully concurrently: this is not
//! a single global worker, but one logical lane per service, each driven
//! by its own `tokio::spawn`ed task.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, instrument};

use crate::deployment::broadcaster::{LogBroadcaster, LogEvent};
use crate::deployment::runner::{self, Handle};
use crate::error::Result;
use crate::persistence::{Deployment, Persistence, Status, TriggeredBy};

#[derive(Clone)]
pub struct Scheduler {
    db: Persistence,
    broadcaster: LogBroadcaster,
    active: Arc<Mutex<HashMap<i64, Handle>>>,
}

impl Scheduler {
    pub fn new(db: Persistence, broadcaster: LogBroadcaster) -> Self {
        Scheduler {
            db,
            broadcaster,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn broadcaster(&self) -> &LogBroadcaster {
        &self.broadcaster
    }

    /// Record a new deployment and, if nothing is currently running for
    /// this service, dispatch it immediately; otherwise it is left queued.
    #[instrument(skip(self), fields(service_id))]
    pub async fn enqueue(
        &self,
        service_id: i64,
        commit_sha: Option<&str>,
        commit_message: Option<&str>,
        branch: Option<&str>,
        triggered_by: TriggeredBy,
    ) -> Result<Deployment> {
        let deployment = self
            .db
            .create_deployment_checking_running(service_id, commit_sha, commit_message, branch, triggered_by)
            .await?;

        if deployment.status == Status::Running {
            info!(deployment_id = deployment.id, service_id, "dispatching deployment");
            self.dispatch(deployment.clone());
        } else {
            info!(deployment_id = deployment.id, service_id, "queued behind a running deployment");
        }

        Ok(deployment)
    }

    /// Request the currently running deployment for `deployment_id` stop.
    /// A no-op if it is not currently running (already finished, or queued
    /// and not yet dispatched).
    pub async fn stop(&self, deployment_id: i64) {
        if let Some(handle) = self.active.lock().await.get(&deployment_id) {
            handle.stop().await;
        }
    }

    fn dispatch(&self, deployment: Deployment) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            scheduler.run_and_advance(deployment).await;
        });
    }

    async fn run_and_advance(&self, deployment: Deployment) {
        let Ok(Some(service)) = self.db.get_service_by_id(deployment.service_id).await else {
            error!(deployment_id = deployment.id, "service vanished before dispatch");
            return;
        };

        let log = self.broadcaster.start(deployment.id).await;
        let (handle_tx, mut handle_rx) = mpsc::channel(1);

        let trigger_description = match deployment.triggered_by {
            TriggeredBy::Webhook => "webhook",
            TriggeredBy::Manual => "manual",
        };

        let active = self.active.clone();
        let register = async {
            if let Some(handle) = handle_rx.recv().await {
                active.lock().await.insert(deployment.id, handle);
            }
        };

        let run = runner::run(
            deployment.id,
            &service.name,
            &service.deploy_command,
            &service.path,
            trigger_description,
            log.clone(),
            handle_tx,
        );

        let (outcome, _) = tokio::join!(run, register);

        self.active.lock().await.remove(&deployment.id);

        if let Err(e) = self
            .db
            .finalize(
                deployment.id,
                outcome.status,
                Utc::now(),
                outcome.exit_code,
                &outcome.stdout,
                &outcome.stderr,
            )
            .await
        {
            error!(deployment_id = deployment.id, error = %e, "failed to persist deployment outcome");
        }

        log.push(LogEvent::Status {
            status: outcome.status,
            exit_code: Some(outcome.exit_code),
        })
        .await;
        self.broadcaster.finish(deployment.id).await;

        self.advance_queue(deployment.service_id).await;
    }

    /// Promote and dispatch the next queued deployment for a service, if
    /// any. The deploy command is re-read from the current `Service` row
    /// rather than captured at enqueue time, so a config change takes
    /// effect for anything still waiting in the queue.
    async fn advance_queue(&self, service_id: i64) {
        match self.db.pop_next_queued(service_id).await {
            Ok(Some(next)) => {
                info!(deployment_id = next.id, service_id, "promoting queued deployment");
                self.dispatch(next);
            }
            Ok(None) => {}
            Err(e) => error!(service_id, error = %e, "failed to advance deployment queue"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::ServiceDef;
    use std::time::Duration;

    async fn make_service(db: &Persistence, name: &str, command: &str) -> i64 {
        db.upsert_service(&ServiceDef {
            name: name.into(),
            repository: "alice/site".into(),
            path: "/tmp".into(),
            branch: "main".into(),
            deploy_command: command.into(),
        })
        .await
        .unwrap()
        .id
    }

    #[tokio::test]
    async fn second_trigger_waits_for_first_to_finish() {
        let db = Persistence::new_in_memory().await;
        let scheduler = Scheduler::new(db.clone(), LogBroadcaster::new());
        let service_id = make_service(&db, "web", "sleep 0.2 && echo done").await;

        let first = scheduler
            .enqueue(service_id, None, None, None, TriggeredBy::Webhook)
            .await
            .unwrap();
        assert_eq!(first.status, Status::Running);

        let second = scheduler
            .enqueue(service_id, None, None, None, TriggeredBy::Webhook)
            .await
            .unwrap();
        assert_eq!(second.status, Status::Queued);

        tokio::time::sleep(Duration::from_secs(1)).await;

        let first_after = db.get_deployment(first.id).await.unwrap().unwrap();
        let second_after = db.get_deployment(second.id).await.unwrap().unwrap();
        assert_eq!(first_after.status, Status::Success);
        assert_eq!(second_after.status, Status::Success);
    }
}
