//! Typed CRUD over Services and Deployments (§4.A of the spec).
//!
//! All mutations run inside a transaction. The pool is capped at a single
//! connection: SQLite does not support concurrent writers, and pinning the
//! pool to one connection is the simplest way to make `pop_next_queued`
//! serializable with `create_deployment`/`find_running` so the "at most one
//! running deployment per service" invariant holds under concurrent
//! triggers, without hand-rolling an extra layer of locking.

pub mod models;

use chrono::Utc;
use sqlx::sqlite::{SqlitePoolOptions, SqliteQueryResult};
use sqlx::{Executor, Sqlite, SqlitePool, Transaction};

pub use models::{ActiveDeployment, Deployment, Service, ServiceDef, Status, TriggeredBy};

#[derive(Clone)]
pub struct Persistence {
    pool: SqlitePool,
}

impl Persistence {
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS services (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                repository TEXT NOT NULL,
                path TEXT NOT NULL,
                branch TEXT NOT NULL,
                deploy_command TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS deployments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                service_id INTEGER NOT NULL REFERENCES services(id),
                status INTEGER NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                exit_code INTEGER,
                stdout TEXT NOT NULL DEFAULT '',
                stderr TEXT NOT NULL DEFAULT '',
                commit_sha TEXT,
                commit_message TEXT,
                branch TEXT,
                triggered_by INTEGER NOT NULL
            );
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Persistence { pool })
    }

    #[cfg(test)]
    pub async fn new_in_memory() -> Self {
        Self::new("sqlite::memory:").await.unwrap()
    }

    // ---- Services ------------------------------------------------------

    pub async fn list_services(&self) -> Result<Vec<Service>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM services ORDER BY id DESC")
            .fetch_all(&self.pool)
            .await
    }

    pub async fn get_service_by_name(&self, name: &str) -> Result<Option<Service>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM services WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn get_service_by_id(&self, id: i64) -> Result<Option<Service>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM services WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    /// Insert a new service, or overwrite `repository`/`path`/`branch`/
    /// `deploy_command` on an existing one with the same name.
    pub async fn upsert_service(&self, def: &ServiceDef) -> Result<Service, sqlx::Error> {
        if let Some(existing) = self.get_service_by_name(&def.name).await? {
            sqlx::query(
                "UPDATE services SET repository = ?, path = ?, branch = ?, deploy_command = ? WHERE id = ?",
            )
            .bind(&def.repository)
            .bind(&def.path)
            .bind(&def.branch)
            .bind(&def.deploy_command)
            .bind(existing.id)
            .execute(&self.pool)
            .await?;

            Ok(Service {
                repository: def.repository.clone(),
                path: def.path.clone(),
                branch: def.branch.clone(),
                deploy_command: def.deploy_command.clone(),
                ..existing
            })
        } else {
            let now = Utc::now();
            let result = sqlx::query(
                "INSERT INTO services (name, repository, path, branch, deploy_command, created_at) VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&def.name)
            .bind(&def.repository)
            .bind(&def.path)
            .bind(&def.branch)
            .bind(&def.deploy_command)
            .bind(now)
            .execute(&self.pool)
            .await?;

            Ok(Service {
                id: result.last_insert_rowid(),
                name: def.name.clone(),
                repository: def.repository.clone(),
                path: def.path.clone(),
                branch: def.branch.clone(),
                deploy_command: def.deploy_command.clone(),
                created_at: now,
            })
        }
    }

    /// Delete a service and cascade: its Deployments are deleted first.
    pub async fn delete_service_cascade(&self, id: i64) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM deployments WHERE service_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM services WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await
    }

    // ---- Deployments -----------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub async fn create_deployment(
        &self,
        service_id: i64,
        status: Status,
        started_at: chrono::DateTime<Utc>,
        commit_sha: Option<&str>,
        commit_message: Option<&str>,
        branch: Option<&str>,
        triggered_by: TriggeredBy,
    ) -> Result<i64, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let id = insert_deployment(
            &mut tx,
            service_id,
            status,
            started_at,
            commit_sha,
            commit_message,
            branch,
            triggered_by,
        )
        .await?;
        tx.commit().await?;
        Ok(id)
    }

    /// Atomically decide whether a newly triggered deployment should start
    /// running immediately or be queued behind an already-running one, and
    /// insert the row accordingly. This is the composed operation the
    /// Scheduler's `enqueue` uses; `find_running` and the insert happen in
    /// one transaction so two webhooks racing for the same service cannot
    /// both observe "nothing running" and both start.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_deployment_checking_running(
        &self,
        service_id: i64,
        commit_sha: Option<&str>,
        commit_message: Option<&str>,
        branch: Option<&str>,
        triggered_by: TriggeredBy,
    ) -> Result<Deployment, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let running: Option<i64> =
            sqlx::query_scalar("SELECT id FROM deployments WHERE service_id = ? AND status = ?")
                .bind(service_id)
                .bind(Status::Running)
                .fetch_optional(&mut *tx)
                .await?;

        let status = if running.is_some() {
            Status::Queued
        } else {
            Status::Running
        };
        let started_at = Utc::now();

        let id = insert_deployment(
            &mut tx,
            service_id,
            status,
            started_at,
            commit_sha,
            commit_message,
            branch,
            triggered_by,
        )
        .await?;

        tx.commit().await?;

        Ok(Deployment {
            id,
            service_id,
            status,
            started_at,
            finished_at: None,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            commit_sha: commit_sha.map(str::to_owned),
            commit_message: commit_message.map(str::to_owned),
            branch: branch.map(str::to_owned),
            triggered_by,
        })
    }

    pub async fn update_status(&self, id: i64, status: Status) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE deployments SET status = ? WHERE id = ?")
            .bind(status)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn finalize(
        &self,
        id: i64,
        status: Status,
        finished_at: chrono::DateTime<Utc>,
        exit_code: i64,
        stdout_text: &str,
        stderr_text: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE deployments SET status = ?, finished_at = ?, exit_code = ?, stdout = ?, stderr = ? WHERE id = ?",
        )
        .bind(status)
        .bind(finished_at)
        .bind(exit_code)
        .bind(stdout_text)
        .bind(stderr_text)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn find_running(&self, service_id: i64) -> Result<Option<Deployment>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM deployments WHERE service_id = ? AND status = ?")
            .bind(service_id)
            .bind(Status::Running)
            .fetch_optional(&self.pool)
            .await
    }

    /// Return the oldest `queued` deployment for a service and atomically
    /// mark it `running`, or `None` if the queue is empty.
    pub async fn pop_next_queued(
        &self,
        service_id: i64,
    ) -> Result<Option<Deployment>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let next: Option<Deployment> = sqlx::query_as(
            "SELECT * FROM deployments WHERE service_id = ? AND status = ? ORDER BY started_at ASC, id ASC LIMIT 1",
        )
        .bind(service_id)
        .bind(Status::Queued)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(deployment) = next else {
            tx.commit().await?;
            return Ok(None);
        };

        sqlx::query("UPDATE deployments SET status = ? WHERE id = ?")
            .bind(Status::Running)
            .bind(deployment.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(Some(Deployment {
            status: Status::Running,
            ..deployment
        }))
    }

    pub async fn get_deployment(&self, id: i64) -> Result<Option<Deployment>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM deployments WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn list_recent(
        &self,
        limit: u32,
        status_filter: Option<Status>,
    ) -> Result<Vec<Deployment>, sqlx::Error> {
        match status_filter {
            Some(status) => {
                sqlx::query_as(
                    "SELECT * FROM deployments WHERE status = ? ORDER BY id DESC LIMIT ?",
                )
                .bind(status)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as("SELECT * FROM deployments ORDER BY id DESC LIMIT ?")
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await
            }
        }
    }

    /// Rows with status `running` or `queued`, newest first, enriched with
    /// `service_name` so callers don't need a second round-trip to label
    /// each row.
    pub async fn list_active(&self) -> Result<Vec<ActiveDeployment>, sqlx::Error> {
        sqlx::query_as(
            "SELECT d.id, d.service_id, s.name AS service_name, d.status, d.started_at, \
             d.finished_at, d.exit_code, d.stdout, d.stderr, d.commit_sha, d.commit_message, \
             d.branch, d.triggered_by \
             FROM deployments d JOIN services s ON s.id = d.service_id \
             WHERE d.status = ? OR d.status = ? ORDER BY d.id DESC",
        )
        .bind(Status::Running)
        .bind(Status::Queued)
        .fetch_all(&self.pool)
        .await
    }

    /// Delete all rows whose status is `success` or `failed`. Never touches
    /// `running` or `queued` rows.
    pub async fn purge_terminal(&self) -> Result<u64, sqlx::Error> {
        let result: SqliteQueryResult = sqlx::query("DELETE FROM deployments WHERE status = ? OR status = ?")
            .bind(Status::Success)
            .bind(Status::Failed)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[allow(clippy::too_many_arguments)]
async fn insert_deployment(
    tx: &mut Transaction<'_, Sqlite>,
    service_id: i64,
    status: Status,
    started_at: chrono::DateTime<Utc>,
    commit_sha: Option<&str>,
    commit_message: Option<&str>,
    branch: Option<&str>,
    triggered_by: TriggeredBy,
) -> Result<i64, sqlx::Error> {
    let result = sqlx::query(
        "INSERT INTO deployments (service_id, status, started_at, commit_sha, commit_message, branch, triggered_by) VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(service_id)
    .bind(status)
    .bind(started_at)
    .bind(commit_sha)
    .bind(commit_message)
    .bind(branch)
    .bind(triggered_by)
    .execute(&mut **tx)
    .await?;

    Ok(result.last_insert_rowid())
}
