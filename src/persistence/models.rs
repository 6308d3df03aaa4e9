use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Status a Deployment moves through. Transitions are monotone along
/// `Queued -> Running -> {Success | Failed}`; terminal statuses never change.
#[derive(sqlx::Type, Debug, Default, Display, Clone, Copy, EnumString, PartialEq, Eq, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Queued,
    Running,
    Success,
    Failed,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Success | Status::Failed)
    }
}

/// Who caused a Deployment to be created.
#[derive(sqlx::Type, Debug, Clone, Copy, Display, EnumString, PartialEq, Eq, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum TriggeredBy {
    Webhook,
    Manual,
}

/// A user-declared deployment target.
#[derive(Clone, Debug, PartialEq, sqlx::FromRow, Serialize)]
pub struct Service {
    pub id: i64,
    pub name: String,
    pub repository: String,
    pub path: String,
    pub branch: String,
    pub deploy_command: String,
    pub created_at: DateTime<Utc>,
}

/// A service definition as it appears in the configuration file, before it
/// has been reconciled into the persisted `Service` row (and so has no `id`
/// or `created_at` yet).
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ServiceDef {
    pub name: String,
    pub repository: String,
    pub path: String,
    pub branch: String,
    pub deploy_command: String,
}

/// One execution attempt of a Service's deploy command.
#[derive(Clone, Debug, PartialEq, sqlx::FromRow, Serialize)]
pub struct Deployment {
    pub id: i64,
    pub service_id: i64,
    pub status: Status,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i64>,
    pub stdout: String,
    pub stderr: String,
    pub commit_sha: Option<String>,
    pub commit_message: Option<String>,
    pub branch: Option<String>,
    pub triggered_by: TriggeredBy,
}

/// A `Deployment` row enriched with the owning Service's name, as returned
/// by `GET /api/deployments/active` (spec §4.G: "Running + queued rows,
/// enriched with service_name").
#[derive(Clone, Debug, PartialEq, sqlx::FromRow, Serialize)]
pub struct ActiveDeployment {
    pub id: i64,
    pub service_id: i64,
    pub service_name: String,
    pub status: Status,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i64>,
    pub stdout: String,
    pub stderr: String,
    pub commit_sha: Option<String>,
    pub commit_message: Option<String>,
    pub branch: Option<String>,
    pub triggered_by: TriggeredBy,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn status_round_trips_case_insensitively() {
        assert_eq!(Status::Running, Status::from_str("running").unwrap());
        assert_eq!(Status::Success, Status::from_str("success").unwrap());
    }

    #[test]
    fn terminal_statuses() {
        assert!(Status::Success.is_terminal());
        assert!(Status::Failed.is_terminal());
        assert!(!Status::Queued.is_terminal());
        assert!(!Status::Running.is_terminal());
    }
}
