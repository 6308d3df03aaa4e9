pub mod args;
pub mod config;
pub mod deployment;
pub mod error;
pub mod handlers;
pub mod persistence;
pub mod registry;
pub mod webhook;

pub use error::{Error, Result};

use std::sync::Arc;

use tracing::info;

use crate::deployment::{LogBroadcaster, Scheduler};
use crate::persistence::Persistence;

const DEFAULT_DB_PATH: &str = "pushbot.sqlite";

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}

/// Load configuration, open the database, and reconcile the Service
/// Registry. Returns a ready-to-serve `Scheduler` together with the shared
/// state the HTTP surface needs. Reconciliation completes before this
/// function returns, so the caller never starts accepting requests while
/// the registry is still being reconciled.
pub async fn bootstrap(config_path: &std::path::Path) -> Result<(Persistence, Scheduler)> {
    let app_config = config::AppConfig::load(config_path)?;

    let database_url =
        std::env::var("PUSHBOT_DB").unwrap_or_else(|_| format!("sqlite://{DEFAULT_DB_PATH}?mode=rwc"));
    let db = Persistence::new(&database_url).await?;

    registry::reconcile(&db, &app_config.services).await?;
    info!(count = app_config.services.len(), "service registry reconciled");

    let scheduler = Scheduler::new(db.clone(), LogBroadcaster::new());

    Ok((db, scheduler))
}

pub fn webhook_secret() -> String {
    std::env::var("GITHUB_WEBHOOK_SECRET").unwrap_or_default()
}

pub fn app_state(db: Persistence, scheduler: Scheduler) -> Arc<handlers::AppState> {
    Arc::new(handlers::AppState {
        db,
        scheduler,
        webhook_secret: webhook_secret(),
    })
}
