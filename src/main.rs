use std::path::PathBuf;

use clap::Parser;
use pushbot::args::{Cli, Command};
use pushbot::persistence::TriggeredBy;
use tracing::{error, info};

const STARTER_CONFIG: &str = r#"services:
  - name: example
    repository: owner/repo
    path: /srv/example
    branch: main
    deploy_command: "git pull && ./deploy.sh"
"#;

fn config_path() -> PathBuf {
    std::env::var("PUSHBOT_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("pushbot.yaml"))
}

#[tokio::main]
async fn main() {
    pushbot::init_tracing();

    let cli = Cli::parse();
    let code = match cli.command {
        Command::Init => run_init(),
        Command::Serve { bind } => run_serve(bind).await,
        Command::Deploy { service } => run_deploy(service).await,
    };

    std::process::exit(code);
}

fn run_init() -> i32 {
    let path = config_path();
    if path.exists() {
        error!(path = %path.display(), "configuration file already exists");
        return 1;
    }
    if let Err(e) = std::fs::write(&path, STARTER_CONFIG) {
        error!(error = %e, "failed to write starter configuration");
        return 1;
    }
    info!(path = %path.display(), "wrote starter configuration");
    0
}

async fn run_serve(bind: std::net::SocketAddr) -> i32 {
    let (db, scheduler) = match pushbot::bootstrap(&config_path()).await {
        Ok(ready) => ready,
        Err(e) => {
            error!(error = %e, "failed to start");
            return 1;
        }
    };

    let state = pushbot::app_state(db, scheduler);
    let app = pushbot::handlers::router(state);

    info!(%bind, "listening");
    let result = axum::Server::bind(&bind)
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await;

    match result {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "server error");
            1
        }
    }
}

async fn run_deploy(service_name: String) -> i32 {
    let (db, scheduler) = match pushbot::bootstrap(&config_path()).await {
        Ok(ready) => ready,
        Err(e) => {
            error!(error = %e, "failed to start");
            return 1;
        }
    };

    let Ok(Some(service)) = db.get_service_by_name(&service_name).await else {
        error!(service = %service_name, "unknown service");
        return 1;
    };

    match scheduler
        .enqueue(service.id, None, Some("Manual deployment"), None, TriggeredBy::Manual)
        .await
    {
        Ok(deployment) => {
            info!(deployment_id = deployment.id, status = %deployment.status, "deployment triggered");
            0
        }
        Err(e) => {
            error!(error = %e, "failed to trigger deployment");
            1
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
