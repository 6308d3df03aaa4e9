//! Thin request → core binding (§4.G of the spec): webhook ingress, manual
//! trigger, listing endpoints, and the SSE log stream.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::deployment::{replay_persisted, LogEvent, Scheduler};
use crate::error::{Error, Result};
use crate::persistence::{Persistence, ServiceDef, Status, TriggeredBy};
use crate::webhook;

pub struct AppState {
    pub db: Persistence,
    pub scheduler: Scheduler,
    pub webhook_secret: String,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", post(handle_webhook))
        .route("/webhook", post(handle_webhook))
        .route("/api/services", get(list_services))
        .route("/api/services/:id/deploy", post(manual_trigger))
        .route("/api/deployments", get(list_deployments))
        .route("/api/deployments/active", get(list_active))
        .route("/api/deployments/clear", post(clear_terminal))
        .route("/api/deployments/:id", get(get_deployment))
        .route("/api/deployments/:id/logs", get(stream_logs))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

fn service_def_of(service: &crate::persistence::Service) -> ServiceDef {
    ServiceDef {
        name: service.name.clone(),
        repository: service.repository.clone(),
        path: service.path.clone(),
        branch: service.branch.clone(),
        deploy_command: service.deploy_command.clone(),
    }
}

#[derive(Debug, Serialize)]
struct WebhookResponse {
    deployment_id: i64,
    service: String,
}

#[instrument(skip(state, headers, body))]
async fn handle_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<impl IntoResponse> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !content_type.starts_with("application/json") {
        return Err(webhook::InterpretError::BadContentType.into());
    }

    let signature = headers
        .get("X-Hub-Signature-256")
        .and_then(|v| v.to_str().ok());
    if !webhook::verify(&body, signature, &state.webhook_secret) {
        return Err(Error::BadSignature);
    }

    let persisted = state.db.list_services().await?;
    let defs: Vec<ServiceDef> = persisted.iter().map(service_def_of).collect();
    let matched = webhook::interpret(&body, &defs)?;

    let service = persisted
        .into_iter()
        .find(|s| s.name == matched.service.name)
        .ok_or_else(|| Error::UnknownService(matched.service.name.clone()))?;

    let deployment = state
        .scheduler
        .enqueue(
            service.id,
            matched.commit_sha.as_deref(),
            matched.commit_message.as_deref(),
            Some(&matched.branch),
            TriggeredBy::Webhook,
        )
        .await?;

    Ok(Json(WebhookResponse {
        deployment_id: deployment.id,
        service: service.name,
    }))
}

#[instrument(skip(state))]
async fn manual_trigger(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse> {
    let service = state
        .db
        .get_service_by_id(id)
        .await?
        .ok_or(Error::UnknownService(id.to_string()))?;

    let deployment = state
        .scheduler
        .enqueue(
            service.id,
            None,
            Some("Manual deployment"),
            None,
            TriggeredBy::Manual,
        )
        .await?;

    Ok(Json(WebhookResponse {
        deployment_id: deployment.id,
        service: service.name,
    }))
}

async fn list_services(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse> {
    Ok(Json(state.db.list_services().await?))
}

#[derive(Debug, Deserialize)]
struct ListParams {
    limit: Option<u32>,
    status: Option<Status>,
}

async fn list_deployments(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse> {
    let limit = params.limit.unwrap_or(50);
    Ok(Json(state.db.list_recent(limit, params.status).await?))
}

async fn list_active(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse> {
    Ok(Json(state.db.list_active().await?))
}

async fn get_deployment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse> {
    let deployment = state
        .db
        .get_deployment(id)
        .await?
        .ok_or(Error::UnknownDeployment(id))?;
    Ok(Json(deployment))
}

#[derive(Debug, Serialize)]
struct ClearResponse {
    deleted: u64,
}

async fn clear_terminal(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse> {
    let deleted = state.db.purge_terminal().await?;
    Ok(Json(ClearResponse { deleted }))
}

fn to_sse_event(event: LogEvent) -> Event {
    Event::default().json_data(event).unwrap_or_else(|_| Event::default().data("{}"))
}

#[instrument(skip(state))]
async fn stream_logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse> {
    let deployment = state
        .db
        .get_deployment(id)
        .await?
        .ok_or(Error::UnknownDeployment(id))?;

    let body: std::pin::Pin<Box<dyn Stream<Item = std::result::Result<Event, Infallible>> + Send>> =
        if let Some(log) = state.scheduler.broadcaster().get(id).await {
            let (replay, rx) = log.subscribe().await;
            let db = state.db.clone();
            Box::pin(async_stream::stream! {
                for event in replay {
                    yield Ok(to_sse_event(event));
                }

                let mut rx = rx;
                loop {
                    match rx.recv().await {
                        Ok(event) => {
                            let is_status = matches!(event, LogEvent::Status { .. });
                            yield Ok(to_sse_event(event));
                            if is_status {
                                break;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            // The runner finished without sending a final status
                            // event (process restart mid-flight); fall back to
                            // whatever ended up persisted.
                            if let Ok(Some(d)) = db.get_deployment(id).await {
                                yield Ok(to_sse_event(LogEvent::Status {
                                    status: d.status,
                                    exit_code: d.exit_code,
                                }));
                            }
                            break;
                        }
                    }
                }
            })
        } else {
            let events = replay_persisted(&deployment.stdout, &deployment.stderr);
            let status_event = LogEvent::Status {
                status: deployment.status,
                exit_code: deployment.exit_code,
            };
            Box::pin(stream::iter(
                events
                    .into_iter()
                    .chain(std::iter::once(status_event))
                    .map(|e| Ok(to_sse_event(e))),
            ))
        };

    let headers = [
        (header::CACHE_CONTROL, "no-cache"),
        (header::CONNECTION, "keep-alive"),
        (header::HeaderName::from_static("x-accel-buffering"), "no"),
    ];

    Ok((
        headers,
        Sse::new(body).keep_alive(KeepAlive::new().interval(Duration::from_millis(500))),
    ))
}
