//! HTTP API for sync runs
//!
//! The boundary a UI consumes: request a dry-run preview, confirm a
//! selection, follow the apply as a server-sent event stream, and read the
//! run history.
//!
//! # Routes
//!
//! - `GET /health` - Liveness probe
//! - `POST /preview` - Compute a change set (body: `{"filter": {...}}`)
//! - `POST /apply` - Apply a previewed change set (body:
//!   `{"change_set_id": "...", "selections": [...]}`), streamed as SSE
//! - `POST /cancel` - Cancel the apply in flight
//! - `GET /history?limit=N` - Past run reports, most recent first
//! - `GET /metrics` - Prometheus metrics
//!
//! The apply stream carries one `progress` event per [`SyncEvent`] and ends
//! with a single `report` event holding the [`SyncReport`] (or an `error`
//! event if the run could not start).

use crate::integrations::TaskFilter;
use crate::metrics;
use crate::model::{ChangeSet, ChangeSetId, StepId};
use crate::sync::{CancelToken, Selections, SyncEvent, SyncOrchestrator, SyncReport};
use crate::TaskSyncError;
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, oneshot};

/// Request bodies above this size are rejected
const MAX_BODY_SIZE: usize = 1024 * 1024;

/// Server error types
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bind error: {0}")]
    Bind(String),
}

/// Shared server state
struct AppState {
    orchestrator: Arc<SyncOrchestrator>,
    /// Cancellation handle of the apply in flight
    active_cancel: Mutex<Option<CancelToken>>,
}

/// HTTP server around a [`SyncOrchestrator`]
pub struct ApiServer {
    state: Arc<AppState>,
}

impl ApiServer {
    pub fn new(orchestrator: Arc<SyncOrchestrator>) -> Self {
        Self {
            state: Arc::new(AppState {
                orchestrator,
                active_cancel: Mutex::new(None),
            }),
        }
    }

    /// Build the router
    pub fn router(&self) -> Router {
        Self::build_router(self.state.clone())
    }

    fn build_router(state: Arc<AppState>) -> Router {
        Router::new()
            .route("/health", get(health))
            .route("/preview", post(preview))
            .route("/apply", post(apply))
            .route("/cancel", post(cancel))
            .route("/history", get(history))
            .route("/metrics", get(metrics_text))
            .layer(axum::extract::DefaultBodyLimit::max(MAX_BODY_SIZE))
            .with_state(state)
    }

    /// Run the server on the given address
    pub async fn run(self, addr: &str) -> Result<(), ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind(e.to_string()))?;

        tracing::info!(addr = addr, "Sync API listening");

        axum::serve(listener, Self::build_router(self.state))
            .await
            .map_err(ServerError::Io)
    }
}

// ============================================================================
// Request/Response types
// ============================================================================

/// Request for a preview
#[derive(Debug, Default, Deserialize)]
pub struct PreviewRequest {
    #[serde(default)]
    pub filter: TaskFilter,
}

/// Request to apply a previewed change set
#[derive(Debug, Deserialize)]
pub struct ApplyRequest {
    pub change_set_id: ChangeSetId,
    /// Step ids to apply; absent means every non-deferred item
    #[serde(default)]
    pub selections: Option<Vec<StepId>>,
}

impl ApplyRequest {
    fn selections(&self) -> Selections {
        match self.selections {
            Some(ref steps) => Selections::only(steps.iter().cloned()),
            None => Selections::All,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    pub limit: usize,
}

fn default_history_limit() -> usize {
    20
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: String,
}

/// Engine error rendered as an HTTP response
pub struct ApiError(TaskSyncError);

impl From<TaskSyncError> for ApiError {
    fn from(err: TaskSyncError) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self.0 {
            TaskSyncError::RunInProgress => StatusCode::CONFLICT,
            TaskSyncError::NotFound(_) => StatusCode::NOT_FOUND,
            TaskSyncError::Auth(_) => StatusCode::UNAUTHORIZED,
            TaskSyncError::Validation(_) => StatusCode::BAD_REQUEST,
            TaskSyncError::Transient(_) | TaskSyncError::RateLimited(_) | TaskSyncError::Http(_) => {
                StatusCode::BAD_GATEWAY
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        }
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
                kind: self.0.kind().to_string(),
            }),
        )
            .into_response()
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn preview(
    State(state): State<Arc<AppState>>,
    body: Option<Json<PreviewRequest>>,
) -> Result<Json<ChangeSet>, ApiError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let change_set = state.orchestrator.preview(&request.filter).await?;
    Ok(Json(change_set))
}

async fn apply(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ApplyRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let orchestrator = state.orchestrator.clone();
    if orchestrator.cached_preview(&request.change_set_id).is_none() {
        return Err(TaskSyncError::NotFound(format!("change set {}", request.change_set_id)).into());
    }
    // claimed before responding so a losing request gets a plain 409
    let slot = orchestrator.try_begin_apply()?;

    let events = orchestrator.subscribe();
    let (report_tx, report_rx) = oneshot::channel();
    let cancel = CancelToken::new();
    if let Ok(mut active) = state.active_cancel.lock() {
        *active = Some(cancel.clone());
    }

    let selections = request.selections();
    let task_state = state.clone();
    tokio::spawn(async move {
        let result = orchestrator
            .apply_by_id_in(slot, &request.change_set_id, &selections, &cancel)
            .await;
        clear_active_cancel(&task_state.active_cancel, &cancel);
        // the client may have gone away; the run is recorded either way
        let _ = report_tx.send(result);
    });

    Ok(Sse::new(apply_stream(events, report_rx)).keep_alive(KeepAlive::default()))
}

/// Forget the cancel handle of a finished run unless a newer run replaced it
fn clear_active_cancel(active: &Mutex<Option<CancelToken>>, finished: &CancelToken) {
    if let Ok(mut active) = active.lock() {
        if active.as_ref().is_some_and(|token| token.same_run(finished)) {
            *active = None;
        }
    }
}

async fn cancel(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let token = state
        .active_cancel
        .lock()
        .ok()
        .and_then(|active| active.clone())
        .ok_or_else(|| TaskSyncError::NotFound("no apply in progress".to_string()))?;
    token.cancel();
    tracing::info!("Apply cancellation requested");
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "cancelled": true })),
    ))
}

async fn history(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<SyncReport>>, ApiError> {
    Ok(Json(state.orchestrator.history(query.limit)?))
}

async fn metrics_text() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::encode_metrics(),
    )
}

// ============================================================================
// Apply stream
// ============================================================================

struct ApplyStream {
    events: broadcast::Receiver<SyncEvent>,
    report: oneshot::Receiver<crate::Result<SyncReport>>,
    pending: VecDeque<Event>,
    finished: bool,
}

impl ApplyStream {
    fn push_event(&mut self, event: &SyncEvent) {
        self.pending.push_back(sse_event("progress", event));
    }

    /// Queue whatever the orchestrator already sent, then the final event
    fn finish(&mut self, result: Result<crate::Result<SyncReport>, oneshot::error::RecvError>) {
        loop {
            match self.events.try_recv() {
                Ok(event) => self.push_event(&event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        let last = match result {
            Ok(Ok(report)) => sse_event("report", &report),
            Ok(Err(e)) => sse_event(
                "error",
                &ErrorResponse {
                    error: e.to_string(),
                    kind: e.kind().to_string(),
                },
            ),
            Err(_) => Event::default()
                .event("error")
                .data("apply task ended without a report"),
        };
        self.pending.push_back(last);
        self.finished = true;
    }
}

fn sse_event<T: Serialize>(name: &str, payload: &T) -> Event {
    Event::default()
        .event(name)
        .json_data(payload)
        .unwrap_or_else(|e| Event::default().event("error").data(e.to_string()))
}

fn apply_stream(
    events: broadcast::Receiver<SyncEvent>,
    report: oneshot::Receiver<crate::Result<SyncReport>>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let state = ApplyStream {
        events,
        report,
        pending: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut s| async move {
        loop {
            if let Some(event) = s.pending.pop_front() {
                return Some((Ok(event), s));
            }
            if s.finished {
                return None;
            }
            tokio::select! {
                biased;
                received = s.events.recv() => match received {
                    Ok(event) => s.push_event(&event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Apply stream lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        let result = (&mut s.report).await;
                        s.finish(result);
                    }
                },
                result = &mut s.report => s.finish(result),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrations::MemoryConnector;
    use crate::ledger::MemoryLedger;
    use crate::model::{SourceSystem, TaskFields};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn create_test_server() -> (ApiServer, Arc<MemoryConnector>) {
        let list = Arc::new(MemoryConnector::new(SourceSystem::ListService));
        let doc = Arc::new(MemoryConnector::new(SourceSystem::DocStore));
        let orchestrator =
            SyncOrchestrator::new(list.clone(), doc, Arc::new(MemoryLedger::new()));
        (ApiServer::new(Arc::new(orchestrator)), list)
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (server, _) = create_test_server();
        let response = server
            .router()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_preview_then_apply_streams_report() {
        let (server, list) = create_test_server();
        list.add_task("1", TaskFields::new("Pay rent")).unwrap();

        let response = server
            .router()
            .oneshot(post_json("/preview", serde_json::json!({ "filter": {} })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let change_set: ChangeSet = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(change_set.creates.len(), 1);

        let response = server
            .router()
            .oneshot(post_json(
                "/apply",
                serde_json::json!({ "change_set_id": change_set.id }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_string(response).await;

        assert!(body.contains("event: progress"));
        let report_at = body.find("event: report").expect("report event");
        let last_progress = body.rfind("event: progress").unwrap();
        assert!(last_progress < report_at);
        assert!(body.contains("\"total_applied\":1"));

        let response = server
            .router()
            .oneshot(Request::builder().uri("/history?limit=5").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let history: Vec<SyncReport> = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_change_set_is_404() {
        let (server, _) = create_test_server();
        let response = server
            .router()
            .oneshot(post_json(
                "/apply",
                serde_json::json!({ "change_set_id": "cs-nope", "selections": [] }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_cancel_without_run_is_404() {
        let (server, _) = create_test_server();
        let response = server
            .router()
            .oneshot(post_json("/cancel", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let (server, _) = create_test_server();
        let response = server
            .router()
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_apply_while_another_run_holds_slot() {
        let (server, list) = create_test_server();
        list.add_task("1", TaskFields::new("Pay rent")).unwrap();
        let orchestrator = server.state.orchestrator.clone();
        let change_set = orchestrator.preview(&TaskFilter::all()).await.unwrap();

        // a run in flight, with its cancel handle registered
        let running = orchestrator.try_begin_apply().unwrap();
        let running_cancel = CancelToken::new();
        *server.state.active_cancel.lock().unwrap() = Some(running_cancel.clone());

        let response = server
            .router()
            .oneshot(post_json(
                "/apply",
                serde_json::json!({ "change_set_id": change_set.id }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert!(body_string(response).await.contains("run_in_progress"));

        let response = server
            .router()
            .oneshot(post_json("/cancel", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert!(running_cancel.is_cancelled());

        drop(running);
        assert!(orchestrator.cached_preview(&change_set.id).is_some());
    }

    #[test]
    fn test_finished_run_keeps_newer_cancel_handle() {
        let active = Mutex::new(None);
        let finished = CancelToken::new();
        let newer = CancelToken::new();

        *active.lock().unwrap() = Some(newer.clone());
        clear_active_cancel(&active, &finished);
        assert!(active.lock().unwrap().as_ref().unwrap().same_run(&newer));

        clear_active_cancel(&active, &newer);
        assert!(active.lock().unwrap().is_none());
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            ApiError(TaskSyncError::RunInProgress).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError(TaskSyncError::Auth("bad token".into())).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError(TaskSyncError::NotFound("x".into())).status(),
            StatusCode::NOT_FOUND
        );
    }
}
