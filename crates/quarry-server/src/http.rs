use std::convert::Infallible;
use std::time::Duration;

use async_stream::stream;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tower_http::cors::{Any, CorsLayer};
use tracing::debug;
use uuid::Uuid;

use quarry_core::{consumer_id, submit_hunt_job};
use quarry_store::{CasOutcome, CONSUMER_GROUP, JOB_STREAM};
use quarry_types::{HumanReview, HuntConfig, HuntEvent, Notebook, ReviewStatus};

use crate::AppState;

/// Comment padding emitted before any SSE data to defeat intermediary
/// buffering.
const SSE_PADDING_BYTES: usize = 2048;
const SSE_PING_INTERVAL: Duration = Duration::from_secs(15);
const SSE_RETRY: Duration = Duration::from_millis(500);

type ApiError = (StatusCode, Json<Value>);

fn api_error(status: StatusCode, detail: impl Into<String>) -> ApiError {
    (status, Json(json!({"detail": detail.into()})))
}

fn not_found(session_id: &str) -> ApiError {
    api_error(
        StatusCode::NOT_FOUND,
        format!("Session {session_id} not found"),
    )
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/sessions", post(create_session).get(list_sessions))
        .route("/hunt/start", post(start_hunt))
        .route("/hunt/stream/{session_id}", get(hunt_stream))
        .route("/results/{session_id}", get(results))
        .route("/breaking-results/{session_id}", get(breaking_results))
        .route("/review-results/{session_id}", get(review_results))
        .route("/export/{session_id}", get(export_results))
        .route("/turns/select", post(select_turn))
        .route("/review/sessions", get(review_sessions))
        .route("/review/status", post(review_status))
        .route("/review/{session_id}/reviews", put(put_reviews))
        .route("/models", get(models))
        .route("/health", get(health))
        .route("/admin/status", get(admin_status))
        .route("/admin/active-hunts", get(active_hunts))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CreateSessionInput {
    notebook: Notebook,
    #[serde(default)]
    config: Option<HuntConfig>,
}

async fn create_session(
    State(state): State<AppState>,
    Json(input): Json<CreateSessionInput>,
) -> Result<Json<Value>, ApiError> {
    let session_id = Uuid::new_v4().simple().to_string()[..8].to_string();
    let config = input.config.unwrap_or_default();
    state
        .store
        .create(&session_id, input.notebook, config)
        .await
        .map_err(|err| api_error(StatusCode::BAD_REQUEST, err.to_string()))?;
    Ok(Json(json!({"session_id": session_id})))
}

async fn list_sessions(State(state): State<AppState>) -> Json<Value> {
    Json(json!({"sessions": state.store.list_sessions().await}))
}

// ---------------------------------------------------------------------------
// Hunt
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct StartHuntInput {
    session_id: String,
    #[serde(default)]
    config: Option<HuntConfig>,
}

/// Synchronous variant: runs the hunt to completion in this process and
/// returns the final session summary.
async fn start_hunt(
    State(state): State<AppState>,
    Json(input): Json<StartHuntInput>,
) -> Result<Json<Value>, ApiError> {
    if state.store.get_full(&input.session_id).await.is_none() {
        return Err(not_found(&input.session_id));
    }
    if let Some(config) = input.config {
        state
            .store
            .set_config(&input.session_id, config)
            .await
            .map_err(|err| api_error(StatusCode::BAD_REQUEST, err.to_string()))?;
    }

    let session = state
        .engine
        .run_hunt(&input.session_id)
        .await
        .map_err(|err| api_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;

    Ok(Json(json!({
        "success": true,
        "session_id": session.session_id,
        "status": session.status,
        "completed_hunts": session.counters.completed_hunts,
        "breaks_found": session.counters.breaks_found,
        "results": session.results,
    })))
}

/// SSE progress stream. A fresh connect submits a hunt job to the shared
/// log; a reconnect carrying `Last-Event-ID` only replays what was missed.
/// Terminal events close the stream.
async fn hunt_stream(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    if state.store.get_full(&session_id).await.is_none() {
        return Err(not_found(&session_id));
    }

    let last_event_id = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    let is_reconnect = last_event_id.is_some();
    let from_id = last_event_id.unwrap_or(0);

    if !is_reconnect {
        submit_hunt_job(&state.jobs, &session_id).await;
    } else {
        debug!(session_id = %session_id, from_id, "sse reconnect, replaying missed events");
    }

    let events = stream! {
        yield Ok(Event::default().comment(" ".repeat(SSE_PADDING_BYTES)));

        let mut sub = state.bus.subscribe(&session_id, from_id).await;
        loop {
            match tokio::time::timeout(SSE_PING_INTERVAL, sub.next()).await {
                Ok(Some((id, event))) => {
                    let terminal = event.event_type.is_terminal();
                    yield Ok(sse_event(id, &event));
                    if terminal {
                        break;
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    yield Ok(Event::default().event("ping").data("{}"));
                }
            }
        }
    };

    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(Duration::from_secs(10))))
}

fn sse_event(id: u64, event: &HuntEvent) -> Event {
    let mut data = Map::new();
    data.insert("hunt_id".to_string(), json!(event.hunt_id));
    if let Some(object) = event.data.as_object() {
        for (key, value) in object {
            data.insert(key.clone(), value.clone());
        }
    }
    Event::default()
        .id(id.to_string())
        .event(event.event_type.as_str())
        .retry(SSE_RETRY)
        .data(Value::Object(data).to_string())
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

fn no_cache(body: Value) -> impl IntoResponse {
    (
        [
            (
                header::CACHE_CONTROL,
                "no-store, no-cache, must-revalidate",
            ),
            (header::PRAGMA, "no-cache"),
        ],
        Json(body),
    )
}

async fn results(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state
        .store
        .get_full(&session_id)
        .await
        .ok_or_else(|| not_found(&session_id))?;
    let results = state.engine.accumulated_results(&session_id).await;
    Ok(no_cache(json!({
        "count": results.len(),
        "results": results,
        "accumulated_count": session.counters.accumulated_hunt_count,
    })))
}

async fn breaking_results(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if state.store.get_full(&session_id).await.is_none() {
        return Err(not_found(&session_id));
    }
    let results = state.engine.breaking_results(&session_id).await;
    Ok(no_cache(json!({
        "count": results.len(),
        "results": results,
    })))
}

async fn review_results(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if state.store.get_full(&session_id).await.is_none() {
        return Err(not_found(&session_id));
    }
    let results = state.engine.select_for_review(&session_id).await;
    Ok(no_cache(json!({
        "count": results.len(),
        "results": results,
    })))
}

async fn export_results(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if state.store.get_full(&session_id).await.is_none() {
        return Err(not_found(&session_id));
    }
    let results = state.engine.export_results(&session_id).await;
    Ok(Json(json!({"count": results.len(), "results": results})))
}

// ---------------------------------------------------------------------------
// Turns
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SelectTurnInput {
    session_id: String,
    selected_hunt_id: u64,
    next_prompt: Option<String>,
    next_reference: Option<String>,
}

async fn select_turn(
    State(state): State<AppState>,
    Json(input): Json<SelectTurnInput>,
) -> Result<Json<Value>, ApiError> {
    let session = state
        .store
        .advance_turn(
            &input.session_id,
            input.selected_hunt_id,
            input.next_prompt,
            input.next_reference,
        )
        .await
        .map_err(|err| api_error(StatusCode::BAD_REQUEST, err.to_string()))?;
    Ok(Json(json!({
        "session_id": session.session_id,
        "current_turn": session.current_turn,
        "turns": session.turns,
        "hunt_offset": session.config.hunt_offset,
    })))
}

// ---------------------------------------------------------------------------
// Review
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
struct ReviewListQuery {
    #[serde(default)]
    email: String,
}

async fn review_sessions(
    State(state): State<AppState>,
    Query(query): Query<ReviewListQuery>,
) -> Json<Value> {
    let sessions = state
        .store
        .list_for_review(&query.email, &state.config.team)
        .await;
    Json(json!({"sessions": sessions}))
}

#[derive(Debug, Deserialize)]
struct ReviewStatusInput {
    session_id: String,
    expected: ReviewStatus,
    new: ReviewStatus,
}

/// CAS over review status: 200 on swap, 404 when the session is unknown,
/// 409 with the actual status on mismatch so the UI can refresh and retry.
async fn review_status(
    State(state): State<AppState>,
    Json(input): Json<ReviewStatusInput>,
) -> Result<Json<Value>, ApiError> {
    match state
        .store
        .cas_review_status(&input.session_id, input.expected, input.new)
        .await
    {
        CasOutcome::Swapped => Ok(Json(json!({"success": true, "status": input.new}))),
        CasOutcome::NotFound => Err(not_found(&input.session_id)),
        CasOutcome::Mismatch(actual) => Err((
            StatusCode::CONFLICT,
            Json(json!({
                "detail": "review status changed concurrently",
                "success": false,
                "status": actual,
            })),
        )),
    }
}

async fn put_reviews(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(reviews): Json<std::collections::BTreeMap<u8, HumanReview>>,
) -> Result<Json<Value>, ApiError> {
    state
        .store
        .set_human_reviews(&session_id, reviews)
        .await
        .map_err(|_| not_found(&session_id))?;
    Ok(Json(json!({"success": true})))
}

// ---------------------------------------------------------------------------
// Catalog, health, diagnostics
// ---------------------------------------------------------------------------

async fn models(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "models": state.config.hunt_models,
        "judge_models": state.config.judge_models,
    }))
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

async fn admin_status(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "consumer_id": consumer_id(),
        "started_at": state.started_at,
        "sessions": state.store.session_count().await,
        "job_stream": JOB_STREAM,
        "consumer_group": CONSUMER_GROUP,
        "job_log_len": state.jobs.len().await,
        "pending_jobs": state.jobs.pending_count().await,
    }))
}

async fn active_hunts(State(state): State<AppState>) -> Json<Value> {
    let active: Vec<Value> = state
        .heartbeats
        .active()
        .await
        .into_iter()
        .map(|(session_id, consumer_id)| {
            json!({"session_id": session_id, "consumer_id": consumer_id})
        })
        .collect();
    Json(json!({"count": active.len(), "active": active}))
}
