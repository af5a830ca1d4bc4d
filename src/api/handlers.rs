//! API request handlers.

use std::collections::BTreeSet;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use super::{ApiError, ApiResult, ApiState};
use crate::content::PostId;
use crate::metrics::MetricsSnapshot;
use crate::progress::ProgressSnapshot;
use crate::queue::{EnqueueRequest, QueueItem, QueueStats, QueueStatus};
use crate::relationship::Relationship;
use crate::translation_log::LogEntry;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[derive(Debug, Deserialize)]
pub struct TranslateBody {
    pub post_id: PostId,
    #[serde(default)]
    pub languages: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ProgressStarted {
    pub progress_id: String,
    /// False when a resume found nothing left to do.
    pub started: bool,
}

fn or_default(languages: Vec<String>, state: &ApiState) -> Vec<String> {
    if languages.is_empty() {
        state.default_languages.clone()
    } else {
        languages
    }
}

/// Start a background translation run.
pub async fn translate(
    State(state): State<ApiState>,
    Json(body): Json<TranslateBody>,
) -> ApiResult<(StatusCode, Json<ProgressStarted>)> {
    let languages = or_default(body.languages, &state);
    let progress_id = state.engine.spawn_translation(body.post_id, &languages)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(ProgressStarted {
            progress_id,
            started: true,
        }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct SinceQuery {
    #[serde(default)]
    pub since: usize,
}

pub async fn progress(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(query): Query<SinceQuery>,
) -> ApiResult<Json<ProgressSnapshot>> {
    state
        .engine
        .progress()
        .poll(&id, query.since)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("unknown progress id {id}")))
}

pub async fn resume(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<ProgressStarted>)> {
    let started = state.engine.spawn_resume(&id)?;
    let status = if started { StatusCode::ACCEPTED } else { StatusCode::OK };
    Ok((
        status,
        Json(ProgressStarted {
            progress_id: id,
            started,
        }),
    ))
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

pub async fn cancel(State(state): State<ApiState>, Path(id): Path<String>) -> Json<CancelResponse> {
    Json(CancelResponse {
        cancelled: state.engine.progress().cancel(&id),
    })
}

#[derive(Debug, Deserialize)]
pub struct EnqueueBody {
    pub post_id: PostId,
    #[serde(default)]
    pub languages: Vec<String>,
    pub priority: Option<u8>,
    pub scheduled_time: Option<i64>,
    pub max_attempts: Option<u32>,
}

pub async fn enqueue(
    State(state): State<ApiState>,
    Json(body): Json<EnqueueBody>,
) -> ApiResult<(StatusCode, Json<QueueItem>)> {
    if state.engine.posts().get_post(body.post_id)?.is_none() {
        return Err(ApiError::not_found(format!("post {} not found", body.post_id)));
    }
    let target_languages: BTreeSet<String> = or_default(body.languages, &state)
        .into_iter()
        .map(|l| l.trim().to_lowercase())
        .filter(|l| !l.is_empty())
        .collect();
    let item = state.queue.enqueue(&EnqueueRequest {
        post_id: body.post_id,
        target_languages,
        priority: body.priority.unwrap_or(state.default_priority),
        scheduled_time: body.scheduled_time,
        max_attempts: body.max_attempts.unwrap_or(state.default_max_attempts),
    })?;
    Ok((StatusCode::CREATED, Json(item)))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<QueueStatus>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

pub async fn list_queue(
    State(state): State<ApiState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<QueueItem>>> {
    Ok(Json(state.queue.list(query.status, query.limit)?))
}

#[derive(Debug, Deserialize)]
pub struct ClearQuery {
    pub status: Option<QueueStatus>,
}

#[derive(Debug, Serialize)]
pub struct ClearResponse {
    pub removed: usize,
}

pub async fn clear_queue(
    State(state): State<ApiState>,
    Query(query): Query<ClearQuery>,
) -> ApiResult<Json<ClearResponse>> {
    let removed = state.queue.clear(query.status)?;
    Ok(Json(ClearResponse { removed }))
}

pub async fn queue_stats(State(state): State<ApiState>) -> ApiResult<Json<QueueStats>> {
    Ok(Json(state.queue.stats()?))
}

pub async fn pause_queue(State(state): State<ApiState>) -> ApiResult<Json<QueueStats>> {
    state.queue.pause()?;
    Ok(Json(state.queue.stats()?))
}

pub async fn resume_queue(State(state): State<ApiState>) -> ApiResult<Json<QueueStats>> {
    state.queue.resume()?;
    Ok(Json(state.queue.stats()?))
}

pub async fn retry_item(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<QueueItem>> {
    Ok(Json(state.queue.retry(id)?))
}

pub async fn translations(
    State(state): State<ApiState>,
    Path(id): Path<PostId>,
) -> ApiResult<Json<Vec<Relationship>>> {
    Ok(Json(state.engine.relationships().translations_of(id)?))
}

#[derive(Debug, Serialize)]
pub struct UnlinkResponse {
    pub removed: bool,
}

pub async fn unlink(
    State(state): State<ApiState>,
    Path((id, lang)): Path<(PostId, String)>,
) -> ApiResult<Json<UnlinkResponse>> {
    if !state.engine.unlink(id, &lang)? {
        return Err(ApiError::not_found(format!("post {id} has no {lang} translation")));
    }
    Ok(Json(UnlinkResponse { removed: true }))
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub post_id: Option<PostId>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

pub async fn logs(
    State(state): State<ApiState>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Json<Vec<LogEntry>>> {
    let log = state.engine.log();
    let entries = match query.post_id {
        Some(post_id) => log.for_post(post_id, query.limit)?,
        None => log.recent(query.limit)?,
    };
    Ok(Json(entries))
}

pub async fn metrics(State(state): State<ApiState>) -> Json<MetricsSnapshot> {
    Json(state.engine.metrics().snapshot())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Method, Request};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::super::create_router;
    use super::*;
    use crate::engine::tests::{harness, seed, Harness};
    use crate::queue::QueueStore;
    use crate::storage::Database;
    use crate::translate::mock::MockTranslator;

    fn app(h: &Harness) -> axum::Router {
        create_router(ApiState {
            engine: h.engine.clone(),
            queue: Arc::new(QueueStore::open(&Database::memory(), 60).unwrap()),
            default_languages: vec!["fr".into()],
            default_priority: 5,
            default_max_attempts: 3,
        })
    }

    async fn call(
        app: &axum::Router,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => request
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let h = harness(MockTranslator::new());
        let (status, body) = call(&app(&h), Method::GET, "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test(start_paused = true)]
    async fn test_translate_then_poll_progress() {
        let h = harness(MockTranslator::new());
        let source = seed(&h.posts);
        let app = app(&h);

        let body = json!({ "post_id": source });
        let (status, body) = call(&app, Method::POST, "/api/translate", Some(body)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let progress_id = body["progress_id"].as_str().unwrap().to_string();

        let uri = format!("/api/progress/{progress_id}?since=0");
        let snapshot = loop {
            let (status, snapshot) = call(&app, Method::GET, &uri, None).await;
            assert_eq!(status, StatusCode::OK);
            if snapshot["finished"] == true {
                break snapshot;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        assert_eq!(snapshot["status"], "completed");

        let uri = format!("/api/posts/{source}/translations");
        let (_, rels) = call(&app, Method::GET, &uri, None).await;
        assert_eq!(rels.as_array().unwrap().len(), 1);
        assert_eq!(rels[0]["target_language"], "fr");

        let uri = format!("/api/progress/{progress_id}/resume");
        let (status, resumed) = call(&app, Method::POST, &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(resumed["started"], false);
    }

    #[tokio::test]
    async fn test_unknown_post_and_progress_are_404() {
        let h = harness(MockTranslator::new());
        let app = app(&h);
        let body = json!({ "post_id": 77 });
        let (status, body) = call(&app, Method::POST, "/api/translate", Some(body)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["ok"], false);

        let (status, _) = call(&app, Method::GET, "/api/progress/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&app, Method::POST, "/api/progress/nope/resume", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_queue_routes() {
        let h = harness(MockTranslator::new());
        let source = seed(&h.posts);
        let app = app(&h);

        let (status, item) = call(
            &app,
            Method::POST,
            "/api/queue",
            Some(json!({ "post_id": source, "languages": ["de", "FR"], "priority": 8 })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(item["priority"], 8);
        assert_eq!(item["target_languages"], json!(["de", "fr"]));

        let (status, _) = call(
            &app,
            Method::POST,
            "/api/queue",
            Some(json!({ "post_id": source, "priority": 12 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, stats) = call(&app, Method::POST, "/api/queue/pause", None).await;
        assert_eq!(stats["paused"], true);
        assert_eq!(stats["pending"], 1);
        let (_, stats) = call(&app, Method::POST, "/api/queue/resume", None).await;
        assert_eq!(stats["paused"], false);

        let (_, items) = call(&app, Method::GET, "/api/queue?status=pending", None).await;
        assert_eq!(items.as_array().unwrap().len(), 1);

        let id = item["id"].as_i64().unwrap();
        let (status, _) = call(&app, Method::POST, &format!("/api/queue/{id}/retry"), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "pending items cannot be retried");

        let (status, cleared) =
            call(&app, Method::DELETE, "/api/queue?status=completed", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(cleared["removed"], 0);
    }

    #[tokio::test]
    async fn test_unlink_route() {
        let h = harness(MockTranslator::new());
        let source = seed(&h.posts);
        h.engine.translate_post(source, &["de".to_string()]).await.unwrap();
        let app = app(&h);

        // stored languages are lowercase; the path segment is normalised to match
        let upper = format!("/api/posts/{source}/translations/DE");
        let (status, body) = call(&app, Method::DELETE, &upper, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["removed"], true);
        let uri = format!("/api/posts/{source}/translations/de");
        let (status, _) = call(&app, Method::DELETE, &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        h.engine.log().flush().await;
        let (_, logs) = call(&app, Method::GET, &format!("/api/logs?post_id={source}"), None).await;
        assert_eq!(logs.as_array().unwrap().len(), 2);

        let (_, metrics) = call(&app, Method::GET, "/api/metrics", None).await;
        assert_eq!(metrics["counters"]["api_calls"], 4);
    }
}
