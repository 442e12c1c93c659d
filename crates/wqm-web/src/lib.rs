//! JSON API over the monitor: number state, history, notifications,
//! schedules, manual triggers and a live change feed.

use std::convert::Infallible;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post, put},
    Json, Router,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_stream::{wrappers::BroadcastStream, Stream, StreamExt};
use tracing::{debug, info};
use uuid::Uuid;
use wqm_core::{group_by_day, BusinessManager, DueWindow, LocalClock, ScheduleTime};
use wqm_provider::StatusProvider;
use wqm_storage::{
    CredentialRepository, ExecutionLogRepository, HistoryStore, NotificationRepository,
    NumberRepository, ScheduleRegistry, Store,
};
use wqm_sync::{ReconcileSummary, ReconciliationEngine, SyncConfig, SyncRuntime, TriggerLoop};

mod error;

pub use error::{AppError, AppResult};

pub const CRATE_NAME: &str = "wqm-web";

const DEFAULT_HISTORY_DAYS: i64 = 30;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub engine: Arc<ReconciliationEngine>,
    pub trigger: Arc<TriggerLoop>,
    pub clock: LocalClock,
}

impl AppState {
    pub fn from_runtime(runtime: &SyncRuntime) -> Self {
        Self {
            store: Arc::clone(&runtime.store),
            engine: Arc::clone(&runtime.engine),
            trigger: Arc::clone(&runtime.trigger),
            clock: runtime.clock,
        }
    }

    pub fn from_parts(
        store: Arc<dyn Store>,
        provider: Arc<dyn StatusProvider>,
        clock: LocalClock,
    ) -> Self {
        let engine = Arc::new(ReconciliationEngine::new(Arc::clone(&store), provider));
        let trigger = Arc::new(TriggerLoop::new(
            Arc::clone(&engine),
            clock,
            DueWindow::default(),
        ));
        Self {
            store,
            engine,
            trigger,
            clock,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/trigger", post(trigger_handler))
        .route("/trigger/test", post(trigger_test_handler))
        .route("/projects/{id}/reconcile", post(reconcile_handler))
        .route(
            "/projects/{id}/numbers",
            get(numbers_handler).post(register_number_handler),
        )
        .route("/numbers/{id}", delete(delete_number_handler))
        .route("/numbers/{id}/history", get(history_handler))
        .route(
            "/numbers/{id}/notifications",
            delete(clear_notifications_handler),
        )
        .route("/projects/{id}/notifications", get(notifications_handler))
        .route(
            "/projects/{id}/schedules",
            get(list_schedules_handler).post(create_schedule_handler),
        )
        .route(
            "/projects/{id}/schedules/defaults",
            post(seed_schedules_handler),
        )
        .route(
            "/schedules/{id}",
            put(update_schedule_handler).delete(delete_schedule_handler),
        )
        .route("/business-managers/{id}", put(upsert_business_manager_handler))
        .route("/executions", get(executions_handler))
        .route("/events", get(events_handler))
        .with_state(Arc::new(state))
}

/// Serves the API and, when enabled, runs the cron tick in-process.
pub async fn serve(runtime: SyncRuntime) -> anyhow::Result<()> {
    let scheduler = runtime.maybe_build_scheduler().await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
        info!(cron = %runtime.config.tick_cron, "in-process trigger loop started");
    }

    let port = runtime.config.web_port;
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "listening");
    axum::serve(listener, app(AppState::from_runtime(&runtime))).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let runtime = SyncRuntime::connect(SyncConfig::from_env()).await?;
    serve(runtime).await
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "service": CRATE_NAME }))
}

async fn trigger_handler(State(state): State<Arc<AppState>>) -> AppResult<Response> {
    let result = state.trigger.run_tick(Utc::now()).await?;
    Ok(Json(result).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TestTriggerBody {
    #[serde(default)]
    project_ids: Vec<Uuid>,
}

async fn trigger_test_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<TestTriggerBody>,
) -> AppResult<Response> {
    if body.project_ids.is_empty() {
        return Err(AppError::Validation("projectIds must not be empty".into()));
    }
    let result = state
        .trigger
        .run_for_projects(&body.project_ids, Utc::now())
        .await?;
    Ok(Json(result).into_response())
}

#[derive(Debug, Serialize)]
struct ManualReconcileResponse {
    #[serde(flatten)]
    summary: ReconcileSummary,
    message: String,
}

async fn reconcile_handler(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<Uuid>,
) -> AppResult<Json<ManualReconcileResponse>> {
    let summary = state.engine.reconcile_project(project_id, Utc::now()).await?;
    Ok(Json(ManualReconcileResponse {
        message: summary.toast(),
        summary,
    }))
}

async fn numbers_handler(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<Uuid>,
) -> AppResult<Response> {
    let numbers = state.store.numbers_for_projects(&[project_id]).await?;
    Ok(Json(numbers).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterNumberBody {
    phone_number_id: String,
    business_manager_id: Option<Uuid>,
}

async fn register_number_handler(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<Uuid>,
    Json(body): Json<RegisterNumberBody>,
) -> AppResult<Response> {
    let number = state
        .engine
        .register_number(
            project_id,
            &body.phone_number_id,
            body.business_manager_id,
            Utc::now(),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(number)).into_response())
}

async fn delete_number_handler(
    State(state): State<Arc<AppState>>,
    Path(number_id): Path<Uuid>,
) -> AppResult<StatusCode> {
    state.store.delete_number(number_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize, Default)]
struct HistoryQuery {
    since: Option<DateTime<Utc>>,
    #[serde(default)]
    grouped: bool,
}

async fn history_handler(
    State(state): State<Arc<AppState>>,
    Path(number_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
) -> AppResult<Response> {
    let since = query
        .since
        .unwrap_or_else(|| Utc::now() - Duration::days(DEFAULT_HISTORY_DAYS));
    let entries = state.store.list_since(number_id, since).await?;
    if query.grouped {
        return Ok(Json(group_by_day(&entries, &state.clock)).into_response());
    }
    Ok(Json(entries).into_response())
}

#[derive(Debug, Deserialize, Default)]
struct LimitQuery {
    limit: Option<i64>,
}

impl LimitQuery {
    fn clamped(&self, default: i64) -> i64 {
        self.limit.unwrap_or(default).clamp(1, 500)
    }
}

async fn notifications_handler(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<Uuid>,
    Query(query): Query<LimitQuery>,
) -> AppResult<Response> {
    let notifications = state
        .store
        .notifications_for_project(project_id, query.clamped(50))
        .await?;
    Ok(Json(notifications).into_response())
}

async fn clear_notifications_handler(
    State(state): State<Arc<AppState>>,
    Path(number_id): Path<Uuid>,
) -> AppResult<Json<serde_json::Value>> {
    let cleared = state.store.clear_notifications_for_number(number_id).await?;
    Ok(Json(json!({ "cleared": cleared })))
}

async fn list_schedules_handler(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<Uuid>,
) -> AppResult<Response> {
    let schedules = state.store.list_schedules(project_id).await?;
    Ok(Json(schedules).into_response())
}

#[derive(Debug, Deserialize)]
struct ScheduleBody {
    time: String,
}

async fn create_schedule_handler(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<Uuid>,
    Json(body): Json<ScheduleBody>,
) -> AppResult<Response> {
    let time: ScheduleTime = body.time.parse()?;
    let schedule = state.store.create_schedule(project_id, time).await?;
    Ok((StatusCode::CREATED, Json(schedule)).into_response())
}

async fn seed_schedules_handler(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<Uuid>,
) -> AppResult<Response> {
    let schedules = state.store.seed_default_schedules(project_id).await?;
    Ok(Json(schedules).into_response())
}

async fn update_schedule_handler(
    State(state): State<Arc<AppState>>,
    Path(schedule_id): Path<Uuid>,
    Json(body): Json<ScheduleBody>,
) -> AppResult<Response> {
    let time: ScheduleTime = body.time.parse()?;
    let schedule = state.store.update_schedule(schedule_id, time).await?;
    Ok(Json(schedule).into_response())
}

async fn delete_schedule_handler(
    State(state): State<Arc<AppState>>,
    Path(schedule_id): Path<Uuid>,
) -> AppResult<StatusCode> {
    state.store.delete_schedule(schedule_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BusinessManagerBody {
    project_id: Uuid,
    name: String,
    waba_id: String,
    access_token: String,
}

async fn upsert_business_manager_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<BusinessManagerBody>,
) -> AppResult<Response> {
    if body.name.trim().is_empty() || body.waba_id.trim().is_empty() {
        return Err(AppError::Validation("name and wabaId are required".into()));
    }
    let bm = BusinessManager {
        id,
        project_id: body.project_id,
        name: body.name.trim().to_string(),
        waba_id: body.waba_id.trim().to_string(),
        access_token: body.access_token,
    };
    state.store.upsert_business_manager(&bm).await?;
    Ok(Json(bm).into_response())
}

async fn executions_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> AppResult<Response> {
    let logs = state.store.recent_executions(query.clamped(20)).await?;
    Ok(Json(logs).into_response())
}

async fn events_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(state.store.feed().subscribe()).filter_map(|item| match item {
        Ok(event) => serde_json::to_string(&event)
            .ok()
            .map(|data| Ok(Event::default().data(data))),
        Err(err) => {
            debug!(error = %err, "change feed subscriber lagged");
            None
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use tower::ServiceExt;
    use wqm_provider::{Credential, NumberDetail, ProviderError};
    use wqm_storage::MemoryStore;

    struct GreenProvider;

    #[async_trait]
    impl StatusProvider for GreenProvider {
        async fn fetch_number_detail(
            &self,
            phone_number_id: &str,
            _credential: &Credential,
        ) -> Result<NumberDetail, ProviderError> {
            if phone_number_id == "unreachable" {
                return Err(ProviderError::Network("connection refused".into()));
            }
            Ok(NumberDetail {
                id: Some(phone_number_id.to_string()),
                quality_rating: Some("GREEN".into()),
                messaging_limit_tier: Some("TIER_1K".into()),
                verified_name: Some("Loja Central".into()),
                ..Default::default()
            })
        }
    }

    fn test_app() -> Router {
        let clock = LocalClock::brasilia();
        app(AppState::from_parts(
            Arc::new(MemoryStore::new(clock)),
            Arc::new(GreenProvider),
            clock,
        ))
    }

    async fn send(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let resp = app.clone().oneshot(request).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn with_business_manager(app: &Router, project_id: Uuid) -> Uuid {
        let bm_id = Uuid::new_v4();
        let (status, body) = send(
            app,
            "PUT",
            &format!("/business-managers/{bm_id}"),
            Some(json!({
                "projectId": project_id,
                "name": "Main BM",
                "wabaId": "waba-1",
                "accessToken": "EAAG-secret"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.get("accessToken").is_none());
        bm_id
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let (status, body) = send(&test_app(), "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn eighth_schedule_is_a_conflict() {
        let app = test_app();
        let project_id = Uuid::new_v4();
        let base = format!("/projects/{project_id}/schedules");

        let (status, seeded) = send(&app, "POST", &format!("{base}/defaults"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(seeded.as_array().unwrap().len(), 3);
        assert_eq!(seeded[0]["time"], "06:00");

        for time in ["08:00", "09:30", "15:00", "21:45"] {
            let (status, _) = send(&app, "POST", &base, Some(json!({ "time": time }))).await;
            assert_eq!(status, StatusCode::CREATED);
        }
        let (status, body) = send(&app, "POST", &base, Some(json!({ "time": "23:00" }))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().contains('7'));

        let (_, listed) = send(&app, "GET", &base, None).await;
        assert_eq!(listed.as_array().unwrap().len(), 7);
    }

    #[tokio::test]
    async fn malformed_schedule_time_is_rejected() {
        let app = test_app();
        let uri = format!("/projects/{}/schedules", Uuid::new_v4());
        let (status, body) = send(&app, "POST", &uri, Some(json!({ "time": "25:00" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn schedule_edit_and_delete() {
        let app = test_app();
        let project_id = Uuid::new_v4();
        let (_, created) = send(
            &app,
            "POST",
            &format!("/projects/{project_id}/schedules"),
            Some(json!({ "time": "07:15" })),
        )
        .await;
        let id = created["id"].as_str().unwrap().to_string();

        let (status, updated) = send(
            &app,
            "PUT",
            &format!("/schedules/{id}"),
            Some(json!({ "time": "07:45" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["time"], "07:45");

        let (status, _) = send(&app, "DELETE", &format!("/schedules/{id}"), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&app, "DELETE", &format!("/schedules/{id}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn register_then_read_numbers_and_history() {
        let app = test_app();
        let project_id = Uuid::new_v4();
        let bm_id = with_business_manager(&app, project_id).await;

        let (status, number) = send(
            &app,
            "POST",
            &format!("/projects/{project_id}/numbers"),
            Some(json!({ "phoneNumberId": "109876", "businessManagerId": bm_id })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(number["qualityRating"], "HIGH");
        assert_eq!(number["messagingLimitTier"], "1000");
        let number_id = number["id"].as_str().unwrap().to_string();

        let (_, numbers) = send(&app, "GET", &format!("/projects/{project_id}/numbers"), None).await;
        assert_eq!(numbers.as_array().unwrap().len(), 1);

        let (_, history) = send(&app, "GET", &format!("/numbers/{number_id}/history"), None).await;
        assert_eq!(history[0]["observation"], "registered");

        let (status, groups) = send(
            &app,
            "GET",
            &format!("/numbers/{number_id}/history?grouped=true"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(groups[0]["lastQuality"], "HIGH");
        assert_eq!(groups[0]["changedWithinDay"], false);
    }

    #[tokio::test]
    async fn registration_failure_is_bad_gateway() {
        let app = test_app();
        let project_id = Uuid::new_v4();
        let bm_id = with_business_manager(&app, project_id).await;
        let (status, body) = send(
            &app,
            "POST",
            &format!("/projects/{project_id}/numbers"),
            Some(json!({ "phoneNumberId": "unreachable", "businessManagerId": bm_id })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(body["error"].as_str().unwrap().contains("connection refused"));

        let (status, _) = send(
            &app,
            "POST",
            &format!("/projects/{project_id}/numbers"),
            Some(json!({ "phoneNumberId": "109876" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn manual_reconcile_returns_toast() {
        let app = test_app();
        let project_id = Uuid::new_v4();
        let bm_id = with_business_manager(&app, project_id).await;
        send(
            &app,
            "POST",
            &format!("/projects/{project_id}/numbers"),
            Some(json!({ "phoneNumberId": "109876", "businessManagerId": bm_id })),
        )
        .await;

        let (status, body) = send(&app, "POST", &format!("/projects/{project_id}/reconcile"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["checked"], 1);
        assert_eq!(body["updated"], 0);
        assert_eq!(body["message"], "1 checked, 0 updated");
    }

    #[tokio::test]
    async fn trigger_endpoints_return_run_summary() {
        let app = test_app();
        let (status, body) = send(&app, "POST", "/trigger", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert!(body.get("schedulesFound").is_some());
        assert!(body.get("numbersUpdated").is_some());

        let (status, body) = send(&app, "POST", "/trigger/test", Some(json!({ "projectIds": [] }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());

        let (status, body) = send(
            &app,
            "POST",
            "/trigger/test",
            Some(json!({ "projectIds": [Uuid::new_v4()] })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["projectsChecked"], 1);

        let (_, logs) = send(&app, "GET", "/executions?limit=5", None).await;
        assert_eq!(logs.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn deleting_unknown_number_is_not_found() {
        let (status, body) = send(
            &test_app(),
            "DELETE",
            &format!("/numbers/{}", Uuid::new_v4()),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn clearing_notifications_reports_count() {
        let (status, body) = send(
            &test_app(),
            "DELETE",
            &format!("/numbers/{}/notifications", Uuid::new_v4()),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cleared"], 0);
    }

    #[tokio::test]
    async fn events_endpoint_is_an_sse_stream() {
        let resp = test_app()
            .oneshot(Request::builder().uri("/events").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE].to_str().unwrap(),
            "text/event-stream"
        );
    }
}
