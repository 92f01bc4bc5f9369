pub mod error;
pub mod handlers;

use axum::{
    routing::{get, post},
    Json, Router,
};
use harmony_application::AppState;
use harmony_providers::HealthSnapshot;
use handlers::queue::{
    enqueue_job, list_dead_letters, list_jobs, purge_dead_letters, queue_stats,
    requeue_dead_letters, DeadLetterResponse, DlqBatchRequest, DlqBatchResponse, EnqueueRequest,
    EnqueueResponse, JobResponse, QueueStatsResponse, __path_enqueue_job, __path_list_dead_letters,
    __path_list_jobs, __path_purge_dead_letters, __path_queue_stats, __path_requeue_dead_letters,
};
use serde::Serialize;
use tokio::sync::watch;
use tracing::info;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

/// Router state: the application plus the provider health feed.
#[derive(Clone)]
pub struct ApiState {
    pub app: AppState,
    pub health: Option<watch::Receiver<HealthSnapshot>>,
}

#[derive(Serialize, utoipa::ToSchema)]
struct HealthResponse {
    status: &'static str,
    providers: Option<serde_json::Value>,
}

async fn health_handler(
    axum::extract::State(state): axum::extract::State<ApiState>,
) -> Json<HealthResponse> {
    let providers = state
        .health
        .as_ref()
        .map(|rx| serde_json::to_value(rx.borrow().clone()).unwrap_or_default());
    Json(HealthResponse {
        status: "ok",
        providers,
    })
}

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    ),
    tag = "system"
)]
#[allow(dead_code)]
async fn health() {}

#[derive(OpenApi)]
#[openapi(
    paths(
        health,
        enqueue_job,
        list_jobs,
        queue_stats,
        list_dead_letters,
        requeue_dead_letters,
        purge_dead_letters,
    ),
    components(
        schemas(
            HealthResponse,
            EnqueueRequest,
            EnqueueResponse,
            JobResponse,
            QueueStatsResponse,
            DeadLetterResponse,
            DlqBatchRequest,
            DlqBatchResponse,
            error::ErrorBody,
        )
    ),
    tags(
        (name = "system", description = "System health and status endpoints"),
        (name = "queue", description = "Queue introspection and dead-letter management")
    ),
    info(
        title = "Harmony API",
        version = "0.1.0",
        description = "Job orchestration and ingest engine for the Harmony music hub",
    )
)]
struct ApiDoc;

pub fn router(state: ApiState) -> Router {
    info!(target: "api", "building router");

    let api_v1 = Router::new()
        .route("/queue/jobs", get(list_jobs).post(enqueue_job))
        .route("/queue/stats", get(queue_stats))
        .route("/queue/dead-letter", get(list_dead_letters))
        .route("/queue/dead-letter/requeue", post(requeue_dead_letters))
        .route("/queue/dead-letter/purge", post(purge_dead_letters))
        .route(
            "/watchlist",
            get(handlers::watchlist::list_watchlist).post(handlers::watchlist::upsert_watchlist),
        )
        .route(
            "/watchlist/:artist_key/pause",
            post(handlers::watchlist::pause_watchlist),
        )
        .route(
            "/watchlist/:artist_key",
            axum::routing::delete(handlers::watchlist::delete_watchlist),
        )
        .route("/ingest", post(handlers::ingest::submit_ingest))
        .route("/artists/:artist_key", get(handlers::artists::get_artist))
        .route(
            "/artists/:artist_key/audit",
            get(handlers::artists::get_artist_audits),
        );

    let openapi = ApiDoc::openapi();

    Router::new()
        .route("/health", get(health_handler))
        .nest("/api/v1", api_v1)
        .merge(SwaggerUi::new("/docs").url("/api-doc/openapi.json", openapi))
        .with_state(state)
}
