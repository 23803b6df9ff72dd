//! Thin HTTP adapter: parameter parsing and status mapping only.

use crate::attribute::InstanceIds;
use crate::config::{ApiConfig, QueryConfig};
use crate::layout::Resource;
use crate::pipeline::{IngestError, IngestPipeline, IngestReport};
use crate::query::{QueryError, QueryFilter, QueryLevel};
use crate::repair::{Repair, RepairError};
use crate::retrieve::{BulkListing, Payload, ReadService, RetrieveError};
use crate::store::ObjectStore;
use crate::thumbnail::RenderError;
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<IngestPipeline>,
    pub reader: Arc<ReadService>,
    pub repair: Arc<Repair>,
    pub store: Arc<dyn ObjectStore>,
    pub query: QueryConfig,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Outcome of an administrative study rebuild
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RebuildResponse {
    pub study_instance_uid: String,
    pub series: usize,
    pub instances: usize,
}

type ApiError = (StatusCode, Json<ErrorResponse>);
type QueryParams = Query<Vec<(String, String)>>;

fn api_error(status: StatusCode, code: &str, error: impl ToString) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            code: code.to_string(),
        }),
    )
}

fn ingest_error(e: IngestError) -> ApiError {
    if e.is_invalid_input() {
        api_error(StatusCode::BAD_REQUEST, "INVALID_INSTANCE", e)
    } else if e.is_transient() {
        api_error(StatusCode::SERVICE_UNAVAILABLE, "RETRY_LATER", e)
    } else {
        error!(error = %e, "Failed to store instance");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, "STORE_ERROR", e)
    }
}

fn query_error(e: QueryError) -> ApiError {
    api_error(StatusCode::BAD_REQUEST, "UNSUPPORTED_QUERY", e)
}

fn retrieve_error(e: RetrieveError) -> ApiError {
    match e {
        RetrieveError::NotFound(_) => api_error(StatusCode::NOT_FOUND, "NOT_FOUND", e),
        RetrieveError::InvalidIdentifier(_) => api_error(StatusCode::BAD_REQUEST, "INVALID_IDENTIFIER", e),
        RetrieveError::Query(e) => query_error(e),
        RetrieveError::Render(RenderError::Unsupported(_)) => {
            api_error(StatusCode::NOT_FOUND, "THUMBNAIL_UNAVAILABLE", e)
        }
        RetrieveError::Storage(ref source) if source.is_transient() => {
            api_error(StatusCode::SERVICE_UNAVAILABLE, "RETRY_LATER", e)
        }
        _ => {
            error!(error = %e, "Failed to read stored data");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "READ_ERROR", e)
        }
    }
}

fn repair_error(e: RepairError) -> ApiError {
    match e {
        RepairError::InvalidIdentifier(_) => api_error(StatusCode::BAD_REQUEST, "INVALID_IDENTIFIER", e),
        RepairError::NotFound(_) => api_error(StatusCode::NOT_FOUND, "NOT_FOUND", e),
        _ if e.is_transient() => api_error(StatusCode::SERVICE_UNAVAILABLE, "RETRY_LATER", e),
        _ => {
            error!(error = %e, "Repair failed");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "REPAIR_ERROR", e)
        }
    }
}

fn payload(payload: Payload) -> Response {
    ([(header::CONTENT_TYPE, payload.content_type)], payload.bytes).into_response()
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/studies", get(list_studies).post(store_instance))
        .route("/studies/:study/metadata", get(study_metadata))
        .route("/studies/:study/thumbnail", get(study_thumbnail))
        .route("/studies/:study/bulkdata", get(list_bulk_data))
        .route("/studies/:study/series", get(list_series))
        .route("/studies/:study/series/:series/metadata", get(series_metadata))
        .route("/studies/:study/series/:series/thumbnail", get(series_thumbnail))
        .route("/studies/:study/series/:series/instances", get(list_instances))
        .route(
            "/studies/:study/series/:series/instances/:instance/metadata",
            get(instance_metadata),
        )
        .route(
            "/studies/:study/series/:series/instances/:instance/thumbnail",
            get(instance_thumbnail),
        )
        .route(
            "/studies/:study/series/:series/instances/:instance/frames/:frame",
            get(frame),
        )
        .route(
            "/studies/:study/series/:series/instances/:instance/pixel-data",
            get(pixel_data),
        )
        .route(
            "/studies/:study/series/:series/instances/:instance/rendered",
            get(rendered),
        )
        .route("/bulkdata/*key", get(bulk_data))
        .route("/admin/studies/:study/rebuild", post(rebuild_study))
        .route("/admin/studies/:study/orphans", get(find_orphans).delete(collect_orphans))
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "static-dicomweb"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.list(crate::layout::STUDIES).await {
        Ok(_) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "storage": "reachable"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "storage": "unreachable",
                "error": e.to_string()
            })),
        ),
    }
}

/// Store one Part 10 instance
#[instrument(skip(state, body), fields(size = body.len()))]
async fn store_instance(State(state): State<AppState>, body: Bytes) -> Result<Json<IngestReport>, ApiError> {
    state.pipeline.store_instance(body).await.map(Json).map_err(ingest_error)
}

fn filter(state: &AppState, level: QueryLevel, params: Vec<(String, String)>) -> Result<QueryFilter, ApiError> {
    QueryFilter::from_params(level, params, &state.query).map_err(query_error)
}

#[instrument(skip(state))]
async fn list_studies(
    State(state): State<AppState>,
    Query(params): QueryParams,
) -> Result<Json<Vec<JsonValue>>, ApiError> {
    let filter = filter(&state, QueryLevel::Study, params)?;
    state.reader.list_studies(&filter).await.map(Json).map_err(retrieve_error)
}

#[instrument(skip(state))]
async fn list_series(
    State(state): State<AppState>,
    Path(study): Path<String>,
    Query(params): QueryParams,
) -> Result<Json<Vec<JsonValue>>, ApiError> {
    let filter = filter(&state, QueryLevel::Series, params)?;
    state.reader.list_series(&study, &filter).await.map(Json).map_err(retrieve_error)
}

#[instrument(skip(state))]
async fn list_instances(
    State(state): State<AppState>,
    Path((study, series)): Path<(String, String)>,
    Query(params): QueryParams,
) -> Result<Json<Vec<JsonValue>>, ApiError> {
    let filter = filter(&state, QueryLevel::Instance, params)?;
    state
        .reader
        .list_instances(&study, &series, &filter)
        .await
        .map(Json)
        .map_err(retrieve_error)
}

async fn study_metadata(
    State(state): State<AppState>,
    Path(study): Path<String>,
) -> Result<Json<JsonValue>, ApiError> {
    let document = state
        .reader
        .get_metadata(&Resource::Study(study))
        .await
        .map_err(retrieve_error)?;
    Ok(Json(document.to_json()))
}

async fn series_metadata(
    State(state): State<AppState>,
    Path((study, series)): Path<(String, String)>,
) -> Result<Json<Vec<JsonValue>>, ApiError> {
    state
        .reader
        .series_instance_metadata(&study, &series)
        .await
        .map(Json)
        .map_err(retrieve_error)
}

async fn instance_metadata(
    State(state): State<AppState>,
    Path((study, series, instance)): Path<(String, String, String)>,
) -> Result<Json<JsonValue>, ApiError> {
    let resource = Resource::Instance(InstanceIds::new(study, series, instance));
    let document = state.reader.get_metadata(&resource).await.map_err(retrieve_error)?;
    Ok(Json(document.to_json()))
}

async fn frame(
    State(state): State<AppState>,
    Path((study, series, instance, number)): Path<(String, String, String, u32)>,
) -> Result<Response, ApiError> {
    let ids = InstanceIds::new(study, series, instance);
    state
        .reader
        .get_frame(&ids, number)
        .await
        .map(payload)
        .map_err(retrieve_error)
}

async fn pixel_data(
    State(state): State<AppState>,
    Path((study, series, instance)): Path<(String, String, String)>,
) -> Result<Response, ApiError> {
    let ids = InstanceIds::new(study, series, instance);
    state
        .reader
        .get_pixel_data(&ids)
        .await
        .map(payload)
        .map_err(retrieve_error)
}

/// First frame through the thumbnail renderer
async fn rendered(
    State(state): State<AppState>,
    Path((study, series, instance)): Path<(String, String, String)>,
) -> Result<Response, ApiError> {
    let ids = InstanceIds::new(study, series, instance);
    state
        .reader
        .get_rendered(&ids, 1)
        .await
        .map(payload)
        .map_err(retrieve_error)
}

async fn list_bulk_data(
    State(state): State<AppState>,
    Path(study): Path<String>,
) -> Result<Json<Vec<BulkListing>>, ApiError> {
    state.reader.list_bulk_data(&study).await.map(Json).map_err(retrieve_error)
}

async fn bulk_data(State(state): State<AppState>, Path(key): Path<String>) -> Result<Response, ApiError> {
    state
        .reader
        .get_bulk_data(key.trim_start_matches('/'))
        .await
        .map(payload)
        .map_err(retrieve_error)
}

async fn thumbnail(state: &AppState, resource: Resource) -> Result<Response, ApiError> {
    state
        .reader
        .get_thumbnail(&resource)
        .await
        .map(payload)
        .map_err(retrieve_error)
}

async fn study_thumbnail(State(state): State<AppState>, Path(study): Path<String>) -> Result<Response, ApiError> {
    thumbnail(&state, Resource::Study(study)).await
}

async fn series_thumbnail(
    State(state): State<AppState>,
    Path((study, series)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    thumbnail(&state, Resource::Series(study, series)).await
}

async fn instance_thumbnail(
    State(state): State<AppState>,
    Path((study, series, instance)): Path<(String, String, String)>,
) -> Result<Response, ApiError> {
    thumbnail(&state, Resource::Instance(InstanceIds::new(study, series, instance))).await
}

/// Rebuild every series aggregate of a study, then the study aggregate
#[instrument(skip(state))]
async fn rebuild_study(
    State(state): State<AppState>,
    Path(study): Path<String>,
) -> Result<Json<RebuildResponse>, ApiError> {
    let rebuilt = state.repair.rebuild_study(&study).await.map_err(repair_error)?;
    Ok(Json(RebuildResponse {
        series: rebuilt.series.len(),
        instances: rebuilt.instance_count(),
        study_instance_uid: study,
    }))
}

async fn find_orphans(
    State(state): State<AppState>,
    Path(study): Path<String>,
) -> Result<Json<Vec<String>>, ApiError> {
    state.repair.find_orphans(&study).await.map(Json).map_err(repair_error)
}

/// Only safe while nothing is ingesting into the study
#[instrument(skip(state))]
async fn collect_orphans(
    State(state): State<AppState>,
    Path(study): Path<String>,
) -> Result<Json<Vec<String>>, ApiError> {
    state.repair.collect_orphans(&study).await.map(Json).map_err(repair_error)
}

/// Start the API server
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting DICOMweb API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")?;

    Ok(())
}
