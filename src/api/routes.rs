// HTTP surface of the pod engine.
//
// Pod creation and deletion run for minutes, so by default they are queued as
// jobs and the caller polls GET /jobs/{id}. Passing `?wait=true` runs the
// workflow inline and answers with the pod report directly.
//
//   POST /pods            create a pod from a template for the caller
//   POST /pods/bulk       create one pod per name (admin)
//   POST /pods/delete     tear a pod down
//   GET  /pods            every pod (admin)
//   GET  /pods/mine       the caller's pods
//   GET  /jobs/{id}       job status
//   GET  /resources       cluster usage (admin)
//   GET  /templates       deployable templates
//   GET  /health          liveness, no auth

use axum::{
    extract::{Path, Query, Request, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::warn;
use uuid::Uuid;

use crate::api::error::ApiError;
use crate::api::middleware::auth::require_identity;
use crate::api::middleware::rate_limit::{enforce, GlobalRateLimit};
use crate::jobs::{JobKind, JobQueue};
use crate::pods::{authorize_deletion, PodManager, PodOutcome, PodReport};
use crate::users::{Identity, TokenAuthority};

const MAX_BODY_BYTES: usize = 64 * 1024;

pub struct AppState {
    pub manager: Arc<PodManager>,
    pub jobs: JobQueue,
    pub tokens: TokenAuthority,
    pub limits: GlobalRateLimit,
}

#[derive(Debug, Default, Deserialize)]
pub struct WaitQuery {
    #[serde(default)]
    pub wait: bool,
}

#[derive(Debug, Deserialize)]
pub struct CreatePodRequest {
    pub template_name: String,
}

#[derive(Debug, Deserialize)]
pub struct BulkCreateRequest {
    pub template: String,
    pub names: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct DeletePodRequest {
    pub pod_id: String,
}

#[derive(Debug, Serialize)]
pub struct JobAccepted {
    pub job_id: Uuid,
}

pub fn create_router(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/pods", post(create_pod).get(list_all_pods))
        .route("/pods/mine", get(list_my_pods))
        .route("/pods/bulk", post(bulk_create))
        .route("/pods/delete", post(delete_pod))
        .route("/jobs/{id}", get(get_job))
        .route("/resources", get(resources))
        .route("/templates", get(templates))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_identity));

    let api = Router::new().route("/health", get(health)).merge(protected);

    let prefix = state.manager.settings().server.api_prefix.trim_end_matches('/').to_string();
    let routed = if prefix.is_empty() {
        api
    } else {
        Router::new().nest(&prefix, api)
    };

    routed
        .fallback(fallback_handler)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(middleware::from_fn_with_state(state.limits.clone(), enforce))
                .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES)),
        )
        .with_state(state)
}

fn require_admin(identity: &Identity) -> Result<(), ApiError> {
    if identity.is_admin {
        Ok(())
    } else {
        Err(ApiError::Forbidden(format!("{} is not an admin", identity.username)))
    }
}

fn accepted(job_id: Uuid) -> Response {
    (StatusCode::ACCEPTED, Json(JobAccepted { job_id })).into_response()
}

/// 200 complete, 206 partial (pod kept), 500 rolled back or failed.
fn report_response(report: PodReport) -> Response {
    let status = match report.outcome {
        PodOutcome::Complete => StatusCode::OK,
        PodOutcome::Partial => StatusCode::PARTIAL_CONTENT,
        PodOutcome::RolledBack | PodOutcome::Failed => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(report)).into_response()
}

async fn health() -> &'static str {
    "ok"
}

async fn create_pod(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Query(query): Query<WaitQuery>,
    Json(request): Json<CreatePodRequest>,
) -> Result<Response, ApiError> {
    let template = request.template_name.trim().to_string();
    if template.is_empty() {
        return Err(ApiError::BadRequest("template_name is required".to_string()));
    }

    if query.wait {
        let report = state.manager.provision_pod(&template, &identity.username).await?;
        return Ok(report_response(report));
    }

    state.manager.check_template(&template).await?;
    let kind = JobKind::CreatePod {
        template,
        owner: identity.username.clone(),
    };
    Ok(accepted(state.jobs.enqueue(kind, &identity).await?))
}

async fn bulk_create(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Query(query): Query<WaitQuery>,
    Json(request): Json<BulkCreateRequest>,
) -> Result<Response, ApiError> {
    require_admin(&identity)?;
    let template = request.template.trim().to_string();
    if template.is_empty() {
        return Err(ApiError::BadRequest("template is required".to_string()));
    }

    if query.wait {
        let report = state.manager.provision_bulk(&template, &request.names).await?;
        return Ok(Json(report).into_response());
    }

    let kind = JobKind::BulkCreate {
        template,
        owners: request.names,
    };
    Ok(accepted(state.jobs.enqueue(kind, &identity).await?))
}

async fn delete_pod(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Query(query): Query<WaitQuery>,
    Json(request): Json<DeletePodRequest>,
) -> Result<Response, ApiError> {
    let pod_name = request.pod_id.trim().to_string();
    if pod_name.is_empty() {
        return Err(ApiError::BadRequest("pod_id is required".to_string()));
    }

    authorize_deletion(&pod_name, &identity)?;
    if query.wait {
        let report = state.manager.deprovision_pod(&pod_name, &identity).await?;
        return Ok(report_response(report));
    }

    Ok(accepted(state.jobs.enqueue(JobKind::DeletePod { pod_name }, &identity).await?))
}

async fn list_all_pods(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
) -> Result<Response, ApiError> {
    require_admin(&identity)?;
    let pods = state.manager.list_pods(None).await?;
    Ok(Json(json!({ "pods": pods })).into_response())
}

async fn list_my_pods(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
) -> Result<Response, ApiError> {
    let pods = state.manager.list_pods(Some(&identity.username)).await?;
    Ok(Json(json!({ "pods": pods })).into_response())
}

async fn get_job(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let record = state.jobs.get_for(id, &identity).await?;
    Ok(Json(record).into_response())
}

async fn resources(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
) -> Result<Response, ApiError> {
    require_admin(&identity)?;
    let usage = state.manager.cluster_usage().await?;
    let status = if usage.is_partial() {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };
    Ok((status, Json(usage)).into_response())
}

async fn templates(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
) -> Result<Response, ApiError> {
    let registry = state.manager.templates();
    let records = if identity.is_admin {
        registry.list_all().await?
    } else {
        registry.list_visible().await?
    };
    Ok(Json(json!({ "templates": records })).into_response())
}

async fn fallback_handler(req: Request) -> StatusCode {
    warn!(method = %req.method(), path = %req.uri().path(), "No route");
    StatusCode::NOT_FOUND
}
