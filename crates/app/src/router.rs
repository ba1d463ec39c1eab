use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::{json, Value};

use certwatch_core::types::{CertificateDefinition, OperationContext};
use certwatch_storage::Database;

use crate::issuance::{IssuanceService, IssuanceView, VerificationView};
use crate::problem::ProblemResponse;
use crate::sweep::{NotificationSweep, SweepSummary};
use crate::telemetry;

const HEADER_ACTOR_ID: &str = "X-Actor-Id";
const HEADER_COMPANY_ID: &str = "X-Company-Id";

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    storage: Database,
    sweep: NotificationSweep,
    issuance: IssuanceService,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

impl AppState {
    pub fn new(
        metrics: PrometheusHandle,
        storage: Database,
        sweep: NotificationSweep,
        issuance: IssuanceService,
    ) -> Self {
        Self {
            metrics,
            storage,
            sweep,
            issuance,
            clock: Arc::new(Utc::now),
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>) -> Self {
        self.sweep = self.sweep.with_clock(clock.clone());
        self.clock = clock;
        self
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn storage(&self) -> &Database {
        &self.storage
    }

    pub fn sweep(&self) -> &NotificationSweep {
        &self.sweep
    }

    pub fn issuance(&self) -> &IssuanceService {
        &self.issuance
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/tasks/reminder-sweep", post(reminder_sweep))
        .route("/tasks/expiry-sweep", post(expiry_sweep))
        .route("/certificates/:definition_id/issue", post(issue_certificate))
        .route("/certificates/verify/:code", get(verify_certificate))
        .route("/definitions/:definition_id", put(update_definition))
        .with_state(state)
}

async fn healthz(State(state): State<AppState>) -> Result<StatusCode, ProblemResponse> {
    sqlx::query("SELECT 1")
        .execute(state.storage().pool())
        .await
        .map_err(|err| {
            ProblemResponse::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "database_unavailable",
                err.to_string(),
            )
        })?;
    Ok(StatusCode::OK)
}

async fn metrics(State(state): State<AppState>) -> Response {
    let body = telemetry::render_metrics(state.metrics());
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}

async fn reminder_sweep(
    State(state): State<AppState>,
) -> Result<Json<SweepSummary>, ProblemResponse> {
    Ok(Json(state.sweep().run_reminder_sweep().await?))
}

async fn expiry_sweep(State(state): State<AppState>) -> Result<Json<SweepSummary>, ProblemResponse> {
    Ok(Json(state.sweep().run_expiry_sweep().await?))
}

#[derive(Debug, Deserialize)]
struct IssueRequest {
    user_id: i64,
}

async fn issue_certificate(
    State(state): State<AppState>,
    Path(definition_id): Path<i64>,
    headers: HeaderMap,
    Json(request): Json<IssueRequest>,
) -> Result<Json<IssuanceView>, ProblemResponse> {
    let ctx = operation_context(&headers, state.now())?;
    let view = state
        .issuance()
        .issue(&ctx, definition_id, request.user_id)
        .await?;
    Ok(Json(view))
}

async fn verify_certificate(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<VerificationView>, ProblemResponse> {
    Ok(Json(state.issuance().verify(&code, state.now()).await?))
}

async fn update_definition(
    State(state): State<AppState>,
    Path(definition_id): Path<i64>,
    headers: HeaderMap,
    Json(mut body): Json<Value>,
) -> Result<Json<CertificateDefinition>, ProblemResponse> {
    let ctx = operation_context(&headers, state.now())?;

    let Some(fields) = body.as_object_mut() else {
        return Err(ProblemResponse::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            "invalid_definition",
            "definition must be a JSON object",
        ));
    };
    fields.insert("id".to_string(), json!(definition_id));

    let definition: CertificateDefinition = serde_json::from_value(body).map_err(|err| {
        ProblemResponse::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            "invalid_definition",
            format!("failed to parse definition: {err}"),
        )
    })?;

    let saved = state.issuance().update_definition(&ctx, definition).await?;
    Ok(Json(saved))
}

/// Builds the explicit operation context from request headers.
fn operation_context(
    headers: &HeaderMap,
    now: DateTime<Utc>,
) -> Result<OperationContext, ProblemResponse> {
    let actor_id = headers
        .get(HEADER_ACTOR_ID)
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.trim().parse::<i64>().ok())
        .ok_or_else(|| {
            ProblemResponse::new(
                StatusCode::UNAUTHORIZED,
                "missing_actor",
                format!("{HEADER_ACTOR_ID} header must carry a user id"),
            )
        })?;

    let company_id = match headers.get(HEADER_COMPANY_ID) {
        None => None,
        Some(value) => Some(
            value
                .to_str()
                .ok()
                .and_then(|raw| raw.trim().parse::<i64>().ok())
                .ok_or_else(|| {
                    ProblemResponse::new(
                        StatusCode::BAD_REQUEST,
                        "invalid_company",
                        format!("{HEADER_COMPANY_ID} header must be numeric"),
                    )
                })?,
        ),
    };

    Ok(OperationContext::new(actor_id, company_id, now))
}
