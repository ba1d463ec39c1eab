use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::error;

use crate::issuance::IssuanceError;
use crate::sweep::SweepError;

#[derive(Debug, Serialize)]
struct ProblemDetails {
    #[serde(rename = "type")]
    problem_type: &'static str,
    title: &'static str,
    detail: String,
}

pub struct ProblemResponse {
    status: StatusCode,
    body: ProblemDetails,
}

impl ProblemResponse {
    pub fn new<S: Into<String>>(status: StatusCode, problem_type: &'static str, detail: S) -> Self {
        Self {
            status,
            body: ProblemDetails {
                problem_type,
                title: status.canonical_reason().unwrap_or("error"),
                detail: detail.into(),
            },
        }
    }
}

impl IntoResponse for ProblemResponse {
    fn into_response(self) -> Response {
        let mut response = Json(self.body).into_response();
        *response.status_mut() = self.status;
        response.headers_mut().insert(
            axum::http::header::CONTENT_TYPE,
            axum::http::HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}

impl From<IssuanceError> for ProblemResponse {
    fn from(err: IssuanceError) -> Self {
        match &err {
            IssuanceError::NotFound(entity) => Self::new(
                StatusCode::NOT_FOUND,
                "not_found",
                format!("{entity} not found"),
            ),
            IssuanceError::Forbidden(reason) => {
                Self::new(StatusCode::FORBIDDEN, "forbidden", *reason)
            }
            IssuanceError::Invalid(detail) => {
                Self::new(StatusCode::UNPROCESSABLE_ENTITY, "invalid_definition", detail.clone())
            }
            IssuanceError::CodeExhausted | IssuanceError::Authz(_) | IssuanceError::Storage(_) => {
                error!(stage = "http", error = %err, "issuance request failed");
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "the request could not be completed",
                )
            }
        }
    }
}

impl From<SweepError> for ProblemResponse {
    fn from(err: SweepError) -> Self {
        error!(stage = "http", error = %err, "sweep request failed");
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "sweep_failed",
            "the sweep could not load its candidates",
        )
    }
}
