//! HTTP API.
//!
//! Every response carries the envelope `{"code", "message", "data"}` with
//! `code` mirrored onto the HTTP status. Handlers are thin: they authorize,
//! parse, call [`DataLinkService`] and wrap the result.

mod auth;
mod data;
mod sources;

use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::extract::multipart::MultipartRejection;
use axum::extract::rejection::PathRejection;
use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use serde::Serialize;
use serde_json::Value;
use tracing::{error, warn};

use crate::catalog::CatalogError;
use crate::error::ServiceError;
use crate::service::DataLinkService;
use crate::transfer::TransferError;

pub use auth::{ADMIN_KEY_HEADER, TOKEN_HEADER};

/// Response envelope.
#[derive(Debug, Serialize)]
pub struct Envelope<T: Serialize> {
    /// HTTP status code.
    pub code: u16,
    /// Human-readable outcome.
    pub message: String,
    /// Payload, `null` on errors.
    pub data: Option<T>,
}

/// A successful response.
pub(crate) fn ok<T: Serialize>(message: impl Into<String>, data: T) -> Response {
    let envelope = Envelope {
        code: StatusCode::OK.as_u16(),
        message: message.into(),
        data: Some(data),
    };
    (StatusCode::OK, Json(envelope)).into_response()
}

/// Error returned by handlers; renders as an envelope with `data: null`.
#[derive(Debug)]
pub struct ApiError(pub ServiceError);

impl From<ServiceError> for ApiError {
    fn from(error: ServiceError) -> Self {
        Self(error)
    }
}

impl From<CatalogError> for ApiError {
    fn from(error: CatalogError) -> Self {
        Self(error.into())
    }
}

impl From<TransferError> for ApiError {
    fn from(error: TransferError) -> Self {
        Self(error.into())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self(ServiceError::validation(rejection.body_text()))
    }
}

impl From<MultipartRejection> for ApiError {
    fn from(rejection: MultipartRejection) -> Self {
        Self(ServiceError::validation(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.0.status_code();
        let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!(code, error = %self.0, "request failed");
        } else {
            warn!(code, error = %self.0, "request rejected");
        }
        let envelope: Envelope<Value> = Envelope {
            code,
            message: self.0.to_string(),
            data: None,
        };
        (status, Json(envelope)).into_response()
    }
}

pub(crate) type ApiResult = Result<Response, ApiError>;

/// Builds the router.
///
/// The request timeout applies to every route except uploads, which also
/// have the body size limit lifted (the upload byte limit is enforced while
/// streaming).
pub fn router(service: DataLinkService) -> Router {
    let timed = Router::new()
        .route("/sources", get(sources::list))
        .route("/sources/:id", get(sources::show))
        .route("/sources/:id/catalog", get(sources::catalog))
        .route("/sources/:id/update", put(sources::refresh))
        .route("/search", get(sources::search))
        .route("/search/:pdb", get(sources::search_pdb))
        .route("/stats", get(data::stats))
        .route("/data", get(data::view_all))
        .route("/data/:user", get(data::view_user))
        .route("/data/:user/:source", get(data::view_source))
        .route(
            "/data/:user/:source/:id",
            get(data::view_entry)
                .put(data::fetch)
                .delete(data::remove)
                .patch(data::update),
        )
        .route("/data/:user/:source/:id/abort", post(data::abort))
        .layer(middleware::from_fn_with_state(service.clone(), request_timeout));

    let uploads = Router::new()
        .route("/data/:user/:source/:id/upload", post(data::upload))
        .layer(DefaultBodyLimit::disable());

    timed.merge(uploads).fallback(not_found).with_state(service)
}

async fn request_timeout(
    State(service): State<DataLinkService>,
    request: Request,
    next: Next,
) -> Response {
    let limit = Duration::from_secs(service.config().request_timeout_secs);
    match tokio::time::timeout(limit, next.run(request)).await {
        Ok(response) => response,
        Err(_) => ApiError(ServiceError::Internal(format!(
            "request timed out after {}s",
            limit.as_secs()
        )))
        .into_response(),
    }
}

async fn not_found() -> ApiError {
    ApiError(ServiceError::not_found("no such endpoint"))
}
