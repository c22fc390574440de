use std::fmt;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::error;

use crate::app::{ExportResult, Exporter};
use crate::domain::{CachedLimsFile, RunFolderRef};
use crate::error::MetadataError;
use crate::lims::LimsClient;
use crate::tool::MetadataTool;

pub struct ServiceState<L: LimsClient, T: MetadataTool> {
    exporter: Arc<Exporter<L, T>>,
}

impl<L: LimsClient, T: MetadataTool> Clone for ServiceState<L, T> {
    fn clone(&self) -> Self {
        Self {
            exporter: Arc::clone(&self.exporter),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ExportParams {
    #[serde(default)]
    pub lims_data: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VersionResponse {
    pub version: String,
}

/// Builds the service routes, nested under `route_prefix` when it is not empty.
pub fn router<L, T>(exporter: Arc<Exporter<L, T>>, route_prefix: &str) -> Router
where
    L: LimsClient + 'static,
    T: MetadataTool + 'static,
{
    let routes = Router::new()
        .route("/version", get(version))
        .route("/export/{host}/{runfolder}", get(export::<L, T>))
        .with_state(ServiceState { exporter });
    if route_prefix.is_empty() {
        routes
    } else {
        Router::new().nest(route_prefix, routes)
    }
}

async fn version() -> Json<VersionResponse> {
    Json(VersionResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn export<L, T>(
    State(state): State<ServiceState<L, T>>,
    Path((host, runfolder)): Path<(String, String)>,
    Query(params): Query<ExportParams>,
) -> Result<Json<ExportResult>, ServiceError>
where
    L: LimsClient + 'static,
    T: MetadataTool + 'static,
{
    let target = RunFolderRef::new(&host, &runfolder)?;
    let lims_data = params
        .lims_data
        .filter(|value| !value.is_empty())
        .map(|value| value.parse::<CachedLimsFile>())
        .transpose()?;

    let exporter = Arc::clone(&state.exporter);
    let result = tokio::task::spawn_blocking(move || exporter.export(&target, lims_data.as_ref()))
        .await
        .map_err(|err| ServiceError::internal(format!("export task failed: {err}")))??;
    Ok(Json(result))
}

/// Failure response: `{"exception": message}`.
#[derive(Debug)]
pub struct ServiceError {
    pub status: StatusCode,
    pub message: String,
}

impl ServiceError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ServiceError {}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = self.status.as_u16(), message = %self.message, "request failed");
        }
        (self.status, Json(json!({ "exception": self.message }))).into_response()
    }
}

impl From<MetadataError> for ServiceError {
    fn from(err: MetadataError) -> Self {
        let status = match &err {
            _ if err.is_invalid_input() => StatusCode::BAD_REQUEST,
            MetadataError::RunFolderNotFound(_) | MetadataError::CachedLimsFileNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            MetadataError::UpstreamFetch { .. } | MetadataError::UpstreamHttp { .. } => {
                StatusCode::BAD_GATEWAY
            }
            MetadataError::ToolTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}
