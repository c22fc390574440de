use std::fs;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use reqwest::blocking::Client;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT};
use serde_json::Value;
use tracing::{error, info};

use crate::domain::FlowcellId;
use crate::error::MetadataError;
use crate::fs_util;

pub const CONTAINERS_ROUTE: &str = "/api/containers";

/// Source of LIMS container metadata for a flowcell.
pub trait LimsClient: Send + Sync {
    /// Writes the flowcell's metadata to `<destination_dir>/<flowcell>.lims.json`
    /// and returns that path.
    fn fetch_metadata(
        &self,
        flowcell: &FlowcellId,
        destination_dir: &Utf8Path,
    ) -> Result<Utf8PathBuf, MetadataError>;
}

pub fn lims_file_name(flowcell: &FlowcellId) -> String {
    format!("{}.lims.json", flowcell.as_str())
}

#[derive(Clone)]
pub struct LimsHttpClient {
    client: Client,
    base_url: String,
}

impl LimsHttpClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, MetadataError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("metadata-service/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| MetadataError::Internal(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|err| MetadataError::UpstreamHttp {
                url: base_url.to_string(),
                message: err.to_string(),
            })?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn containers_url(&self) -> String {
        format!("{}{}", self.base_url, CONTAINERS_ROUTE)
    }

    fn request(&self, flowcell: &FlowcellId) -> Result<Value, MetadataError> {
        let url = self.containers_url();
        let start = Instant::now();
        let response = self
            .client
            .get(&url)
            .query(&[("name", flowcell.as_str())])
            .send()
            .map_err(|err| MetadataError::UpstreamHttp {
                url: url.clone(),
                message: err.to_string(),
            })?;
        let request_url = response.url().to_string();
        let status = response.status();
        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.starts_with("application/json"))
            .unwrap_or(false);
        info!(
            url = %request_url,
            status = status.as_u16(),
            latency_ms = start.elapsed().as_millis() as u64,
            "lims.response"
        );

        // Some LIMS deployments label JSON bodies as text/html.
        let body: Result<Value, String> = if is_json {
            response.json::<Value>().map_err(|err| err.to_string())
        } else {
            response
                .text()
                .map_err(|err| err.to_string())
                .and_then(|text| serde_json::from_str(&text).map_err(|err| err.to_string()))
        };
        let reason = status.canonical_reason().unwrap_or("unknown status").to_string();

        match body {
            Ok(body) if status.is_success() => Ok(body),
            Ok(body) => {
                let message = body
                    .get("error_message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or(reason);
                Err(fetch_error(status.as_u16(), request_url, message))
            }
            Err(err) => {
                let message = if status.is_success() {
                    format!("response is not valid JSON: {err}")
                } else {
                    reason
                };
                Err(fetch_error(status.as_u16(), request_url, message))
            }
        }
    }
}

fn fetch_error(status: u16, url: String, message: String) -> MetadataError {
    error!(%url, status, %message, "lims request failed");
    MetadataError::UpstreamFetch {
        status,
        url,
        message,
    }
}

impl LimsClient for LimsHttpClient {
    fn fetch_metadata(
        &self,
        flowcell: &FlowcellId,
        destination_dir: &Utf8Path,
    ) -> Result<Utf8PathBuf, MetadataError> {
        let body = self.request(flowcell)?;
        fs_util::ensure_dir(destination_dir)?;
        let destination = destination_dir.join(lims_file_name(flowcell));
        let bytes = serde_json::to_vec_pretty(&body)
            .map_err(|err| MetadataError::Internal(err.to_string()))?;
        fs::write(&destination, bytes)
            .map_err(|err| MetadataError::Filesystem(format!("write {destination}: {err}")))?;
        Ok(destination)
    }
}
