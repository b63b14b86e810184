//! The LIMS collaborator: study metadata in, artifact registrations out.

use async_trait::async_trait;
use md5::{Digest, Md5};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::debug;

use crate::errors::{Result, SeqflowError};

/// JSON request/response access to the LIMS.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LimsClient: Send + Sync {
    /// Fetches `path`.
    async fn get(&self, path: &str) -> Result<Value>;

    /// Posts `data` to `path`.
    async fn post(&self, path: &str, data: Value) -> Result<Value>;
}

/// Fetches the sample id → tube id map of a project.
///
/// # Errors
///
/// Returns an error if the request fails or the response has no `samples`
/// object of strings.
pub async fn fetch_tube_ids(client: &dyn LimsClient, project: &str) -> Result<BTreeMap<String, String>> {
    let response = client.get(&format!("/api/v1/projects/{project}/tube_ids")).await?;
    let samples = response
        .get("samples")
        .and_then(Value::as_object)
        .ok_or_else(|| SeqflowError::Lims(format!("tube id response for '{project}' has no samples")))?;

    samples
        .iter()
        .map(|(sample, tube)| {
            tube.as_str()
                .map(|t| (sample.clone(), t.to_string()))
                .ok_or_else(|| SeqflowError::Lims(format!("tube id of '{sample}' is not a string")))
        })
        .collect()
}

/// Hex MD5 of a file's contents.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub fn md5_file(path: &Path) -> Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Md5::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Registers a produced file with its checksum.
///
/// # Errors
///
/// Returns an error if the file cannot be hashed or the request fails.
pub async fn register_artifact(client: &dyn LimsClient, run_id: &str, project: &str, path: &Path) -> Result<Value> {
    let md5 = md5_file(path)?;
    debug!(project = %project, md5 = %md5, "Registering artifact {}", path.display());
    client
        .post(
            "/api/v1/artifacts",
            json!({
                "run_id": run_id,
                "project": project,
                "path": path.display().to_string(),
                "md5": md5,
            }),
        )
        .await
}

/// LIMS client over HTTP.
#[cfg(feature = "http")]
#[derive(Debug, Clone)]
pub struct HttpLimsClient {
    base_url: String,
    client: reqwest::Client,
}

#[cfg(feature = "http")]
impl HttpLimsClient {
    /// Creates a client for `base_url`.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

#[cfg(feature = "http")]
fn lims_error(err: reqwest::Error) -> SeqflowError {
    SeqflowError::Lims(err.to_string())
}

#[cfg(feature = "http")]
#[async_trait]
impl LimsClient for HttpLimsClient {
    async fn get(&self, path: &str) -> Result<Value> {
        self.client
            .get(self.url(path))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(lims_error)?
            .json()
            .await
            .map_err(lims_error)
    }

    async fn post(&self, path: &str, data: Value) -> Result<Value> {
        self.client
            .post(self.url(path))
            .json(&data)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(lims_error)?
            .json()
            .await
            .map_err(lims_error)
    }
}
