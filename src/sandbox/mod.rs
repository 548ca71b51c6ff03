//! HTTP client for the code-execution sandbox.
//!
//! The sandbox executes command batches under resource limits and can
//! retain output files, returning opaque ids that later runs reference.
//! The client wraps the four endpoints (`/run`, `/file`, `/file/{id}`,
//! `/version`) with typed requests and owns the file cache used to avoid
//! re-uploading stable artifacts.

mod cache;
mod models;

pub use cache::FileCache;
pub use models::{
    PipeIndex, PipeMap, PreparedFile, SandboxCmd, SandboxFile, SandboxFileError, SandboxResult,
    SandboxStatus, SandboxVersion,
};

use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config;

/// Failure talking to the sandbox.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("sandbox transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("sandbox returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("sandbox protocol error: {0}")]
    Protocol(String),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RunRequest {
    cmd: Vec<SandboxCmd>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pipe_mapping: Vec<PipeMap>,
}

/// Typed client over the sandbox HTTP API.
///
/// Holds a reusable connection pool; create one per worker and share it by
/// reference. `close` releases the pool and shuts the file cache down.
pub struct SandboxClient {
    endpoint: String,
    http: reqwest::Client,
    cache: FileCache,
}

impl SandboxClient {
    pub fn new(endpoint: &str) -> Self {
        let endpoint = endpoint.trim_end_matches('/').to_string();
        let http = reqwest::Client::new();
        let cache = FileCache::new(
            http.clone(),
            endpoint.clone(),
            config::CACHE_EXPIRE,
            config::CACHE_RECYCLE_GAP,
        );
        debug!("Sandbox client initialized with: {}", endpoint);
        Self {
            endpoint,
            http,
            cache,
        }
    }

    /// The cache of long-lived prepared files owned by this client.
    pub fn cache(&self) -> &FileCache {
        &self.cache
    }

    /// Execute a command batch; results come back one per command, in
    /// order. `pipe_mapping` wires fds between commands for interactive
    /// judging.
    pub async fn run_command(
        &self,
        cmd: Vec<SandboxCmd>,
        pipe_mapping: Vec<PipeMap>,
    ) -> Result<Vec<SandboxResult>, SandboxError> {
        debug!("Sending run command with {} cmd(s)", cmd.len());
        let resp = self
            .http
            .post(format!("{}/run", self.endpoint))
            .json(&RunRequest { cmd, pipe_mapping })
            .send()
            .await?;
        let results: Vec<SandboxResult> = check_status(resp).await?.json().await?;
        debug!("Received {} run result(s)", results.len());
        Ok(results)
    }

    /// Execute a single command and return its result.
    pub async fn run_single(&self, cmd: SandboxCmd) -> Result<SandboxResult, SandboxError> {
        let mut results = self.run_command(vec![cmd], Vec::new()).await?;
        if results.len() != 1 {
            return Err(SandboxError::Protocol(format!(
                "expected exactly one result, got {}",
                results.len()
            )));
        }
        Ok(results.remove(0))
    }

    /// Upload a blob; the sandbox answers with its new opaque id.
    pub async fn upload_file(&self, content: String) -> Result<PreparedFile, SandboxError> {
        debug!("Uploading file with {} bytes", content.len());
        let part = reqwest::multipart::Part::text(content).file_name("file.txt");
        let form = reqwest::multipart::Form::new().part("file", part);
        let resp = self
            .http
            .post(format!("{}/file", self.endpoint))
            .multipart(form)
            .send()
            .await?;
        let file_id: String = check_status(resp).await?.json().await?;
        debug!("Uploaded file '{}'", file_id);
        Ok(PreparedFile::new(file_id))
    }

    /// Download a prepared file's content.
    pub async fn download_file(&self, file_id: &str) -> Result<String, SandboxError> {
        debug!("Downloading file '{}'", file_id);
        let resp = self
            .http
            .get(format!("{}/file/{}", self.endpoint, file_id))
            .send()
            .await?;
        Ok(check_status(resp).await?.text().await?)
    }

    /// Delete a prepared file.
    pub async fn delete_file(&self, file_id: &str) -> Result<(), SandboxError> {
        delete_file_raw(&self.http, &self.endpoint, file_id).await
    }

    /// Spawn a background task deleting a prepared file; failures are
    /// logged and dropped. The returned handle lets callers join the
    /// delete before declaring cleanup finished.
    pub fn spawn_delete(&self, file_id: String) -> JoinHandle<()> {
        let http = self.http.clone();
        let endpoint = self.endpoint.clone();
        tokio::spawn(async move {
            if let Err(e) = delete_file_raw(&http, &endpoint, &file_id).await {
                warn!("Failed to delete sandbox file '{}': {}", file_id, e);
            }
        })
    }

    /// Query the sandbox build version.
    pub async fn get_version(&self) -> Result<SandboxVersion, SandboxError> {
        let resp = self
            .http
            .get(format!("{}/version", self.endpoint))
            .send()
            .await?;
        Ok(check_status(resp).await?.json().await?)
    }

    /// Release the connection pool and the owned file cache.
    pub async fn close(self) {
        self.cache.close().await;
        debug!("Sandbox client closed");
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, SandboxError> {
    let status = resp.status();
    if status.is_success() {
        Ok(resp)
    } else {
        let body = resp.text().await.unwrap_or_default();
        Err(SandboxError::Status { status, body })
    }
}

pub(crate) async fn delete_file_raw(
    http: &reqwest::Client,
    endpoint: &str,
    file_id: &str,
) -> Result<(), SandboxError> {
    debug!("Deleting file '{}'", file_id);
    let resp = http
        .delete(format!("{}/file/{}", endpoint, file_id))
        .send()
        .await?;
    check_status(resp).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_run_command_returns_results_in_order() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/run"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"status": "Accepted", "exitStatus": 0, "time": 1000000, "memory": 1024},
                {"status": "Nonzero Exit Status", "exitStatus": 1, "time": 2000000, "memory": 2048}
            ])))
            .mount(&server)
            .await;

        let client = SandboxClient::new(&server.uri());
        let results = client
            .run_command(
                vec![SandboxCmd::default(), SandboxCmd::default()],
                Vec::new(),
            )
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].status, SandboxStatus::Accepted);
        assert_eq!(results[1].status, SandboxStatus::NonzeroExitStatus);
        assert_eq!(results[1].exit_status, 1);
    }

    #[tokio::test]
    async fn test_non_2xx_carries_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/run"))
            .respond_with(ResponseTemplate::new(500).set_body_string("invalid cmd"))
            .mount(&server)
            .await;

        let client = SandboxClient::new(&server.uri());
        let err = client
            .run_command(vec![SandboxCmd::default()], Vec::new())
            .await
            .unwrap_err();
        match err {
            SandboxError::Status { status, body } => {
                assert_eq!(status.as_u16(), 500);
                assert_eq!(body, "invalid cmd");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_file_upload_download_delete() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/file"))
            .respond_with(ResponseTemplate::new(200).set_body_json("file-1"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/file/file-1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/file/file-1"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = SandboxClient::new(&server.uri());
        let file = client.upload_file("hello".to_string()).await.unwrap();
        assert_eq!(file.file_id, "file-1");
        assert_eq!(client.download_file("file-1").await.unwrap(), "hello");
        client.delete_file("file-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_download_nonexistent_file_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/file/nonexistent"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = SandboxClient::new(&server.uri());
        let err = client.download_file("nonexistent").await.unwrap_err();
        assert!(matches!(err, SandboxError::Status { status, .. } if status.as_u16() == 404));
    }

    #[tokio::test]
    async fn test_get_version() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/version"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "buildVersion": "v1.8.5",
                "goVersion": "go1.21.0",
                "platform": "amd64",
                "os": "linux"
            })))
            .mount(&server)
            .await;

        let client = SandboxClient::new(&server.uri());
        let version = client.get_version().await.unwrap();
        assert_eq!(version.build_version, "v1.8.5");
    }
}
