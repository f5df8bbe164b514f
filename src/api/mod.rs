// src/api/mod.rs — Control-plane and upload client

pub mod types;

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;

use crate::infra::config::Environment;
use crate::infra::errors::PerceptrError;
use types::{Batch, CheckResponse, ErrorDetail, UploadUrlResponse};

/// Path segment shared by all ingest endpoints. The network tap refuses to
/// record requests containing it so the agent never captures its own
/// uploads.
pub const INGEST_PATH_SEGMENT: &str = "/api/v1/per/";

/// Server response meaning the session already reached its terminal state;
/// further uploads for it are skipped.
const PROCESSING_STARTED_DETAIL: &str = "processing already started";

/// Where batches go. `ApiClient` is the production implementation; tests
/// substitute a mock to observe and fail uploads deterministically.
#[async_trait]
pub trait BatchSink: Send + Sync {
    async fn send_events(&self, batch: &Batch) -> Result<(), PerceptrError>;
}

/// Full control-plane surface: credential gate plus the batch sink.
#[async_trait]
pub trait ControlPlane: BatchSink {
    async fn check_valid_project_id(&self) -> bool;
}

/// Client for the three control-plane operations: credential check,
/// pre-signed upload URL fetch, and the terminal processing trigger.
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
    project_id: String,
    compression: bool,
}

pub fn base_url_for(environment: Environment) -> &'static str {
    match environment {
        Environment::Local => "http://localhost:8000",
        Environment::Dev => "https://api-dev.perceptr.io",
        Environment::Stg => "https://api-stg.perceptr.io",
        Environment::Prod => "https://api.perceptr.io",
    }
}

impl ApiClient {
    pub fn new(project_id: impl Into<String>, environment: Environment, compression: bool) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url_for(environment).to_string(),
            project_id: project_id.into(),
            compression,
        }
    }

    /// Validate the project credential. Any error counts as invalid; the
    /// orchestrator refuses to start recording on `false`.
    pub async fn check_valid_project_id(&self) -> bool {
        let url = format!(
            "{}/api/v1/per/{}/check",
            self.base_url, self.project_id
        );
        let response = match self.client.get(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("Project id check failed: {}", e);
                return false;
            }
        };
        if !response.status().is_success() {
            return false;
        }
        match response.json::<CheckResponse>().await {
            Ok(body) => body.success,
            Err(e) => {
                tracing::warn!("Project id check returned malformed body: {}", e);
                false
            }
        }
    }

    /// Fetch a pre-signed upload URL for one batch of `session_id`.
    ///
    /// Returns `Ok(None)` when the server reports the session as already
    /// terminal (400 with a "processing already started" detail), meaning
    /// the upload should be skipped rather than retried.
    pub async fn get_upload_buffer_url(
        &self,
        session_id: &str,
    ) -> Result<Option<String>, PerceptrError> {
        let url = format!(
            "{}/api/v1/per/{}/r/{}/batch",
            self.base_url, self.project_id, session_id
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| PerceptrError::Upload {
                message: format!("Failed to fetch upload URL: {e}"),
                retriable: e.is_timeout() || e.is_connect(),
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::BAD_REQUEST {
            let detail = response
                .json::<ErrorDetail>()
                .await
                .map(|d| d.detail)
                .unwrap_or_default();
            if detail == PROCESSING_STARTED_DETAIL {
                tracing::debug!(session_id, "Session already terminal, skipping upload");
                return Ok(None);
            }
            return Err(PerceptrError::Upload {
                message: format!("Upload URL request rejected: {detail}"),
                retriable: false,
            });
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PerceptrError::Upload {
                message: format!("Upload URL request failed: HTTP {status}: {body}"),
                retriable: status.is_server_error(),
            });
        }

        let body = response
            .json::<UploadUrlResponse>()
            .await
            .map_err(|e| PerceptrError::Upload {
                message: format!("Malformed upload URL response: {e}"),
                retriable: false,
            })?;
        Ok(Some(body.url))
    }

    /// Serialize the batch, gzipping when the compression path is enabled
    /// and falling back to plain JSON when it fails.
    fn encode_batch(&self, batch: &Batch) -> Result<(Vec<u8>, bool), PerceptrError> {
        if self.compression {
            let mut with_flag = batch.clone();
            with_flag.metadata.compressed = true;
            let json = serde_json::to_vec(&with_flag).map_err(|e| PerceptrError::Upload {
                message: format!("Batch serialization failed: {e}"),
                retriable: false,
            })?;
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            if encoder.write_all(&json).is_ok() {
                if let Ok(compressed) = encoder.finish() {
                    return Ok((compressed, true));
                }
            }
            tracing::warn!("Batch compression failed, sending uncompressed");
        }

        let mut plain = batch.clone();
        plain.metadata.compressed = false;
        let json = serde_json::to_vec(&plain).map_err(|e| PerceptrError::Upload {
            message: format!("Batch serialization failed: {e}"),
            retriable: false,
        })?;
        Ok((json, false))
    }

    /// Best-effort trigger for server-side processing after the terminal
    /// batch. The server deduplicates by session, so failures are logged
    /// and swallowed.
    async fn trigger_processing(&self, session_id: &str) {
        let url = format!(
            "{}/api/v1/per/{}/r/{}/process",
            self.base_url, self.project_id, session_id
        );
        match self.client.post(&url).send().await {
            Ok(response) if !response.status().is_success() => {
                tracing::warn!(
                    session_id,
                    status = %response.status(),
                    "Processing trigger rejected"
                );
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(session_id, "Processing trigger failed: {}", e);
            }
        }
    }
}

#[async_trait]
impl ControlPlane for ApiClient {
    async fn check_valid_project_id(&self) -> bool {
        ApiClient::check_valid_project_id(self).await
    }
}

#[async_trait]
impl BatchSink for ApiClient {
    async fn send_events(&self, batch: &Batch) -> Result<(), PerceptrError> {
        let upload_url = match self.get_upload_buffer_url(&batch.session_id).await? {
            Some(url) => url,
            None => return Ok(()),
        };

        let (body, compressed) = self.encode_batch(batch)?;

        let mut request = self
            .client
            .put(&upload_url)
            .header("content-type", "application/json");
        if compressed {
            request = request.header("content-encoding", "gzip");
        }

        let response = request
            .body(body)
            .send()
            .await
            .map_err(|e| PerceptrError::Upload {
                message: format!("Batch upload failed: {e}"),
                retriable: e.is_timeout() || e.is_connect(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(PerceptrError::Upload {
                message: format!("Batch upload rejected: HTTP {status}: {text}"),
                retriable: status.is_server_error(),
            });
        }

        tracing::debug!(
            session_id = %batch.session_id,
            batch_id = %batch.batch_id,
            events = batch.data.len(),
            "Batch uploaded"
        );

        if batch.is_session_ended {
            self.trigger_processing(&batch.session_id).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_urls() {
        assert_eq!(base_url_for(Environment::Local), "http://localhost:8000");
        assert_eq!(base_url_for(Environment::Dev), "https://api-dev.perceptr.io");
        assert_eq!(base_url_for(Environment::Stg), "https://api-stg.perceptr.io");
        assert_eq!(base_url_for(Environment::Prod), "https://api.perceptr.io");
    }

    #[test]
    fn test_encode_batch_plain() {
        let client = ApiClient::new("p", Environment::Local, false);
        let batch = empty_batch();
        let (body, compressed) = client.encode_batch(&batch).unwrap();
        assert!(!compressed);
        let parsed: Batch = serde_json::from_slice(&body).unwrap();
        assert!(!parsed.metadata.compressed);
    }

    #[test]
    fn test_encode_batch_gzip_roundtrip() {
        use flate2::read::GzDecoder;
        use std::io::Read;

        let client = ApiClient::new("p", Environment::Local, true);
        let batch = empty_batch();
        let (body, compressed) = client.encode_batch(&batch).unwrap();
        assert!(compressed);

        let mut decoder = GzDecoder::new(&body[..]);
        let mut json = String::new();
        decoder.read_to_string(&mut json).unwrap();
        let parsed: Batch = serde_json::from_str(&json).unwrap();
        assert!(parsed.metadata.compressed);
        assert_eq!(parsed.session_id, "s-1");
    }

    #[test]
    fn test_encode_does_not_mutate_original() {
        let client = ApiClient::new("p", Environment::Local, true);
        let batch = empty_batch();
        let _ = client.encode_batch(&batch).unwrap();
        assert!(!batch.metadata.compressed);
    }

    fn empty_batch() -> Batch {
        Batch {
            session_id: "s-1".into(),
            batch_id: "b-1".into(),
            is_session_ended: false,
            start_time: 0,
            end_time: 1,
            size: 0,
            data: vec![],
            metadata: types::BatchMetadata::default(),
            user_identity: None,
        }
    }
}
