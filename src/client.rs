//! Client for the remote media-conversion backend
//!
//! The backend is an external service reached over HTTP; everything the
//! library knows about it goes through the [`ConversionClient`] trait so
//! tests can substitute a scripted implementation. Every call carries a
//! bounded timeout and fails with a typed [`ClientError`] carrying an
//! HTTP-status-like code where one exists.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use std::pin::Pin;

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::types::{ConversionSpec, ProcessingMode};

/// Stream of content bytes from the backend
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, ClientError>> + Send>>;

/// A content download in progress: the byte stream plus whatever metadata
/// the response headers carried
pub struct ContentDownload {
    /// The content bytes
    pub stream: ByteStream,
    /// Filename suggested by Content-Disposition or the URL path
    pub file_name: Option<String>,
    /// Declared Content-Length, when present
    pub content_length: Option<u64>,
}

/// Result of a pre-flight check against the backend
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResult {
    /// Whether the backend can convert this source at all
    pub can_download: bool,
    /// Processing mode the backend recommends for this source
    pub recommended_processing: ProcessingMode,
    /// Title of the source media, when known
    #[serde(default)]
    pub title: Option<String>,
    /// Duration of the source in seconds, when known
    #[serde(default)]
    pub duration_sec: Option<u64>,
}

/// Receipt for a successfully submitted asynchronous job
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitReceipt {
    /// Backend-side job identifier used for status polling
    pub remote_job_id: String,
}

/// Backend-side job state as reported by the status endpoint
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteJobState {
    /// Waiting in the backend queue
    Queued,
    /// Conversion running
    Processing,
    /// Result available for download
    Ready,
    /// Conversion failed
    Failed,
}

/// One status poll's answer
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteStatus {
    /// Current backend-side state
    pub status: RemoteJobState,
    /// Progress percentage, if the backend reports one
    #[serde(default)]
    pub progress: Option<u8>,
    /// Reference from which the finished result can be downloaded;
    /// expected to be present whenever `status` is `ready`
    #[serde(default)]
    pub download_ref: Option<String>,
    /// Error message for `failed` jobs
    #[serde(default)]
    pub error: Option<String>,
}

/// Narrow contract against the remote conversion backend
///
/// The poller and the sync pipeline depend on this trait only; the HTTP
/// implementation below is the production binding.
#[async_trait]
pub trait ConversionClient: Send + Sync {
    /// Pre-flight: can this URL be converted, and how should it be processed?
    async fn check(&self, url: &str) -> Result<CheckResult, ClientError>;

    /// Open a synchronous conversion stream for `url`
    ///
    /// The backend converts on the fly and streams the result back on this
    /// one connection; there is no remote job id to poll.
    async fn download_stream(
        &self,
        url: &str,
        spec: &ConversionSpec,
    ) -> Result<ContentDownload, ClientError>;

    /// Submit an asynchronous conversion job
    async fn submit(&self, url: &str, spec: &ConversionSpec) -> Result<SubmitReceipt, ClientError>;

    /// Poll the status of a previously submitted job
    async fn status(&self, remote_job_id: &str) -> Result<RemoteStatus, ClientError>;

    /// Download a finished result by the reference the status endpoint returned
    async fn download_from_url(&self, reference: &str) -> Result<ContentDownload, ClientError>;

    /// Liveness probe against the backend
    async fn health_check(&self) -> bool;
}

/// HTTP implementation of [`ConversionClient`] over reqwest
pub struct HttpConversionClient {
    http: reqwest::Client,
    base_url: url::Url,
    api_key: Option<String>,
    request_timeout_secs: u64,
    download_timeout_secs: u64,
}

impl HttpConversionClient {
    /// Build a client from configuration
    ///
    /// Fails with [`ClientError::InvalidResponse`] only if the base URL is
    /// unparseable (configuration validation normally catches this first).
    pub fn new(config: &ClientConfig) -> Result<Self, ClientError> {
        let base_url = url::Url::parse(&config.base_url)
            .map_err(|e| ClientError::InvalidResponse(format!("invalid base URL: {e}")))?;

        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        Ok(Self {
            http,
            base_url,
            api_key: config.api_key.clone(),
            request_timeout_secs: config.request_timeout_secs,
            download_timeout_secs: config.download_timeout_secs,
        })
    }

    fn endpoint(&self, path: &str) -> Result<url::Url, ClientError> {
        self.base_url
            .join(path)
            .map_err(|e| ClientError::InvalidResponse(format!("invalid endpoint path: {e}")))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    fn map_transport(&self, e: reqwest::Error) -> ClientError {
        if e.is_timeout() {
            ClientError::Timeout {
                seconds: self.request_timeout_secs,
            }
        } else if e.is_decode() {
            ClientError::InvalidResponse(e.to_string())
        } else {
            ClientError::Transport(e.to_string())
        }
    }

    /// Reject non-success statuses, reading the body for the error message
    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(ClientError::Status {
            code: status.as_u16(),
            message: if message.is_empty() {
                status
                    .canonical_reason()
                    .unwrap_or("unknown error")
                    .to_string()
            } else {
                message
            },
        })
    }

    async fn open_download(
        &self,
        request: reqwest::RequestBuilder,
        source_url: &str,
    ) -> Result<ContentDownload, ClientError> {
        let download_timeout = std::time::Duration::from_secs(self.download_timeout_secs);
        let response = self
            .authorize(request)
            .timeout(download_timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ClientError::Timeout {
                        seconds: self.download_timeout_secs,
                    }
                } else {
                    ClientError::Transport(e.to_string())
                }
            })?;
        let response = Self::check_status(response).await?;

        let file_name = extract_file_name(&response, source_url);
        let content_length = response.content_length();
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| ClientError::Transport(e.to_string())))
            .boxed();

        Ok(ContentDownload {
            stream,
            file_name,
            content_length,
        })
    }
}

#[async_trait]
impl ConversionClient for HttpConversionClient {
    async fn check(&self, url: &str) -> Result<CheckResult, ClientError> {
        let mut endpoint = self.endpoint("check")?;
        endpoint.query_pairs_mut().append_pair("url", url);

        let response = self
            .authorize(self.http.get(endpoint))
            .send()
            .await
            .map_err(|e| self.map_transport(e))?;
        Self::check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    async fn download_stream(
        &self,
        url: &str,
        spec: &ConversionSpec,
    ) -> Result<ContentDownload, ClientError> {
        let mut endpoint = self.endpoint("stream")?;
        {
            let mut query = endpoint.query_pairs_mut();
            query.append_pair("url", url);
            query.append_pair("format", &spec.format);
            if let Some(bitrate) = spec.bitrate_kbps {
                query.append_pair("bitrate", &bitrate.to_string());
            }
        }
        self.open_download(self.http.get(endpoint), url).await
    }

    async fn submit(&self, url: &str, spec: &ConversionSpec) -> Result<SubmitReceipt, ClientError> {
        let endpoint = self.endpoint("jobs")?;
        let body = serde_json::json!({
            "url": url,
            "format": spec.format,
            "bitrateKbps": spec.bitrate_kbps,
        });

        let response = self
            .authorize(self.http.post(endpoint).json(&body))
            .send()
            .await
            .map_err(|e| self.map_transport(e))?;
        Self::check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    async fn status(&self, remote_job_id: &str) -> Result<RemoteStatus, ClientError> {
        let endpoint = self.endpoint(&format!(
            "jobs/{}/status",
            urlencoding::encode(remote_job_id)
        ))?;

        let response = self
            .authorize(self.http.get(endpoint))
            .send()
            .await
            .map_err(|e| self.map_transport(e))?;
        Self::check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    async fn download_from_url(&self, reference: &str) -> Result<ContentDownload, ClientError> {
        // References may be absolute or relative to the backend base URL
        let endpoint = match url::Url::parse(reference) {
            Ok(absolute) => absolute,
            Err(_) => self.endpoint(reference)?,
        };
        self.open_download(self.http.get(endpoint.clone()), endpoint.as_str())
            .await
    }

    async fn health_check(&self) -> bool {
        let Ok(endpoint) = self.endpoint("health") else {
            return false;
        };
        match self.authorize(self.http.get(endpoint)).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!(error = %e, "backend health check failed");
                false
            }
        }
    }
}

/// Extract a result filename from the response headers, falling back to the
/// URL path, then to a fixed default
fn extract_file_name(response: &reqwest::Response, source_url: &str) -> Option<String> {
    if let Some(value) = response
        .headers()
        .get("content-disposition")
        .and_then(|v| v.to_str().ok())
    {
        for part in value.split(';') {
            let part = part.trim();
            if let Some(name) = part.strip_prefix("filename=") {
                let name = name.trim_matches('"');
                if !name.is_empty() {
                    return Some(name.to_string());
                }
            } else if let Some(encoded) = part.strip_prefix("filename*=") {
                // RFC 5987: charset'lang'percent-encoded-name
                if let Some(idx) = encoded.rfind('\'') {
                    if let Ok(decoded) = urlencoding::decode(&encoded[idx + 1..]) {
                        if !decoded.is_empty() {
                            return Some(decoded.into_owned());
                        }
                    }
                }
            }
        }
    }

    if let Ok(parsed) = url::Url::parse(source_url) {
        if let Some(segments) = parsed.path_segments() {
            if let Some(last) = segments.last() {
                if !last.is_empty() {
                    return Some(last.to_string());
                }
            }
        }
    }
    None
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> HttpConversionClient {
        let config = ClientConfig {
            base_url: server.uri(),
            api_key: None,
            request_timeout_secs: 5,
            download_timeout_secs: 5,
        };
        HttpConversionClient::new(&config).unwrap()
    }

    fn spec() -> ConversionSpec {
        ConversionSpec {
            format: "mp3".to_string(),
            bitrate_kbps: Some(192),
        }
    }

    #[tokio::test]
    async fn check_parses_backend_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/check"))
            .and(query_param("url", "https://example.com/v"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "canDownload": true,
                "recommendedProcessing": "async",
                "title": "Some Video",
                "durationSec": 213,
            })))
            .mount(&server)
            .await;

        let result = client_for(&server)
            .check("https://example.com/v")
            .await
            .unwrap();
        assert!(result.can_download);
        assert_eq!(result.recommended_processing, ProcessingMode::Async);
        assert_eq!(result.title.as_deref(), Some("Some Video"));
        assert_eq!(result.duration_sec, Some(213));
    }

    #[tokio::test]
    async fn submit_posts_spec_and_returns_remote_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/jobs"))
            .respond_with(
                ResponseTemplate::new(202)
                    .set_body_json(serde_json::json!({ "remoteJobId": "rj-42" })),
            )
            .mount(&server)
            .await;

        let receipt = client_for(&server)
            .submit("https://example.com/v", &spec())
            .await
            .unwrap();
        assert_eq!(receipt.remote_job_id, "rj-42");
    }

    #[tokio::test]
    async fn status_carries_download_ref_and_progress() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jobs/rj-42/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "ready",
                "progress": 100,
                "downloadRef": "/results/rj-42.mp3",
            })))
            .mount(&server)
            .await;

        let status = client_for(&server).status("rj-42").await.unwrap();
        assert_eq!(status.status, RemoteJobState::Ready);
        assert_eq!(status.progress, Some(100));
        assert_eq!(status.download_ref.as_deref(), Some("/results/rj-42.mp3"));
    }

    #[tokio::test]
    async fn backend_error_status_becomes_typed_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jobs/missing/status"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no such job"))
            .mount(&server)
            .await;

        let err = client_for(&server).status("missing").await.unwrap_err();
        match err {
            ClientError::Status { code, message } => {
                assert_eq!(code, 404);
                assert_eq!(message, "no such job");
            }
            other => panic!("expected Status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn download_from_relative_ref_streams_bytes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/results/rj-42.mp3"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(vec![1u8; 2048])
                    .insert_header("Content-Disposition", r#"attachment; filename="song.mp3""#),
            )
            .mount(&server)
            .await;

        let download = client_for(&server)
            .download_from_url("/results/rj-42.mp3")
            .await
            .unwrap();
        assert_eq!(download.file_name.as_deref(), Some("song.mp3"));

        let mut total = 0usize;
        let mut stream = download.stream;
        while let Some(chunk) = stream.next().await {
            total += chunk.unwrap().len();
        }
        assert_eq!(total, 2048);
    }

    #[tokio::test]
    async fn file_name_falls_back_to_url_path() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/results/track.m4a"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"x".to_vec()))
            .mount(&server)
            .await;

        let download = client_for(&server)
            .download_from_url("/results/track.m4a")
            .await
            .unwrap();
        assert_eq!(download.file_name.as_deref(), Some("track.m4a"));
    }

    #[tokio::test]
    async fn health_check_reflects_backend_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        assert!(client_for(&server).health_check().await);
    }

    #[tokio::test]
    async fn health_check_is_false_when_unreachable() {
        let config = ClientConfig {
            // Reserved TEST-NET address, nothing listens here
            base_url: "http://192.0.2.1:9".to_string(),
            api_key: None,
            request_timeout_secs: 1,
            download_timeout_secs: 1,
        };
        let client = HttpConversionClient::new(&config).unwrap();
        assert!(!client.health_check().await);
    }
}
