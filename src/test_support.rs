//! Shared test doubles
//!
//! A scripted [`ConversionClient`] so the poller and pipelines can be
//! exercised deterministically without a live backend.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;

use crate::client::{
    CheckResult, ContentDownload, ConversionClient, RemoteJobState, RemoteStatus, SubmitReceipt,
};
use crate::error::ClientError;
use crate::types::{ConversionSpec, ProcessingMode};

type ClientResult<T> = std::result::Result<T, ClientError>;

/// One scripted answer for a status poll
pub(crate) enum StatusStep {
    /// Deliver this remote status
    Remote(RemoteStatus),
    /// Fail with a transient transport error
    Transport,
    /// Fail with this HTTP status code
    Http(u16),
}

impl StatusStep {
    /// Convenience: a plain remote state with no progress or download ref
    pub(crate) fn state(state: RemoteJobState) -> Self {
        StatusStep::Remote(RemoteStatus {
            status: state,
            progress: None,
            download_ref: None,
            error: None,
        })
    }

    pub(crate) fn ready_with_ref(reference: &str) -> Self {
        StatusStep::Remote(RemoteStatus {
            status: RemoteJobState::Ready,
            progress: Some(100),
            download_ref: Some(reference.to_string()),
            error: None,
        })
    }
}

/// One scripted chunk of a sync conversion stream
pub(crate) enum ChunkStep {
    Data(Vec<u8>),
    Error,
}

/// Deterministic stand-in for the remote conversion backend
pub(crate) struct ScriptedClient {
    /// Remote job id handed out by `submit`; `None` scripts a backend 500
    pub(crate) submit_remote_id: Mutex<Option<String>>,
    /// Consumed front-to-back by `status`; empty scripts a transport error
    pub(crate) status_steps: Mutex<VecDeque<StatusStep>>,
    /// Chunks served by `download_stream`
    pub(crate) stream_chunks: Mutex<Vec<ChunkStep>>,
    /// Bytes served by `download_from_url` (empty scripts an empty stream)
    pub(crate) download_bytes: Mutex<Vec<u8>>,
    /// Filename attached to downloads
    pub(crate) download_file_name: Option<String>,
    /// When set, `download_from_url` fails with a backend 500
    pub(crate) fail_download: bool,
    /// Answer for `check`: whether the source is downloadable
    pub(crate) can_download: bool,
    /// Answer for `check`: recommended processing mode
    pub(crate) recommended: ProcessingMode,
    pub(crate) status_calls: AtomicU32,
    pub(crate) download_calls: AtomicU32,
}

impl Default for ScriptedClient {
    fn default() -> Self {
        Self {
            submit_remote_id: Mutex::new(Some("rj-1".to_string())),
            status_steps: Mutex::new(VecDeque::new()),
            stream_chunks: Mutex::new(Vec::new()),
            download_bytes: Mutex::new(b"converted bytes".to_vec()),
            download_file_name: Some("result.mp3".to_string()),
            fail_download: false,
            can_download: true,
            recommended: ProcessingMode::Async,
            status_calls: AtomicU32::new(0),
            download_calls: AtomicU32::new(0),
        }
    }
}

impl ScriptedClient {
    pub(crate) fn push_status(&self, step: StatusStep) {
        self.status_steps
            .lock()
            .expect("status script lock")
            .push_back(step);
    }
}

#[async_trait]
impl ConversionClient for ScriptedClient {
    async fn check(&self, _url: &str) -> ClientResult<CheckResult> {
        Ok(CheckResult {
            can_download: self.can_download,
            recommended_processing: self.recommended,
            title: Some("scripted".to_string()),
            duration_sec: Some(60),
        })
    }

    async fn download_stream(
        &self,
        _url: &str,
        _spec: &ConversionSpec,
    ) -> ClientResult<ContentDownload> {
        let chunks: Vec<ClientResult<Bytes>> = self
            .stream_chunks
            .lock()
            .expect("stream chunks lock")
            .iter()
            .map(|step| match step {
                ChunkStep::Data(data) => Ok(Bytes::from(data.clone())),
                ChunkStep::Error => Err(ClientError::Transport("connection reset".to_string())),
            })
            .collect();
        Ok(ContentDownload {
            stream: Box::pin(futures::stream::iter(chunks)),
            file_name: self.download_file_name.clone(),
            content_length: None,
        })
    }

    async fn submit(&self, _url: &str, _spec: &ConversionSpec) -> ClientResult<SubmitReceipt> {
        match self.submit_remote_id.lock().expect("submit lock").clone() {
            Some(remote_job_id) => Ok(SubmitReceipt { remote_job_id }),
            None => Err(ClientError::Status {
                code: 500,
                message: "submission rejected".to_string(),
            }),
        }
    }

    async fn status(&self, _remote_job_id: &str) -> ClientResult<RemoteStatus> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let step = self
            .status_steps
            .lock()
            .expect("status script lock")
            .pop_front();
        match step {
            Some(StatusStep::Remote(status)) => Ok(status),
            Some(StatusStep::Transport) | None => {
                Err(ClientError::Transport("connection refused".to_string()))
            }
            Some(StatusStep::Http(code)) => Err(ClientError::Status {
                code,
                message: "scripted error".to_string(),
            }),
        }
    }

    async fn download_from_url(&self, _reference: &str) -> ClientResult<ContentDownload> {
        self.download_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_download {
            return Err(ClientError::Status {
                code: 500,
                message: "result fetch failed".to_string(),
            });
        }
        let bytes = self.download_bytes.lock().expect("download bytes lock").clone();
        let chunks: Vec<ClientResult<Bytes>> = if bytes.is_empty() {
            Vec::new()
        } else {
            vec![Ok(Bytes::from(bytes))]
        };
        Ok(ContentDownload {
            stream: Box::pin(futures::stream::iter(chunks)),
            file_name: self.download_file_name.clone(),
            content_length: None,
        })
    }

    async fn health_check(&self) -> bool {
        true
    }
}
