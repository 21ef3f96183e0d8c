//! Synchronous download pipeline
//!
//! Handles the simpler processing mode: the backend converts on the fly and
//! the result arrives as one continuous byte stream with no remote job id
//! and no polling. The stream is staged to disk, measured, and then either
//! returned inline (small results) or registered for link delivery (large
//! ones).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

use futures::StreamExt;

use crate::client::{ByteStream, ConversionClient};
use crate::error::{Error, Result};
use crate::registry::{Artifact, ArtifactRegistry};
use crate::types::{ChatId, ConversionSpec, JobId};

/// How a finished conversion should reach the user
#[derive(Debug)]
pub enum DeliveryOutcome {
    /// Result is small enough to send inline through the chat interface
    Inline {
        /// The full content
        bytes: Vec<u8>,
        /// Filename to present alongside the content
        file_name: String,
    },
    /// Result exceeds the inline ceiling; registered for link delivery
    Linked(Artifact),
}

/// Streams synchronous conversion output into the artifact pipeline
pub struct SyncDownloadPipeline {
    registry: Arc<ArtifactRegistry>,
    staging_dir: PathBuf,
    inline_limit_bytes: u64,
    artifact_ttl: Duration,
}

impl SyncDownloadPipeline {
    /// Create a pipeline staging into `staging_dir`
    pub fn new(
        registry: Arc<ArtifactRegistry>,
        staging_dir: PathBuf,
        inline_limit_bytes: u64,
        artifact_ttl: Duration,
    ) -> Self {
        Self {
            registry,
            staging_dir,
            inline_limit_bytes,
            artifact_ttl,
        }
    }

    /// Run one synchronous conversion end to end
    ///
    /// Opens the conversion stream, stages it to disk, and routes the result
    /// by size: at or below the inline ceiling the bytes come back directly,
    /// above it the artifact is registered and a link-delivery record
    /// returned. Stream errors and empty streams discard the partial bytes
    /// and surface [`Error::DownloadFailed`].
    pub async fn run(
        &self,
        client: &dyn ConversionClient,
        job_id: JobId,
        chat_id: ChatId,
        source_url: &str,
        spec: &ConversionSpec,
    ) -> Result<DeliveryOutcome> {
        let download = client.download_stream(source_url, spec).await?;
        let file_name = download
            .file_name
            .unwrap_or_else(|| format!("converted.{}", spec.format));
        let staging_path = self.staging_dir.join(format!("sync-{}.part", job_id));

        let size = stream_to_file(download.stream, &staging_path).await?;
        tracing::debug!(
            job_id = %job_id,
            size_bytes = size,
            file_name = %file_name,
            "sync conversion staged"
        );

        if size <= self.inline_limit_bytes {
            let bytes = tokio::fs::read(&staging_path).await?;
            remove_staging(&staging_path).await;
            return Ok(DeliveryOutcome::Inline { bytes, file_name });
        }

        let artifact = self
            .registry
            .register_file(&staging_path, &file_name, chat_id, job_id, self.artifact_ttl)
            .await?;
        Ok(DeliveryOutcome::Linked(artifact))
    }
}

/// Drain `stream` into `path`, returning the byte count
///
/// Shared by the sync pipeline and the poller's result fetch. Zero bytes
/// received is an error, not a valid empty artifact; on any failure the
/// partially written file is removed before the error propagates.
pub(crate) async fn stream_to_file(mut stream: ByteStream, path: &Path) -> Result<u64> {
    let mut file = tokio::fs::File::create(path).await?;
    let mut written: u64 = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                drop(file);
                remove_staging(path).await;
                return Err(Error::DownloadFailed(format!("stream error: {e}")));
            }
        };
        if let Err(e) = file.write_all(&chunk).await {
            drop(file);
            remove_staging(path).await;
            return Err(Error::DownloadFailed(format!("write error: {e}")));
        }
        written += chunk.len() as u64;
    }

    if let Err(e) = file.flush().await {
        drop(file);
        remove_staging(path).await;
        return Err(Error::DownloadFailed(format!("flush error: {e}")));
    }
    drop(file);

    if written == 0 {
        remove_staging(path).await;
        return Err(Error::DownloadFailed(
            "backend returned an empty stream".to_string(),
        ));
    }
    Ok(written)
}

async fn remove_staging(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove staging file");
        }
    }
}
