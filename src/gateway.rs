//! Gateway facade tying the components together
//!
//! [`MediaBridge`] owns the registry, poller, pipeline, backend client, and
//! admission gate, and exposes the operations an embedding application
//! needs: request a conversion, query or cancel a job, subscribe to events,
//! and run the background machinery until shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::admission::{AdmissionGate, TokenBucketGate};
use crate::client::{ConversionClient, HttpConversionClient};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::pipeline::{DeliveryOutcome, SyncDownloadPipeline};
use crate::poller::JobPoller;
use crate::registry::{ArtifactRegistry, RegistryStats};
use crate::types::{ArtifactToken, ChatId, ConversionSpec, Event, Job, JobId, ProcessingMode};

/// What came out of an accepted conversion request
#[derive(Debug)]
pub enum ConversionOutcome {
    /// Sync mode: the conversion already finished
    Completed(DeliveryOutcome),
    /// Async mode: the job is tracked and will settle later
    Tracked(Job),
}

/// Aggregated gateway counters
#[derive(Clone, Debug)]
pub struct BridgeStats {
    /// Live artifacts in the registry
    pub artifacts: RegistryStats,
    /// Jobs still in a non-terminal state
    pub active_jobs: usize,
}

/// Main gateway instance
///
/// Construct once, share via `Arc`. All fields are internally synchronized;
/// every method takes `&self`.
pub struct MediaBridge {
    config: Arc<Config>,
    registry: Arc<ArtifactRegistry>,
    poller: Arc<JobPoller>,
    pipeline: SyncDownloadPipeline,
    client: Arc<dyn ConversionClient>,
    gate: Arc<dyn AdmissionGate>,
    event_tx: tokio::sync::broadcast::Sender<Event>,
    cancel_token: CancellationToken,
    tasks: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
    accepting_new: AtomicBool,
}

impl MediaBridge {
    /// Create a gateway talking to the configured HTTP backend
    ///
    /// Validates the configuration and creates the artifact storage
    /// directory if it does not exist yet.
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let client: Arc<dyn ConversionClient> = Arc::new(HttpConversionClient::new(&config.client)?);
        let gate: Arc<dyn AdmissionGate> = Arc::new(TokenBucketGate::new(config.rate_limit.clone()));
        Self::assemble(config, client, gate).await
    }

    /// Create a gateway with a custom backend client and admission gate
    ///
    /// The seam for embedding applications that bring their own backend
    /// protocol or admission policy.
    pub async fn with_backend(
        config: Config,
        client: Arc<dyn ConversionClient>,
        gate: Arc<dyn AdmissionGate>,
    ) -> Result<Self> {
        config.validate()?;
        Self::assemble(config, client, gate).await
    }

    async fn assemble(
        config: Config,
        client: Arc<dyn ConversionClient>,
        gate: Arc<dyn AdmissionGate>,
    ) -> Result<Self> {
        tokio::fs::create_dir_all(&config.storage.storage_dir)
            .await
            .map_err(|e| {
                Error::Io(std::io::Error::new(
                    e.kind(),
                    format!(
                        "failed to create storage directory '{}': {}",
                        config.storage.storage_dir.display(),
                        e
                    ),
                ))
            })?;

        let (event_tx, _rx) = tokio::sync::broadcast::channel(1000);

        let registry = Arc::new(ArtifactRegistry::new(
            config.storage.storage_dir.clone(),
            event_tx.clone(),
        ));
        let poller = Arc::new(JobPoller::new(
            Arc::clone(&client),
            Arc::clone(&registry),
            config.storage.storage_dir.clone(),
            config.storage.artifact_ttl(),
            config.poller.clone(),
            event_tx.clone(),
        ));
        let pipeline = SyncDownloadPipeline::new(
            Arc::clone(&registry),
            config.storage.storage_dir.clone(),
            config.storage.inline_limit_bytes,
            config.storage.artifact_ttl(),
        );

        Ok(Self {
            config: Arc::new(config),
            registry,
            poller,
            pipeline,
            client,
            gate,
            event_tx,
            cancel_token: CancellationToken::new(),
            tasks: std::sync::Mutex::new(Vec::new()),
            accepting_new: AtomicBool::new(true),
        })
    }

    /// Request a conversion of `source_url` on behalf of `chat_id`
    ///
    /// The request passes the admission gate, then a backend feasibility
    /// check, and is then routed by the backend's recommended mode: sync
    /// requests run to completion on this call, async requests come back as
    /// a tracked `queued` job. Admission budget is only consumed for
    /// requests that pass the feasibility check.
    pub async fn request_conversion(
        &self,
        chat_id: ChatId,
        source_url: &str,
        spec: &ConversionSpec,
    ) -> Result<ConversionOutcome> {
        if !self.accepting_new.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        if url::Url::parse(source_url).is_err() {
            return Err(Error::Validation(format!(
                "not a valid source URL: {source_url}"
            )));
        }

        let decision = self.gate.check(chat_id).await;
        if !decision.allowed {
            return Err(Error::RateLimited {
                retry_after_seconds: decision.retry_after_seconds.unwrap_or(60),
                reason: decision.reason,
            });
        }

        let check = self.client.check(source_url).await?;
        if !check.can_download {
            return Err(Error::Validation(
                "backend cannot download this source".to_string(),
            ));
        }
        self.gate.consume(chat_id).await;

        match check.recommended_processing {
            ProcessingMode::Sync => {
                let id = self.poller.allocate_id();
                tracing::info!(job_id = %id, chat_id = %chat_id, "running sync conversion");
                let outcome = self
                    .pipeline
                    .run(self.client.as_ref(), id, chat_id, source_url, spec)
                    .await?;
                Ok(ConversionOutcome::Completed(outcome))
            }
            ProcessingMode::Async => {
                let job = self.poller.submit(chat_id, source_url, spec).await;
                Ok(ConversionOutcome::Tracked(job))
            }
        }
    }

    /// Snapshot of a tracked job
    pub async fn job(&self, id: JobId) -> Option<Job> {
        self.poller.get(id).await
    }

    /// Cancel a tracked job; `true` if it was still live
    pub async fn cancel_job(&self, id: JobId) -> bool {
        self.poller.cancel(id).await
    }

    /// Public download URL for an artifact token
    pub fn download_url(&self, token: &ArtifactToken) -> String {
        self.config.download_url(token)
    }

    /// Subscribe to gateway events
    ///
    /// Multiple subscribers are supported; each receives all events
    /// independently. A subscriber that lags more than 1000 events behind
    /// gets a `RecvError::Lagged`.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Aggregated counters for monitoring
    pub async fn stats(&self) -> BridgeStats {
        BridgeStats {
            artifacts: self.registry.stats().await,
            active_jobs: self.poller.active_count().await,
        }
    }

    /// Whether the backend currently answers its health endpoint
    pub async fn backend_healthy(&self) -> bool {
        self.client.health_check().await
    }

    /// Start the background machinery: TTL sweeper, status poll loop, and
    /// job-record GC
    ///
    /// Idempotent in effect but not in cost; call once after construction.
    pub fn start_background_tasks(&self) {
        let handles = vec![
            self.registry
                .spawn_sweeper(self.config.storage.sweep_interval(), self.cancel_token.clone()),
            self.poller.spawn_poll_loop(self.cancel_token.clone()),
            self.poller.spawn_gc(self.cancel_token.clone()),
        ];
        match self.tasks.lock() {
            Ok(mut tasks) => tasks.extend(handles),
            Err(poisoned) => poisoned.into_inner().extend(handles),
        }
    }

    /// Spawn the artifact delivery server in a background task
    pub fn spawn_api_server(&self) -> tokio::task::JoinHandle<Result<()>> {
        let registry = Arc::clone(&self.registry);
        let config = Arc::clone(&self.config);
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move { crate::api::start_api_server(registry, config, event_tx).await })
    }

    /// Shut the gateway down
    ///
    /// Stops accepting new requests, cancels the background tasks and waits
    /// for them, then flushes all registered artifacts so no orphaned blobs
    /// outlive the process.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("gateway shutting down");
        self.accepting_new.store(false, Ordering::SeqCst);
        self.cancel_token.cancel();

        let handles = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for handle in handles {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    tracing::warn!(error = %e, "background task ended abnormally");
                }
            }
        }

        let flushed = self.registry.delete_all().await;
        tracing::info!(artifacts_flushed = flushed, "gateway shutdown complete");
        Ok(())
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ChunkStep, ScriptedClient};
    use crate::types::JobStatus;
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.storage.storage_dir = dir.path().to_path_buf();
        config
    }

    async fn bridge_with(client: ScriptedClient, config: Config) -> MediaBridge {
        let gate = Arc::new(TokenBucketGate::new(config.rate_limit.clone()));
        MediaBridge::with_backend(config, Arc::new(client), gate)
            .await
            .unwrap()
    }

    fn spec() -> ConversionSpec {
        ConversionSpec {
            format: "mp3".to_string(),
            bitrate_kbps: None,
        }
    }

    #[tokio::test]
    async fn async_request_comes_back_as_a_tracked_queued_job() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let bridge = bridge_with(ScriptedClient::default(), config).await;

        let outcome = bridge
            .request_conversion(ChatId(1), "https://example.com/v", &spec())
            .await
            .unwrap();

        match outcome {
            ConversionOutcome::Tracked(job) => {
                assert_eq!(job.status, JobStatus::Queued);
                assert!(job.remote_job_id.is_some());
            }
            other => panic!("expected a tracked job, got {other:?}"),
        }
        assert_eq!(bridge.stats().await.active_jobs, 1);
    }

    #[tokio::test]
    async fn sync_request_completes_inline_on_the_spot() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let client = ScriptedClient {
            recommended: ProcessingMode::Sync,
            stream_chunks: StdMutex::new(vec![ChunkStep::Data(b"tiny result".to_vec())]),
            ..ScriptedClient::default()
        };
        let bridge = bridge_with(client, config).await;

        let outcome = bridge
            .request_conversion(ChatId(1), "https://example.com/v", &spec())
            .await
            .unwrap();

        match outcome {
            ConversionOutcome::Completed(DeliveryOutcome::Inline { bytes, .. }) => {
                assert_eq!(bytes, b"tiny result");
            }
            other => panic!("expected inline completion, got {other:?}"),
        }
        // Sync conversions leave no tracked job behind
        assert_eq!(bridge.stats().await.active_jobs, 0);
    }

    #[tokio::test]
    async fn oversized_sync_result_is_linked_and_flushed_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.storage.inline_limit_bytes = 4;
        let client = ScriptedClient {
            recommended: ProcessingMode::Sync,
            stream_chunks: StdMutex::new(vec![ChunkStep::Data(vec![7u8; 64])]),
            ..ScriptedClient::default()
        };
        let bridge = bridge_with(client, config).await;

        let outcome = bridge
            .request_conversion(ChatId(1), "https://example.com/v", &spec())
            .await
            .unwrap();
        let token = match outcome {
            ConversionOutcome::Completed(DeliveryOutcome::Linked(artifact)) => artifact.token,
            other => panic!("expected link delivery, got {other:?}"),
        };
        assert!(bridge.download_url(&token).contains(token.as_str()));
        assert_eq!(bridge.stats().await.artifacts.count, 1);

        bridge.shutdown().await.unwrap();
        assert_eq!(bridge.stats().await.artifacts.count, 0);
    }

    #[tokio::test]
    async fn invalid_source_url_is_rejected_up_front() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let bridge = bridge_with(ScriptedClient::default(), config).await;

        let err = bridge
            .request_conversion(ChatId(1), "not a url", &spec())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn undownloadable_source_does_not_consume_admission_budget() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.rate_limit.burst_size = 1;
        let client = ScriptedClient {
            can_download: false,
            ..ScriptedClient::default()
        };
        let bridge = bridge_with(client, config).await;

        for _ in 0..3 {
            let err = bridge
                .request_conversion(ChatId(1), "https://example.com/v", &spec())
                .await
                .unwrap_err();
            // Feasibility rejection, never a rate limit: budget was not spent
            assert!(matches!(err, Error::Validation(_)));
        }
    }

    #[tokio::test]
    async fn exhausted_admission_budget_reports_retry_after() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.rate_limit.burst_size = 1;
        let bridge = bridge_with(ScriptedClient::default(), config).await;

        bridge
            .request_conversion(ChatId(1), "https://example.com/v", &spec())
            .await
            .unwrap();
        let err = bridge
            .request_conversion(ChatId(1), "https://example.com/v", &spec())
            .await
            .unwrap_err();

        match err {
            Error::RateLimited {
                retry_after_seconds,
                ..
            } => assert!(retry_after_seconds > 0),
            other => panic!("expected a rate limit error, got {other}"),
        }
    }

    #[tokio::test]
    async fn shutdown_rejects_new_requests() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let bridge = bridge_with(ScriptedClient::default(), config).await;

        bridge.shutdown().await.unwrap();

        let err = bridge
            .request_conversion(ChatId(1), "https://example.com/v", &spec())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ShuttingDown));
    }

    #[tokio::test]
    async fn cancel_goes_through_the_facade() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let bridge = bridge_with(ScriptedClient::default(), config).await;

        let outcome = bridge
            .request_conversion(ChatId(1), "https://example.com/v", &spec())
            .await
            .unwrap();
        let job = match outcome {
            ConversionOutcome::Tracked(job) => job,
            other => panic!("expected a tracked job, got {other:?}"),
        };

        assert!(bridge.cancel_job(job.id).await);
        assert_eq!(
            bridge.job(job.id).await.unwrap().status,
            JobStatus::Failed
        );
    }
}
