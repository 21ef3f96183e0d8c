//! Async job tracking and status polling
//!
//! Jobs accepted in async mode are submitted to the remote backend and then
//! driven to completion by a periodic poll loop: remote state is mirrored
//! into the local record, transient poll failures are retried up to a
//! ceiling, and a `ready` report triggers the result fetch that registers
//! the artifact. Terminal records linger briefly for late status queries and
//! are then garbage collected.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, Mutex};

use crate::client::{ConversionClient, RemoteJobState};
use crate::config::PollerConfig;
use crate::error::Result;
use crate::pipeline::stream_to_file;
use crate::registry::ArtifactRegistry;
use crate::types::{ChatId, ConversionSpec, Event, Job, JobId, JobStatus, ProcessingMode};

/// Tracks async conversion jobs and polls the backend until they settle
pub struct JobPoller {
    /// All known jobs, live and recently terminal
    jobs: Mutex<HashMap<JobId, Job>>,
    /// Local id counter
    next_id: AtomicI64,
    client: Arc<dyn ConversionClient>,
    registry: Arc<ArtifactRegistry>,
    /// Where result downloads are staged before registration
    staging_dir: PathBuf,
    /// TTL applied to registered result artifacts
    artifact_ttl: Duration,
    config: PollerConfig,
    event_tx: broadcast::Sender<Event>,
}

impl JobPoller {
    /// Create a poller over the given client and registry
    pub fn new(
        client: Arc<dyn ConversionClient>,
        registry: Arc<ArtifactRegistry>,
        staging_dir: PathBuf,
        artifact_ttl: Duration,
        config: PollerConfig,
        event_tx: broadcast::Sender<Event>,
    ) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(0),
            client,
            registry,
            staging_dir,
            artifact_ttl,
            config,
            event_tx,
        }
    }

    /// Allocate a fresh local job id
    ///
    /// Also used for sync conversions, which need an id for staging paths
    /// and artifact provenance without ever entering the job map.
    pub fn allocate_id(&self) -> JobId {
        JobId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Accept a conversion request and submit it to the backend
    ///
    /// Returns a snapshot of the new job. On successful submission the job
    /// is `queued` with its remote id recorded; if the backend rejects the
    /// submission the job goes straight to `failed` with the reason stored,
    /// so every accepted request leaves a queryable record either way.
    pub async fn submit(&self, chat_id: ChatId, source_url: &str, spec: &ConversionSpec) -> Job {
        let id = self.allocate_id();
        let job = Job::new(id, chat_id, source_url.to_string(), ProcessingMode::Async);
        self.jobs.lock().await.insert(id, job);

        match self.client.submit(source_url, spec).await {
            Ok(receipt) => {
                let mut jobs = self.jobs.lock().await;
                let snapshot = match jobs.get_mut(&id) {
                    Some(job) => {
                        job.remote_job_id = Some(receipt.remote_job_id);
                        job.clone()
                    }
                    // purged between insert and now; keep the queued snapshot shape
                    None => Job::new(id, chat_id, source_url.to_string(), ProcessingMode::Async),
                };
                drop(jobs);
                tracing::info!(job_id = %id, chat_id = %chat_id, "job submitted");
                self.emit(Event::JobQueued { id, chat_id });
                snapshot
            }
            Err(e) => {
                tracing::warn!(job_id = %id, chat_id = %chat_id, error = %e, "submission failed");
                let reason = format!("submission failed: {e}");
                self.fail_job(id, reason).await;
                self.get(id).await.unwrap_or_else(|| {
                    Job::new(id, chat_id, source_url.to_string(), ProcessingMode::Async)
                })
            }
        }
    }

    /// Snapshot of a job by id
    pub async fn get(&self, id: JobId) -> Option<Job> {
        self.jobs.lock().await.get(&id).cloned()
    }

    /// Number of jobs still in a non-terminal state
    pub async fn active_count(&self) -> usize {
        self.jobs
            .lock()
            .await
            .values()
            .filter(|job| !job.status.is_terminal())
            .count()
    }

    /// Cancel a live job
    ///
    /// Returns `true` when the job existed and was still in flight. Terminal
    /// jobs are left untouched and report `false`; a finished conversion is
    /// never un-finished by a late cancel.
    pub async fn cancel(&self, id: JobId) -> bool {
        let cancelled = {
            let mut jobs = self.jobs.lock().await;
            match jobs.get_mut(&id) {
                Some(job) if !job.status.is_terminal() => {
                    mark_failed(job, "cancelled by user".to_string());
                    true
                }
                _ => false,
            }
        };
        if cancelled {
            tracing::info!(job_id = %id, "job cancelled");
            self.emit(Event::JobFailed {
                id,
                reason: "cancelled by user".to_string(),
            });
        }
        cancelled
    }

    /// Poll every live job once
    pub async fn poll_once(&self) {
        let pending: Vec<(JobId, String)> = {
            let jobs = self.jobs.lock().await;
            jobs.values()
                .filter(|job| !job.status.is_terminal())
                .filter_map(|job| {
                    job.remote_job_id
                        .as_ref()
                        .map(|remote| (job.id, remote.clone()))
                })
                .collect()
        };

        for (id, remote_job_id) in pending {
            self.poll_job(id, &remote_job_id).await;
        }
    }

    /// Poll a single job and apply the observed remote state
    async fn poll_job(&self, id: JobId, remote_job_id: &str) {
        let outcome = self.client.status(remote_job_id).await;

        // State is applied under the lock; the result fetch for ready jobs
        // happens after, off the lock.
        let fetch = {
            let mut jobs = self.jobs.lock().await;
            let Some(job) = jobs.get_mut(&id) else {
                return;
            };
            if job.status.is_terminal() {
                // cancelled while the poll was in flight
                return;
            }
            job.poll_count += 1;

            match outcome {
                Err(e) if e.is_transient() => {
                    job.retry_count += 1;
                    tracing::warn!(
                        job_id = %id,
                        retry = job.retry_count,
                        error = %e,
                        "status poll failed"
                    );
                    if job.retry_count >= self.config.retry_limit {
                        let reason = format!(
                            "status polling failed {} times in a row",
                            job.retry_count
                        );
                        mark_failed(job, reason.clone());
                        self.emit(Event::JobFailed { id, reason });
                    }
                    None
                }
                Err(e) => {
                    let reason = format!("status poll rejected: {e}");
                    mark_failed(job, reason.clone());
                    self.emit(Event::JobFailed { id, reason });
                    None
                }
                Ok(remote) => {
                    job.retry_count = 0;
                    match remote.status {
                        RemoteJobState::Queued => {
                            // Never step back from processing on a stale report
                            if job.status == JobStatus::Queued && job.progress != remote.progress {
                                job.progress = remote.progress;
                                self.emit(Event::JobProgress {
                                    id,
                                    status: job.status,
                                    progress: job.progress,
                                });
                            }
                            None
                        }
                        RemoteJobState::Processing => {
                            let changed = job.status != JobStatus::Processing
                                || job.progress != remote.progress;
                            job.status = JobStatus::Processing;
                            job.progress = remote.progress;
                            if changed {
                                self.emit(Event::JobProgress {
                                    id,
                                    status: job.status,
                                    progress: job.progress,
                                });
                            }
                            None
                        }
                        RemoteJobState::Failed => {
                            let reason = remote
                                .error
                                .unwrap_or_else(|| "conversion failed".to_string());
                            mark_failed(job, reason.clone());
                            self.emit(Event::JobFailed { id, reason });
                            None
                        }
                        RemoteJobState::Ready => match remote.download_ref {
                            Some(reference) => Some((reference, job.chat_id)),
                            None => {
                                // A ready job with nothing to download can
                                // never be delivered; settle it as failed
                                // rather than leave a dangling ready state.
                                let reason =
                                    "backend reported ready without a result reference".to_string();
                                mark_failed(job, reason.clone());
                                self.emit(Event::JobFailed { id, reason });
                                None
                            }
                        },
                    }
                }
            }
        };

        if let Some((reference, chat_id)) = fetch {
            if let Err(e) = self.fetch_result(id, chat_id, &reference).await {
                tracing::warn!(job_id = %id, error = %e, "result fetch failed");
                self.fail_job(id, format!("result fetch failed: {e}")).await;
            }
        }
    }

    /// Download a finished job's result and register it as an artifact
    async fn fetch_result(&self, id: JobId, chat_id: ChatId, reference: &str) -> Result<()> {
        let download = self.client.download_from_url(reference).await?;
        let file_name = download
            .file_name
            .unwrap_or_else(|| format!("job-{id}.bin"));
        let staging_path = self.staging_dir.join(format!("job-{id}.part"));

        stream_to_file(download.stream, &staging_path).await?;
        let artifact = self
            .registry
            .register_file(&staging_path, &file_name, chat_id, id, self.artifact_ttl)
            .await?;

        let mut jobs = self.jobs.lock().await;
        match jobs.get_mut(&id) {
            Some(job) if !job.status.is_terminal() => {
                job.status = JobStatus::Ready;
                job.progress = Some(100);
                job.ended_at = Some(Utc::now());
                job.result_token = Some(artifact.token.clone());
                drop(jobs);
                tracing::info!(job_id = %id, token = %artifact.token, "job ready");
                self.emit(Event::JobReady {
                    id,
                    token: artifact.token,
                });
            }
            _ => {
                // Cancelled or purged while the result was downloading;
                // the artifact has no owner left to hand it to.
                drop(jobs);
                self.registry.delete(&artifact.token).await;
            }
        }
        Ok(())
    }

    /// Remove settled and overage job records
    ///
    /// Terminal jobs are kept for a grace period so late status queries
    /// still resolve, then dropped. Jobs older than the hard age ceiling
    /// are dropped regardless of state, which bounds the map even if a
    /// backend stops answering for a job that was never settled.
    pub async fn gc_once(&self) -> usize {
        let now = Utc::now();
        let grace = chrono::Duration::seconds(self.config.terminal_grace_secs as i64);
        let max_age = chrono::Duration::seconds(self.config.max_job_age_secs as i64);

        let mut jobs = self.jobs.lock().await;
        let before = jobs.len();
        jobs.retain(|_, job| {
            let settled_and_stale = job
                .ended_at
                .map(|ended| ended + grace <= now)
                .unwrap_or(false);
            let over_age = job.started_at + max_age <= now;
            !(settled_and_stale || over_age)
        });
        let removed = before - jobs.len();
        drop(jobs);

        if removed > 0 {
            tracing::debug!(removed, "job records garbage collected");
        }
        removed
    }

    /// Spawn the periodic status poll task
    ///
    /// Runs until the cancellation token fires.
    pub fn spawn_poll_loop(
        self: &Arc<Self>,
        cancel_token: tokio_util::sync::CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let poller = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poller.config.poll_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        poller.poll_once().await;
                    }
                    _ = cancel_token.cancelled() => {
                        break;
                    }
                }
            }
        })
    }

    /// Spawn the periodic job-record GC task
    pub fn spawn_gc(
        self: &Arc<Self>,
        cancel_token: tokio_util::sync::CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let poller = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poller.config.gc_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so a fresh start
            // doesn't walk an empty map.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        poller.gc_once().await;
                    }
                    _ = cancel_token.cancelled() => {
                        break;
                    }
                }
            }
        })
    }

    /// Mark a job failed, if it is still live
    async fn fail_job(&self, id: JobId, reason: String) {
        let failed = {
            let mut jobs = self.jobs.lock().await;
            match jobs.get_mut(&id) {
                Some(job) if !job.status.is_terminal() => {
                    mark_failed(job, reason.clone());
                    true
                }
                _ => false,
            }
        };
        if failed {
            self.emit(Event::JobFailed { id, reason });
        }
    }

    fn emit(&self, event: Event) {
        // nobody listening is fine
        let _ = self.event_tx.send(event);
    }
}

fn mark_failed(job: &mut Job, reason: String) {
    job.status = JobStatus::Failed;
    job.ended_at = Some(Utc::now());
    job.last_error = Some(reason);
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::RemoteStatus;
    use crate::test_support::{ScriptedClient, StatusStep};
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    fn test_config(retry_limit: u32) -> PollerConfig {
        PollerConfig {
            poll_interval_secs: 1,
            retry_limit,
            terminal_grace_secs: 300,
            max_job_age_secs: 86400,
            gc_interval_secs: 60,
        }
    }

    fn poller_in(
        dir: &TempDir,
        client: Arc<ScriptedClient>,
        config: PollerConfig,
    ) -> (Arc<JobPoller>, Arc<ArtifactRegistry>) {
        let (event_tx, _rx) = broadcast::channel(64);
        let registry = Arc::new(ArtifactRegistry::new(
            dir.path().to_path_buf(),
            event_tx.clone(),
        ));
        let poller = Arc::new(JobPoller::new(
            client,
            Arc::clone(&registry),
            dir.path().to_path_buf(),
            Duration::from_secs(60),
            config,
            event_tx,
        ));
        (poller, registry)
    }

    fn spec() -> ConversionSpec {
        ConversionSpec {
            format: "mp3".to_string(),
            bitrate_kbps: Some(128),
        }
    }

    #[tokio::test]
    async fn successful_submission_starts_queued_with_remote_id() {
        let dir = TempDir::new().unwrap();
        let client = Arc::new(ScriptedClient::default());
        let (poller, _registry) = poller_in(&dir, client, test_config(5));

        let job = poller.submit(ChatId(1), "https://example.com/v", &spec()).await;

        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.remote_job_id.as_deref(), Some("rj-1"));
        assert_eq!(poller.active_count().await, 1);
    }

    #[tokio::test]
    async fn rejected_submission_fails_without_ever_processing() {
        let dir = TempDir::new().unwrap();
        let client = Arc::new(ScriptedClient {
            submit_remote_id: StdMutex::new(None),
            ..ScriptedClient::default()
        });
        let (poller, _registry) = poller_in(&dir, client, test_config(5));

        let job = poller.submit(ChatId(1), "https://example.com/v", &spec()).await;

        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.last_error.unwrap().contains("submission failed"));
        assert!(job.ended_at.is_some());
        assert_eq!(poller.active_count().await, 0);
    }

    #[tokio::test]
    async fn transient_poll_failures_respect_the_retry_ceiling() {
        let dir = TempDir::new().unwrap();
        let client = Arc::new(ScriptedClient::default());
        let (poller, _registry) = poller_in(&dir, Arc::clone(&client), test_config(5));

        let job = poller.submit(ChatId(1), "https://example.com/v", &spec()).await;

        // Empty status script: every poll fails with a transport error
        for expected_retry in 1..=4u32 {
            poller.poll_once().await;
            let snapshot = poller.get(job.id).await.unwrap();
            assert_eq!(snapshot.retry_count, expected_retry);
            assert!(!snapshot.status.is_terminal(), "must survive {expected_retry} failures");
        }

        // The fifth consecutive failure crosses the ceiling
        poller.poll_once().await;
        let snapshot = poller.get(job.id).await.unwrap();
        assert_eq!(snapshot.status, JobStatus::Failed);
        assert!(snapshot.last_error.unwrap().contains("5 times"));
    }

    #[tokio::test]
    async fn successful_poll_resets_the_retry_counter() {
        let dir = TempDir::new().unwrap();
        let client = Arc::new(ScriptedClient::default());
        let (poller, _registry) = poller_in(&dir, Arc::clone(&client), test_config(5));

        let job = poller.submit(ChatId(1), "https://example.com/v", &spec()).await;

        // Four failures, one success, four more failures: the ceiling is
        // about consecutive failures, so the job must still be live.
        for _ in 0..4 {
            poller.poll_once().await;
        }
        client.push_status(StatusStep::state(RemoteJobState::Processing));
        poller.poll_once().await;
        assert_eq!(poller.get(job.id).await.unwrap().retry_count, 0);

        for _ in 0..4 {
            poller.poll_once().await;
        }
        let snapshot = poller.get(job.id).await.unwrap();
        assert!(!snapshot.status.is_terminal());
        assert_eq!(snapshot.retry_count, 4);
    }

    #[tokio::test]
    async fn ready_without_reference_settles_as_failed() {
        let dir = TempDir::new().unwrap();
        let client = Arc::new(ScriptedClient::default());
        let (poller, registry) = poller_in(&dir, Arc::clone(&client), test_config(5));

        let job = poller.submit(ChatId(1), "https://example.com/v", &spec()).await;
        client.push_status(StatusStep::state(RemoteJobState::Ready));
        poller.poll_once().await;

        let snapshot = poller.get(job.id).await.unwrap();
        assert_eq!(snapshot.status, JobStatus::Failed);
        assert!(snapshot.result_token.is_none());
        assert!(snapshot.last_error.unwrap().contains("result reference"));
        assert_eq!(registry.stats().await.count, 0);
    }

    #[tokio::test]
    async fn remote_failure_reason_is_recorded() {
        let dir = TempDir::new().unwrap();
        let client = Arc::new(ScriptedClient::default());
        let (poller, _registry) = poller_in(&dir, Arc::clone(&client), test_config(5));

        let job = poller.submit(ChatId(1), "https://example.com/v", &spec()).await;
        client.push_status(StatusStep::Remote(RemoteStatus {
            status: RemoteJobState::Failed,
            progress: None,
            download_ref: None,
            error: Some("source media unavailable".to_string()),
        }));
        poller.poll_once().await;

        let snapshot = poller.get(job.id).await.unwrap();
        assert_eq!(snapshot.status, JobStatus::Failed);
        assert_eq!(snapshot.last_error.as_deref(), Some("source media unavailable"));
    }

    #[tokio::test]
    async fn full_lifecycle_reaches_ready_with_a_resolvable_artifact() {
        let dir = TempDir::new().unwrap();
        let client = Arc::new(ScriptedClient::default());
        let (poller, registry) = poller_in(&dir, Arc::clone(&client), test_config(5));

        let job = poller.submit(ChatId(7), "https://example.com/v", &spec()).await;
        assert_eq!(job.status, JobStatus::Queued);

        client.push_status(StatusStep::Remote(RemoteStatus {
            status: RemoteJobState::Processing,
            progress: Some(40),
            download_ref: None,
            error: None,
        }));
        poller.poll_once().await;
        let snapshot = poller.get(job.id).await.unwrap();
        assert_eq!(snapshot.status, JobStatus::Processing);
        assert_eq!(snapshot.progress, Some(40));

        client.push_status(StatusStep::ready_with_ref("https://backend/results/rj-1"));
        poller.poll_once().await;
        let snapshot = poller.get(job.id).await.unwrap();
        assert_eq!(snapshot.status, JobStatus::Ready);
        assert_eq!(snapshot.progress, Some(100));
        assert!(snapshot.ended_at.is_some());

        let token = snapshot.result_token.unwrap();
        let artifact = registry.resolve(&token).await.unwrap();
        assert_eq!(artifact.owner_chat_id, ChatId(7));
        assert_eq!(artifact.owner_job_id, job.id);
        let bytes = tokio::fs::read(&artifact.storage_path).await.unwrap();
        assert_eq!(bytes, b"converted bytes");
    }

    #[tokio::test]
    async fn failed_result_fetch_fails_the_job() {
        let dir = TempDir::new().unwrap();
        let client = Arc::new(ScriptedClient {
            fail_download: true,
            ..ScriptedClient::default()
        });
        let (poller, registry) = poller_in(&dir, Arc::clone(&client), test_config(5));

        let job = poller.submit(ChatId(1), "https://example.com/v", &spec()).await;
        client.push_status(StatusStep::ready_with_ref("https://backend/results/rj-1"));
        poller.poll_once().await;

        let snapshot = poller.get(job.id).await.unwrap();
        assert_eq!(snapshot.status, JobStatus::Failed);
        assert!(snapshot.last_error.unwrap().contains("result fetch failed"));
        assert_eq!(registry.stats().await.count, 0);
    }

    #[tokio::test]
    async fn cancel_only_affects_live_jobs() {
        let dir = TempDir::new().unwrap();
        let client = Arc::new(ScriptedClient::default());
        let (poller, _registry) = poller_in(&dir, client, test_config(5));

        let job = poller.submit(ChatId(1), "https://example.com/v", &spec()).await;

        assert!(poller.cancel(job.id).await);
        let snapshot = poller.get(job.id).await.unwrap();
        assert_eq!(snapshot.status, JobStatus::Failed);
        assert_eq!(snapshot.last_error.as_deref(), Some("cancelled by user"));

        // Already terminal: a second cancel is a no-op
        assert!(!poller.cancel(job.id).await);
        // Unknown ids report false rather than erroring
        assert!(!poller.cancel(JobId(999)).await);
    }

    #[tokio::test]
    async fn late_poll_does_not_overwrite_a_cancelled_job() {
        let dir = TempDir::new().unwrap();
        let client = Arc::new(ScriptedClient::default());
        let (poller, _registry) = poller_in(&dir, Arc::clone(&client), test_config(5));

        let job = poller.submit(ChatId(1), "https://example.com/v", &spec()).await;
        client.push_status(StatusStep::ready_with_ref("https://backend/results/rj-1"));

        assert!(poller.cancel(job.id).await);
        poller.poll_once().await;

        let snapshot = poller.get(job.id).await.unwrap();
        assert_eq!(snapshot.status, JobStatus::Failed);
        assert!(snapshot.result_token.is_none());
        // Terminal jobs are not polled at all
        assert_eq!(client.download_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn gc_purges_settled_jobs_after_the_grace_period() {
        let dir = TempDir::new().unwrap();
        let client = Arc::new(ScriptedClient {
            submit_remote_id: StdMutex::new(None),
            ..ScriptedClient::default()
        });
        let mut config = test_config(5);
        config.terminal_grace_secs = 0;
        let (poller, _registry) = poller_in(&dir, client, config);

        let job = poller.submit(ChatId(1), "https://example.com/v", &spec()).await;
        assert_eq!(job.status, JobStatus::Failed);

        assert_eq!(poller.gc_once().await, 1);
        assert!(poller.get(job.id).await.is_none());
    }

    #[tokio::test]
    async fn gc_keeps_settled_jobs_within_the_grace_period() {
        let dir = TempDir::new().unwrap();
        let client = Arc::new(ScriptedClient {
            submit_remote_id: StdMutex::new(None),
            ..ScriptedClient::default()
        });
        let (poller, _registry) = poller_in(&dir, client, test_config(5));

        let job = poller.submit(ChatId(1), "https://example.com/v", &spec()).await;

        assert_eq!(poller.gc_once().await, 0);
        assert!(poller.get(job.id).await.is_some());
    }

    #[tokio::test]
    async fn gc_purges_overage_jobs_regardless_of_state() {
        let dir = TempDir::new().unwrap();
        let client = Arc::new(ScriptedClient::default());
        let mut config = test_config(5);
        config.max_job_age_secs = 0;
        let (poller, _registry) = poller_in(&dir, client, config);

        let job = poller.submit(ChatId(1), "https://example.com/v", &spec()).await;
        assert_eq!(job.status, JobStatus::Queued);

        assert_eq!(poller.gc_once().await, 1);
        assert!(poller.get(job.id).await.is_none());
    }
}
