//! Token-addressed ephemeral artifact registry
//!
//! Single source of truth for what ephemeral bytes exist, for whom, and
//! until when. Artifacts are immutable once registered and disappear via
//! TTL sweep, lazy eviction on lookup, explicit deletion, per-chat bulk
//! cleanup, or the emergency shutdown flush.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::error::{RegistryError, Result};
use crate::types::{ArtifactToken, ChatId, Event, JobId};

/// A registered ephemeral byte blob addressable by token
///
/// Owned exclusively by the registry until deleted or expired; callers only
/// ever hold snapshots.
#[derive(Clone, Debug)]
pub struct Artifact {
    /// Opaque random token, the artifact's only external handle
    pub token: ArtifactToken,
    /// Location of the byte content on disk
    pub storage_path: PathBuf,
    /// Filename presented to downloaders (drives Content-Type and
    /// Content-Disposition)
    pub file_name: String,
    /// Chat the artifact belongs to
    pub owner_chat_id: ChatId,
    /// Job that produced the artifact
    pub owner_job_id: JobId,
    /// Absolute expiry; the artifact is logically gone once `now >= expires_at`
    pub expires_at: DateTime<Utc>,
}

impl Artifact {
    /// Whether the artifact's TTL has elapsed
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Aggregate registry statistics
///
/// Best-effort: per-entry size lookups may fail without aborting the
/// aggregation (failed entries are logged and skipped).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Number of live entries
    pub count: usize,
    /// Sum of on-disk sizes of entries whose metadata could be read
    pub total_bytes: u64,
    /// Earliest expiry among live entries
    pub oldest_expiry: Option<DateTime<Utc>>,
    /// Latest expiry among live entries
    pub newest_expiry: Option<DateTime<Utc>>,
}

/// In-memory artifact registry with TTL eviction
///
/// The entry map is exclusively owned here and protected by a mutex; all
/// interaction goes through the documented operations. Mutating operations
/// are safe to call concurrently with `resolve` and the sweep task.
pub struct ArtifactRegistry {
    storage_dir: PathBuf,
    entries: Mutex<HashMap<ArtifactToken, Artifact>>,
    event_tx: tokio::sync::broadcast::Sender<Event>,
}

impl ArtifactRegistry {
    /// Create a registry writing blobs under `storage_dir`
    ///
    /// The directory must already exist (the gateway creates it on startup).
    pub fn new(storage_dir: PathBuf, event_tx: tokio::sync::broadcast::Sender<Event>) -> Self {
        Self {
            storage_dir,
            entries: Mutex::new(HashMap::new()),
            event_tx,
        }
    }

    /// Persist `content` under a freshly generated token and register it
    ///
    /// Fails with [`RegistryError::StorageWrite`] if the underlying write
    /// fails; partially written bytes are removed before the error
    /// propagates.
    pub async fn register(
        &self,
        content: &[u8],
        file_name: &str,
        owner_chat_id: ChatId,
        owner_job_id: JobId,
        ttl: Duration,
    ) -> Result<Artifact> {
        let token = ArtifactToken::generate();
        let storage_path = self.blob_path(&token, file_name);

        if let Err(e) = tokio::fs::write(&storage_path, content).await {
            // Remove whatever made it to disk before surfacing the error
            remove_file_best_effort(&storage_path).await;
            return Err(RegistryError::StorageWrite {
                path: storage_path,
                reason: e.to_string(),
            }
            .into());
        }

        Ok(self
            .insert(token, storage_path, file_name, owner_chat_id, owner_job_id, ttl)
            .await)
    }

    /// Register a blob already written to `source` by moving it into the
    /// storage directory under a fresh token
    ///
    /// Used by the download pipelines, which stream to a staging file first.
    /// On failure the staging file and any partial destination are removed.
    pub async fn register_file(
        &self,
        source: &Path,
        file_name: &str,
        owner_chat_id: ChatId,
        owner_job_id: JobId,
        ttl: Duration,
    ) -> Result<Artifact> {
        let token = ArtifactToken::generate();
        let storage_path = self.blob_path(&token, file_name);

        // rename is atomic on the same filesystem; fall back to copy+remove
        // when the staging dir lives elsewhere
        if tokio::fs::rename(source, &storage_path).await.is_err() {
            if let Err(e) = tokio::fs::copy(source, &storage_path).await {
                remove_file_best_effort(&storage_path).await;
                remove_file_best_effort(source).await;
                return Err(RegistryError::StorageWrite {
                    path: storage_path,
                    reason: e.to_string(),
                }
                .into());
            }
            remove_file_best_effort(source).await;
        }

        Ok(self
            .insert(token, storage_path, file_name, owner_chat_id, owner_job_id, ttl)
            .await)
    }

    async fn insert(
        &self,
        token: ArtifactToken,
        storage_path: PathBuf,
        file_name: &str,
        owner_chat_id: ChatId,
        owner_job_id: JobId,
        ttl: Duration,
    ) -> Artifact {
        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(1));
        let artifact = Artifact {
            token: token.clone(),
            storage_path,
            file_name: file_name.to_string(),
            owner_chat_id,
            owner_job_id,
            expires_at,
        };

        self.entries.lock().await.insert(token, artifact.clone());

        tracing::debug!(
            token = %artifact.token,
            chat_id = %owner_chat_id,
            job_id = %owner_job_id,
            expires_at = %expires_at,
            "artifact registered"
        );
        artifact
    }

    /// Look up an artifact by token
    ///
    /// Returns `None` for unknown tokens and for expired ones; an expired
    /// entry is lazily evicted (map entry removed, bytes deleted best-effort)
    /// before reporting not-found, so expiry is indistinguishable from
    /// "never existed".
    pub async fn resolve(&self, token: &ArtifactToken) -> Option<Artifact> {
        let evicted = {
            let mut entries = self.entries.lock().await;
            match entries.get(token) {
                Some(artifact) if !artifact.is_expired() => return Some(artifact.clone()),
                Some(_) => entries.remove(token),
                None => None,
            }
        };

        if let Some(artifact) = evicted {
            tracing::debug!(token = %artifact.token, "lazy-evicting expired artifact on lookup");
            remove_file_best_effort(&artifact.storage_path).await;
            self.event_tx
                .send(Event::ArtifactExpired {
                    token: artifact.token,
                })
                .ok();
        }
        None
    }

    /// Delete an artifact and its bytes
    ///
    /// Idempotent: deleting an unknown or already-deleted token is not an
    /// error.
    pub async fn delete(&self, token: &ArtifactToken) {
        let removed = self.entries.lock().await.remove(token);
        if let Some(artifact) = removed {
            remove_file_best_effort(&artifact.storage_path).await;
            tracing::debug!(token = %token, "artifact deleted");
        }
    }

    /// Evict every entry whose expiry has passed
    ///
    /// Map entries are removed under the lock, then file deletion runs
    /// outside it; a concurrent `resolve` can therefore never observe an
    /// entry whose bytes the sweep already deleted.
    pub async fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let expired: Vec<Artifact> = {
            let mut entries = self.entries.lock().await;
            let tokens: Vec<ArtifactToken> = entries
                .iter()
                .filter(|(_, a)| a.expires_at <= now)
                .map(|(t, _)| t.clone())
                .collect();
            tokens.iter().filter_map(|t| entries.remove(t)).collect()
        };

        let count = expired.len();
        for artifact in expired {
            remove_file_best_effort(&artifact.storage_path).await;
            self.event_tx
                .send(Event::ArtifactExpired {
                    token: artifact.token,
                })
                .ok();
        }

        if count > 0 {
            tracing::info!(evicted = count, "expired artifacts swept");
        }
        count
    }

    /// Delete every artifact owned by `chat_id`, returning how many were removed
    pub async fn delete_all_for_chat(&self, chat_id: ChatId) -> usize {
        let removed: Vec<Artifact> = {
            let mut entries = self.entries.lock().await;
            let tokens: Vec<ArtifactToken> = entries
                .iter()
                .filter(|(_, a)| a.owner_chat_id == chat_id)
                .map(|(t, _)| t.clone())
                .collect();
            tokens.iter().filter_map(|t| entries.remove(t)).collect()
        };

        let count = removed.len();
        for artifact in removed {
            remove_file_best_effort(&artifact.storage_path).await;
        }
        if count > 0 {
            tracing::info!(chat_id = %chat_id, removed = count, "chat artifacts deleted");
        }
        count
    }

    /// Emergency flush: delete every artifact (used on shutdown)
    pub async fn delete_all(&self) -> usize {
        let removed: Vec<Artifact> = {
            let mut entries = self.entries.lock().await;
            entries.drain().map(|(_, a)| a).collect()
        };

        let count = removed.len();
        for artifact in removed {
            remove_file_best_effort(&artifact.storage_path).await;
        }
        if count > 0 {
            tracing::info!(removed = count, "all artifacts flushed");
        }
        count
    }

    /// Best-effort aggregate statistics over live entries
    pub async fn stats(&self) -> RegistryStats {
        let snapshot: Vec<Artifact> = {
            let entries = self.entries.lock().await;
            entries.values().cloned().collect()
        };

        let mut stats = RegistryStats {
            count: snapshot.len(),
            ..RegistryStats::default()
        };

        for artifact in &snapshot {
            match tokio::fs::metadata(&artifact.storage_path).await {
                Ok(meta) => stats.total_bytes += meta.len(),
                Err(e) => {
                    tracing::warn!(
                        token = %artifact.token,
                        error = %e,
                        "skipping artifact size in stats"
                    );
                }
            }
            stats.oldest_expiry = match stats.oldest_expiry {
                Some(ts) => Some(ts.min(artifact.expires_at)),
                None => Some(artifact.expires_at),
            };
            stats.newest_expiry = match stats.newest_expiry {
                Some(ts) => Some(ts.max(artifact.expires_at)),
                None => Some(artifact.expires_at),
            };
        }
        stats
    }

    /// Spawn the periodic expiry sweep task
    ///
    /// Runs until the cancellation token fires. Independent of lookups, so
    /// artifacts nobody asks for still get evicted on time.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel_token: tokio_util::sync::CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so a fresh start
            // doesn't sweep an empty map.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        registry.sweep_expired().await;
                    }
                    _ = cancel_token.cancelled() => {
                        break;
                    }
                }
            }
        })
    }

    fn blob_path(&self, token: &ArtifactToken, file_name: &str) -> PathBuf {
        // Blob names derive from the token, never from caller input; the
        // original extension is kept so delivery can infer a content type.
        match Path::new(file_name).extension().and_then(|e| e.to_str()) {
            Some(ext) => self.storage_dir.join(format!("{token}.{ext}")),
            None => self.storage_dir.join(token.as_str()),
        }
    }
}

async fn remove_file_best_effort(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove artifact file");
        }
    }
}
