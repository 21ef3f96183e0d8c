//! Core types for media-bridge

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Unique local identifier for a conversion job
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema,
)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl JobId {
    /// Create a new JobId
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the inner i64 value
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl From<i64> for JobId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Identifier of the chat that owns a job or artifact
///
/// Used purely for provenance and bulk cleanup; the library attaches no
/// other meaning to it.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema,
)]
#[serde(transparent)]
pub struct ChatId(pub i64);

impl From<i64> for ChatId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for ChatId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque token addressing one registered artifact
///
/// 256 bits of randomness, hex-encoded. Possession of the token is the only
/// authorization required to fetch the artifact.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(transparent)]
pub struct ArtifactToken(String);

impl ArtifactToken {
    /// Number of random bytes in a generated token (256 bits)
    pub const RAW_LEN: usize = 32;

    /// Generate a fresh cryptographically random token
    pub fn generate() -> Self {
        use rand::RngCore;

        let mut bytes = [0u8; Self::RAW_LEN];
        rand::rngs::OsRng.fill_bytes(&mut bytes);

        let mut hex = String::with_capacity(Self::RAW_LEN * 2);
        for byte in bytes {
            use std::fmt::Write;
            // write! to a String cannot fail
            let _ = write!(hex, "{:02x}", byte);
        }
        Self(hex)
    }

    /// View the token as its hex string form
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ArtifactToken {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for ArtifactToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Job status
///
/// Transitions are monotonic along `queued → processing → {ready | failed}`;
/// `queued` may also jump straight to `failed` (submission error) or `ready`
/// (fast remote completion). No transition leaves `ready` or `failed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Accepted and submitted, waiting for the backend to pick it up
    Queued,
    /// Backend is converting
    Processing,
    /// Conversion finished and the result artifact is registered
    Ready,
    /// Conversion failed, was cancelled, or could not be tracked
    Failed,
}

impl JobStatus {
    /// Whether this status is terminal (no further transitions)
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Ready | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Ready => "ready",
            JobStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// How a conversion request is processed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingMode {
    /// Content streams back immediately on one connection, no remote job id
    Sync,
    /// Backend runs the conversion as a tracked job that must be polled
    Async,
}

/// Requested output format and bitrate for a conversion
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ConversionSpec {
    /// Target container/codec, e.g. "mp3" or "mp4"
    pub format: String,
    /// Target bitrate in kbit/s; backend default when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitrate_kbps: Option<u32>,
}

/// One conversion request's tracked lifecycle
///
/// Mutated only by the poller (async) or the pipeline (sync) holding
/// exclusive logical ownership of the record; everyone else sees snapshots.
#[derive(Clone, Debug, Serialize, ToSchema)]
pub struct Job {
    /// Local correlation id
    pub id: JobId,
    /// Backend-side job id, set once submission succeeds (async only)
    pub remote_job_id: Option<String>,
    /// Chat that requested the conversion
    pub chat_id: ChatId,
    /// Source media URL
    pub source_url: String,
    /// Processing mode the job was accepted under
    pub mode: ProcessingMode,
    /// Current lifecycle status
    pub status: JobStatus,
    /// Number of status polls performed so far
    pub poll_count: u32,
    /// Consecutive transport failures on status polls (reset on success)
    pub retry_count: u32,
    /// Last progress percentage reported by the backend, if any
    pub progress: Option<u8>,
    /// When the job was accepted
    pub started_at: DateTime<Utc>,
    /// When the job reached a terminal state
    pub ended_at: Option<DateTime<Utc>>,
    /// Token of the registered result artifact, set on `ready`
    pub result_token: Option<ArtifactToken>,
    /// Human-readable reason for the terminal `failed` state
    pub last_error: Option<String>,
}

impl Job {
    /// Create a new job in the `queued` state
    pub fn new(id: JobId, chat_id: ChatId, source_url: String, mode: ProcessingMode) -> Self {
        Self {
            id,
            remote_job_id: None,
            chat_id,
            source_url,
            mode,
            status: JobStatus::Queued,
            poll_count: 0,
            retry_count: 0,
            progress: None,
            started_at: Utc::now(),
            ended_at: None,
            result_token: None,
            last_error: None,
        }
    }
}

/// Events emitted by media-bridge
///
/// Consumers subscribe via a broadcast channel; if nobody is listening,
/// events are dropped silently.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    /// A job was accepted and submitted to the backend
    JobQueued {
        /// The new job's id
        id: JobId,
        /// Owning chat
        chat_id: ChatId,
    },
    /// A job's observed remote state or progress changed
    JobProgress {
        /// The job id
        id: JobId,
        /// Mirrored local status
        status: JobStatus,
        /// Progress percentage, when the backend reports one
        progress: Option<u8>,
    },
    /// A job completed and its artifact is registered
    JobReady {
        /// The job id
        id: JobId,
        /// Token under which the result artifact resolves
        token: ArtifactToken,
    },
    /// A job reached the terminal `failed` state
    JobFailed {
        /// The job id
        id: JobId,
        /// Human-readable failure reason
        reason: String,
    },
    /// An artifact was evicted because its TTL elapsed
    ArtifactExpired {
        /// Token of the evicted artifact
        token: ArtifactToken,
    },
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_generation_is_unique_and_hex() {
        let a = ArtifactToken::generate();
        let b = ArtifactToken::generate();

        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), ArtifactToken::RAW_LEN * 2);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn terminal_statuses() {
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(JobStatus::Ready.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn new_job_starts_queued_with_clean_counters() {
        let job = Job::new(
            JobId(1),
            ChatId(42),
            "https://example.com/video".to_string(),
            ProcessingMode::Async,
        );

        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.poll_count, 0);
        assert_eq!(job.retry_count, 0);
        assert!(job.remote_job_id.is_none());
        assert!(job.result_token.is_none());
        assert!(job.ended_at.is_none());
    }

    #[test]
    fn job_id_round_trips_through_display_and_parse() {
        let id = JobId(123);
        let parsed: JobId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }
}
