//! Admission gate consulted before any conversion request is accepted
//!
//! The gate is a pluggable seam: the gateway only sees the trait. The
//! default implementation is a per-chat token bucket with an exempt-ids
//! list for admin chats.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::Mutex;

use crate::config::RateLimitConfig;
use crate::types::ChatId;

/// Outcome of an admission check
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// When denied, how long the caller should wait before retrying
    pub retry_after_seconds: Option<u64>,
    /// Optional human-readable denial reason
    pub reason: Option<String>,
}

impl Decision {
    /// An unconditional allow
    pub fn allow() -> Self {
        Self {
            allowed: true,
            retry_after_seconds: None,
            reason: None,
        }
    }

    /// A denial with a retry hint
    pub fn deny(retry_after_seconds: u64, reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            retry_after_seconds: Some(retry_after_seconds),
            reason: Some(reason.into()),
        }
    }
}

/// Rate-limit / authorization check preceding job acceptance
#[async_trait]
pub trait AdmissionGate: Send + Sync {
    /// Would a request from `subject` be admitted right now?
    ///
    /// Does not consume budget; pair with [`consume`](Self::consume) once
    /// the request is actually accepted.
    async fn check(&self, subject: ChatId) -> Decision;

    /// Record one accepted request against `subject`'s budget
    async fn consume(&self, subject: ChatId);
}

/// Simple token bucket
struct TokenBucket {
    /// Available tokens
    tokens: f64,
    /// Last refill time
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: u32) -> Self {
        Self {
            tokens: capacity as f64,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, rate_per_sec: f64, capacity: u32) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate_per_sec).min(capacity as f64);
        self.last_refill = now;
    }

    /// Seconds until one token is available, or None if one is available now
    fn wait_secs(&self, rate_per_sec: f64) -> Option<u64> {
        if self.tokens >= 1.0 {
            None
        } else {
            Some(((1.0 - self.tokens) / rate_per_sec).ceil() as u64)
        }
    }
}

/// Per-chat token-bucket [`AdmissionGate`]
pub struct TokenBucketGate {
    /// Per-chat buckets
    buckets: Mutex<HashMap<ChatId, TokenBucket>>,
    /// Configuration
    config: RateLimitConfig,
}

impl TokenBucketGate {
    /// Create a gate from configuration
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            config,
        }
    }

    fn rate_per_sec(&self) -> f64 {
        f64::from(self.config.requests_per_minute) / 60.0
    }

    fn is_exempt(&self, subject: ChatId) -> bool {
        self.config.exempt_ids.contains(&subject.0)
    }
}

#[async_trait]
impl AdmissionGate for TokenBucketGate {
    async fn check(&self, subject: ChatId) -> Decision {
        if !self.config.enabled || self.is_exempt(subject) {
            return Decision::allow();
        }

        let rate = self.rate_per_sec();
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets
            .entry(subject)
            .or_insert_with(|| TokenBucket::new(self.config.burst_size));
        bucket.refill(rate, self.config.burst_size);

        match bucket.wait_secs(rate) {
            None => Decision::allow(),
            Some(wait) => Decision::deny(wait, "too many conversion requests"),
        }
    }

    async fn consume(&self, subject: ChatId) {
        if !self.config.enabled || self.is_exempt(subject) {
            return;
        }

        let rate = self.rate_per_sec();
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets
            .entry(subject)
            .or_insert_with(|| TokenBucket::new(self.config.burst_size));
        bucket.refill(rate, self.config.burst_size);
        bucket.tokens = (bucket.tokens - 1.0).max(0.0);
    }
}
