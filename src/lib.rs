//! # media-bridge
//!
//! Backend library fronting a remote media-conversion API: accepts
//! conversion requests, tracks async jobs to completion, and serves
//! finished artifacts over HTTP under unguessable, expiring tokens.
//!
//! ## Design Philosophy
//!
//! media-bridge is designed to be:
//! - **Library-first** - No CLI or UI, purely a Rust crate for embedding
//! - **Event-driven** - Consumers subscribe to events, no polling required
//! - **Pluggable** - Backend client and admission policy are trait seams
//! - **Self-cleaning** - Artifacts and job records expire on their own
//!
//! ## Quick Start
//!
//! ```no_run
//! use media_bridge::{ChatId, Config, ConversionSpec, MediaBridge};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let bridge = MediaBridge::new(Config::default()).await?;
//!     bridge.start_background_tasks();
//!     bridge.spawn_api_server();
//!
//!     // Subscribe to events
//!     let mut events = bridge.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     let spec = ConversionSpec {
//!         format: "mp3".to_string(),
//!         bitrate_kbps: Some(192),
//!     };
//!     let outcome = bridge
//!         .request_conversion(ChatId(42), "https://example.com/video", &spec)
//!         .await?;
//!     println!("Outcome: {:?}", outcome);
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Admission gate (rate limiting)
pub mod admission;
/// Artifact delivery server
pub mod api;
/// Remote conversion backend client
pub mod client;
/// Configuration types
pub mod config;
/// Error types
pub mod error;
/// Gateway facade
pub mod gateway;
/// Synchronous download pipeline
pub mod pipeline;
/// Async job tracking and polling
pub mod poller;
/// Token-addressed artifact registry
pub mod registry;
/// Core types and events
pub mod types;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types
pub use admission::{AdmissionGate, Decision, TokenBucketGate};
pub use client::{CheckResult, ConversionClient, HttpConversionClient, RemoteJobState, RemoteStatus};
pub use config::{ApiConfig, ClientConfig, Config, PollerConfig, RateLimitConfig, StorageConfig};
pub use error::{
    ApiError, ClientError, Error, ErrorDetail, JobError, RegistryError, Result, ToHttpStatus,
};
pub use gateway::{BridgeStats, ConversionOutcome, MediaBridge};
pub use pipeline::{DeliveryOutcome, SyncDownloadPipeline};
pub use poller::JobPoller;
pub use registry::{Artifact, ArtifactRegistry, RegistryStats};
pub use types::{
    ArtifactToken, ChatId, ConversionSpec, Event, Job, JobId, JobStatus, ProcessingMode,
};

/// Run the gateway until a termination signal arrives, then shut it down.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use media_bridge::{Config, MediaBridge, run_with_shutdown};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let bridge = MediaBridge::new(Config::default()).await?;
///     bridge.start_background_tasks();
///     bridge.spawn_api_server();
///
///     run_with_shutdown(bridge).await?;
///     Ok(())
/// }
/// ```
pub async fn run_with_shutdown(bridge: MediaBridge) -> Result<()> {
    wait_for_signal().await;
    bridge.shutdown().await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    // Signal registration may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM");
                }
                _ = sigint.recv() => {
                    tracing::info!("received SIGINT (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("received SIGINT (Ctrl+C)");
            } else {
                tracing::error!("could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("received SIGTERM");
            } else {
                tracing::error!("could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("received Ctrl+C");
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
        }
    }
}
