//! # episode-dl
//!
//! Concurrent, resumable download-and-assembly pipeline for streaming-site
//! episodes.
//!
//! Given episodes that a site resolver has already turned into concrete
//! stream URLs, episode-dl:
//! - schedules them under a global episode limit and a per-episode transfer limit
//! - fetches every stream with ranged, resumable HTTP transfers and retries
//! - verifies finished streams against declared checksums
//! - muxes video and audio with ffmpeg, converts danmaku, writes sidecars
//! - reports progress without ever blocking a transfer
//!
//! One failing episode never takes the batch down with it; results are
//! collected per episode in a [`RunReport`].
//!
//! ## Quick Start
//!
//! ```no_run
//! use episode_dl::{Config, EpisodeDescriptor, Scheduler, StreamKind, StreamSpec};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let scheduler = Scheduler::new(Config::default())?;
//!
//!     // Ctrl+C cancels the run; partial files stay on disk for a resume
//!     tokio::spawn(episode_dl::cancel_on_signal(scheduler.cancellation_token()));
//!
//!     let episode = EpisodeDescriptor::new("BV1xx411c7mD/p1", "downloads/Episode 1")
//!         .with_stream(
//!             StreamSpec::new(StreamKind::Video, "https://cdn.example.com/v.m4s")
//!                 .with_mirrors(["https://mirror.example.com/v.m4s"]),
//!         )
//!         .with_stream(StreamSpec::new(StreamKind::Audio, "https://cdn.example.com/a.m4s"))
//!         .with_stream(StreamSpec::new(StreamKind::Danmaku, "https://comment.example.com/1.xml"));
//!
//!     let report = scheduler.run(vec![episode]).await?;
//!     println!("{report}");
//!     std::process::exit(report.exit_code());
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Muxing, danmaku conversion and sidecar files
pub mod assembly;
/// Configuration types
pub mod config;
/// Per-episode pipeline and lifecycle
pub mod episode;
/// Error types
pub mod error;
/// Progress aggregation
pub mod progress;
/// Retry logic with exponential backoff
pub mod retry;
/// Episode scheduling
pub mod scheduler;
/// Resumable stream transfers
pub mod transfer;
/// Core types and events
pub mod types;
/// Utility functions
pub mod utils;

// Re-export commonly used types
pub use config::{
    AssemblyConfig, Config, DiskSpaceConfig, DownloadConfig, OutputFormat, PartialOutputPolicy,
    RetryConfig, TransferConfig,
};
pub use episode::{Components, EpisodeTask, StreamAssembler};
pub use error::{AssemblyError, Error, ErrorKind, Result};
pub use progress::{ProgressReporter, ProgressSender, ProgressSnapshot, spawn_log_renderer};
pub use scheduler::{RunReport, Scheduler};
pub use transfer::{HttpFetcher, StreamFetcher};
pub use types::{
    ArtifactDisposition, Checksum, EpisodeDescriptor, EpisodeId, EpisodeMetadata, EpisodeResult,
    EpisodeState, Event, ProgressEvent, SkipReason, StreamKind, StreamSpec, TransferStatus,
};

use tokio_util::sync::CancellationToken;

/// Cancel `token` on the first termination signal
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// Returns early without cancelling if `token` is cancelled by someone else.
pub async fn cancel_on_signal(token: CancellationToken) {
    tokio::select! {
        _ = wait_for_signal() => {
            tracing::info!("Cancelling run");
            token.cancel();
        }
        _ = token.cancelled() => {}
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Registration may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), Ok(mut sigint)) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            sigint.recv().await;
            tracing::info!("Received SIGINT signal (Ctrl+C)");
        }
        (Ok(mut sigterm), Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            sigterm.recv().await;
            tracing::info!("Received SIGTERM signal");
        }
        (Err(e), Err(_)) => {
            tracing::error!(error = %e, "Could not register any signal handlers, using ctrl_c fallback");
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
