//! # Release Screens
//!
//! Screenshot pipeline for video releases: picks capture offsets across a
//! title, extracts frames with ffmpeg, recompresses them losslessly in worker
//! processes, validates their byte sizes against the active image host (with
//! bounded retakes), and uploads them with per-image retries and ordered host
//! failover.
//!
//! ## Pipeline
//!
//! | Stage | Module | Concurrency |
//! |-------|--------|-------------|
//! | Timestamp selection | [`timestamps`] | none, deterministic |
//! | Frame extraction | [`capture`] | one ffmpeg process per frame, semaphore-bounded |
//! | Lossless recompression | [`worker`], [`optimizer`] | `min(jobs, max_workers)` OS processes |
//! | Size validation and retakes | [`validation`] | waves of recaptures |
//! | Upload | [`upload`], [`host`] | semaphore per host, retry per image |
//! | Host failover | [`failover`] | sequential, forward-only |
//! | Re-upload cache | [`cache`] | one JSON document per release |
//!
//! Every batch result is sorted back into request order before it leaves a
//! stage, whatever order the concurrent units finished in.
//!
//! ## Failure handling
//!
//! | Failure | Effect |
//! |---------|--------|
//! | Capture failure | retake, like a size rejection |
//! | Optimization failure | image kept unoptimized |
//! | Size rejection | retake at a perturbed offset, up to 5 times |
//! | Duplicate / auth upload failure | no retry on that host |
//! | Transient upload failure | retried, then failover |
//! | All hosts failed | reported in the outcome as host exhaustion |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use release_screens::{
//!     CancellationScope, Config, RunContext, ScreenshotService, SourceDescriptor, TrackerScope,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let scope = CancellationScope::new(config.kill_grace_period);
//!     let service = ScreenshotService::new(config.clone(), scope)?;
//!
//!     let ctx = RunContext::from_config(&config, TrackerScope::new("Some.Release", "tracker"));
//!     let source = SourceDescriptor::new("/media/title.mkv", 5400.0, 23.976);
//!     let outcome = service.capture_and_upload_batch(&ctx, &source).await?;
//!     println!("{}", outcome.summary());
//!     Ok(())
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ```bash
//! release-screens --config screens.json run --source title.mkv --duration 5400 --fps 23.976 \
//!     --release Some.Release --tracker tracker
//! release-screens cache show --release Some.Release
//! ```

/// Configuration, source description and per-run context
pub mod config;

/// Error types and error handling utilities
pub mod error;

/// Screenshot and hosted-image records
pub mod screenshot;

/// Capture offset selection
pub mod timestamps;

/// Frame metadata probe for overlays
pub mod probe;

/// Frame extraction through ffmpeg
pub mod capture;

/// Lossless PNG recompression and the worker stdio protocol
pub mod optimizer;

/// Per-batch pool of optimization worker processes
pub mod worker;

/// Run-wide cancellation and child-process cleanup
pub mod cancellation;

/// Byte-size validation and retakes
pub mod validation;

/// Image host backends
pub mod host;

/// Concurrent upload of a batch to one host
pub mod upload;

/// Host failover and reuse of already hosted images
pub mod failover;

/// Persisted re-upload cache
pub mod cache;

/// Main screenshot service orchestrating the pipeline
pub mod screenshot_service;

/// Command-line interface implementation
pub mod cli;

/// Performance metrics collection and monitoring
pub mod metrics;

/// Utility functions and helpers
pub mod utils;


pub use cache::*;
pub use cancellation::*;
pub use capture::*;
pub use cli::*;
pub use config::*;
pub use error::*;
pub use failover::*;
pub use host::*;
pub use metrics::*;
pub use optimizer::*;
pub use probe::*;
pub use screenshot::*;
pub use screenshot_service::*;
pub use timestamps::*;
pub use upload::*;
pub use utils::*;
pub use validation::*;
pub use worker::*;
