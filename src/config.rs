//! Configuration management with serde serialization/deserialization
//!
//! This module provides the immutable run configuration, the description of the
//! source title handed in by the metadata layer, and the per-run [`RunContext`]
//! derived from both.

use crate::{PolicyTable, ScreensError, SizePolicy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure for release screenshots
///
/// Constructed once (from a JSON file, CLI overrides on top) and passed by
/// reference into every component. Nothing in the crate mutates it after
/// validation.
///
/// # Examples
///
/// ```rust
/// use release_screens::Config;
///
/// // Use default configuration
/// let config = Config::default();
///
/// // Create custom configuration
/// let config = Config {
///     screenshot_count: 6,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Number of screenshots requested per release (default: 4)
    pub screenshot_count: usize,

    /// Screenshots already satisfied by other means; capture only runs for the
    /// remainder (default: 0)
    pub already_satisfied: usize,

    /// Directory holding captured frames for the duration of a run
    pub scratch_dir: PathBuf,

    /// Directory holding one re-upload cache document per release
    pub cache_dir: PathBuf,

    /// Frame extraction settings
    pub capture: CaptureSettings,

    /// Lossless recompression worker pool settings
    pub optimization: OptimizationSettings,

    /// Size policy and retake settings
    pub validation: ValidationSettings,

    /// Upload retry, timeout and concurrency settings
    pub upload: UploadSettings,

    /// Ordered image hosts; the order is the failover order
    pub hosts: Vec<HostConfig>,

    /// Grace period between SIGTERM and SIGKILL when sweeping child processes
    /// (default: 2 seconds)
    pub kill_grace_period: Duration,

    /// Verbose diagnostics, including captured ffmpeg stderr on success
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        let base = std::env::temp_dir().join("release-screens");
        Self {
            screenshot_count: 4,
            already_satisfied: 0,
            scratch_dir: base.join("screens"),
            cache_dir: base.join("cache"),
            capture: CaptureSettings::default(),
            optimization: OptimizationSettings::default(),
            validation: ValidationSettings::default(),
            upload: UploadSettings::default(),
            hosts: Vec::new(),
            kill_grace_period: Duration::from_secs(2),
            debug: false,
        }
    }
}

impl Config {
    /// Load a configuration document from a JSON file.
    pub async fn load(path: &Path) -> Result<Self, ScreensError> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ScreensError> {
        if self.capture.max_concurrent_captures == 0 {
            return Err(ScreensError::ConfigurationError(
                "Capture concurrency must be greater than 0".to_string(),
            ));
        }

        if self.optimization.max_workers == 0 {
            return Err(ScreensError::ConfigurationError(
                "Optimization worker limit must be greater than 0".to_string(),
            ));
        }

        if self.upload.retry_attempts == 0 {
            return Err(ScreensError::ConfigurationError(
                "Upload retry attempts must be greater than 0".to_string(),
            ));
        }

        if self.upload.unit_timeout.is_zero() {
            return Err(ScreensError::ConfigurationError(
                "Upload timeout must be greater than 0".to_string(),
            ));
        }

        if self.upload.max_concurrent_uploads == 0 {
            return Err(ScreensError::ConfigurationError(
                "Upload concurrency must be greater than 0".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for host in &self.hosts {
            if host.name.trim().is_empty() {
                return Err(ScreensError::ConfigurationError(
                    "Image host name must not be empty".to_string(),
                ));
            }
            if !seen.insert(host.name.as_str()) {
                return Err(ScreensError::ConfigurationError(format!(
                    "Image host '{}' is configured twice",
                    host.name
                )));
            }
            if crate::validate_url(&host.endpoint).is_err() {
                return Err(ScreensError::ConfigurationError(format!(
                    "Image host '{}' has an invalid endpoint: {}",
                    host.name, host.endpoint
                )));
            }
            if let (Some(min), Some(max)) = (host.min_image_size, host.max_image_size) {
                if min > max {
                    return Err(ScreensError::ConfigurationError(format!(
                        "Image host '{}' has min_image_size above max_image_size",
                        host.name
                    )));
                }
            }
        }

        Ok(())
    }

    /// Per-host byte-size policy, keyed by host name.
    pub fn policy_table(&self) -> PolicyTable {
        let mut table = PolicyTable::new(self.validation.min_valid_size);
        for host in &self.hosts {
            table.insert(
                host.name.clone(),
                SizePolicy {
                    min_bytes: host.min_image_size,
                    max_bytes: host.max_image_size,
                },
            );
        }
        table
    }

    pub fn host(&self, name: &str) -> Option<&HostConfig> {
        self.hosts.iter().find(|h| h.name == name)
    }

    pub fn host_names(&self) -> Vec<String> {
        self.hosts.iter().map(|h| h.name.clone()).collect()
    }
}

/// How the frame extractor seeks inside the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum KeyframeSeek {
    /// Nearest-keyframe seek for disc sources whose codec is expensive to seek
    /// precisely, exact seek otherwise
    Auto,
    /// Always snap to the nearest keyframe
    Always,
    /// Always decode up to the exact offset
    Never,
}

/// Frame extraction settings
///
/// # Examples
///
/// ```rust
/// use release_screens::CaptureSettings;
///
/// let settings = CaptureSettings {
///     overlay: true,
///     tonemap: false,
///     ..Default::default()
/// };
/// assert_eq!(settings.tonemap_algorithm, "hable");
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// ffmpeg executable (default: `ffmpeg` on PATH)
    pub ffmpeg_path: String,

    /// ffprobe executable used for frame metadata (default: `ffprobe` on PATH)
    pub ffprobe_path: String,

    /// Ceiling on concurrently running extraction processes (default: CPU count)
    pub max_concurrent_captures: usize,

    /// Seek strategy (default: Auto)
    pub keyframe_seek: KeyframeSeek,

    /// Codecs treated as expensive to seek on disc sources
    pub slow_seek_codecs: Vec<String>,

    /// Tone-map HDR titles to SDR (default: true)
    ///
    /// Only applies when the source is flagged HDR.
    pub tonemap: bool,

    /// Tone-mapping operator passed to ffmpeg's `tonemap` filter (default: hable)
    pub tonemap_algorithm: String,

    /// Desaturation strength for the tone-mapping filter (default: 0.0)
    pub tonemap_desat: f64,

    /// Burn frame number, frame type and HDR status into each frame (default: false)
    pub overlay: bool,

    /// Optional font file for the overlay text
    pub overlay_font: Option<PathBuf>,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
            max_concurrent_captures: num_cpus::get(),
            keyframe_seek: KeyframeSeek::Auto,
            slow_seek_codecs: vec![
                "vc1".to_string(),
                "vc-1".to_string(),
                "mpeg2video".to_string(),
            ],
            tonemap: true,
            tonemap_algorithm: "hable".to_string(),
            tonemap_desat: 0.0,
            overlay: false,
            overlay_font: None,
        }
    }
}

/// Lossless recompression worker pool settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OptimizationSettings {
    /// Recompress captured frames before validation (default: true)
    pub enabled: bool,

    /// Upper bound on worker processes per batch (default: CPU count)
    ///
    /// The pool runs `min(batch size, max_workers)` processes.
    pub max_workers: usize,

    /// Worker command line. When empty the current executable is started with
    /// the `optimize-worker` argument.
    pub worker_command: Vec<String>,
}

impl Default for OptimizationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_workers: num_cpus::get(),
            worker_command: Vec::new(),
        }
    }
}

/// Size policy and retake settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ValidationSettings {
    /// Absolute floor in bytes, independent of host (default: 10000)
    ///
    /// Frames at or below this size are degenerate (all black, corrupt).
    pub min_valid_size: u64,

    /// Offset perturbations in seconds applied on successive retakes
    /// (default: +5, +10, -10, +100, -100)
    pub retake_offsets: Vec<f64>,

    /// Maximum retakes per screenshot before it is marked failed (default: 5)
    pub max_retakes: usize,
}

impl Default for ValidationSettings {
    fn default() -> Self {
        Self {
            min_valid_size: 10_000,
            retake_offsets: vec![5.0, 10.0, -10.0, 100.0, -100.0],
            max_retakes: 5,
        }
    }
}

/// Upload retry, timeout and concurrency settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UploadSettings {
    /// Attempts per image per host (default: 3)
    pub retry_attempts: usize,

    /// Linear backoff base; attempt `n` waits `n * retry_delay` (default: 1 second)
    pub retry_delay: Duration,

    /// Hard timeout for one upload attempt (default: 60 seconds)
    pub unit_timeout: Duration,

    /// Ceiling on concurrent uploads for hosts without their own limit (default: 10)
    pub max_concurrent_uploads: usize,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry_delay: Duration::from_secs(1),
            unit_timeout: Duration::from_secs(60),
            max_concurrent_uploads: 10,
        }
    }
}

/// One image hosting backend reachable through a multipart HTTP upload.
///
/// The request and response layout is described here rather than hard-coded,
/// so any host with a form upload endpoint and a JSON response can be used.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HostConfig {
    pub name: String,

    /// Upload endpoint
    pub endpoint: String,

    #[serde(default)]
    pub api_key: Option<String>,

    /// Form field carrying the API key (default: `key`)
    #[serde(default = "default_api_key_field")]
    pub api_key_field: String,

    /// Send the API key as this header instead of a form field
    #[serde(default)]
    pub api_key_header: Option<String>,

    /// Form field carrying the image (default: `image`)
    #[serde(default = "default_file_field")]
    pub file_field: String,

    /// Extra static form fields
    #[serde(default)]
    pub form_fields: BTreeMap<String, String>,

    /// JSON pointers locating the URLs in the response body
    #[serde(default)]
    pub response: ResponseMapping,

    /// Concurrent uploads allowed; rate-limited hosts use 1
    #[serde(default)]
    pub max_concurrency: Option<usize>,

    #[serde(default)]
    pub min_image_size: Option<u64>,

    #[serde(default)]
    pub max_image_size: Option<u64>,

    /// Response body fragments that mean the image is already hosted
    #[serde(default)]
    pub duplicate_markers: Vec<String>,

    /// Domains serving this host's images, used to attribute cached records
    #[serde(default)]
    pub domains: Vec<String>,
}

fn default_api_key_field() -> String {
    "key".to_string()
}

fn default_file_field() -> String {
    "image".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ResponseMapping {
    pub img_url: String,
    pub raw_url: String,
    pub web_url: String,
}

impl Default for ResponseMapping {
    fn default() -> Self {
        Self {
            img_url: "/data/thumb/url".to_string(),
            raw_url: "/data/image/url".to_string(),
            web_url: "/data/url_viewer".to_string(),
        }
    }
}

/// Container the title was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum SourceKind {
    File,
    Bluray,
    Dvd,
}

impl SourceKind {
    pub fn is_disc(&self) -> bool {
        matches!(self, SourceKind::Bluray | SourceKind::Dvd)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum ContentCategory {
    Movie,
    Tv,
}

/// Title description supplied by the metadata layer.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceDescriptor {
    /// File (or disc playlist / VOB) the frames are extracted from
    pub path: PathBuf,
    pub duration_secs: f64,
    pub frame_rate: f64,
    pub kind: SourceKind,
    pub category: ContentCategory,
    pub hdr: bool,
    /// Video codec name as reported by the metadata layer, e.g. `hevc`, `vc1`
    pub codec: Option<String>,
    pub width: u32,
    pub height: u32,
}

impl SourceDescriptor {
    pub fn new(path: impl Into<PathBuf>, duration_secs: f64, frame_rate: f64) -> Self {
        Self {
            path: path.into(),
            duration_secs,
            frame_rate,
            kind: SourceKind::File,
            category: ContentCategory::Movie,
            hdr: false,
            codec: None,
            width: 1920,
            height: 1080,
        }
    }
}

/// A release plus destination site; the key for already-uploaded images.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct TrackerScope {
    /// Identifies the release; one cache document exists per release key
    pub release_key: String,
    pub tracker: String,
    /// External release page the images are tied to (cover art and the like)
    pub release_url: Option<String>,
}

impl TrackerScope {
    pub fn new(release_key: impl Into<String>, tracker: impl Into<String>) -> Self {
        Self {
            release_key: release_key.into(),
            tracker: tracker.into(),
            release_url: None,
        }
    }

    /// Key of this scope inside the release's cache document.
    pub fn cache_key(&self) -> String {
        match &self.release_url {
            Some(url) => format!("{}@{}", self.tracker, url),
            None => self.tracker.clone(),
        }
    }
}

/// Everything a single run needs, made explicit.
///
/// Built by the caller from [`Config`] and the tracker it is preparing; the
/// components read only the fields they need.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub requested_count: usize,
    pub already_satisfied: usize,
    /// 0 on the first pass; each later retake wave shifts the capture window
    pub retake_ordinal: u32,
    pub policy: PolicyTable,
    pub tonemap: bool,
    pub overlay: bool,
    pub debug: bool,
    pub scratch_dir: PathBuf,
    pub scope: TrackerScope,
    /// Hosts the tracker accepts; `None` accepts every configured host
    pub approved_hosts: Option<Vec<String>>,
    /// Host chosen by the user; disables automatic failover
    pub explicit_host: Option<String>,
}

impl RunContext {
    pub fn from_config(config: &Config, scope: TrackerScope) -> Self {
        Self {
            requested_count: config.screenshot_count,
            already_satisfied: config.already_satisfied,
            retake_ordinal: 0,
            policy: config.policy_table(),
            tonemap: config.capture.tonemap,
            overlay: config.capture.overlay,
            debug: config.debug,
            scratch_dir: config.scratch_dir.clone(),
            scope,
            approved_hosts: None,
            explicit_host: None,
        }
    }

    /// Screenshots still to produce after the cutoff count.
    pub fn images_needed(&self) -> usize {
        self.requested_count.saturating_sub(self.already_satisfied)
    }

    pub fn is_host_approved(&self, host: &str) -> bool {
        match &self.approved_hosts {
            Some(approved) => approved.iter().any(|h| h == host),
            None => true,
        }
    }
}
