//! Frame extraction through an external tool, one child process per frame.
//!
//! Captures run concurrently under a semaphore; each result carries the index
//! of the screenshot it belongs to, and batches are handed back sorted by that
//! index whatever order the processes finish in.

use crate::{
    probe_frame_meta, CaptureSettings, FrameMeta, KeyframeSeek, RunContext, Screenshot,
    SourceDescriptor, SourceKind,
};
use async_trait::async_trait;
use futures::future::join_all;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Lead-in for the fast pre-input seek of an exact capture, in seconds.
const SEEK_MARGIN: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekMode {
    /// Decode up to the exact offset.
    Exact,
    /// Snap to the nearest keyframe; cheap on codecs that seek slowly.
    Keyframe,
}

impl SeekMode {
    pub fn for_source(settings: &CaptureSettings, source: &SourceDescriptor) -> Self {
        match settings.keyframe_seek {
            KeyframeSeek::Always => SeekMode::Keyframe,
            KeyframeSeek::Never => SeekMode::Exact,
            KeyframeSeek::Auto => {
                let slow_codec = source.codec.as_deref().is_some_and(|codec| {
                    settings
                        .slow_seek_codecs
                        .iter()
                        .any(|slow| slow.eq_ignore_ascii_case(codec))
                });
                if source.kind.is_disc() && slow_codec {
                    SeekMode::Keyframe
                } else {
                    SeekMode::Exact
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TonemapSpec {
    pub algorithm: String,
    pub desat: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OverlaySpec {
    pub font_size: u32,
    pub font_file: Option<PathBuf>,
    /// HDR note printed under the frame details, e.g. "HDR tonemapped"
    pub hdr_label: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptureOptions {
    pub seek_mode: SeekMode,
    pub tonemap: Option<TonemapSpec>,
    pub overlay: Option<OverlaySpec>,
    /// Stretch anamorphic (DVD) frames to their display aspect ratio
    pub square_pixels: bool,
    pub frame_rate: f64,
}

impl CaptureOptions {
    pub fn new(frame_rate: f64) -> Self {
        Self {
            seek_mode: SeekMode::Exact,
            tonemap: None,
            overlay: None,
            square_pixels: false,
            frame_rate,
        }
    }

    pub fn for_run(settings: &CaptureSettings, ctx: &RunContext, source: &SourceDescriptor) -> Self {
        let tonemap = (source.hdr && ctx.tonemap).then(|| TonemapSpec {
            algorithm: settings.tonemap_algorithm.clone(),
            desat: settings.tonemap_desat,
        });

        let overlay = ctx.overlay.then(|| OverlaySpec {
            font_size: overlay_font_size(source.height),
            font_file: settings.overlay_font.clone(),
            hdr_label: match (source.hdr, tonemap.is_some()) {
                (true, true) => Some("HDR tonemapped".to_string()),
                (true, false) => Some("HDR".to_string()),
                _ => None,
            },
        });

        Self {
            seek_mode: SeekMode::for_source(settings, source),
            tonemap,
            overlay,
            square_pixels: source.kind == SourceKind::Dvd,
            frame_rate: source.frame_rate,
        }
    }
}

/// Overlay text height scaled from 32px at 1080 lines.
pub fn overlay_font_size(height: u32) -> u32 {
    ((f64::from(height) / 1080.0) * 32.0).round().max(12.0) as u32
}

#[derive(Debug, Clone)]
pub struct CaptureRequest {
    pub index: usize,
    pub source: PathBuf,
    pub offset_secs: f64,
    pub destination: PathBuf,
    pub options: CaptureOptions,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptureOutcome {
    pub index: usize,
    /// `None` when the tool failed or produced no file.
    pub path: Option<PathBuf>,
    pub frame_meta: Option<FrameMeta>,
}

impl CaptureOutcome {
    pub fn failed(index: usize) -> Self {
        Self {
            index,
            path: None,
            frame_meta: None,
        }
    }
}

/// Extracts a single frame. Failures are reported as an outcome without a path,
/// never as an error, so one bad frame cannot abort a batch.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FrameExtractor: Send + Sync {
    async fn extract(&self, request: CaptureRequest) -> CaptureOutcome;
}

pub struct FfmpegExtractor {
    ffmpeg_path: String,
    ffprobe_path: String,
    debug: bool,
}

impl FfmpegExtractor {
    pub fn new(settings: &CaptureSettings, debug: bool) -> Self {
        Self {
            ffmpeg_path: settings.ffmpeg_path.clone(),
            ffprobe_path: settings.ffprobe_path.clone(),
            debug,
        }
    }
}

#[async_trait]
impl FrameExtractor for FfmpegExtractor {
    async fn extract(&self, request: CaptureRequest) -> CaptureOutcome {
        if !request.source.exists() {
            error!(
                "Screenshot {}: source {} does not exist",
                request.index,
                request.source.display()
            );
            return CaptureOutcome::failed(request.index);
        }

        let frame_meta = if request.options.overlay.is_some() {
            match probe_frame_meta(
                &self.ffprobe_path,
                &request.source,
                request.offset_secs,
                request.options.frame_rate,
            )
            .await
            {
                Ok(meta) => Some(meta),
                Err(e) => {
                    warn!("Screenshot {}: frame probe failed: {}", request.index, e);
                    None
                }
            }
        } else {
            None
        };

        let args = build_ffmpeg_args(&request, frame_meta.as_ref());
        debug!("Screenshot {}: {} {}", request.index, self.ffmpeg_path, args.join(" "));

        let output = Command::new(&self.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await;

        let output = match output {
            Ok(output) => output,
            Err(e) => {
                error!(
                    "Screenshot {}: failed to run {}: {}",
                    request.index, self.ffmpeg_path, e
                );
                return CaptureOutcome::failed(request.index);
            }
        };

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            warn!(
                "Screenshot {} at {:.3}s failed ({}): {}",
                request.index,
                request.offset_secs,
                output.status,
                stderr.trim()
            );
            let _ = tokio::fs::remove_file(&request.destination).await;
            return CaptureOutcome::failed(request.index);
        }
        if self.debug && !stderr.trim().is_empty() {
            debug!("Screenshot {} stderr: {}", request.index, stderr.trim());
        }

        match tokio::fs::metadata(&request.destination).await {
            Ok(meta) if meta.len() > 0 => CaptureOutcome {
                index: request.index,
                path: Some(request.destination),
                frame_meta,
            },
            _ => {
                warn!(
                    "Screenshot {}: no output written to {}",
                    request.index,
                    request.destination.display()
                );
                CaptureOutcome::failed(request.index)
            }
        }
    }
}

/// ffmpeg command line for one capture.
pub fn build_ffmpeg_args(request: &CaptureRequest, meta: Option<&FrameMeta>) -> Vec<String> {
    let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "error".into()];
    let offset = request.offset_secs.max(0.0);

    match request.options.seek_mode {
        SeekMode::Keyframe => {
            args.extend(["-skip_frame".into(), "nokey".into()]);
            args.extend(["-ss".into(), format!("{offset:.3}")]);
            args.extend(["-i".into(), request.source.to_string_lossy().into_owned()]);
        }
        SeekMode::Exact => {
            let fast = (offset - SEEK_MARGIN).max(0.0);
            let accurate = offset - fast;
            if fast > 0.0 {
                args.extend(["-ss".into(), format!("{fast:.3}")]);
            }
            args.extend(["-i".into(), request.source.to_string_lossy().into_owned()]);
            if accurate > 0.0 {
                args.extend(["-ss".into(), format!("{accurate:.3}")]);
            }
        }
    }

    args.extend([
        "-map".into(),
        "0:v:0".into(),
        "-frames:v".into(),
        "1".into(),
        "-an".into(),
        "-sn".into(),
        "-dn".into(),
    ]);

    if let Some(chain) = build_filter_chain(&request.options, meta) {
        args.extend(["-vf".into(), chain]);
    }

    args.extend(["-y".into(), request.destination.to_string_lossy().into_owned()]);
    args
}

pub fn build_filter_chain(options: &CaptureOptions, meta: Option<&FrameMeta>) -> Option<String> {
    let mut filters: Vec<String> = Vec::new();

    if options.square_pixels {
        filters.push("scale=iw*sar:ih".to_string());
        filters.push("setsar=1".to_string());
    }

    if let Some(tonemap) = &options.tonemap {
        filters.push("zscale=transfer=linear:npl=100".to_string());
        filters.push("format=gbrpf32le".to_string());
        filters.push("zscale=primaries=bt709".to_string());
        filters.push(format!(
            "tonemap=tonemap={}:desat={}",
            tonemap.algorithm, tonemap.desat
        ));
        filters.push("zscale=transfer=bt709:matrix=bt709:range=tv".to_string());
        filters.push("format=yuv420p".to_string());
    }

    if let Some(overlay) = &options.overlay {
        let mut lines = Vec::new();
        match meta {
            Some(meta) => {
                lines.push(format!("Frame {}", meta.frame_number));
                lines.push(format!("Type {}", meta.frame_type));
            }
            None => lines.push("Frame unknown".to_string()),
        }
        if let Some(label) = &overlay.hdr_label {
            lines.push(label.clone());
        }

        let line_height = overlay.font_size + overlay.font_size / 4;
        for (row, line) in lines.iter().enumerate() {
            let mut drawtext = format!(
                "drawtext=text='{}':fontcolor=white:fontsize={}:box=1:boxcolor=black@0.5:boxborderw=4:x=10:y={}",
                escape_drawtext(line),
                overlay.font_size,
                10 + row as u32 * line_height
            );
            if let Some(font) = &overlay.font_file {
                drawtext.push_str(&format!(
                    ":fontfile='{}'",
                    escape_drawtext(&font.to_string_lossy())
                ));
            }
            filters.push(drawtext);
        }
    }

    if filters.is_empty() {
        None
    } else {
        Some(filters.join(","))
    }
}

fn escape_drawtext(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' | '\'' | ':' | '%' | ',' => {
                escaped.push('\\');
                escaped.push(c);
            }
            c => escaped.push(c),
        }
    }
    escaped
}

/// Runs extractions concurrently, bounded by the configured ceiling.
pub struct FrameCaptureEngine {
    extractor: Arc<dyn FrameExtractor>,
    max_concurrent: usize,
    cancel: CancellationToken,
}

impl FrameCaptureEngine {
    pub fn new(
        extractor: Arc<dyn FrameExtractor>,
        max_concurrent: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            extractor,
            max_concurrent: max_concurrent.max(1),
            cancel,
        }
    }

    pub async fn capture(&self, request: CaptureRequest) -> CaptureOutcome {
        let index = request.index;
        tokio::select! {
            _ = self.cancel.cancelled() => CaptureOutcome::failed(index),
            outcome = self.extractor.extract(request) => outcome,
        }
    }

    /// Captures every request and returns the outcomes sorted by index.
    pub async fn capture_batch(&self, requests: Vec<CaptureRequest>) -> Vec<CaptureOutcome> {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let indices: Vec<usize> = requests.iter().map(|r| r.index).collect();

        let tasks: Vec<_> = requests
            .into_iter()
            .map(|request| {
                let semaphore = semaphore.clone();
                let extractor = self.extractor.clone();
                let cancel = self.cancel.clone();

                tokio::spawn(async move {
                    let index = request.index;
                    let _permit = match semaphore.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => return CaptureOutcome::failed(index),
                    };
                    tokio::select! {
                        _ = cancel.cancelled() => CaptureOutcome::failed(index),
                        outcome = extractor.extract(request) => outcome,
                    }
                })
            })
            .collect();

        let mut outcomes: Vec<CaptureOutcome> = join_all(tasks)
            .await
            .into_iter()
            .zip(indices)
            .map(|(joined, index)| match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("Capture task for screenshot {} panicked: {}", index, e);
                    CaptureOutcome::failed(index)
                }
            })
            .collect();

        outcomes.sort_by_key(|o| o.index);
        outcomes
    }
}

/// Everything needed to turn a [`Screenshot`] into a [`CaptureRequest`].
#[derive(Debug, Clone)]
pub struct CapturePlan {
    pub source: PathBuf,
    pub options: CaptureOptions,
    pub scratch_dir: PathBuf,
    /// File name stem shared by every frame of the run
    pub stem: String,
}

impl CapturePlan {
    pub fn request(&self, shot: &Screenshot) -> CaptureRequest {
        CaptureRequest {
            index: shot.index,
            source: self.source.clone(),
            offset_secs: shot.source_offset_seconds,
            destination: screenshot_path(&self.scratch_dir, &self.stem, shot.index, shot.attempts),
            options: self.options.clone(),
        }
    }
}

/// Path of a screenshot inside the scratch directory; retakes get their own file.
pub fn screenshot_path(scratch_dir: &Path, stem: &str, index: usize, attempt: usize) -> PathBuf {
    if attempt == 0 {
        scratch_dir.join(format!("{stem}-{index:02}.png"))
    } else {
        scratch_dir.join(format!("{stem}-{index:02}-retake{attempt}.png"))
    }
}
