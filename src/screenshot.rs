//! Screenshot and hosted-image records shared by every stage of the pipeline.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Lifecycle of a candidate frame.
///
/// `Pending -> Captured -> Optimized -> {Accepted, Rejected}`; a rejected frame
/// goes back to `Pending` for a retake until the attempt budget runs out, then
/// it becomes `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScreenshotStatus {
    Pending,
    Captured,
    Optimized,
    Accepted,
    Rejected,
    Failed,
}

/// Frame details burned into the image when overlays are enabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameMeta {
    pub frame_type: String,
    pub frame_number: u64,
    pub pts_time: f64,
}

#[derive(Debug, Clone)]
pub struct Screenshot {
    /// Position in the requested sequence; the stable ordering key.
    pub index: usize,
    pub source_offset_seconds: f64,
    /// Offset picked by the timestamp selector, before any retake perturbation.
    pub original_offset_seconds: f64,
    pub file_path: Option<PathBuf>,
    pub byte_size: Option<u64>,
    pub frame_meta: Option<FrameMeta>,
    pub status: ScreenshotStatus,
    /// Number of retakes performed so far.
    pub attempts: usize,
}

impl Screenshot {
    pub fn new(index: usize, offset: f64) -> Self {
        Self {
            index,
            source_offset_seconds: offset,
            original_offset_seconds: offset,
            file_path: None,
            byte_size: None,
            frame_meta: None,
            status: ScreenshotStatus::Pending,
            attempts: 0,
        }
    }

    pub fn mark_captured(&mut self, path: PathBuf, byte_size: u64) {
        self.file_path = Some(path);
        self.byte_size = Some(byte_size);
        self.status = ScreenshotStatus::Captured;
    }

    pub fn mark_optimized(&mut self, byte_size: u64) {
        self.byte_size = Some(byte_size);
        self.status = ScreenshotStatus::Optimized;
    }

    /// Sends a rejected frame back for a retake at `offset`, removing the stale file.
    pub fn reset_for_retake(&mut self, offset: f64) {
        if let Some(path) = self.file_path.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("Failed to remove rejected screenshot {}: {}", path.display(), e);
                }
            }
        }
        self.byte_size = None;
        self.frame_meta = None;
        self.source_offset_seconds = offset;
        self.attempts += 1;
        self.status = ScreenshotStatus::Pending;
    }

    pub fn is_accepted(&self) -> bool {
        self.status == ScreenshotStatus::Accepted
    }
}

/// One successfully hosted image.
///
/// `raw_url` is unique within a release and tracker scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedImageRecord {
    /// Thumbnail URL.
    pub img_url: String,
    /// Full-size URL.
    pub raw_url: String,
    /// Gallery or viewer page.
    pub web_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_name: Option<String>,
    #[serde(default)]
    pub source_screenshot_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_url: Option<String>,
}
