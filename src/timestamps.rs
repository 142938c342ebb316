//! Deterministic selection of capture offsets across a title.

use crate::{ContentCategory, SourceKind};

// Window bounds in percent of total frames.
const WINDOW_START: u64 = 5;
const TV_RETAKE_WINDOW_START: u64 = 10;
const WINDOW_END: u64 = 90;
const MAX_WINDOW_START: u64 = 40;

#[derive(Debug, Clone)]
pub struct TimestampRequest {
    pub duration_secs: f64,
    pub frame_rate: f64,
    pub count: usize,
    /// 0 on the first pass, incremented on every retake wave
    pub retake_ordinal: u32,
    pub source_kind: SourceKind,
    pub category: ContentCategory,
}

impl TimestampRequest {
    pub fn new(duration_secs: f64, frame_rate: f64, count: usize) -> Self {
        Self {
            duration_secs,
            frame_rate,
            count,
            retake_ordinal: 0,
            source_kind: SourceKind::File,
            category: ContentCategory::Movie,
        }
    }

    /// Disc sources capture one extra frame so the smallest can be discarded later.
    pub fn capture_count(&self) -> usize {
        if self.count > 0 && self.source_kind.is_disc() {
            self.count + 1
        } else {
            self.count
        }
    }
}

/// Picks ascending capture offsets (seconds) inside the usable window of a title.
///
/// The window spans 5%..90% of the title's frames (10%..90% for television
/// retakes); every retake wave moves its start forward by 1% of the frames,
/// never past 40%. The window is split into equal intervals and the start of
/// each interval becomes an offset. Identical inputs always give identical
/// output.
#[must_use]
pub fn select_timestamps(request: &TimestampRequest) -> Vec<f64> {
    let count = request.capture_count();
    if count == 0
        || !request.duration_secs.is_finite()
        || !request.frame_rate.is_finite()
        || request.duration_secs <= 0.0
        || request.frame_rate <= 0.0
    {
        return Vec::new();
    }

    let total_frames = (request.duration_secs * request.frame_rate).floor() as u64;
    let (start_frame, end_frame) = usable_window(request, total_frames);
    let start_frame = start_frame as f64;
    let interval = (end_frame as f64 - start_frame) / count as f64;

    (0..count)
        .map(|i| {
            let position = start_frame + i as f64 * interval;
            // Whole frames when the interval is at least one frame wide; the
            // fractional position otherwise, so short titles stay monotonic.
            let frame = if interval >= 1.0 { position.floor() } else { position };
            frame / request.frame_rate
        })
        .collect()
}

fn usable_window(request: &TimestampRequest, total_frames: u64) -> (u64, u64) {
    let base = if request.retake_ordinal > 0 && request.category == ContentCategory::Tv {
        TV_RETAKE_WINDOW_START
    } else {
        WINDOW_START
    };

    // Each retake wave moves the start forward by 1% of the frames.
    let start_percent = (base + u64::from(request.retake_ordinal)).min(MAX_WINDOW_START);
    let start = total_frames * start_percent / 100;
    let end = total_frames * WINDOW_END / 100;

    (start, end.max(start))
}
