//! Frame metadata lookup through ffprobe, used for on-frame overlays.

use crate::{FrameMeta, ScreensError};
use serde::Deserialize;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    frames: Vec<ProbeFrame>,
}

#[derive(Debug, Deserialize)]
struct ProbeFrame {
    pict_type: Option<String>,
    pts_time: Option<String>,
    best_effort_timestamp_time: Option<String>,
}

/// Reads type and presentation time of the first video frame at or after `offset`.
pub async fn probe_frame_meta(
    ffprobe: &str,
    source: &Path,
    offset: f64,
    frame_rate: f64,
) -> Result<FrameMeta, ScreensError> {
    let output = Command::new(ffprobe)
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-read_intervals",
            &format!("{offset:.3}%+#1"),
            "-show_entries",
            "frame=pict_type,pts_time,best_effort_timestamp_time",
            "-of",
            "json",
        ])
        .arg(source)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ScreensError::ProbeFailed(format!(
            "ffprobe failed: {}",
            stderr.trim()
        )));
    }

    parse_frame_meta(&output.stdout, offset, frame_rate)
}

pub fn parse_frame_meta(
    stdout: &[u8],
    fallback_time: f64,
    frame_rate: f64,
) -> Result<FrameMeta, ScreensError> {
    let parsed: ProbeOutput = serde_json::from_slice(stdout)?;
    let frame = parsed
        .frames
        .into_iter()
        .next()
        .ok_or_else(|| ScreensError::ProbeFailed("ffprobe returned no frames".to_string()))?;

    let pts_time = frame
        .pts_time
        .or(frame.best_effort_timestamp_time)
        .and_then(|t| t.parse::<f64>().ok())
        .unwrap_or(fallback_time);

    let frame_number = if frame_rate > 0.0 {
        (pts_time * frame_rate).round().max(0.0) as u64
    } else {
        0
    };

    let meta = FrameMeta {
        frame_type: frame.pict_type.unwrap_or_else(|| "?".to_string()),
        frame_number,
        pts_time,
    };
    debug!("Probed frame at {:.3}s: {:?}", fallback_time, meta);
    Ok(meta)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_frame_meta() {
        let json = br#"{"frames": [{"pict_type": "I", "pts_time": "120.120000"}]}"#;
        let meta = parse_frame_meta(json, 120.0, 23.976).unwrap();
        assert_eq!(meta.frame_type, "I");
        assert_eq!(meta.frame_number, 2880);
        assert!((meta.pts_time - 120.12).abs() < 1e-9);
    }

    #[test]
    fn test_parse_falls_back_to_best_effort_time() {
        let json = br#"{"frames": [{"pict_type": "B", "best_effort_timestamp_time": "10.0"}]}"#;
        let meta = parse_frame_meta(json, 9.0, 25.0).unwrap();
        assert_eq!(meta.frame_number, 250);
    }

    #[test]
    fn test_parse_without_frames_fails() {
        let err = parse_frame_meta(br#"{"frames": []}"#, 1.0, 24.0).unwrap_err();
        assert!(matches!(err, ScreensError::ProbeFailed(_)));
        assert!(!err.to_string().contains("screenshot"));
        assert!(parse_frame_meta(b"not json", 1.0, 24.0).is_err());
    }
}
