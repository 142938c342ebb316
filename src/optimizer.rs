//! Lossless PNG recompression and the line protocol spoken by optimization workers.
//!
//! A worker process reads one image path per line on stdin and answers with one
//! line on stdout: the path itself on success, or [`ERROR_MARKER`] followed by
//! the path and a message on failure.

use crate::ScreensError;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::ImageEncoder;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Prefix of a worker reply line that reports a failure.
pub const ERROR_MARKER: &str = "optimize-error:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptimizeStats {
    pub before: u64,
    pub after: u64,
}

impl OptimizeStats {
    pub fn saved(&self) -> u64 {
        self.before.saturating_sub(self.after)
    }
}

/// Re-encodes the PNG at `path` with maximum compression, in place.
///
/// The pixels are unchanged. The file is only replaced when the re-encoded
/// image is smaller, and the replacement goes through a sibling temp file so a
/// crash never leaves a truncated image behind.
pub fn optimize_png(path: &Path) -> Result<OptimizeStats, ScreensError> {
    let before = std::fs::metadata(path)?.len();
    let img = image::open(path)?;

    let mut encoded = Vec::with_capacity(before as usize);
    let encoder =
        PngEncoder::new_with_quality(&mut encoded, CompressionType::Best, FilterType::Adaptive);
    encoder.write_image(img.as_bytes(), img.width(), img.height(), img.color())?;

    let after = encoded.len() as u64;
    if after >= before {
        debug!("{} already optimal ({} bytes)", path.display(), before);
        return Ok(OptimizeStats {
            before,
            after: before,
        });
    }

    let temp = temp_sibling(path);
    std::fs::write(&temp, &encoded)?;
    if let Err(e) = std::fs::rename(&temp, path) {
        let _ = std::fs::remove_file(&temp);
        return Err(e.into());
    }

    debug!("Optimized {}: {} -> {} bytes", path.display(), before, after);
    Ok(OptimizeStats { before, after })
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}.tmp", name, std::process::id()))
}

/// Serves optimization requests until `input` reaches EOF.
pub fn run_worker<R: BufRead, W: Write>(input: R, mut output: W) -> std::io::Result<()> {
    for line in input.lines() {
        let line = line?;
        let path = line.trim();
        if path.is_empty() {
            continue;
        }

        match optimize_png(Path::new(path)) {
            Ok(_) => writeln!(output, "{path}")?,
            Err(e) => writeln!(output, "{ERROR_MARKER} {path}: {e}")?,
        }
        output.flush()?;
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerReply {
    Optimized(PathBuf),
    Failed(String),
}

impl WorkerReply {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        match line.strip_prefix(ERROR_MARKER) {
            Some(message) => WorkerReply::Failed(message.trim().to_string()),
            None if line.is_empty() => WorkerReply::Failed("empty reply".to_string()),
            None => WorkerReply::Optimized(PathBuf::from(line)),
        }
    }
}
