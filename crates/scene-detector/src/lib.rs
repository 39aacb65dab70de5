//! Adaptive shot-boundary detection
//!
//! `FFmpeg` computes a per-frame scene-change score (the `scene` variable of the
//! `select` filter, 0.0 to 1.0) and prints it through the `metadata` filter.
//! The cut decision is made here, with an adaptive rule: a frame is a cut when
//! its score stands out against the frames around it by a configurable ratio,
//! clears an absolute floor, and is far enough from the previous cut.
//!
//! A video without cuts yields no scenes; otherwise the result has one scene
//! per cut plus the opening scene.
//!
//! # Example
//! ```no_run
//! use svt_scene::{detect_scenes, AdaptiveConfig};
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let scenes = detect_scenes(Path::new("video.mp4"), &AdaptiveConfig::default())?;
//! for scene in &scenes {
//!     println!("Scene {} starts at {:.2}s", scene.index, scene.start_time);
//! }
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Command;
use thiserror::Error;
use tracing::{debug, info};

/// Errors specific to scene detection
#[derive(Error, Debug)]
pub enum SceneDetectionError {
    #[error("FFmpeg execution failed: {0}")]
    FfmpegError(String),

    #[error("Video file not found: {0}")]
    FileNotFound(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Configuration for adaptive cut detection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveConfig {
    /// Minimum ratio between a frame's score and the mean score of its
    /// neighbours for the frame to be a cut
    pub adaptive_threshold: f64,

    /// Number of frames on each side of the candidate used for the mean
    pub window_width: usize,

    /// Absolute floor on the candidate's score
    pub min_score: f64,

    /// Minimum number of frames between two cuts
    pub min_scene_len: u64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            adaptive_threshold: 3.0,
            window_width: 2,
            min_score: 0.06,
            min_scene_len: 15,
        }
    }
}

/// Scene-change score of one decoded frame
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameScore {
    pub frame: u64,
    /// Presentation time in seconds
    pub timestamp: f64,
    pub score: f64,
}

/// A detected scene
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    /// Position in the scene list, from 0
    pub index: usize,
    pub start_frame: u64,
    /// Start time in seconds; the cut's offset for every scene but the first
    pub start_time: f64,
    /// Exclusive end frame
    pub end_frame: u64,
    pub end_time: f64,
}

/// Detect scenes in a video file
///
/// # Errors
///
/// Returns an error if:
/// - The video file does not exist
/// - `FFmpeg` cannot be executed or fails to decode the file
pub fn detect_scenes(
    video_path: &Path,
    config: &AdaptiveConfig,
) -> Result<Vec<Scene>, SceneDetectionError> {
    if !video_path.exists() {
        return Err(SceneDetectionError::FileNotFound(
            video_path.display().to_string(),
        ));
    }

    info!(
        "Running scene detection on {} (adaptive threshold {}, min scene {} frames)",
        video_path.display(),
        config.adaptive_threshold,
        config.min_scene_len
    );

    // Every frame passes the select filter; metadata=print writes its score to stdout
    let output = Command::new("ffmpeg")
        .arg("-hide_banner")
        .arg("-nostats")
        .arg("-i")
        .arg(video_path)
        .arg("-an")
        .arg("-vf")
        .arg("select='gte(scene,0)',metadata=print:file=-")
        .arg("-f")
        .arg("null")
        .arg("-")
        .output()
        .map_err(|e| SceneDetectionError::FfmpegError(format!("Failed to execute ffmpeg: {e}")))?;

    let stderr = String::from_utf8_lossy(&output.stderr);
    if !output.status.success() {
        return Err(SceneDetectionError::FfmpegError(
            stderr.lines().last().unwrap_or("unknown error").to_string(),
        ));
    }

    let duration = stderr.lines().find_map(parse_duration_line);
    let scores = parse_frame_scores(&String::from_utf8_lossy(&output.stdout));
    debug!(
        "Scored {} frames (duration {:?})",
        scores.len(),
        duration
    );

    let cuts = find_cuts(&scores, config);
    let scenes = scenes_from_cuts(&scores, &cuts, duration);
    info!(
        "Detected {} cuts ({} scenes)",
        cuts.len(),
        scenes.len()
    );
    Ok(scenes)
}

/// Parse `metadata=print` output into per-frame scores
///
/// Format:
/// ```text
/// frame:12   pts:12288   pts_time:0.4
/// lavfi.scene_score=0.031250
/// ```
#[must_use]
pub fn parse_frame_scores(output: &str) -> Vec<FrameScore> {
    let mut scores = Vec::new();
    let mut current: Option<(u64, f64)> = None;

    for line in output.lines() {
        let line = line.trim();
        if line.starts_with("frame:") {
            current = parse_frame_line(line);
        } else if let Some(value) = line.strip_prefix("lavfi.scene_score=") {
            if let (Some((frame, timestamp)), Ok(score)) = (current.take(), value.parse::<f64>()) {
                scores.push(FrameScore {
                    frame,
                    timestamp,
                    score,
                });
            }
        }
    }
    scores
}

fn parse_frame_line(line: &str) -> Option<(u64, f64)> {
    let mut frame = None;
    let mut timestamp = None;
    for field in line.split_whitespace() {
        if let Some(v) = field.strip_prefix("frame:") {
            frame = v.parse().ok();
        } else if let Some(v) = field.strip_prefix("pts_time:") {
            timestamp = v.parse().ok();
        }
    }
    Some((frame?, timestamp?))
}

/// Indices into `scores` of the frames that start a new scene
#[must_use]
pub fn find_cuts(scores: &[FrameScore], config: &AdaptiveConfig) -> Vec<usize> {
    let w = config.window_width.max(1);
    if scores.len() < 2 * w + 1 {
        return Vec::new();
    }

    let mut cuts = Vec::new();
    let mut last_cut_frame = scores[0].frame;

    for target in w..scores.len() - w {
        let candidate = scores[target].score;
        let neighbours = scores[target - w..target]
            .iter()
            .chain(&scores[target + 1..=target + w]);
        #[allow(clippy::cast_precision_loss)]
        let mean = neighbours.map(|s| s.score).sum::<f64>() / (2 * w) as f64;

        let ratio = if mean > 1e-5 {
            candidate / mean
        } else if candidate >= config.min_score {
            f64::INFINITY
        } else {
            0.0
        };

        if ratio >= config.adaptive_threshold
            && candidate >= config.min_score
            && scores[target].frame - last_cut_frame >= config.min_scene_len
        {
            debug!(
                "Cut at frame {} ({:.3}s, score {:.3}, ratio {:.2})",
                scores[target].frame, scores[target].timestamp, candidate, ratio
            );
            cuts.push(target);
            last_cut_frame = scores[target].frame;
        }
    }
    cuts
}

/// Build the scene list; empty when there are no cuts
#[must_use]
pub fn scenes_from_cuts(scores: &[FrameScore], cuts: &[usize], duration: Option<f64>) -> Vec<Scene> {
    if cuts.is_empty() || scores.is_empty() {
        return Vec::new();
    }

    let last = scores[scores.len() - 1];
    let end_frame = last.frame + 1;
    let end_time = duration.unwrap_or(last.timestamp);

    let starts: Vec<(u64, f64)> = std::iter::once((scores[0].frame, scores[0].timestamp))
        .chain(cuts.iter().map(|&i| (scores[i].frame, scores[i].timestamp)))
        .collect();

    starts
        .iter()
        .enumerate()
        .map(|(index, &(start_frame, start_time))| {
            let (end_frame, end_time) = starts
                .get(index + 1)
                .copied()
                .unwrap_or((end_frame, end_time));
            Scene {
                index,
                start_frame,
                start_time,
                end_frame,
                end_time,
            }
        })
        .collect()
}

/// Seconds from an ffmpeg banner line like `Duration: 00:00:09.99, start: ...`
fn parse_duration_line(line: &str) -> Option<f64> {
    let (_, rest) = line.split_once("Duration: ")?;
    let (clock, _) = rest.split_once(',')?;

    let mut fields = clock.split(':');
    let (h, m, s) = (fields.next()?, fields.next()?, fields.next()?);
    if fields.next().is_some() {
        return None;
    }
    let (h, m, s): (f64, f64, f64) = (h.parse().ok()?, m.parse().ok()?, s.parse().ok()?);
    Some((h * 60.0 + m) * 60.0 + s)
}
