//! Key frame extraction
//!
//! One key frame per detected scene, decoded at the scene's start offset (the
//! cut itself, not the scene midpoint). A video without cuts contributes a
//! single frame at offset 0. Frames are returned as JPEG bytes, which is what
//! the embedding model accepts.

use image::ImageFormat;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Command;
use svt_scene::{detect_scenes, AdaptiveConfig, Scene, SceneDetectionError};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum KeyframeError {
    #[error("FFmpeg execution failed: {0}")]
    FfmpegError(String),

    #[error("Scene detection failed: {0}")]
    SceneDetection(#[from] SceneDetectionError),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("No frame could be decoded from {0}")]
    NoFrames(String),
}

pub type KeyframeResult<T> = Result<T, KeyframeError>;

/// A decoded key frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyFrame {
    /// Scene order, from 0
    pub index: usize,
    /// Offset in seconds
    pub timestamp: f64,
    pub width: u32,
    pub height: u32,
    #[serde(skip)]
    pub jpeg: Vec<u8>,
}

impl KeyFrame {
    /// Wrap JPEG bytes after checking that they decode
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a decodable JPEG image.
    pub fn from_jpeg(index: usize, timestamp: f64, jpeg: Vec<u8>) -> KeyframeResult<Self> {
        let image = image::load_from_memory_with_format(&jpeg, ImageFormat::Jpeg)
            .map_err(|e| KeyframeError::InvalidFrame(e.to_string()))?;
        Ok(Self {
            index,
            timestamp,
            width: image.width(),
            height: image.height(),
            jpeg,
        })
    }
}

/// Produces the ordered key frames of a video file
///
/// Blocking; callers run it off the async executor.
pub trait KeyframeSource: Send + Sync {
    fn keyframes(&self, video_path: &Path) -> KeyframeResult<Vec<KeyFrame>>;
}

/// Offsets to decode: each scene's start, or 0 when there are no scenes
#[must_use]
pub fn start_offsets(scenes: &[Scene]) -> Vec<f64> {
    if scenes.is_empty() {
        return vec![0.0];
    }
    scenes.iter().map(|scene| scene.start_time).collect()
}

/// Decode exactly the frame at `timestamp` as JPEG bytes
///
/// # Errors
///
/// Returns an error if `FFmpeg` fails or produces no frame.
pub fn decode_frame_at(video_path: &Path, timestamp: f64) -> KeyframeResult<Vec<u8>> {
    let output = Command::new("ffmpeg")
        .arg("-hide_banner")
        .arg("-loglevel")
        .arg("error")
        .arg("-ss")
        .arg(format!("{timestamp:.6}"))
        .arg("-i")
        .arg(video_path)
        .args([
            "-frames:v", "1", "-an", "-f", "image2pipe", "-vcodec", "mjpeg", "-q:v", "2", "-",
        ])
        .output()
        .map_err(|e| KeyframeError::FfmpegError(format!("Failed to execute ffmpeg: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(KeyframeError::FfmpegError(format!(
            "FFmpeg failed at {timestamp:.3}s: {}",
            stderr.trim()
        )));
    }
    if output.stdout.is_empty() {
        return Err(KeyframeError::InvalidFrame(format!(
            "no frame at {timestamp:.3}s"
        )));
    }
    Ok(output.stdout)
}

/// Scene detection followed by exact-offset decoding, both through `FFmpeg`
#[derive(Debug, Clone, Default)]
pub struct FfmpegKeyframes {
    pub scene_config: AdaptiveConfig,
}

impl FfmpegKeyframes {
    #[must_use]
    pub fn new(scene_config: AdaptiveConfig) -> Self {
        Self { scene_config }
    }
}

impl KeyframeSource for FfmpegKeyframes {
    fn keyframes(&self, video_path: &Path) -> KeyframeResult<Vec<KeyFrame>> {
        let scenes = detect_scenes(video_path, &self.scene_config)?;
        let offsets = start_offsets(&scenes);
        debug!("Decoding {} key frames", offsets.len());

        // A frame that cannot be decoded is skipped, as long as one survives
        let mut frames = Vec::with_capacity(offsets.len());
        for timestamp in offsets {
            let decoded = decode_frame_at(video_path, timestamp)
                .and_then(|jpeg| KeyFrame::from_jpeg(frames.len(), timestamp, jpeg));
            match decoded {
                Ok(frame) => frames.push(frame),
                Err(e) => warn!("Skipping key frame at {:.3}s: {}", timestamp, e),
            }
        }

        if frames.is_empty() {
            return Err(KeyframeError::NoFrames(video_path.display().to_string()));
        }
        info!(
            "Extracted {} key frames from {} scenes",
            frames.len(),
            scenes.len()
        );
        Ok(frames)
    }
}
