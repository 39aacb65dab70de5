//! Key frame extraction against real `FFmpeg`
//!
//! Requires `ffmpeg` on PATH.
//!
//! Run tests with: `cargo test --package svt-keyframe --test ffmpeg_integration_test -- --ignored --nocapture`

use std::path::Path;
use std::process::Command;
use svt_keyframe::{FfmpegKeyframes, KeyframeSource};

fn ffmpeg_available() -> bool {
    Command::new("ffmpeg").arg("-version").output().is_ok()
}

/// Render solid-colour segments of two seconds each into an mp4
fn render_segments(path: &Path, colors: &[&str]) {
    let mut cmd = Command::new("ffmpeg");
    cmd.args(["-hide_banner", "-loglevel", "error", "-y"]);
    for color in colors {
        cmd.args(["-f", "lavfi", "-i"])
            .arg(format!("color=c={color}:s=160x120:d=2:r=30"));
    }
    let inputs: String = (0..colors.len()).map(|i| format!("[{i}:v]")).collect();
    cmd.arg("-filter_complex")
        .arg(format!("{inputs}concat=n={}:v=1:a=0[v]", colors.len()))
        .args(["-map", "[v]", "-pix_fmt", "yuv420p"])
        .arg(path);
    let status = cmd.status().expect("Failed to run ffmpeg");
    assert!(status.success(), "ffmpeg could not render the test video");
}

#[test]
#[ignore] // Requires ffmpeg
fn test_one_frame_per_scene() {
    if !ffmpeg_available() {
        eprintln!("ffmpeg not available, skipping test_one_frame_per_scene");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let video = dir.path().join("cuts.mp4");
    render_segments(&video, &["red", "blue", "green", "white"]);

    let frames = FfmpegKeyframes::default().keyframes(&video).unwrap();
    assert_eq!(frames.len(), 4);
    assert!((frames[1].timestamp - 2.0).abs() < 0.1);
    assert!(frames.iter().all(|f| f.width == 160 && f.height == 120));
}

#[test]
#[ignore] // Requires ffmpeg
fn test_static_video_yields_single_frame() {
    if !ffmpeg_available() {
        eprintln!("ffmpeg not available, skipping test_static_video_yields_single_frame");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let video = dir.path().join("static.mp4");
    render_segments(&video, &["red"]);

    let frames = FfmpegKeyframes::default().keyframes(&video).unwrap();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].timestamp, 0.0);
}
