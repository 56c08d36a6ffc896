//! Configuration: parsing, defaults, and cross-field validation.
//!
//! Options mirror the recognized configuration list: paths, video, capture,
//! motion, streaming, and timing groups. Parsed once at startup from a TOML
//! file and never re-read; there is no hot-reload.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub base: PathBuf,
    pub db_file: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        PathsConfig {
            base: PathBuf::from("/var/lib/sentrywatch"),
            db_file: "events.sqlite3".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    pub bitrate_bps: u64,
    pub circular_buffer_max_chunks: usize,
    pub circular_buffer_max_bytes: u64,
    /// Logging hint only; the real size driver is `circular_buffer_max_chunks`.
    pub target_seconds: u32,
}

impl Default for VideoConfig {
    fn default() -> Self {
        VideoConfig {
            width: 1920,
            height: 1080,
            framerate: 15,
            bitrate_bps: 2_000_000,
            circular_buffer_max_chunks: 1000,
            circular_buffer_max_bytes: 64 * 1024 * 1024,
            target_seconds: 20,
        }
    }
}

impl VideoConfig {
    pub fn keyframe_interval(&self) -> u32 {
        self.target_seconds * self.framerate
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub picture_capture_interval_ms: u64,
    pub livestream_capture_interval_ms: u64,
    pub jpeg_quality: u8,
    pub thumbnail_size: (u32, u32),
    pub detection_resolution: (u32, u32),
}

impl Default for CaptureConfig {
    fn default() -> Self {
        CaptureConfig {
            picture_capture_interval_ms: 500,
            livestream_capture_interval_ms: 100,
            jpeg_quality: 85,
            thumbnail_size: (320, 240),
            detection_resolution: (100, 75),
        }
    }
}

impl CaptureConfig {
    pub fn picture_capture_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.picture_capture_interval_ms)
    }

    pub fn livestream_capture_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.livestream_capture_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    pub threshold_per_pixel: u8,
    pub sensitivity_px: u32,
    pub cooldown_seconds: u64,
}

impl Default for MotionConfig {
    fn default() -> Self {
        MotionConfig {
            threshold_per_pixel: 30,
            sensitivity_px: 50,
            cooldown_seconds: 70,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    pub port: u16,
    pub framerate: u32,
    pub jpeg_quality: u8,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        StreamingConfig {
            port: 8080,
            framerate: 10,
            jpeg_quality: 70,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub post_motion_buffer_fill_percent: f64,
    pub post_motion_timeout_seconds: u64,
    pub camera_warmup_seconds: u64,
    pub shutdown_timeout_seconds: u64,
    pub log_batch_interval_seconds: u64,
    pub picture_b_delay_seconds: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        TimingConfig {
            post_motion_buffer_fill_percent: 0.95,
            post_motion_timeout_seconds: 60,
            camera_warmup_seconds: 2,
            shutdown_timeout_seconds: 5,
            log_batch_interval_seconds: 5,
            picture_b_delay_seconds: 4,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub video: VideoConfig,
    pub capture: CaptureConfig,
    pub motion: MotionConfig,
    pub streaming: StreamingConfig,
    pub timing: TimingConfig,
}

impl Config {
    /// Load from a TOML file, falling back to defaults for any key not
    /// present. An absent file is not itself an error (every field has a
    /// default); a malformed file is `ConfigInvalid`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => {
                let text = std::fs::read_to_string(p).map_err(|e| {
                    Error::ConfigInvalid(format!("cannot read config file {}: {e}", p.display()))
                })?;
                toml::from_str(&text)
                    .map_err(|e| Error::ConfigInvalid(format!("malformed config file: {e}")))?
            }
            None => Config::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn db_path(&self) -> PathBuf {
        self.paths.base.join(&self.paths.db_file)
    }

    pub fn pictures_dir(&self) -> PathBuf {
        self.paths.base.join("pictures")
    }

    pub fn thumbs_dir(&self) -> PathBuf {
        self.paths.base.join("thumbs")
    }

    pub fn videos_dir(&self) -> PathBuf {
        self.paths.base.join("videos")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.paths.base.join("tmp")
    }

    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [
            self.paths.base.clone(),
            self.pictures_dir(),
            self.thumbs_dir(),
            self.videos_dir(),
            self.tmp_dir(),
        ] {
            std::fs::create_dir_all(&dir).map_err(|e| {
                Error::ConfigInvalid(format!("cannot create directory {}: {e}", dir.display()))
            })?;
        }
        Ok(())
    }

    /// Cross-field checks. The cooldown invariant (`DetectorState`, §3) is
    /// the one that matters most: cooldown must outlast the worst-case
    /// processor latency (picture-B delay + save-protocol timeout) plus a
    /// safety margin, or the motion signal could be overwritten in normal
    /// operation rather than only in pathological cases.
    fn validate(&self) -> Result<()> {
        if self.video.circular_buffer_max_chunks == 0 {
            return Err(Error::ConfigInvalid(
                "video.circular_buffer_max_chunks must be > 0".to_string(),
            ));
        }
        if self.capture.detection_resolution.0 == 0 || self.capture.detection_resolution.1 == 0 {
            return Err(Error::ConfigInvalid(
                "capture.detection_resolution must have both dimensions > 0".to_string(),
            ));
        }
        if self.capture.detection_resolution.0 >= self.video.width
            || self.capture.detection_resolution.1 >= self.video.height
        {
            return Err(Error::ConfigInvalid(
                "capture.detection_resolution must be smaller than video resolution".to_string(),
            ));
        }
        let worst_case_processor_latency = self.timing.picture_b_delay_seconds
            + self.timing.post_motion_timeout_seconds
            + 5; // safety margin
        if self.motion.cooldown_seconds <= worst_case_processor_latency {
            return Err(Error::ConfigInvalid(format!(
                "motion.cooldown_seconds ({}) must strictly exceed worst-case processor latency ({})",
                self.motion.cooldown_seconds, worst_case_processor_latency
            )));
        }
        if !(0.0..=1.0).contains(&self.timing.post_motion_buffer_fill_percent)
            || self.timing.post_motion_buffer_fill_percent <= 0.0
        {
            return Err(Error::ConfigInvalid(
                "timing.post_motion_buffer_fill_percent must be in (0, 1]".to_string(),
            ));
        }
        Ok(())
    }
}
