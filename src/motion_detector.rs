//! Motion Detector Worker (E).
//!
//! Grounded on `examples/original_source/motion_detector.py`'s
//! `_detection_loop`/`_compare_frames`/`_handle_motion_event`, transliterated
//! into the thread-plus-atomic-pause idiom
//! `raspberry_pi/rpi_camera.rs` uses for `motion_detection: Arc<AtomicBool>`.
//!
//! Per Design Notes §9, the Python original's periodic `gc.collect()` and
//! OpenCV cache-toggle inside this loop are a language-specific workaround
//! with no Rust equivalent and are not carried over.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use crate::camera::CameraDriver;
use crate::config::{CaptureConfig, MotionConfig};
use crate::frame_pair::{Frame, FramePair};
use crate::logger::Logger;
use crate::motion_signal::MotionSignal;
use crate::store::EventStore;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

pub struct MotionDetector {
    frame_pair: Arc<FramePair>,
    signal: Arc<MotionSignal>,
    store: Arc<EventStore>,
    driver: Arc<dyn CameraDriver>,
    logger: Arc<Logger>,
    pictures_dir: PathBuf,
    motion: MotionConfig,
    detection_resolution: (u32, u32),
    capture_interval: Duration,
    jpeg_quality: u8,
    paused: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl MotionDetector {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        frame_pair: Arc<FramePair>,
        signal: Arc<MotionSignal>,
        store: Arc<EventStore>,
        driver: Arc<dyn CameraDriver>,
        logger: Arc<Logger>,
        pictures_dir: PathBuf,
        motion: MotionConfig,
        capture: &CaptureConfig,
    ) -> Arc<Self> {
        Arc::new(MotionDetector {
            frame_pair,
            signal,
            store,
            driver,
            logger,
            pictures_dir,
            motion,
            detection_resolution: capture.detection_resolution,
            capture_interval: capture.picture_capture_interval(),
            jpeg_quality: capture.jpeg_quality,
            paused: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        })
    }

    pub fn start(this: &Arc<Self>) {
        this.running.store(true, Ordering::SeqCst);
        let detector = Arc::clone(this);
        let handle = thread::Builder::new()
            .name("MotionDetector".to_string())
            .spawn(move || detector.detection_loop())
            .expect("failed to spawn MotionDetector thread");
        *this.thread.lock().unwrap() = Some(handle);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    /// Invoked by the watchdog during recovery (§4.9 step d).
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        self.logger.info("[WATCHDOG] MotionDetector paused.");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.logger.info("[WATCHDOG] MotionDetector resumed.");
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn detection_loop(&self) {
        self.logger.info("Motion detection loop started");
        let mut last_detection_at: Option<Instant> = None;

        while self.running.load(Ordering::SeqCst) {
            if self.paused.load(Ordering::SeqCst) {
                thread::sleep(self.capture_interval);
                continue;
            }

            if let Some(last) = last_detection_at {
                if last.elapsed() < Duration::from_secs(self.motion.cooldown_seconds) {
                    thread::sleep(self.capture_interval);
                    continue;
                }
            }

            let Some((previous, current)) =
                self.frame_pair.pair_for_detection(self.detection_resolution)
            else {
                thread::sleep(self.capture_interval);
                continue;
            };

            let changed_pixels = compare_frames(&previous, &current, self.motion.threshold_per_pixel);

            if changed_pixels > self.motion.sensitivity_px {
                match self.handle_motion_event(changed_pixels) {
                    Ok(()) => last_detection_at = Some(Instant::now()),
                    Err(e) => {
                        // Cooldown is explicitly NOT entered on failure,
                        // allowing an immediate retry on the next tick
                        // (ported from motion_detector.py's exception path).
                        self.logger.error(format!("failed to handle motion event: {e}"));
                    }
                }
            }

            thread::sleep(self.capture_interval);
        }
        self.logger.info("Motion detection loop stopped");
    }

    fn handle_motion_event(&self, motion_score: u32) -> crate::error::Result<()> {
        let timestamp = Utc::now();
        let filename_base = timestamp.format("%Y.%m.%d--%H.%M.%S").to_string();

        let still = self.driver.capture_color_still()?;
        let image_a_path = self.pictures_dir.join(format!("{filename_base}_a.jpg"));
        save_jpeg(&still, &image_a_path, self.jpeg_quality)?;

        let event_id = self.store.insert_event(
            timestamp,
            motion_score as i64,
            &image_a_path.to_string_lossy(),
        )?;

        self.signal.set(event_id, timestamp);
        self.logger
            .info(format!("Motion event {event_id}: {motion_score} changed pixels"));
        Ok(())
    }
}

/// Green-channel absolute difference (§4.5 step 4). `Frame` always stores
/// RGB (up-converting 2-D sources on push, see `frame_pair.rs`), so reading
/// the green channel here is correct for both genuinely-color sources and
/// up-converted luma sources alike.
fn compare_frames(previous: &Frame, current: &Frame, threshold_per_pixel: u8) -> u32 {
    let g1 = previous.green_channel();
    let g2 = current.green_channel();
    g1.iter()
        .zip(g2.iter())
        .filter(|(a, b)| a.abs_diff(**b) > threshold_per_pixel)
        .count() as u32
}

fn save_jpeg(frame: &Frame, path: &std::path::Path, quality: u8) -> crate::error::Result<()> {
    let mut file = std::fs::File::create(path).map_err(|e| crate::error::Error::SaveIoError {
        path: path.to_path_buf(),
        source: e,
    })?;
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut file, quality);
    encoder
        .encode_image(&frame.image)
        .map_err(|e| crate::error::Error::SaveIoError {
            path: path.to_path_buf(),
            source: std::io::Error::other(e.to_string()),
        })
}
