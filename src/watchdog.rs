//! Watchdog (H): monitors frame freshness, buffer health, and capture
//! worker liveness; performs full rebind recovery of the ring across E, F,
//! and G (§4.9).
//!
//! Grounded on `examples/original_source/watchdog.py`'s `_perform_full_recovery`
//! and on `raspberry_pi/rpi_camera.rs`'s health-check idiom,
//! generalized to the indirection-handle rebind design called for in
//! Design Notes §9 ("each worker holds an indirection handle...rebind swaps
//! the cell's contents").
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use crate::camera::CameraDriver;
use crate::config::Config;
use crate::event_processor::EventProcessor;
use crate::frame_pair::FramePair;
use crate::logger::Logger;
use crate::mjpeg_server::MjpegServer;
use crate::motion_detector::MotionDetector;
use crate::ring::{HealthStatus, Ring};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant};

const TICK: Duration = Duration::from_secs(5);
const FRAME_TIMEOUT: Duration = Duration::from_secs(10);
const RESTART_SUPPRESSION: Duration = Duration::from_secs(60);
const CONSECUTIVE_TIMEOUT_ESCALATION: u32 = 10;

/// Builds a fresh camera driver for recovery. Supplied by the orchestrator,
/// which alone knows the configured encoder/still commands.
pub type DriverFactory = Box<dyn Fn() -> Arc<dyn CameraDriver> + Send + Sync>;

pub struct Watchdog {
    ring: RwLock<Arc<Ring>>,
    driver: RwLock<Arc<dyn CameraDriver>>,
    driver_factory: DriverFactory,
    frame_pair: Arc<FramePair>,
    motion_detector: Arc<MotionDetector>,
    event_processor: Arc<EventProcessor>,
    mjpeg_server: Arc<MjpegServer>,
    logger: Arc<Logger>,
    ring_capacity: (usize, u64, Duration),
    running: Arc<AtomicBool>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Watchdog {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ring: Arc<Ring>,
        driver: Arc<dyn CameraDriver>,
        driver_factory: DriverFactory,
        frame_pair: Arc<FramePair>,
        motion_detector: Arc<MotionDetector>,
        event_processor: Arc<EventProcessor>,
        mjpeg_server: Arc<MjpegServer>,
        logger: Arc<Logger>,
        config: &Config,
    ) -> Arc<Self> {
        Arc::new(Watchdog {
            ring: RwLock::new(ring),
            driver: RwLock::new(driver),
            driver_factory,
            frame_pair,
            motion_detector,
            event_processor,
            mjpeg_server,
            logger,
            ring_capacity: (
                config.video.circular_buffer_max_chunks,
                config.video.circular_buffer_max_bytes,
                config.capture.picture_capture_interval(),
            ),
            running: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        })
    }

    pub fn start(this: &Arc<Self>) {
        this.running.store(true, Ordering::SeqCst);
        let watchdog = Arc::clone(this);
        let handle = thread::Builder::new()
            .name("Watchdog".to_string())
            .spawn(move || watchdog.run())
            .expect("failed to spawn Watchdog thread");
        *this.thread.lock().unwrap() = Some(handle);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    /// The ring currently bound, post-recovery if one has occurred.
    pub fn current_ring(&self) -> Arc<Ring> {
        self.ring.read().unwrap().clone()
    }

    /// The camera driver currently bound, post-recovery if one has occurred.
    pub fn current_driver(&self) -> Arc<dyn CameraDriver> {
        self.driver.read().unwrap().clone()
    }

    fn run(&self) {
        self.logger.info("Watchdog loop started");
        let mut last_recovery: Option<Instant> = None;
        let mut consecutive_timeouts: u32 = 0;

        while self.running.load(Ordering::SeqCst) {
            thread::sleep(TICK);
            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            let ring = self.ring.read().unwrap().clone();
            let is_timeout = ring.last_frame_age() > FRAME_TIMEOUT;

            let health = ring.health();
            self.log_health(&health);
            if health.evictions > 50 * self.ring_capacity.0 as u64 {
                let err = crate::error::Error::RingExhausted {
                    evictions: health.evictions,
                    max_chunks: self.ring_capacity.0,
                };
                self.logger.warn(format!("{err} (undersized buffer?)"));
            }

            if is_timeout {
                consecutive_timeouts += 1;
                let suppressed = last_recovery
                    .map(|t| t.elapsed() < RESTART_SUPPRESSION)
                    .unwrap_or(false);
                let stall = crate::error::Error::EncoderStall;
                if suppressed {
                    self.logger.warn(format!("{stall}; recovery suppressed (recent restart)"));
                } else {
                    self.logger.error(format!("{stall}; performing full recovery"));
                    self.perform_full_recovery();
                    last_recovery = Some(Instant::now());
                    consecutive_timeouts = 0;
                }

                if consecutive_timeouts >= CONSECUTIVE_TIMEOUT_ESCALATION {
                    self.logger.error(
                        "10 consecutive timeouts without a recovered frame; hardware may be dead",
                    );
                    consecutive_timeouts = 0;
                }
            } else {
                consecutive_timeouts = 0;
            }
        }
        self.logger.info("Watchdog loop stopped");
    }

    fn log_health(&self, health: &crate::ring::BufferHealth) {
        let message = format!(
            "buffer health: {}/{} ({:.1}%), {} evictions",
            health.current, health.max, health.utilization_pct, health.evictions
        );
        match health.status {
            HealthStatus::Optimal => self.logger.info(message),
            HealthStatus::Filling => self.logger.info(message),
            HealthStatus::Low => self.logger.warn(message),
            HealthStatus::CriticallyLow => self.logger.warn(message),
        }
    }

    /// §4.9 step 3: pause F before stopping A so an in-progress save
    /// completes or fails cleanly against the still-alive ring; destruction
    /// happens only after both E and F are confirmed paused.
    fn perform_full_recovery(&self) {
        self.motion_detector.pause();
        self.event_processor.pause();

        let old_ring = self.ring.read().unwrap().clone();
        old_ring.stop();
        drop(old_ring);

        let (max_chunks, max_bytes, normal_interval) = self.ring_capacity;
        let new_ring = Ring::new(max_chunks, max_bytes, normal_interval);
        let new_driver = (self.driver_factory)();

        match Ring::start(&new_ring, new_driver.clone(), Arc::clone(&self.frame_pair)) {
            Ok(()) => {
                *self.ring.write().unwrap() = Arc::clone(&new_ring);
                *self.driver.write().unwrap() = Arc::clone(&new_driver);

                self.event_processor.rebind(Arc::clone(&new_ring), Arc::clone(&new_driver));
                self.mjpeg_server.rebind(Arc::clone(&new_ring));

                self.motion_detector.resume();
                self.event_processor.resume();
                self.logger.info("recovery complete: ring and camera driver rebound");
            }
            Err(e) => {
                self.logger.error(format!("recovery failed to start new ring: {e}"));
                // Leave E/F paused; the next tick will attempt recovery again.
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        CaptureConfig, Config, MotionConfig, PathsConfig, StreamingConfig, TimingConfig, VideoConfig,
    };
    use crate::event_processor::EventProcessor;
    use crate::frame_pair::Frame;
    use crate::motion_signal::MotionSignal;
    use crate::store::EventStore;
    use tempfile::tempdir;

    struct StubDriver;

    impl CameraDriver for StubDriver {
        fn start_encoder(
            &self,
            _sink: Arc<dyn crate::camera::ChunkSink>,
        ) -> crate::error::Result<crate::camera::EncoderHandle> {
            Ok(crate::camera::EncoderHandle::inert())
        }

        fn capture_preview_frame(&self) -> crate::error::Result<Frame> {
            Ok(Frame::from_rgb(4, 4, vec![128u8; 4 * 4 * 3]))
        }

        fn capture_color_still(&self) -> crate::error::Result<Frame> {
            Ok(Frame::from_rgb(4, 4, vec![128u8; 4 * 4 * 3]))
        }
    }

    fn test_config(base: std::path::PathBuf) -> Config {
        Config {
            paths: PathsConfig {
                base,
                db_file: "events.sqlite3".to_string(),
            },
            video: VideoConfig {
                width: 64,
                height: 64,
                framerate: 15,
                bitrate_bps: 0,
                circular_buffer_max_chunks: 10,
                circular_buffer_max_bytes: 0,
                target_seconds: 5,
            },
            capture: CaptureConfig {
                picture_capture_interval_ms: 20,
                livestream_capture_interval_ms: 20,
                jpeg_quality: 80,
                thumbnail_size: (4, 4),
                detection_resolution: (4, 4),
            },
            motion: MotionConfig {
                threshold_per_pixel: 30,
                sensitivity_px: 10,
                cooldown_seconds: 70,
            },
            streaming: StreamingConfig {
                port: 18199,
                framerate: 10,
                jpeg_quality: 70,
            },
            timing: TimingConfig {
                post_motion_buffer_fill_percent: 0.5,
                post_motion_timeout_seconds: 1,
                camera_warmup_seconds: 0,
                shutdown_timeout_seconds: 1,
                log_batch_interval_seconds: 5,
                picture_b_delay_seconds: 0,
            },
        }
    }

    /// Property 8 (rebind safety): a successful recovery tears down the old
    /// ring, builds a fresh one, and rebinds F and G to it - and resumes E/F
    /// rather than leaving them paused.
    #[test]
    fn recovery_rebuilds_ring_and_rebinds_event_processor_and_mjpeg_server() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path().to_path_buf());
        config.ensure_directories().unwrap();

        let store = Arc::new(EventStore::open(&config.db_path()).unwrap());
        let logger = Logger::start(Arc::clone(&store), Duration::from_secs(5));
        let driver: Arc<dyn CameraDriver> = Arc::new(StubDriver);
        let frame_pair = Arc::new(FramePair::new());
        let signal = Arc::new(MotionSignal::new());

        let ring = Ring::new(
            config.video.circular_buffer_max_chunks,
            config.video.circular_buffer_max_bytes,
            config.capture.picture_capture_interval(),
        );
        Ring::start(&ring, Arc::clone(&driver), Arc::clone(&frame_pair)).unwrap();

        let motion_detector = MotionDetector::new(
            Arc::clone(&frame_pair),
            Arc::clone(&signal),
            Arc::clone(&store),
            Arc::clone(&driver),
            Arc::clone(&logger),
            config.pictures_dir(),
            config.motion.clone(),
            &config.capture,
        );
        let event_processor = EventProcessor::new(
            Arc::clone(&signal),
            Arc::clone(&ring),
            Arc::clone(&frame_pair),
            Arc::clone(&store),
            Arc::clone(&driver),
            Arc::clone(&logger),
            &config,
        );
        let mjpeg_server = MjpegServer::new(
            Arc::clone(&store),
            Arc::clone(&frame_pair),
            Arc::clone(&ring),
            Arc::clone(&motion_detector),
            Arc::clone(&logger),
            &config,
        );

        let watchdog = Watchdog::new(
            Arc::clone(&ring),
            Arc::clone(&driver),
            Box::new(|| Arc::new(StubDriver) as Arc<dyn CameraDriver>),
            Arc::clone(&frame_pair),
            Arc::clone(&motion_detector),
            Arc::clone(&event_processor),
            Arc::clone(&mjpeg_server),
            Arc::clone(&logger),
            &config,
        );

        let original_ring_ptr = Arc::as_ptr(&ring);

        watchdog.perform_full_recovery();

        let recovered_ring = watchdog.current_ring();
        assert_ne!(
            Arc::as_ptr(&recovered_ring),
            original_ring_ptr,
            "recovery should construct a fresh ring rather than reuse the old one"
        );
        assert!(
            Arc::ptr_eq(&recovered_ring, &event_processor.current_ring()),
            "event processor must be rebound to the recovered ring"
        );
        assert!(
            Arc::ptr_eq(&recovered_ring, &mjpeg_server.current_ring()),
            "mjpeg server must be rebound to the recovered ring"
        );
        assert!(
            !motion_detector.is_paused(),
            "motion detector must end up resumed after a successful recovery"
        );
        assert!(
            !event_processor.is_paused(),
            "event processor must end up resumed after a successful recovery"
        );

        motion_detector.stop();
        event_processor.stop();
        recovered_ring.stop();
        logger.stop();
    }
}
