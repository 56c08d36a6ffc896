//! Orchestrator (I): deterministic bring-up and teardown ordering, signal
//! handling (§4.10).
//!
//! Grounded on `examples/original_source/main.py`'s startup sequence and
//! `camera_hub/src/main.rs`'s docopt-driven `main()`, restructured around an
//! explicit `System` handle rather than free functions so that teardown
//! order is a single reversed list instead of duplicated logic.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use crate::camera::{CameraDriver, ProcessCameraDriver};
use crate::config::Config;
use crate::event_processor::EventProcessor;
use crate::frame_pair::FramePair;
use crate::logger::Logger;
use crate::mjpeg_server::MjpegServer;
use crate::motion_detector::MotionDetector;
use crate::motion_signal::MotionSignal;
use crate::ring::Ring;
use crate::store::EventStore;
use crate::watchdog::Watchdog;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub struct System {
    logger: Arc<Logger>,
    motion_detector: Arc<MotionDetector>,
    event_processor: Arc<EventProcessor>,
    mjpeg_server: Arc<MjpegServer>,
    watchdog: Arc<Watchdog>,
    ring: Arc<Ring>,
    shutdown_timeout: Duration,
}

/// Builds the concrete camera driver from configured commands. Centralized
/// here (rather than in `camera.rs`) because it is also used as H's
/// `DriverFactory` when constructing a replacement driver during recovery.
fn build_driver(config: &Config) -> Arc<dyn CameraDriver> {
    Arc::new(ProcessCameraDriver {
        encoder_command: std::env::var("SENTRYWATCH_ENCODER_CMD")
            .unwrap_or_else(|_| "rpicam-vid -t 0 --codec h264 -o -".to_string()),
        still_command: std::env::var("SENTRYWATCH_STILL_CMD")
            .unwrap_or_else(|_| "rpicam-still -t 1 --encoding ppm -o -".to_string()),
        width: config.video.width,
        height: config.video.height,
    })
}

impl System {
    /// Bring-up order (§4.10): validate config -> create directories -> open
    /// event store -> reset streaming_flag=0 -> construct D -> construct A
    /// (camera+encoder+capture worker) -> construct E -> construct F ->
    /// construct G -> start F -> start E -> start H -> start G.
    pub fn start(config: Config) -> crate::error::Result<Self> {
        config.ensure_directories()?;

        let store = Arc::new(EventStore::open(&config.db_path())?);
        store.set_streaming_flag(false)?;

        let logger = Logger::start(
            Arc::clone(&store),
            Duration::from_secs(config.timing.log_batch_interval_seconds),
        );
        logger.info("sentrywatch starting up");

        let signal = Arc::new(MotionSignal::new());
        let frame_pair = Arc::new(FramePair::new());

        let driver = build_driver(&config);
        let ring = Ring::new(
            config.video.circular_buffer_max_chunks,
            config.video.circular_buffer_max_bytes,
            config.capture.picture_capture_interval(),
        );
        Ring::start(&ring, Arc::clone(&driver), Arc::clone(&frame_pair))?;

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

        let config_for_factory = config.clone();
        let watchdog = Watchdog::new(
            Arc::clone(&ring),
            Arc::clone(&driver),
            Box::new(move || build_driver(&config_for_factory)),
            Arc::clone(&frame_pair),
            Arc::clone(&motion_detector),
            Arc::clone(&event_processor),
            Arc::clone(&mjpeg_server),
            Arc::clone(&logger),
            &config,
        );

        EventProcessor::start(&event_processor);
        MotionDetector::start(&motion_detector);
        Watchdog::start(&watchdog);
        MjpegServer::start(&mjpeg_server);

        logger.info("sentrywatch started");

        Ok(System {
            logger,
            motion_detector,
            event_processor,
            mjpeg_server,
            watchdog,
            ring,
            shutdown_timeout: Duration::from_secs(config.timing.shutdown_timeout_seconds),
        })
    }

    /// Teardown reverses the bring-up order strictly (§4.10).
    pub fn shutdown(self) {
        self.logger.info("sentrywatch shutting down");
        self.mjpeg_server.stop();
        self.watchdog.stop();
        self.motion_detector.stop();
        self.event_processor.stop();
        self.ring.stop();
        self.logger.info("sentrywatch shutdown complete");
        // Bounded join latency is already enforced per-worker via their own
        // `stop()` joins; this sleep only covers the logger's own final
        // flush, since it is the very last thing torn down.
        std::thread::sleep(self.shutdown_timeout.min(Duration::from_secs(2)));
        self.logger.stop();
    }
}

/// Installs SIGINT/SIGTERM handlers flipping a shared flag, per §4.10's
/// "signal handlers for interrupt/terminate trigger teardown."
pub fn install_signal_handler() -> Arc<AtomicBool> {
    let running = Arc::new(AtomicBool::new(true));
    let handler_flag = Arc::clone(&running);
    ctrlc::set_handler(move || {
        handler_flag.store(false, Ordering::SeqCst);
    })
    .expect("failed to install signal handler");
    running
}
