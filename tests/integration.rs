//! Cross-component wiring tests: Motion Detector (E) and Event Processor (F)
//! driven together through a fake camera driver, exercising the motion ->
//! store -> file-save pipeline without a real encoder subprocess.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use sentrywatch::camera::{CameraDriver, ChunkSink, EncoderHandle};
use sentrywatch::chunk::Chunk;
use sentrywatch::config::{
    CaptureConfig, Config, MotionConfig, PathsConfig, StreamingConfig, TimingConfig, VideoConfig,
};
use sentrywatch::event_processor::EventProcessor;
use sentrywatch::frame_pair::{Frame, FramePair};
use sentrywatch::logger::Logger;
use sentrywatch::mjpeg_server::MjpegServer;
use sentrywatch::motion_detector::MotionDetector;
use sentrywatch::motion_signal::MotionSignal;
use sentrywatch::ring::Ring;
use sentrywatch::store::EventStore;
use sentrywatch::watchdog::Watchdog;
use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

const DIM: u32 = 8;

/// Returns solid-color frames whose green channel value can be flipped at
/// runtime to simulate motion, and never touches any external process.
struct FakeCameraDriver {
    value: AtomicU8,
}

impl FakeCameraDriver {
    fn new() -> Self {
        FakeCameraDriver {
            value: AtomicU8::new(128),
        }
    }

    fn set_value(&self, v: u8) {
        self.value.store(v, Ordering::SeqCst);
    }

    fn frame(&self) -> Frame {
        let v = self.value.load(Ordering::SeqCst);
        Frame::from_rgb(DIM, DIM, vec![v; (DIM * DIM * 3) as usize])
    }
}

impl CameraDriver for FakeCameraDriver {
    fn start_encoder(&self, _sink: Arc<dyn ChunkSink>) -> sentrywatch::error::Result<EncoderHandle> {
        Ok(EncoderHandle::inert())
    }

    fn capture_preview_frame(&self) -> sentrywatch::error::Result<Frame> {
        Ok(self.frame())
    }

    fn capture_color_still(&self) -> sentrywatch::error::Result<Frame> {
        Ok(self.frame())
    }
}

fn test_config(base: std::path::PathBuf) -> Config {
    Config {
        paths: PathsConfig {
            base,
            db_file: "events.sqlite3".to_string(),
        },
        video: VideoConfig {
            width: 640,
            height: 480,
            framerate: 15,
            bitrate_bps: 0,
            circular_buffer_max_chunks: 50,
            circular_buffer_max_bytes: 0,
            target_seconds: 20,
        },
        capture: CaptureConfig {
            picture_capture_interval_ms: 20,
            livestream_capture_interval_ms: 20,
            jpeg_quality: 80,
            thumbnail_size: (4, 4),
            detection_resolution: (DIM, DIM),
        },
        motion: MotionConfig {
            threshold_per_pixel: 30,
            sensitivity_px: 10,
            cooldown_seconds: 2,
        },
        streaming: Default::default(),
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

/// Wires D, E, F together for a single test, mirroring the bring-up order in
/// §4.10 minus A's real encoder and G/H, which this test does not exercise.
struct Harness {
    config: Config,
    driver: Arc<FakeCameraDriver>,
    store: Arc<EventStore>,
    logger: Arc<Logger>,
    motion_detector: Arc<MotionDetector>,
    event_processor: Arc<EventProcessor>,
    ring: Arc<Ring>,
}

impl Harness {
    fn start(config: Config) -> Self {
        config.ensure_directories().unwrap();
        let store = Arc::new(EventStore::open(&config.db_path()).unwrap());
        let logger = Logger::start(Arc::clone(&store), Duration::from_secs(5));
        let driver: Arc<FakeCameraDriver> = Arc::new(FakeCameraDriver::new());
        let frame_pair = Arc::new(FramePair::new());
        let signal = Arc::new(MotionSignal::new());

        let ring = Ring::new(
            config.video.circular_buffer_max_chunks,
            config.video.circular_buffer_max_bytes,
            config.capture.picture_capture_interval(),
        );
        Ring::start(&ring, driver.clone(), Arc::clone(&frame_pair)).unwrap();

        let motion_detector = MotionDetector::new(
            Arc::clone(&frame_pair),
            Arc::clone(&signal),
            Arc::clone(&store),
            driver.clone(),
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
            driver.clone(),
            Arc::clone(&logger),
            &config,
        );

        MotionDetector::start(&motion_detector);
        EventProcessor::start(&event_processor);

        // Let the capture worker fill both frame_pair slots before any test
        // drives motion.
        std::thread::sleep(Duration::from_millis(100));

        Harness {
            config,
            driver,
            store,
            logger,
            motion_detector,
            event_processor,
            ring,
        }
    }

    fn shutdown(self) {
        self.motion_detector.stop();
        self.event_processor.stop();
        self.ring.stop();
        self.logger.stop();
    }
}

/// S2-style: one motion pulse produces exactly one fully processed event.
#[test]
fn single_motion_event_processed_end_to_end() {
    let dir = tempdir().unwrap();
    let harness = Harness::start(test_config(dir.path().to_path_buf()));

    harness.driver.set_value(255);
    std::thread::sleep(Duration::from_millis(60));
    harness.driver.set_value(128);

    // Cooldown (2s) + picture-b delay (0s) + refill timeout (1s) bound how
    // long the processor can still be working on the single event.
    std::thread::sleep(Duration::from_millis(2500));

    let events = count_events(&harness.store);
    assert_eq!(events, 1);

    let event = harness.store.get_event(1).unwrap().unwrap();
    assert!(event.motion_score as u32 >= harness.config.motion.sensitivity_px);
    assert!(event.image_a_path.is_some());
    assert!(event.image_b_path.is_some(), "picture B should have been saved");
    assert!(event.thumbnail_path.is_some(), "thumbnail should have been saved");
    assert!(event.video_path.is_some(), "video path should be recorded even with an empty ring");

    let pending_marker = std::path::PathBuf::from(format!(
        "{}.pending",
        event.video_path.as_ref().unwrap()
    ));
    assert!(pending_marker.exists(), "pending marker must be created after the dump's fsync");

    harness.shutdown();
}

/// S3-style: several motion-causing flips inside one cooldown window collapse
/// into a single event row.
#[test]
fn rapid_repeats_collapse_into_one_event_under_cooldown() {
    let dir = tempdir().unwrap();
    let harness = Harness::start(test_config(dir.path().to_path_buf()));

    for _ in 0..5 {
        harness.driver.set_value(255);
        std::thread::sleep(Duration::from_millis(80));
        harness.driver.set_value(128);
        std::thread::sleep(Duration::from_millis(80));
    }

    // Give the one accepted event time to fully process before asserting.
    std::thread::sleep(Duration::from_millis(2000));

    assert_eq!(count_events(&harness.store), 1);

    harness.shutdown();
}

/// S1-style: frames that never change produce zero events.
#[test]
fn no_motion_quiescence_inserts_nothing() {
    let dir = tempdir().unwrap();
    let harness = Harness::start(test_config(dir.path().to_path_buf()));

    std::thread::sleep(Duration::from_millis(500));

    assert_eq!(count_events(&harness.store), 0);

    harness.shutdown();
}

/// S4-style: motion fires while the ring is already at capacity and an
/// encoder keeps appending chunks throughout (§9's documented precondition
/// that `clear()` does not stop the encoder); the post-dump refill should
/// still reach a meaningful share of its target fill before the timeout.
#[test]
fn save_during_full_buffer_meets_target_fill() {
    let dir = tempdir().unwrap();
    let harness = Harness::start(test_config(dir.path().to_path_buf()));

    let keep_running = Arc::new(AtomicBool::new(true));
    let encoder_ring = Arc::clone(&harness.ring);
    let encoder_flag = Arc::clone(&keep_running);
    let encoder_thread = std::thread::spawn(move || {
        let mut i: u64 = 0;
        while encoder_flag.load(Ordering::SeqCst) {
            let is_keyframe = i % 10 == 0;
            encoder_ring.append(Chunk::new(vec![0u8; 32], is_keyframe));
            i += 1;
            std::thread::sleep(Duration::from_millis(2));
        }
    });

    while harness.ring.len() < harness.config.video.circular_buffer_max_chunks {
        std::thread::sleep(Duration::from_millis(10));
    }

    harness.driver.set_value(255);
    std::thread::sleep(Duration::from_millis(60));
    harness.driver.set_value(128);

    std::thread::sleep(Duration::from_millis(2500));

    keep_running.store(false, Ordering::SeqCst);
    encoder_thread.join().unwrap();

    assert_eq!(count_events(&harness.store), 1);
    let event = harness.store.get_event(1).unwrap().unwrap();
    let video_path = event.video_path.unwrap();

    let target_chunks = ((harness.config.video.circular_buffer_max_chunks as f64)
        * harness.config.timing.post_motion_buffer_fill_percent)
        .floor() as u64;
    let bytes = std::fs::metadata(&video_path).unwrap().len();
    assert!(
        bytes >= target_chunks * 32 / 2,
        "expected roughly {} target chunks worth of bytes, got {bytes}",
        target_chunks
    );

    harness.shutdown();
}

/// Returns solid-color frames whose green channel value is backed by a
/// shared atomic, so the driver instance that a watchdog recovery builds via
/// its factory still reflects the same test-controlled value. Preview
/// capture can be frozen independently per instance to simulate an encoder
/// stall without affecting still captures (§4.9's documented liveness
/// signal is the preview path only).
struct FreezableCameraDriver {
    value: Arc<AtomicU8>,
    frozen: AtomicBool,
}

impl FreezableCameraDriver {
    fn new(value: Arc<AtomicU8>) -> Self {
        FreezableCameraDriver {
            value,
            frozen: AtomicBool::new(false),
        }
    }

    fn freeze(&self) {
        self.frozen.store(true, Ordering::SeqCst);
    }

    fn frame(&self) -> Frame {
        let v = self.value.load(Ordering::SeqCst);
        Frame::from_rgb(DIM, DIM, vec![v; (DIM * DIM * 3) as usize])
    }
}

impl CameraDriver for FreezableCameraDriver {
    fn start_encoder(&self, _sink: Arc<dyn ChunkSink>) -> sentrywatch::error::Result<EncoderHandle> {
        Ok(EncoderHandle::inert())
    }

    fn capture_preview_frame(&self) -> sentrywatch::error::Result<Frame> {
        if self.frozen.load(Ordering::SeqCst) {
            Err(sentrywatch::error::Error::CameraUnavailable(
                "frozen for test".to_string(),
            ))
        } else {
            Ok(self.frame())
        }
    }

    fn capture_color_still(&self) -> sentrywatch::error::Result<Frame> {
        Ok(self.frame())
    }
}

/// Wires the full system (D/E/F/G/H) for the watchdog- and streaming-facing
/// scenarios that `Harness` (D/E/F only) cannot exercise.
struct FullHarness {
    config: Config,
    driver: Arc<FreezableCameraDriver>,
    shared_value: Arc<AtomicU8>,
    store: Arc<EventStore>,
    logger: Arc<Logger>,
    motion_detector: Arc<MotionDetector>,
    event_processor: Arc<EventProcessor>,
    mjpeg_server: Arc<MjpegServer>,
    watchdog: Arc<Watchdog>,
    ring: Arc<Ring>,
}

impl FullHarness {
    fn start(config: Config) -> Self {
        config.ensure_directories().unwrap();
        let store = Arc::new(EventStore::open(&config.db_path()).unwrap());
        let logger = Logger::start(Arc::clone(&store), Duration::from_secs(5));

        let shared_value = Arc::new(AtomicU8::new(128));
        let driver = Arc::new(FreezableCameraDriver::new(Arc::clone(&shared_value)));
        let frame_pair = Arc::new(FramePair::new());
        let signal = Arc::new(MotionSignal::new());

        let ring = Ring::new(
            config.video.circular_buffer_max_chunks,
            config.video.circular_buffer_max_bytes,
            config.capture.picture_capture_interval(),
        );
        Ring::start(&ring, driver.clone(), Arc::clone(&frame_pair)).unwrap();

        let motion_detector = MotionDetector::new(
            Arc::clone(&frame_pair),
            Arc::clone(&signal),
            Arc::clone(&store),
            driver.clone(),
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
            driver.clone(),
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

        let factory_value = Arc::clone(&shared_value);
        let watchdog = Watchdog::new(
            Arc::clone(&ring),
            driver.clone(),
            Box::new(move || {
                Arc::new(FreezableCameraDriver::new(Arc::clone(&factory_value))) as Arc<dyn CameraDriver>
            }),
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

        std::thread::sleep(Duration::from_millis(100));

        FullHarness {
            config,
            driver,
            shared_value,
            store,
            logger,
            motion_detector,
            event_processor,
            mjpeg_server,
            watchdog,
            ring,
        }
    }

    fn set_value(&self, v: u8) {
        self.shared_value.store(v, Ordering::SeqCst);
    }

    fn shutdown(self) {
        self.mjpeg_server.stop();
        self.watchdog.stop();
        self.motion_detector.stop();
        self.event_processor.stop();
        self.ring.stop();
        self.logger.stop();
    }
}

/// S5-style: the capture worker's preview feed stalls; the watchdog's
/// liveness check (`FRAME_TIMEOUT`, 10s) fires on its next tick (`TICK`, 5s)
/// and performs a full recovery, after which F and G are rebound to the new
/// ring and a subsequent motion event still completes normally.
#[test]
fn encoder_stall_triggers_recovery_and_resumes() {
    let dir = tempdir().unwrap();
    let harness = FullHarness::start(test_config(dir.path().to_path_buf()));

    let original_ring_ptr = Arc::as_ptr(&harness.watchdog.current_ring());
    harness.driver.freeze();

    // FRAME_TIMEOUT is 10s and the watchdog ticks every 5s; wait past two
    // ticks so recovery has definitely fired by the time we check.
    std::thread::sleep(Duration::from_secs(17));

    let recovered_ring = harness.watchdog.current_ring();
    assert_ne!(
        Arc::as_ptr(&recovered_ring),
        original_ring_ptr,
        "watchdog should have rebuilt the ring after the stall"
    );
    assert!(Arc::ptr_eq(&recovered_ring, &harness.event_processor.current_ring()));
    assert!(Arc::ptr_eq(&recovered_ring, &harness.mjpeg_server.current_ring()));
    assert!(
        recovered_ring.last_frame_age() < Duration::from_secs(5),
        "the recovered ring should be receiving fresh frames again"
    );

    harness.set_value(255);
    std::thread::sleep(Duration::from_millis(60));
    harness.set_value(128);
    std::thread::sleep(Duration::from_millis(2500));

    assert_eq!(
        count_events(&harness.store),
        1,
        "a motion event after recovery should still complete"
    );

    harness.shutdown();
}

/// S6-style: a stream session opens once `streaming_flag` is set, serves a
/// multipart MJPEG response to a connected client, and auto-resets the flag
/// after the idle window elapses once the client disconnects.
#[test]
fn stream_session_serves_mjpeg_and_auto_shuts_down_on_idle() {
    let dir = tempdir().unwrap();
    let mut config = test_config(dir.path().to_path_buf());
    config.streaming = StreamingConfig {
        port: 18099,
        framerate: 10,
        jpeg_quality: 70,
    };
    let harness = FullHarness::start(config);

    harness.store.set_streaming_flag(true).unwrap();

    // The monitor polls the flag once a second; allow margin before connecting.
    std::thread::sleep(Duration::from_millis(1100));

    let stream = TcpStream::connect(("127.0.0.1", 18099))
        .expect("stream should be accepting connections once streaming_flag is set");
    let mut writer = stream.try_clone().unwrap();
    writer
        .write_all(b"GET /stream.mjpg HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();

    let mut reader = BufReader::new(stream);
    let mut status_line = String::new();
    reader.read_line(&mut status_line).unwrap();
    assert!(status_line.starts_with("HTTP/1.1 200"), "unexpected status line: {status_line}");

    let mut header_block = String::new();
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        if line == "\r\n" || line.is_empty() {
            break;
        }
        header_block.push_str(&line);
    }
    assert!(
        header_block.contains("multipart/x-mixed-replace"),
        "missing multipart content type: {header_block}"
    );

    drop(reader);
    drop(writer);

    // Idle shutdown fires 5s after the last client leaves; give it margin.
    std::thread::sleep(Duration::from_millis(6500));

    assert!(
        !harness.store.get_streaming_flag().unwrap(),
        "streaming_flag should auto-reset once the client disconnects and the idle window elapses"
    );
    assert!(
        !harness.motion_detector.is_paused(),
        "motion detector should be resumed once the stream session ends"
    );

    harness.shutdown();
}

fn count_events(store: &EventStore) -> i64 {
    // EventStore exposes lookups by id, not a count; events are assigned
    // sequential ids starting at 1; probe until the next id is missing.
    let mut id = 1u64;
    let mut n = 0i64;
    loop {
        match store.get_event(id).unwrap() {
            Some(_) => {
                n += 1;
                id += 1;
            }
            None => break,
        }
    }
    n
}
