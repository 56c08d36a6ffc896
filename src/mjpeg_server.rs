//! MJPEG Server (G): polls the external streaming flag and, while it is set,
//! serves a raw multipart MJPEG stream plus raises B's capture rate and
//! pauses E (§4.8).
//!
//! Grounded on `examples/original_source/mjpeg_server.py`'s
//! `MJPEGHandler`/`MJPEGServer`. The HTTP layer is a hand-rolled
//! `TcpListener` loop writing the multipart response directly, in the
//! raw-socket wire-protocol idiom `pairing.rs` uses (its
//! `write_varying_len`-style manual framing over a `TcpStream`) rather than
//! an HTTP framework: there is exactly one route, no content negotiation,
//! and no request body to parse, so `axum`/`hyper` would add a dependency
//! without buying anything (see DESIGN.md).
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use crate::config::{Config, StreamingConfig};
use crate::frame_pair::FramePair;
use crate::logger::Logger;
use crate::motion_detector::MotionDetector;
use crate::ring::Ring;
use crate::store::{or_sentinel, EventStore};
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant};

const AUTO_SHUTDOWN_IDLE: Duration = Duration::from_secs(5);
const SESSION_HARD_CAP: Duration = Duration::from_secs(15 * 60);
const POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct MjpegServer {
    store: Arc<EventStore>,
    frame_pair: Arc<FramePair>,
    ring: RwLock<Arc<Ring>>,
    motion_detector: Arc<MotionDetector>,
    logger: Arc<Logger>,
    config: StreamingConfig,
    normal_interval_millis: u64,
    stream_interval_millis: u64,
    running: Arc<std::sync::atomic::AtomicBool>,
    monitor_thread: Mutex<Option<thread::JoinHandle<()>>>,
    active_clients: Arc<AtomicUsize>,
    shutdown_generation: Arc<AtomicU64>,
}

impl MjpegServer {
    pub fn new(
        store: Arc<EventStore>,
        frame_pair: Arc<FramePair>,
        ring: Arc<Ring>,
        motion_detector: Arc<MotionDetector>,
        logger: Arc<Logger>,
        config: &Config,
    ) -> Arc<Self> {
        Arc::new(MjpegServer {
            store,
            frame_pair,
            ring: RwLock::new(ring),
            motion_detector,
            logger,
            config: config.streaming.clone(),
            normal_interval_millis: config.capture.picture_capture_interval_ms,
            stream_interval_millis: config.capture.livestream_capture_interval_ms,
            running: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            monitor_thread: Mutex::new(None),
            active_clients: Arc::new(AtomicUsize::new(0)),
            shutdown_generation: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Watchdog recovery (§4.9.d): G mutates `ring.capture_interval_millis`
    /// while entering/leaving stream mode, so it must be rebound to the new
    /// ring like every other A-referencing worker.
    pub fn rebind(&self, new_ring: Arc<Ring>) {
        *self.ring.write().unwrap() = new_ring;
    }

    /// The ring currently bound, post-recovery if one has occurred.
    pub fn current_ring(&self) -> Arc<Ring> {
        self.ring.read().unwrap().clone()
    }

    pub fn start(this: &Arc<Self>) {
        this.running.store(true, Ordering::SeqCst);
        let server = Arc::clone(this);
        let handle = thread::Builder::new()
            .name("MJPEGMonitor".to_string())
            .spawn(move || server.monitor_loop())
            .expect("failed to spawn MJPEGMonitor thread");
        *this.monitor_thread.lock().unwrap() = Some(handle);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.monitor_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    fn monitor_loop(self: Arc<Self>) {
        self.logger.info("MJPEG streaming-flag monitor started");
        let mut listener: Option<TcpListener> = None;
        let mut session_started: Option<Instant> = None;

        while self.running.load(Ordering::SeqCst) {
            let streaming = or_sentinel(self.store.get_streaming_flag(), false, "get_streaming_flag");

            if streaming && listener.is_none() {
                match TcpListener::bind(("0.0.0.0", self.config.port)) {
                    Ok(l) => {
                        l.set_nonblocking(true).ok();
                        self.logger
                            .info(format!("MJPEG stream starting on port {}", self.config.port));
                        self.ring
                            .read()
                            .unwrap()
                            .capture_interval_millis
                            .store(self.stream_interval_millis, Ordering::SeqCst);
                        self.motion_detector.pause();
                        self.active_clients.store(0, Ordering::SeqCst);
                        session_started = Some(Instant::now());
                        listener = Some(l);
                    }
                    Err(e) => {
                        self.logger.error(format!("failed to bind MJPEG server: {e}"));
                        let _ = self.store.set_streaming_flag(false);
                    }
                }
            } else if !streaming && listener.is_some() {
                self.stop_streaming(&mut listener, &mut session_started);
            }

            if let Some(l) = &listener {
                Self::accept_pending(&self, l);

                if let Some(started) = session_started {
                    if started.elapsed() >= SESSION_HARD_CAP {
                        self.logger.warn("MJPEG session hit the 15-minute hard cap");
                        let _ = self.store.set_streaming_flag(false);
                        self.stop_streaming(&mut listener, &mut session_started);
                    }
                }
            }

            thread::sleep(POLL_INTERVAL);
        }

        if listener.is_some() {
            self.stop_streaming(&mut listener, &mut session_started);
        }
        self.logger.info("MJPEG streaming-flag monitor stopped");
    }

    fn stop_streaming(&self, listener: &mut Option<TcpListener>, session_started: &mut Option<Instant>) {
        *listener = None;
        *session_started = None;
        self.ring
            .read()
            .unwrap()
            .capture_interval_millis
            .store(self.normal_interval_millis, Ordering::SeqCst);
        self.motion_detector.resume();
        self.logger.info("MJPEG stream stopped");
    }

    fn accept_pending(this: &Arc<Self>, listener: &TcpListener) {
        loop {
            match listener.accept() {
                Ok((stream, _addr)) => {
                    let server = Arc::clone(this);
                    thread::Builder::new()
                        .name("MJPEGClientHandler".to_string())
                        .spawn(move || server.handle_client(stream))
                        .ok();
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
    }

    fn handle_client(self: Arc<Self>, stream: TcpStream) {
        let Some(path) = read_request_path(&stream) else {
            return;
        };

        if path != "/stream.mjpg" {
            let _ = write_404(&stream);
            return;
        }

        self.client_connected();
        let result = self.serve_mjpeg_stream(stream);
        if let Err(e) = result {
            let gone = crate::error::Error::StreamClientGone;
            self.logger.info(format!("{gone}: {e}"));
        }
        Self::client_disconnected(&self);
    }

    fn serve_mjpeg_stream(&self, mut stream: TcpStream) -> std::io::Result<()> {
        write!(
            stream,
            "HTTP/1.1 200 OK\r\n\
             Age: 0\r\n\
             Cache-Control: no-cache, private\r\n\
             Pragma: no-cache\r\n\
             Content-Type: multipart/x-mixed-replace; boundary=FRAME\r\n\r\n"
        )?;

        let frame_delay = Duration::from_secs_f64(1.0 / self.config.framerate.max(1) as f64);

        loop {
            let Some(frame) = self.frame_pair.current_for_stream() else {
                thread::sleep(frame_delay);
                continue;
            };

            let mut jpeg_bytes = Vec::new();
            let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(
                &mut jpeg_bytes,
                self.config.jpeg_quality,
            );
            if encoder.encode_image(&frame.image).is_err() {
                thread::sleep(frame_delay);
                continue;
            }

            write!(
                stream,
                "--FRAME\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
                jpeg_bytes.len()
            )?;
            stream.write_all(&jpeg_bytes)?;
            stream.write_all(b"\r\n")?;

            thread::sleep(frame_delay);
        }
    }

    /// Deferred-shutdown-on-idle (§4.8): a disconnect schedules a check 5 s
    /// later; if the count is still zero then, the streaming flag is reset.
    /// A reconnect within the window bumps `shutdown_generation`, so the
    /// stale timer's own generation check fails and it does nothing.
    fn client_connected(&self) {
        self.active_clients.fetch_add(1, Ordering::SeqCst);
        self.shutdown_generation.fetch_add(1, Ordering::SeqCst);
    }

    fn client_disconnected(this: &Arc<Self>) {
        let remaining = this.active_clients.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 {
            let generation = this.shutdown_generation.fetch_add(1, Ordering::SeqCst) + 1;
            let server = Arc::clone(this);
            thread::spawn(move || {
                thread::sleep(AUTO_SHUTDOWN_IDLE);
                if server.shutdown_generation.load(Ordering::SeqCst) == generation
                    && server.active_clients.load(Ordering::SeqCst) == 0
                {
                    let _ = server.store.set_streaming_flag(false);
                }
            });
        }
    }
}

fn read_request_path(stream: &TcpStream) -> Option<String> {
    let mut reader = BufReader::new(stream.try_clone().ok()?);
    let mut line = String::new();
    reader.read_line(&mut line).ok()?;
    // "GET /stream.mjpg?x=1 HTTP/1.1"
    let mut parts = line.split_whitespace();
    parts.next()?;
    let raw_path = parts.next()?;
    let path = raw_path.split('?').next().unwrap_or(raw_path);
    Some(path.to_string())
}

fn write_404(mut stream: &TcpStream) -> std::io::Result<()> {
    stream.write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n")
}
