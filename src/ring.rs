//! Bounded Chunk Ring (A) and the Capture Worker (C) it owns.
//!
//! The ring is written by one producer (the encoder callback, driver-owned)
//! and read by at most one consumer at a time. A single mutex around the
//! deque is sufficient given encoder chunk rates of tens to low hundreds per
//! second (§4.1).
//!
//! The Capture Worker lives here, not in its own top-level module, because
//! the bring-up order in §4.10 constructs it as part of `Ring::start` - it
//! shares the camera driver handle that the ring itself owns, and the
//! watchdog tears both down together during recovery (§4.9).
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use crate::camera::{CameraDriver, ChunkSink, EncoderHandle};
use crate::chunk::Chunk;
use crate::frame_pair::FramePair;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    CriticallyLow,
    Low,
    Filling,
    Optimal,
}

#[derive(Debug, Clone, Copy)]
pub struct BufferHealth {
    pub current: usize,
    pub max: usize,
    pub utilization_pct: f64,
    pub evictions: u64,
    pub status: HealthStatus,
}

impl BufferHealth {
    fn from(current: usize, max: usize, evictions: u64) -> Self {
        let utilization_pct = if max == 0 {
            0.0
        } else {
            100.0 * current as f64 / max as f64
        };
        let status = if utilization_pct >= 80.0 {
            HealthStatus::Optimal
        } else if utilization_pct >= 50.0 {
            HealthStatus::Filling
        } else if utilization_pct >= 30.0 {
            HealthStatus::Low
        } else {
            HealthStatus::CriticallyLow
        };
        BufferHealth {
            current,
            max,
            utilization_pct,
            evictions,
            status,
        }
    }
}

struct RingInner {
    chunks: VecDeque<Chunk>,
    evictions: u64,
    total_bytes: u64,
}

/// Fixed-capacity FIFO of encoder output chunks.
pub struct Ring {
    inner: Mutex<RingInner>,
    max_chunks: usize,
    max_bytes: u64,
    /// Watchdog's primary liveness signal, stamped by the capture worker.
    /// Unix millis so it can be read/written without a lock.
    pub last_frame_at_millis: AtomicU64,
    /// Mutated by the MJPEG server when entering/leaving stream mode;
    /// polled by the capture worker's sleep tick (§4.3).
    pub capture_interval_millis: AtomicU64,
    capture_running: Arc<AtomicBool>,
    capture_thread: Mutex<Option<thread::JoinHandle<()>>>,
    encoder_handle: Mutex<Option<EncoderHandle>>,
}

impl ChunkSink for Ring {
    fn append(&self, chunk: Chunk) {
        let mut inner = self.inner.lock().unwrap();
        let size = chunk.len() as u64;
        while inner.chunks.len() >= self.max_chunks
            || (self.max_bytes > 0 && inner.total_bytes + size > self.max_bytes)
        {
            let Some(evicted) = inner.chunks.pop_front() else {
                break;
            };
            inner.total_bytes -= evicted.len() as u64;
            inner.evictions += 1;
        }
        inner.total_bytes += size;
        inner.chunks.push_back(chunk);
    }
}

impl Ring {
    pub fn new(max_chunks: usize, max_bytes: u64, normal_interval: Duration) -> Arc<Self> {
        Arc::new(Ring {
            inner: Mutex::new(RingInner {
                chunks: VecDeque::new(),
                evictions: 0,
                total_bytes: 0,
            }),
            max_chunks,
            max_bytes,
            last_frame_at_millis: AtomicU64::new(now_millis()),
            capture_interval_millis: AtomicU64::new(normal_interval.as_millis() as u64),
            capture_running: Arc::new(AtomicBool::new(false)),
            capture_thread: Mutex::new(None),
            encoder_handle: Mutex::new(None),
        })
    }

    /// Shallow, read-only FIFO-order view. Cloning a `Chunk` clones only the
    /// `Arc<[u8]>` handle, never the bytes.
    pub fn snapshot(&self) -> Vec<Chunk> {
        let inner = self.inner.lock().unwrap();
        inner.chunks.iter().cloned().collect()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.chunks.clear();
        inner.total_bytes = 0;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn health(&self) -> BufferHealth {
        let inner = self.inner.lock().unwrap();
        BufferHealth::from(inner.chunks.len(), self.max_chunks, inner.evictions)
    }

    pub fn last_frame_age(&self) -> Duration {
        let last = self.last_frame_at_millis.load(Ordering::SeqCst);
        let now = now_millis();
        Duration::from_millis(now.saturating_sub(last))
    }

    /// Starts the camera's encoder (appending directly into this ring) and
    /// the Capture Worker thread (pushing stills into `frame_pair`), per the
    /// bring-up order in §4.10: "construct A (start camera + encoder +
    /// capture worker C as part of A.start)".
    pub fn start(
        this: &Arc<Self>,
        driver: Arc<dyn CameraDriver>,
        frame_pair: Arc<FramePair>,
    ) -> crate::error::Result<()> {
        let sink: Arc<dyn ChunkSink> = this.clone();
        let encoder_handle = driver.start_encoder(sink)?;
        *this.encoder_handle.lock().unwrap() = Some(encoder_handle);

        this.capture_running.store(true, Ordering::SeqCst);
        let ring = Arc::clone(this);
        let running = Arc::clone(&this.capture_running);
        let thread = thread::Builder::new()
            .name("CaptureWorker".to_string())
            .spawn(move || run_capture_worker(ring, driver, frame_pair, running))
            .expect("failed to spawn CaptureWorker thread");
        *this.capture_thread.lock().unwrap() = Some(thread);
        Ok(())
    }

    pub fn stop(&self) {
        self.capture_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.capture_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        *self.encoder_handle.lock().unwrap() = None;
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Responsive-sleep capture loop (§4.3): reads `capture_interval_millis` in
/// <=50ms ticks so a mid-sleep interval change (driven by the MJPEG server
/// entering/leaving stream mode) takes effect within 100ms.
fn run_capture_worker(
    ring: Arc<Ring>,
    driver: Arc<dyn CameraDriver>,
    frame_pair: Arc<FramePair>,
    running: Arc<AtomicBool>,
) {
    const TICK: Duration = Duration::from_millis(50);

    while running.load(Ordering::SeqCst) {
        match driver.capture_preview_frame() {
            Ok(frame) => {
                ring.last_frame_at_millis.store(now_millis(), Ordering::SeqCst);
                frame_pair.push(frame);
            }
            Err(e) => {
                log::warn!("capture worker: frame capture failed: {e}");
            }
        }

        let target = Duration::from_millis(ring.capture_interval_millis.load(Ordering::SeqCst));
        let mut slept = Duration::ZERO;
        while slept < target && running.load(Ordering::SeqCst) {
            let current_target =
                Duration::from_millis(ring.capture_interval_millis.load(Ordering::SeqCst));
            if current_target != target {
                break;
            }
            let remaining = target.saturating_sub(slept);
            let step = remaining.min(TICK);
            thread::sleep(step);
            slept += step;
        }
    }
}
