//! Camera/encoder driver contract.
//!
//! The camera and its H.264 encoder are treated as an external collaborator:
//! assumed to expose frame-capture and H.264 encode-to-sink primitives (§1),
//! with a documented precondition that `clear()` on the output sink does not
//! stop the encoder (§9). This module defines that contract as a trait plus
//! one concrete implementation.
//!
//! The concrete implementation generalizes `raspberry_pi/rpi_dual_stream.rs`'s
//! approach (spawn an external process,
//! read its stdout, scan Annex-B start codes) away from the Raspberry-Pi-
//! specific `rpicam-vid` invocation: the external commands are configurable,
//! so the same driver works with any capture utility that honors the same
//! stdout contract (raw Annex-B H.264 on one command, a single JPEG/PPM
//! still frame on the other).
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use crate::chunk::{is_keyframe_nal, Chunk};
use crate::error::{Error, Result};
use crate::frame_pair::Frame;
use bytes::BytesMut;
use std::io::{BufReader, Read};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

/// Sink the encoder callback appends chunks into. Implemented by the ring;
/// kept as a trait here so `camera.rs` does not need to depend on
/// `ring.rs`'s concrete type.
pub trait ChunkSink: Send + Sync {
    fn append(&self, chunk: Chunk);
}

/// A running encoder feed. Dropping or calling `stop` terminates the
/// subprocess and joins its reader thread.
pub struct EncoderHandle {
    running: Arc<AtomicBool>,
    child: Option<std::process::Child>,
    reader_thread: Option<thread::JoinHandle<()>>,
}

impl EncoderHandle {
    /// A handle for a driver that feeds its sink some other way (e.g. a test
    /// double appending chunks directly), with no subprocess or reader
    /// thread of its own to tear down.
    pub fn inert() -> Self {
        EncoderHandle {
            running: Arc::new(AtomicBool::new(true)),
            child: None,
            reader_thread: None,
        }
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        if let Some(handle) = self.reader_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for EncoderHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

pub trait CameraDriver: Send + Sync {
    /// Starts the camera and its H.264 encoder; every parsed chunk is
    /// handed to `sink.append`. Runs until the returned handle is dropped
    /// or stopped.
    fn start_encoder(&self, sink: Arc<dyn ChunkSink>) -> Result<EncoderHandle>;

    /// A single full-resolution capture suitable for B's periodic push.
    /// Does not need to be a fresh synchronous capture; the last decoded
    /// preview frame is acceptable.
    fn capture_preview_frame(&self) -> Result<Frame>;

    /// A fresh, synchronous, authoritative color still. Always bypasses
    /// whatever preview pipeline feeds `capture_preview_frame`, because the
    /// live preview may be a lower-fidelity or single-plane feed (§4.2).
    fn capture_color_still(&self) -> Result<Frame>;
}

/// Drives two external commands: one producing a raw Annex-B H.264
/// elementary stream on stdout (continuous), one producing a single still
/// frame per invocation (PPM on stdout, the simplest format `image` can
/// decode without guessing a container).
pub struct ProcessCameraDriver {
    pub encoder_command: String,
    pub still_command: String,
    pub width: u32,
    pub height: u32,
}

impl CameraDriver for ProcessCameraDriver {
    fn start_encoder(&self, sink: Arc<dyn ChunkSink>) -> Result<EncoderHandle> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.encoder_command)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::CameraUnavailable(format!("failed to start encoder: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::CameraUnavailable("encoder produced no stdout".to_string()))?;

        let running = Arc::new(AtomicBool::new(true));
        let running_for_thread = Arc::clone(&running);

        let reader_thread = thread::spawn(move || {
            let mut reader = BufReader::new(stdout);
            let mut buffer = BytesMut::with_capacity(1024 * 1024);
            let mut read_buf = [0u8; 8192];
            while running_for_thread.load(Ordering::SeqCst) {
                match reader.read(&mut read_buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        buffer.extend_from_slice(&read_buf[..n]);
                        while let Some(chunk) = extract_annex_b_chunk(&mut buffer) {
                            sink.append(chunk);
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        Ok(EncoderHandle {
            running,
            child: Some(child),
            reader_thread: Some(reader_thread),
        })
    }

    fn capture_preview_frame(&self) -> Result<Frame> {
        self.capture_color_still()
    }

    fn capture_color_still(&self) -> Result<Frame> {
        let output = Command::new("sh")
            .arg("-c")
            .arg(&self.still_command)
            .output()
            .map_err(|e| Error::CameraUnavailable(format!("still capture failed: {e}")))?;
        if !output.status.success() {
            return Err(Error::CameraUnavailable(
                "still capture command exited with failure".to_string(),
            ));
        }
        let image = image::load_from_memory(&output.stdout)
            .map_err(|e| Error::CameraUnavailable(format!("undecodable still frame: {e}")))?
            .to_rgb8();
        Ok(Frame { image })
    }
}

/// Scans `buffer` for one complete Annex-B NAL unit (delimited by the next
/// start code) and removes it from the buffer. Returns `None` if the buffer
/// does not yet contain a full unit. Ported from the parsing approach in
/// `raspberry_pi/rpi_dual_stream.rs::extract_h264_frame`, simplified since
/// this crate only needs the keyframe bit, not a typed SPS/PPS/IDR/non-IDR
/// distinction.
fn extract_annex_b_chunk(buffer: &mut BytesMut) -> Option<Chunk> {
    let start_code_len = if buffer.starts_with(&[0, 0, 0, 1]) {
        4
    } else if buffer.starts_with(&[0, 0, 1]) {
        3
    } else {
        return None;
    };
    if buffer.len() < start_code_len + 1 {
        return None;
    }

    let search_start = start_code_len;
    let next_start = buffer[search_start..]
        .windows(4)
        .position(|w| w == [0, 0, 0, 1])
        .map(|p| search_start + p)
        .or_else(|| {
            buffer[search_start..]
                .windows(3)
                .position(|w| w == [0, 0, 1])
                .map(|p| search_start + p)
        })?;

    let nal_unit = buffer.split_to(next_start);
    let nal_header = nal_unit[start_code_len];
    let is_keyframe = is_keyframe_nal(nal_header);
    Some(Chunk::new(nal_unit.to_vec(), is_keyframe))
}
