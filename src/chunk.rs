//! Encoder output chunk.
//!
//! Grounded on `VideoFrame`/`VideoFrameKind` in
//! `raspberry_pi/rpi_camera.rs`, collapsed to the `{bytes, is_keyframe,
//! produced_at}` shape the ring actually needs (the distinction between SPS,
//! PPS, and non-IDR frames only matters to the keyframe-scan step, so it is
//! folded into a single `is_keyframe` bit here rather than kept as a kind
//! enum).
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use std::sync::Arc;
use std::time::SystemTime;

/// One encoder output unit. `bytes` is reference-counted so that ring
/// snapshots can hand out cheap clones without copying payloads (§4.1:
/// "Snapshot must copy the chunk handles... never the byte payloads").
#[derive(Clone, Debug)]
pub struct Chunk {
    pub bytes: Arc<[u8]>,
    pub is_keyframe: bool,
    pub produced_at: SystemTime,
}

impl Chunk {
    pub fn new(bytes: Vec<u8>, is_keyframe: bool) -> Self {
        Chunk {
            bytes: Arc::from(bytes),
            is_keyframe,
            produced_at: SystemTime::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// NAL unit type extracted from an Annex-B H.264 elementary stream, used by
/// the camera driver to classify chunks before handing them to the ring.
/// Start-code scanning is ported from `rpi_dual_stream.rs::extract_h264_frame`.
pub fn is_keyframe_nal(nal_header_byte: u8) -> bool {
    // IDR slice (type 5). SPS (7) and PPS (8) are also keyframe-aligned in
    // the sense that a dump beginning there is immediately decodable, but in
    // practice the encoder always emits SPS/PPS immediately before an IDR,
    // so treating only type 5 as the keyframe boundary matches the
    // keyframe-scan semantics described in §4.7.
    (nal_header_byte & 0x1F) == 5
}
