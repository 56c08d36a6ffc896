//! Error kinds for the daemon.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use std::path::PathBuf;

/// Errors discriminated by kind because callers branch on them: some are
/// fatal at startup, some are watchdog-recovered, some are warnings logged
/// and otherwise ignored.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("camera unavailable: {0}")]
    CameraUnavailable(String),

    #[error("encoder stall: no frames received for longer than the liveness timeout")]
    EncoderStall,

    #[error("ring exhausted: {evictions} evictions against a capacity of {max_chunks} chunks")]
    RingExhausted { evictions: u64, max_chunks: usize },

    #[error("no keyframe found in ring snapshot")]
    NoKeyframeInSnapshot,

    #[error("I/O error saving {path}: {source}")]
    SaveIoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("event store unavailable: {0}")]
    DbUnavailable(#[from] rusqlite::Error),

    #[error("stream client disconnected")]
    StreamClientGone,
}

pub type Result<T> = std::result::Result<T, Error>;
