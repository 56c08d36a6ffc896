//! Logger (L): batched, non-blocking log sink.
//!
//! Grounded on `examples/original_source/logger.py`'s `DatabaseLogger`: logs
//! are queued in memory and a background thread flushes them to the event
//! store every `log_batch_interval` seconds, "to reduce SD card writes from
//! hundreds per minute to ~12 per minute." Every call also emits through the
//! `log` crate immediately (console, via `env_logger`) for real-time
//! monitoring, mirroring the Python version's immediate `print`.
//!
//! Per Design Notes §9 ("Global logger singleton: replace with a logger
//! handle created at orchestrator init, passed by reference to every
//! worker"), this crate never reaches for a global/static logger: one
//! `Logger` is constructed in `main` and handed to every worker as an `Arc`.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use crate::store::EventStore;
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

pub struct Logger {
    sender: std::sync::Mutex<Option<Sender<LogRecord>>>,
    writer_thread: std::sync::Mutex<Option<thread::JoinHandle<()>>>,
}

impl Logger {
    /// Spawns the background batch-writer thread immediately; the returned
    /// `Logger` is ready to use. Lifecycle: create before A, drop after H.
    pub fn start(store: Arc<EventStore>, batch_interval: Duration) -> Arc<Self> {
        let (sender, receiver) = bounded::<LogRecord>(4096);
        let writer_thread = thread::Builder::new()
            .name("LogWriter".to_string())
            .spawn(move || batch_writer_loop(store, receiver, batch_interval))
            .expect("failed to spawn LogWriter thread");

        Arc::new(Logger {
            sender: std::sync::Mutex::new(Some(sender)),
            writer_thread: std::sync::Mutex::new(Some(writer_thread)),
        })
    }

    /// Non-blocking. Queues for batch writing and immediately emits through
    /// the `log` crate for the console.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        let timestamp = Utc::now();

        match level {
            LogLevel::Info => log::info!("{message}"),
            LogLevel::Warning => log::warn!("{message}"),
            LogLevel::Error => log::error!("{message}"),
        }

        if let Some(sender) = self.sender.lock().unwrap().as_ref() {
            let _ = sender.send(LogRecord {
                timestamp,
                level,
                message,
            });
        }
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warning, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message);
    }

    /// Drops the sending half (so the writer thread's channel closes,
    /// flushing and then exiting) and joins it.
    pub fn stop(&self) {
        self.sender.lock().unwrap().take();
        if let Some(handle) = self.writer_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

fn batch_writer_loop(store: Arc<EventStore>, receiver: Receiver<LogRecord>, interval: Duration) {
    loop {
        let mut batch = Vec::new();
        match receiver.recv_timeout(interval) {
            Ok(record) => batch.push(record),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
        while let Ok(record) = receiver.try_recv() {
            batch.push(record);
        }
        if !batch.is_empty() {
            if let Err(e) = store.add_log_batch(&batch) {
                eprintln!("error writing log batch to event store: {e}");
            }
        }
    }
    // Final drain after disconnect, matching logger.py's stop()-time flush.
    let mut remaining = Vec::new();
    while let Ok(record) = receiver.try_recv() {
        remaining.push(record);
    }
    if !remaining.is_empty() {
        let _ = store.add_log_batch(&remaining);
    }
}
