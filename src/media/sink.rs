// SPDX-License-Identifier: GPL-3.0-only

//! Encoded packet output
//!
//! The sink runs on the encode thread. Every packet is written in full and
//! flushed before the callback returns, because the packet memory belongs to
//! the encoder and is reused as soon as the callback ends.

use crate::constants::{STDOUT_OUTPUT, STREAM_FILE_EXTENSION};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{error, info, warn};

/// Counters for one sink
#[derive(Debug, Default)]
pub struct SinkStats {
    packets_written: AtomicU64,
    bytes_written: AtomicU64,
    write_errors: AtomicU64,
}

impl SinkStats {
    pub fn packets_written(&self) -> u64 {
        self.packets_written.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    pub fn write_errors(&self) -> u64 {
        self.write_errors.load(Ordering::Relaxed)
    }
}

/// Writes encoded packets to stdout, a file, or any writer
pub struct PacketSink {
    writer: Box<dyn Write + Send>,
    destination: String,
    stats: Arc<SinkStats>,
}

impl PacketSink {
    pub fn stdout() -> Self {
        Self::from_writer("stdout", io::stdout())
    }

    pub fn from_writer(
        destination: impl Into<String>,
        writer: impl Write + Send + 'static,
    ) -> Self {
        Self {
            writer: Box::new(writer),
            destination: destination.into(),
            stats: Arc::new(SinkStats::default()),
        }
    }

    /// Sink for an output argument: `-` for stdout, a directory for a new
    /// timestamped file inside it, anything else for a file path
    pub fn open(output: &str) -> io::Result<Self> {
        if output == STDOUT_OUTPUT {
            return Ok(Self::stdout());
        }

        let path = Path::new(output);
        let path = if path.is_dir() {
            timestamped_path(path)
        } else {
            path.to_path_buf()
        };

        let file = File::create(&path)?;
        info!(path = %path.display(), "Writing encoded stream to file");
        Ok(Self::from_writer(
            path.display().to_string(),
            BufWriter::new(file),
        ))
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Shared handle to this sink's counters, usable after the sink has
    /// moved into a packet handler
    pub fn stats(&self) -> Arc<SinkStats> {
        Arc::clone(&self.stats)
    }

    /// Write one packet completely and flush it.
    ///
    /// Failures are logged and counted; they never propagate to the encoder.
    pub fn write_packet(&mut self, data: &[u8]) {
        let result = self
            .writer
            .write_all(data)
            .and_then(|()| self.writer.flush());
        match result {
            Ok(()) => {
                self.stats.packets_written.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .bytes_written
                    .fetch_add(data.len() as u64, Ordering::Relaxed);
            }
            Err(e) => {
                let failures = self.stats.write_errors.fetch_add(1, Ordering::Relaxed) + 1;
                if failures == 1 {
                    error!(destination = %self.destination, error = %e, "Failed to write packet");
                } else {
                    warn!(destination = %self.destination, failures, "Packet write failed again");
                }
            }
        }
    }

    /// Turn the sink into a packet callback
    pub fn into_handler(mut self) -> impl FnMut(&[u8]) + Send + 'static {
        move |data: &[u8]| self.write_packet(data)
    }
}

/// `capture_YYYYMMDD_HHMMSS.h264` inside `dir`
fn timestamped_path(dir: &Path) -> PathBuf {
    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    dir.join(format!("capture_{}.{}", timestamp, STREAM_FILE_EXTENSION))
}
