//! Memory-device logging - double-buffered log stream to disk.
//!
//! The device reader pushes `USER_SPACE_DATA` fields into a [`LogPipeline`]
//! (it is a [`DataSink`]). A dedicated writer thread drains full slots to
//! per-processor files:
//!
//! ```text
//! reader ──fill──► [slot 0 | slot 1] ──ready──► writer ──64K chunks──► diag_log_*.qmdl
//!        ◄──free──                   ◄─release─
//! ```
//!
//! Shutdown runs in three phases:
//! 1. [`LogPipeline::request_flush`] stops accepting data
//! 2. [`LogPipeline::hand_over`] passes the reader's partial slot to the writer
//! 3. [`LogPipeline::wait_flushed`] waits for the writer to drain and close
//!    its files, then empties both slots
//!
//! A flushed pipeline accepts no more data.
//!
//! # Example
//!
//! ```
//! use diag_transport::config::LoggingConfig;
//! use diag_transport::mdlog::LogPipeline;
//! use diag_transport::mux::DataSink;
//! use std::time::Duration;
//!
//! let dir = tempfile::tempdir().unwrap();
//! let config = LoggingConfig {
//!     output_dir: dir.path().to_path_buf(),
//!     ..Default::default()
//! };
//!
//! let pipeline = LogPipeline::start(&config).unwrap();
//! pipeline.accept(0, b"log packet");
//! pipeline.flush(Duration::from_secs(5)).unwrap();
//!
//! assert_eq!(pipeline.log_files(0).unwrap().len(), 1);
//! ```

mod double_buffer;
mod files;

pub use double_buffer::FlushPhase;
pub use files::{
    list_log_files, proc_dir, HDLC_EXTENSION, LOG_FILE_PREFIX, MAX_FILES_IN_LIST,
    NON_HDLC_EXTENSION,
};

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::LoggingConfig;
use crate::error::{DiagError, Result};
use crate::mux::DataSink;
use crate::protocol::qsr::{Guid, QshrinkHeader};

use double_buffer::DoubleBuffer;
use files::LogFiles;

/// Default wait for the writer during shutdown.
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(30);

/// Double-buffered disk logger with its writer thread.
pub struct LogPipeline {
    buffer: Arc<DoubleBuffer>,
    output_dir: PathBuf,
    hdlc_enabled: Arc<AtomicBool>,
    qshrink: Arc<Mutex<QshrinkHeader>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl LogPipeline {
    /// Create the output directory and start the writer thread.
    pub fn start(config: &LoggingConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.output_dir)?;

        let buffer = Arc::new(DoubleBuffer::new(config.disk_buf_size));
        let hdlc_enabled = Arc::new(AtomicBool::new(config.hdlc_enabled));
        let qshrink = Arc::new(Mutex::new(QshrinkHeader::new()));
        let files = LogFiles::new(config, Arc::clone(&hdlc_enabled), Arc::clone(&qshrink));

        let writer = {
            let buffer = Arc::clone(&buffer);
            std::thread::Builder::new()
                .name("diag-disk-writer".into())
                .spawn(move || write_to_disk(buffer, files))?
        };
        tracing::debug!(
            "Disk logging to {} ({} byte regions)",
            config.output_dir.display(),
            buffer.region_size()
        );

        Ok(Self {
            buffer,
            output_dir: config.output_dir.clone(),
            hdlc_enabled,
            qshrink,
            writer: Mutex::new(Some(writer)),
        })
    }

    /// Record a database GUID for the header of `.qmdl2` files opened from
    /// now on.
    pub fn add_guid(&self, guid: Guid) {
        self.qshrink.lock().add_guid(guid);
    }

    #[inline]
    pub fn hdlc_enabled(&self) -> bool {
        self.hdlc_enabled.load(Ordering::Acquire)
    }

    pub fn phase(&self) -> FlushPhase {
        self.buffer.phase()
    }

    /// Phase 1: stop accepting data.
    pub fn request_flush(&self) {
        self.buffer.request_flush();
    }

    /// Phase 2: hand the partially filled slot to the writer. Called by the
    /// reader once it has stopped.
    pub fn hand_over(&self) {
        self.buffer.hand_over();
    }

    /// Phase 3: wait for the writer to drain, then empty both slots.
    ///
    /// Returns `false` if the writer did not finish within `timeout`.
    pub fn wait_flushed(&self, timeout: Duration) -> bool {
        if !self.buffer.wait_drained(timeout) {
            tracing::error!("Disk writer did not drain within {:?}", timeout);
            return false;
        }
        if let Some(writer) = self.writer.lock().take() {
            if writer.join().is_err() {
                tracing::error!("Disk writer thread panicked");
            }
        }
        self.buffer.reset();
        true
    }

    /// Run all three phases from one thread. Use when no reader is feeding
    /// the pipeline.
    pub fn flush(&self, timeout: Duration) -> Result<()> {
        self.request_flush();
        self.hand_over();
        if self.wait_flushed(timeout) {
            Ok(())
        } else {
            Err(DiagError::Timeout("disk writer".into()))
        }
    }

    /// Log files currently on disk for processor `proc`, oldest first.
    pub fn log_files(&self, proc: usize) -> Result<Vec<PathBuf>> {
        let dir = proc_dir(&self.output_dir, proc);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        Ok(list_log_files(&dir)?
            .into_iter()
            .map(|name| dir.join(name))
            .collect())
    }
}

impl DataSink for LogPipeline {
    fn accept(&self, proc: usize, data: &[u8]) {
        self.buffer.fill(proc, data);
    }

    fn set_hdlc(&self, enabled: bool) {
        self.hdlc_enabled.store(enabled, Ordering::Release);
    }
}

impl Drop for LogPipeline {
    fn drop(&mut self) {
        if self.phase() < FlushPhase::Drained {
            if let Err(e) = self.flush(DEFAULT_FLUSH_TIMEOUT) {
                tracing::warn!("Log pipeline dropped unflushed: {}", e);
            }
        }
    }
}

fn write_to_disk(buffer: Arc<DoubleBuffer>, mut files: LogFiles) {
    tracing::debug!("Disk writer started");
    while let Some((index, regions)) = buffer.next_ready() {
        for (proc, region) in regions.iter().enumerate() {
            if region.is_empty() {
                continue;
            }
            if let Err(e) = files.write_region(proc, region) {
                tracing::error!(
                    "Dropping {} bytes of processor {} log data: {}",
                    region.len(),
                    proc,
                    e
                );
            }
        }
        buffer.release(index, regions);
    }
    files.close_all();
    buffer.finish();
    tracing::debug!("Disk writer drained");
}
