//! Log files on disk: naming, rotation and circular deletion.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::LoggingConfig;
use crate::error::Result;
use crate::protocol::qsr::QshrinkHeader;
use crate::protocol::stream::{NUM_PROC, PROC_NAMES};

/// Prefix of every log file name.
pub const LOG_FILE_PREFIX: &str = "diag_log_";

/// Extension of HDLC framed logs.
pub const HDLC_EXTENSION: &str = "qmdl";

/// Extension of logs written with HDLC disabled.
pub const NON_HDLC_EXTENSION: &str = "qmdl2";

/// Entries kept in a cached directory listing.
pub const MAX_FILES_IN_LIST: usize = 100;

/// `errno` of a full disk.
const ENOSPC: i32 = 28;

pub(crate) fn is_out_of_space(err: &io::Error) -> bool {
    err.raw_os_error() == Some(ENOSPC)
}

/// Directory holding processor `proc`'s logs.
pub fn proc_dir(output_dir: &Path, proc: usize) -> PathBuf {
    match PROC_NAMES.get(proc) {
        Some(name) if !name.is_empty() => output_dir.join(name.trim_start_matches('/')),
        _ => output_dir.to_path_buf(),
    }
}

/// Sorted log file names in `dir`.
pub fn list_log_files(dir: &Path) -> io::Result<Vec<String>> {
    let mut names: Vec<String> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| name.starts_with(LOG_FILE_PREFIX))
        .collect();
    names.sort();
    Ok(names)
}

/// `diag_log_<YYYYmmdd_HHMMSS><epoch ms>`, never repeating an earlier stamp.
fn file_stem(last_ms: &mut i64) -> String {
    let now = chrono::Local::now();
    let ms = now.timestamp_millis().max(*last_ms + 1);
    *last_ms = ms;
    format!("{}{}{}", LOG_FILE_PREFIX, now.format("%Y%m%d_%H%M%S"), ms)
}

struct OpenFile {
    file: File,
    path: PathBuf,
    written: u64,
}

/// Oldest-first listing of a directory, rebuilt when used up.
#[derive(Default)]
struct OldestFiles {
    names: VecDeque<String>,
}

impl OldestFiles {
    fn next(&mut self, dir: &Path) -> Option<String> {
        if self.names.is_empty() {
            match list_log_files(dir) {
                Ok(names) => {
                    tracing::debug!("Listed {} log files in {}", names.len(), dir.display());
                    self.names = names.into_iter().take(MAX_FILES_IN_LIST).collect();
                }
                Err(e) => {
                    tracing::error!("Unable to list {}: {}", dir.display(), e);
                    return None;
                }
            }
        }
        self.names.pop_front()
    }
}

#[derive(Default)]
struct ProcFiles {
    current: Option<OpenFile>,
    oldest: OldestFiles,
    /// Log files in the directory, counted on first use.
    count: Option<usize>,
    last_ms: i64,
}

/// Per-processor log files, owned by the disk writer.
pub(crate) struct LogFiles {
    output_dir: PathBuf,
    max_file_size: u64,
    min_file_size: u64,
    max_file_count: usize,
    write_chunk: usize,
    hdlc_enabled: Arc<AtomicBool>,
    qshrink: Arc<Mutex<QshrinkHeader>>,
    procs: Vec<ProcFiles>,
}

impl LogFiles {
    pub fn new(
        config: &LoggingConfig,
        hdlc_enabled: Arc<AtomicBool>,
        qshrink: Arc<Mutex<QshrinkHeader>>,
    ) -> Self {
        Self {
            output_dir: config.output_dir.clone(),
            max_file_size: config.max_file_size,
            min_file_size: config.min_file_size,
            max_file_count: config.max_file_count,
            write_chunk: config.write_chunk.max(1),
            hdlc_enabled,
            qshrink,
            procs: (0..NUM_PROC).map(|_| ProcFiles::default()).collect(),
        }
    }

    #[inline]
    fn circular(&self) -> bool {
        self.max_file_count > 1
    }

    /// Write one buffered region, rotating once the file is full.
    pub fn write_region(&mut self, proc: usize, data: &[u8]) -> Result<()> {
        for chunk in data.chunks(self.write_chunk) {
            self.write_chunk(proc, chunk)?;
        }
        let full = self.procs[proc]
            .current
            .as_ref()
            .map_or(false, |f| f.written >= self.max_file_size);
        if full {
            tracing::debug!("Rotating log file of processor {}", proc);
            self.close(proc);
        }
        Ok(())
    }

    fn write_chunk(&mut self, proc: usize, chunk: &[u8]) -> Result<()> {
        let mut retried = false;
        loop {
            self.ensure_open(proc)?;
            let Some(current) = self.procs[proc].current.as_mut() else {
                return Ok(());
            };
            match current.file.write_all(chunk) {
                Ok(()) => {
                    current.written += chunk.len() as u64;
                    return Ok(());
                }
                Err(e) if is_out_of_space(&e) && !retried => {
                    tracing::warn!("Disk full writing {}", current.path.display());
                    retried = true;
                    self.make_room(proc)?;
                }
                Err(e) => {
                    tracing::error!("Error writing log file: {}", e);
                    return Err(e.into());
                }
            }
        }
    }

    /// Delete the oldest file and, if the current file is big enough, close
    /// it so the retry starts a new one.
    fn make_room(&mut self, proc: usize) -> Result<()> {
        if !self.delete_oldest(proc) {
            return Err(io::Error::from_raw_os_error(ENOSPC).into());
        }
        let big_enough = self.procs[proc]
            .current
            .as_ref()
            .map_or(false, |f| f.written > self.min_file_size);
        if big_enough {
            self.close(proc);
        } else {
            tracing::warn!("Disk full, continuing with the same file for processor {}", proc);
        }
        Ok(())
    }

    fn ensure_open(&mut self, proc: usize) -> Result<()> {
        if self.procs[proc].current.is_some() {
            return Ok(());
        }
        let dir = proc_dir(&self.output_dir, proc);
        fs::create_dir_all(&dir)?;

        if self.procs[proc].count.is_none() {
            let existing = list_log_files(&dir).map(|n| n.len()).unwrap_or(0);
            self.procs[proc].count = Some(existing);
        }
        if self.circular() {
            while self.procs[proc].count.unwrap_or(0) >= self.max_file_count {
                tracing::debug!(
                    "Log file count reached {}, deleting oldest",
                    self.max_file_count
                );
                if !self.delete_oldest(proc) {
                    break;
                }
            }
        }

        let hdlc = self.hdlc_enabled.load(Ordering::Acquire);
        let extension = if hdlc { HDLC_EXTENSION } else { NON_HDLC_EXTENSION };
        let stem = file_stem(&mut self.procs[proc].last_ms);
        let path = dir.join(format!("{}.{}", stem, extension));
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        tracing::debug!("Created log file {}", path.display());

        let mut written = 0;
        if !hdlc {
            let mut header = Vec::new();
            self.qshrink.lock().encode_into(&mut header);
            file.write_all(&header)?;
            written = header.len() as u64;
        }

        let entry = &mut self.procs[proc];
        entry.count = Some(entry.count.unwrap_or(0) + 1);
        entry.current = Some(OpenFile {
            file,
            path,
            written,
        });
        Ok(())
    }

    /// Delete the oldest log file of `proc`. The file in use is never
    /// deleted.
    fn delete_oldest(&mut self, proc: usize) -> bool {
        let dir = proc_dir(&self.output_dir, proc);
        let entry = &mut self.procs[proc];
        let Some(name) = entry.oldest.next(&dir) else {
            tracing::warn!("No log file to delete in {}", dir.display());
            return false;
        };
        let path = dir.join(&name);
        if entry.current.as_ref().map_or(false, |f| f.path == path) {
            tracing::warn!("Cannot delete {}, file is in use", path.display());
            return false;
        }
        match fs::remove_file(&path) {
            Ok(()) => {
                tracing::debug!("Deleted log file {}", path.display());
                entry.count = Some(entry.count.unwrap_or(1).saturating_sub(1));
                true
            }
            Err(e) => {
                tracing::error!("Unable to delete {}: {}", path.display(), e);
                false
            }
        }
    }

    fn close(&mut self, proc: usize) {
        if let Some(mut current) = self.procs[proc].current.take() {
            if let Err(e) = current.file.flush() {
                tracing::warn!("Error flushing {}: {}", current.path.display(), e);
            }
            tracing::debug!(
                "Closed {} after {} bytes",
                current.path.display(),
                current.written
            );
        }
    }

    pub fn close_all(&mut self) {
        for proc in 0..self.procs.len() {
            self.close(proc);
        }
    }

    #[cfg(test)]
    fn current_path(&self, proc: usize) -> Option<&Path> {
        self.procs[proc].current.as_ref().map(|f| f.path.as_path())
    }
}
