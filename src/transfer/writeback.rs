//! Single-slot handoff from the orchestrator to the file writer.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::Result;

use super::descriptor::DbFile;

struct Job {
    path: PathBuf,
    file: DbFile,
}

struct State {
    slot: Option<Job>,
    writing: bool,
    stopped: bool,
}

struct Shared {
    state: Mutex<State>,
    /// Signalled when a job is posted or the writer is stopped.
    posted: Condvar,
    /// Signalled when the writer took or finished a job.
    done: Condvar,
    written: AtomicUsize,
}

/// Writer thread persisting completed files.
pub(crate) struct WriteBack {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl WriteBack {
    pub fn start() -> Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                slot: None,
                writing: false,
                stopped: false,
            }),
            posted: Condvar::new(),
            done: Condvar::new(),
            written: AtomicUsize::new(0),
        });
        let thread = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("diag-db-writer".into())
                .spawn(move || write_loop(shared))?
        };
        Ok(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Hand `file` over, blocking while the previous one is still queued.
    /// Returns `false` if the writer has stopped.
    pub fn submit(&self, path: PathBuf, file: DbFile) -> bool {
        let mut state = self.shared.state.lock();
        while state.slot.is_some() && !state.stopped {
            self.shared.done.wait(&mut state);
        }
        if state.stopped {
            return false;
        }
        state.slot = Some(Job { path, file });
        drop(state);
        self.shared.posted.notify_all();
        true
    }

    /// Wait until nothing is queued or being written.
    pub fn wait_idle(&self, deadline: Instant) -> bool {
        let mut state = self.shared.state.lock();
        while state.slot.is_some() || state.writing {
            if self.shared.done.wait_until(&mut state, deadline).timed_out() {
                return state.slot.is_none() && !state.writing;
            }
        }
        true
    }

    #[inline]
    pub fn files_written(&self) -> usize {
        self.shared.written.load(Ordering::Acquire)
    }

    /// Finish the queued job, then stop the thread.
    pub fn stop(&self, timeout: Duration) {
        self.wait_idle(Instant::now() + timeout);
        self.shared.state.lock().stopped = true;
        self.shared.posted.notify_all();
        self.shared.done.notify_all();
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                tracing::error!("Database writer thread panicked");
            }
        }
    }
}

fn write_loop(shared: Arc<Shared>) {
    loop {
        let job = {
            let mut state = shared.state.lock();
            loop {
                if let Some(job) = state.slot.take() {
                    state.writing = true;
                    break job;
                }
                if state.stopped {
                    return;
                }
                shared.posted.wait(&mut state);
            }
        };
        shared.done.notify_all();

        match write_file(&job) {
            Ok(()) => {
                shared.written.fetch_add(1, Ordering::AcqRel);
                tracing::debug!(
                    "Wrote {} bytes to {}",
                    job.file.file_len(),
                    job.path.display()
                );
            }
            Err(e) => tracing::error!("Failed to write {}: {}", job.path.display(), e),
        }

        shared.state.lock().writing = false;
        shared.done.notify_all();
    }
}

fn write_file(job: &Job) -> std::io::Result<()> {
    if let Some(parent) = job.path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&job.path, job.file.data())
}
