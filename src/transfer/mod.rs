//! Block file transfer - fetches database files from remote peripherals.
//!
//! For every peripheral named in a [`TransferService::notify`] mask the
//! orchestrator thread runs:
//!
//! ```text
//! LIST ─► for each new file:
//!           OPEN ─► READ(0, whole file) ─► delayed responses while rsp_cnt >= 0x1000
//!                ─► READ(block) for every block still missing
//!                ─► write-back ─► CLOSE
//! ```
//!
//! Requests go out as raw user-space writes. Responses come back inside the
//! log stream and are picked out by the [`ResponseTap`], which the client
//! registers as a [`DataSink`](crate::mux::DataSink). Every wait is bounded
//! by the configured response timeout; a timeout abandons only the current
//! file.
//!
//! Completed files are persisted by a separate writer thread as
//! `<dir>/<guid>.qdb`, `dir` being the processor directory under the output
//! directory.

mod descriptor;
mod tap;
mod writeback;

pub use descriptor::{DbFile, DB_FILE_EXTENSION};
pub use tap::{ResponseTap, WaitResult};

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::config::TransferConfig;
use crate::error::{DiagError, Result};
use crate::mdlog::proc_dir;
use crate::protocol::qsr::{FileInfo, Guid, ProcKind, QsrPeripheral, QsrRequest, QsrResponse};
use crate::transport::Device;

use writeback::WriteBack;

/// `rsp_cnt` values at or above this announce further delayed responses.
pub const MORE_RESPONSES: u16 = 0x1000;

/// Called once for every newly listed database GUID.
pub type GuidHook = Arc<dyn Fn(Guid) + Send + Sync>;

struct Control {
    queue: VecDeque<(ProcKind, u32)>,
    busy: bool,
    kill: bool,
}

struct Shared {
    control: Mutex<Control>,
    /// Signalled on new work or shutdown.
    wake: Condvar,
    /// Signalled when the orchestrator finished a batch.
    idle: Condvar,
}

impl Shared {
    fn killed(&self) -> bool {
        self.control.lock().kill
    }
}

/// Orchestrator and writer threads for database file transfer.
pub struct TransferService {
    shared: Arc<Shared>,
    tap: Arc<ResponseTap>,
    writeback: Arc<WriteBack>,
    orchestrator: Mutex<Option<JoinHandle<()>>>,
    timeout: Duration,
}

impl TransferService {
    /// Start both threads. Files land under `output_dir`.
    pub fn start(
        device: Arc<dyn Device>,
        config: &TransferConfig,
        output_dir: PathBuf,
        hdlc_enabled: bool,
        on_guid: Option<GuidHook>,
    ) -> Result<Self> {
        if config.block_size == 0 {
            return Err(DiagError::Config("transfer block size must be non-zero".into()));
        }
        let timeout = config.response_timeout();
        let shared = Arc::new(Shared {
            control: Mutex::new(Control {
                queue: VecDeque::new(),
                busy: false,
                kill: false,
            }),
            wake: Condvar::new(),
            idle: Condvar::new(),
        });
        let tap = Arc::new(ResponseTap::new(hdlc_enabled, config.read_buf_size, timeout));
        let writeback = Arc::new(WriteBack::start()?);

        let orchestrator = Orchestrator {
            device,
            shared: Arc::clone(&shared),
            tap: Arc::clone(&tap),
            writeback: Arc::clone(&writeback),
            output_dir,
            block_size: config.block_size,
            max_file_len: config.max_file_len,
            timeout,
            on_guid,
            listed: HashSet::new(),
            completed: HashSet::new(),
        };
        let thread = std::thread::Builder::new()
            .name("diag-db-transfer".into())
            .spawn(move || orchestrator.run())?;

        Ok(Self {
            shared,
            tap,
            writeback,
            orchestrator: Mutex::new(Some(thread)),
            timeout,
        })
    }

    /// The sink to register with the frame multiplexer.
    pub fn tap(&self) -> Arc<ResponseTap> {
        Arc::clone(&self.tap)
    }

    /// Queue the peripherals in `peripheral_mask` on `proc` for transfer.
    ///
    /// Bits are taken in the order modem (0x02), ADSP (0x04), WCNSS (0x08),
    /// SLPI (0x10). The apps bit is ignored.
    pub fn notify(&self, proc: ProcKind, peripheral_mask: u32) {
        let mut control = self.shared.control.lock();
        if control.kill {
            tracing::warn!("Transfer service stopped, ignoring mask {:#x}", peripheral_mask);
            return;
        }
        control.queue.push_back((proc, peripheral_mask));
        drop(control);
        self.shared.wake.notify_all();
    }

    /// Number of database files written so far.
    pub fn files_written(&self) -> usize {
        self.writeback.files_written()
    }

    /// Wait until every queued mask is processed and its files are on disk.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        {
            let mut control = self.shared.control.lock();
            while !control.queue.is_empty() || control.busy {
                if self.shared.idle.wait_until(&mut control, deadline).timed_out() {
                    return false;
                }
            }
        }
        self.writeback.wait_idle(deadline)
    }

    /// Stop the orchestrator, let the writer finish its file, join both.
    pub fn shutdown(&self) {
        let thread = self.orchestrator.lock().take();
        let Some(thread) = thread else {
            return;
        };
        self.shared.control.lock().kill = true;
        self.shared.wake.notify_all();
        self.tap.close();
        if thread.join().is_err() {
            tracing::error!("Transfer orchestrator thread panicked");
        }
        self.writeback.stop(self.timeout);
        tracing::debug!("Transfer service stopped");
    }
}

impl Drop for TransferService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Orchestrator {
    device: Arc<dyn Device>,
    shared: Arc<Shared>,
    tap: Arc<ResponseTap>,
    writeback: Arc<WriteBack>,
    output_dir: PathBuf,
    block_size: usize,
    max_file_len: usize,
    timeout: Duration,
    on_guid: Option<GuidHook>,
    /// GUIDs already reported through `on_guid`.
    listed: HashSet<Guid>,
    /// GUIDs persisted to disk; never fetched again.
    completed: HashSet<Guid>,
}

impl Orchestrator {
    fn run(mut self) {
        tracing::debug!("Transfer orchestrator started");
        loop {
            let (proc, mask) = {
                let mut control = self.shared.control.lock();
                loop {
                    if control.kill {
                        return;
                    }
                    if let Some(work) = control.queue.pop_front() {
                        control.busy = true;
                        break work;
                    }
                    self.shared.wake.wait(&mut control);
                }
            };

            for (peripheral, bit) in QsrPeripheral::ORDERED {
                if mask & bit == 0 {
                    continue;
                }
                if self.shared.killed() {
                    return;
                }
                self.tap.set_active(true);
                match self.transfer_peripheral(proc, peripheral) {
                    Ok(count) => tracing::debug!(
                        "{:?} {:?}: {} database files transferred",
                        proc,
                        peripheral,
                        count
                    ),
                    Err(e) => tracing::warn!("{:?} {:?}: transfer failed: {}", proc, peripheral, e),
                }
                self.tap.set_active(false);
            }

            self.shared.control.lock().busy = false;
            self.shared.idle.notify_all();
        }
    }

    fn check_killed(&self) -> Result<()> {
        if self.shared.killed() {
            Err(DiagError::Shutdown)
        } else {
            Ok(())
        }
    }

    fn send(&self, proc: ProcKind, peripheral: QsrPeripheral, request: QsrRequest) -> Result<()> {
        let mut buf = Vec::with_capacity(32);
        request.encode_into(proc, peripheral, &mut buf);
        self.device.write(&buf)
    }

    /// Wait for a response `accept` recognizes as the answer to the request
    /// in flight. Late answers to earlier requests are dropped until the
    /// response timeout runs out. A bad-command reply always ends the wait.
    fn expect_matching(
        &self,
        what: &str,
        accept: impl Fn(&QsrResponse) -> bool,
    ) -> Result<QsrResponse> {
        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(DiagError::Timeout(format!("{} response", what)));
            }
            let packet = match self.tap.wait_response(remaining) {
                WaitResult::Ready(packet) => packet,
                WaitResult::TimedOut => {
                    return Err(DiagError::Timeout(format!("{} response", what)))
                }
            };
            match QsrResponse::decode(&packet) {
                Ok(response) if response == QsrResponse::BadCommand || accept(&response) => {
                    return Ok(response)
                }
                Ok(response) => tracing::debug!(
                    "Dropping stale {:?} response while waiting for {}",
                    response.opcode(),
                    what
                ),
                Err(e) => tracing::debug!("Dropping response while waiting for {}: {}", what, e),
            }
        }
    }

    /// Returns the number of files handed to the writer.
    fn transfer_peripheral(&mut self, proc: ProcKind, peripheral: QsrPeripheral) -> Result<usize> {
        self.send(proc, peripheral, QsrRequest::List)?;
        let files = match self.expect_matching("list", |r| matches!(r, QsrResponse::List { .. }))? {
            QsrResponse::List { status: 0, files } => files,
            other => return Err(rejected("list", &other)),
        };

        let mut pending: Vec<FileInfo> = Vec::new();
        for info in files {
            if pending.iter().any(|p| p.guid == info.guid) || self.completed.contains(&info.guid) {
                tracing::debug!("Skipping duplicate database {}", info.guid);
                continue;
            }
            if self.listed.insert(info.guid) {
                if let Some(hook) = &self.on_guid {
                    hook(info.guid);
                }
            }
            pending.push(info);
        }

        let dir = proc_dir(&self.output_dir, proc.index());
        let mut transferred = 0;
        for info in pending {
            self.check_killed()?;
            match self.transfer_file(proc, peripheral, info, &dir) {
                Ok(()) => transferred += 1,
                Err(DiagError::Shutdown) => return Err(DiagError::Shutdown),
                Err(e) => tracing::warn!("Database {} abandoned: {}", info.guid, e),
            }
        }
        Ok(transferred)
    }

    fn transfer_file(
        &mut self,
        proc: ProcKind,
        peripheral: QsrPeripheral,
        info: FileInfo,
        dir: &Path,
    ) -> Result<()> {
        let mut file = DbFile::new(info, self.block_size, self.max_file_len)?;

        self.send(proc, peripheral, QsrRequest::Open { guid: info.guid })?;
        let opened = self.expect_matching("open", |r| {
            matches!(r, QsrResponse::Open { guid, .. } if *guid == info.guid)
        })?;
        let fd = match opened {
            QsrResponse::Open { fd, status: 0, .. } => fd,
            other => return Err(rejected("open", &other)),
        };
        tracing::debug!(
            "Reading {} ({} bytes, {} blocks) as fd {}",
            info.guid,
            info.file_len,
            file.num_blocks(),
            fd
        );

        let mut outcome = self.read_file(proc, peripheral, fd, &mut file);
        if outcome.is_ok() {
            outcome = self.persist(file, dir);
        }
        self.close(proc, peripheral, fd);
        outcome
    }

    fn read_file(
        &self,
        proc: ProcKind,
        peripheral: QsrPeripheral,
        fd: u16,
        file: &mut DbFile,
    ) -> Result<()> {
        self.request_read(proc, peripheral, fd, file.file_len(), 0)?;
        let file_len = file.file_len();
        loop {
            self.check_killed()?;
            let response = match self.expect_matching("delayed read", |r| {
                is_delayed_read(r, fd, |offset| offset < file_len.max(1))
            }) {
                Ok(response) => response,
                Err(DiagError::Timeout(_)) => {
                    tracing::debug!("Delayed responses for {} stopped", file.guid());
                    break;
                }
                Err(e) => return Err(e),
            };
            if apply_read(&response, file)? < MORE_RESPONSES {
                break;
            }
        }

        for block in file.missing_blocks() {
            self.check_killed()?;
            tracing::debug!("Retrying block {} of {}", block, file.guid());
            let offset = file.block_offset(block);
            self.request_read(proc, peripheral, fd, file.block_size() as u32, offset)?;
            let response = self.expect_matching("delayed read", |r| {
                is_delayed_read(r, fd, |at| at == offset)
            })?;
            apply_read(&response, file)?;
        }
        Ok(())
    }

    /// Send a READ and check its immediate response.
    fn request_read(
        &self,
        proc: ProcKind,
        peripheral: QsrPeripheral,
        fd: u16,
        req_bytes: u32,
        offset: u32,
    ) -> Result<()> {
        self.send(
            proc,
            peripheral,
            QsrRequest::Read {
                fd,
                req_bytes,
                offset,
            },
        )?;
        let immediate = self.expect_matching("read", |r| {
            matches!(
                r,
                QsrResponse::Read { header, fd: f, offset: at, .. }
                    if header.rsp_cnt == 0 && *f == fd && *at == offset
            )
        })?;
        match immediate {
            QsrResponse::Read { status: 0, .. } => Ok(()),
            other => Err(rejected("read", &other)),
        }
    }

    fn persist(&mut self, file: DbFile, dir: &Path) -> Result<()> {
        let missing = file.missing_blocks();
        if !missing.is_empty() {
            return Err(DiagError::Protocol(format!(
                "{} of {} blocks never arrived",
                missing.len(),
                file.num_blocks()
            )));
        }
        let guid = file.guid();
        let path = file.path_in(dir);
        if !self.writeback.submit(path, file) {
            return Err(DiagError::Shutdown);
        }
        self.completed.insert(guid);
        Ok(())
    }

    fn close(&self, proc: ProcKind, peripheral: QsrPeripheral, fd: u16) {
        if let Err(e) = self.send(proc, peripheral, QsrRequest::Close { fd }) {
            tracing::warn!("Failed to close fd {}: {}", fd, e);
            return;
        }
        let confirmed = self.expect_matching("close", |r| {
            matches!(r, QsrResponse::Close { fd: f, .. } if *f == fd)
        });
        match confirmed {
            Ok(QsrResponse::Close { status: 0, .. }) => {}
            Ok(other) => tracing::warn!("{}", rejected("close", &other)),
            Err(e) => tracing::warn!("Close of fd {} unconfirmed: {}", fd, e),
        }
    }
}

/// A delayed (non-zero `rsp_cnt`) read response for `fd` at an offset
/// `offset_ok` accepts.
fn is_delayed_read(response: &QsrResponse, fd: u16, offset_ok: impl Fn(u32) -> bool) -> bool {
    matches!(
        response,
        QsrResponse::Read { header, fd: f, offset, .. }
            if header.rsp_cnt != 0 && *f == fd && offset_ok(*offset)
    )
}

/// Copy a delayed read response into `file`, returning its `rsp_cnt`.
fn apply_read(response: &QsrResponse, file: &mut DbFile) -> Result<u16> {
    match response {
        QsrResponse::Read {
            header,
            offset,
            data,
            status: 0,
            ..
        } => {
            file.mark(*offset, data);
            Ok(header.rsp_cnt)
        }
        other => Err(rejected("read", other)),
    }
}

fn rejected(what: &str, response: &QsrResponse) -> DiagError {
    let reason = match response {
        QsrResponse::BadCommand => "bad command".to_string(),
        QsrResponse::List { status, .. }
        | QsrResponse::Open { status, .. }
        | QsrResponse::Read { status, .. }
        | QsrResponse::Close { status, .. } => {
            format!("{:?} response, status {}", response.opcode(), status)
        }
    };
    DiagError::Protocol(format!("{} failed: {}", what, reason))
}
