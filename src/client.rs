//! Client builder and device reader loop.
//!
//! The [`DiagClientBuilder`] collects configuration, command tables and
//! extra data sinks. [`DiagClient`] owns every table of the subsystem and
//! manages its lifecycle:
//! 1. Initialize the buffer pool
//! 2. Register command tables with the device
//! 3. Start the disk pipeline or callback sink for the configured logging mode
//! 4. Start the transfer service, if enabled
//! 5. Read chunks and dispatch them through the [`FrameMux`]
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use diag_transport::packet::{CommandTable, TableKind};
//! use diag_transport::transport::LoopbackDevice;
//! use diag_transport::DiagClient;
//!
//! let device = Arc::new(LoopbackDevice::new());
//! let client = DiagClient::builder()
//!     .command_table(
//!         CommandTable::new(TableKind::Subsystem(0x32)).range(0x10, 0x20, |req, ctx| {
//!             let mut rsp = ctx.subsys_alloc(0x32, 0x10, req.len()).ok()?;
//!             rsp.copy_from_slice(req);
//!             Some(rsp)
//!         }),
//!     )
//!     .start(device.clone())
//!     .unwrap();
//!
//! assert_eq!(client.packets().table_count(), 1);
//! client.shutdown();
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

use crate::config::{DiagConfig, LoggingMode};
use crate::dci::DciTracker;
use crate::error::{DiagError, Result};
use crate::mask_file::{self, default_mask_file};
use crate::masks::MaskState;
use crate::mdlog::{LogPipeline, DEFAULT_FLUSH_TIMEOUT};
use crate::mux::{CallbackSink, DataSink, Dispatch, FrameMux};
use crate::packet::{CommandTable, PacketEngine};
use crate::pool::BufferPool;
use crate::protocol::qsr::{Guid, ProcKind};
use crate::protocol::stream::{
    BufferingMode, NUM_PERIPHERALS, USER_SPACE_DATA_TYPE, USER_SPACE_RAW_DATA_TYPE,
};
use crate::protocol::Framing;
use crate::report::{MsgDescriptor, Reporter};
use crate::transfer::{GuidHook, TransferService};
use crate::transport::{ControlRequest, Device};

/// Highest buffering watermark, in percent.
pub const MAX_WATERMARK: u8 = 100;

/// Builder for a [`DiagClient`].
pub struct DiagClientBuilder {
    config: DiagConfig,
    tables: Vec<CommandTable>,
    sinks: Vec<Arc<dyn DataSink>>,
    transfer: bool,
}

impl DiagClientBuilder {
    pub fn new() -> Self {
        Self {
            config: DiagConfig::default(),
            tables: Vec::new(),
            sinks: Vec::new(),
            transfer: false,
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: DiagConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a command table at start.
    pub fn command_table(mut self, table: CommandTable) -> Self {
        self.tables.push(table);
        self
    }

    /// Add a sink for `USER_SPACE_DATA` fields, after the built-in ones.
    pub fn sink(mut self, sink: Arc<dyn DataSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Run the database file transfer service.
    ///
    /// Default: off
    pub fn transfer(mut self, enabled: bool) -> Self {
        self.transfer = enabled;
        self
    }

    /// Build the subsystem on `device` and start reading.
    pub fn start(self, device: Arc<dyn Device>) -> Result<DiagClient> {
        DiagClient::start(self, device)
    }
}

impl Default for DiagClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The diag subsystem bound to one device.
///
/// Dropping the client shuts it down.
pub struct DiagClient {
    config: DiagConfig,
    device: Arc<dyn Device>,
    pool: BufferPool,
    masks: Arc<MaskState>,
    packets: Arc<PacketEngine>,
    dci: Arc<DciTracker>,
    reporter: Reporter,
    mux: Arc<FrameMux>,
    pipeline: Option<Arc<LogPipeline>>,
    callbacks: Option<Arc<CallbackSink>>,
    transfer: Option<TransferService>,
    shutdown: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl DiagClient {
    pub fn builder() -> DiagClientBuilder {
        DiagClientBuilder::new()
    }

    fn start(builder: DiagClientBuilder, device: Arc<dyn Device>) -> Result<Self> {
        let DiagClientBuilder {
            config,
            tables,
            sinks,
            transfer,
        } = builder;
        config.validate()?;
        if !device.is_open() {
            return Err(DiagError::DeviceClosed);
        }

        let pool = BufferPool::new(&config.pool);
        pool.init();

        let masks = Arc::new(MaskState::new());
        let packets = Arc::new(PacketEngine::new(
            Arc::clone(&device),
            pool.clone(),
            &config.packet,
        ));
        let dci = Arc::new(DciTracker::new(
            Arc::clone(&device),
            pool.clone(),
            &config.dci,
        ));
        let reporter = Reporter::new(Arc::clone(&device), pool.clone(), Arc::clone(&masks));
        for table in tables {
            packets.register_table(table)?;
        }

        let mut mux = FrameMux::new(
            Arc::clone(&masks),
            Arc::clone(&packets),
            Arc::clone(&dci),
            config.logging.hdlc_enabled,
        );

        let (pipeline, callbacks) = match config.logging.mode {
            LoggingMode::MemoryDevice => {
                let pipeline = Arc::new(LogPipeline::start(&config.logging)?);
                mux.add_sink(pipeline.clone());
                (Some(pipeline), None)
            }
            LoggingMode::Callback => {
                let callbacks = Arc::new(CallbackSink::new());
                mux.add_sink(callbacks.clone());
                (None, Some(callbacks))
            }
            _ => (None, None),
        };

        let transfer = if transfer {
            let output_dir: PathBuf = config
                .transfer
                .output_dir
                .clone()
                .unwrap_or_else(|| config.logging.output_dir.clone());
            let on_guid: Option<GuidHook> = pipeline.as_ref().map(|pipeline| {
                let pipeline = Arc::clone(pipeline);
                let hook: GuidHook = Arc::new(move |guid: Guid| pipeline.add_guid(guid));
                hook
            });
            let service = TransferService::start(
                Arc::clone(&device),
                &config.transfer,
                output_dir,
                mux.hdlc_enabled(),
                on_guid,
            )?;
            mux.add_sink(service.tap());
            Some(service)
        } else {
            None
        };

        for sink in sinks {
            mux.add_sink(sink);
        }

        let mux = Arc::new(mux);
        let shutdown = Arc::new(AtomicBool::new(false));
        let running = Arc::new(AtomicBool::new(true));
        let reader = {
            let device = Arc::clone(&device);
            let mux = Arc::clone(&mux);
            let shutdown = Arc::clone(&shutdown);
            let running = Arc::clone(&running);
            let pipeline = pipeline.clone();
            let buf_size = config.reader.read_buf_size;
            std::thread::Builder::new()
                .name("diag-reader".into())
                .spawn(move || {
                    Self::read_loop(device.as_ref(), &mux, &shutdown, buf_size);
                    if let Some(pipeline) = pipeline {
                        pipeline.request_flush();
                        pipeline.hand_over();
                    }
                    running.store(false, Ordering::Release);
                })?
        };
        tracing::debug!("Diag client started in {:?} mode", config.logging.mode);

        let client = Self {
            config,
            device,
            pool,
            masks,
            packets,
            dci,
            reporter,
            mux,
            pipeline,
            callbacks,
            transfer,
            shutdown,
            running,
            reader: Mutex::new(Some(reader)),
        };
        if let Err(e) = client.send_mask_files() {
            client.shutdown();
            return Err(e);
        }
        Ok(client)
    }

    /// Replay the configured mask file list, or the single mask file.
    fn send_mask_files(&self) -> Result<()> {
        let logging = &self.config.logging;
        let hdlc = self.mux.hdlc_enabled();
        let framing = if hdlc { Framing::Hdlc } else { Framing::NonHdlc };
        if let Some(list) = &logging.mask_file_list {
            let read = mask_file::read_mask_file_list(self.device.as_ref(), list, framing)?;
            if read == 0 {
                tracing::warn!("No mask file of {} could be sent", list.display());
            }
        } else if logging.use_mask_file {
            let path = logging
                .mask_file
                .clone()
                .unwrap_or_else(|| default_mask_file(&logging.output_dir, hdlc));
            mask_file::read_mask_file(self.device.as_ref(), &path, 0, framing)?;
        }
        Ok(())
    }

    /// Main read loop - reads chunks and dispatches them.
    fn read_loop(device: &dyn Device, mux: &FrameMux, shutdown: &AtomicBool, buf_size: usize) {
        let mut buf = vec![0u8; buf_size];
        loop {
            if shutdown.load(Ordering::Acquire) {
                return;
            }
            let n = match device.read(&mut buf) {
                Ok(0) => continue,
                Ok(n) => n,
                Err(e) => {
                    if !shutdown.load(Ordering::Acquire) {
                        tracing::error!("Device read failed: {}", e);
                    }
                    return;
                }
            };
            if mux.dispatch(&buf[..n]) == Dispatch::Deinit {
                return;
            }
        }
    }

    #[inline]
    pub fn config(&self) -> &DiagConfig {
        &self.config
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn masks(&self) -> &Arc<MaskState> {
        &self.masks
    }

    pub fn packets(&self) -> &Arc<PacketEngine> {
        &self.packets
    }

    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }

    pub fn dci(&self) -> &Arc<DciTracker> {
        &self.dci
    }

    /// The disk pipeline, in memory-device mode.
    pub fn pipeline(&self) -> Option<&Arc<LogPipeline>> {
        self.pipeline.as_ref()
    }

    /// The per-processor callbacks, in callback mode.
    pub fn callbacks(&self) -> Option<&Arc<CallbackSink>> {
        self.callbacks.as_ref()
    }

    pub fn transfer(&self) -> Option<&TransferService> {
        self.transfer.as_ref()
    }

    /// True until the reader thread exits.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    #[inline]
    pub fn hdlc_enabled(&self) -> bool {
        self.mux.hdlc_enabled()
    }

    /// Wait for the message, log and event masks to arrive.
    pub fn wait_for_mask_sync(&self) -> bool {
        let synced = self.masks.wait_for_sync(self.config.mask_sync.timeout());
        if !synced {
            tracing::warn!("Masks not synced within {:?}", self.config.mask_sync.timeout());
        }
        synced
    }

    /// Add a command table after start.
    pub fn register_table(&self, table: CommandTable) -> Result<()> {
        self.packets.register_table(table)
    }

    /// Queue the peripherals of `peripheral_mask` for database transfer.
    pub fn notify_transfer(&self, proc: ProcKind, peripheral_mask: u32) -> Result<()> {
        match &self.transfer {
            Some(service) => {
                service.notify(proc, peripheral_mask);
                Ok(())
            }
            None => Err(DiagError::NotSupported("transfer service not enabled".into())),
        }
    }

    /// Configure how `peripheral` buffers its data.
    ///
    /// Watermarks are percentages; `low_wm <= high_wm <= 100` and they may only
    /// be equal when both are 0.
    pub fn set_buffering_mode(
        &self,
        peripheral: i32,
        mode: BufferingMode,
        high_wm: u8,
        low_wm: u8,
    ) -> Result<()> {
        check_peripheral(peripheral)?;
        if high_wm > MAX_WATERMARK || low_wm > high_wm || (low_wm == high_wm && low_wm != 0) {
            tracing::warn!("Invalid watermarks low {} high {}", low_wm, high_wm);
            return Err(DiagError::InvalidParameter(format!(
                "watermarks low {} high {}",
                low_wm, high_wm
            )));
        }
        self.device
            .control(&ControlRequest::SetBufferingMode {
                peripheral,
                mode: mode as i32,
                high_wm,
                low_wm,
            })
            .map(|_| ())
    }

    /// Ask `peripheral` to flush its buffered data now.
    pub fn drain_immediate(&self, peripheral: i32) -> Result<()> {
        check_peripheral(peripheral)?;
        self.device
            .control(&ControlRequest::DrainImmediate { peripheral })
            .map(|_| ())
    }

    /// Switch the device's logging mode for the peripherals in
    /// `peripheral_mask`.
    pub fn switch_logging(&self, mode: LoggingMode, peripheral_mask: u32) -> Result<()> {
        self.device
            .control(&ControlRequest::SwitchLogging {
                mode: mode.code(),
                peripheral_mask,
            })
            .map(|_| ())
    }

    /// Turn HDLC framing of the log stream on or off.
    pub fn set_hdlc(&self, enable: bool) -> Result<()> {
        self.device
            .control(&ControlRequest::HdlcToggle { enable })
            .map_err(|e| {
                tracing::error!("HDLC toggle failed: {}", e);
                e
            })?;
        self.mux.set_hdlc(enable);
        Ok(())
    }

    /// Send log `code` if enabled. See [`Reporter::log_submit`].
    pub fn log_submit(&self, code: u16, payload: &[u8]) -> Result<bool> {
        self.reporter.log_submit(code, payload)
    }

    /// Send event `id` if enabled.
    pub fn event_report(&self, id: u16) -> Result<bool> {
        self.reporter.event_report(id)
    }

    /// Send event `id` with `payload` if enabled.
    pub fn event_report_payload(&self, id: u16, payload: &[u8]) -> Result<bool> {
        self.reporter.event_report_payload(id, payload)
    }

    /// Send a message if enabled. See [`Reporter::msg_send`].
    pub fn msg_send(&self, desc: &MsgDescriptor<'_>, args: &[u32]) -> Result<bool> {
        self.reporter.msg_send(desc, args)
    }

    /// Write an unframed request to processor `proc` (0 is local).
    pub fn send_data(&self, proc: usize, request: &[u8]) -> Result<()> {
        mask_file::send_data(self.device.as_ref(), USER_SPACE_RAW_DATA_TYPE, proc, request)
    }

    /// Write an HDLC-framed request to processor `proc`.
    pub fn send_data_hdlc(&self, proc: usize, frame: &[u8]) -> Result<()> {
        mask_file::send_data(self.device.as_ref(), USER_SPACE_DATA_TYPE, proc, frame)
    }

    /// Stop every thread and release every registration.
    ///
    /// Safe to call more than once.
    pub fn shutdown(&self) {
        let Some(reader) = self.reader.lock().take() else {
            return;
        };
        tracing::debug!("Diag client shutting down");

        if let Some(transfer) = &self.transfer {
            transfer.shutdown();
        }
        if let Some(pipeline) = &self.pipeline {
            pipeline.request_flush();
        }
        self.shutdown.store(true, Ordering::Release);
        self.device.interrupt();
        if reader.join().is_err() {
            tracing::error!("Reader thread panicked");
        }
        if let Some(pipeline) = &self.pipeline {
            if !pipeline.wait_flushed(DEFAULT_FLUSH_TIMEOUT) {
                tracing::warn!("Log pipeline not flushed");
            }
        }

        self.dci.release_all();
        if let Err(e) = self.packets.deinit() {
            tracing::warn!("Command deregistration failed: {}", e);
        }
        self.pool.exit();
        tracing::debug!("Diag client stopped");
    }
}

impl Drop for DiagClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn check_peripheral(peripheral: i32) -> Result<()> {
    if (0..NUM_PERIPHERALS).contains(&peripheral) {
        Ok(())
    } else {
        tracing::warn!("Invalid peripheral {}", peripheral);
        Err(DiagError::InvalidParameter(format!("peripheral {}", peripheral)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::stream::{DEINIT_TYPE, EVENT_MASKS_TYPE, LOG_MASKS_TYPE, MSG_MASKS_TYPE};
    use crate::packet::{PacketContext, PacketResponse, TableKind};
    use crate::transport::LoopbackDevice;
    use std::time::{Duration, Instant};

    fn start(config: DiagConfig) -> (Arc<LoopbackDevice>, DiagClient) {
        let device = Arc::new(LoopbackDevice::new());
        let client = DiagClient::builder()
            .config(config)
            .start(device.clone())
            .unwrap();
        (device, client)
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn test_builder_defaults() {
        let builder = DiagClientBuilder::default();
        assert_eq!(builder.config, DiagConfig::default());
        assert!(builder.tables.is_empty());
        assert!(!builder.transfer);
    }

    #[test]
    fn test_closed_device_rejected() {
        let device = Arc::new(LoopbackDevice::new());
        device.close();
        let result = DiagClient::builder().start(device);
        assert!(matches!(result, Err(DiagError::DeviceClosed)));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = DiagConfig::default();
        config.transfer.block_size = 0;
        let result = DiagClient::builder()
            .config(config)
            .start(Arc::new(LoopbackDevice::new()));
        assert!(matches!(result, Err(DiagError::Config(_))));
    }

    #[test]
    fn test_mask_sync() {
        let (device, client) = start(DiagConfig::default());
        for tag in [MSG_MASKS_TYPE, LOG_MASKS_TYPE, EVENT_MASKS_TYPE] {
            device.push_inbound(tag.to_le_bytes().to_vec());
        }
        assert!(wait_until(|| client.masks().is_synced()));
        assert!(client.wait_for_mask_sync());
    }

    #[test]
    fn test_deinit_stops_reader() {
        let (device, client) = start(DiagConfig::default());
        assert!(client.is_running());
        device.push_inbound(DEINIT_TYPE.to_le_bytes().to_vec());
        assert!(wait_until(|| !client.is_running()));
        client.shutdown();
    }

    #[test]
    fn test_shutdown_releases_everything() {
        let (device, client) = start(DiagConfig::default());
        let client_id = client.dci().register(0, 0, 0).unwrap();
        assert!(client.pool().is_initialized());

        client.shutdown();
        client.shutdown();
        assert!(!client.is_running());
        assert!(!client.pool().is_initialized());
        assert!(device
            .controls()
            .contains(&ControlRequest::DciDeinit { client_id }));
        assert!(device.controls().contains(&ControlRequest::DeregisterCommands));
    }

    fn ignore(_req: &[u8], _ctx: &PacketContext<'_>) -> Option<PacketResponse> {
        None
    }

    #[test]
    fn test_shutdown_survives_refused_deregistration() {
        let (device, client) = start(DiagConfig::default());
        client
            .register_table(CommandTable::new(TableKind::Legacy).range(1, 1, ignore))
            .unwrap();
        device.on_control(|req| match req {
            ControlRequest::DeregisterCommands => {
                Some(Err(DiagError::SendFailed("refused".into())))
            }
            _ => None,
        });

        client.shutdown();
        assert_eq!(client.packets().table_count(), 0);
        assert!(!client.pool().is_initialized());
        assert!(device.controls().contains(&ControlRequest::DeregisterCommands));
    }

    #[test]
    fn test_missing_mask_file_fails_start() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = DiagConfig::default();
        config.logging.use_mask_file = true;
        config.logging.mask_file = Some(dir.path().join("absent.cfg"));
        let device = Arc::new(LoopbackDevice::new());
        let result = DiagClient::builder().config(config).start(device.clone());

        assert!(matches!(result, Err(DiagError::Io(_))));
        assert!(device.controls().contains(&ControlRequest::DeregisterCommands));
    }

    #[test]
    fn test_send_data_hdlc_keeps_framing() {
        let (device, client) = start(DiagConfig::default());
        client.send_data_hdlc(0, &[0x7d, 0x5e, 0x7e]).unwrap();
        let frame = device.take_written().remove(0);
        assert_eq!(&frame[..4], &USER_SPACE_DATA_TYPE.to_le_bytes());
        assert_eq!(&frame[4..], &[0x7d, 0x5e, 0x7e]);
        assert!(client.send_data(0, &[]).is_err());
    }

    #[test]
    fn test_buffering_mode_validation() {
        let (device, client) = start(DiagConfig::default());
        client
            .set_buffering_mode(1, BufferingMode::Threshold, 80, 20)
            .unwrap();
        client
            .set_buffering_mode(0, BufferingMode::Streaming, 0, 0)
            .unwrap();

        for (peripheral, high, low) in [(4, 80, 20), (-1, 80, 20), (0, 101, 20), (0, 20, 80), (0, 50, 50)] {
            assert!(matches!(
                client.set_buffering_mode(peripheral, BufferingMode::Circular, high, low),
                Err(DiagError::InvalidParameter(_))
            ));
        }
        assert!(client.drain_immediate(NUM_PERIPHERALS).is_err());
        client.drain_immediate(2).unwrap();

        let controls = device.controls();
        assert!(controls.contains(&ControlRequest::SetBufferingMode {
            peripheral: 1,
            mode: BufferingMode::Threshold as i32,
            high_wm: 80,
            low_wm: 20,
        }));
        assert!(controls.contains(&ControlRequest::DrainImmediate { peripheral: 2 }));
    }

    #[test]
    fn test_hdlc_toggle() {
        let (device, client) = start(DiagConfig::default());
        assert!(client.hdlc_enabled());
        client.set_hdlc(false).unwrap();
        assert!(!client.hdlc_enabled());
        assert!(device
            .controls()
            .contains(&ControlRequest::HdlcToggle { enable: false }));
    }

    #[test]
    fn test_transfer_disabled() {
        let (_device, client) = start(DiagConfig::default());
        assert!(client.transfer().is_none());
        assert!(matches!(
            client.notify_transfer(ProcKind::Msm, 0x02),
            Err(DiagError::NotSupported(_))
        ));
    }

    #[test]
    fn test_logging_mode_sinks() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = DiagConfig::default();
        config.logging.mode = LoggingMode::Callback;
        config.logging.output_dir = dir.path().to_path_buf();
        let (_device, client) = start(config.clone());
        assert!(client.callbacks().is_some());
        assert!(client.pipeline().is_none());
        client.shutdown();

        config.logging.mode = LoggingMode::MemoryDevice;
        let (_device, client) = start(config);
        assert!(client.pipeline().is_some());
        client.shutdown();
        assert_eq!(
            client.pipeline().unwrap().phase(),
            crate::mdlog::FlushPhase::Drained
        );
    }
}
