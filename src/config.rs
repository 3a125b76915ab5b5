//! Runtime configuration.
//!
//! All tunables of the transport live in one [`DiagConfig`] value. It can be
//! built in code (every section implements `Default`) or loaded from JSON:
//!
//! ```
//! use diag_transport::config::DiagConfig;
//!
//! let config = DiagConfig::from_json_str(r#"{
//!     "logging": { "output_dir": "/data/diag_logs", "max_file_count": 20 },
//!     "transfer": { "response_timeout_ms": 2000 }
//! }"#).unwrap();
//!
//! assert_eq!(config.logging.max_file_count, 20);
//! assert_eq!(config.pool.general_items, 8);
//! ```
//!
//! Missing fields fall back to the `DEFAULT_*` constants below.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DiagError, Result};
use crate::protocol::stream::NUM_PROC;

/// Default number of general-purpose pool slots.
pub const DEFAULT_GENERAL_ITEMS: usize = 8;

/// Default capacity of a general-purpose pool slot.
pub const DEFAULT_GENERAL_ITEM_SIZE: usize = 8192;

/// Default number of packet-response pool slots.
pub const DEFAULT_PACKET_ITEMS: usize = 4;

/// Default capacity of a packet-response pool slot.
pub const DEFAULT_PACKET_ITEM_SIZE: usize = 4096;

/// Default size of one device read.
pub const DEFAULT_READ_BUF_SIZE: usize = 100_000;

/// Default number of mask sync polls.
pub const DEFAULT_MASK_SYNC_POLLS: u32 = 100;

/// Default interval between mask sync polls.
pub const DEFAULT_MASK_SYNC_INTERVAL_MS: u64 = 1;

/// Default capacity of the command registration table.
pub const DEFAULT_MAX_COMMAND_TABLES: usize = 128;

/// Default number of DCI processors (local + one remote).
pub const DEFAULT_DCI_PROCESSORS: usize = 2;

/// Default maximum DCI request size.
pub const DEFAULT_DCI_MAX_REQUEST_SIZE: usize = 8192;

/// Default size of a per-peripheral double-buffer region.
pub const DEFAULT_DISK_BUF_SIZE: usize = 140 * 1024;

/// Default disk write chunk.
pub const DEFAULT_WRITE_CHUNK: usize = 64 * 1024;

/// Default log file rotation size.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 100_000_000;

/// Default minimum size before a full disk forces rotation.
pub const DEFAULT_MIN_FILE_SIZE: u64 = 80_000_000;

/// Default database transfer response timeout.
pub const DEFAULT_TRANSFER_TIMEOUT_MS: u64 = 10_000;

/// Default database transfer block size.
pub const DEFAULT_TRANSFER_BLOCK_SIZE: usize = 4000;

/// Default size of a transfer response slot.
pub const DEFAULT_TRANSFER_READ_BUF_SIZE: usize = 5000;

/// Default largest database file accepted for transfer.
pub const DEFAULT_TRANSFER_MAX_FILE_LEN: usize = 32 * 1024 * 1024;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagConfig {
    pub pool: PoolConfig,
    pub reader: ReaderConfig,
    pub mask_sync: MaskSyncConfig,
    pub packet: PacketConfig,
    pub dci: DciConfig,
    pub logging: LoggingConfig,
    pub transfer: TransferConfig,
}

impl DiagConfig {
    /// Parse a configuration from JSON text.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: DiagConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        tracing::debug!("Loading diag config from {}", path.as_ref().display());
        Self::from_json_str(&text)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.pool.general_item_size == 0 || self.pool.packet_item_size == 0 {
            return Err(DiagError::Config("pool item size must be non-zero".into()));
        }
        if self.reader.read_buf_size < 4 {
            return Err(DiagError::Config(format!(
                "read_buf_size {} cannot hold a type tag",
                self.reader.read_buf_size
            )));
        }
        if self.dci.processors == 0 || self.dci.processors > NUM_PROC {
            return Err(DiagError::Config(format!(
                "dci.processors must be 1..={}",
                NUM_PROC
            )));
        }
        if self.dci.max_request_size == 0 {
            return Err(DiagError::Config("dci.max_request_size must be non-zero".into()));
        }
        if self.logging.disk_buf_size == 0 || self.logging.write_chunk == 0 {
            return Err(DiagError::Config("logging buffer sizes must be non-zero".into()));
        }
        if self.logging.min_file_size > self.logging.max_file_size {
            return Err(DiagError::Config(format!(
                "min_file_size {} exceeds max_file_size {}",
                self.logging.min_file_size, self.logging.max_file_size
            )));
        }
        if self.transfer.block_size == 0 {
            return Err(DiagError::Config("transfer.block_size must be non-zero".into()));
        }
        Ok(())
    }
}

/// Buffer pool sizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub general_items: usize,
    pub general_item_size: usize,
    pub packet_items: usize,
    pub packet_item_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            general_items: DEFAULT_GENERAL_ITEMS,
            general_item_size: DEFAULT_GENERAL_ITEM_SIZE,
            packet_items: DEFAULT_PACKET_ITEMS,
            packet_item_size: DEFAULT_PACKET_ITEM_SIZE,
        }
    }
}

/// Device reader settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Bytes requested per `Device::read`.
    pub read_buf_size: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            read_buf_size: DEFAULT_READ_BUF_SIZE,
        }
    }
}

/// How long to wait for the initial mask updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaskSyncConfig {
    pub polls: u32,
    pub interval_ms: u64,
}

impl MaskSyncConfig {
    /// Total wait budget.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.interval_ms.saturating_mul(u64::from(self.polls)))
    }
}

impl Default for MaskSyncConfig {
    fn default() -> Self {
        Self {
            polls: DEFAULT_MASK_SYNC_POLLS,
            interval_ms: DEFAULT_MASK_SYNC_INTERVAL_MS,
        }
    }
}

/// Packet engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacketConfig {
    /// Maximum number of registered command tables.
    pub max_tables: usize,
}

impl Default for PacketConfig {
    fn default() -> Self {
        Self {
            max_tables: DEFAULT_MAX_COMMAND_TABLES,
        }
    }
}

/// DCI tracker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DciConfig {
    /// Number of processors with a client slot.
    pub processors: usize,
    /// Largest request accepted by `send_async`.
    pub max_request_size: usize,
}

impl Default for DciConfig {
    fn default() -> Self {
        Self {
            processors: DEFAULT_DCI_PROCESSORS,
            max_request_size: DEFAULT_DCI_MAX_REQUEST_SIZE,
        }
    }
}

/// Where USER_SPACE_DATA goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoggingMode {
    Usb,
    MemoryDevice,
    NoLogging,
    Uart,
    Socket,
    Callback,
}

impl LoggingMode {
    /// Numeric mode understood by the device.
    pub fn code(self) -> i32 {
        match self {
            LoggingMode::Usb => 1,
            LoggingMode::MemoryDevice => 2,
            LoggingMode::NoLogging => 3,
            LoggingMode::Uart => 4,
            LoggingMode::Socket => 5,
            LoggingMode::Callback => 6,
        }
    }
}

/// Disk logging settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub mode: LoggingMode,
    pub output_dir: PathBuf,
    /// Rotate once a file reaches this many bytes.
    pub max_file_size: u64,
    /// On a full disk, rotate only files larger than this.
    pub min_file_size: u64,
    /// Keep at most this many log files (0 or 1 disables circular logging).
    pub max_file_count: usize,
    /// Capacity of one peripheral region in a double-buffer slot.
    pub disk_buf_size: usize,
    /// Bytes per file write.
    pub write_chunk: usize,
    /// HDLC framing enabled (`.qmdl`) or disabled (`.qmdl2`).
    pub hdlc_enabled: bool,
    /// Send a mask file to the local processor at start.
    pub use_mask_file: bool,
    /// Mask file to send; defaults to `Diag.cfg` (`Diag.cfg2` without
    /// HDLC) in the output directory.
    pub mask_file: Option<PathBuf>,
    /// List of `proc_type path` mask files, sent at start instead of
    /// `mask_file`.
    pub mask_file_list: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            mode: LoggingMode::Usb,
            output_dir: PathBuf::from("/sdcard/diag_logs"),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            min_file_size: DEFAULT_MIN_FILE_SIZE,
            max_file_count: 0,
            disk_buf_size: DEFAULT_DISK_BUF_SIZE,
            write_chunk: DEFAULT_WRITE_CHUNK,
            hdlc_enabled: true,
            use_mask_file: false,
            mask_file: None,
            mask_file_list: None,
        }
    }
}

/// Database file transfer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub response_timeout_ms: u64,
    pub block_size: usize,
    pub read_buf_size: usize,
    /// Files advertising a larger length are skipped.
    pub max_file_len: usize,
    /// Directory for `.qdb` files; defaults to the logging directory.
    pub output_dir: Option<PathBuf>,
}

impl TransferConfig {
    /// Per-phase wait deadline.
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: DEFAULT_TRANSFER_TIMEOUT_MS,
            block_size: DEFAULT_TRANSFER_BLOCK_SIZE,
            read_buf_size: DEFAULT_TRANSFER_READ_BUF_SIZE,
            max_file_len: DEFAULT_TRANSFER_MAX_FILE_LEN,
            output_dir: None,
        }
    }
}
