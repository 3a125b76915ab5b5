//! Transport module - the diag device boundary.
//!
//! The kernel character device is modelled by the [`Device`] trait: raw
//! reads and writes carry data, [`ControlRequest`]s configure the device.
//! No kernel binding ships with the crate; [`LoopbackDevice`] is an in-memory
//! device used for tests and simulation.

mod loopback;

pub use loopback::{ControlHandler, LoopbackDevice, Responder};

use crate::error::Result;
use crate::protocol::dci::HealthStats;

/// One command code range registered with the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandRegistration {
    pub cmd_code: u16,
    pub subsys_id: u16,
    pub cmd_code_lo: u16,
    pub cmd_code_hi: u16,
}

/// Device control requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    /// Route matching command packets to this process.
    RegisterCommands(Vec<CommandRegistration>),
    /// Drop every registration of this process.
    DeregisterCommands,
    /// Reserve a delayed response id.
    GetDelayedResponseId,
    /// Register a DCI client; the reply value is the client id.
    DciRegister {
        proc: i32,
        notification_mask: u32,
        signal_type: i32,
    },
    DciDeinit {
        client_id: i32,
    },
    DciHealthStats {
        client_id: i32,
        proc: i32,
        reset: bool,
    },
    DciLogStatus {
        client_id: i32,
        code: u16,
    },
    DciEventStatus {
        client_id: i32,
        id: u16,
    },
    DciClearLogs {
        client_id: i32,
    },
    DciClearEvents {
        client_id: i32,
    },
    /// Peripherals supporting DCI on a processor; the reply is a bitmask.
    DciSupport {
        proc: i32,
    },
    VoteRealTime {
        proc: i32,
        mode: i32,
    },
    GetRealTime {
        proc: i32,
    },
    SetBufferingMode {
        peripheral: i32,
        mode: i32,
        high_wm: u8,
        low_wm: u8,
    },
    DrainImmediate {
        peripheral: i32,
    },
    HdlcToggle {
        enable: bool,
    },
    SwitchLogging {
        mode: i32,
        peripheral_mask: u32,
    },
}

/// Replies to [`ControlRequest`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlReply {
    Ack,
    Value(i32),
    Health(HealthStats),
    Status(bool),
}

impl ControlReply {
    /// Numeric value of the reply; `Ack` reads as 0.
    pub fn value(&self) -> Option<i32> {
        match *self {
            ControlReply::Ack => Some(0),
            ControlReply::Value(v) => Some(v),
            ControlReply::Status(b) => Some(i32::from(b)),
            ControlReply::Health(_) => None,
        }
    }
}

/// The diag character device.
///
/// Implementations must be usable from the reader thread and caller threads
/// at the same time.
pub trait Device: Send + Sync {
    /// Block until a chunk is available and copy it into `buf`.
    ///
    /// Returns `Ok(0)` when woken by [`interrupt`](Self::interrupt).
    fn read(&self, buf: &mut [u8]) -> Result<usize>;

    /// Write one complete record.
    fn write(&self, data: &[u8]) -> Result<()>;

    /// Issue a control request.
    fn control(&self, request: &ControlRequest) -> Result<ControlReply>;

    /// Wake a blocked `read`.
    fn interrupt(&self);

    fn is_open(&self) -> bool;
}
