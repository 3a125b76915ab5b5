//! Stream type tags, processor tokens and command codes.
//!
//! Every chunk read from the device begins with a 4-byte little-endian type
//! tag naming the logical channel it belongs to. Data from remote processors
//! is additionally prefixed with a negative processor token.

/// Message mask update.
pub const MSG_MASKS_TYPE: u32 = 0x0000_0001;
/// Log mask update.
pub const LOG_MASKS_TYPE: u32 = 0x0000_0002;
/// Event mask update.
pub const EVENT_MASKS_TYPE: u32 = 0x0000_0004;
/// Command packet from the host.
pub const PKT_TYPE: u32 = 0x0000_0008;
/// Reader must stop.
pub const DEINIT_TYPE: u32 = 0x0000_0010;
/// Log stream destined for disk or callback.
pub const USER_SPACE_DATA_TYPE: u32 = 0x0000_0020;
/// DCI response and stream data.
pub const DCI_DATA_TYPE: u32 = 0x0000_0040;
/// Raw request written towards a peripheral.
pub const USER_SPACE_RAW_DATA_TYPE: u32 = 0x0000_0080;
/// DCI log mask update.
pub const DCI_LOG_MASKS_TYPE: u32 = 0x0000_0100;
/// DCI event mask update.
pub const DCI_EVENT_MASKS_TYPE: u32 = 0x0000_0200;
/// Command packet arriving over DCI.
pub const DCI_PKT_TYPE: u32 = 0x0000_0400;
/// HDLC framing toggled by the device.
pub const HDLC_SUPPORT_TYPE: u32 = 0x0000_1000;

/// Immediate command response written back to the device.
pub const RESPONSE_TYPE: u32 = 3;
/// Delayed command response written back to the device.
pub const DELAYED_RESPONSE_TYPE: u32 = 4;

/// Data type bits heading a report written by this process. An event seen
/// only by the local mask carries no bit at all.
pub const DATA_TYPE_EVENT: u32 = 0;
/// Extended message (F3) report.
pub const DATA_TYPE_F3: u32 = 1;
/// Log report.
pub const DATA_TYPE_LOG: u32 = 2;
/// Log report wanted by a DCI client.
pub const DATA_TYPE_DCI_LOG: u32 = 0x0000_0100;
/// Event report wanted by a DCI client.
pub const DATA_TYPE_DCI_EVENT: u32 = 0x0000_0200;

/// Log report command.
pub const DIAG_LOG_F: u8 = 16;
/// Event report command.
pub const DIAG_EVENT_REPORT_F: u8 = 96;
/// Extended message command.
pub const DIAG_EXT_MSG_F: u8 = 121;

/// Marker byte for an immediate response relayed over DCI.
pub const DCI_PKT_RSP_CODE: u8 = 0x93;
/// Marker for a delayed (v2) response relayed over DCI.
pub const DCI_DELAYED_RSP_CODE: u8 = 0x94;

/// Legacy subsystem dispatch command.
pub const DIAG_SUBSYS_CMD_F: u8 = 75;
/// Subsystem dispatch with delayed-response support.
pub const DIAG_SUBSYS_CMD_VER_2_F: u8 = 128;
/// Bad command response code.
pub const DIAG_BAD_CMD_F: u8 = 19;
/// Bad parameter response code.
pub const DIAG_BAD_PARM_F: u8 = 20;
/// Bad length response code.
pub const DIAG_BAD_LEN_F: u8 = 21;
/// Diag service subsystem id.
pub const DIAG_SUBSYS_DIAG_SERV: u8 = 18;

/// Number of processor slots (local plus nine remotes).
pub const NUM_PROC: usize = 10;

/// Token of the first external modem.
pub const MDM_TOKEN: i32 = -1;
/// Token of the QSC processor.
pub const QSC_TOKEN: i32 = -5;

/// Processor tokens indexed by processor number.
pub const TOKEN_LIST: [i32; NUM_PROC] = [0, -1, -2, -3, -4, -5, -6, -7, -8, -9];

/// Sub-directory names for remote processors.
pub const PROC_NAMES: [&str; NUM_PROC] = [
    "", "/mdm", "/mdm2", "/mdm3", "/mdm4", "/qsc", "/mdm5", "/mdm6", "/mdm7", "/mdm8",
];

/// Masks that must be seen before the mask sync completes.
pub const MASK_SYNC_COMPLETE: u32 = MSG_MASKS_TYPE | LOG_MASKS_TYPE | EVENT_MASKS_TYPE;

/// Map a processor token to its processor index.
///
/// Returns `Some(0)` for any non-negative value (local data carries no token),
/// `Some(-t)` for a known remote token and `None` otherwise.
///
/// ```
/// use diag_transport::protocol::valid_token;
///
/// assert_eq!(valid_token(-3), Some(3));
/// assert_eq!(valid_token(42), Some(0));
/// assert_eq!(valid_token(-12), None);
/// ```
pub fn valid_token(token: i32) -> Option<usize> {
    if token >= 0 {
        return Some(0);
    }
    TOKEN_LIST
        .iter()
        .position(|&t| t == token)
}

/// DCI processors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DciProc {
    /// Local application processor.
    Local = 0,
    /// External modem.
    Mdm = 1,
}

impl DciProc {
    /// Processor from its numeric index.
    pub fn from_index(index: i32) -> Option<Self> {
        match index {
            0 => Some(DciProc::Local),
            1 => Some(DciProc::Mdm),
            _ => None,
        }
    }

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Real-time vote values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RealTimeMode {
    RealTime = 1,
    NonRealTime = 2,
}

/// Peripherals accepting buffering configuration.
pub const NUM_PERIPHERALS: i32 = 4;

/// Peripheral buffering modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferingMode {
    Streaming = 0,
    Threshold = 1,
    Circular = 2,
}
