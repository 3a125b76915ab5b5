//! Command table registry.
//!
//! Handlers are grouped into tables. A table is keyed by its [`TableKind`]
//! and holds an ordered list of `[lo, hi]` command code ranges. Lookup scans
//! tables in registration order and returns the first range that contains the
//! packet's code.
//!
//! # Example
//!
//! ```
//! use diag_transport::packet::{CommandRegistry, CommandTable, TableKind};
//! use diag_transport::protocol::CommandKey;
//!
//! let mut registry = CommandRegistry::new(128);
//! registry
//!     .register(
//!         CommandTable::new(TableKind::Subsystem(50))
//!             .range(0x10, 0x1f, |_req, _ctx| None),
//!     )
//!     .unwrap();
//!
//! let key = CommandKey::of(&[0x4b, 50, 0x12, 0x00]).unwrap();
//! assert!(registry.lookup(&key).is_some());
//! ```

use std::sync::Arc;

use super::{PacketContext, PacketResponse};
use crate::error::{DiagError, Result};
use crate::protocol::stream::{DIAG_SUBSYS_CMD_F, DIAG_SUBSYS_CMD_VER_2_F};
use crate::protocol::CommandKey;
use crate::transport::CommandRegistration;

/// Subsystem id and command code used on the wire for "none".
pub const NO_SUBSYS_ID: u8 = 0xFF;

/// Handles one command packet.
///
/// Returning `Some` commits the response immediately. Returning `None` means
/// no response, or that a delayed response will follow.
pub trait CommandHandler: Send + Sync + 'static {
    fn handle(&self, request: &[u8], ctx: &PacketContext<'_>) -> Option<PacketResponse>;
}

impl<F> CommandHandler for F
where
    F: Fn(&[u8], &PacketContext<'_>) -> Option<PacketResponse> + Send + Sync + 'static,
{
    fn handle(&self, request: &[u8], ctx: &PacketContext<'_>) -> Option<PacketResponse> {
        self(request, ctx)
    }
}

/// Which packets a table answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    /// Plain command codes, no subsystem.
    Legacy,
    /// `0x4B` packets of a subsystem.
    Subsystem(u8),
    /// `0x80` packets of a subsystem.
    SubsystemV2(u8),
}

impl TableKind {
    /// `(cmd_code, subsys_id)` pair registered with the device.
    pub fn wire_key(self) -> (u8, u8) {
        match self {
            TableKind::Legacy => (NO_SUBSYS_ID, NO_SUBSYS_ID),
            TableKind::Subsystem(id) => (NO_SUBSYS_ID, id),
            TableKind::SubsystemV2(id) => (DIAG_SUBSYS_CMD_VER_2_F, id),
        }
    }

    fn matches(self, key: &CommandKey) -> bool {
        match (self, key.subsys_id) {
            (TableKind::Legacy, None) => true,
            (TableKind::Subsystem(id), Some(subsys)) => {
                key.cmd_code == DIAG_SUBSYS_CMD_F && id == subsys
            }
            (TableKind::SubsystemV2(id), Some(subsys)) => {
                key.cmd_code == DIAG_SUBSYS_CMD_VER_2_F && id == subsys
            }
            _ => false,
        }
    }
}

struct CommandEntry {
    lo: u16,
    hi: u16,
    handler: Arc<dyn CommandHandler>,
}

/// A table of command ranges.
pub struct CommandTable {
    kind: TableKind,
    delayed: bool,
    entries: Vec<CommandEntry>,
}

impl CommandTable {
    pub fn new(kind: TableKind) -> Self {
        Self {
            kind,
            delayed: false,
            entries: Vec::new(),
        }
    }

    /// Mark the table as answering with delayed responses.
    ///
    /// `subsys_alloc_v2` reserves a delayed response id for commands of a
    /// delayed table.
    pub fn delayed(mut self) -> Self {
        self.delayed = true;
        self
    }

    /// Append a `[lo, hi]` range (inclusive) served by a closure.
    pub fn range<F>(self, lo: u16, hi: u16, handler: F) -> Self
    where
        F: Fn(&[u8], &PacketContext<'_>) -> Option<PacketResponse> + Send + Sync + 'static,
    {
        self.handler(lo, hi, handler)
    }

    /// Append a `[lo, hi]` range (inclusive) served by `handler`.
    pub fn handler(mut self, lo: u16, hi: u16, handler: impl CommandHandler) -> Self {
        self.entries.push(CommandEntry {
            lo,
            hi,
            handler: Arc::new(handler),
        });
        self
    }

    #[inline]
    pub fn kind(&self) -> TableKind {
        self.kind
    }

    #[inline]
    pub fn is_delayed(&self) -> bool {
        self.delayed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Device registrations covering this table.
    pub fn registrations(&self) -> Vec<CommandRegistration> {
        let (cmd_code, subsys_id) = self.kind.wire_key();
        self.entries
            .iter()
            .map(|e| CommandRegistration {
                cmd_code: u16::from(cmd_code),
                subsys_id: u16::from(subsys_id),
                cmd_code_lo: e.lo,
                cmd_code_hi: e.hi,
            })
            .collect()
    }

    fn find(&self, code: u16) -> Option<&CommandEntry> {
        self.entries.iter().find(|e| e.lo <= code && code <= e.hi)
    }
}

impl std::fmt::Debug for CommandTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandTable")
            .field("kind", &self.kind)
            .field("delayed", &self.delayed)
            .field("ranges", &self.entries.len())
            .finish()
    }
}

/// Fixed-capacity list of command tables.
pub struct CommandRegistry {
    tables: Vec<CommandTable>,
    capacity: usize,
}

impl CommandRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            tables: Vec::new(),
            capacity,
        }
    }

    /// Append a table. Fails with `TableFull` at capacity.
    pub fn register(&mut self, table: CommandTable) -> Result<()> {
        if self.tables.len() >= self.capacity {
            return Err(DiagError::TableFull(self.capacity));
        }
        self.tables.push(table);
        Ok(())
    }

    /// Remove the most recently registered table.
    pub(crate) fn pop(&mut self) -> Option<CommandTable> {
        self.tables.pop()
    }

    /// Handler of the first range matching `key`.
    pub fn lookup(&self, key: &CommandKey) -> Option<Arc<dyn CommandHandler>> {
        self.tables
            .iter()
            .filter(|t| t.kind.matches(key))
            .find_map(|t| t.find(key.code))
            .map(|e| Arc::clone(&e.handler))
    }

    /// True if the command is served by a table marked delayed.
    pub fn with_delay(&self, subsys_id: u8, code: u16) -> bool {
        self.tables
            .iter()
            .filter(|t| {
                matches!(t.kind, TableKind::Subsystem(id) | TableKind::SubsystemV2(id) if id == subsys_id)
            })
            .find(|t| t.find(code).is_some())
            .map_or(false, |t| t.delayed)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn clear(&mut self) {
        self.tables.clear();
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_MAX_COMMAND_TABLES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_req: &[u8], _ctx: &PacketContext<'_>) -> Option<PacketResponse> {
        None
    }

    #[test]
    fn test_lookup_by_kind() {
        let mut registry = CommandRegistry::new(8);
        registry
            .register(CommandTable::new(TableKind::Legacy).range(0x1d, 0x1d, noop))
            .unwrap();
        registry
            .register(CommandTable::new(TableKind::Subsystem(50)).range(0, 10, noop))
            .unwrap();
        registry
            .register(CommandTable::new(TableKind::SubsystemV2(50)).range(20, 30, noop))
            .unwrap();

        assert!(registry.lookup(&CommandKey::of(&[0x1d]).unwrap()).is_some());
        assert!(registry.lookup(&CommandKey::of(&[0x1e]).unwrap()).is_none());
        assert!(registry
            .lookup(&CommandKey::of(&[0x4b, 50, 5, 0]).unwrap())
            .is_some());
        // v2 range is not reachable through a 0x4B packet
        assert!(registry
            .lookup(&CommandKey::of(&[0x4b, 50, 25, 0]).unwrap())
            .is_none());
        assert!(registry
            .lookup(&CommandKey::of(&[0x80, 50, 25, 0]).unwrap())
            .is_some());
        assert!(registry
            .lookup(&CommandKey::of(&[0x4b, 51, 5, 0]).unwrap())
            .is_none());
    }

    #[test]
    fn test_table_full() {
        let mut registry = CommandRegistry::new(2);
        registry.register(CommandTable::new(TableKind::Legacy)).unwrap();
        registry.register(CommandTable::new(TableKind::Legacy)).unwrap();
        let err = registry
            .register(CommandTable::new(TableKind::Legacy))
            .unwrap_err();
        assert!(matches!(err, DiagError::TableFull(2)));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_registrations_wire_keys() {
        let table = CommandTable::new(TableKind::SubsystemV2(18))
            .range(0x0816, 0x0816, noop)
            .range(0x0E10, 0x0E12, noop);
        let regs = table.registrations();
        assert_eq!(regs.len(), 2);
        assert_eq!(regs[0].cmd_code, 0x80);
        assert_eq!(regs[0].subsys_id, 18);
        assert_eq!((regs[1].cmd_code_lo, regs[1].cmd_code_hi), (0x0E10, 0x0E12));

        let legacy = CommandTable::new(TableKind::Legacy).range(1, 2, noop);
        assert_eq!(legacy.registrations()[0].subsys_id, 0xFF);
        assert_eq!(legacy.registrations()[0].cmd_code, 0xFF);
    }

    #[test]
    fn test_with_delay() {
        let mut registry = CommandRegistry::new(8);
        registry
            .register(CommandTable::new(TableKind::SubsystemV2(7)).range(1, 1, noop))
            .unwrap();
        registry
            .register(
                CommandTable::new(TableKind::SubsystemV2(7))
                    .delayed()
                    .range(2, 4, noop),
            )
            .unwrap();

        assert!(!registry.with_delay(7, 1));
        assert!(registry.with_delay(7, 3));
        assert!(!registry.with_delay(8, 3));
    }
}
