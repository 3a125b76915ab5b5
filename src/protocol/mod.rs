//! Protocol module - stream tags, command headers and record layouts.
//!
//! Everything exchanged with the diag device is a packed little-endian
//! record:
//! - stream type tags and processor tokens ([`stream`])
//! - command packet headers ([`wire_format`])
//! - DCI request and data envelopes ([`dci`])
//! - database transfer records ([`qsr`])
//! - log stream frame extraction ([`FrameBuffer`])

pub mod dci;
mod frame_buffer;
pub mod qsr;
pub mod stream;
mod wire_format;

pub use frame_buffer::{non_hdlc_frame, FrameBuffer, Framing, DEFAULT_MAX_FRAME_SIZE};
pub use stream::valid_token;
pub use wire_format::{
    CommandKey, DciPktHeader, SubsysHeader, SubsysV2Header, DCI_PKT_HEADER_SIZE,
    RSP_CNT_MORE_FOLLOWS, SUBSYS_HEADER_SIZE, SUBSYS_V2_HEADER_SIZE,
};
