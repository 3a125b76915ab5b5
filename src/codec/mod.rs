//! Byte-level codecs.
//!
//! - [`hdlc`] - async-HDLC escaping, CRC-16 and frame terminators used by the
//!   log stream when HDLC framing is enabled.

pub mod hdlc;
