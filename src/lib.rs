//! # diag-transport
//!
//! User-space side of a diagnostics character device.
//!
//! One byte stream carries several logical channels: log, event and message
//! masks, command packets, the DCI remote consumer protocol, the log stream
//! itself and a block file-transfer protocol. This crate multiplexes them.
//!
//! ## Architecture
//!
//! ```text
//! Device::read ─► reader thread ─► FrameMux ─┬─► MaskState
//!                                            ├─► PacketEngine ──► Device::write
//!                                            ├─► DciTracker   ──► completion callbacks
//!                                            └─► DataSinks ─┬─► LogPipeline ─► writer thread ─► diag_log_*.qmdl
//!                                                           ├─► CallbackSink
//!                                                           └─► ResponseTap ─► transfer threads ─► *.qdb
//! ```
//!
//! Logs, events and messages of this process go out through the
//! [`report::Reporter`], gated by the masks the device pushed. Mask files are
//! replayed to the device by [`mask_file`].
//!
//! Outbound records are built in buffers from a fixed-size [`pool`].
//! Everything is owned by one [`DiagClient`]; nothing is global.
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use diag_transport::transport::LoopbackDevice;
//! use diag_transport::{DiagClient, DiagConfig};
//!
//! let device = Arc::new(LoopbackDevice::new());
//! let client = DiagClient::builder()
//!     .config(DiagConfig::default())
//!     .start(device)
//!     .unwrap();
//!
//! let id = client.dci().register(0, 0, 0).unwrap();
//! assert_eq!(client.dci().client_id(0), Some(id));
//! client.shutdown();
//! ```

pub mod arena;
pub mod codec;
pub mod config;
pub mod dci;
pub mod error;
pub mod mask_file;
pub mod masks;
pub mod mdlog;
pub mod mux;
pub mod packet;
pub mod pool;
pub mod protocol;
pub mod report;
pub mod transfer;
pub mod transport;

mod client;

pub use client::{DiagClient, DiagClientBuilder};
pub use config::DiagConfig;
pub use error::{DiagError, Result};
