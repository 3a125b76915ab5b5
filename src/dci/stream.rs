//! Log and event stream delivery.

use std::sync::Arc;

/// Receives one log or event packet.
pub type StreamHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Called once per received `DCI_DATA` sub-record with the processor index.
pub type DataSignal = Arc<dyn Fn(usize) + Send + Sync>;

/// Stream handlers captured for one chunk, so none of them runs under the
/// client lock.
#[derive(Clone, Default)]
pub(crate) struct Delivery {
    pub logs: Option<StreamHandler>,
    pub events: Option<StreamHandler>,
    pub signal: Option<DataSignal>,
    pub version: u8,
}

impl Delivery {
    pub fn log(&self, proc: usize, packet: &[u8]) {
        match &self.logs {
            Some(handler) => handler(packet),
            None => tracing::debug!("No log stream handler on processor {}", proc),
        }
    }

    pub fn event(&self, proc: usize, packet: &[u8]) {
        match &self.events {
            Some(handler) => handler(packet),
            None => tracing::debug!("No event stream handler on processor {}", proc),
        }
    }

    pub fn signal(&self, proc: usize) {
        if let Some(signal) = &self.signal {
            signal(proc);
        }
    }
}
