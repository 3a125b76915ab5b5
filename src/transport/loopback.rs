//! In-memory device.
//!
//! Inbound chunks are queued with [`LoopbackDevice::push_inbound`] (or
//! produced by a [`Responder`] reacting to writes) and handed out one per
//! `read`. Every write and control request is recorded for inspection.
//!
//! ```
//! use diag_transport::transport::{Device, LoopbackDevice};
//!
//! let device = LoopbackDevice::new();
//! device.push_inbound(vec![1, 2, 3]);
//!
//! let mut buf = [0u8; 16];
//! assert_eq!(device.read(&mut buf).unwrap(), 3);
//!
//! device.write(b"out").unwrap();
//! assert_eq!(device.written(), vec![b"out".to_vec()]);
//! ```

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::{ControlReply, ControlRequest, Device};
use crate::error::{DiagError, Result};

/// Produces inbound chunks in reaction to a write.
pub type Responder = Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>> + Send>;

/// Overrides the default control replies. Returning `None` falls back to the
/// default.
pub type ControlHandler = Box<dyn FnMut(&ControlRequest) -> Option<Result<ControlReply>> + Send>;

struct Inner {
    inbound: VecDeque<Vec<u8>>,
    written: Vec<Vec<u8>>,
    controls: Vec<ControlRequest>,
    open: bool,
    interrupted: bool,
    fail_writes: bool,
    next_client_id: i32,
    next_delayed_id: i32,
}

/// Loopback implementation of [`Device`].
pub struct LoopbackDevice {
    inner: Mutex<Inner>,
    readable: Condvar,
    written_cond: Condvar,
    responder: Mutex<Option<Responder>>,
    control_handler: Mutex<Option<ControlHandler>>,
}

impl LoopbackDevice {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                inbound: VecDeque::new(),
                written: Vec::new(),
                controls: Vec::new(),
                open: true,
                interrupted: false,
                fail_writes: false,
                next_client_id: 1,
                next_delayed_id: 1,
            }),
            readable: Condvar::new(),
            written_cond: Condvar::new(),
            responder: Mutex::new(None),
            control_handler: Mutex::new(None),
        }
    }

    /// Queue a chunk for the next `read`.
    pub fn push_inbound(&self, chunk: Vec<u8>) {
        self.inner.lock().inbound.push_back(chunk);
        self.readable.notify_all();
    }

    /// Install a closure answering writes with inbound chunks.
    pub fn on_write(&self, responder: impl FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static) {
        *self.responder.lock() = Some(Box::new(responder));
    }

    /// Install a closure overriding control replies.
    pub fn on_control(
        &self,
        handler: impl FnMut(&ControlRequest) -> Option<Result<ControlReply>> + Send + 'static,
    ) {
        *self.control_handler.lock() = Some(Box::new(handler));
    }

    /// Every record written so far.
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.inner.lock().written.clone()
    }

    /// Remove and return the recorded writes.
    pub fn take_written(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.inner.lock().written)
    }

    /// Every control request issued so far.
    pub fn controls(&self) -> Vec<ControlRequest> {
        self.inner.lock().controls.clone()
    }

    /// Block until at least `count` writes were recorded or `timeout` passes.
    pub fn wait_for_writes(&self, count: usize, timeout: Duration) -> bool {
        let mut inner = self.inner.lock();
        if inner.written.len() >= count {
            return true;
        }
        let deadline = std::time::Instant::now() + timeout;
        while inner.written.len() < count {
            if self.written_cond.wait_until(&mut inner, deadline).timed_out() {
                return inner.written.len() >= count;
            }
        }
        true
    }

    /// Make subsequent writes fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.inner.lock().fail_writes = fail;
    }

    /// Close the device and wake readers.
    pub fn close(&self) {
        self.inner.lock().open = false;
        self.readable.notify_all();
    }

    fn default_reply(inner: &mut Inner, request: &ControlRequest) -> ControlReply {
        match request {
            ControlRequest::DciRegister { .. } => {
                let id = inner.next_client_id;
                inner.next_client_id += 1;
                ControlReply::Value(id)
            }
            ControlRequest::GetDelayedResponseId => {
                let id = inner.next_delayed_id;
                inner.next_delayed_id += 1;
                ControlReply::Value(id)
            }
            ControlRequest::DciHealthStats { .. } => ControlReply::Health(Default::default()),
            ControlRequest::DciLogStatus { .. } | ControlRequest::DciEventStatus { .. } => {
                ControlReply::Status(false)
            }
            ControlRequest::GetRealTime { .. } => ControlReply::Value(1),
            _ => ControlReply::Ack,
        }
    }
}

impl Default for LoopbackDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for LoopbackDevice {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut inner = self.inner.lock();
        loop {
            if !inner.open {
                return Err(DiagError::DeviceClosed);
            }
            if inner.interrupted {
                inner.interrupted = false;
                return Ok(0);
            }
            if let Some(mut chunk) = inner.inbound.pop_front() {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                if n < chunk.len() {
                    inner.inbound.push_front(chunk.split_off(n));
                }
                return Ok(n);
            }
            self.readable.wait(&mut inner);
        }
    }

    fn write(&self, data: &[u8]) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            if !inner.open {
                return Err(DiagError::DeviceClosed);
            }
            if inner.fail_writes {
                return Err(DiagError::SendFailed("loopback write failure".into()));
            }
            inner.written.push(data.to_vec());
        }
        self.written_cond.notify_all();

        let replies = match self.responder.lock().as_mut() {
            Some(responder) => responder(data),
            None => Vec::new(),
        };
        if !replies.is_empty() {
            self.inner.lock().inbound.extend(replies);
            self.readable.notify_all();
        }
        Ok(())
    }

    fn control(&self, request: &ControlRequest) -> Result<ControlReply> {
        {
            let mut inner = self.inner.lock();
            if !inner.open {
                return Err(DiagError::DeviceClosed);
            }
            inner.controls.push(request.clone());
        }
        if let Some(handler) = self.control_handler.lock().as_mut() {
            if let Some(reply) = handler(request) {
                return reply;
            }
        }
        let mut inner = self.inner.lock();
        Ok(Self::default_reply(&mut inner, request))
    }

    fn interrupt(&self) {
        self.inner.lock().interrupted = true;
        self.readable.notify_all();
    }

    fn is_open(&self) -> bool {
        self.inner.lock().open
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_read_splits_long_chunk() {
        let device = LoopbackDevice::new();
        device.push_inbound(vec![1, 2, 3, 4, 5]);

        let mut buf = [0u8; 3];
        assert_eq!(device.read(&mut buf).unwrap(), 3);
        assert_eq!(buf, [1, 2, 3]);
        assert_eq!(device.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], &[4, 5]);
    }

    #[test]
    fn test_interrupt_wakes_reader() {
        let device = Arc::new(LoopbackDevice::new());
        let reader = {
            let device = Arc::clone(&device);
            thread::spawn(move || {
                let mut buf = [0u8; 8];
                device.read(&mut buf)
            })
        };
        thread::sleep(Duration::from_millis(20));
        device.interrupt();
        assert_eq!(reader.join().unwrap().unwrap(), 0);
    }

    #[test]
    fn test_closed_device() {
        let device = LoopbackDevice::new();
        device.close();
        let mut buf = [0u8; 8];
        assert!(matches!(device.read(&mut buf), Err(DiagError::DeviceClosed)));
        assert!(matches!(device.write(b"x"), Err(DiagError::DeviceClosed)));
        assert!(!device.is_open());
    }

    #[test]
    fn test_responder_queues_replies() {
        let device = LoopbackDevice::new();
        device.on_write(|data| vec![data.iter().rev().copied().collect()]);
        device.write(&[1, 2]).unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(device.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], &[2, 1]);
    }

    #[test]
    fn test_default_control_replies() {
        let device = LoopbackDevice::new();
        let register = ControlRequest::DciRegister {
            proc: 0,
            notification_mask: 0,
            signal_type: 0,
        };
        assert_eq!(device.control(&register).unwrap(), ControlReply::Value(1));
        assert_eq!(device.control(&register).unwrap(), ControlReply::Value(2));
        assert_eq!(
            device.control(&ControlRequest::GetDelayedResponseId).unwrap(),
            ControlReply::Value(1)
        );
        assert_eq!(
            device.control(&ControlRequest::DrainImmediate { peripheral: 0 }).unwrap(),
            ControlReply::Ack
        );
        assert_eq!(device.controls().len(), 4);
    }

    #[test]
    fn test_control_override() {
        let device = LoopbackDevice::new();
        device.on_control(|req| match req {
            ControlRequest::DciRegister { .. } => Some(Ok(ControlReply::Value(-1))),
            _ => None,
        });
        let reply = device
            .control(&ControlRequest::DciRegister {
                proc: 0,
                notification_mask: 0,
                signal_type: 0,
            })
            .unwrap();
        assert_eq!(reply, ControlReply::Value(-1));
    }

    #[test]
    fn test_fail_writes() {
        let device = LoopbackDevice::new();
        device.set_fail_writes(true);
        assert!(matches!(device.write(b"x"), Err(DiagError::SendFailed(_))));
        assert!(device.written().is_empty());
    }
}
