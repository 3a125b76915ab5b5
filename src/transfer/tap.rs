//! Picks transfer responses out of the log stream.
//!
//! Peripherals answer transfer requests inside `USER_SPACE_DATA`, framed the
//! same way as log packets. The tap reassembles frames per processor and
//! keeps the ones that are transfer responses, handing them to the
//! orchestrator through two ping-pong slots:
//!
//! ```text
//! reader ──accept──► FrameBuffer ──is_transfer_response──► [slot 0 | slot 1] ──wait──► orchestrator
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::mux::DataSink;
use crate::protocol::qsr::is_transfer_response;
use crate::protocol::stream::NUM_PROC;
use crate::protocol::{FrameBuffer, Framing};

/// Outcome of a bounded wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitResult<T> {
    Ready(T),
    TimedOut,
}

struct SlotState {
    slots: [Option<Vec<u8>>; 2],
    /// Slot the tap fills next.
    write: usize,
    /// Slot the orchestrator takes next.
    read: usize,
    closed: bool,
}

/// Two read slots shared by the tap and the orchestrator.
pub(crate) struct ResponseSlots {
    state: Mutex<SlotState>,
    filled: Condvar,
    emptied: Condvar,
}

impl ResponseSlots {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                slots: [None, None],
                write: 0,
                read: 0,
                closed: false,
            }),
            filled: Condvar::new(),
            emptied: Condvar::new(),
        }
    }

    /// Store `packet`, waiting up to `timeout` for the slot to be taken.
    /// Returns `false` if the packet was dropped.
    pub fn put(&self, packet: Vec<u8>, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.slots[state.write].is_some() {
            if state.closed {
                return false;
            }
            if self.emptied.wait_until(&mut state, deadline).timed_out()
                && state.slots[state.write].is_some()
            {
                return false;
            }
        }
        let write = state.write;
        state.slots[write] = Some(packet);
        state.write = 1 - write;
        drop(state);
        self.filled.notify_all();
        true
    }

    /// Take the next packet, waiting up to `timeout`.
    pub fn take(&self, timeout: Duration) -> WaitResult<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            let read = state.read;
            if let Some(packet) = state.slots[read].take() {
                state.read = 1 - read;
                drop(state);
                self.emptied.notify_all();
                return WaitResult::Ready(packet);
            }
            if state.closed {
                return WaitResult::TimedOut;
            }
            if self.filled.wait_until(&mut state, deadline).timed_out()
                && state.slots[state.read].is_none()
            {
                return WaitResult::TimedOut;
            }
        }
    }

    /// Drop anything left from an earlier exchange.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.slots = [None, None];
        state.write = 0;
        state.read = 0;
        drop(state);
        self.emptied.notify_all();
    }

    /// Fail every current and future wait.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.filled.notify_all();
        self.emptied.notify_all();
    }
}

/// [`DataSink`] feeding transfer responses to the orchestrator.
///
/// Inactive taps ignore the stream entirely.
pub struct ResponseTap {
    active: AtomicBool,
    framers: Mutex<Vec<FrameBuffer>>,
    slots: ResponseSlots,
    max_packet: usize,
    put_timeout: Duration,
}

impl ResponseTap {
    pub(crate) fn new(hdlc_enabled: bool, max_packet: usize, put_timeout: Duration) -> Self {
        let framing = framing_for(hdlc_enabled);
        Self {
            active: AtomicBool::new(false),
            framers: Mutex::new((0..NUM_PROC).map(|_| FrameBuffer::new(framing)).collect()),
            slots: ResponseSlots::new(),
            max_packet,
            put_timeout,
        }
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Start or stop collecting responses. Both edges discard partial frames
    /// and stale responses.
    pub(crate) fn set_active(&self, active: bool) {
        for framer in self.framers.lock().iter_mut() {
            framer.clear();
        }
        self.slots.clear();
        self.active.store(active, Ordering::Release);
    }

    /// Wait for the next response.
    pub fn wait_response(&self, timeout: Duration) -> WaitResult<Vec<u8>> {
        self.slots.take(timeout)
    }

    /// Wake the orchestrator for shutdown.
    pub(crate) fn close(&self) {
        self.active.store(false, Ordering::Release);
        self.slots.close();
    }
}

fn framing_for(hdlc_enabled: bool) -> Framing {
    if hdlc_enabled {
        Framing::Hdlc
    } else {
        Framing::NonHdlc
    }
}

impl DataSink for ResponseTap {
    fn accept(&self, proc: usize, data: &[u8]) {
        if !self.is_active() {
            return;
        }
        let packets = {
            let mut framers = self.framers.lock();
            match framers.get_mut(proc) {
                Some(framer) => framer.push(data),
                None => return,
            }
        };
        for packet in packets {
            if !is_transfer_response(&packet) {
                continue;
            }
            if packet.len() > self.max_packet {
                tracing::warn!(
                    "Dropping {} byte transfer response (limit {})",
                    packet.len(),
                    self.max_packet
                );
                continue;
            }
            if !self.slots.put(packet, self.put_timeout) {
                tracing::warn!("Transfer read slots full, dropping response");
            }
        }
    }

    fn set_hdlc(&self, enabled: bool) {
        let framing = framing_for(enabled);
        for framer in self.framers.lock().iter_mut() {
            framer.set_framing(framing);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::hdlc;
    use crate::protocol::non_hdlc_frame;
    use crate::protocol::qsr::{encode, QsrPeripheral};
    use std::sync::Arc;
    use std::thread;

    const SHORT: Duration = Duration::from_millis(20);

    fn tap(hdlc_enabled: bool) -> ResponseTap {
        let tap = ResponseTap::new(hdlc_enabled, 5000, SHORT);
        tap.set_active(true);
        tap
    }

    #[test]
    fn test_slots_ping_pong() {
        let slots = ResponseSlots::new();
        assert!(slots.put(b"one".to_vec(), SHORT));
        assert!(slots.put(b"two".to_vec(), SHORT));
        assert!(!slots.put(b"three".to_vec(), SHORT));

        assert_eq!(slots.take(SHORT), WaitResult::Ready(b"one".to_vec()));
        assert!(slots.put(b"four".to_vec(), SHORT));
        assert_eq!(slots.take(SHORT), WaitResult::Ready(b"two".to_vec()));
        assert_eq!(slots.take(SHORT), WaitResult::Ready(b"four".to_vec()));
        assert_eq!(slots.take(SHORT), WaitResult::TimedOut);
    }

    #[test]
    fn test_close_wakes_waiter() {
        let slots = Arc::new(ResponseSlots::new());
        let waiter = {
            let slots = Arc::clone(&slots);
            thread::spawn(move || slots.take(Duration::from_secs(30)))
        };
        thread::sleep(Duration::from_millis(20));
        slots.close();
        assert_eq!(waiter.join().unwrap(), WaitResult::TimedOut);
    }

    #[test]
    fn test_take_wakes_on_put() {
        let slots = Arc::new(ResponseSlots::new());
        let producer = {
            let slots = Arc::clone(&slots);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                slots.put(b"late".to_vec(), SHORT)
            })
        };
        assert_eq!(
            slots.take(Duration::from_secs(5)),
            WaitResult::Ready(b"late".to_vec())
        );
        assert!(producer.join().unwrap());
    }

    #[test]
    fn test_hdlc_response_accepted() {
        let tap = tap(true);
        let packet = encode::close(QsrPeripheral::Modem, 3);
        let frame = hdlc::encode(&packet);

        tap.accept(0, &frame[..5]);
        assert_eq!(tap.wait_response(SHORT), WaitResult::TimedOut);
        tap.accept(0, &frame[5..]);
        assert_eq!(tap.wait_response(SHORT), WaitResult::Ready(packet));
    }

    #[test]
    fn test_non_hdlc_response_accepted() {
        let tap = tap(false);
        let packet = encode::close(QsrPeripheral::Adsp, 1);
        tap.accept(1, &non_hdlc_frame(&packet));
        assert_eq!(tap.wait_response(SHORT), WaitResult::Ready(packet));
    }

    #[test]
    fn test_other_packets_ignored() {
        let tap = tap(true);
        tap.accept(0, &hdlc::encode(b"\x10\x00log packet"));
        assert_eq!(tap.wait_response(SHORT), WaitResult::TimedOut);
    }

    #[test]
    fn test_inactive_tap_ignores_stream() {
        let tap = tap(true);
        tap.set_active(false);
        tap.accept(0, &hdlc::encode(&encode::close(QsrPeripheral::Modem, 3)));
        assert_eq!(tap.wait_response(SHORT), WaitResult::TimedOut);
    }

    #[test]
    fn test_hdlc_toggle_switches_framing() {
        let tap = tap(true);
        tap.set_hdlc(false);
        let packet = encode::close(QsrPeripheral::Slpi, 9);
        tap.accept(0, &non_hdlc_frame(&packet));
        assert_eq!(tap.wait_response(SHORT), WaitResult::Ready(packet));
    }

    #[test]
    fn test_oversized_response_dropped() {
        let tap = ResponseTap::new(true, 16, SHORT);
        tap.set_active(true);
        let packet = encode::read(QsrPeripheral::Modem, 0, 1, 0, &[0; 64]);
        tap.accept(0, &hdlc::encode(&packet));
        assert_eq!(tap.wait_response(SHORT), WaitResult::TimedOut);
    }
}
