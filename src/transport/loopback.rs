//! In-memory serial port for tests and bench setups.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::error::TransportError;

use super::SerialPort;

#[derive(Debug, Default)]
struct Inner {
    /// Frames queued by the host, delivered one per arm.
    to_device: VecDeque<Vec<u8>>,
    /// Frames transmitted by the device.
    from_device: VecDeque<Vec<u8>>,
    /// Completed frame awaiting pickup.
    pending: Option<Vec<u8>>,
    armed: bool,
    tx_in_flight: Option<Vec<u8>>,
    tx_done: bool,
    /// Test knob: park transmissions instead of completing them.
    hold_tx: bool,
    /// Test knob: fail the next arm call.
    fail_arm: bool,
}

/// Loopback port. Clones share the same line, so a test can keep a host-side
/// handle while the device owns its own.
#[derive(Debug, Clone, Default)]
pub struct LoopbackPort {
    inner: Rc<RefCell<Inner>>,
}

impl LoopbackPort {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a frame as the host peer. Delivered immediately if reception is
    /// armed and idle, otherwise on the next arm.
    pub fn host_send(&self, frame: &[u8]) {
        let mut inner = self.inner.borrow_mut();
        if inner.armed && inner.pending.is_none() {
            inner.pending = Some(frame.to_vec());
        } else {
            inner.to_device.push_back(frame.to_vec());
        }
    }

    /// Pop the next frame the device transmitted.
    pub fn host_recv(&self) -> Option<Vec<u8>> {
        self.inner.borrow_mut().from_device.pop_front()
    }

    /// Park transmissions in flight (stuck-line simulation).
    pub fn hold_transmissions(&self, hold: bool) {
        self.inner.borrow_mut().hold_tx = hold;
    }

    /// Make the next arm call fail.
    pub fn fail_next_arm(&self) {
        self.inner.borrow_mut().fail_arm = true;
    }

    /// Number of device frames awaiting host pickup.
    pub fn outbound_len(&self) -> usize {
        self.inner.borrow().from_device.len()
    }
}

impl SerialPort for LoopbackPort {
    fn arm_receive(&mut self) -> Result<(), TransportError> {
        let mut inner = self.inner.borrow_mut();
        if inner.fail_arm {
            inner.fail_arm = false;
            return Err(TransportError::ArmFailed("injected".into()));
        }
        inner.pending = inner.to_device.pop_front();
        inner.armed = true;
        inner.tx_done = false;
        inner.tx_in_flight = None;
        Ok(())
    }

    fn take_received(&mut self) -> Option<Vec<u8>> {
        self.inner.borrow_mut().pending.take()
    }

    fn start_transmit(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let mut inner = self.inner.borrow_mut();
        if inner.hold_tx {
            inner.tx_in_flight = Some(data.to_vec());
            inner.tx_done = false;
        } else {
            inner.from_device.push_back(data.to_vec());
            inner.tx_done = true;
        }
        Ok(())
    }

    fn transmit_done(&self) -> bool {
        self.inner.borrow().tx_done
    }

    fn abort_transmit(&mut self) {
        let mut inner = self.inner.borrow_mut();
        inner.tx_in_flight = None;
        inner.tx_done = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_delivery_requires_arm() {
        let mut port = LoopbackPort::new();
        port.host_send(b"frame");
        assert!(port.take_received().is_none());

        port.arm_receive().unwrap();
        assert_eq!(port.take_received().unwrap(), b"frame");
        assert!(port.take_received().is_none());
    }

    #[test]
    fn test_transmit_completes_unless_held() {
        let mut port = LoopbackPort::new();
        port.arm_receive().unwrap();
        port.start_transmit(b"resp").unwrap();
        assert!(port.transmit_done());
        assert_eq!(port.host_recv().unwrap(), b"resp");

        port.hold_transmissions(true);
        port.start_transmit(b"stuck").unwrap();
        assert!(!port.transmit_done());
        port.abort_transmit();
        assert!(port.host_recv().is_none());
    }
}
