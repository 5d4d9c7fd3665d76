//! Serial transport for the device's point-to-point link.
//!
//! Models the DMA-driven idle-line UART contract: reception is armed
//! explicitly, a completed frame is surfaced with its byte count, and
//! transmission completes asynchronously. Implementations bridge to a real
//! interrupt-driven UART, an in-memory loopback, or a TCP stand-in; the
//! engine never blocks on any of them.

mod loopback;
mod tcp;

pub use loopback::LoopbackPort;
pub use tcp::TcpPort;

use crate::error::TransportError;

/// Byte transport carrying one frame per idle-line reception.
///
/// The interrupt-to-loop handoff is the implementation's concern: receive
/// completion and transmit completion are each written once on the interrupt
/// side and consumed once per scheduler pass through this interface.
pub trait SerialPort {
    /// Re-arm reception, discarding any pending frame and clearing the
    /// transmit-done flag.
    fn arm_receive(&mut self) -> Result<(), TransportError>;

    /// Take the completed frame received since the last arm, if any.
    fn take_received(&mut self) -> Option<Vec<u8>>;

    /// Start transmitting a response. Completion is reported via
    /// [`SerialPort::transmit_done`].
    fn start_transmit(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Whether the in-flight transmission has completed.
    fn transmit_done(&self) -> bool;

    /// Abort an in-flight transmission.
    fn abort_transmit(&mut self);
}
