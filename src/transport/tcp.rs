//! TCP stand-in for the serial link.
//!
//! The daemon exposes the device on a TCP socket, one peer at a time. Frame
//! boundaries follow the idle-line convention: bytes that arrive without a
//! gap belong to one frame, and a short quiet period completes it.

use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::TransportError;

use super::SerialPort;

/// Quiet period that terminates a frame.
const IDLE_GAP: Duration = Duration::from_millis(5);

/// Serial port backed by a TCP listener.
pub struct TcpPort {
    listener: TcpListener,
    peer: Option<TcpStream>,
    armed: bool,
    pending: Option<Vec<u8>>,
    partial: Vec<u8>,
    last_byte_at: Instant,
    tx_done: bool,
}

impl TcpPort {
    /// Bind the listener. Accepting is non-blocking and folded into the
    /// polling calls.
    pub fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        let listener =
            TcpListener::bind(addr).map_err(|e| TransportError::ArmFailed(e.to_string()))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| TransportError::ArmFailed(e.to_string()))?;
        info!(%addr, "serial-over-tcp listening");
        Ok(Self {
            listener,
            peer: None,
            armed: false,
            pending: None,
            partial: Vec::new(),
            last_byte_at: Instant::now(),
            tx_done: false,
        })
    }

    fn accept_peer(&mut self) {
        match self.listener.accept() {
            Ok((stream, addr)) => {
                if stream.set_nonblocking(true).is_err() {
                    return;
                }
                info!(%addr, "host connected");
                self.peer = Some(stream);
                self.partial.clear();
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => warn!("accept failed: {e}"),
        }
    }

    fn drop_peer(&mut self) {
        debug!("host disconnected");
        self.peer = None;
        self.partial.clear();
    }

    fn pump(&mut self) {
        if self.peer.is_none() {
            self.accept_peer();
        }
        let Some(stream) = self.peer.as_mut() else {
            return;
        };

        let mut buf = [0u8; 512];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => {
                    self.drop_peer();
                    return;
                }
                Ok(n) => {
                    if self.armed && self.pending.is_none() {
                        self.partial.extend_from_slice(&buf[..n]);
                        self.last_byte_at = Instant::now();
                    }
                    // bytes arriving while disarmed or with a frame already
                    // pending are dropped, like a disarmed DMA channel
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("read failed: {e}");
                    self.drop_peer();
                    return;
                }
            }
        }

        if !self.partial.is_empty() && self.last_byte_at.elapsed() >= IDLE_GAP {
            self.pending = Some(std::mem::take(&mut self.partial));
        }
    }
}

impl SerialPort for TcpPort {
    fn arm_receive(&mut self) -> Result<(), TransportError> {
        self.armed = true;
        self.pending = None;
        self.partial.clear();
        self.tx_done = false;
        Ok(())
    }

    fn take_received(&mut self) -> Option<Vec<u8>> {
        self.pump();
        self.pending.take()
    }

    fn start_transmit(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let Some(stream) = self.peer.as_mut() else {
            // no peer: treat as completed so the engine fails open
            self.tx_done = true;
            return Ok(());
        };
        match stream.write_all(data).and_then(|()| stream.flush()) {
            Ok(()) => {
                self.tx_done = true;
                Ok(())
            }
            Err(e) => {
                self.drop_peer();
                Err(TransportError::SendFailed(e.to_string()))
            }
        }
    }

    fn transmit_done(&self) -> bool {
        self.tx_done
    }

    fn abort_transmit(&mut self) {
        self.tx_done = false;
    }
}
