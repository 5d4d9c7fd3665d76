//! Shared test rig: a booted device over an in-memory serial line, plus the
//! host's side of the codec.

// not every suite exercises every helper
#![allow(dead_code)]

use tactum::crypto::{CipherKey, Iv};
use tactum::device::{Device, Peripherals, PollOutcome};
use tactum::hal::sim::{MemoryNv, SimBoard, SimClock, SimPins, SimRegulator, SimTemp};
use tactum::protocol::{self, ComConfig};
use tactum::storage::RECORD_SIZE;
use tactum::transport::LoopbackPort;
use tactum::types::{DeviceId, ErrorCode};

pub const DEVICE_ADDR: u8 = 0xF0;
pub const BROADCAST_ADDR: u8 = 0xEF;

pub struct Rig {
    pub device: Device,
    pub port: LoopbackPort,
    pub clock: SimClock,
    pub pins: SimPins,
    pub regulator: SimRegulator,
    pub temp: SimTemp,
    pub board: SimBoard,
    pub memory: MemoryNv,
    pub key: CipherKey,
    /// Host-side replay counter.
    pub counter: u16,
    /// IV the device loaded at boot.
    pub session_iv: Iv,
    /// IV of the most recent exchange (responses decipher with it).
    pub active_iv: Iv,
    pub encrypt: bool,
}

impl Rig {
    pub fn new(encrypt: bool) -> Self {
        Self::with_memory(encrypt, MemoryNv::new(RECORD_SIZE))
    }

    /// Boot a device against existing storage (reboot scenarios).
    pub fn with_memory(encrypt: bool, memory: MemoryNv) -> Self {
        let clock = SimClock::new();
        let port = LoopbackPort::new();
        let pins = SimPins::new();
        let regulator = SimRegulator::new();
        let temp = SimTemp::new();
        let board = SimBoard::with_clock(clock.clone());

        let com = ComConfig {
            device_id: DeviceId(DEVICE_ADDR),
            encrypt,
            ..ComConfig::default()
        };
        let device = Device::new(
            com,
            Peripherals {
                port: Box::new(port.clone()),
                pins: Box::new(pins.clone()),
                clock: Box::new(clock.clone()),
                regulator: Box::new(regulator.clone()),
                temp: Box::new(temp.clone()),
                board: Box::new(board.clone()),
                memory: Box::new(memory.clone()),
            },
        )
        .expect("device boots");

        let session_iv = device.store().iv();
        Self {
            device,
            port,
            clock,
            pins,
            regulator,
            temp,
            board,
            memory,
            key: CipherKey::device_default(),
            counter: 0,
            session_iv,
            active_iv: session_iv,
            encrypt,
        }
    }

    pub fn polls(&mut self, n: usize) -> PollOutcome {
        let mut outcome = PollOutcome::Continue;
        for _ in 0..n {
            outcome = self.device.poll();
        }
        outcome
    }

    /// Encode and queue a request with correct counter discipline.
    pub fn send(&mut self, command: u8, payload: &[u8]) {
        self.send_to(DEVICE_ADDR, command, payload);
    }

    pub fn send_to(&mut self, addr: u8, command: u8, payload: &[u8]) {
        let frame = if self.encrypt {
            let session_control = matches!(command, 0x2D | 0x2E | 0x2F);
            let (iv, counter) = if session_control {
                self.counter = 1;
                (Iv::FACTORY, 1)
            } else {
                self.counter = self.counter.wrapping_add(1);
                (self.session_iv, self.counter)
            };
            self.active_iv = iv;
            protocol::build_request(addr, command, payload, Some((&self.key, &iv, counter)))
                .expect("request encodes")
        } else {
            protocol::build_request(addr, command, payload, None).expect("request encodes")
        };
        self.port.host_send(&frame);
    }

    pub fn send_raw(&mut self, frame: &[u8]) {
        self.port.host_send(frame);
    }

    pub fn take_response(&mut self) -> Option<(ErrorCode, Vec<u8>)> {
        let raw = self.port.host_recv()?;
        let cipher = self.encrypt.then_some((&self.key, &self.active_iv));
        Some(
            protocol::parse_response(&raw, DeviceId(DEVICE_ADDR), cipher)
                .expect("response parses"),
        )
    }

    /// Send, drive the engine through a full cycle, return the response.
    pub fn exchange(&mut self, command: u8, payload: &[u8]) -> (ErrorCode, Vec<u8>) {
        self.send(command, payload);
        self.polls(6);
        self.take_response().expect("response expected")
    }

    /// Sync and split the reply into its fields:
    /// (status, run-state, temp, repeat idx, step idx, step count).
    pub fn sync(&mut self) -> (u16, u8, i16, u16, u16, u16) {
        let (code, body) = self.exchange(0x00, &[]);
        assert_eq!(code, ErrorCode::None, "sync must succeed");
        assert_eq!(body.len(), 11, "sync reply is 11 bytes");
        (
            u16::from_be_bytes([body[0], body[1]]),
            body[2],
            i16::from_be_bytes([body[3], body[4]]),
            u16::from_be_bytes([body[5], body[6]]),
            u16::from_be_bytes([body[7], body[8]]),
            u16::from_be_bytes([body[9], body[10]]),
        )
    }

    /// Upload steps, set the repeat count and start stimulation.
    pub fn start_sequence(&mut self, steps: &[(u8, u16)], repeats: u16) {
        let mut payload = Vec::new();
        for &(mask, duration) in steps {
            payload.push(mask);
            payload.extend_from_slice(&duration.to_be_bytes());
        }
        assert_eq!(self.exchange(0x68, &payload).0, ErrorCode::None);
        assert_eq!(
            self.exchange(0x66, &repeats.to_be_bytes()).0,
            ErrorCode::None
        );
        assert_eq!(self.exchange(0x60, &[1]).0, ErrorCode::None);
    }
}
