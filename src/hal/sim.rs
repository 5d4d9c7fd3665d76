//! Simulated collaborators for the daemon and the test suites.
//!
//! Every type is a cheap cloneable handle over shared state, so a test can
//! keep a handle for inspection while the device owns another.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::debug;

use crate::error::StorageError;
use crate::types::{ResetCause, CHANNEL_COUNT};

use super::{Board, Clock, NvMemory, PowerRegulator, StimulusPins, TempSensor};

/// Manually advanced clock.
#[derive(Debug, Clone, Default)]
pub struct SimClock {
    now: Rc<RefCell<u64>>,
}

impl SimClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, ms: u64) {
        *self.now.borrow_mut() += ms;
    }

    pub fn set(&self, ms: u64) {
        *self.now.borrow_mut() = ms;
    }
}

impl Clock for SimClock {
    fn now_ms(&self) -> u64 {
        *self.now.borrow()
    }
}

#[derive(Debug, Default)]
struct PinState {
    channels: [bool; CHANNEL_COUNT],
    trigger: bool,
    led: bool,
}

/// Simulated output pins.
#[derive(Debug, Clone, Default)]
pub struct SimPins {
    state: Rc<RefCell<PinState>>,
}

impl SimPins {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channel(&self, index: usize) -> bool {
        self.state.borrow().channels[index]
    }

    /// Channel levels as a bitmask, for compact assertions.
    pub fn channel_bits(&self) -> u8 {
        let state = self.state.borrow();
        state
            .channels
            .iter()
            .enumerate()
            .fold(0, |acc, (i, &on)| acc | ((on as u8) << i))
    }

    pub fn trigger_level(&self) -> bool {
        self.state.borrow().trigger
    }

    pub fn led_level(&self) -> bool {
        self.state.borrow().led
    }
}

impl StimulusPins for SimPins {
    fn set_channel(&mut self, index: usize, high: bool) {
        if index < CHANNEL_COUNT {
            self.state.borrow_mut().channels[index] = high;
        }
    }

    fn set_trigger(&mut self, high: bool) {
        self.state.borrow_mut().trigger = high;
    }

    fn trigger(&self) -> bool {
        self.state.borrow().trigger
    }

    fn set_led(&mut self, high: bool) {
        self.state.borrow_mut().led = high;
    }

    fn led(&self) -> bool {
        self.state.borrow().led
    }
}

#[derive(Debug)]
struct RegulatorState {
    present: bool,
    enabled: bool,
    voltage_mv: u16,
    current_ma: u16,
    over_current: bool,
    fault_pending: bool,
    fail_writes: bool,
}

impl Default for RegulatorState {
    fn default() -> Self {
        Self {
            present: true,
            enabled: false,
            voltage_mv: 0,
            current_ma: 0,
            over_current: false,
            fault_pending: false,
            fail_writes: false,
        }
    }
}

/// Simulated power regulator.
#[derive(Debug, Clone, Default)]
pub struct SimRegulator {
    state: Rc<RefCell<RegulatorState>>,
}

impl SimRegulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the IC unreachable (bring-up failure scenarios).
    pub fn set_present(&self, present: bool) {
        self.state.borrow_mut().present = present;
    }

    /// Make the register writes fail.
    pub fn fail_writes(&self, fail: bool) {
        self.state.borrow_mut().fail_writes = fail;
    }

    /// Raise an over-current fault edge.
    pub fn trip_over_current(&self) {
        let mut state = self.state.borrow_mut();
        state.over_current = true;
        state.fault_pending = true;
    }

    pub fn clear_over_current(&self) {
        self.state.borrow_mut().over_current = false;
    }

    pub fn enabled(&self) -> bool {
        self.state.borrow().enabled
    }

    pub fn programmed(&self) -> (u16, u16) {
        let state = self.state.borrow();
        (state.voltage_mv, state.current_ma)
    }
}

impl PowerRegulator for SimRegulator {
    fn probe(&mut self, voltage_mv: u16, current_ma: u16) -> bool {
        let mut state = self.state.borrow_mut();
        if !state.present || state.fail_writes {
            return false;
        }
        state.voltage_mv = voltage_mv;
        state.current_ma = current_ma;
        state.enabled = true;
        true
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.state.borrow_mut().enabled = enabled;
    }

    fn set_voltage_mv(&mut self, millivolts: u16) -> bool {
        let mut state = self.state.borrow_mut();
        if !state.present || state.fail_writes {
            return false;
        }
        state.voltage_mv = millivolts;
        true
    }

    fn voltage_mv(&mut self) -> Option<u16> {
        let state = self.state.borrow();
        state.present.then_some(state.voltage_mv)
    }

    fn set_current_ma(&mut self, milliamps: u16) -> bool {
        let mut state = self.state.borrow_mut();
        if !state.present || state.fail_writes {
            return false;
        }
        state.current_ma = milliamps;
        true
    }

    fn current_ma(&mut self) -> Option<u16> {
        let state = self.state.borrow();
        state.present.then_some(state.current_ma)
    }

    fn over_current(&self) -> bool {
        self.state.borrow().over_current
    }

    fn take_fault(&mut self) -> bool {
        std::mem::take(&mut self.state.borrow_mut().fault_pending)
    }
}

#[derive(Debug)]
struct TempState {
    temp_deci: i16,
    threshold_deci: i16,
    alarm_pending: bool,
    in_alarm: bool,
}

impl Default for TempState {
    fn default() -> Self {
        Self {
            temp_deci: 250,
            threshold_deci: 550,
            alarm_pending: false,
            in_alarm: false,
        }
    }
}

/// Simulated temperature sensor.
#[derive(Debug, Clone, Default)]
pub struct SimTemp {
    state: Rc<RefCell<TempState>>,
}

impl SimTemp {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a new filtered reading; crossing the threshold raises the alarm
    /// edge.
    pub fn set_temp(&self, deci_celsius: i16) {
        let mut state = self.state.borrow_mut();
        state.temp_deci = deci_celsius;
        if deci_celsius > state.threshold_deci {
            if !state.in_alarm {
                state.in_alarm = true;
                state.alarm_pending = true;
            }
        } else {
            state.in_alarm = false;
        }
    }
}

impl TempSensor for SimTemp {
    fn deci_celsius(&self) -> i16 {
        self.state.borrow().temp_deci
    }

    fn alarm_deci_celsius(&self) -> i16 {
        self.state.borrow().threshold_deci
    }

    fn set_alarm_deci_celsius(&mut self, threshold: i16) {
        self.state.borrow_mut().threshold_deci = threshold;
    }

    fn take_alarm(&mut self) -> bool {
        std::mem::take(&mut self.state.borrow_mut().alarm_pending)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    data: Vec<u8>,
    fail_writes: bool,
}

/// In-memory non-volatile storage.
#[derive(Debug, Clone)]
pub struct MemoryNv {
    state: Rc<RefCell<MemoryState>>,
    capacity: usize,
}

impl MemoryNv {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Rc::new(RefCell::new(MemoryState {
                data: vec![0; capacity],
                fail_writes: false,
            })),
            capacity,
        }
    }

    /// Make writes fail (save-failure scenarios).
    pub fn fail_writes(&self, fail: bool) {
        self.state.borrow_mut().fail_writes = fail;
    }

    pub fn contents(&self) -> Vec<u8> {
        self.state.borrow().data.clone()
    }

    /// Corrupt a byte in place.
    pub fn corrupt(&self, offset: usize) {
        self.state.borrow_mut().data[offset] ^= 0xFF;
    }
}

impl NvMemory for MemoryNv {
    fn capacity(&self) -> usize {
        self.capacity
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<(), StorageError> {
        let state = self.state.borrow();
        if buf.len() > state.data.len() {
            return Err(StorageError::ReadFailed("out of bounds".into()));
        }
        buf.copy_from_slice(&state.data[..buf.len()]);
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<(), StorageError> {
        let mut state = self.state.borrow_mut();
        if state.fail_writes {
            return Err(StorageError::WriteFailed("injected".into()));
        }
        if data.len() > self.capacity {
            return Err(StorageError::WriteFailed("record exceeds capacity".into()));
        }
        state.data[..data.len()].copy_from_slice(data);
        Ok(())
    }
}

#[derive(Debug)]
struct BoardState {
    watchdog_refreshes: u64,
    reset_cause: ResetCause,
    reset_requested: bool,
    beeps: u32,
}

impl Default for BoardState {
    fn default() -> Self {
        Self {
            watchdog_refreshes: 0,
            reset_cause: ResetCause::PowerOn,
            reset_requested: false,
            beeps: 0,
        }
    }
}

/// Simulated board plumbing. Delays advance an attached [`SimClock`] so the
/// bring-up wait stays observable in tests.
#[derive(Debug, Clone, Default)]
pub struct SimBoard {
    state: Rc<RefCell<BoardState>>,
    clock: Option<SimClock>,
}

impl SimBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Couple delays to a simulated clock.
    pub fn with_clock(clock: SimClock) -> Self {
        Self {
            state: Rc::default(),
            clock: Some(clock),
        }
    }

    pub fn set_reset_cause(&self, cause: ResetCause) {
        self.state.borrow_mut().reset_cause = cause;
    }

    pub fn watchdog_refreshes(&self) -> u64 {
        self.state.borrow().watchdog_refreshes
    }

    pub fn reset_requested(&self) -> bool {
        self.state.borrow().reset_requested
    }

    pub fn beeps(&self) -> u32 {
        self.state.borrow().beeps
    }
}

impl Board for SimBoard {
    fn refresh_watchdog(&mut self) {
        self.state.borrow_mut().watchdog_refreshes += 1;
    }

    fn delay_ms(&mut self, ms: u32) {
        if let Some(clock) = &self.clock {
            clock.advance(ms as u64);
        }
    }

    fn reset_cause(&mut self) -> ResetCause {
        let mut state = self.state.borrow_mut();
        std::mem::replace(&mut state.reset_cause, ResetCause::Unknown)
    }

    fn system_reset(&mut self) {
        debug!("system reset requested");
        self.state.borrow_mut().reset_requested = true;
    }

    fn beep(&mut self) {
        self.state.borrow_mut().beeps += 1;
    }
}
