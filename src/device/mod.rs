//! The device aggregate.
//!
//! Composes the configuration store, the stimulation sequencer, the
//! protocol engine and the external collaborators into one owned object
//! with an explicit lifecycle: construct at boot, `poll()` once per
//! cooperative scheduler pass, drop at shutdown. Hardware interrupts never
//! reach this layer; their one-shot flags are consumed through the
//! collaborator contracts.

mod handlers;

use tracing::{error, info, warn};

use crate::crypto::CipherKey;
use crate::error::Result;
use crate::hal::{Board, Clock, NvMemory, PowerRegulator, StimulusPins, TempSensor};
use crate::protocol::{ComConfig, ComEngine, EngineEvent};
use crate::sequencer::{Sequencer, SequencerConfig};
use crate::storage::ConfigStore;
use crate::transport::SerialPort;
use crate::types::{RunState, StatusCode};

use handlers::Handlers;

/// The device's external collaborators, handed over at boot.
pub struct Peripherals {
    pub port: Box<dyn SerialPort>,
    pub pins: Box<dyn StimulusPins>,
    pub clock: Box<dyn Clock>,
    pub regulator: Box<dyn PowerRegulator>,
    pub temp: Box<dyn TempSensor>,
    pub board: Box<dyn Board>,
    pub memory: Box<dyn NvMemory>,
}

/// Outcome of one scheduler pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Continue,
    /// A restart command was acknowledged and the system reset was issued.
    RestartRequested,
}

/// The assembled stimulation device.
pub struct Device {
    store: ConfigStore,
    sequencer: Sequencer,
    engine: ComEngine,
    port: Box<dyn SerialPort>,
    pins: Box<dyn StimulusPins>,
    clock: Box<dyn Clock>,
    regulator: Box<dyn PowerRegulator>,
    temp: Box<dyn TempSensor>,
    board: Box<dyn Board>,
}

impl Device {
    /// Boot the device.
    ///
    /// Opens the configuration store (structural mismatches are fatal),
    /// configures the thermal alarm, brings up the power regulator with the
    /// stored supply limits (bounded retries, fatal on exhaustion), starts
    /// the protocol engine with the stored session IV, and arms reception.
    pub fn new(com: ComConfig, peripherals: Peripherals) -> Result<Self> {
        let Peripherals {
            mut port,
            pins,
            clock,
            mut regulator,
            mut temp,
            mut board,
            memory,
        } = peripherals;

        let store = ConfigStore::open(memory)?;
        let stored = store.record().clone();

        temp.set_alarm_deci_celsius(stored.temp_threshold_deci);

        let mut sequencer = Sequencer::new(SequencerConfig {
            trigger_mode: stored.config.trigger_mode,
            trigger_pulse_ms: stored.config.trigger_pulse_ms,
            max_channels: stored.config.max_channels,
            repeat_count: 1,
            led_on_ms: stored.config.led_on_ms,
            led_off_ms: stored.config.led_off_ms,
        });
        sequencer.power_up(
            stored.config.voltage_mv,
            stored.config.current_ma,
            &mut *regulator,
            &mut *board,
        )?;

        let mut engine = ComEngine::new(com, CipherKey::device_default(), stored.iv, &*clock)?;
        if let Some(status) = board.reset_cause().status_code() {
            engine.set_status(status);
        }
        engine.arm(&mut *port)?;
        board.beep();
        info!(id = %engine.config().device_id, "device up");

        Ok(Self {
            store,
            sequencer,
            engine,
            port,
            pins,
            clock,
            regulator,
            temp,
            board,
        })
    }

    /// Run one cooperative scheduler pass in fixed order: watchdog refresh,
    /// thermal supervisor, power supervisor, sequencer tick, protocol
    /// engine.
    pub fn poll(&mut self) -> PollOutcome {
        self.board.refresh_watchdog();

        if self.temp.take_alarm() {
            warn!(
                deci_celsius = self.temp.deci_celsius(),
                "temperature alarm, stopping stimulation"
            );
            self.sequencer.set_state(
                RunState::Stopped,
                &*self.clock,
                &mut *self.pins,
                &mut *self.regulator,
            );
            self.board.beep();
        }

        if self.regulator.take_fault() {
            warn!("over-current fault, stopping stimulation");
            self.sequencer.set_state(
                RunState::Stopped,
                &*self.clock,
                &mut *self.pins,
                &mut *self.regulator,
            );
            self.engine.set_status(StatusCode::OverCurrent);
        }

        self.sequencer
            .tick(&*self.clock, &mut *self.pins, &mut *self.regulator);

        let encrypted = self.engine.config().encrypt;
        let event = {
            let mut handlers = Handlers {
                sequencer: &mut self.sequencer,
                store: &mut self.store,
                regulator: &mut *self.regulator,
                temp: &mut *self.temp,
                pins: &mut *self.pins,
                clock: &*self.clock,
                encrypted,
            };
            self.engine
                .poll(&*self.clock, &mut *self.port, &mut handlers)
        };

        match event {
            Some(EngineEvent::RestartRequested) => {
                info!("restart request honored");
                self.board.system_reset();
                PollOutcome::RestartRequested
            }
            Some(EngineEvent::NeedsReinit) => {
                // re-derive the session IV from persistent storage
                if let Err(e) = self.store.load() {
                    error!("storage reload failed: {e}");
                }
                let iv = self.store.iv();
                if let Err(e) = self.engine.reinit(iv, &*self.clock, &mut *self.port) {
                    error!("communication reinit failed: {e}");
                }
                PollOutcome::Continue
            }
            None => PollOutcome::Continue,
        }
    }

    pub fn sequencer(&self) -> &Sequencer {
        &self.sequencer
    }

    pub fn engine(&self) -> &ComEngine {
        &self.engine
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }
}
