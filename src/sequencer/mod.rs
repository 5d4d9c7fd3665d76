//! Stimulation sequencer.
//!
//! Owns the ordered step table and the Stop/Active/Pause run-state machine,
//! and mediates every physical channel, trigger and indicator-LED output.
//! `tick()` runs once per scheduler pass and advances the sequence on
//! elapsed step durations, manages the trigger pulse and the free-running
//! LED blink, and forces outputs inactive whenever stimulation is not
//! running.

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::hal::{Board, Clock, PowerRegulator, StimulusPins};
use crate::types::{ChannelMask, RunState, TriggerMode, CHANNEL_COUNT};

/// Step table capacity.
pub const MAX_STEPS: usize = 0x1_0000;

/// Duration sentinel marking a step that never times out.
pub const NO_LIMIT_DURATION: u16 = 0xFFFF;

/// Power regulator bring-up attempts before the device gives up.
pub const POWER_PROBE_ATTEMPTS: u32 = 500;

/// Delay between bring-up attempts.
const POWER_PROBE_DELAY_MS: u32 = 10;

/// One entry of the stimulation sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Step {
    pub mask: ChannelMask,
    pub duration_ms: u16,
}

impl Step {
    pub fn new(mask: u8, duration_ms: u16) -> Self {
        Self {
            mask: ChannelMask(mask),
            duration_ms,
        }
    }
}

/// Live sequencer configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencerConfig {
    pub trigger_mode: TriggerMode,
    pub trigger_pulse_ms: u16,
    pub max_channels: u8,
    /// How many times the step table is played before stopping.
    pub repeat_count: u16,
    pub led_on_ms: u16,
    pub led_off_ms: u16,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            trigger_mode: TriggerMode::Pulsed,
            trigger_pulse_ms: 20,
            max_channels: 3,
            repeat_count: 1,
            led_on_ms: 400,
            led_off_ms: 100,
        }
    }
}

/// The stimulation sequencer.
pub struct Sequencer {
    config: SequencerConfig,
    steps: Vec<Step>,
    state: RunState,
    step_index: u16,
    repeat_index: u16,
    step_started_at: u64,
    trigger_pulsed_at: u64,
    led_toggled_at: u64,
}

impl Sequencer {
    pub fn new(config: SequencerConfig) -> Self {
        Self {
            config,
            steps: Vec::new(),
            state: RunState::Stopped,
            step_index: 0,
            repeat_index: 0,
            step_started_at: 0,
            trigger_pulsed_at: 0,
            led_toggled_at: 0,
        }
    }

    /// Bring up the power regulator with the stored supply limits.
    ///
    /// Retries with the watchdog refreshed on every attempt so the wait
    /// cannot cause a spurious reset. Exhausting the budget is fatal:
    /// driving outputs without validated limits is not an option.
    pub fn power_up(
        &mut self,
        voltage_mv: u16,
        current_ma: u16,
        regulator: &mut dyn PowerRegulator,
        board: &mut dyn Board,
    ) -> Result<()> {
        for attempt in 0..POWER_PROBE_ATTEMPTS {
            board.refresh_watchdog();
            board.delay_ms(POWER_PROBE_DELAY_MS);
            if regulator.probe(voltage_mv, current_ma) {
                if attempt > 0 {
                    debug!(attempt, "power regulator came up");
                }
                return Ok(());
            }
        }
        Err(Error::Fatal(
            "power regulator did not come up within the retry budget".into(),
        ))
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn config(&self) -> &SequencerConfig {
        &self.config
    }

    /// Index of the step currently playing.
    pub fn step_index(&self) -> u16 {
        self.step_index
    }

    /// Index of the current sequence repetition.
    pub fn repeat_index(&self) -> u16 {
        self.repeat_index
    }

    /// Number of populated steps (wire width; the full table reads as 0).
    pub fn step_count(&self) -> u16 {
        self.steps.len() as u16
    }

    /// Transition the run state.
    ///
    /// Stop is always legal and idempotent. Active is legal from Stop with a
    /// non-empty table or from Pause; both re-latch the current step's pins
    /// immediately and restart the step clock. Pause is legal from Active
    /// only.
    pub fn set_state(
        &mut self,
        target: RunState,
        clock: &dyn Clock,
        pins: &mut dyn StimulusPins,
        regulator: &mut dyn PowerRegulator,
    ) -> bool {
        match target {
            RunState::Stopped => {
                self.clear_outputs(pins);
                self.step_index = 0;
                self.repeat_index = 0;
                regulator.set_enabled(true);
                if self.state != RunState::Stopped {
                    info!("stimulation stopped");
                }
                self.state = RunState::Stopped;
                true
            }
            RunState::Active => {
                if self.state == RunState::Stopped && !self.steps.is_empty() {
                    self.step_started_at = clock.now_ms();
                    self.latch_step_pins(self.steps[0].mask, clock, pins);
                    self.state = RunState::Active;
                    info!(steps = self.steps.len(), repeats = self.config.repeat_count, "stimulation started");
                    true
                } else if self.state == RunState::Paused {
                    self.step_started_at = clock.now_ms();
                    let mask = self.steps[self.step_index as usize].mask;
                    self.latch_step_pins(mask, clock, pins);
                    self.state = RunState::Active;
                    info!(step = self.step_index, "stimulation resumed");
                    true
                } else {
                    false
                }
            }
            RunState::Paused => {
                if self.state == RunState::Active {
                    self.clear_outputs(pins);
                    self.state = RunState::Paused;
                    info!(step = self.step_index, "stimulation paused");
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Advance the sequence and manage trigger/LED timing. Called every
    /// scheduler pass.
    pub fn tick(
        &mut self,
        clock: &dyn Clock,
        pins: &mut dyn StimulusPins,
        regulator: &mut dyn PowerRegulator,
    ) {
        let now = clock.now_ms();
        if self.state != RunState::Active {
            // safety default: outputs inactive while not stimulating
            pins.set_trigger(false);
            pins.set_led(false);
            return;
        }

        let Some(step) = self.steps.get(self.step_index as usize).copied() else {
            warn!(index = self.step_index, "step index out of table, stopping");
            self.set_state(RunState::Stopped, clock, pins, regulator);
            return;
        };

        if step.duration_ms != NO_LIMIT_DURATION
            && now.saturating_sub(self.step_started_at) >= u64::from(step.duration_ms)
        {
            self.step_started_at = now;
            self.step_index += 1;
            if usize::from(self.step_index) >= self.steps.len() {
                self.step_index = 0;
                self.repeat_index += 1;
                if self.repeat_index == self.config.repeat_count {
                    self.set_state(RunState::Stopped, clock, pins, regulator);
                    return;
                }
                self.latch_step_pins(self.steps[0].mask, clock, pins);
            } else {
                let mask = self.steps[self.step_index as usize].mask;
                self.latch_step_pins(mask, clock, pins);
            }
        }

        // auto-clear the trigger pulse
        if self.config.trigger_mode == TriggerMode::Pulsed
            && pins.trigger()
            && now.saturating_sub(self.trigger_pulsed_at) >= u64::from(self.config.trigger_pulse_ms)
        {
            pins.set_trigger(false);
        }

        // free-running indicator blink
        if !pins.led() {
            if now.saturating_sub(self.led_toggled_at) >= u64::from(self.config.led_on_ms) {
                self.led_toggled_at = now;
                pins.set_led(true);
            }
        } else if now.saturating_sub(self.led_toggled_at) >= u64::from(self.config.led_off_ms) {
            self.led_toggled_at = now;
            pins.set_led(false);
        }
    }

    /// Append steps, all-or-nothing.
    ///
    /// The whole batch is rejected if it would overflow the table or if any
    /// step selects more channels than the configured maximum; nothing is
    /// appended in that case.
    pub fn append_steps(&mut self, steps: &[Step]) -> bool {
        if steps.len() > MAX_STEPS - self.steps.len() {
            debug!(
                requested = steps.len(),
                free = MAX_STEPS - self.steps.len(),
                "step batch exceeds capacity"
            );
            return false;
        }
        if let Some(bad) = steps
            .iter()
            .find(|s| s.mask.active_channels() > self.config.max_channels)
        {
            debug!(mask = %bad.mask, max = self.config.max_channels, "step selects too many channels");
            return false;
        }
        self.steps.extend_from_slice(steps);
        true
    }

    /// Read back `count` steps starting at `start_index`.
    ///
    /// Bounds are checked against the table capacity; entries beyond the
    /// populated length read back zeroed.
    pub fn steps(&self, start_index: usize, count: usize) -> Option<Vec<Step>> {
        if start_index + count > MAX_STEPS {
            return None;
        }
        Some(
            (start_index..start_index + count)
                .map(|i| self.steps.get(i).copied().unwrap_or_default())
                .collect(),
        )
    }

    /// Replace the table with a single step and run it immediately.
    ///
    /// A zero mask or a zero duration means "go to Stop now", not "run a
    /// zero-length step".
    pub fn single_shot(
        &mut self,
        step: Step,
        clock: &dyn Clock,
        pins: &mut dyn StimulusPins,
    ) -> bool {
        if step.mask.active_channels() > self.config.max_channels {
            return false;
        }
        self.reset_playback();
        self.steps.clear();
        self.steps.push(step);
        if step.mask.active_channels() == 0 || step.duration_ms == 0 {
            self.state = RunState::Stopped;
            self.clear_outputs(pins);
        } else {
            self.state = RunState::Active;
            self.step_started_at = clock.now_ms();
            self.latch_step_pins(step.mask, clock, pins);
        }
        true
    }

    /// Erase the step table. Only legal while stopped.
    pub fn clear_steps(&mut self) -> bool {
        if self.state != RunState::Stopped {
            return false;
        }
        self.steps.clear();
        self.reset_playback();
        true
    }

    pub fn trigger_config(&self) -> (TriggerMode, u16) {
        (self.config.trigger_mode, self.config.trigger_pulse_ms)
    }

    pub fn set_trigger_config(&mut self, mode: TriggerMode, pulse_ms: u16) {
        self.config.trigger_mode = mode;
        self.config.trigger_pulse_ms = pulse_ms;
    }

    pub fn max_channels(&self) -> u8 {
        self.config.max_channels
    }

    /// Set the maximum simultaneously active channels, `1..=7`.
    pub fn set_max_channels(&mut self, max: u8) -> bool {
        if max == 0 || usize::from(max) > CHANNEL_COUNT {
            return false;
        }
        self.config.max_channels = max;
        true
    }

    pub fn repeat_count(&self) -> u16 {
        self.config.repeat_count
    }

    /// Set how many times the table plays; zero is rejected.
    pub fn set_repeat_count(&mut self, count: u16) -> bool {
        if count == 0 {
            return false;
        }
        self.config.repeat_count = count;
        true
    }

    pub fn led_durations(&self) -> (u16, u16) {
        (self.config.led_on_ms, self.config.led_off_ms)
    }

    pub fn set_led_durations(&mut self, on_ms: u16, off_ms: u16) {
        self.config.led_on_ms = on_ms;
        self.config.led_off_ms = off_ms;
    }

    fn reset_playback(&mut self) {
        self.step_index = 0;
        self.repeat_index = 0;
        self.step_started_at = 0;
        self.trigger_pulsed_at = 0;
        self.led_toggled_at = 0;
    }

    fn clear_outputs(&mut self, pins: &mut dyn StimulusPins) {
        pins.set_trigger(false);
        for i in 0..CHANNEL_COUNT {
            pins.set_channel(i, false);
        }
    }

    /// Drive the channel pins for a step and apply the trigger rule.
    ///
    /// Pulsed mode raises the trigger whenever a step with active channels
    /// is latched and stamps the pulse clock; with no active channels the
    /// line is left to the auto-clear logic. Held mode makes the trigger
    /// follow the step's own trigger bit.
    fn latch_step_pins(&mut self, mask: ChannelMask, clock: &dyn Clock, pins: &mut dyn StimulusPins) {
        let mut active = 0u8;
        for i in 0..CHANNEL_COUNT {
            let high = mask.channel(i);
            pins.set_channel(i, high);
            if high {
                active += 1;
            }
        }
        match self.config.trigger_mode {
            TriggerMode::Pulsed => {
                if active > 0 {
                    self.trigger_pulsed_at = clock.now_ms();
                    pins.set_trigger(true);
                }
            }
            TriggerMode::Held => {
                pins.set_trigger(mask.trigger_bit());
            }
        }
    }
}
