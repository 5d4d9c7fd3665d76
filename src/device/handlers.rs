//! Command handlers.
//!
//! One handler per command id, each validating its exact payload length
//! before acting. A handler that rejects its arguments leaves the context
//! silent; the engine then reports a semantic error. Configuration writes
//! persist first and touch the live subsystem only after the save
//! succeeded, so runtime behavior and stored configuration never diverge.

use byteorder::{BigEndian, ByteOrder};
use tracing::debug;

use crate::crypto::Iv;
use crate::hal::{Clock, PowerRegulator, StimulusPins, TempSensor};
use crate::protocol::{Command, CommandContext, CommandDispatcher, MAX_RESP_PAYLOAD};
use crate::sequencer::{Sequencer, Step};
use crate::storage::{ConfigStore, IDENTITY_MAX};
use crate::types::{ErrorCode, FirmwareVersion, RunState, TriggerMode};

/// One dispatch's view of the device.
///
/// Borrowed for a single synchronous callback; nothing here outlives the
/// call that delivered the request.
pub(crate) struct Handlers<'a> {
    pub sequencer: &'a mut Sequencer,
    pub store: &'a mut ConfigStore,
    pub regulator: &'a mut dyn PowerRegulator,
    pub temp: &'a mut dyn TempSensor,
    pub pins: &'a mut dyn StimulusPins,
    pub clock: &'a dyn Clock,
    /// Whether the session runs encrypted (open-port length depends on it).
    pub encrypted: bool,
}

impl CommandDispatcher for Handlers<'_> {
    fn dispatch(&mut self, command: u8, payload: &[u8], ctx: &mut CommandContext) {
        let Some(command) = Command::from_u8(command) else {
            debug!(command, "unknown command ignored");
            return;
        };
        match command {
            Command::Sync => self.sync(payload, ctx),
            Command::Response => {}
            Command::Restart => self.restart(payload, ctx),
            Command::GetHardwareId => self.get_hardware_id(payload, ctx),
            Command::SetHardwareId => self.set_hardware_id(payload, ctx),
            Command::GetFirmware => self.get_firmware(payload, ctx),
            Command::GetSerialNumber => self.get_serial(payload, ctx),
            Command::SetSerialNumber => self.set_serial(payload, ctx),
            Command::GetTemperature => self.get_temperature(payload, ctx),
            Command::GetTempThreshold => self.get_temp_threshold(payload, ctx),
            Command::SetTempThreshold => self.set_temp_threshold(payload, ctx),
            Command::SetIv => self.set_iv(payload, ctx),
            Command::OpenPort => self.open_port(payload, ctx),
            Command::ClosePort => self.close_port(payload, ctx),
            Command::SeqSetState => self.seq_set_state(payload, ctx),
            Command::SeqGetTriggerConfig => self.seq_get_trigger_config(payload, ctx),
            Command::SeqSetTriggerConfig => self.seq_set_trigger_config(payload, ctx),
            Command::SeqGetMaxChannels => self.seq_get_max_channels(payload, ctx),
            Command::SeqSetMaxChannels => self.seq_set_max_channels(payload, ctx),
            Command::SeqGetRepeatCount => self.seq_get_repeat_count(payload, ctx),
            Command::SeqSetRepeatCount => self.seq_set_repeat_count(payload, ctx),
            Command::SeqGetSteps => self.seq_get_steps(payload, ctx),
            Command::SeqSetSteps => self.seq_set_steps(payload, ctx),
            Command::SeqGetDc => self.seq_get_dc(payload, ctx),
            Command::SeqSetDc => self.seq_set_dc(payload, ctx),
            Command::SeqClearSteps => self.seq_clear_steps(payload, ctx),
            Command::SeqSingleStep => self.seq_single_step(payload, ctx),
            Command::SeqGetLedDurations => self.seq_get_led_durations(payload, ctx),
            Command::SeqSetLedDurations => self.seq_set_led_durations(payload, ctx),
            Command::SeqOverCurrent => self.seq_over_current(payload, ctx),
        }
    }

    fn on_sync_timeout(&mut self) {
        self.sequencer
            .set_state(RunState::Stopped, self.clock, self.pins, self.regulator);
    }
}

impl Handlers<'_> {
    fn sync(&mut self, payload: &[u8], ctx: &mut CommandContext) {
        if !payload.is_empty() {
            return;
        }
        let mut answer = [0u8; 11];
        BigEndian::write_u16(&mut answer[0..2], ctx.status_code().as_u16());
        answer[2] = self.sequencer.state() as u8;
        BigEndian::write_i16(&mut answer[3..5], self.temp.deci_celsius());
        BigEndian::write_u16(&mut answer[5..7], self.sequencer.repeat_index());
        BigEndian::write_u16(&mut answer[7..9], self.sequencer.step_index());
        BigEndian::write_u16(&mut answer[9..11], self.sequencer.step_count());
        ctx.respond(ErrorCode::None, &answer);
        ctx.acknowledge_status();
    }

    fn restart(&mut self, payload: &[u8], ctx: &mut CommandContext) {
        if !payload.is_empty() {
            return;
        }
        ctx.respond(ErrorCode::None, &[]);
        ctx.request_restart();
    }

    fn get_hardware_id(&mut self, payload: &[u8], ctx: &mut CommandContext) {
        if !payload.is_empty() {
            return;
        }
        match self.store.load() {
            Ok(()) => ctx.respond(ErrorCode::None, self.store.hw_id().as_bytes()),
            Err(_) => ctx.respond(ErrorCode::Memory, &[]),
        }
    }

    fn set_hardware_id(&mut self, payload: &[u8], ctx: &mut CommandContext) {
        if payload.is_empty() || payload.len() > IDENTITY_MAX {
            return;
        }
        let Ok(value) = std::str::from_utf8(payload) else {
            return;
        };
        match self.store.set_hw_id(value) {
            Ok(()) => ctx.respond(ErrorCode::None, &[]),
            Err(_) => ctx.respond(ErrorCode::Memory, &[]),
        }
    }

    fn get_firmware(&mut self, payload: &[u8], ctx: &mut CommandContext) {
        if !payload.is_empty() {
            return;
        }
        ctx.respond(ErrorCode::None, FirmwareVersion::CURRENT.to_string().as_bytes());
    }

    fn get_serial(&mut self, payload: &[u8], ctx: &mut CommandContext) {
        if !payload.is_empty() {
            return;
        }
        match self.store.load() {
            Ok(()) => ctx.respond(ErrorCode::None, self.store.serial().as_bytes()),
            Err(_) => ctx.respond(ErrorCode::Memory, &[]),
        }
    }

    fn set_serial(&mut self, payload: &[u8], ctx: &mut CommandContext) {
        if payload.is_empty() || payload.len() > IDENTITY_MAX {
            return;
        }
        let Ok(value) = std::str::from_utf8(payload) else {
            return;
        };
        match self.store.set_serial(value) {
            Ok(()) => ctx.respond(ErrorCode::None, &[]),
            Err(_) => ctx.respond(ErrorCode::Memory, &[]),
        }
    }

    fn get_temperature(&mut self, payload: &[u8], ctx: &mut CommandContext) {
        if !payload.is_empty() {
            return;
        }
        let mut answer = [0u8; 2];
        BigEndian::write_i16(&mut answer, self.temp.deci_celsius());
        ctx.respond(ErrorCode::None, &answer);
    }

    fn get_temp_threshold(&mut self, payload: &[u8], ctx: &mut CommandContext) {
        if !payload.is_empty() {
            return;
        }
        let mut answer = [0u8; 2];
        BigEndian::write_i16(&mut answer, self.temp.alarm_deci_celsius());
        ctx.respond(ErrorCode::None, &answer);
    }

    fn set_temp_threshold(&mut self, payload: &[u8], ctx: &mut CommandContext) {
        if payload.len() != 2 {
            return;
        }
        let threshold = BigEndian::read_i16(payload);
        self.store.record_mut().temp_threshold_deci = threshold;
        match self.store.save() {
            Ok(()) => {
                self.temp.set_alarm_deci_celsius(threshold);
                ctx.respond(ErrorCode::None, &[]);
            }
            Err(_) => ctx.respond(ErrorCode::Memory, &[]),
        }
    }

    fn set_iv(&mut self, payload: &[u8], ctx: &mut CommandContext) {
        if payload.len() != 16 {
            return;
        }
        let Ok(iv) = Iv::from_slice(payload) else {
            return;
        };
        match self.store.set_iv(iv) {
            Ok(()) => ctx.respond(ErrorCode::None, &[]),
            Err(_) => ctx.respond(ErrorCode::Memory, &[]),
        }
    }

    fn open_port(&mut self, payload: &[u8], ctx: &mut CommandContext) {
        let expected = if self.encrypted { 16 } else { 0 };
        if payload.len() != expected {
            return;
        }
        ctx.respond(ErrorCode::None, &[]);
        ctx.set_port_open(true);
    }

    fn close_port(&mut self, payload: &[u8], ctx: &mut CommandContext) {
        if !payload.is_empty() {
            return;
        }
        ctx.respond(ErrorCode::None, &[]);
        ctx.set_port_open(false);
    }

    fn seq_set_state(&mut self, payload: &[u8], ctx: &mut CommandContext) {
        if payload.len() != 1 {
            return;
        }
        let ok = RunState::from_u8(payload[0]).is_some_and(|state| {
            self.sequencer
                .set_state(state, self.clock, self.pins, self.regulator)
        });
        self.respond_seq(ok, ctx);
    }

    fn seq_get_trigger_config(&mut self, payload: &[u8], ctx: &mut CommandContext) {
        if !payload.is_empty() {
            return;
        }
        let (mode, pulse_ms) = self.sequencer.trigger_config();
        let mut answer = [0u8; 3];
        answer[0] = mode.to_wire();
        BigEndian::write_u16(&mut answer[1..3], pulse_ms);
        ctx.respond(ErrorCode::None, &answer);
    }

    fn seq_set_trigger_config(&mut self, payload: &[u8], ctx: &mut CommandContext) {
        if payload.len() != 3 {
            return;
        }
        let mode = TriggerMode::from_wire(payload[0]);
        let pulse_ms = BigEndian::read_u16(&payload[1..3]);
        {
            let config = &mut self.store.record_mut().config;
            config.trigger_mode = mode;
            config.trigger_pulse_ms = pulse_ms;
        }
        match self.store.save() {
            Ok(()) => {
                self.sequencer.set_trigger_config(mode, pulse_ms);
                ctx.respond(ErrorCode::None, &[]);
            }
            Err(_) => ctx.respond(ErrorCode::Memory, &[]),
        }
    }

    fn seq_get_max_channels(&mut self, payload: &[u8], ctx: &mut CommandContext) {
        if !payload.is_empty() {
            return;
        }
        ctx.respond(ErrorCode::None, &[self.sequencer.max_channels()]);
    }

    fn seq_set_max_channels(&mut self, payload: &[u8], ctx: &mut CommandContext) {
        if payload.len() != 1 {
            return;
        }
        self.store.record_mut().config.max_channels = payload[0];
        match self.store.save() {
            Ok(()) => {
                let ok = self.sequencer.set_max_channels(payload[0]);
                self.respond_seq(ok, ctx);
            }
            Err(_) => ctx.respond(ErrorCode::Memory, &[]),
        }
    }

    fn seq_get_repeat_count(&mut self, payload: &[u8], ctx: &mut CommandContext) {
        if !payload.is_empty() {
            return;
        }
        let mut answer = [0u8; 2];
        BigEndian::write_u16(&mut answer, self.sequencer.repeat_count());
        ctx.respond(ErrorCode::None, &answer);
    }

    fn seq_set_repeat_count(&mut self, payload: &[u8], ctx: &mut CommandContext) {
        if payload.len() != 2 {
            return;
        }
        let ok = self.sequencer.set_repeat_count(BigEndian::read_u16(payload));
        self.respond_seq(ok, ctx);
    }

    fn seq_get_steps(&mut self, payload: &[u8], ctx: &mut CommandContext) {
        if payload.len() != 4 {
            return;
        }
        let start = BigEndian::read_u16(&payload[0..2]) as usize;
        let count = BigEndian::read_u16(&payload[2..4]) as usize;
        if count * 3 > MAX_RESP_PAYLOAD {
            ctx.respond(ErrorCode::Sequencer, &[]);
            return;
        }
        match self.sequencer.steps(start, count) {
            Some(steps) => {
                let mut answer = Vec::with_capacity(steps.len() * 3);
                for step in steps {
                    answer.push(step.mask.bits());
                    answer.extend_from_slice(&step.duration_ms.to_be_bytes());
                }
                ctx.respond(ErrorCode::None, &answer);
            }
            None => ctx.respond(ErrorCode::Sequencer, &[]),
        }
    }

    fn seq_set_steps(&mut self, payload: &[u8], ctx: &mut CommandContext) {
        if payload.len() % 3 != 0 {
            return;
        }
        let steps: Vec<Step> = payload
            .chunks_exact(3)
            .map(|chunk| Step::new(chunk[0], BigEndian::read_u16(&chunk[1..3])))
            .collect();
        let ok = self.sequencer.append_steps(&steps);
        self.respond_seq(ok, ctx);
    }

    fn seq_get_dc(&mut self, payload: &[u8], ctx: &mut CommandContext) {
        if !payload.is_empty() {
            return;
        }
        match (self.regulator.voltage_mv(), self.regulator.current_ma()) {
            (Some(voltage), Some(current)) => {
                let mut answer = [0u8; 4];
                BigEndian::write_u16(&mut answer[0..2], voltage);
                BigEndian::write_u16(&mut answer[2..4], current);
                ctx.respond(ErrorCode::None, &answer);
            }
            _ => ctx.respond(ErrorCode::Sequencer, &[]),
        }
    }

    fn seq_set_dc(&mut self, payload: &[u8], ctx: &mut CommandContext) {
        if payload.len() != 4 {
            return;
        }
        let voltage = BigEndian::read_u16(&payload[0..2]);
        let current = BigEndian::read_u16(&payload[2..4]);
        {
            let config = &mut self.store.record_mut().config;
            config.voltage_mv = voltage;
            config.current_ma = current;
        }
        match self.store.save() {
            Ok(()) => {
                if !self.regulator.set_voltage_mv(voltage) {
                    ctx.respond(ErrorCode::Sequencer, &[]);
                    return;
                }
                if !self.regulator.set_current_ma(current) {
                    ctx.respond(ErrorCode::Sequencer, &[]);
                    return;
                }
                ctx.respond(ErrorCode::None, &[]);
            }
            Err(_) => ctx.respond(ErrorCode::Memory, &[]),
        }
    }

    fn seq_clear_steps(&mut self, payload: &[u8], ctx: &mut CommandContext) {
        if !payload.is_empty() {
            return;
        }
        let ok = self.sequencer.clear_steps();
        self.respond_seq(ok, ctx);
    }

    fn seq_single_step(&mut self, payload: &[u8], ctx: &mut CommandContext) {
        if payload.len() != 3 {
            return;
        }
        let step = Step::new(payload[0], BigEndian::read_u16(&payload[1..3]));
        let ok = self.sequencer.single_shot(step, self.clock, self.pins);
        self.respond_seq(ok, ctx);
    }

    fn seq_get_led_durations(&mut self, payload: &[u8], ctx: &mut CommandContext) {
        if !payload.is_empty() {
            return;
        }
        let (on_ms, off_ms) = self.sequencer.led_durations();
        let mut answer = [0u8; 4];
        BigEndian::write_u16(&mut answer[0..2], on_ms);
        BigEndian::write_u16(&mut answer[2..4], off_ms);
        ctx.respond(ErrorCode::None, &answer);
    }

    fn seq_set_led_durations(&mut self, payload: &[u8], ctx: &mut CommandContext) {
        if payload.len() != 4 {
            return;
        }
        let on_ms = BigEndian::read_u16(&payload[0..2]);
        let off_ms = BigEndian::read_u16(&payload[2..4]);
        {
            let config = &mut self.store.record_mut().config;
            config.led_on_ms = on_ms;
            config.led_off_ms = off_ms;
        }
        match self.store.save() {
            Ok(()) => {
                self.sequencer.set_led_durations(on_ms, off_ms);
                ctx.respond(ErrorCode::None, &[]);
            }
            Err(_) => ctx.respond(ErrorCode::Memory, &[]),
        }
    }

    fn seq_over_current(&mut self, payload: &[u8], ctx: &mut CommandContext) {
        if !payload.is_empty() {
            return;
        }
        ctx.respond(ErrorCode::None, &[self.regulator.over_current() as u8]);
    }

    fn respond_seq(&mut self, ok: bool, ctx: &mut CommandContext) {
        if ok {
            ctx.respond(ErrorCode::None, &[]);
        } else {
            ctx.respond(ErrorCode::Sequencer, &[]);
        }
    }
}
