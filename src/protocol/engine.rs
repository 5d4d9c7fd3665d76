//! Protocol state machine.
//!
//! A continuously cycling five-state engine: wait for a frame, validate the
//! envelope, decrypt and enforce the replay counter, dispatch to a command
//! handler, transmit the response. Exactly one response is produced per
//! accepted request, none for broadcast. Transport faults tear the session
//! down and rebuild it.

use byteorder::{BigEndian, ByteOrder};
use tracing::{debug, trace, warn};

use crate::crypto::{self, CipherKey, Iv};
use crate::error::{Error, FrameError, Result};
use crate::hal::Clock;
use crate::transport::SerialPort;
use crate::types::{DeviceId, ErrorCode, StatusCode};

use super::frame;
use super::session::{ComState, ProtocolSession};
use super::Command;

/// Protocol engine configuration.
#[derive(Debug, Clone)]
pub struct ComConfig {
    /// Assigned device address.
    pub device_id: DeviceId,

    /// Whether payloads are enciphered and replay-protected.
    pub encrypt: bool,

    /// Without a sync exchange for this long, the device reports a lost
    /// synchronization episode and stops stimulation.
    pub sync_timeout_ms: u64,

    /// In-flight transmissions are aborted after this long.
    pub tx_timeout_ms: u64,

    /// Code reported when the declared length disagrees with the received
    /// length. The terminator and length checks are distinct detection
    /// points that share the EOF code on the wire by default; flagged for
    /// review rather than silently changed.
    pub length_error_code: ErrorCode,
}

impl Default for ComConfig {
    fn default() -> Self {
        Self {
            device_id: DeviceId::default(),
            encrypt: true,
            sync_timeout_ms: 1000,
            tx_timeout_ms: 50,
            length_error_code: ErrorCode::Eof,
        }
    }
}

/// Engine outcomes that need the owning device to act.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEvent {
    /// A restart command was acknowledged; perform the system reset.
    RestartRequested,
    /// The transport faulted; rebuild the session with the stored IV.
    NeedsReinit,
}

/// Side effects a command handler may request for the current exchange.
///
/// Handlers never touch the session directly; the engine applies the
/// collected effects after dispatch returns.
#[derive(Debug)]
pub struct CommandContext {
    status_code: StatusCode,
    response: Option<(ErrorCode, Vec<u8>)>,
    open_request: Option<bool>,
    restart: bool,
    ack_status: bool,
}

impl CommandContext {
    fn new(status_code: StatusCode) -> Self {
        Self {
            status_code,
            response: None,
            open_request: None,
            restart: false,
            ack_status: false,
        }
    }

    /// Produce the response for this request. A handler that finds its
    /// arguments invalid must not respond; the engine then reports a
    /// semantic error.
    pub fn respond(&mut self, error: ErrorCode, payload: &[u8]) {
        self.response = Some((error, payload.to_vec()));
    }

    /// The deferred status code pending for the next sync exchange.
    pub fn status_code(&self) -> StatusCode {
        self.status_code
    }

    /// Mark the deferred status code as reported; it resets after this
    /// exchange unless it was `NoError`.
    pub fn acknowledge_status(&mut self) {
        self.ack_status = true;
    }

    /// Toggle the open-port flag.
    pub fn set_port_open(&mut self, open: bool) {
        self.open_request = Some(open);
    }

    /// Schedule a system reset once the acknowledgment is out.
    pub fn request_restart(&mut self) {
        self.restart = true;
    }

    pub fn has_response(&self) -> bool {
        self.response.is_some()
    }
}

/// Routes validated commands into the domain.
pub trait CommandDispatcher {
    /// Handle one validated command. `payload` is the decrypted inner
    /// payload (replay counter stripped).
    fn dispatch(&mut self, command: u8, payload: &[u8], ctx: &mut CommandContext);

    /// Called once per lost-sync episode.
    fn on_sync_timeout(&mut self);
}

/// The communication engine: session, codec and state machine.
pub struct ComEngine {
    config: ComConfig,
    key: CipherKey,
    session: ProtocolSession,
}

impl ComEngine {
    pub fn new(
        config: ComConfig,
        key: CipherKey,
        session_iv: Iv,
        clock: &dyn Clock,
    ) -> Result<Self> {
        if DeviceId::new(config.device_id.as_u8()).is_none() {
            return Err(Error::InvalidConfig(format!(
                "device id {} below the assignable floor",
                config.device_id
            )));
        }
        let session = ProtocolSession::new(config.device_id, session_iv, clock.now_ms());
        Ok(Self {
            config,
            key,
            session,
        })
    }

    pub fn config(&self) -> &ComConfig {
        &self.config
    }

    pub fn session(&self) -> &ProtocolSession {
        &self.session
    }

    pub fn is_open(&self) -> bool {
        self.session.open
    }

    pub fn status(&self) -> StatusCode {
        self.session.status_code
    }

    /// Record a deferred status code (latched until the next sync reports it).
    pub fn set_status(&mut self, code: StatusCode) {
        self.session.set_status_code(code);
    }

    /// Arm reception for the first time.
    pub fn arm(&mut self, port: &mut dyn SerialPort) -> Result<()> {
        port.arm_receive()?;
        self.session.state = ComState::Idle;
        Ok(())
    }

    /// Rebuild the session after a transport fault, keeping the device id
    /// and the freshly re-derived session IV.
    pub fn reinit(
        &mut self,
        session_iv: Iv,
        clock: &dyn Clock,
        port: &mut dyn SerialPort,
    ) -> Result<()> {
        debug!("reinitializing communication subsystem");
        self.session = ProtocolSession::new(self.config.device_id, session_iv, clock.now_ms());
        self.arm(port)
    }

    /// Run one pass of the state machine.
    pub fn poll(
        &mut self,
        clock: &dyn Clock,
        port: &mut dyn SerialPort,
        dispatcher: &mut dyn CommandDispatcher,
    ) -> Option<EngineEvent> {
        match self.session.state {
            ComState::Idle => self.state_idle(clock, port, dispatcher),
            ComState::GotData => {
                self.state_got_data(clock, port);
                None
            }
            ComState::SemanticCheck => {
                self.state_semantic_check(clock, port, dispatcher);
                None
            }
            ComState::Sending => {
                self.state_sending(clock, port);
                None
            }
            ComState::Error => Some(EngineEvent::NeedsReinit),
        }
    }

    fn state_idle(
        &mut self,
        clock: &dyn Clock,
        port: &mut dyn SerialPort,
        dispatcher: &mut dyn CommandDispatcher,
    ) -> Option<EngineEvent> {
        if let Some(frame) = port.take_received() {
            trace!(len = frame.len(), "frame received");
            self.session.rx = frame;
            self.session.state = ComState::GotData;
        }
        if self.session.restart_pending {
            return Some(EngineEvent::RestartRequested);
        }
        if !self.session.sync_lost_reported
            && clock.now_ms().saturating_sub(self.session.last_sync_at)
                >= self.config.sync_timeout_ms
        {
            self.session.last_sync_at = clock.now_ms();
            self.session.sync_lost_reported = true;
            self.session.set_status_code(StatusCode::NoPing);
            warn!("synchronization lost");
            dispatcher.on_sync_timeout();
        }
        None
    }

    fn state_got_data(&mut self, clock: &dyn Clock, port: &mut dyn SerialPort) {
        match frame::validate_request(&self.session.rx, self.config.device_id) {
            Ok(req) => {
                self.session.broadcast = req.broadcast;
                self.session.pending = Some(req);
                self.session.state = ComState::SemanticCheck;
            }
            Err(FrameError::TooShort | FrameError::NotAddressed) => {
                self.rx_enable(port);
            }
            Err(e) => {
                self.session.broadcast = frame::is_broadcast(&self.session.rx);
                let code = match e {
                    FrameError::Eof => ErrorCode::Eof,
                    FrameError::LengthMismatch => self.config.length_error_code,
                    FrameError::Crc => ErrorCode::Crc,
                    _ => ErrorCode::Unknown,
                };
                debug!(code = %code, "frame rejected: {e}");
                self.session.error = code;
                self.respond_and_send(code, &[], clock, port);
            }
        }
    }

    fn state_semantic_check(
        &mut self,
        clock: &dyn Clock,
        port: &mut dyn SerialPort,
        dispatcher: &mut dyn CommandDispatcher,
    ) {
        let Some(req) = self.session.pending.take() else {
            self.rx_enable(port);
            return;
        };

        // Decrypt and enforce the replay counter. A decryption failure
        // deliberately produces no response here so that the generic
        // semantic-error path below applies.
        let inner: Option<Vec<u8>> = if self.config.encrypt {
            let session_control =
                Command::from_u8(req.command).map_or(false, Command::is_session_control);
            let iv = if session_control {
                self.session.counter = 1;
                Iv::FACTORY
            } else {
                self.session.session_iv
            };
            self.session.active_iv = iv;

            let ciphertext =
                &self.session.rx[req.payload_start..req.payload_start + req.payload_len];
            match crypto::decrypt(&self.key, &iv, ciphertext) {
                Ok(plain) => {
                    if plain.len() < 2 {
                        debug!("encrypted payload shorter than the replay counter");
                        self.mark_synced(clock);
                        self.respond_and_send(ErrorCode::FrameMissed, &[], clock, port);
                        return;
                    }
                    if !session_control {
                        let received = BigEndian::read_u16(&plain[..2]);
                        if received == self.session.counter.wrapping_add(1) {
                            self.session.counter = received;
                        } else {
                            debug!(
                                expected = self.session.counter.wrapping_add(1),
                                received, "replay counter violation"
                            );
                            self.mark_synced(clock);
                            self.respond_and_send(ErrorCode::FrameMissed, &[], clock, port);
                            return;
                        }
                    }
                    self.session.plain = plain;
                    Some(self.session.plain[2..].to_vec())
                }
                Err(e) => {
                    debug!("decryption failed: {e}");
                    None
                }
            }
        } else {
            Some(self.session.rx[req.payload_start..req.payload_start + req.payload_len].to_vec())
        };

        let mut ctx = CommandContext::new(self.session.status_code);
        if let Some(payload) = &inner {
            dispatcher.dispatch(req.command, payload, &mut ctx);
        }

        if let Some(open) = ctx.open_request {
            debug!(open, "port state changed");
            self.session.open = open;
        }
        if ctx.restart {
            self.session.restart_pending = true;
        }
        if ctx.ack_status && self.session.status_code != StatusCode::NoError {
            self.session.status_code = StatusCode::NoError;
        }

        match ctx.response {
            Some((code, payload)) => {
                self.mark_synced(clock);
                self.respond_and_send(code, &payload, clock, port);
            }
            None => {
                self.respond_and_send(ErrorCode::Semantic, &[], clock, port);
            }
        }
    }

    fn state_sending(&mut self, clock: &dyn Clock, port: &mut dyn SerialPort) {
        if port.transmit_done() {
            self.rx_enable(port);
        } else if clock.now_ms().saturating_sub(self.session.tx_started_at)
            >= self.config.tx_timeout_ms
        {
            warn!("transmit timeout, aborting");
            port.abort_transmit();
            self.rx_enable(port);
        }
    }

    /// A completed exchange ends any lost-sync episode.
    fn mark_synced(&mut self, clock: &dyn Clock) {
        self.session.last_sync_at = clock.now_ms();
        self.session.sync_lost_reported = false;
    }

    fn respond_and_send(
        &mut self,
        code: ErrorCode,
        payload: &[u8],
        clock: &dyn Clock,
        port: &mut dyn SerialPort,
    ) {
        let cipher = if self.config.encrypt {
            Some((&self.key, &self.session.active_iv))
        } else {
            None
        };
        match frame::build_response(self.config.device_id, code, payload, cipher) {
            Ok(resp) => {
                self.session.tx = resp;
                self.send_or_rearm(clock, port);
            }
            Err(e) => {
                warn!("response build failed: {e}");
                self.rx_enable(port);
            }
        }
    }

    fn send_or_rearm(&mut self, clock: &dyn Clock, port: &mut dyn SerialPort) {
        if self.session.broadcast {
            trace!("broadcast request, no response");
            self.rx_enable(port);
            return;
        }
        self.session.tx_started_at = clock.now_ms();
        match port.start_transmit(&self.session.tx) {
            Ok(()) => self.session.state = ComState::Sending,
            Err(e) => {
                warn!("transmit failed: {e}");
                self.rx_enable(port);
            }
        }
    }

    /// Re-arm reception and return to idle; a failing transport escalates to
    /// the error state.
    fn rx_enable(&mut self, port: &mut dyn SerialPort) {
        self.session.error = ErrorCode::None;
        self.session.rx.clear();
        self.session.plain.clear();
        self.session.tx.clear();
        self.session.pending = None;
        match port.arm_receive() {
            Ok(()) => self.session.state = ComState::Idle,
            Err(e) => {
                warn!("failed to arm reception: {e}");
                self.session.state = ComState::Error;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::sim::SimClock;
    use crate::transport::LoopbackPort;

    /// Echoes the payload back on command 0x42, ignores everything else.
    #[derive(Default)]
    struct EchoDispatcher {
        sync_timeouts: u32,
    }

    impl CommandDispatcher for EchoDispatcher {
        fn dispatch(&mut self, command: u8, payload: &[u8], ctx: &mut CommandContext) {
            if command == 0x42 {
                ctx.respond(ErrorCode::None, payload);
            }
        }

        fn on_sync_timeout(&mut self) {
            self.sync_timeouts += 1;
        }
    }

    fn engine(encrypt: bool) -> (ComEngine, LoopbackPort, SimClock) {
        let clock = SimClock::new();
        let mut port = LoopbackPort::new();
        let config = ComConfig {
            encrypt,
            ..ComConfig::default()
        };
        let mut engine = ComEngine::new(
            config,
            CipherKey::device_default(),
            Iv::FACTORY,
            &clock,
        )
        .unwrap();
        engine.arm(&mut port).unwrap();
        (engine, port, clock)
    }

    fn run(engine: &mut ComEngine, port: &mut LoopbackPort, clock: &SimClock, passes: usize) {
        let mut dispatcher = EchoDispatcher::default();
        for _ in 0..passes {
            engine.poll(clock, port, &mut dispatcher);
        }
    }

    #[test]
    fn test_plain_echo_cycle() {
        let (mut engine, mut port, clock) = engine(false);
        let req = frame::build_request(0xF0, 0x42, b"ping", None).unwrap();
        port.host_send(&req);
        run(&mut engine, &mut port, &clock, 4);

        let resp = port.host_recv().unwrap();
        let (code, payload) =
            frame::parse_response(&resp, DeviceId::default(), None).unwrap();
        assert_eq!(code, ErrorCode::None);
        assert_eq!(payload, b"ping");
        assert_eq!(engine.session().state(), ComState::Idle);
    }

    #[test]
    fn test_unknown_command_yields_semantic_error() {
        let (mut engine, mut port, clock) = engine(false);
        let req = frame::build_request(0xF0, 0x99, &[], None).unwrap();
        port.host_send(&req);
        run(&mut engine, &mut port, &clock, 4);

        let resp = port.host_recv().unwrap();
        let (code, payload) =
            frame::parse_response(&resp, DeviceId::default(), None).unwrap();
        assert_eq!(code, ErrorCode::Semantic);
        assert!(payload.is_empty());
    }

    #[test]
    fn test_broadcast_not_answered() {
        let (mut engine, mut port, clock) = engine(false);
        let req = frame::build_request(crate::protocol::BROADCAST_ADDR, 0x42, b"x", None).unwrap();
        port.host_send(&req);
        run(&mut engine, &mut port, &clock, 4);
        assert!(port.host_recv().is_none());
        assert_eq!(engine.session().state(), ComState::Idle);
    }

    #[test]
    fn test_replayed_frame_reports_frame_missed() {
        let (mut engine, mut port, clock) = engine(true);
        let key = CipherKey::device_default();
        let req =
            frame::build_request(0xF0, 0x42, b"once", Some((&key, &Iv::FACTORY, 1))).unwrap();

        port.host_send(&req);
        run(&mut engine, &mut port, &clock, 4);
        let resp = port.host_recv().unwrap();
        let (code, _) = frame::parse_response(
            &resp,
            DeviceId::default(),
            Some((&key, &Iv::FACTORY)),
        )
        .unwrap();
        assert_eq!(code, ErrorCode::None);
        assert_eq!(engine.session().counter(), 1);

        // identical bytes again: counter has not advanced
        port.host_send(&req);
        run(&mut engine, &mut port, &clock, 4);
        let resp = port.host_recv().unwrap();
        let (code, _) = frame::parse_response(&resp, DeviceId::default(), None).unwrap();
        assert_eq!(code, ErrorCode::FrameMissed);
        assert_eq!(engine.session().counter(), 1);
    }

    #[test]
    fn test_sync_timeout_fires_once_per_episode() {
        let (mut engine, mut port, clock) = engine(false);
        let mut dispatcher = EchoDispatcher::default();

        clock.advance(1000);
        engine.poll(&clock, &mut port, &mut dispatcher);
        assert_eq!(dispatcher.sync_timeouts, 1);
        assert_eq!(engine.status(), StatusCode::NoPing);

        clock.advance(5000);
        engine.poll(&clock, &mut port, &mut dispatcher);
        assert_eq!(dispatcher.sync_timeouts, 1);
    }

    #[test]
    fn test_transmit_timeout_fails_open() {
        let (mut engine, mut port, clock) = engine(false);
        port.hold_transmissions(true);
        let req = frame::build_request(0xF0, 0x42, b"x", None).unwrap();
        port.host_send(&req);
        run(&mut engine, &mut port, &clock, 3);
        assert_eq!(engine.session().state(), ComState::Sending);

        clock.advance(50);
        run(&mut engine, &mut port, &clock, 1);
        assert_eq!(engine.session().state(), ComState::Idle);
        assert!(port.host_recv().is_none());
    }

    #[test]
    fn test_arm_failure_escalates_and_reinit_recovers() {
        let (mut engine, mut port, clock) = engine(false);
        let req = frame::build_request(0xF0, 0x99, &[], None).unwrap();
        port.fail_next_arm();
        port.host_send(&req);
        // cycle ends trying to re-arm, which fails
        run(&mut engine, &mut port, &clock, 4);
        assert_eq!(engine.session().state(), ComState::Error);

        let mut dispatcher = EchoDispatcher::default();
        assert_eq!(
            engine.poll(&clock, &mut port, &mut dispatcher),
            Some(EngineEvent::NeedsReinit)
        );
        engine.reinit(Iv::FACTORY, &clock, &mut port).unwrap();
        assert_eq!(engine.session().state(), ComState::Idle);
    }
}
