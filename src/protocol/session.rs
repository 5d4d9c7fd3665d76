//! Protocol session state.

use crate::crypto::Iv;
use crate::types::{DeviceId, ErrorCode, StatusCode};

use super::frame::RawRequest;

/// Protocol engine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ComState {
    /// Waiting for a frame
    #[default]
    Idle,
    /// A frame arrived, envelope validation pending
    GotData,
    /// Envelope valid, decrypt/counter/dispatch pending
    SemanticCheck,
    /// Response transmission in flight
    Sending,
    /// Unrecoverable transport fault, subsystem reinit pending
    Error,
}

/// Live state of one protocol session.
///
/// Created at communication-subsystem startup, reset to the same initial
/// state on any unrecoverable transport error, dropped at shutdown. The
/// engine owns exactly one.
#[derive(Debug)]
pub struct ProtocolSession {
    /// Received frame bytes (one frame per idle-line reception).
    pub(crate) rx: Vec<u8>,
    /// Response bytes pending or in flight.
    pub(crate) tx: Vec<u8>,
    /// Decrypted request payload (replay counter + inner payload).
    pub(crate) plain: Vec<u8>,
    /// Envelope of the frame currently being processed.
    pub(crate) pending: Option<RawRequest>,
    pub(crate) state: ComState,
    /// Last envelope validation error.
    pub(crate) error: ErrorCode,
    /// Last accepted replay counter.
    pub(crate) counter: u16,
    pub(crate) broadcast: bool,
    pub(crate) open: bool,
    pub(crate) restart_pending: bool,
    /// Set once per lost-sync episode.
    pub(crate) sync_lost_reported: bool,
    /// Deferred status code, reported once via the next sync exchange.
    pub(crate) status_code: StatusCode,
    /// Session IV loaded from persistent storage at startup.
    pub(crate) session_iv: Iv,
    /// IV in effect for the current exchange (factory default during
    /// session-control commands).
    pub(crate) active_iv: Iv,
    /// When the in-flight transmission started.
    pub(crate) tx_started_at: u64,
    /// When the last synchronization exchange completed.
    pub(crate) last_sync_at: u64,
    id: DeviceId,
}

impl ProtocolSession {
    pub fn new(id: DeviceId, session_iv: Iv, now_ms: u64) -> Self {
        Self {
            rx: Vec::new(),
            tx: Vec::new(),
            plain: Vec::new(),
            pending: None,
            state: ComState::Idle,
            error: ErrorCode::None,
            counter: 0,
            broadcast: false,
            open: false,
            restart_pending: false,
            sync_lost_reported: false,
            status_code: StatusCode::NoError,
            session_iv,
            active_iv: session_iv,
            tx_started_at: 0,
            last_sync_at: now_ms,
            id,
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn state(&self) -> ComState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn counter(&self) -> u16 {
        self.counter
    }

    /// The last envelope validation error.
    pub fn last_error(&self) -> ErrorCode {
        self.error
    }

    pub fn status_code(&self) -> StatusCode {
        self.status_code
    }

    /// Record a deferred status code. Once set, the code is latched until a
    /// sync exchange reports it; later causes do not overwrite it.
    pub fn set_status_code(&mut self, code: StatusCode) {
        if self.status_code == StatusCode::NoError {
            self.status_code = code;
        }
    }
}
