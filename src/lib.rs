//! # Tactum
//!
//! Core of a multi-channel haptic stimulation device: the encrypted serial
//! command protocol and the stimulation sequencer, with peripherals behind
//! narrow collaborator contracts.
//!
//! ## Architecture
//!
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Device Aggregate                          │
//! │        (cooperative poll loop, boot/reset lifecycle)            │
//! ├───────────────────────────────┬─────────────────────────────────┤
//! │     Protocol Engine           │         Sequencer               │
//! │  Idle → GotData →             │   Stop / Active / Pause         │
//! │  SemanticCheck → Sending      │   step table, trigger, LED      │
//! ├───────────────────────────────┼─────────────────────────────────┤
//! │  Frame Codec (CRC16, AES-CTR, │   Output pins, power & thermal  │
//! │  replay counter)              │   supervisors                   │
//! ├───────────────────────────────┴─────────────────────────────────┤
//! │   Serial Transport (DMA idle-line contract)  │  Config Store    │
//! └─────────────────────────────────────────────────────────────────┘
//!
//! The protocol engine cycles through five states per request, answers
//! every accepted frame with exactly one response (none for broadcast), and
//! feeds validated commands into the sequencer and the configuration store.
//! Everything runs on one non-preemptive scheduler pass per `poll()`.

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::cast_possible_truncation)] // wire fields are deliberately narrow

pub mod config;
pub mod crypto;
pub mod device;
pub mod error;
pub mod hal;
pub mod protocol;
pub mod sequencer;
pub mod storage;
pub mod transport;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use types::*;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::crypto::{CipherKey, Iv};
    pub use crate::device::{Device, Peripherals, PollOutcome};
    pub use crate::error::{Error, Result};
    pub use crate::protocol::{ComConfig, ComEngine, Command};
    pub use crate::sequencer::{Sequencer, SequencerConfig, Step};
    pub use crate::storage::{ConfigStore, StorageRecord};
    pub use crate::transport::SerialPort;
    pub use crate::types::*;
}
