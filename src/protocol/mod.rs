//! Wire protocol for the stimulation device.
//!
//! Defines the frame format, command ids, and the receive/validate/dispatch/
//! respond state machine.
//!
//! ## Frame Format
//!
//! ```text
//! Request:  ┌──────┬────────┬─────┬─────────┬───────┬─────┐
//!           │ Addr │ Len    │ Cmd │ Payload │ CRC16 │ EOF │
//!           │ 1    │ 2 (BE) │ 1   │ Len - 4 │ 2     │ 1   │
//!           └──────┴────────┴─────┴─────────┴───────┴─────┘
//!
//! Response: ┌──────┬────────┬──────┬───────┬─────────┬───────┬─────┐
//!           │ Addr │ Len    │ 0x01 │ Error │ Payload │ CRC16 │ EOF │
//!           │ 1    │ 2 (BE) │ 1    │ 2     │ Len - 6 │ 2     │ 1   │
//!           └──────┴────────┴──────┴───────┴─────────┴───────┴─────┘
//! ```
//!
//! `Len` excludes the address and the length field itself. The CRC covers
//! address through payload. When encryption is active the request payload is
//! `[counter:u16][inner…]`, enciphered as one AES-CTR block.

mod command;
mod engine;
mod frame;
mod session;

pub use command::Command;
pub use engine::{ComConfig, ComEngine, CommandContext, CommandDispatcher, EngineEvent};
pub use frame::{build_request, build_response, is_broadcast, parse_response, validate_request, RawRequest};
pub use session::{ComState, ProtocolSession};

use crc::{Crc, CRC_16_IBM_3740};

/// Receive/transmit buffer size.
pub const BUFFER_SIZE: usize = 2048;

/// Broadcast address; addressed receivers do not reply.
pub const BROADCAST_ADDR: u8 = 0xEF;

/// End-of-frame sentinel.
pub const EOF_BYTE: u8 = 0xF1;

/// Command byte marking a response frame.
pub const RESP_TAG: u8 = 0x01;

/// Minimum request frame length (empty payload).
pub const REQ_MIN_LENGTH: usize = 7;

/// Offset of the command byte in a request.
pub const REQ_CMD_OFFSET: usize = 3;

/// Offset of the payload in a request.
pub const REQ_DATA_OFFSET: usize = 4;

/// Minimum response frame length (empty payload).
pub const RESP_MIN_LENGTH: usize = 9;

/// Offset of the payload in a response.
pub const RESP_DATA_OFFSET: usize = 6;

/// Maximum request payload size.
pub const MAX_REQ_PAYLOAD: usize = BUFFER_SIZE - REQ_MIN_LENGTH;

/// Maximum response payload size.
pub const MAX_RESP_PAYLOAD: usize = BUFFER_SIZE - RESP_MIN_LENGTH;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Calculate the CRC16 frame checksum (polynomial 0x1021, init 0xFFFF).
pub fn checksum(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_known_vector() {
        // CRC-16/IBM-3740 of "123456789"
        assert_eq!(checksum(b"123456789"), 0x29B1);
    }

    #[test]
    fn test_checksum_detects_flip() {
        let data = b"stimulus frame";
        let good = checksum(data);
        let mut bad = data.to_vec();
        bad[3] ^= 0x01;
        assert_ne!(checksum(&bad), good);
    }
}
