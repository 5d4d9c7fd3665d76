//! Frame encoding and validation.

use byteorder::{BigEndian, ByteOrder};

use crate::crypto::{self, CipherKey, Iv};
use crate::error::{FrameError, Result};
use crate::types::{DeviceId, ErrorCode};

use super::{
    checksum, BROADCAST_ADDR, EOF_BYTE, MAX_REQ_PAYLOAD, MAX_RESP_PAYLOAD, REQ_CMD_OFFSET,
    REQ_DATA_OFFSET, REQ_MIN_LENGTH, RESP_DATA_OFFSET, RESP_MIN_LENGTH, RESP_TAG,
};

/// A validated request envelope.
///
/// Payload bytes stay in the receive buffer; the envelope carries their
/// position, not a copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawRequest {
    /// Raw command byte.
    pub command: u8,
    /// Payload offset in the receive buffer.
    pub payload_start: usize,
    /// Payload length in bytes (still enciphered when encryption is active).
    pub payload_len: usize,
    /// Whether the frame was addressed to the broadcast marker.
    pub broadcast: bool,
}

/// Whether a raw frame carries the broadcast address.
pub fn is_broadcast(raw: &[u8]) -> bool {
    raw.first() == Some(&BROADCAST_ADDR)
}

/// Validate a received request envelope.
///
/// Checks, in order: minimum length, device-id-or-broadcast address,
/// end-of-frame sentinel, declared length against received length, CRC.
/// Decryption is never attempted here; the payload range refers to the
/// ciphertext when encryption is active.
pub fn validate_request(raw: &[u8], id: DeviceId) -> std::result::Result<RawRequest, FrameError> {
    if raw.len() < REQ_MIN_LENGTH {
        return Err(FrameError::TooShort);
    }
    if raw[0] != id.as_u8() && raw[0] != BROADCAST_ADDR {
        return Err(FrameError::NotAddressed);
    }
    if raw[raw.len() - 1] != EOF_BYTE {
        return Err(FrameError::Eof);
    }
    let declared = BigEndian::read_u16(&raw[1..3]) as usize;
    if declared != raw.len() - 3 {
        return Err(FrameError::LengthMismatch);
    }
    let crc = checksum(&raw[..raw.len() - 3]);
    if crc != BigEndian::read_u16(&raw[raw.len() - 3..raw.len() - 1]) {
        return Err(FrameError::Crc);
    }

    Ok(RawRequest {
        command: raw[REQ_CMD_OFFSET],
        payload_start: REQ_DATA_OFFSET,
        payload_len: raw.len() - REQ_MIN_LENGTH,
        broadcast: raw[0] == BROADCAST_ADDR,
    })
}

/// Build a response frame.
///
/// The payload is enciphered in place when a cipher is supplied; empty
/// payloads (every error response) are sent as-is.
pub fn build_response(
    id: DeviceId,
    error: ErrorCode,
    payload: &[u8],
    cipher: Option<(&CipherKey, &Iv)>,
) -> Result<Vec<u8>> {
    if payload.len() > MAX_RESP_PAYLOAD {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
            max: MAX_RESP_PAYLOAD,
        }
        .into());
    }

    let mut buf = Vec::with_capacity(RESP_MIN_LENGTH + payload.len());
    buf.push(id.as_u8());
    let declared = (payload.len() + 6) as u16;
    buf.extend_from_slice(&declared.to_be_bytes());
    buf.push(RESP_TAG);
    buf.extend_from_slice(&error.as_u16().to_be_bytes());

    if payload.is_empty() {
        // nothing to encipher
    } else if let Some((key, iv)) = cipher {
        buf.extend_from_slice(&crypto::encrypt(key, iv, payload)?);
    } else {
        buf.extend_from_slice(payload);
    }

    let crc = checksum(&buf);
    buf.extend_from_slice(&crc.to_be_bytes());
    buf.push(EOF_BYTE);
    Ok(buf)
}

/// Build a request frame, the peer's side of the codec.
///
/// With a cipher, the replay counter is prepended to the payload and both
/// are enciphered together. Used by the host tooling and the test suites.
pub fn build_request(
    addr: u8,
    command: u8,
    payload: &[u8],
    cipher: Option<(&CipherKey, &Iv, u16)>,
) -> Result<Vec<u8>> {
    let body = if let Some((key, iv, counter)) = cipher {
        let mut plain = Vec::with_capacity(2 + payload.len());
        plain.extend_from_slice(&counter.to_be_bytes());
        plain.extend_from_slice(payload);
        crypto::encrypt(key, iv, &plain)?
    } else {
        payload.to_vec()
    };

    if body.len() > MAX_REQ_PAYLOAD {
        return Err(FrameError::PayloadTooLarge {
            size: body.len(),
            max: MAX_REQ_PAYLOAD,
        }
        .into());
    }

    let mut buf = Vec::with_capacity(REQ_MIN_LENGTH + body.len());
    buf.push(addr);
    let declared = (body.len() + 4) as u16;
    buf.extend_from_slice(&declared.to_be_bytes());
    buf.push(command);
    buf.extend_from_slice(&body);
    let crc = checksum(&buf);
    buf.extend_from_slice(&crc.to_be_bytes());
    buf.push(EOF_BYTE);
    Ok(buf)
}

/// Parse a response frame, the peer's side of the codec.
pub fn parse_response(
    raw: &[u8],
    id: DeviceId,
    cipher: Option<(&CipherKey, &Iv)>,
) -> Result<(ErrorCode, Vec<u8>)> {
    if raw.len() < RESP_MIN_LENGTH {
        return Err(FrameError::TooShort.into());
    }
    if raw[0] != id.as_u8() {
        return Err(FrameError::NotAddressed.into());
    }
    if raw[raw.len() - 1] != EOF_BYTE {
        return Err(FrameError::Eof.into());
    }
    let declared = BigEndian::read_u16(&raw[1..3]) as usize;
    if declared != raw.len() - 3 {
        return Err(FrameError::LengthMismatch.into());
    }
    if raw[3] != RESP_TAG {
        return Err(FrameError::InvalidResponseTag(raw[3]).into());
    }
    let crc = checksum(&raw[..raw.len() - 3]);
    if crc != BigEndian::read_u16(&raw[raw.len() - 3..raw.len() - 1]) {
        return Err(FrameError::Crc.into());
    }

    let error = ErrorCode::from_u16(BigEndian::read_u16(&raw[4..6]));
    let body = &raw[RESP_DATA_OFFSET..raw.len() - 3];
    let payload = if body.is_empty() {
        Vec::new()
    } else if let Some((key, iv)) = cipher {
        crypto::decrypt(key, iv, body)?
    } else {
        body.to_vec()
    };
    Ok((error, payload))
}
