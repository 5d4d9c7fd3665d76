//! Payload encryption for the wire protocol.
//!
//! Payloads are enciphered with AES-256-CTR using a pre-shared key and a
//! session initialization vector. Requests embed a 16-bit replay counter as
//! the first two plaintext bytes; responses encipher the payload only. CTR
//! mode is its own inverse, so encryption and decryption share one keystream
//! application.

use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

/// Key size for AES-256-CTR.
pub const KEY_SIZE: usize = 32;

/// Initialization vector size.
pub const IV_SIZE: usize = 16;

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Pre-shared cipher key.
///
/// Zeroed on drop; the debug representation never prints key material.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct CipherKey([u8; KEY_SIZE]);

impl CipherKey {
    pub fn new(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// The key baked into this device family.
    pub fn device_default() -> Self {
        Self([
            0x6e, 0x21, 0xd4, 0x9b, 0x37, 0xaa, 0x05, 0xe2, 0x91, 0x4c, 0x78, 0x0f, 0xb8, 0x53,
            0x2a, 0xc6, 0x1f, 0x80, 0x6d, 0x34, 0xe9, 0x12, 0xcb, 0x58, 0xa3, 0x07, 0x96, 0x4e,
            0xd1, 0x6a, 0x25, 0xfc,
        ])
    }

    fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

// Intentionally redacted - key material must not leak into logs
impl std::fmt::Debug for CipherKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherKey").finish_non_exhaustive()
    }
}

/// Session initialization vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Iv(pub [u8; IV_SIZE]);

impl Iv {
    /// Factory-default IV used by the session-control commands.
    pub const FACTORY: Self = Self([
        0x4a, 0x9e, 0x13, 0xc7, 0x2d, 0x60, 0xb5, 0xf8, 0x81, 0x3c, 0xe6, 0x0b, 0x57, 0xd2, 0x9f,
        0x44,
    ]);

    pub fn new(bytes: [u8; IV_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; IV_SIZE] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidIvLength(bytes.len()))?;
        Ok(Self(arr))
    }

    /// Generate a random IV (host-side session setup).
    pub fn generate() -> Self {
        let mut bytes = [0u8; IV_SIZE];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; IV_SIZE] {
        &self.0
    }
}

impl std::fmt::Display for Iv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Apply the AES-CTR keystream in place.
pub fn apply_keystream(key: &CipherKey, iv: &Iv, data: &mut [u8]) -> Result<(), CryptoError> {
    let mut cipher = Aes256Ctr::new_from_slices(key.as_bytes(), iv.as_bytes())
        .map_err(|e| CryptoError::EncryptionFailed(format!("cipher init: {e}")))?;
    cipher.apply_keystream(data);
    Ok(())
}

/// Encrypt a payload, returning the ciphertext.
pub fn encrypt(key: &CipherKey, iv: &Iv, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut out = plaintext.to_vec();
    apply_keystream(key, iv, &mut out)?;
    Ok(out)
}

/// Decrypt a payload, returning the plaintext.
pub fn decrypt(key: &CipherKey, iv: &Iv, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut out = ciphertext.to_vec();
    apply_keystream(key, iv, &mut out)
        .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))?;
    Ok(out)
}
