// AEAD primitives for per-frame protection.

use chacha20poly1305::{
    aead::{Aead, Payload},
    ChaCha20Poly1305, Key, KeyInit, Nonce,
};
use thiserror::Error;

/// Authentication tag length appended to every protected frame.
pub const TAG_LEN: usize = 16;

/// Length of the symmetric session key.
pub const SESSION_KEY_LEN: usize = 32;

/// Symmetric session key protecting data frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKey([u8; SESSION_KEY_LEN]);

impl SessionKey {
    /// Constructs a key from raw bytes.
    #[must_use]
    pub const fn new(bytes: [u8; SESSION_KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Returns the underlying key bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; SESSION_KEY_LEN] {
        &self.0
    }
}

/// Errors returned by the AEAD helpers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AeadError {
    /// Encryption failed.
    #[error("encryption failed")]
    Encrypt,
    /// Authentication or decryption failed.
    #[error("decryption failed")]
    Decrypt,
    /// Payload region shorter than the authentication tag.
    #[error("payload region of {0} bytes is shorter than the tag")]
    TruncatedRegion(usize),
}

// The 64-bit frame counter fills the low eight bytes of the 12-byte IETF
// nonce, little-endian; the high four bytes stay zero.
fn nonce_for(counter: u64) -> Nonce {
    let mut bytes = [0u8; 12];
    bytes[4..12].copy_from_slice(&counter.to_le_bytes());
    Nonce::from(bytes)
}

fn seal(
    key: &SessionKey,
    counter: u64,
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, AeadError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    cipher
        .encrypt(
            &nonce_for(counter),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| AeadError::Encrypt)
}

fn open(
    key: &SessionKey,
    counter: u64,
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, AeadError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    cipher
        .decrypt(
            &nonce_for(counter),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| AeadError::Decrypt)
}

/// Produces the payload region of a data frame.
///
/// In encrypted mode the result is `ciphertext || tag`. In validate-only
/// mode the payload rides in clear and the tag authenticates it through the
/// AAD, so the result is `payload || tag`. Either way the region is exactly
/// `payload.len() + TAG_LEN` bytes.
pub fn protect(
    key: &SessionKey,
    counter: u64,
    aad: &[u8],
    payload: &[u8],
    encrypted: bool,
) -> Result<Vec<u8>, AeadError> {
    if encrypted {
        seal(key, counter, aad, payload)
    } else {
        let mut bound = Vec::with_capacity(aad.len() + payload.len());
        bound.extend_from_slice(aad);
        bound.extend_from_slice(payload);
        let tag = seal(key, counter, &bound, &[])?;
        let mut region = Vec::with_capacity(payload.len() + TAG_LEN);
        region.extend_from_slice(payload);
        region.extend_from_slice(&tag);
        Ok(region)
    }
}

/// Verifies (and in encrypted mode decrypts) a payload region produced by
/// [`protect`], returning the user payload.
pub fn unprotect(
    key: &SessionKey,
    counter: u64,
    aad: &[u8],
    region: &[u8],
    encrypted: bool,
) -> Result<Vec<u8>, AeadError> {
    if region.len() < TAG_LEN {
        return Err(AeadError::TruncatedRegion(region.len()));
    }
    if encrypted {
        open(key, counter, aad, region)
    } else {
        let (payload, tag) = region.split_at(region.len() - TAG_LEN);
        let mut bound = Vec::with_capacity(aad.len() + payload.len());
        bound.extend_from_slice(aad);
        bound.extend_from_slice(payload);
        open(key, counter, &bound, tag)?;
        Ok(payload.to_vec())
    }
}
