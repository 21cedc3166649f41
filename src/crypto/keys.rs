// Long-lived asymmetric key material for the session-key exchange.

use std::{
    io,
    path::{Path, PathBuf},
};

use crypto_box::{PublicKey, SecretKey};
use thiserror::Error;

/// Length of an X25519 secret key.
pub const SECRET_KEY_LEN: usize = 32;

/// Length of an X25519 public key.
pub const PUBLIC_KEY_LEN: usize = 32;

/// Raw key-file size: local secret key followed by the remote public key.
pub const KEY_FILE_LEN: usize = SECRET_KEY_LEN + PUBLIC_KEY_LEN;

/// Deterministic development seed. Both sides derive the same keypair from
/// it, which makes unkeyed bench setups interoperable but offers no
/// security.
pub const DEFAULT_SEED: [u8; SECRET_KEY_LEN] = [0u8; SECRET_KEY_LEN];

/// Errors raised while loading key material.
#[derive(Debug, Error)]
pub enum KeyError {
    /// Reading the key file failed.
    #[error("failed to read key file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// The key file does not have the expected raw layout.
    #[error("key file '{path}' has {actual} bytes, expected {KEY_FILE_LEN}")]
    InvalidLength { path: PathBuf, actual: usize },
}

/// The local secret key and the remote side's public key.
///
/// The TX side holds `(tx_secret, rx_public)`, the RX side the reciprocal
/// pair; the key file for each side stores its own secret first and the
/// peer public key second, raw bytes with no framing.
#[derive(Clone)]
pub struct KeyPair {
    local_secret: SecretKey,
    remote_public: PublicKey,
}

impl KeyPair {
    /// Derives a deterministic keypair from a 32-byte seed.
    ///
    /// Both endpoints derive the identical keypair, mirroring what a shared
    /// development seed produces on either side of the link.
    #[must_use]
    pub fn from_seed(seed: [u8; SECRET_KEY_LEN]) -> Self {
        let local_secret = SecretKey::from(seed);
        let remote_public = local_secret.public_key();
        Self {
            local_secret,
            remote_public,
        }
    }

    /// Loads a keypair from a raw `secret || public` file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, KeyError> {
        let path_ref = path.as_ref();
        let bytes = std::fs::read(path_ref).map_err(|source| KeyError::Io {
            path: path_ref.to_path_buf(),
            source,
        })?;
        if bytes.len() != KEY_FILE_LEN {
            return Err(KeyError::InvalidLength {
                path: path_ref.to_path_buf(),
                actual: bytes.len(),
            });
        }
        let mut secret = [0u8; SECRET_KEY_LEN];
        secret.copy_from_slice(&bytes[..SECRET_KEY_LEN]);
        let mut public = [0u8; PUBLIC_KEY_LEN];
        public.copy_from_slice(&bytes[SECRET_KEY_LEN..]);
        Ok(Self {
            local_secret: SecretKey::from(secret),
            remote_public: PublicKey::from(public),
        })
    }

    /// The local secret key.
    #[must_use]
    pub fn local_secret(&self) -> &SecretKey {
        &self.local_secret
    }

    /// The remote side's public key.
    #[must_use]
    pub fn remote_public(&self) -> &PublicKey {
        &self.remote_public
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the secret key.
        f.debug_struct("KeyPair")
            .field("remote_public", &self.remote_public)
            .finish_non_exhaustive()
    }
}
