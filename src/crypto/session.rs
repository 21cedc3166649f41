// Session-key generation, wrap and ingestion.

use crypto_box::{aead::Aead, SalsaBox};
use rand::{rngs::OsRng, RngCore};
use subtle::ConstantTimeEq;
use thiserror::Error;

use super::{
    aead::{SessionKey, SESSION_KEY_LEN},
    keys::KeyPair,
};

/// Nonce length of the asymmetric box.
pub const SESSION_KEY_NONCE_LEN: usize = 24;

/// Wrapped session key: the 32 key bytes plus the box authentication tag.
pub const WRAPPED_KEY_LEN: usize = SESSION_KEY_LEN + 16;

/// On-air payload of a session-key announcement frame.
pub const ANNOUNCEMENT_LEN: usize = SESSION_KEY_NONCE_LEN + WRAPPED_KEY_LEN;

/// Errors raised by session-key handling.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    /// Wrapping the freshly generated key failed.
    #[error("unable to wrap session key")]
    Wrap,
    /// The announcement failed to authenticate against our key material.
    #[error("unable to unwrap session key")]
    Unwrap,
    /// Announcement payload has the wrong size.
    #[error("announcement of {0} bytes, expected {ANNOUNCEMENT_LEN}")]
    BadLength(usize),
}

/// The payload of a session-key frame: box nonce followed by the wrapped key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionAnnouncement {
    pub key_nonce: [u8; SESSION_KEY_NONCE_LEN],
    pub wrapped_key: [u8; WRAPPED_KEY_LEN],
}

impl SessionAnnouncement {
    /// Serializes the announcement into its on-air form.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; ANNOUNCEMENT_LEN] {
        let mut buf = [0u8; ANNOUNCEMENT_LEN];
        buf[..SESSION_KEY_NONCE_LEN].copy_from_slice(&self.key_nonce);
        buf[SESSION_KEY_NONCE_LEN..].copy_from_slice(&self.wrapped_key);
        buf
    }

    /// Parses an announcement payload.
    pub fn parse(bytes: &[u8]) -> Result<Self, SessionError> {
        if bytes.len() != ANNOUNCEMENT_LEN {
            return Err(SessionError::BadLength(bytes.len()));
        }
        let mut key_nonce = [0u8; SESSION_KEY_NONCE_LEN];
        key_nonce.copy_from_slice(&bytes[..SESSION_KEY_NONCE_LEN]);
        let mut wrapped_key = [0u8; WRAPPED_KEY_LEN];
        wrapped_key.copy_from_slice(&bytes[SESSION_KEY_NONCE_LEN..]);
        Ok(Self {
            key_nonce,
            wrapped_key,
        })
    }
}

/// TX-side session state: the current symmetric key and its announcement.
pub struct SessionEncryptor {
    keys: KeyPair,
    session_key: SessionKey,
    announcement: SessionAnnouncement,
}

impl SessionEncryptor {
    /// Creates the encryptor and establishes the first session.
    pub fn new(keys: KeyPair) -> Result<Self, SessionError> {
        let (session_key, announcement) = generate_session(&keys)?;
        Ok(Self {
            keys,
            session_key,
            announcement,
        })
    }

    /// Establishes a fresh session key and announcement.
    pub fn rotate(&mut self) -> Result<(), SessionError> {
        let (session_key, announcement) = generate_session(&self.keys)?;
        self.session_key = session_key;
        self.announcement = announcement;
        Ok(())
    }

    /// The current symmetric key.
    #[must_use]
    pub fn session_key(&self) -> &SessionKey {
        &self.session_key
    }

    /// The announcement blob re-sent on the air for the current session.
    #[must_use]
    pub fn announcement(&self) -> &SessionAnnouncement {
        &self.announcement
    }
}

fn generate_session(keys: &KeyPair) -> Result<(SessionKey, SessionAnnouncement), SessionError> {
    let mut key_bytes = [0u8; SESSION_KEY_LEN];
    OsRng.fill_bytes(&mut key_bytes);
    let mut key_nonce = [0u8; SESSION_KEY_NONCE_LEN];
    OsRng.fill_bytes(&mut key_nonce);

    let sealed = SalsaBox::new(keys.remote_public(), keys.local_secret())
        .encrypt(&key_nonce.into(), &key_bytes[..])
        .map_err(|_| SessionError::Wrap)?;
    let mut wrapped_key = [0u8; WRAPPED_KEY_LEN];
    wrapped_key.copy_from_slice(&sealed);

    Ok((
        SessionKey::new(key_bytes),
        SessionAnnouncement {
            key_nonce,
            wrapped_key,
        },
    ))
}

/// Outcome of feeding an announcement into the decryptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionIngest {
    /// A session key different from the installed one was committed.
    NewSession,
    /// The announcement repeated the already installed key.
    SameSession,
}

/// RX-side session state: unwraps announcements and tracks the current key.
pub struct SessionDecryptor {
    keys: KeyPair,
    session_key: Option<SessionKey>,
}

impl SessionDecryptor {
    /// Creates a decryptor with no session installed yet.
    #[must_use]
    pub fn new(keys: KeyPair) -> Self {
        Self {
            keys,
            session_key: None,
        }
    }

    /// Unwraps an announcement. Commits the key and reports
    /// [`SessionIngest::NewSession`] when it differs from the installed one.
    pub fn ingest(&mut self, announcement: &SessionAnnouncement) -> Result<SessionIngest, SessionError> {
        let opened = SalsaBox::new(self.keys.remote_public(), self.keys.local_secret())
            .decrypt(&announcement.key_nonce.into(), &announcement.wrapped_key[..])
            .map_err(|_| SessionError::Unwrap)?;
        let mut key_bytes = [0u8; SESSION_KEY_LEN];
        key_bytes.copy_from_slice(&opened);

        let unchanged = match &self.session_key {
            Some(current) => current.as_bytes()[..].ct_eq(&key_bytes[..]).into(),
            None => false,
        };
        if unchanged {
            return Ok(SessionIngest::SameSession);
        }
        self.session_key = Some(SessionKey::new(key_bytes));
        Ok(SessionIngest::NewSession)
    }

    /// The installed session key, once a valid announcement has been seen.
    #[must_use]
    pub fn session_key(&self) -> Option<&SessionKey> {
        self.session_key.as_ref()
    }
}
