//! Broadcast-mode bidirectional wireless link over raw 802.11 monitor-mode
//! injection and capture.
//!
//! The crate emulates a datagram bus between one air endpoint and one or
//! more ground endpoints (or the reverse) without association or
//! acknowledgement. Every frame is authenticated with an AEAD keyed by a
//! per-session key that the transmitter wraps to the receiver's public key
//! and announces on a reserved stream; payload encryption is selectable per
//! frame. Multiple logical streams are multiplexed through a one-byte radio
//! port, several receive cards are aggregated by a single receive thread,
//! and the card with the best signal is chosen for injection.
//!
//! The concrete capture backend stays outside this crate: implement
//! [`MonitorIo`] over pcap or whatever the platform offers and hand the
//! opened handles to [`Endpoint::new`].

pub mod api;

pub mod config;

pub mod crypto;

pub mod dispatch;

pub mod link;

pub mod metrics;

pub mod seqnr;

pub mod stats;

pub mod wire;

pub use api::{CapturedFrame, MonitorIo};

pub use config::{ConfigError, Options};

pub use crypto::{
    aead::{AeadError, SessionKey, SESSION_KEY_LEN, TAG_LEN},
    keys::{KeyError, KeyPair, DEFAULT_SEED, KEY_FILE_LEN},
    session::{
        SessionAnnouncement, SessionDecryptor, SessionEncryptor, SessionError, SessionIngest,
        ANNOUNCEMENT_LEN,
    },
};

pub use dispatch::{AnyPacketCallback, PacketCallback, SessionCallback, StreamRxHandler};

pub use link::{Endpoint, LinkError};

pub use metrics::{Metrics, MetricsError};

pub use stats::{RxStats, RxStatsPerCard, TxStats};

pub use wire::{
    parse_frame, RadioPort, RadiotapParams, Role, WireError, MAX_FRAME_SIZE, MAX_USER_PAYLOAD,
    SESSION_KEY_PORT, STREAM_INDEX_MAX, STREAM_INDEX_MIN,
};
