// Wire format primitives: radiotap headers, 802.11 framing, radio-port codec.

use thiserror::Error;

use crate::crypto::aead::TAG_LEN;

/// Hard cap for any frame handed to the capture layer (radiotap included).
pub const MAX_FRAME_SIZE: usize = 1510;

/// Length of the fixed radiotap header used for injection.
pub const RADIOTAP_TX_HEADER_LEN: usize = 13;

/// Length of the 802.11 MAC header carried on every frame.
pub const IEEE80211_HEADER_LEN: usize = 24;

/// Usable payload region of an injected frame (port byte lives in the header).
pub const MAX_INJECT_PAYLOAD: usize =
    MAX_FRAME_SIZE - RADIOTAP_TX_HEADER_LEN - IEEE80211_HEADER_LEN;

/// Largest user payload once the AEAD tag is accounted for.
pub const MAX_USER_PAYLOAD: usize = MAX_INJECT_PAYLOAD - TAG_LEN;

/// Smallest valid stream index.
pub const STREAM_INDEX_MIN: u8 = 0;

/// Largest valid stream index (7 bits, one combination reserved).
pub const STREAM_INDEX_MAX: u8 = 127;

/// Radio-port byte reserved for session-key announcement frames.
///
/// Encrypted bit set, stream index zero. The colliding user combination
/// (stream 0 with encryption) is rejected on the TX path.
pub const SESSION_KEY_PORT: u8 = 0x80;

/// AAD bound into every data frame: radio-port byte followed by the
/// little-endian nonce. Deliberately excludes the sequence-control field,
/// which some drivers rewrite in flight.
pub const FRAME_AAD_LEN: usize = 9;

// Two signature bytes in addr1 let the receiver cheaply discard foreign
// 802.11 traffic before any crypto work.
const LINK_SIGNATURE: [u8; 2] = [0x61, 0x63];

const FRAME_CONTROL: [u8; 2] = [0x08, 0x01];

/// Wire-level error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    /// Buffer shorter than required.
    #[error("buffer too short: expected at least {expected} bytes, got {actual}")]
    BufferTooShort { expected: usize, actual: usize },

    /// Frame exceeds the on-air cap.
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_SIZE} byte cap")]
    Oversized(usize),

    /// Radiotap header malformed or truncated.
    #[error("malformed radiotap header: {0}")]
    MalformedRadiotap(&'static str),

    /// The capture layer flagged a failed frame checksum.
    #[error("frame check sequence reported bad")]
    BadFcs,

    /// 802.11 header does not carry the link signature.
    #[error("not a link frame")]
    ForeignFrame,

    /// Frame originated from an endpoint with our own role.
    #[error("loopback frame from same-role endpoint")]
    Loopback,
}

/// Logical identity of an endpoint, encoded into the 802.11 header so that
/// drivers which loop injected frames back do not cause self-delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Air,
    Ground,
}

impl Role {
    const fn to_byte(self) -> u8 {
        match self {
            Role::Air => 0x01,
            Role::Ground => 0x02,
        }
    }

    fn from_byte(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Role::Air),
            0x02 => Some(Role::Ground),
            _ => None,
        }
    }
}

/// One-byte stream multiplex field: encrypted flag in bit 7, stream index in
/// the low seven bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RadioPort {
    pub stream_index: u8,
    pub encrypted: bool,
}

impl RadioPort {
    /// Encodes the port into its on-air byte.
    #[must_use]
    pub const fn to_byte(self) -> u8 {
        ((self.encrypted as u8) << 7) | (self.stream_index & 0x7f)
    }

    /// Decodes an on-air byte. Every byte value decodes; `0x80` is the
    /// session-key announcement and never reaches data dispatch.
    #[must_use]
    pub const fn from_byte(value: u8) -> Self {
        Self {
            stream_index: value & 0x7f,
            encrypted: value & 0x80 != 0,
        }
    }
}

/// User-selectable injection parameters, applied to every frame via the
/// radiotap MCS field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RadiotapParams {
    /// MCS index (0..=31).
    pub mcs_index: u8,
    /// Channel width in MHz; 20 or 40.
    pub channel_width_mhz: u32,
    /// Number of STBC streams (0..=3).
    pub stbc: u8,
    /// Short guard interval.
    pub short_gi: bool,
    /// LDPC coding.
    pub ldpc: bool,
}

impl Default for RadiotapParams {
    fn default() -> Self {
        Self {
            mcs_index: 3,
            channel_width_mhz: 20,
            stbc: 0,
            short_gi: false,
            ldpc: false,
        }
    }
}

mod present {
    pub const TSFT: u32 = 1 << 0;
    pub const FLAGS: u32 = 1 << 1;
    pub const RATE: u32 = 1 << 2;
    pub const CHANNEL: u32 = 1 << 3;
    pub const FHSS: u32 = 1 << 4;
    pub const DBM_ANTSIGNAL: u32 = 1 << 5;
    pub const DBM_ANTNOISE: u32 = 1 << 6;
    pub const LOCK_QUALITY: u32 = 1 << 7;
    pub const TX_ATTENUATION: u32 = 1 << 8;
    pub const DB_TX_ATTENUATION: u32 = 1 << 9;
    pub const DBM_TX_POWER: u32 = 1 << 10;
    pub const ANTENNA: u32 = 1 << 11;
    pub const DB_ANTSIGNAL: u32 = 1 << 12;
    pub const DB_ANTNOISE: u32 = 1 << 13;
    pub const RX_FLAGS: u32 = 1 << 14;
    pub const TX_FLAGS: u32 = 1 << 15;
    pub const RTS_RETRIES: u32 = 1 << 16;
    pub const DATA_RETRIES: u32 = 1 << 17;
    pub const XCHANNEL: u32 = 1 << 18;
    pub const MCS: u32 = 1 << 19;
    pub const EXT: u32 = 1 << 31;
}

// FLAGS field bit: frame failed its checksum.
const FLAG_BADFCS: u8 = 0x40;

const TX_FLAG_NOACK: u16 = 0x0008;

mod mcs_known {
    pub const BANDWIDTH: u8 = 0x01;
    pub const MCS_INDEX: u8 = 0x02;
    pub const GUARD_INTERVAL: u8 = 0x04;
    pub const FEC_TYPE: u8 = 0x10;
    pub const STBC: u8 = 0x20;
}

mod mcs_flags {
    pub const BW_40: u8 = 0x01;
    pub const SHORT_GI: u8 = 0x04;
    pub const FEC_LDPC: u8 = 0x10;
    pub const STBC_SHIFT: u8 = 5;
}

/// Pre-built radiotap header for injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RadiotapTxHeader {
    bytes: [u8; RADIOTAP_TX_HEADER_LEN],
}

impl RadiotapTxHeader {
    /// Builds the fixed 13-byte injection header from the supplied params.
    #[must_use]
    pub fn new(params: &RadiotapParams) -> Self {
        let mut bytes = [0u8; RADIOTAP_TX_HEADER_LEN];
        bytes[0] = 0; // version
        bytes[2..4].copy_from_slice(&(RADIOTAP_TX_HEADER_LEN as u16).to_le_bytes());
        let present_word = present::TX_FLAGS | present::MCS;
        bytes[4..8].copy_from_slice(&present_word.to_le_bytes());
        bytes[8..10].copy_from_slice(&TX_FLAG_NOACK.to_le_bytes());

        let known = mcs_known::BANDWIDTH
            | mcs_known::MCS_INDEX
            | mcs_known::GUARD_INTERVAL
            | mcs_known::FEC_TYPE
            | mcs_known::STBC;
        let mut flags = 0u8;
        if params.channel_width_mhz == 40 {
            flags |= mcs_flags::BW_40;
        }
        if params.short_gi {
            flags |= mcs_flags::SHORT_GI;
        }
        if params.ldpc {
            flags |= mcs_flags::FEC_LDPC;
        }
        flags |= (params.stbc & 0x03) << mcs_flags::STBC_SHIFT;
        bytes[10] = known;
        bytes[11] = flags;
        bytes[12] = params.mcs_index;
        Self { bytes }
    }

    /// Raw header bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl Default for RadiotapTxHeader {
    fn default() -> Self {
        Self::new(&RadiotapParams::default())
    }
}

/// Receive-side metadata extracted from a radiotap header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RadiotapRx {
    /// Antenna signal in dBm, when the card reports it.
    pub rssi_dbm: Option<i8>,
    /// Frame failed its checksum per the FLAGS field.
    pub bad_fcs: bool,
    /// MCS index of the frame, when the card reports it.
    pub mcs_index: Option<u8>,
    /// Channel width in MHz derived from the MCS flags.
    pub channel_width_mhz: Option<u32>,
}

/// Walks a radiotap header and returns the extracted metadata together with
/// the total header length.
pub fn parse_radiotap(data: &[u8]) -> Result<(RadiotapRx, usize), WireError> {
    if data.len() < 8 {
        return Err(WireError::BufferTooShort {
            expected: 8,
            actual: data.len(),
        });
    }
    if data[0] != 0 {
        return Err(WireError::MalformedRadiotap("unsupported version"));
    }
    let length = u16::from_le_bytes([data[2], data[3]]) as usize;
    if length < 8 || length > data.len() {
        return Err(WireError::MalformedRadiotap("declared length out of range"));
    }

    // Present words chain while the EXT bit is set; fields start after the
    // last word. Alignment is relative to the start of the header.
    let first_present = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    let mut pos = 8usize;
    let mut word = first_present;
    while word & present::EXT != 0 {
        if pos + 4 > length {
            return Err(WireError::MalformedRadiotap("truncated present chain"));
        }
        word = u32::from_le_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]);
        pos += 4;
    }

    let mut info = RadiotapRx::default();
    let fields: &[(u32, usize, usize)] = &[
        (present::TSFT, 8, 8),
        (present::FLAGS, 1, 1),
        (present::RATE, 1, 1),
        (present::CHANNEL, 4, 2),
        (present::FHSS, 2, 2),
        (present::DBM_ANTSIGNAL, 1, 1),
        (present::DBM_ANTNOISE, 1, 1),
        (present::LOCK_QUALITY, 2, 2),
        (present::TX_ATTENUATION, 2, 2),
        (present::DB_TX_ATTENUATION, 2, 2),
        (present::DBM_TX_POWER, 1, 1),
        (present::ANTENNA, 1, 1),
        (present::DB_ANTSIGNAL, 1, 1),
        (present::DB_ANTNOISE, 1, 1),
        (present::RX_FLAGS, 2, 2),
        (present::TX_FLAGS, 2, 2),
        (present::RTS_RETRIES, 1, 1),
        (present::DATA_RETRIES, 1, 1),
        (present::XCHANNEL, 8, 4),
        (present::MCS, 3, 1),
    ];

    for &(bit, size, align) in fields {
        if first_present & bit == 0 {
            continue;
        }
        if pos % align != 0 {
            pos += align - (pos % align);
        }
        if pos + size > length {
            // Card truncated its own header; keep what we have.
            break;
        }
        match bit {
            present::FLAGS => info.bad_fcs = data[pos] & FLAG_BADFCS != 0,
            present::DBM_ANTSIGNAL => info.rssi_dbm = Some(data[pos] as i8),
            present::MCS => {
                let known = data[pos];
                let flags = data[pos + 1];
                if known & mcs_known::MCS_INDEX != 0 {
                    info.mcs_index = Some(data[pos + 2]);
                }
                if known & mcs_known::BANDWIDTH != 0 {
                    info.channel_width_mhz = Some(if flags & mcs_flags::BW_40 != 0 {
                        40
                    } else {
                        20
                    });
                }
            }
            _ => {}
        }
        pos += size;
    }

    Ok((info, length))
}

/// The 24-byte 802.11 header as the link uses it.
///
/// Layout: frame control, duration, three address fields, sequence control.
/// `addr1` carries the link signature, sender role and radio-port byte;
/// `addr2` carries nonce bytes 0..6 and `addr3` the remaining two, followed
/// by a redundant copy of port and role. Receivers reconstruct the nonce
/// verbatim from the address bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub role: Role,
    pub radio_port: u8,
    pub nonce: u64,
    pub seq_ctrl: u16,
}

impl FrameHeader {
    /// Encodes the header into its 24-byte wire form.
    #[must_use]
    pub fn encode(&self) -> [u8; IEEE80211_HEADER_LEN] {
        let mut buf = [0u8; IEEE80211_HEADER_LEN];
        let nonce = self.nonce.to_le_bytes();
        buf[0..2].copy_from_slice(&FRAME_CONTROL);
        // duration stays zero
        buf[4] = LINK_SIGNATURE[0];
        buf[5] = LINK_SIGNATURE[1];
        buf[6] = self.role.to_byte();
        buf[7] = self.radio_port;
        buf[10..16].copy_from_slice(&nonce[0..6]);
        buf[16] = nonce[6];
        buf[17] = nonce[7];
        buf[18] = self.radio_port;
        buf[19] = self.role.to_byte();
        buf[20] = LINK_SIGNATURE[0];
        buf[21] = LINK_SIGNATURE[1];
        buf[22..24].copy_from_slice(&self.seq_ctrl.to_le_bytes());
        buf
    }

    /// Parses a header, verifying the link signature and role byte.
    pub fn parse(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < IEEE80211_HEADER_LEN {
            return Err(WireError::BufferTooShort {
                expected: IEEE80211_HEADER_LEN,
                actual: bytes.len(),
            });
        }
        if bytes[4] != LINK_SIGNATURE[0] || bytes[5] != LINK_SIGNATURE[1] {
            return Err(WireError::ForeignFrame);
        }
        let role = Role::from_byte(bytes[6]).ok_or(WireError::ForeignFrame)?;
        let radio_port = bytes[7];
        let mut nonce = [0u8; 8];
        nonce[0..6].copy_from_slice(&bytes[10..16]);
        nonce[6] = bytes[16];
        nonce[7] = bytes[17];
        let seq_ctrl = u16::from_le_bytes([bytes[22], bytes[23]]);
        Ok(Self {
            role,
            radio_port,
            nonce: u64::from_le_bytes(nonce),
            seq_ctrl,
        })
    }
}

/// Builds the AAD bound into every protected frame.
#[must_use]
pub fn frame_aad(radio_port: u8, nonce: u64) -> [u8; FRAME_AAD_LEN] {
    let mut aad = [0u8; FRAME_AAD_LEN];
    aad[0] = radio_port;
    aad[1..9].copy_from_slice(&nonce.to_le_bytes());
    aad
}

/// Assembles a complete injectable frame.
#[must_use]
pub fn build_frame(radiotap: &RadiotapTxHeader, header: &FrameHeader, payload: &[u8]) -> Vec<u8> {
    let mut frame =
        Vec::with_capacity(RADIOTAP_TX_HEADER_LEN + IEEE80211_HEADER_LEN + payload.len());
    frame.extend_from_slice(radiotap.as_bytes());
    frame.extend_from_slice(&header.encode());
    frame.extend_from_slice(payload);
    frame
}

/// A captured frame split into its link-level components.
#[derive(Debug, Clone)]
pub struct FrameParts<'a> {
    /// Metadata from the capture-side radiotap header.
    pub rx: RadiotapRx,
    /// Parsed 802.11 header.
    pub header: FrameHeader,
    /// Payload region: ciphertext plus tag, or a session-key announcement.
    pub payload: &'a [u8],
}

/// Parses a captured frame, rejecting foreign traffic, bad-FCS frames,
/// same-role loopback and out-of-bounds sizes.
pub fn parse_frame(local_role: Role, bytes: &[u8]) -> Result<FrameParts<'_>, WireError> {
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(WireError::Oversized(bytes.len()));
    }
    let (rx, radiotap_len) = parse_radiotap(bytes)?;
    if rx.bad_fcs {
        return Err(WireError::BadFcs);
    }
    let body = &bytes[radiotap_len..];
    let header = FrameHeader::parse(body)?;
    if header.role == local_role {
        return Err(WireError::Loopback);
    }
    Ok(FrameParts {
        rx,
        header,
        payload: &body[IEEE80211_HEADER_LEN..],
    })
}
