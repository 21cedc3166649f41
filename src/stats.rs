// Rolling rate estimators, smoothed RSSI and the observable stats structs.

use std::fmt;
use std::time::{Duration, Instant};

const RSSI_SMOOTHING: f32 = 0.2;

/// Windowed packets-per-second estimator.
///
/// Publishes `-1` when no samples arrived in the most recent window, which
/// is distinguishable from a genuine zero rate.
#[derive(Debug)]
pub struct PacketsPerSecond {
    window: Duration,
    window_start: Option<Instant>,
    count: u64,
    curr: i32,
}

impl PacketsPerSecond {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            window_start: None,
            count: 0,
            curr: -1,
        }
    }

    pub fn on_packet(&mut self, now: Instant) {
        self.window_start.get_or_insert(now);
        self.count += 1;
    }

    pub fn maybe_recalculate(&mut self, now: Instant) {
        let elapsed = match self.window_start {
            Some(start) => now.duration_since(start),
            None => {
                self.curr = -1;
                return;
            }
        };
        if elapsed < self.window {
            return;
        }
        self.curr = if self.count == 0 {
            -1
        } else {
            (self.count as f64 / elapsed.as_secs_f64()).round() as i32
        };
        self.window_start = Some(now);
        self.count = 0;
    }

    pub fn current(&self) -> i32 {
        self.curr
    }

    pub fn reset(&mut self) {
        let window = self.window;
        *self = Self::new(window);
    }
}

/// Windowed bitrate estimator; same idle semantics as [`PacketsPerSecond`].
#[derive(Debug)]
pub struct Bitrate {
    window: Duration,
    window_start: Option<Instant>,
    bytes: u64,
    curr: i64,
}

impl Bitrate {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            window_start: None,
            bytes: 0,
            curr: -1,
        }
    }

    pub fn on_bytes(&mut self, bytes: usize, now: Instant) {
        self.window_start.get_or_insert(now);
        self.bytes += bytes as u64;
    }

    pub fn maybe_recalculate(&mut self, now: Instant) {
        let elapsed = match self.window_start {
            Some(start) => now.duration_since(start),
            None => {
                self.curr = -1;
                return;
            }
        };
        if elapsed < self.window {
            return;
        }
        self.curr = if self.bytes == 0 {
            -1
        } else {
            (self.bytes as f64 * 8.0 / elapsed.as_secs_f64()).round() as i64
        };
        self.window_start = Some(now);
        self.bytes = 0;
    }

    /// Bits per second over the last window, `-1` when idle.
    pub fn current(&self) -> i64 {
        self.curr
    }

    pub fn reset(&mut self) {
        let window = self.window;
        *self = Self::new(window);
    }
}

/// Exponentially smoothed per-card RSSI.
///
/// The rtl8812au reports a garbage value on its first frame; the fixup flag
/// discards exactly one leading sample.
#[derive(Debug)]
pub struct SmoothedRssi {
    discard_first: bool,
    discarded: bool,
    value: Option<f32>,
}

impl SmoothedRssi {
    pub fn new(discard_first: bool) -> Self {
        Self {
            discard_first,
            discarded: false,
            value: None,
        }
    }

    pub fn add(&mut self, sample_dbm: i8) {
        if self.discard_first && !self.discarded {
            self.discarded = true;
            return;
        }
        self.value = Some(match self.value {
            Some(current) => {
                current * (1.0 - RSSI_SMOOTHING) + f32::from(sample_dbm) * RSSI_SMOOTHING
            }
            None => f32::from(sample_dbm),
        });
    }

    pub fn get(&self) -> Option<i8> {
        self.value.map(|v| v.round().clamp(-128.0, 127.0) as i8)
    }

    pub fn reset(&mut self) {
        let discard_first = self.discard_first;
        *self = Self::new(discard_first);
    }
}

/// Transmit-side statistics snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxStats {
    pub n_injected_packets: i64,
    /// Data bytes handed in by producers, before framing and AEAD overhead.
    pub n_injected_bytes_excluding_overhead: i64,
    /// On-air bytes including framing, AEAD overhead and session-key frames.
    pub n_injected_bytes_including_overhead: i64,
    pub curr_packets_per_second: i32,
    pub curr_bits_per_second_excluding_overhead: i64,
    pub curr_bits_per_second_including_overhead: i64,
    /// Injections that exceeded the latency hint threshold; an early sign
    /// the driver queue cannot keep up with the offered bitrate.
    pub count_tx_injections_error_hint: i32,
    pub count_tx_errors: i32,
}

impl Default for TxStats {
    fn default() -> Self {
        Self {
            n_injected_packets: 0,
            n_injected_bytes_excluding_overhead: 0,
            n_injected_bytes_including_overhead: 0,
            curr_packets_per_second: -1,
            curr_bits_per_second_excluding_overhead: -1,
            curr_bits_per_second_including_overhead: -1,
            count_tx_injections_error_hint: 0,
            count_tx_errors: 0,
        }
    }
}

impl fmt::Display for TxStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TX[packets:{} pps:{} bps:{}/{} err_hint:{} err:{}]",
            self.n_injected_packets,
            self.curr_packets_per_second,
            self.curr_bits_per_second_excluding_overhead,
            self.curr_bits_per_second_including_overhead,
            self.count_tx_injections_error_hint,
            self.count_tx_errors,
        )
    }
}

/// Aggregate receive-side statistics snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxStats {
    /// Everything captured, including foreign wifi traffic.
    pub count_p_any: i64,
    pub count_bytes_any: i64,
    /// Frames that passed AEAD validation and were delivered.
    pub count_p_valid: i64,
    pub count_bytes_valid: i64,
    pub curr_packet_loss: i32,
    pub curr_packets_per_second: i32,
    pub curr_bits_per_second: i64,
    pub n_received_valid_session_key_packets: i32,
    /// MCS index of the most recent validated frame, when reported.
    pub last_received_packet_mcs_index: i32,
    /// Channel width of the most recent validated frame, when reported.
    pub last_received_packet_channel_width: i32,
    pub curr_big_gaps_counter: i16,
    /// Share of captured frames not attributable to this link.
    pub curr_link_pollution_perc: i32,
    /// Frames that look like ours but were not (yet) validated; useful
    /// during channel scans before any session key arrived.
    pub curr_n_likely_link_packets: i32,
}

impl Default for RxStats {
    fn default() -> Self {
        Self {
            count_p_any: 0,
            count_bytes_any: 0,
            count_p_valid: 0,
            count_bytes_valid: 0,
            curr_packet_loss: -1,
            curr_packets_per_second: -1,
            curr_bits_per_second: -1,
            n_received_valid_session_key_packets: 0,
            last_received_packet_mcs_index: -1,
            last_received_packet_channel_width: -1,
            curr_big_gaps_counter: -1,
            curr_link_pollution_perc: 0,
            curr_n_likely_link_packets: 0,
        }
    }
}

impl fmt::Display for RxStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RX[any:{} valid:{} loss:{}% pps:{} bps:{} sess:{} pollution:{}%]",
            self.count_p_any,
            self.count_p_valid,
            self.curr_packet_loss,
            self.curr_packets_per_second,
            self.curr_bits_per_second,
            self.n_received_valid_session_key_packets,
            self.curr_link_pollution_perc,
        )
    }
}

/// Per-card receive statistics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RxStatsPerCard {
    /// Smoothed antenna signal, when the card has reported any.
    pub rssi_dbm: Option<i8>,
    pub count_p_any: i64,
    pub count_p_valid: i64,
    pub curr_packet_loss: i32,
    /// The card produced no valid frames for the disconnect timeout while
    /// another card kept receiving.
    pub disconnected: bool,
}

impl fmt::Display for RxStatsPerCard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.rssi_dbm {
            Some(rssi) => write!(f, "Card[rssi:{}dBm", rssi)?,
            None => write!(f, "Card[rssi:n/a")?,
        }
        write!(
            f,
            " any:{} valid:{} loss:{}%{}]",
            self.count_p_any,
            self.count_p_valid,
            self.curr_packet_loss,
            if self.disconnected { " DISCONNECTED" } else { "" },
        )
    }
}
