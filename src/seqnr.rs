// Loss, gap and pollution estimation from nonce and sequence streams.

use std::time::{Duration, Instant};

/// Windowed packet-loss estimator driven by the 64-bit frame nonce.
///
/// Within each window the expected count is `max - min + 1` over the nonces
/// actually seen; the published loss is `100 * (expected - received) /
/// expected`. A single increment larger than the big-gap threshold counts as
/// a burst loss rather than steady-state loss.
#[derive(Debug)]
pub struct NonceTracker {
    big_gap_threshold: u64,
    window: Duration,
    window_start: Option<Instant>,
    window_min: u64,
    window_max: u64,
    window_count: u64,
    window_big_gaps: u16,
    last_nonce: Option<u64>,
    curr_loss_perc: i32,
    curr_big_gaps: i16,
}

impl NonceTracker {
    pub fn new(big_gap_threshold: u64, window: Duration) -> Self {
        Self {
            big_gap_threshold,
            window,
            window_start: None,
            window_min: u64::MAX,
            window_max: 0,
            window_count: 0,
            window_big_gaps: 0,
            last_nonce: None,
            curr_loss_perc: -1,
            curr_big_gaps: -1,
        }
    }

    /// Feeds the nonce of a validated frame. Regressing nonces are ignored;
    /// they stem from cross-card duplicates or replays.
    pub fn on_nonce(&mut self, nonce: u64, now: Instant) {
        if let Some(last) = self.last_nonce {
            if nonce <= last {
                return;
            }
            if nonce - last > self.big_gap_threshold {
                self.window_big_gaps = self.window_big_gaps.saturating_add(1);
            }
        }
        self.last_nonce = Some(nonce);
        self.window_start.get_or_insert(now);
        self.window_min = self.window_min.min(nonce);
        self.window_max = self.window_max.max(nonce);
        self.window_count += 1;
    }

    /// Recalculates the published values once per window.
    pub fn maybe_recalculate(&mut self, now: Instant) {
        let due = match self.window_start {
            Some(start) => now.duration_since(start) >= self.window,
            // An empty window still has to decay the published values.
            None => true,
        };
        if !due {
            return;
        }
        if self.window_count > 0 {
            let expected = self.window_max - self.window_min + 1;
            let lost = expected.saturating_sub(self.window_count);
            self.curr_loss_perc = (lost * 100 / expected) as i32;
            self.curr_big_gaps = self.window_big_gaps as i16;
        } else {
            self.curr_loss_perc = -1;
            self.curr_big_gaps = -1;
        }
        self.window_start = Some(now);
        self.window_min = u64::MAX;
        self.window_max = 0;
        self.window_count = 0;
        self.window_big_gaps = 0;
    }

    /// Drops all state; called on session change and on stats reset.
    pub fn reset(&mut self) {
        let threshold = self.big_gap_threshold;
        let window = self.window;
        *self = Self::new(threshold, window);
    }

    /// Loss percentage over the last complete window, `-1` when idle.
    pub fn loss_perc(&self) -> i32 {
        self.curr_loss_perc
    }

    /// Big gaps observed in the last complete window, `-1` when idle.
    pub fn big_gaps(&self) -> i16 {
        self.curr_big_gaps
    }
}

/// Tracker over the 12-bit 802.11 sequence counter of frames that look like
/// ours. Comparing its increments against the validated count estimates how
/// many frames are plausibly ours but failed (or never saw) validation,
/// which is what a channel scan observes before any session key arrives.
#[derive(Debug)]
pub struct SeqCounterTracker {
    window: Duration,
    window_start: Option<Instant>,
    last_seq: Option<u16>,
    window_increments: u32,
    window_valid: u32,
    curr_likely_not_valid: i32,
}

impl SeqCounterTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            window_start: None,
            last_seq: None,
            window_increments: 0,
            window_valid: 0,
            curr_likely_not_valid: 0,
        }
    }

    /// Feeds the sequence counter of an our-shaped frame. A repeated value
    /// is a cross-card duplicate and does not count as an increment.
    pub fn on_seq(&mut self, seq: u16, now: Instant) {
        self.window_start.get_or_insert(now);
        if self.last_seq != Some(seq) {
            self.window_increments = self.window_increments.saturating_add(1);
        }
        self.last_seq = Some(seq);
    }

    /// A frame of this window that validated (data or session key).
    pub fn on_valid(&mut self) {
        self.window_valid = self.window_valid.saturating_add(1);
    }

    pub fn maybe_recalculate(&mut self, now: Instant) {
        let due = match self.window_start {
            Some(start) => now.duration_since(start) >= self.window,
            None => false,
        };
        if !due {
            return;
        }
        self.curr_likely_not_valid =
            self.window_increments.saturating_sub(self.window_valid) as i32;
        self.window_start = Some(now);
        self.window_increments = 0;
        self.window_valid = 0;
    }

    pub fn reset(&mut self) {
        let window = self.window;
        *self = Self::new(window);
    }

    /// Frames plausibly ours but not validated, over the last window.
    pub fn likely_not_valid(&self) -> i32 {
        self.curr_likely_not_valid
    }
}

/// Link-pollution estimator: the share of captured frames that are not
/// attributable to this link, recalculated per window.
#[derive(Debug)]
pub struct PollutionTracker {
    window: Duration,
    window_start: Option<Instant>,
    total: u32,
    ours: u32,
    curr_perc: i32,
}

impl PollutionTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            window_start: None,
            total: 0,
            ours: 0,
            curr_perc: 0,
        }
    }

    /// Any captured frame, ours or foreign.
    pub fn on_any(&mut self, now: Instant) {
        self.window_start.get_or_insert(now);
        self.total = self.total.saturating_add(1);
    }

    /// A frame attributable to this link (session or validated data).
    pub fn on_ours(&mut self) {
        self.ours = self.ours.saturating_add(1);
    }

    pub fn maybe_recalculate(&mut self, now: Instant) {
        let due = match self.window_start {
            Some(start) => now.duration_since(start) >= self.window,
            None => false,
        };
        if !due {
            return;
        }
        if self.total > 0 {
            let ours = self.ours.min(self.total);
            self.curr_perc = (100 - ours * 100 / self.total) as i32;
        }
        self.window_start = Some(now);
        self.total = 0;
        self.ours = 0;
    }

    pub fn reset(&mut self) {
        let window = self.window;
        *self = Self::new(window);
    }

    /// Pollution percentage over the last complete window.
    pub fn pollution_perc(&self) -> i32 {
        self.curr_perc
    }
}
