// Configuration schema for the link endpoint.

use std::{
    fs, io,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use serde::Deserialize;
use thiserror::Error;

use crate::wire::Role;

/// Error returned while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error when reading a configuration file from disk.
    #[error("failed to read config '{path}': {source}")]
    Io {
        /// Path that failed to read.
        path: PathBuf,
        /// Source IO error.
        #[source]
        source: io::Error,
    },
    /// Error when parsing the configuration contents.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    /// The configuration did not pass validation checks.
    #[error("invalid config: {0}")]
    Validation(String),
}

/// Endpoint construction parameters.
///
/// Everything has a usable default; quirk flags exist because specific
/// chipsets need them, not because they are nice to have.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Logical role of this endpoint, written into every 802.11 header so
    /// receivers can reject same-role loopback.
    pub role: Role,
    /// Key file (`secret || public`, raw bytes). `None` derives a
    /// deterministic development keypair from the default seed.
    pub keypair: Option<PathBuf>,
    /// Discard the first RSSI sample per card; the rtl8812au reports a
    /// bogus value on its first frame.
    pub rtl8812au_rssi_fixup: bool,
    /// Ask the opener for a receive-direction filter on the capture handle.
    /// Not honored by every driver (AR9271), hence the role field.
    pub set_direction: bool,
    /// Log every captured frame. Spams the console; debugging only.
    pub log_all_received_packets: bool,
    /// Log every validated frame. Spams the console; debugging only.
    pub log_all_received_validated_packets: bool,
    /// Measure and log capture-to-processing host latency.
    pub advanced_latency_debugging_rx: bool,
    /// Raise the receive thread to realtime priority when possible.
    pub receive_thread_max_realtime: bool,
    /// Switch the TX card to the one with the best RSSI. When disabled,
    /// card 0 is pinned.
    pub enable_auto_switch_tx_card: bool,
    /// Interval between session-key announcements while data is flowing.
    /// An idle transmitter stays quiet after the construction burst.
    pub session_key_announce_interval_ms: u64,
    /// Injections slower than this hint at an overrunning driver queue.
    pub tx_inject_warn_ms: u64,
    /// Nonce increment beyond which a discontinuity counts as a big gap.
    pub big_gap_threshold: u64,
    /// Window for the pollution percentage recalculation.
    pub pollution_window_ms: u64,
    /// Window for packet-loss, packets-per-second and bitrate estimators.
    pub stats_window_ms: u64,
    /// A card with no valid frames for this long, while another card keeps
    /// receiving, is flagged disconnected.
    pub card_disconnect_timeout_ms: u64,
    /// Upper bound for one receive-poll cycle.
    pub receive_poll_timeout_ms: u64,
    /// Bounded drain per readiness event; hitting the bound means the CPU
    /// is falling behind the air.
    pub max_frames_per_poll: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            role: Role::Air,
            keypair: None,
            rtl8812au_rssi_fixup: false,
            set_direction: true,
            log_all_received_packets: false,
            log_all_received_validated_packets: false,
            advanced_latency_debugging_rx: false,
            receive_thread_max_realtime: true,
            enable_auto_switch_tx_card: true,
            session_key_announce_interval_ms: 1000,
            tx_inject_warn_ms: 5,
            big_gap_threshold: 20,
            pollution_window_ms: 1000,
            stats_window_ms: 1000,
            card_disconnect_timeout_ms: 5000,
            receive_poll_timeout_ms: 100,
            max_frames_per_poll: 64,
        }
    }
}

impl Options {
    /// Loads options from a TOML file.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let contents = fs::read_to_string(path_ref).map_err(|source| ConfigError::Io {
            path: path_ref.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Loads options from a TOML string slice.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        <Self as FromStr>::from_str(input)
    }

    /// Validates the options, returning an error when constraints are
    /// violated.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session_key_announce_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "session_key_announce_interval_ms must be positive".into(),
            ));
        }
        if self.stats_window_ms == 0 || self.pollution_window_ms == 0 {
            return Err(ConfigError::Validation(
                "stats windows must be positive".into(),
            ));
        }
        if self.big_gap_threshold == 0 {
            return Err(ConfigError::Validation(
                "big_gap_threshold must be positive".into(),
            ));
        }
        if self.receive_poll_timeout_ms == 0 || self.receive_poll_timeout_ms > u64::from(u16::MAX)
        {
            return Err(ConfigError::Validation(
                "receive_poll_timeout_ms must be in 1..=65535".into(),
            ));
        }
        if self.max_frames_per_poll == 0 {
            return Err(ConfigError::Validation(
                "max_frames_per_poll must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn session_key_announce_interval(&self) -> Duration {
        Duration::from_millis(self.session_key_announce_interval_ms)
    }

    pub fn tx_inject_warn(&self) -> Duration {
        Duration::from_millis(self.tx_inject_warn_ms)
    }

    pub fn pollution_window(&self) -> Duration {
        Duration::from_millis(self.pollution_window_ms)
    }

    pub fn stats_window(&self) -> Duration {
        Duration::from_millis(self.stats_window_ms)
    }

    pub fn card_disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.card_disconnect_timeout_ms)
    }

    pub fn receive_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_poll_timeout_ms)
    }
}

impl FromStr for Options {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let options: Self = toml::from_str(s)?;
        options.validate()?;
        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Options::default().validate().expect("defaults are valid");
    }

    #[test]
    fn parses_minimal_toml() {
        let options = Options::from_toml_str(
            r#"
            role = "ground"
            rtl8812au_rssi_fixup = true
            session_key_announce_interval_ms = 500
            "#,
        )
        .expect("parse");
        assert_eq!(options.role, Role::Ground);
        assert!(options.rtl8812au_rssi_fixup);
        assert_eq!(
            options.session_key_announce_interval(),
            Duration::from_millis(500)
        );
        // Untouched fields keep their defaults.
        assert!(options.enable_auto_switch_tx_card);
    }

    #[test]
    fn rejects_zero_announce_interval() {
        let err = Options::from_toml_str("session_key_announce_interval_ms = 0")
            .expect_err("must fail validation");
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn rejects_oversized_poll_timeout() {
        let err = Options::from_toml_str("receive_poll_timeout_ms = 100000")
            .expect_err("must fail validation");
        assert!(matches!(err, ConfigError::Validation(_)));
    }
}
