// metrics.rs - Prometheus counters for scrape-style export.

use prometheus::{IntCounter, Registry};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),
}

/// Low-rate operational counters. The stats snapshot getters remain the
/// primary observable surface; this registry exists for exporters.
#[derive(Debug, Clone)]
pub struct Metrics {
    registry: Registry,
    pub rx_frames_any: IntCounter,
    pub rx_frames_valid: IntCounter,
    pub rx_aead_failures: IntCounter,
    pub rx_session_keys_accepted: IntCounter,
    pub rx_session_key_failures: IntCounter,
    pub tx_injected_frames: IntCounter,
    pub tx_errors: IntCounter,
    pub tx_slow_injections: IntCounter,
    pub callback_panics: IntCounter,
}

impl Metrics {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new_custom(Some("aircast".into()), None)?;

        macro_rules! register_counter {
            ($name:expr, $help:expr) => {{
                let counter = IntCounter::new($name, $help)?;
                registry.register(Box::new(counter.clone()))?;
                counter
            }};
        }

        let rx_frames_any = register_counter!(
            "rx_frames_any",
            "Captured frames of any origin, including foreign traffic"
        );
        let rx_frames_valid =
            register_counter!("rx_frames_valid", "Frames that passed AEAD validation");
        let rx_aead_failures =
            register_counter!("rx_aead_failures", "AEAD authentication failures");
        let rx_session_keys_accepted = register_counter!(
            "rx_session_keys_accepted",
            "Session key announcements committing a new session"
        );
        let rx_session_key_failures = register_counter!(
            "rx_session_key_failures",
            "Session key announcements that failed to unwrap"
        );
        let tx_injected_frames =
            register_counter!("tx_injected_frames", "Frames handed to the driver");
        let tx_errors = register_counter!("tx_errors", "Hard injection failures");
        let tx_slow_injections = register_counter!(
            "tx_slow_injections",
            "Injections exceeding the latency hint threshold"
        );
        let callback_panics = register_counter!(
            "callback_panics",
            "User callbacks that panicked at the dispatch boundary"
        );

        Ok(Self {
            registry,
            rx_frames_any,
            rx_frames_valid,
            rx_aead_failures,
            rx_session_keys_accepted,
            rx_session_key_failures,
            tx_injected_frames,
            tx_errors,
            tx_slow_injections,
            callback_panics,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_metrics_registry() {
        let metrics = Metrics::new().expect("metrics");
        metrics.rx_frames_any.inc();
        metrics.rx_aead_failures.inc();
        metrics.tx_injected_frames.inc();
        assert!(!metrics.gather().is_empty());
    }
}
