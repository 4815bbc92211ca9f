//! Timing configuration for realistic mode.

use std::time::Duration;

/// Simulated device latencies
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimingConfig {
    /// Camera readout after the exposure, in ms
    pub readout_ms: u64,
    /// Fixed settling time of a stage after a move, in ms
    pub settling_ms: u64,
    /// Additional settling per µm travelled, in ms
    pub settling_ms_per_um: f64,
    /// Time to switch a configuration preset (filter wheel, lasers), in ms
    pub config_switch_ms: u64,
    /// Duration of a full-focus routine, in ms
    pub autofocus_ms: u64,
    /// Random variation applied to every delay, as a fraction
    pub jitter: f64,
}

impl TimingConfig {
    /// Latencies of a typical widefield setup.
    pub fn widefield() -> Self {
        Self {
            readout_ms: 20,
            settling_ms: 10,
            settling_ms_per_um: 0.05,
            config_switch_ms: 30,
            autofocus_ms: 200,
            jitter: 0.1,
        }
    }

    /// Settling time after moving `distance_um`.
    #[must_use]
    pub fn settling(&self, distance_um: f64) -> Duration {
        let extra = (self.settling_ms_per_um * distance_um.abs()).max(0.0);
        Duration::from_millis(self.settling_ms) + Duration::from_micros((extra * 1000.0).round() as u64)
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            readout_ms: 0,
            settling_ms: 0,
            settling_ms_per_um: 0.0,
            config_switch_ms: 0,
            autofocus_ms: 0,
            jitter: 0.0,
        }
    }
}
