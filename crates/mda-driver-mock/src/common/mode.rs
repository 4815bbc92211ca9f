//! Operational modes for the simulated microscope.
//!
//! - **Instant**: Zero delays, deterministic behavior for unit tests
//! - **Realistic**: Hardware-like timing for integration tests and demos
//! - **Chaos**: Realistic timing plus random failures for resilience testing

use serde::{Deserialize, Serialize};

/// Operational modes for mock devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MockMode {
    /// Zero delays, deterministic - for unit tests
    #[default]
    Instant,
    /// Hardware-like timing - for integration tests
    Realistic,
    /// Hardware-like timing with injected failures
    Chaos,
}

impl MockMode {
    /// Whether this mode sleeps to simulate device timing.
    #[must_use]
    pub fn is_timed(&self) -> bool {
        !matches!(self, MockMode::Instant)
    }
}

impl std::fmt::Display for MockMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            MockMode::Instant => "instant",
            MockMode::Realistic => "realistic",
            MockMode::Chaos => "chaos",
        };
        write!(f, "{}", label)
    }
}

impl std::str::FromStr for MockMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "instant" => Ok(MockMode::Instant),
            "realistic" => Ok(MockMode::Realistic),
            "chaos" => Ok(MockMode::Chaos),
            other => Err(format!(
                "unknown mock mode '{}', expected instant, realistic or chaos",
                other
            )),
        }
    }
}
