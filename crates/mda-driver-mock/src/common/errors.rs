//! Error injection for the simulated microscope.
//!
//! Every device call consults an [`ErrorConfig`] before doing anything.
//! Failures surface as [`DriverError`] so the engine sees the same error
//! shape it would get from a real driver.

use super::rng::MockRng;
use mda_core::error::{DriverError, DriverErrorKind};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Operation names checked by the simulated microscope.
pub mod ops {
    /// Focus or XY move.
    pub const MOVE_STAGE: &str = "move_stage";
    /// Busy wait on a device.
    pub const WAIT_FOR_DEVICE: &str = "wait_for_device";
    /// Position query.
    pub const POSITION: &str = "position";
    /// Focus direction query.
    pub const FOCUS_DIRECTION: &str = "focus_direction";
    /// Preset change.
    pub const SET_CONFIG: &str = "set_config";
    /// Exposure change.
    pub const SET_EXPOSURE: &str = "set_exposure";
    /// Shutter change.
    pub const SET_SHUTTER: &str = "set_shutter";
    /// Image capture.
    pub const SNAP_IMAGE: &str = "snap_image";
    /// Autofocus routine.
    pub const FULL_FOCUS: &str = "full_focus";
}

/// Error injection configuration
#[derive(Clone, Debug)]
pub struct ErrorConfig {
    /// Per-operation failure rate (0.0 to 1.0); `"*"` applies to all
    failure_rates: Arc<HashMap<&'static str, f64>>,
    /// Deterministic failure scenarios
    scenarios: Arc<Vec<ErrorScenario>>,
    /// RNG for rate-based failures
    rng: Arc<MockRng>,
    /// Scenario bookkeeping
    state: Arc<Mutex<ErrorState>>,
}

/// Deterministic failure scenario.
#[derive(Debug, Clone)]
pub enum ErrorScenario {
    /// Fail every call of `operation` after `count` successful ones
    FailAfterN {
        /// Operation to fail.
        operation: &'static str,
        /// Successful calls before failing.
        count: u32,
    },
    /// Every call of `operation` times out
    Timeout {
        /// Operation to fail.
        operation: &'static str,
    },
    /// Link drops on the first call and stays down
    CommunicationLoss,
    /// Device latches a fault code on the first call
    HardwareFault {
        /// Fault code reported.
        code: u32,
    },
}

#[derive(Default, Debug)]
struct ErrorState {
    operation_counts: HashMap<&'static str, u32>,
    communication_lost: bool,
    hardware_fault_code: u32,
}

impl ErrorConfig {
    /// No injected errors (default)
    pub fn none() -> Self {
        Self::build(HashMap::new(), Vec::new(), None)
    }

    /// Uniform random failures on every operation, seeded for reproducibility
    pub fn random_failures_seeded(rate: f64, seed: Option<u64>) -> Self {
        let mut rates = HashMap::new();
        rates.insert("*", rate);
        Self::build(rates, Vec::new(), seed)
    }

    /// Single deterministic scenario
    pub fn scenario(scenario: ErrorScenario) -> Self {
        Self::scenarios(vec![scenario])
    }

    /// Several deterministic scenarios
    pub fn scenarios(scenarios: Vec<ErrorScenario>) -> Self {
        Self::build(HashMap::new(), scenarios, None)
    }

    /// Custom failure rates per operation
    pub fn with_rates(rates: HashMap<&'static str, f64>) -> Self {
        Self::build(rates, Vec::new(), None)
    }

    fn build(
        rates: HashMap<&'static str, f64>,
        scenarios: Vec<ErrorScenario>,
        seed: Option<u64>,
    ) -> Self {
        Self {
            failure_rates: Arc::new(rates),
            scenarios: Arc::new(scenarios),
            rng: Arc::new(MockRng::new(seed)),
            state: Arc::new(Mutex::new(ErrorState::default())),
        }
    }

    /// Check whether `operation` should fail and return the injected error
    pub fn check_operation(
        &self,
        driver_type: &str,
        operation: &'static str,
    ) -> Result<(), DriverError> {
        let mut state = self.state.lock();

        if state.communication_lost {
            return Err(DriverError::new(
                driver_type,
                DriverErrorKind::Communication,
                "Communication lost",
            ));
        }
        if state.hardware_fault_code != 0 {
            return Err(DriverError::new(
                driver_type,
                DriverErrorKind::Hardware,
                format!("Hardware fault: {}", state.hardware_fault_code),
            ));
        }

        for scenario in self.scenarios.iter() {
            match scenario {
                ErrorScenario::FailAfterN {
                    operation: op,
                    count,
                } if *op == operation => {
                    let current = state.operation_counts.entry(operation).or_insert(0);
                    *current += 1;
                    if *current > *count {
                        return Err(DriverError::new(
                            driver_type,
                            DriverErrorKind::Hardware,
                            format!("Injected failure on '{}' after {} calls", operation, count),
                        ));
                    }
                }
                ErrorScenario::Timeout { operation: op } if *op == operation => {
                    return Err(DriverError::new(
                        driver_type,
                        DriverErrorKind::Timeout,
                        format!("Operation '{}' timed out", operation),
                    ));
                }
                ErrorScenario::CommunicationLoss => {
                    state.communication_lost = true;
                    return Err(DriverError::new(
                        driver_type,
                        DriverErrorKind::Communication,
                        "Communication lost",
                    ));
                }
                ErrorScenario::HardwareFault { code } => {
                    state.hardware_fault_code = *code;
                    return Err(DriverError::new(
                        driver_type,
                        DriverErrorKind::Hardware,
                        format!("Hardware fault: {}", code),
                    ));
                }
                _ => {}
            }
        }

        let rate = self
            .failure_rates
            .get(operation)
            .or_else(|| self.failure_rates.get("*"))
            .copied()
            .unwrap_or(0.0);
        if self.rng.should_fail(rate) {
            return Err(DriverError::new(
                driver_type,
                DriverErrorKind::Hardware,
                format!("Random failure on operation '{}'", operation),
            ));
        }

        Ok(())
    }

    /// Clear counters and latched faults
    pub fn reset(&self) {
        *self.state.lock() = ErrorState::default();
    }
}

impl Default for ErrorConfig {
    fn default() -> Self {
        Self::none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_errors() {
        let config = ErrorConfig::none();
        for _ in 0..100 {
            assert!(config.check_operation("mock", ops::SNAP_IMAGE).is_ok());
        }
    }

    #[test]
    fn test_random_failures() {
        let config = ErrorConfig::random_failures_seeded(0.5, Some(42));
        let failures = (0..1000)
            .filter(|_| config.check_operation("mock", ops::MOVE_STAGE).is_err())
            .count();
        assert!(failures > 400 && failures < 600, "Got {} failures", failures);
    }

    #[test]
    fn test_fail_after_n() {
        let config = ErrorConfig::scenario(ErrorScenario::FailAfterN {
            operation: ops::SNAP_IMAGE,
            count: 3,
        });
        for i in 0..3 {
            assert!(
                config.check_operation("mock", ops::SNAP_IMAGE).is_ok(),
                "call {} should succeed",
                i + 1
            );
        }
        assert!(config.check_operation("mock", ops::SNAP_IMAGE).is_err());
        // other operations are unaffected
        assert!(config.check_operation("mock", ops::MOVE_STAGE).is_ok());
    }

    #[test]
    fn test_timeout_scenario() {
        let config = ErrorConfig::scenario(ErrorScenario::Timeout {
            operation: ops::MOVE_STAGE,
        });
        let err = config
            .check_operation("mock", ops::MOVE_STAGE)
            .unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::Timeout);
        assert!(err.message.contains("timed out"));
    }

    #[test]
    fn test_communication_loss_latches() {
        let config = ErrorConfig::scenario(ErrorScenario::CommunicationLoss);
        let err = config.check_operation("mock", ops::POSITION).unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::Communication);
        assert!(config.check_operation("mock", ops::SET_CONFIG).is_err());
    }

    #[test]
    fn test_hardware_fault() {
        let config = ErrorConfig::scenario(ErrorScenario::HardwareFault { code: 0x42 });
        let err = config.check_operation("mock", ops::SNAP_IMAGE).unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::Hardware);
        assert!(err.message.contains("66"));
    }

    #[test]
    fn test_reset() {
        let config = ErrorConfig::scenario(ErrorScenario::FailAfterN {
            operation: ops::SNAP_IMAGE,
            count: 1,
        });
        assert!(config.check_operation("mock", ops::SNAP_IMAGE).is_ok());
        assert!(config.check_operation("mock", ops::SNAP_IMAGE).is_err());
        config.reset();
        assert!(config.check_operation("mock", ops::SNAP_IMAGE).is_ok());
    }

    #[test]
    fn test_custom_rates() {
        let mut rates = HashMap::new();
        rates.insert(ops::SET_SHUTTER, 1.0);
        rates.insert(ops::SNAP_IMAGE, 0.0);
        let config = ErrorConfig::with_rates(rates);
        for _ in 0..10 {
            assert!(config.check_operation("mock", ops::SET_SHUTTER).is_err());
            assert!(config.check_operation("mock", ops::SNAP_IMAGE).is_ok());
        }
    }
}
