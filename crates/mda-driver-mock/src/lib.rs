//! Simulated microscope for rust-mda
//!
//! This crate provides a [`MockMicroscope`] that implements every hardware
//! capability the sequencing engine drives, so acquisitions can be run and
//! tested without physical hardware. All delays use `tokio::time::sleep`.
//!
//! # Modes
//!
//! - [`MockMode::Instant`]: no delays, deterministic, for unit tests
//! - [`MockMode::Realistic`]: settling, readout and preset switching times
//! - [`MockMode::Chaos`]: realistic timing plus random failures
//!
//! # Example
//!
//! ```rust,ignore
//! use mda_driver_mock::{ErrorConfig, ErrorScenario, MockMicroscope};
//!
//! let scope = MockMicroscope::builder()
//!     .focus_direction(1)
//!     .error_config(ErrorConfig::scenario(ErrorScenario::FailAfterN {
//!         operation: "snap_image",
//!         count: 10,
//!     }))
//!     .build();
//! ```

pub mod common;
mod mock_microscope;
mod pattern;

// Re-export common types
pub use common::errors::ops;
pub use common::{ErrorConfig, ErrorScenario, MockMode, MockRng, TimingConfig};

pub use mock_microscope::{FocusTravel, MockCall, MockMicroscope, MockMicroscopeBuilder};
pub use pattern::{generate_test_pattern, PatternParams};
