//! `mda-core`
//!
//! Core types and traits for multi-dimensional acquisition sequencing.
//!
//! This crate provides the vocabulary shared by the generator pipeline, the
//! sequencing engine, storage and device drivers:
//!
//! - [`axis`]: acquisition axes, their coordinates and stepping rules
//! - [`event`]: acquisition events and channel presets
//! - [`settings`]: the immutable per-run settings snapshot
//! - [`capabilities`]: hardware capability traits the engine drives
//! - [`image`]: tagged images handed to the sink
//! - [`document`]: `Started`/`Ended` lifecycle documents
//! - [`error`]: the [`MdaError`] taxonomy
//! - [`config`]: layered engine configuration
//! - [`limits`]: shared hard limits

pub mod axis;
pub mod capabilities;
pub mod config;
pub mod document;
pub mod error;
pub mod event;
pub mod image;
pub mod limits;
pub mod settings;

pub use axis::{AxisBounds, AxisCoords, AxisKind, AxisSpec, StepRule};
pub use capabilities::{CapturedImage, ImageGeometry, MicroscopeCore};
pub use config::EngineConfig;
pub use document::{Document, EndedDoc, ExitStatus, StartedDoc};
pub use error::{DriverError, DriverErrorKind, ErrorCategory, MdaError, MdaResult};
pub use event::{AcquisitionEvent, ChannelSetting, StagePosition, StageTarget};
pub use image::{ImageMetadata, TaggedImage};
pub use settings::{
    AcqOrderMode, ChannelSpec, FocusLimits, Footprint, Point3, SequenceSettings, SpaceMode,
    SurfaceDef, VolumeSettings,
};
