//! Acquisition sequencing.
//!
//! This crate turns a [`SequenceSettings`](mda_core::SequenceSettings)
//! snapshot into a lazy stream of acquisition events and drives a
//! microscope through them.
//!
//! # Architecture
//!
//! - **Stages**: one per iterated axis (time, position, channel, slice).
//!   Each expands an event into its children; chaining them with
//!   `flat_map` yields the event stream without materializing it.
//! - **Volume bounds**: decide where Z stacks start and stop for a tile,
//!   from fixed ranges or from surfaces fitted through sample points.
//! - **Plan**: validates the settings and assembles the stages in the
//!   requested nesting order.
//! - **RunEngine**: pulls events, positions the hardware, snaps images and
//!   hands them to the sink over a bounded queue.
//!
//! # Example
//!
//! ```rust,ignore
//! use mda_experiment::RunEngine;
//!
//! let engine = RunEngine::new(core, EngineConfig::default());
//! println!("{}", engine.estimate(&settings).await?);
//!
//! let result = engine.run(&settings, store).await?;
//!
//! // from another task
//! engine.pause().await?;
//! engine.resume().await?;
//! ```

pub mod estimate;
pub mod pipeline;
pub mod plan;
pub mod preflight;
pub mod run_engine;
pub mod runnables;
pub mod stages;
pub mod surface;
pub mod volume;

// Re-export document types from core
pub use mda_core::document::{Document, EndedDoc, ExitStatus, StartedDoc};
pub use estimate::AcquisitionSummary;
pub use pipeline::{AutofocusMarks, EventPipeline, KeepShutterOpen, SliceIndexMonitor};
pub use plan::{AcquisitionPlan, HardwareContext};
pub use preflight::{DiskSpaceProbe, FixedDiskProbe, PreflightReport, SystemDiskProbe};
pub use run_engine::{EngineState, RunEngine, RunProgress, RunResult};
pub use runnables::{RunnableFn, RunnableRegistry, ANY};
pub use stages::{
    ChannelStage, EventIter, EventStage, PositionStage, SliceSource, SliceStage, TimelapseStage,
};
pub use surface::{Surface, XyExtent};
pub use volume::{BoundsMode, FocusDirection, SliceWalk, TileFootprint, VolumeBoundsPolicy};
