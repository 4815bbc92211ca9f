//! Image sink and datastores.
//!
//! The engine pushes [`TaggedImage`](mda_core::TaggedImage)s into a bounded
//! queue. An [`ImageSink`] task drains that queue in FIFO order, runs each
//! image through an optional [`ProcessorChain`] and hands it to a
//! [`Datastore`].

pub mod datastore;
pub mod processor;
pub mod sink;

pub use datastore::{Datastore, MemoryDatastore, MetadataLogStore};
pub use processor::{BackgroundSubtract, ImageProcessor, ProcessorChain};
pub use sink::{ImageSink, SinkReport};
