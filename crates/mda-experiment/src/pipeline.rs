//! Event pipeline.
//!
//! The pipeline is an ordered list of stages. Stage `i` is the loop around
//! stage `i + 1`, so the list order is the acquisition order. Events are
//! produced lazily by chaining `flat_map`s; nothing is materialised.
//!
//! Policies that need to see neighbouring events (shutter, autofocus) run
//! as iterator adapters on the flattened stream.

use crate::stages::{EventIter, EventStage};
use mda_core::axis::AxisKind;
use mda_core::event::AcquisitionEvent;
use parking_lot::Mutex;
use std::iter::Peekable;
use std::sync::Arc;

/// Ordered stages of one acquisition.
#[derive(Clone)]
pub struct EventPipeline {
    stages: Arc<[Arc<dyn EventStage>]>,
}

impl EventPipeline {
    /// Pipeline over `stages`, outermost first.
    #[must_use]
    pub fn new(stages: Vec<Arc<dyn EventStage>>) -> Self {
        Self {
            stages: Arc::from(stages),
        }
    }

    /// Axes of the stages, outermost first.
    #[must_use]
    pub fn axis_order(&self) -> Vec<AxisKind> {
        self.stages.iter().map(|s| s.axis()).collect()
    }

    /// Number of stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// True when there are no stages; the stream is then the root alone.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Lazily expand `root` through every stage.
    #[must_use]
    pub fn events(&self, root: AcquisitionEvent) -> EventIter {
        let mut iter: EventIter = Box::new(std::iter::once(root));
        for stage in self.stages.iter() {
            let stage = Arc::clone(stage);
            iter = Box::new(iter.flat_map(move |event| stage.expand(event)));
        }
        iter
    }
}

impl std::fmt::Debug for EventPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.stages.iter().map(|s| s.name()).collect();
        f.debug_struct("EventPipeline").field("stages", &names).finish()
    }
}

/// Marks events after which the shutter may stay open.
///
/// An event keeps the shutter open when the next event differs from it only
/// in axes listed in `keep`. Time and position changes always close it.
pub struct KeepShutterOpen {
    inner: Peekable<EventIter>,
    keep: Vec<AxisKind>,
}

impl KeepShutterOpen {
    /// Wrap `inner`.
    #[must_use]
    pub fn new(inner: EventIter, keep: Vec<AxisKind>) -> Self {
        Self {
            inner: inner.peekable(),
            keep,
        }
    }
}

impl Iterator for KeepShutterOpen {
    type Item = AcquisitionEvent;

    fn next(&mut self) -> Option<Self::Item> {
        let mut event = self.inner.next()?;
        if let Some(next) = self.inner.peek() {
            let changed = event.coords.changed_axes(&next.coords);
            event.shutter_open = !changed.is_empty()
                && changed
                    .iter()
                    .all(|axis| self.keep.contains(axis) && !matches!(axis, AxisKind::Time | AxisKind::Position));
        }
        Some(event)
    }
}

/// Requests autofocus on the first event of each (time, position) whose
/// frame is a multiple of `skip + 1`.
pub struct AutofocusMarks {
    inner: EventIter,
    skip: u32,
    last: Option<(i64, i64)>,
}

impl AutofocusMarks {
    /// Wrap `inner`.
    #[must_use]
    pub fn new(inner: EventIter, skip: u32) -> Self {
        Self {
            inner,
            skip,
            last: None,
        }
    }
}

impl Iterator for AutofocusMarks {
    type Item = AcquisitionEvent;

    fn next(&mut self) -> Option<Self::Item> {
        let mut event = self.inner.next()?;
        let key = (event.frame(), event.axis(AxisKind::Position).unwrap_or(0));
        if self.last != Some(key) {
            self.last = Some(key);
            event.autofocus = key.0 % (i64::from(self.skip) + 1) == 0;
        }
        Some(event)
    }
}

/// Smallest and largest slice index seen in the generated stream.
#[derive(Debug, Default)]
pub struct SliceIndexMonitor {
    range: Mutex<Option<(i64, i64)>>,
}

impl SliceIndexMonitor {
    /// Empty monitor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the slice index of `event`, if it has one.
    pub fn observe(&self, event: &AcquisitionEvent) {
        if let Some(k) = event.axis(AxisKind::Slice) {
            let mut range = self.range.lock();
            *range = Some(match *range {
                Some((lo, hi)) => (lo.min(k), hi.max(k)),
                None => (k, k),
            });
        }
    }

    /// Smallest slice index seen, 0 before any slice.
    #[must_use]
    pub fn min(&self) -> i64 {
        self.range.lock().map_or(0, |(lo, _)| lo)
    }

    /// Largest slice index seen, 0 before any slice.
    #[must_use]
    pub fn max(&self) -> i64 {
        self.range.lock().map_or(0, |(_, hi)| hi)
    }

    /// Forget everything seen so far.
    pub fn reset(&self) {
        *self.range.lock() = None;
    }
}
