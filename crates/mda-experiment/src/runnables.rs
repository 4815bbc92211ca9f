//! Callbacks attached to acquisition coordinates.
//!
//! A runnable is keyed by `(frame, position, channel, slice)`; `-1` in any
//! slot matches every index of that axis. Matching runnables run inline on
//! the acquisition task, before the hardware is touched for the event.

use mda_core::axis::{AxisCoords, AxisKind};
use parking_lot::Mutex;
use std::sync::Arc;

/// Wildcard index.
pub const ANY: i64 = -1;

/// Callback invoked with the coordinates of the matching event.
pub type RunnableFn = Arc<dyn Fn(&AxisCoords) -> anyhow::Result<()> + Send + Sync>;

/// Coordinates a runnable is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnableKey {
    /// Frame index or [`ANY`].
    pub frame: i64,
    /// Position index or [`ANY`].
    pub position: i64,
    /// Channel index or [`ANY`].
    pub channel: i64,
    /// Slice index or [`ANY`].
    pub slice: i64,
}

impl RunnableKey {
    /// Whether `coords` matches. Missing axes count as index 0.
    #[must_use]
    pub fn matches(&self, coords: &AxisCoords) -> bool {
        [
            (self.frame, AxisKind::Time),
            (self.position, AxisKind::Position),
            (self.channel, AxisKind::Channel),
            (self.slice, AxisKind::Slice),
        ]
        .iter()
        .all(|(want, axis)| *want == ANY || *want == coords.get(*axis).unwrap_or(0))
    }
}

/// Runnables attached to an engine.
#[derive(Default)]
pub struct RunnableRegistry {
    entries: Mutex<Vec<(RunnableKey, RunnableFn)>>,
}

impl RunnableRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `runnable` at the given indices.
    pub fn attach(&self, frame: i64, position: i64, channel: i64, slice: i64, runnable: RunnableFn) {
        self.entries.lock().push((
            RunnableKey {
                frame,
                position,
                channel,
                slice,
            },
            runnable,
        ));
    }

    /// Remove every runnable.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Number of attached runnables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True when nothing is attached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Run every runnable matching `coords`, in attachment order.
    ///
    /// A failing runnable is logged and does not stop the acquisition.
    /// Returns how many ran.
    pub fn run_matching(&self, coords: &AxisCoords) -> usize {
        // Cloned out so a runnable may attach or clear without deadlocking.
        let matching: Vec<RunnableFn> = self
            .entries
            .lock()
            .iter()
            .filter(|(key, _)| key.matches(coords))
            .map(|(_, f)| Arc::clone(f))
            .collect();

        for runnable in &matching {
            if let Err(e) = runnable(coords) {
                tracing::warn!(coords = %coords, error = %e, "runnable failed");
            }
        }
        matching.len()
    }
}

impl std::fmt::Debug for RunnableRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnableRegistry")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, RunnableFn) {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let f: RunnableFn = Arc::new(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        (hits, f)
    }

    #[test]
    fn test_wildcards() {
        let coords = AxisCoords::new()
            .with(AxisKind::Time, 2)
            .with(AxisKind::Channel, 1);
        let key = |frame, position, channel, slice| RunnableKey {
            frame,
            position,
            channel,
            slice,
        };
        assert!(key(ANY, ANY, ANY, ANY).matches(&coords));
        assert!(key(2, 0, 1, 0).matches(&coords));
        assert!(key(2, ANY, 1, ANY).matches(&coords));
        assert!(!key(1, ANY, ANY, ANY).matches(&coords));
        assert!(!key(ANY, 1, ANY, ANY).matches(&coords));
    }

    #[test]
    fn test_run_matching_and_clear() {
        let registry = RunnableRegistry::new();
        let (every, f) = counter();
        registry.attach(ANY, ANY, ANY, ANY, f);
        let (second_frame, f) = counter();
        registry.attach(1, ANY, ANY, ANY, f);

        for frame in 0..3 {
            registry.run_matching(&AxisCoords::new().with(AxisKind::Time, frame));
        }
        assert_eq!(every.load(Ordering::SeqCst), 3);
        assert_eq!(second_frame.load(Ordering::SeqCst), 1);

        registry.clear();
        assert!(registry.is_empty());
        assert_eq!(registry.run_matching(&AxisCoords::new()), 0);
    }

    #[test]
    fn test_failing_runnable_does_not_stop_others() {
        let registry = RunnableRegistry::new();
        registry.attach(ANY, ANY, ANY, ANY, Arc::new(|_| Err(anyhow::anyhow!("boom"))));
        let (hits, f) = counter();
        registry.attach(ANY, ANY, ANY, ANY, f);
        assert_eq!(registry.run_matching(&AxisCoords::new()), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
