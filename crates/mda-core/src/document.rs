//! Acquisition lifecycle documents.
//!
//! The engine publishes one [`Document::Started`] after the datastore has been
//! created and before the first event is dispatched, and one
//! [`Document::Ended`] after the event stream is exhausted or the run was
//! stopped or failed. Each fires at most once per run.
//!
//! ```text
//! Started (1)
//!    │
//!    ├── images flow through the sink
//!    │
//! Ended (1)
//! ```

use crate::settings::SequenceSettings;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Generate a new unique run ID
pub fn new_uid() -> String {
    Uuid::new_v4().to_string()
}

/// Current timestamp in nanoseconds since Unix epoch
pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as u64)
}

/// Lifecycle documents published on the engine's event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Document {
    /// Run started.
    Started(StartedDoc),
    /// Run ended, for any reason.
    Ended(EndedDoc),
}

impl Document {
    /// Run this document belongs to.
    pub fn run_uid(&self) -> &str {
        match self {
            Document::Started(d) => &d.uid,
            Document::Ended(d) => &d.run_uid,
        }
    }

    /// Datastore the run writes to.
    pub fn store(&self) -> &str {
        match self {
            Document::Started(d) => &d.store,
            Document::Ended(d) => &d.store,
        }
    }

    /// Timestamp in nanoseconds.
    pub fn timestamp_ns(&self) -> u64 {
        match self {
            Document::Started(d) => d.time_ns,
            Document::Ended(d) => d.time_ns,
        }
    }
}

/// Published once the datastore exists, before any hardware action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartedDoc {
    /// Run identifier (this IS the run_uid).
    pub uid: String,
    /// Datastore identifier.
    pub store: String,
    /// Settings snapshot the run uses.
    pub settings: Arc<SequenceSettings>,
    /// Images the run is expected to produce.
    pub total_images: u64,
    /// Timestamp when the run started.
    pub time_ns: u64,
}

impl StartedDoc {
    /// New start document with a fresh run UID.
    pub fn new(store: &str, settings: Arc<SequenceSettings>, total_images: u64) -> Self {
        Self {
            uid: new_uid(),
            store: store.to_string(),
            settings,
            total_images,
            time_ns: now_ns(),
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    /// Every event was dispatched.
    Finished,
    /// Stopped by the user before the stream was exhausted.
    Stopped,
    /// Aborted by a hardware or storage error.
    Failed,
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ExitStatus::Finished => "finished",
            ExitStatus::Stopped => "stopped",
            ExitStatus::Failed => "failed",
        };
        write!(f, "{}", label)
    }
}

/// Published once per run after the last image was queued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndedDoc {
    /// Run this document closes.
    pub run_uid: String,
    /// Datastore identifier.
    pub store: String,
    /// Why the run ended.
    pub exit_status: ExitStatus,
    /// Error message when the run failed.
    pub reason: Option<String>,
    /// Images produced.
    pub num_images: u64,
    /// Timestamp when the run ended.
    pub time_ns: u64,
}

impl EndedDoc {
    /// Close a run that finished normally.
    pub fn finished(run_uid: &str, store: &str, num_images: u64) -> Self {
        Self {
            run_uid: run_uid.to_string(),
            store: store.to_string(),
            exit_status: ExitStatus::Finished,
            reason: None,
            num_images,
            time_ns: now_ns(),
        }
    }

    /// Close a run that was stopped by the user.
    pub fn stopped(run_uid: &str, store: &str, num_images: u64) -> Self {
        Self {
            exit_status: ExitStatus::Stopped,
            ..Self::finished(run_uid, store, num_images)
        }
    }

    /// Close a run that failed.
    pub fn failed(run_uid: &str, store: &str, num_images: u64, reason: &str) -> Self {
        Self {
            exit_status: ExitStatus::Failed,
            reason: Some(reason.to_string()),
            ..Self::finished(run_uid, store, num_images)
        }
    }
}
