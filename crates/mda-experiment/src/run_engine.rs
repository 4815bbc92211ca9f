//! RunEngine - drives one multi-dimensional acquisition at a time.
//!
//! The engine takes an immutable settings snapshot, builds the lazy event
//! pipeline, checks the destination, and then pulls events one by one:
//! wait for the event's start time, run attached runnables, position the
//! hardware, snap, and hand the tagged image to the sink over a bounded
//! queue. The sink applies backpressure; a full queue suspends acquisition.
//!
//! # State Machine
//!
//! ```text
//! ┌──────┐   run()   ┌─────────┐   pause()   ┌────────┐
//! │ Idle │──────────▶│ Running │◀───────────▶│ Paused │
//! └──────┘           └────┬────┘   resume()  └───┬────┘
//!    ▲                    │ exhausted     stop() │
//!    │                    ▼                      ▼
//!    │              ┌──────────┐            ┌─────────┐
//!    │              │ Finished │            │ Stopped │
//!    │              └────┬─────┘            └────┬────┘
//!    │   sink drained    │                       │
//!    └───────────────────┴───────────────────────┘
//! ```
//!
//! Pausing keeps the event stream: the run resumes at exactly the next
//! event that has not been generated yet. Stopping is cooperative; it is
//! noticed before the next event and inside every wait.
//!
//! # Usage
//!
//! ```rust,ignore
//! let engine = Arc::new(RunEngine::new(core, EngineConfig::default()));
//! let mut docs = engine.subscribe();
//!
//! let store = Arc::new(MemoryDatastore::new());
//! let result = engine.run(&settings, store).await?;
//!
//! while let Ok(doc) = docs.try_recv() {
//!     println!("{} {}", doc.run_uid(), doc.store());
//! }
//! ```

use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

use crate::estimate::{self, AcquisitionSummary};
use crate::plan::{AcquisitionPlan, HardwareContext};
use crate::preflight::{run_preflight, DiskSpaceProbe, SystemDiskProbe};
use crate::runnables::{RunnableFn, RunnableRegistry};
use mda_core::axis::AxisCoords;
use mda_core::capabilities::{CapturedImage, MicroscopeCore};
use mda_core::config::EngineConfig;
use mda_core::document::{now_ns, Document, EndedDoc, ExitStatus, StartedDoc};
use mda_core::error::{MdaError, MdaResult};
use mda_core::event::{AcquisitionEvent, StageTarget};
use mda_core::image::{ImageMetadata, TaggedImage};
use mda_core::limits::WAIT_CHUNK;
use mda_core::settings::SequenceSettings;
use mda_storage::{Datastore, ImageSink, ProcessorChain};

/// Engine state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// No run active, ready to accept a new one
    Idle,
    /// Dispatching events
    Running,
    /// Holding between two events until resumed or stopped
    Paused,
    /// Run was stopped or failed; waiting for the sink to drain
    Stopped,
    /// Event stream exhausted; waiting for the sink to drain
    Finished,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Idle => write!(f, "idle"),
            EngineState::Running => write!(f, "running"),
            EngineState::Paused => write!(f, "paused"),
            EngineState::Stopped => write!(f, "stopped"),
            EngineState::Finished => write!(f, "finished"),
        }
    }
}

/// Progress of the active run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunProgress {
    /// Run identifier.
    pub run_uid: String,
    /// Images handed to the sink so far.
    pub images_acquired: u64,
    /// Images the run is expected to produce.
    pub total_images: u64,
    /// Coordinates of the last dispatched event.
    pub last_coords: Option<AxisCoords>,
}

/// Outcome of a run that was not aborted by an error.
#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    /// Run identifier.
    pub run_uid: String,
    /// How the run ended.
    pub exit_status: ExitStatus,
    /// Images handed to the sink.
    pub images_acquired: u64,
    /// Images the datastore accepted.
    pub images_stored: u64,
    /// Images the run was expected to produce.
    pub total_images: u64,
}

/// Last values sent to each device, so unchanged settings are not re-sent.
#[derive(Debug, Default)]
struct DeviceCache {
    preset: Option<(String, String)>,
    exposure_ms: Option<f64>,
    xy_um: Option<(f64, f64)>,
    z_um: Option<f64>,
    shutter_open: bool,
}

/// Why the event loop returned.
enum LoopExit {
    Finished,
    Stopped,
    Failed(MdaError),
}

/// How a timed wait ended.
enum WaitOutcome {
    Elapsed,
    Paused,
    Stopped,
}

/// Sequencing engine.
pub struct RunEngine {
    /// Microscope the engine drives
    core: Arc<dyn MicroscopeCore>,

    /// Engine configuration
    config: EngineConfig,

    /// Current engine state
    state: RwLock<EngineState>,

    /// Document broadcast channel
    doc_sender: broadcast::Sender<Document>,

    /// Flag to request pause at the next event boundary
    pause_requested: RwLock<bool>,

    /// Flag to request a stop
    stop_requested: RwLock<bool>,

    /// Callbacks keyed by acquisition coordinates
    runnables: RunnableRegistry,

    /// Free-space source used by the pre-flight gate
    disk_probe: Arc<dyn DiskSpaceProbe>,

    /// Progress of the active run
    progress: RwLock<Option<RunProgress>>,

    /// When the engine will wake from its current timing wait
    next_wake: RwLock<Option<Instant>>,
}

impl RunEngine {
    /// Create a new RunEngine driving `core`
    pub fn new(core: Arc<dyn MicroscopeCore>, config: EngineConfig) -> Self {
        let (doc_sender, _) = broadcast::channel(config.document_channel_capacity.max(1));

        Self {
            core,
            config,
            state: RwLock::new(EngineState::Idle),
            doc_sender,
            pause_requested: RwLock::new(false),
            stop_requested: RwLock::new(false),
            runnables: RunnableRegistry::new(),
            disk_probe: Arc::new(SystemDiskProbe),
            progress: RwLock::new(None),
            next_wake: RwLock::new(None),
        }
    }

    /// Replace the free-space source of the pre-flight gate.
    #[must_use]
    pub fn with_disk_probe(mut self, probe: Arc<dyn DiskSpaceProbe>) -> Self {
        self.disk_probe = probe;
        self
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Subscribe to lifecycle documents
    pub fn subscribe(&self) -> broadcast::Receiver<Document> {
        self.doc_sender.subscribe()
    }

    /// Get current engine state
    pub async fn state(&self) -> EngineState {
        *self.state.read().await
    }

    /// Progress of the active run, if any
    pub async fn current_progress(&self) -> Option<RunProgress> {
        self.progress.read().await.clone()
    }

    /// Identifier of the active run, if any
    pub async fn current_run_uid(&self) -> Option<String> {
        self.progress
            .read()
            .await
            .as_ref()
            .map(|p| p.run_uid.clone())
    }

    /// When the current timing wait ends, if the engine is waiting
    pub async fn next_wake_time(&self) -> Option<std::time::Instant> {
        self.next_wake.read().await.map(Instant::into_std)
    }

    /// Attach a runnable at `(frame, position, channel, slice)`; `-1` matches
    /// any index. Runnables run before the hardware is positioned.
    pub fn attach_runnable(
        &self,
        frame: i64,
        position: i64,
        channel: i64,
        slice: i64,
        runnable: RunnableFn,
    ) {
        self.runnables
            .attach(frame, position, channel, slice, runnable);
    }

    /// Remove every attached runnable
    pub fn clear_runnables(&self) {
        self.runnables.clear();
    }

    /// Estimate the run `settings` describe against the current hardware
    /// state without moving anything.
    pub async fn estimate(&self, settings: &SequenceSettings) -> MdaResult<AcquisitionSummary> {
        let settings = Arc::new(settings.clone());
        let context = HardwareContext::probe(self.core.as_ref(), &settings).await?;
        let plan = AcquisitionPlan::build(settings, context)?;
        estimate::summarize(&plan)
    }

    /// Request a pause before the next event
    #[instrument(skip(self), err)]
    pub async fn pause(&self) -> MdaResult<()> {
        let current_state = *self.state.read().await;
        if current_state != EngineState::Running {
            return Err(MdaError::InvalidState {
                operation: "pause",
                state: current_state.to_string(),
            });
        }

        *self.pause_requested.write().await = true;
        info!("Pause requested");
        Ok(())
    }

    /// Resume a paused run
    #[instrument(skip(self), err)]
    pub async fn resume(&self) -> MdaResult<()> {
        let current_state = *self.state.read().await;
        let pending = *self.pause_requested.read().await;
        // a pause that was requested but not reached yet can be withdrawn
        let allowed = current_state == EngineState::Paused
            || (current_state == EngineState::Running && pending);
        if !allowed {
            return Err(MdaError::InvalidState {
                operation: "resume",
                state: current_state.to_string(),
            });
        }

        *self.pause_requested.write().await = false;
        info!("Resume requested");
        Ok(())
    }

    /// Stop the active run before its next event
    #[instrument(skip(self), err)]
    pub async fn stop(&self) -> MdaResult<()> {
        let current_state = *self.state.read().await;
        if !matches!(current_state, EngineState::Running | EngineState::Paused) {
            return Err(MdaError::InvalidState {
                operation: "stop",
                state: current_state.to_string(),
            });
        }

        *self.stop_requested.write().await = true;
        info!("Stop requested");
        Ok(())
    }

    /// Stop whatever is running, regardless of state
    pub async fn shutdown(&self) {
        warn!("Shutdown requested - stopping acquisition");
        *self.stop_requested.write().await = true;
        *self.pause_requested.write().await = false;
    }

    /// Run `settings` to completion, storing images in `store`.
    ///
    /// Returns once the sink has drained and the engine is idle again.
    /// Hardware and storage failures are returned as errors after the
    /// `Ended` document has been published.
    pub async fn run(
        &self,
        settings: &SequenceSettings,
        store: Arc<dyn Datastore>,
    ) -> MdaResult<RunResult> {
        self.run_with_processors(settings, store, ProcessorChain::new())
            .await
    }

    /// [`run`](Self::run) with an image processor chain in front of the
    /// datastore.
    #[instrument(skip_all, fields(name = %settings.name, store = store.id()), err)]
    pub async fn run_with_processors(
        &self,
        settings: &SequenceSettings,
        store: Arc<dyn Datastore>,
        processors: ProcessorChain,
    ) -> MdaResult<RunResult> {
        {
            let mut state = self.state.write().await;
            if *state != EngineState::Idle {
                return Err(MdaError::AlreadyRunning(state.to_string()));
            }
            *self.pause_requested.write().await = false;
            *self.stop_requested.write().await = false;
            *state = EngineState::Running;
        }

        let result = self
            .execute(Arc::new(settings.clone()), store, processors)
            .await;

        *self.progress.write().await = None;
        *self.next_wake.write().await = None;
        *self.state.write().await = EngineState::Idle;
        result
    }

    async fn execute(
        &self,
        settings: Arc<SequenceSettings>,
        store: Arc<dyn Datastore>,
        processors: ProcessorChain,
    ) -> MdaResult<RunResult> {
        let context = HardwareContext::probe(self.core.as_ref(), &settings).await?;
        let plan = AcquisitionPlan::build(Arc::clone(&settings), context)?;
        let total_images = estimate::total_images(&plan)?;
        let total_bytes = estimate::total_bytes(&plan)?;
        run_preflight(
            &settings.save_root,
            total_bytes,
            self.config.disk_space_factor,
            self.disk_probe.as_ref(),
        )?;

        let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let sink = ImageSink::spawn(rx, Arc::clone(&store), processors);

        let started = StartedDoc::new(store.id(), Arc::clone(&settings), total_images);
        let run_uid = started.uid.clone();
        *self.progress.write().await = Some(RunProgress {
            run_uid: run_uid.clone(),
            images_acquired: 0,
            total_images,
            last_coords: None,
        });
        info!(run_uid = %run_uid, total_images, "Starting acquisition");
        self.emit_document(Document::Started(started)).await;

        let mut devices = DeviceCache::default();
        let (exit, images_acquired) = self
            .acquire(&plan, &run_uid, tx, &mut devices)
            .await;

        *self.state.write().await = match exit {
            LoopExit::Finished => EngineState::Finished,
            LoopExit::Stopped | LoopExit::Failed(_) => EngineState::Stopped,
        };

        if devices.shutter_open {
            if let Err(e) = self.core.set_shutter_open(false).await {
                warn!(error = %e, "failed to close shutter after acquisition");
            }
        }

        let report = match sink.join().await {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "image sink failed");
                return self
                    .finish(&run_uid, store.as_ref(), images_acquired, Err(e))
                    .await;
            }
        };

        // a closed queue means the sink hit a storage error; report that one
        let exit = match (exit, &report.error) {
            (LoopExit::Failed(MdaError::QueueClosed), Some(reason)) => {
                LoopExit::Failed(MdaError::Storage(reason.clone()))
            }
            (LoopExit::Finished, Some(reason)) => {
                LoopExit::Failed(MdaError::Storage(reason.clone()))
            }
            (exit, _) => exit,
        };

        let outcome = match exit {
            LoopExit::Finished => Ok(RunResult {
                run_uid: run_uid.clone(),
                exit_status: ExitStatus::Finished,
                images_acquired,
                images_stored: report.images_stored,
                total_images,
            }),
            LoopExit::Stopped => Ok(RunResult {
                run_uid: run_uid.clone(),
                exit_status: ExitStatus::Stopped,
                images_acquired,
                images_stored: report.images_stored,
                total_images,
            }),
            LoopExit::Failed(e) => Err(e),
        };
        self.finish(&run_uid, store.as_ref(), images_acquired, outcome)
            .await
    }

    /// Publish `Ended` for `outcome` and pass it through.
    async fn finish(
        &self,
        run_uid: &str,
        store: &dyn Datastore,
        images: u64,
        outcome: MdaResult<RunResult>,
    ) -> MdaResult<RunResult> {
        let ended = match &outcome {
            Ok(result) if result.exit_status == ExitStatus::Stopped => {
                EndedDoc::stopped(run_uid, store.id(), images)
            }
            Ok(_) => EndedDoc::finished(run_uid, store.id(), images),
            Err(e) => EndedDoc::failed(run_uid, store.id(), images, &e.to_string()),
        };
        info!(run_uid, status = %ended.exit_status, images, "Acquisition ended");
        self.emit_document(Document::Ended(ended)).await;
        outcome
    }

    /// Pull and dispatch events until the stream ends, a stop is requested
    /// or something fails. Consumes the queue sender so the sink sees the
    /// end of the stream when this returns.
    async fn acquire(
        &self,
        plan: &AcquisitionPlan,
        run_uid: &str,
        tx: mpsc::Sender<TaggedImage>,
        devices: &mut DeviceCache,
    ) -> (LoopExit, u64) {
        let run_start = Instant::now();
        let mut events = plan.events();
        let mut seq_num: u64 = 0;

        loop {
            if *self.stop_requested.read().await {
                info!("Stopping before next event");
                return (LoopExit::Stopped, seq_num);
            }
            if *self.pause_requested.read().await && !self.wait_while_paused().await {
                return (LoopExit::Stopped, seq_num);
            }

            let Some(event) = events.next() else {
                return (LoopExit::Finished, seq_num);
            };

            if let Some(offset_ms) = event.min_start_ms {
                let deadline = match frame_deadline(run_start, offset_ms) {
                    Ok(deadline) => deadline,
                    Err(e) => return (LoopExit::Failed(e), seq_num),
                };
                loop {
                    match self.wait_until(deadline).await {
                        WaitOutcome::Elapsed => break,
                        WaitOutcome::Stopped => {
                            info!("Wait interrupted by stop");
                            return (LoopExit::Stopped, seq_num);
                        }
                        // the pulled event is held and resumes the wait
                        WaitOutcome::Paused => {
                            if !self.wait_while_paused().await {
                                return (LoopExit::Stopped, seq_num);
                            }
                        }
                    }
                }
            }

            if *self.stop_requested.read().await {
                return (LoopExit::Stopped, seq_num);
            }
            if *self.pause_requested.read().await && !self.wait_while_paused().await {
                return (LoopExit::Stopped, seq_num);
            }

            self.runnables.run_matching(&event.coords);

            let captured = match self.dispatch(plan, &event, devices).await {
                Ok(captured) => captured,
                Err(e) => {
                    error!(coords = %event.coords, error = %e, "Event dispatch failed");
                    return (LoopExit::Failed(e), seq_num);
                }
            };

            let image = tagged_image(plan, run_uid, seq_num, &event, captured, run_start);
            if tx.send(image).await.is_err() {
                error!(seq_num, "Image queue closed");
                return (LoopExit::Failed(MdaError::QueueClosed), seq_num);
            }
            seq_num += 1;

            if let Some(progress) = self.progress.write().await.as_mut() {
                progress.images_acquired = seq_num;
                progress.last_coords = Some(event.coords.clone());
            }
        }
    }

    /// Position the hardware for `event` and snap one image.
    async fn dispatch(
        &self,
        plan: &AcquisitionPlan,
        event: &AcquisitionEvent,
        devices: &mut DeviceCache,
    ) -> MdaResult<CapturedImage> {
        let settings = plan.settings();
        debug!(coords = %event.coords, "Dispatching event");

        if let Some(channel) = &event.channel {
            let preset = (channel.group.clone(), channel.config.clone());
            if devices.preset.as_ref() != Some(&preset) {
                self.core
                    .set_config(&preset.0, &preset.1)
                    .await
                    .map_err(|e| MdaError::hardware("apply channel preset", &e))?;
                devices.preset = Some(preset);
            }
            if devices.exposure_ms != Some(channel.exposure_ms) {
                self.core
                    .set_exposure(channel.exposure_ms)
                    .await
                    .map_err(|e| MdaError::hardware("set exposure", &e))?;
                devices.exposure_ms = Some(channel.exposure_ms);
            }
        }

        if let Some(position) = &event.xy {
            let target = (position.x_um, position.y_um);
            if devices.xy_um != Some(target) {
                let device = settings.xy_device.as_deref().ok_or_else(|| {
                    MdaError::Configuration("stage positions need an XY stage".into())
                })?;
                self.core
                    .move_stage(device, StageTarget::Xy {
                        x: target.0,
                        y: target.1,
                    })
                    .await
                    .map_err(|e| MdaError::hardware("move XY stage", &e))?;
                self.core
                    .wait_for_device(device)
                    .await
                    .map_err(|e| MdaError::hardware("wait for XY stage", &e))?;
                devices.xy_um = Some(target);
            }
        }

        if event.autofocus {
            self.core
                .full_focus()
                .await
                .map_err(|e| MdaError::hardware("autofocus", &e))?;
            // focus drive position is unknown after the routine
            devices.z_um = None;
        }

        if let (Some(z), Some(device)) = (event.resolved_z(), settings.focus_device.as_deref()) {
            if devices.z_um != Some(z) {
                self.core
                    .move_stage(device, StageTarget::Z(z))
                    .await
                    .map_err(|e| MdaError::hardware("move focus", &e))?;
                self.core
                    .wait_for_device(device)
                    .await
                    .map_err(|e| MdaError::hardware("wait for focus", &e))?;
                devices.z_um = Some(z);
            }
        }

        if !devices.shutter_open {
            self.core
                .set_shutter_open(true)
                .await
                .map_err(|e| MdaError::hardware("open shutter", &e))?;
            devices.shutter_open = true;
        }

        let captured = self
            .core
            .snap_image()
            .await
            .map_err(|e| MdaError::hardware("snap image", &e))?;

        if !event.shutter_open {
            self.core
                .set_shutter_open(false)
                .await
                .map_err(|e| MdaError::hardware("close shutter", &e))?;
            devices.shutter_open = false;
        }

        Ok(captured)
    }

    /// Hold until resumed. Returns `false` if stopped while paused.
    async fn wait_while_paused(&self) -> bool {
        *self.state.write().await = EngineState::Paused;
        info!("Engine paused");

        let poll = self.config.pause_poll_interval();
        loop {
            if *self.stop_requested.read().await {
                return false;
            }
            if !*self.pause_requested.read().await {
                break;
            }
            sleep(poll).await;
        }

        *self.state.write().await = EngineState::Running;
        info!("Engine resumed");
        true
    }

    /// Sleep until `deadline` in chunks so a stop or pause is noticed
    /// promptly.
    async fn wait_until(&self, deadline: Instant) -> WaitOutcome {
        if Instant::now() >= deadline {
            return WaitOutcome::Elapsed;
        }
        *self.next_wake.write().await = Some(deadline);

        let outcome = loop {
            if *self.stop_requested.read().await {
                break WaitOutcome::Stopped;
            }
            if *self.pause_requested.read().await {
                break WaitOutcome::Paused;
            }
            let now = Instant::now();
            if now >= deadline {
                break WaitOutcome::Elapsed;
            }
            sleep((deadline - now).min(WAIT_CHUNK)).await;
        };

        *self.next_wake.write().await = None;
        outcome
    }

    /// Emit a document to all subscribers
    async fn emit_document(&self, doc: Document) {
        debug!(run_uid = %doc.run_uid(), "Emitting document");

        // Ignore send errors (no subscribers)
        let _ = self.doc_sender.send(doc);
    }
}

/// Earliest start of a frame `offset_ms` after `run_start`.
fn frame_deadline(run_start: Instant, offset_ms: f64) -> MdaResult<Instant> {
    Duration::try_from_secs_f64(offset_ms.max(0.0) / 1000.0)
        .ok()
        .and_then(|offset| run_start.checked_add(offset))
        .ok_or_else(|| {
            MdaError::Configuration(format!("frame start offset of {} ms is out of range", offset_ms))
        })
}

/// Wrap a captured image with the coordinates and metadata of its event.
fn tagged_image(
    plan: &AcquisitionPlan,
    run_uid: &str,
    seq_num: u64,
    event: &AcquisitionEvent,
    captured: CapturedImage,
    run_start: Instant,
) -> TaggedImage {
    let position = event.xy.as_ref();
    let overlap_px = position
        .and_then(|p| p.grid_row)
        .and_then(|_| plan.overlap_px());

    TaggedImage {
        pixels: captured.pixels,
        width: captured.width,
        height: captured.height,
        coords: event.coords.clone(),
        metadata: ImageMetadata {
            run_uid: run_uid.to_string(),
            seq_num,
            channel: event.channel.as_ref().map(|c| c.config.clone()),
            z_um: event.resolved_z(),
            xy_um: position.map(|p| (p.x_um, p.y_um)),
            position_label: position.map(|p| p.label.clone()),
            grid_row: position.and_then(|p| p.grid_row),
            grid_col: position.and_then(|p| p.grid_col),
            overlap_px,
            exposure_ms: event
                .exposure_ms()
                .or(Some(plan.context().exposure_ms)),
            elapsed_ms: run_start.elapsed().as_secs_f64() * 1000.0,
            timestamp_ns: now_ns(),
            shutter_open: event.shutter_open,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preflight::FixedDiskProbe;
    use mda_core::axis::AxisKind;
    use mda_core::settings::ChannelSpec;
    use mda_driver_mock::{MockCall, MockMicroscope};
    use mda_storage::MemoryDatastore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn engine(mock: MockMicroscope) -> RunEngine {
        RunEngine::new(Arc::new(mock), EngineConfig::default())
            .with_disk_probe(Arc::new(FixedDiskProbe(u64::MAX)))
    }

    fn settings(dir: &tempfile::TempDir) -> SequenceSettings {
        SequenceSettings {
            save_root: dir.path().to_path_buf(),
            use_channels: true,
            channels: vec![ChannelSpec::new("DAPI", 5.0), ChannelSpec::new("FITC", 7.0)],
            use_slices: true,
            slice_z_bottom_um: 0.0,
            slice_z_top_um: 2.0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_engine_state_transitions() {
        let engine = engine(MockMicroscope::new());
        assert_eq!(engine.state().await, EngineState::Idle);

        // Can't pause, resume or stop when idle
        assert!(matches!(
            engine.pause().await,
            Err(MdaError::InvalidState { .. })
        ));
        assert!(engine.resume().await.is_err());
        assert!(engine.stop().await.is_err());
    }

    #[tokio::test]
    async fn test_run_emits_started_and_ended_once() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(MockMicroscope::new());
        let mut docs = engine.subscribe();
        let store = Arc::new(MemoryDatastore::new());

        let result = engine.run(&settings(&dir), store.clone()).await.unwrap();
        assert_eq!(result.exit_status, ExitStatus::Finished);
        assert_eq!(result.total_images, 6);
        assert_eq!(result.images_acquired, 6);
        assert_eq!(result.images_stored, 6);
        assert_eq!(store.len(), 6);
        assert!(store.is_frozen());
        assert_eq!(engine.state().await, EngineState::Idle);

        let Ok(Document::Started(started)) = docs.try_recv() else {
            panic!("expected Started first");
        };
        assert_eq!(started.total_images, 6);
        let Ok(Document::Ended(ended)) = docs.try_recv() else {
            panic!("expected Ended second");
        };
        assert_eq!(ended.run_uid, started.uid);
        assert_eq!(ended.exit_status, ExitStatus::Finished);
        assert!(docs.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unchanged_settings_are_not_resent() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockMicroscope::new());
        let engine = RunEngine::new(mock.clone(), EngineConfig::default())
            .with_disk_probe(Arc::new(FixedDiskProbe(u64::MAX)));
        // slices outer, channels inner: preset changes on every image
        let settings = SequenceSettings {
            slices_first: false,
            ..settings(&dir)
        };
        engine
            .run(&settings, Arc::new(MemoryDatastore::new()))
            .await
            .unwrap();

        let calls = mock.calls();
        let presets = calls
            .iter()
            .filter(|c| matches!(c, MockCall::SetConfig { .. }))
            .count();
        let z_moves = calls
            .iter()
            .filter(|c| matches!(c, MockCall::Move { target: StageTarget::Z(_), .. }))
            .count();
        assert_eq!(presets, 6);
        assert_eq!(z_moves, 3);
        assert_eq!(mock.images_snapped(), 6);
        assert!(!mock.shutter_is_open().await);
    }

    #[tokio::test]
    async fn test_runnables_run_before_matching_events() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(MockMicroscope::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        engine.attach_runnable(
            -1,
            -1,
            1,
            -1,
            Arc::new(move |coords| {
                assert_eq!(coords.get(AxisKind::Channel), Some(1));
                h.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        engine
            .run(&settings(&dir), Arc::new(MemoryDatastore::new()))
            .await
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 3);

        engine.clear_runnables();
        engine
            .run(&settings(&dir), Arc::new(MemoryDatastore::new()))
            .await
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_disk_gate_blocks_before_started() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockMicroscope::new());
        let engine = RunEngine::new(mock.clone(), EngineConfig::default())
            .with_disk_probe(Arc::new(FixedDiskProbe(0)));
        let mut docs = engine.subscribe();

        let err = engine
            .run(&settings(&dir), Arc::new(MemoryDatastore::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, MdaError::InsufficientDiskSpace { .. }));
        assert!(docs.try_recv().is_err());
        assert_eq!(mock.images_snapped(), 0);
        assert_eq!(engine.state().await, EngineState::Idle);
    }

    #[tokio::test]
    async fn test_stop_during_interval_wait() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(engine(MockMicroscope::new()));
        let settings = SequenceSettings {
            use_frames: true,
            num_frames: 3,
            interval_ms: 60_000.0,
            ..settings(&dir)
        };

        let task = {
            let engine = engine.clone();
            let store = Arc::new(MemoryDatastore::new());
            tokio::spawn(async move { engine.run(&settings, store).await })
        };

        while engine.next_wake_time().await.is_none() {
            sleep(Duration::from_millis(5)).await;
        }
        engine.stop().await.unwrap();

        let result = task.await.unwrap().unwrap();
        assert_eq!(result.exit_status, ExitStatus::Stopped);
        assert_eq!(result.images_acquired, 6);
        assert_eq!(engine.state().await, EngineState::Idle);
    }

    #[tokio::test]
    async fn test_pause_during_interval_wait_holds_next_event() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockMicroscope::new());
        let engine = Arc::new(
            RunEngine::new(mock.clone(), EngineConfig::default())
                .with_disk_probe(Arc::new(FixedDiskProbe(u64::MAX))),
        );
        let settings = SequenceSettings {
            use_frames: true,
            num_frames: 3,
            interval_ms: 300.0,
            ..settings(&dir)
        };

        let task = {
            let engine = engine.clone();
            let store = Arc::new(MemoryDatastore::new());
            tokio::spawn(async move { engine.run(&settings, store).await })
        };

        while engine.next_wake_time().await.is_none() {
            sleep(Duration::from_millis(5)).await;
        }
        engine.pause().await.unwrap();

        // well past the frame 1 deadline
        sleep(Duration::from_millis(600)).await;
        assert_eq!(engine.state().await, EngineState::Paused);
        assert_eq!(mock.images_snapped(), 6);
        assert!(engine.next_wake_time().await.is_none());

        engine.resume().await.unwrap();
        let result = task.await.unwrap().unwrap();
        assert_eq!(result.exit_status, ExitStatus::Finished);
        assert_eq!(result.images_acquired, 18);
        assert_eq!(mock.images_snapped(), 18);
    }

    #[test]
    fn test_frame_deadline_out_of_range() {
        let start = Instant::now();
        assert_eq!(
            frame_deadline(start, 250.0).unwrap(),
            start + Duration::from_millis(250)
        );
        assert!(frame_deadline(start, -5.0).is_ok());
        assert!(matches!(
            frame_deadline(start, 1e30),
            Err(MdaError::Configuration(_))
        ));
        assert!(frame_deadline(start, f64::INFINITY).is_err());
    }
}
