//! Session coordinator
//!
//! Owns the camera, the renderer, the session-long audio encoder and the
//! per-segment video encoder and muxer. It runs on its own thread; the UI
//! drives it through a [`SessionHandle`] whose calls are posted into the
//! coordinator inbox and answered over a oneshot channel.
//!
//! State machine: `Idle -> Recording -> Finalizing -> Idle`. A segment only
//! leaves `Finalizing` when its muxer publishes completion, at which point
//! it is promoted into the durable directory or discarded.

use super::settings::RecorderSettings;
use super::state::{
    CoordinatorState, RecordingEvent, Segment, SegmentStatus, SessionConfig, SessionSnapshot,
};
use crate::capture::{
    CameraController, CameraDriver, Facing, FlashMode, MicrophoneSource, ToneMicrophoneSource,
    VirtualCameraDriver,
};
use crate::encoder::{AudioEncoder, CodecFactory, FailureSink, SoftCodecFactory, VideoEncoder};
use crate::export::{final_output_path, SegmentStore, StitchReport, Stitcher};
use crate::muxer::{
    CompletionBus, ContainerFormat, Mp4Container, Muxer, MuxerEvent, SegmentOutcome,
    SubscriptionId, TrackKind,
};
use crate::render::{FilterMode, GlRenderer, RenderState, RenderSurface};
use crate::utils::error::{CaptureError, CaptureResult, ErrorResponse};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, oneshot};
use uuid::Uuid;

/// Events buffered per subscriber before the slowest one starts lagging
const EVENT_CAPACITY: usize = 100;

type Reply<T> = oneshot::Sender<CaptureResult<T>>;

/// Where segments and the stitched movie go
#[derive(Debug, Clone)]
pub struct SessionPaths {
    /// Parent of `session_temp/` and `session/`
    pub base_dir: PathBuf,
    pub movies_dir: PathBuf,
}

/// Collaborators the coordinator drives
#[derive(Clone)]
pub struct CoordinatorDeps {
    pub cameras: Arc<dyn CameraDriver>,
    pub microphones: Arc<dyn MicrophoneSource>,
    pub codecs: Arc<dyn CodecFactory>,
    pub container: Arc<dyn ContainerFormat>,
    /// On-screen preview surface
    pub display: Arc<dyn RenderSurface>,
}

impl CoordinatorDeps {
    /// Virtual camera, tone microphone, software codecs and MPEG-4 output
    pub fn headless(display: Arc<dyn RenderSurface>) -> Self {
        Self {
            cameras: Arc::new(VirtualCameraDriver::new()),
            microphones: Arc::new(ToneMicrophoneSource::new()),
            codecs: Arc::new(SoftCodecFactory),
            container: Arc::new(Mp4Container),
            display,
        }
    }
}

enum Command {
    StartRecord {
        reply: Reply<()>,
    },
    StopRecord {
        reply: Reply<()>,
    },
    FinalizeSession {
        reply: Reply<StitchReport>,
    },
    DiscardSession {
        reply: Reply<()>,
    },
    RequestFacing {
        facing: Facing,
        reply: Reply<bool>,
    },
    RequestOtherCamera {
        reply: Reply<bool>,
    },
    RequestFlash {
        mode: FlashMode,
        reply: Reply<bool>,
    },
    ToggleFlash {
        reply: Reply<FlashMode>,
    },
    SetFilter {
        mode: FilterMode,
        reply: Reply<()>,
    },
    Pause {
        reply: Reply<()>,
    },
    Resume {
        reply: Reply<()>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    RenderState {
        reply: Reply<RenderState>,
    },
    Shutdown {
        reply: Option<oneshot::Sender<()>>,
    },

    // Posted by the pipeline threads
    MuxerFinished {
        generation: u64,
        outcome: SegmentOutcome,
    },
    EncoderFailed {
        generation: u64,
        error: CaptureError,
    },
    StitchDone {
        result: CaptureResult<StitchReport>,
    },
}

/// The segment currently being written or finalized
struct ActiveSegment {
    /// Distinguishes this segment's messages from a failed earlier segment
    /// that used the same ordinal
    generation: u64,
    segment: Segment,
    muxer: Arc<Muxer>,
    video: Option<VideoEncoder>,
    /// Thread flushing the video encoder after a stop
    video_stop: Option<JoinHandle<()>>,
    /// Callers answered once the segment is promoted or dropped
    stop_waiters: Vec<Reply<()>>,
    subscription: SubscriptionId,
    started: Instant,
    failure: Option<ErrorResponse>,
}

impl ActiveSegment {
    fn join_video(&mut self) {
        if let Some(handle) = self.video_stop.take() {
            if handle.join().is_err() {
                tracing::error!("Video stop thread for segment {} panicked", self.segment.ordinal);
            }
        }
    }

    fn release_waiters(&mut self) {
        for reply in self.stop_waiters.drain(..) {
            let _ = reply.send(Ok(()));
        }
    }
}

/// Flush the video encoder off the coordinator thread. Its final drain
/// ends the video track, which usually closes the muxer.
fn spawn_video_stop(ordinal: u32, mut video: VideoEncoder) -> Option<JoinHandle<()>> {
    let spawned = std::thread::Builder::new()
        .name(format!("video-stop-{}", ordinal))
        .spawn(move || {
            if let Err(e) = video.stop() {
                tracing::warn!("Video encoder stopped with error: {}", e);
            }
        });
    match spawned {
        Ok(handle) => Some(handle),
        Err(e) => {
            // The encoder went down with the closure and stopped inline
            tracing::warn!("No thread for stopping segment {} video: {}", ordinal, e);
            None
        }
    }
}

/// Record state machine for one capture session
pub struct SessionCoordinator {
    settings: RecorderSettings,
    paths: SessionPaths,
    deps: CoordinatorDeps,
    store: SegmentStore,
    camera: CameraController,
    renderer: GlRenderer,
    audio: AudioEncoder,
    bus: CompletionBus,
    inbox: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<RecordingEvent>,
    state: CoordinatorState,
    session_id: Uuid,
    generation: u64,
    current: Option<ActiveSegment>,
    segments: Vec<Segment>,
    accumulated_us: u64,
    filter: FilterMode,
    paused: bool,
    stitching: bool,
    deferred_start: Option<Reply<()>>,
    finalize_waiter: Option<Reply<StitchReport>>,
}

impl SessionCoordinator {
    /// Prepare the segment directories, start the renderer and the camera
    /// preview, and launch the coordinator thread.
    ///
    /// A missing camera is not fatal here; `start_record` retries the open
    /// and reports `DeviceUnavailable`.
    pub fn spawn(
        settings: RecorderSettings,
        paths: SessionPaths,
        deps: CoordinatorDeps,
    ) -> CaptureResult<SessionHandle> {
        let store = SegmentStore::open(&paths.base_dir, deps.container.extension())?;
        let segments = restore_segments(&store, deps.container.as_ref())?;
        let accumulated_us = segments.iter().map(|s| s.duration_us).sum();

        let renderer = GlRenderer::spawn(deps.display.clone(), settings.video_config())?;
        renderer.change_filter_mode(settings.filter)?;

        let mut camera = CameraController::new(deps.cameras.clone());
        camera.bind_texture(renderer.texture());
        camera.request_facing(settings.facing)?;

        let audio = AudioEncoder::new(
            settings.audio_config(),
            deps.microphones.clone(),
            deps.codecs.clone(),
        );

        let (inbox, commands) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let mut coordinator = SessionCoordinator {
            filter: settings.filter,
            settings,
            paths,
            deps,
            store,
            camera,
            renderer,
            audio,
            bus: CompletionBus::new(),
            inbox: inbox.clone(),
            events: events.clone(),
            state: CoordinatorState::Idle,
            session_id: Uuid::new_v4(),
            generation: 0,
            current: None,
            segments,
            accumulated_us,
            paused: false,
            stitching: false,
            deferred_start: None,
            finalize_waiter: None,
        };
        if let Err(e) = coordinator.ensure_camera() {
            tracing::warn!("Camera not available yet: {}", e);
        }

        std::thread::Builder::new()
            .name("session-coordinator".to_string())
            .spawn(move || coordinator.run(commands))?;

        Ok(SessionHandle {
            commands: inbox.clone(),
            events,
            _guard: Arc::new(ShutdownGuard { commands: inbox }),
        })
    }

    fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        tracing::info!(
            "Session {} started with {} promoted segment(s)",
            self.session_id,
            self.segments.len()
        );
        while let Some(command) = commands.blocking_recv() {
            match command {
                Command::StartRecord { reply } => self.on_start_record(reply),
                Command::StopRecord { reply } => self.on_stop_record(reply),
                Command::FinalizeSession { reply } => self.on_finalize(reply),
                Command::DiscardSession { reply } => {
                    let _ = reply.send(self.discard_session());
                }
                Command::RequestFacing { facing, reply } => {
                    let _ = reply.send(self.request_facing(facing));
                }
                Command::RequestOtherCamera { reply } => {
                    let facing = self.camera.facing().opposite();
                    let _ = reply.send(self.request_facing(facing));
                }
                Command::RequestFlash { mode, reply } => {
                    let _ = reply.send(self.request_flash(mode));
                }
                Command::ToggleFlash { reply } => {
                    let _ = reply.send(self.toggle_flash());
                }
                Command::SetFilter { mode, reply } => {
                    let _ = reply.send(self.set_filter(mode));
                }
                Command::Pause { reply } => self.on_pause(reply),
                Command::Resume { reply } => {
                    let _ = reply.send(self.resume());
                }
                Command::Snapshot { reply } => {
                    let _ = reply.send(self.snapshot());
                }
                Command::RenderState { reply } => {
                    let _ = reply.send(self.renderer.state());
                }
                Command::MuxerFinished {
                    generation,
                    outcome,
                } => self.on_muxer_finished(generation, outcome),
                Command::EncoderFailed { generation, error } => {
                    self.on_encoder_failed(generation, error)
                }
                Command::StitchDone { result } => self.on_stitch_done(result),
                Command::Shutdown { reply } => {
                    self.shutdown();
                    if let Some(reply) = reply {
                        let _ = reply.send(());
                    }
                    break;
                }
            }
        }
        tracing::info!("Session {} coordinator stopped", self.session_id);
    }

    fn notify(&self, event: RecordingEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn notify_error(&self, error: &CaptureError) {
        self.notify(RecordingEvent::Error {
            error: error.into(),
        });
    }

    /// Open the camera for the latched facing and start its preview
    fn ensure_camera(&mut self) -> CaptureResult<()> {
        if self.camera.is_open() {
            return Ok(());
        }
        let opened = self.camera.open(
            self.settings.width,
            self.settings.height,
            self.camera.facing(),
        )?;
        if let Err(e) = self.camera.start_preview() {
            self.camera.close();
            return Err(e);
        }
        self.renderer
            .set_camera_preview_size(opened.width, opened.height)
    }

    fn on_start_record(&mut self, reply: Reply<()>) {
        if self.state != CoordinatorState::Finalizing {
            let _ = reply.send(self.start_record());
            return;
        }
        if self.deferred_start.is_some() {
            let _ = reply.send(Err(CaptureError::InvalidState(
                "a start is already waiting for the previous segment".to_string(),
            )));
            return;
        }
        tracing::debug!("Start requested while finalizing, deferring");
        self.deferred_start = Some(reply);
    }

    fn start_record(&mut self) -> CaptureResult<()> {
        if self.state != CoordinatorState::Idle {
            return Err(CaptureError::InvalidState(format!(
                "start_record while {:?}",
                self.state
            )));
        }
        if self.paused {
            return Err(CaptureError::InvalidState("session is paused".to_string()));
        }
        if self.stitching {
            return Err(CaptureError::InvalidState("stitch in progress".to_string()));
        }

        let result = self.begin_segment();
        if let Err(e) = &result {
            tracing::error!("Failed to start recording: {}", e);
            self.notify_error(e);
        }
        result
    }

    fn begin_segment(&mut self) -> CaptureResult<()> {
        self.ensure_camera()?;

        let ordinal = self.store.next_ordinal()?;
        let path = self.store.temp_path(ordinal);
        self.store.discard_temp(ordinal)?;
        let config = self.settings.session_config(path.clone(), ordinal, self.session_id);

        self.generation += 1;
        let generation = self.generation;
        let subscription = self.subscribe_completion(ordinal, generation);
        let muxer = Arc::new(Muxer::new(
            ordinal,
            path.clone(),
            &[TrackKind::Video, TrackKind::Audio],
            self.deps.container.clone(),
            self.bus.clone(),
        ));

        let video = match self.start_encoders(&config, muxer.clone(), generation) {
            Ok(video) => video,
            Err(e) => {
                self.bus.unsubscribe(subscription);
                muxer.abort(&e.to_string());
                if let Err(cleanup) = self.store.discard_temp(ordinal) {
                    tracing::warn!("Failed to remove segment {}: {}", ordinal, cleanup);
                }
                return Err(e);
            }
        };

        tracing::info!(
            "Recording segment {} of session {} into {:?}",
            ordinal,
            self.session_id,
            path
        );
        self.current = Some(ActiveSegment {
            generation,
            segment: Segment {
                ordinal,
                path,
                status: SegmentStatus::Writing,
                duration_us: 0,
                started_at: Utc::now(),
            },
            muxer,
            video: Some(video),
            video_stop: None,
            stop_waiters: Vec::new(),
            subscription,
            started: Instant::now(),
            failure: None,
        });
        self.state = CoordinatorState::Recording;
        self.notify(RecordingEvent::RecordingStarted { ordinal });
        Ok(())
    }

    /// Video encoder, audio reset, renderer on, audio start. Anything
    /// started before a failure is stopped again.
    fn start_encoders(
        &mut self,
        config: &SessionConfig,
        muxer: Arc<Muxer>,
        generation: u64,
    ) -> CaptureResult<VideoEncoder> {
        let on_failure = self.failure_sink(generation);
        self.renderer.reset_session_config(config.video.clone())?;
        let mut video = VideoEncoder::new(
            &config.video,
            self.deps.codecs.as_ref(),
            muxer.clone(),
            on_failure.clone(),
        )?;
        self.audio.reset(&config.audio, muxer, on_failure)?;
        self.renderer.change_recording_state(Some(video.input()))?;

        if let Err(e) = self.audio.start_recording() {
            if let Err(off) = self.renderer.change_recording_state(None) {
                tracing::warn!("Failed to turn recording off: {}", off);
            }
            if let Err(stop) = video.stop() {
                tracing::debug!("Video encoder stopped with error: {}", stop);
            }
            return Err(e);
        }
        Ok(video)
    }

    fn subscribe_completion(&self, ordinal: u32, generation: u64) -> SubscriptionId {
        let inbox = self.inbox.clone();
        self.bus.subscribe(move |event| match event {
            MuxerEvent::SegmentFinished {
                ordinal: finished,
                outcome,
                ..
            } if *finished == ordinal => {
                let _ = inbox.send(Command::MuxerFinished {
                    generation,
                    outcome: outcome.clone(),
                });
            }
            MuxerEvent::SegmentFinished { .. } => {}
        })
    }

    fn failure_sink(&self, generation: u64) -> FailureSink {
        let inbox = self.inbox.clone();
        Arc::new(move |error| {
            let _ = inbox.send(Command::EncoderFailed { generation, error });
        })
    }

    fn on_stop_record(&mut self, reply: Reply<()>) {
        if self.state != CoordinatorState::Recording {
            tracing::debug!("stop_record while {:?} ignored", self.state);
            let _ = reply.send(Ok(()));
            return;
        }
        self.stop_pipeline();
        self.reply_when_settled(reply);
    }

    /// Hold `reply` until the current segment is promoted or dropped
    fn reply_when_settled(&mut self, reply: Reply<()>) {
        match self.current.as_mut() {
            Some(current) => current.stop_waiters.push(reply),
            None => {
                let _ = reply.send(Ok(()));
            }
        }
    }

    /// Audio stop, renderer off, then hand the video encoder to a flush
    /// thread. The segment stays `Finalizing` until its muxer reports
    /// completion.
    fn stop_pipeline(&mut self) {
        let Some(current) = self.current.as_mut() else {
            return;
        };
        if let Err(e) = self.audio.stop_recording() {
            tracing::warn!("Audio encoder stopped with error: {}", e);
        }
        if let Err(e) = self.renderer.change_recording_state(None) {
            tracing::warn!("Failed to turn recording off: {}", e);
        }
        let ordinal = current.segment.ordinal;
        if let Some(video) = current.video.take() {
            current.video_stop = spawn_video_stop(ordinal, video);
        }

        tracing::info!(
            "Segment {} stopped after {} ms",
            ordinal,
            current.started.elapsed().as_millis()
        );
        self.state = CoordinatorState::Finalizing;
        self.notify(RecordingEvent::RecordingStopped { ordinal });
    }

    fn on_encoder_failed(&mut self, generation: u64, error: CaptureError) {
        let Some(current) = self
            .current
            .as_mut()
            .filter(|c| c.generation == generation)
        else {
            tracing::debug!("Ignoring failure from a finished segment: {}", error);
            return;
        };

        tracing::error!("Segment {} failed: {}", current.segment.ordinal, error);
        if current.failure.is_none() {
            current.failure = Some(ErrorResponse::from(&error));
        }
        current.muxer.abort(&error.to_string());
        if self.state == CoordinatorState::Recording {
            self.stop_pipeline();
        }
    }

    fn on_muxer_finished(&mut self, generation: u64, outcome: SegmentOutcome) {
        if !self
            .current
            .as_ref()
            .is_some_and(|c| c.generation == generation)
        {
            tracing::debug!("Ignoring completion of a discarded segment");
            return;
        }
        if self.state == CoordinatorState::Recording {
            self.stop_pipeline();
        }
        let Some(mut current) = self.current.take() else {
            return;
        };
        self.bus.unsubscribe(current.subscription);
        current.join_video();

        let ordinal = current.segment.ordinal;
        let failure = match (current.failure.take(), &outcome) {
            (Some(error), _) => Some(error),
            (None, SegmentOutcome::Failed { reason }) => {
                Some(ErrorResponse::from(CaptureError::MuxerIo(reason.clone())))
            }
            (None, SegmentOutcome::Complete { .. }) => None,
        };
        let failure = match failure {
            Some(error) => Some(error),
            None => match self.store.promote(ordinal) {
                Ok(path) => {
                    let mut segment = current.segment.clone();
                    segment.path = path.clone();
                    segment.status = SegmentStatus::Promoted;
                    segment.duration_us = outcome.duration_us();
                    self.accumulated_us += segment.duration_us;
                    self.segments.push(segment);
                    tracing::info!(
                        "Segment {} promoted: {} ms",
                        ordinal,
                        outcome.duration_us() / 1_000
                    );
                    self.notify(RecordingEvent::SegmentPromoted {
                        ordinal,
                        path,
                        duration_us: outcome.duration_us(),
                    });
                    None
                }
                Err(e) => Some(ErrorResponse::from(e)),
            },
        };

        if let Some(error) = failure {
            tracing::warn!("Segment {} not promoted: {}", ordinal, error.message);
            if let Err(e) = self.store.discard_temp(ordinal) {
                tracing::warn!("Failed to remove segment {}: {}", ordinal, e);
            }
            self.notify(RecordingEvent::SegmentFailed { ordinal, error });
        }

        self.state = CoordinatorState::Idle;
        current.release_waiters();
        self.after_idle();
    }

    /// Run whatever was waiting for the previous segment to finish
    fn after_idle(&mut self) {
        if self.finalize_waiter.is_some() {
            if let Some(reply) = self.deferred_start.take() {
                let _ = reply.send(Err(CaptureError::InvalidState(
                    "session is being finalized".to_string(),
                )));
            }
            self.begin_stitch();
        } else if let Some(reply) = self.deferred_start.take() {
            let _ = reply.send(self.start_record());
        }
    }

    fn on_finalize(&mut self, reply: Reply<StitchReport>) {
        if self.finalize_waiter.is_some() || self.stitching {
            let _ = reply.send(Err(CaptureError::InvalidState(
                "finalize already in progress".to_string(),
            )));
            return;
        }
        self.finalize_waiter = Some(reply);
        match self.state {
            // The stitch starts once the segment completes
            CoordinatorState::Recording => self.stop_pipeline(),
            CoordinatorState::Finalizing => {}
            CoordinatorState::Idle => self.begin_stitch(),
        }
    }

    fn begin_stitch(&mut self) {
        let segments = match self.store.list_durable() {
            Ok(segments) if segments.is_empty() => {
                self.fail_finalize(CaptureError::NoSegments);
                return;
            }
            Ok(segments) => segments,
            Err(e) => {
                self.fail_finalize(e);
                return;
            }
        };
        if let Err(e) = std::fs::create_dir_all(&self.paths.movies_dir) {
            self.fail_finalize(CaptureError::StitchIo(e.to_string()));
            return;
        }

        let output = final_output_path(&self.paths.movies_dir, self.deps.container.extension());
        let stitcher = Stitcher::new(self.deps.container.clone());
        let inbox = self.inbox.clone();
        let spawned = std::thread::Builder::new()
            .name("stitcher".to_string())
            .spawn(move || {
                let result = stitcher.stitch(&segments, &output);
                let _ = inbox.send(Command::StitchDone { result });
            });
        match spawned {
            Ok(_) => self.stitching = true,
            Err(e) => self.fail_finalize(e.into()),
        }
    }

    fn fail_finalize(&mut self, error: CaptureError) {
        tracing::error!("Finalize failed: {}", error);
        self.notify(RecordingEvent::StitchFailed {
            error: ErrorResponse::from(&error),
        });
        if let Some(reply) = self.finalize_waiter.take() {
            let _ = reply.send(Err(error));
        }
    }

    fn on_stitch_done(&mut self, result: CaptureResult<StitchReport>) {
        self.stitching = false;
        let report = match result {
            Ok(report) => report,
            Err(e) => {
                self.fail_finalize(e);
                return;
            }
        };

        if let Err(e) = self.store.purge() {
            tracing::warn!("Failed to clear stitched segments: {}", e);
        }
        tracing::info!(
            "Session {} finalized into {:?}",
            self.session_id,
            report.output
        );
        self.reset_session();
        self.notify(RecordingEvent::SessionFinalized {
            report: report.clone(),
        });
        if let Some(reply) = self.finalize_waiter.take() {
            let _ = reply.send(Ok(report));
        }
    }

    fn reset_session(&mut self) {
        self.segments.clear();
        self.accumulated_us = 0;
        self.session_id = Uuid::new_v4();
    }

    /// Abort the active segment without promoting it
    fn abandon_current(&mut self, reason: &str) {
        if let Some(current) = self.current.as_ref() {
            self.bus.unsubscribe(current.subscription);
            current.muxer.abort(reason);
        }
        if self.state == CoordinatorState::Recording {
            self.stop_pipeline();
        }
        if let Some(mut current) = self.current.take() {
            current.join_video();
            if let Err(e) = self.store.discard_temp(current.segment.ordinal) {
                tracing::warn!("Failed to remove segment {}: {}", current.segment.ordinal, e);
            }
            current.release_waiters();
        }
        self.state = CoordinatorState::Idle;

        if let Some(reply) = self.deferred_start.take() {
            let _ = reply.send(Err(CaptureError::InvalidState(reason.to_string())));
        }
        if let Some(reply) = self.finalize_waiter.take() {
            let _ = reply.send(Err(CaptureError::InvalidState(reason.to_string())));
        }
    }

    fn discard_session(&mut self) -> CaptureResult<()> {
        if self.stitching {
            return Err(CaptureError::InvalidState(
                "cannot discard while stitching".to_string(),
            ));
        }
        self.abandon_current("session discarded");
        self.store.purge()?;
        tracing::info!("Session {} discarded", self.session_id);
        self.reset_session();
        self.notify(RecordingEvent::SessionDiscarded);
        Ok(())
    }

    fn request_facing(&mut self, facing: Facing) -> CaptureResult<bool> {
        let before = self.camera.facing();
        let flash_before = self.camera.flash_mode();
        let switched = self.camera.request_facing(facing)?;
        if let Some(size) = self.camera.preview_size() {
            self.renderer
                .set_camera_preview_size(size.width, size.height)?;
        }
        let now = self.camera.facing();
        if now != before {
            self.notify(RecordingEvent::FacingChanged { facing: now });
        }
        let flash = self.camera.flash_mode();
        if flash != flash_before {
            self.notify(RecordingEvent::FlashChanged { mode: flash });
        }
        Ok(switched)
    }

    fn request_flash(&mut self, mode: FlashMode) -> CaptureResult<bool> {
        let before = self.camera.flash_mode();
        let applied = self.camera.request_flash(mode)?;
        if applied && mode != before {
            self.notify(RecordingEvent::FlashChanged { mode });
        }
        Ok(applied)
    }

    fn toggle_flash(&mut self) -> CaptureResult<FlashMode> {
        let before = self.camera.flash_mode();
        let mode = self.camera.toggle_flash()?;
        if mode != before {
            self.notify(RecordingEvent::FlashChanged { mode });
        }
        Ok(mode)
    }

    fn set_filter(&mut self, mode: FilterMode) -> CaptureResult<()> {
        self.renderer.change_filter_mode(mode)?;
        if mode != self.filter {
            self.filter = mode;
            self.notify(RecordingEvent::FilterChanged { mode });
        }
        Ok(())
    }

    /// Context loss: stop recording, release the camera and the contexts.
    /// Promoted segments are left alone; a segment cut short by the pause
    /// is settled before the reply.
    fn on_pause(&mut self, reply: Reply<()>) {
        if self.paused {
            let _ = reply.send(Ok(()));
            return;
        }
        let was_recording = self.state == CoordinatorState::Recording;
        if was_recording {
            self.stop_pipeline();
        }
        self.camera.close();
        if let Err(e) = self.renderer.notify_pausing() {
            let _ = reply.send(Err(e));
            return;
        }
        self.paused = true;
        tracing::info!("Session {} paused", self.session_id);
        if was_recording {
            self.reply_when_settled(reply);
        } else {
            let _ = reply.send(Ok(()));
        }
    }

    fn resume(&mut self) -> CaptureResult<()> {
        if !self.paused {
            return Ok(());
        }
        self.renderer.resume()?;
        self.paused = false;
        tracing::info!("Session {} resumed", self.session_id);
        self.ensure_camera()
    }

    fn snapshot(&self) -> SessionSnapshot {
        let running_us = match (&self.current, self.state) {
            (Some(current), CoordinatorState::Recording) => {
                current.started.elapsed().as_micros() as u64
            }
            _ => 0,
        };
        SessionSnapshot {
            session_id: self.session_id,
            state: self.state,
            current: self.current.as_ref().map(|c| c.segment.clone()),
            segments: self.segments.clone(),
            recording_time_ms: (self.accumulated_us + running_us) / 1_000,
            facing: self.camera.facing(),
            flash: self.camera.flash_mode(),
            filter: self.filter,
            paused: self.paused,
            stitching: self.stitching,
        }
    }

    fn shutdown(&mut self) {
        self.abandon_current("session closed");
        self.camera.close();
        self.renderer.shutdown();
    }
}

/// Promoted segments left by an earlier run
fn restore_segments(
    store: &SegmentStore,
    format: &dyn ContainerFormat,
) -> CaptureResult<Vec<Segment>> {
    Ok(store
        .list_durable()?
        .into_iter()
        .map(|(ordinal, path)| {
            let started_at = std::fs::metadata(&path)
                .and_then(|m| m.modified())
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            Segment {
                ordinal,
                duration_us: probe_duration(format, &path),
                path,
                status: SegmentStatus::Promoted,
                started_at,
            }
        })
        .collect())
}

/// Longest track of a closed segment, zero if it cannot be read
fn probe_duration(format: &dyn ContainerFormat, path: &Path) -> u64 {
    let mut reader = match format.open(path) {
        Ok(reader) => reader,
        Err(e) => {
            tracing::warn!("Cannot read segment {:?}: {}", path, e);
            return 0;
        }
    };
    let mut longest = 0;
    for index in 0..reader.tracks().len() {
        let count = reader.sample_count(index).unwrap_or(0);
        if count == 0 {
            continue;
        }
        if let Ok(Some(last)) = reader.read_sample(index, count - 1) {
            longest = longest.max(last.pts_us + last.duration_us);
        }
    }
    longest
}

/// Sends `Shutdown` when the last [`SessionHandle`] goes away
struct ShutdownGuard {
    commands: mpsc::UnboundedSender<Command>,
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown { reply: None });
    }
}

/// Cloneable async front door to a [`SessionCoordinator`]
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<RecordingEvent>,
    _guard: Arc<ShutdownGuard>,
}

fn closed() -> CaptureError {
    CaptureError::InvalidState("session coordinator has stopped".to_string())
}

impl SessionHandle {
    async fn call<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> CaptureResult<T> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(command(reply)).map_err(|_| closed())?;
        rx.await.map_err(|_| closed())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RecordingEvent> {
        self.events.subscribe()
    }

    /// Begin a new segment. While the previous segment is still finalizing
    /// the start waits for it.
    pub async fn start_record(&self) -> CaptureResult<()> {
        self.call(|reply| Command::StartRecord { reply }).await?
    }

    /// Stop the current segment and wait until it is promoted or dropped.
    /// A no-op unless recording.
    pub async fn stop_record(&self) -> CaptureResult<()> {
        self.call(|reply| Command::StopRecord { reply }).await?
    }

    /// Stop if needed, wait for the last segment, then stitch every
    /// promoted segment into one movie
    pub async fn finalize_session(&self) -> CaptureResult<StitchReport> {
        self.call(|reply| Command::FinalizeSession { reply }).await?
    }

    /// Drop the current segment and every promoted one
    pub async fn discard_session(&self) -> CaptureResult<()> {
        self.call(|reply| Command::DiscardSession { reply }).await?
    }

    pub async fn request_facing(&self, facing: Facing) -> CaptureResult<bool> {
        self.call(|reply| Command::RequestFacing { facing, reply })
            .await?
    }

    pub async fn request_other_camera(&self) -> CaptureResult<bool> {
        self.call(|reply| Command::RequestOtherCamera { reply }).await?
    }

    pub async fn request_flash(&self, mode: FlashMode) -> CaptureResult<bool> {
        self.call(|reply| Command::RequestFlash { mode, reply }).await?
    }

    pub async fn toggle_flash(&self) -> CaptureResult<FlashMode> {
        self.call(|reply| Command::ToggleFlash { reply }).await?
    }

    pub async fn set_filter(&self, mode: FilterMode) -> CaptureResult<()> {
        self.call(|reply| Command::SetFilter { mode, reply }).await?
    }

    pub async fn pause(&self) -> CaptureResult<()> {
        self.call(|reply| Command::Pause { reply }).await?
    }

    pub async fn resume(&self) -> CaptureResult<()> {
        self.call(|reply| Command::Resume { reply }).await?
    }

    pub async fn snapshot(&self) -> CaptureResult<SessionSnapshot> {
        self.call(|reply| Command::Snapshot { reply }).await
    }

    pub async fn render_state(&self) -> CaptureResult<RenderState> {
        self.call(|reply| Command::RenderState { reply }).await?
    }

    /// Abort any active segment and stop every thread
    pub async fn shutdown(&self) -> CaptureResult<()> {
        self.call(|reply| Command::Shutdown { reply: Some(reply) })
            .await
    }
}
