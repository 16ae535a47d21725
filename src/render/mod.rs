//! Render thread
//!
//! [`GlRenderer`] owns the primary context and the camera's external texture.
//! Every camera frame is drawn to the display surface with the current
//! filter and, while recording, drawn again into the video encoder's input
//! surface through a sibling context.

pub mod filter;
pub mod gpu;

pub use filter::FilterMode;
pub use gpu::{
    CameraFrame, ExternalTexture, FrameBuffer, GlContext, PreviewSink, RenderSurface, TexImage,
};

use crate::encoder::{EncoderInput, VideoConfig};
use crate::utils::clock;
use crate::utils::error::{CaptureError, CaptureResult};
use serde::Serialize;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot};

/// What the render thread is currently doing
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderState {
    pub camera_texture_id: u32,

    /// Transform latched with the last camera frame
    pub camera_st_matrix: [f32; 16],

    pub preview_size: Option<(u32, u32)>,

    pub filter_mode: FilterMode,

    /// Size of the encoder input surface while one is attached
    pub encoder_surface: Option<(u32, u32)>,

    pub recording_requested: bool,

    /// At least one frame went to the encoder since recording was turned on
    pub recording_active: bool,

    /// `None` while paused or after context loss
    pub context_id: Option<u32>,

    pub frames_drawn: u64,

    pub frames_recorded: u64,
}

enum RenderTask {
    FrameAvailable,
    SetCameraPreviewSize {
        width: u32,
        height: u32,
    },
    ChangeFilterMode(FilterMode),
    ChangeRecordingState {
        target: Option<EncoderInput>,
        ack: oneshot::Sender<CaptureResult<()>>,
    },
    NotifyPausing {
        ack: oneshot::Sender<()>,
    },
    Resume {
        ack: oneshot::Sender<CaptureResult<()>>,
    },
    ResetSessionConfig {
        config: VideoConfig,
        ack: oneshot::Sender<CaptureResult<()>>,
    },
    Snapshot {
        reply: oneshot::Sender<RenderState>,
    },
    Shutdown,
}

/// Handle to the render thread. Calls that wait for an answer block, so
/// they belong on a plain thread (the coordinator), not an async task.
pub struct GlRenderer {
    tasks: mpsc::UnboundedSender<RenderTask>,
    texture: Arc<ExternalTexture>,
    thread: Option<JoinHandle<()>>,
}

fn wait<T>(rx: oneshot::Receiver<T>) -> CaptureResult<T> {
    rx.blocking_recv()
        .map_err(|_| CaptureError::InvalidState("render thread has exited".to_string()))
}

impl GlRenderer {
    /// Create the primary context and start the render thread
    pub fn spawn(display: Arc<dyn RenderSurface>, config: VideoConfig) -> CaptureResult<Self> {
        let (tasks, inbox) = mpsc::unbounded_channel();
        let texture = ExternalTexture::new();

        let frame_tasks = tasks.clone();
        texture.set_frame_available_listener(move || {
            let _ = frame_tasks.send(RenderTask::FrameAvailable);
        });

        let state = RenderThread {
            context: Some(GlContext::new_primary()),
            encoder_context: None,
            encoder: None,
            display,
            texture: texture.clone(),
            config,
            filter: FilterMode::default(),
            preview_size: None,
            st_matrix: gpu::IDENTITY_MATRIX,
            record_after_ns: None,
            recording_active: false,
            screen: FrameBuffer::new(0, 0),
            encoder_buffer: FrameBuffer::new(0, 0),
            frames_drawn: 0,
            frames_recorded: 0,
        };

        let thread = std::thread::Builder::new()
            .name("gl-renderer".to_string())
            .spawn(move || state.run(inbox))?;

        Ok(Self {
            tasks,
            texture,
            thread: Some(thread),
        })
    }

    /// Texture the camera should stream into
    pub fn texture(&self) -> Arc<ExternalTexture> {
        self.texture.clone()
    }

    fn post(&self, task: RenderTask) -> CaptureResult<()> {
        self.tasks
            .send(task)
            .map_err(|_| CaptureError::InvalidState("render thread has exited".to_string()))
    }

    pub fn set_camera_preview_size(&self, width: u32, height: u32) -> CaptureResult<()> {
        self.post(RenderTask::SetCameraPreviewSize { width, height })
    }

    /// Takes effect from the next frame
    pub fn change_filter_mode(&self, mode: FilterMode) -> CaptureResult<()> {
        self.post(RenderTask::ChangeFilterMode(mode))
    }

    /// Attach (`Some`) or detach (`None`) the encoder input. Returns once the
    /// render thread has applied the change; after detaching no further frame
    /// reaches the old surface.
    pub fn change_recording_state(&self, target: Option<EncoderInput>) -> CaptureResult<()> {
        let (ack, rx) = oneshot::channel();
        self.post(RenderTask::ChangeRecordingState { target, ack })?;
        wait(rx)?
    }

    /// Drop the encoder target and the contexts
    pub fn notify_pausing(&self) -> CaptureResult<()> {
        let (ack, rx) = oneshot::channel();
        self.post(RenderTask::NotifyPausing { ack })?;
        wait(rx)
    }

    /// Recreate the primary context after a pause or context loss
    pub fn resume(&self) -> CaptureResult<()> {
        let (ack, rx) = oneshot::channel();
        self.post(RenderTask::Resume { ack })?;
        wait(rx)?
    }

    /// Only allowed while not recording
    pub fn reset_session_config(&self, config: VideoConfig) -> CaptureResult<()> {
        let (ack, rx) = oneshot::channel();
        self.post(RenderTask::ResetSessionConfig { config, ack })?;
        wait(rx)?
    }

    pub fn state(&self) -> CaptureResult<RenderState> {
        let (reply, rx) = oneshot::channel();
        self.post(RenderTask::Snapshot { reply })?;
        wait(rx)
    }

    pub fn shutdown(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.texture.clear_frame_available_listener();
        let _ = self.tasks.send(RenderTask::Shutdown);
        if thread.join().is_err() {
            tracing::error!("Render thread panicked");
        }
    }
}

impl Drop for GlRenderer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct RenderThread {
    context: Option<Arc<GlContext>>,
    encoder_context: Option<Arc<GlContext>>,
    encoder: Option<EncoderInput>,
    display: Arc<dyn RenderSurface>,
    texture: Arc<ExternalTexture>,
    config: VideoConfig,
    filter: FilterMode,
    preview_size: Option<(u32, u32)>,
    st_matrix: [f32; 16],

    /// Set while recording: camera frames stamped at or after this go to
    /// the encoder
    record_after_ns: Option<u64>,

    recording_active: bool,
    screen: FrameBuffer,
    encoder_buffer: FrameBuffer,
    frames_drawn: u64,
    frames_recorded: u64,
}

impl RenderThread {
    fn run(mut self, mut inbox: mpsc::UnboundedReceiver<RenderTask>) {
        tracing::debug!(
            "Render thread started for {}x{} output",
            self.config.width,
            self.config.height
        );
        while let Some(task) = inbox.blocking_recv() {
            match task {
                RenderTask::FrameAvailable => self.render_frame(),
                RenderTask::SetCameraPreviewSize { width, height } => {
                    tracing::debug!("Camera preview size {}x{}", width, height);
                    self.preview_size = Some((width, height));
                }
                RenderTask::ChangeFilterMode(mode) => {
                    tracing::info!("Filter changed to {}", mode.name());
                    self.filter = mode;
                }
                RenderTask::ChangeRecordingState { target, ack } => {
                    let result = match target {
                        Some(target) => self.start_recording(target),
                        None => {
                            self.stop_recording();
                            Ok(())
                        }
                    };
                    let _ = ack.send(result);
                }
                RenderTask::NotifyPausing { ack } => {
                    self.release_gpu();
                    let _ = ack.send(());
                }
                RenderTask::Resume { ack } => {
                    if self.context.is_none() {
                        let context = GlContext::new_primary();
                        tracing::info!("Render context {} created", context.id());
                        self.context = Some(context);
                    }
                    let _ = ack.send(Ok(()));
                }
                RenderTask::ResetSessionConfig { config, ack } => {
                    let result = if self.record_after_ns.is_some() {
                        Err(CaptureError::InvalidState(
                            "cannot change session config while recording".to_string(),
                        ))
                    } else {
                        self.config = config;
                        Ok(())
                    };
                    let _ = ack.send(result);
                }
                RenderTask::Snapshot { reply } => {
                    let _ = reply.send(self.snapshot());
                }
                RenderTask::Shutdown => break,
            }
        }
        self.release_gpu();
        tracing::debug!("Render thread stopped after {} frames", self.frames_drawn);
    }

    fn start_recording(&mut self, target: EncoderInput) -> CaptureResult<()> {
        let context = self
            .context
            .as_ref()
            .ok_or_else(|| CaptureError::InvalidState("renderer is paused".to_string()))?;
        let sibling = context.create_sibling()?;
        tracing::info!(
            "Recording on: encoder context {} shares with {}, surface {:?}",
            sibling.id(),
            context.id(),
            target.surface().size()
        );
        self.encoder_context = Some(sibling);
        self.encoder = Some(target);
        self.record_after_ns = Some(clock::monotonic_ns());
        self.recording_active = false;
        Ok(())
    }

    fn stop_recording(&mut self) {
        if self.record_after_ns.take().is_some() {
            tracing::info!("Recording off");
        }
        self.encoder = None;
        self.encoder_context = None;
        self.recording_active = false;
    }

    fn release_gpu(&mut self) {
        self.stop_recording();
        if let Some(context) = self.context.take() {
            context.mark_lost();
            tracing::debug!("Render context {} released", context.id());
        }
    }

    fn render_frame(&mut self) {
        // Latch even when paused so the producer's frame is consumed
        let Some(image) = self.texture.update_tex_image() else {
            return;
        };
        let Some(context) = self.context.clone() else {
            return;
        };
        self.st_matrix = image.transform;

        {
            let _current = match context.make_current() {
                Ok(current) => current,
                Err(e) => {
                    tracing::error!("Render context unusable, waiting for resume: {}", e);
                    self.release_gpu();
                    return;
                }
            };
            let (w, h) = self.display.size();
            self.screen.resize(w, h);
            filter::draw_frame(&image.frame, &self.st_matrix, self.filter, &mut self.screen);
            if let Err(e) = self.display.swap_buffers(&self.screen) {
                tracing::warn!("Display swap failed: {}", e);
            }
            self.frames_drawn += 1;
        }

        self.record_frame(&image);
    }

    fn record_frame(&mut self, image: &TexImage) {
        let Some(record_after) = self.record_after_ns else {
            return;
        };
        if image.frame.timestamp_ns < record_after {
            return;
        }
        let (Some(encoder), Some(context)) = (self.encoder.clone(), self.encoder_context.clone())
        else {
            return;
        };

        let current = match context.make_current() {
            Ok(current) => current,
            Err(e) => {
                tracing::error!("Encoder context unusable: {}", e);
                self.stop_recording();
                return;
            }
        };
        let (w, h) = encoder.surface().size();
        self.encoder_buffer.resize(w, h);
        filter::draw_frame(&image.frame, &self.st_matrix, self.filter, &mut self.encoder_buffer);

        let now = clock::monotonic_ns();
        encoder.surface().set_presentation_time(now);
        match encoder.surface().swap_buffers(&self.encoder_buffer) {
            Ok(()) => {
                encoder.frame_available(now / 1_000);
                self.frames_recorded += 1;
                self.recording_active = true;
            }
            Err(e) => tracing::warn!("Encoder swap failed: {}", e),
        }
        drop(current);
    }

    fn snapshot(&self) -> RenderState {
        RenderState {
            camera_texture_id: self.texture.id(),
            camera_st_matrix: self.st_matrix,
            preview_size: self.preview_size,
            filter_mode: self.filter,
            encoder_surface: self.encoder.as_ref().map(|e| e.surface().size()),
            recording_requested: self.record_after_ns.is_some(),
            recording_active: self.recording_active,
            context_id: self.context.as_ref().map(|c| c.id()),
            frames_drawn: self.frames_drawn,
            frames_recorded: self.frames_recorded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::{SoftCodecFactory, VideoEncoder};
    use crate::muxer::{CompletionBus, Mp4Container, Muxer, TrackKind};
    use std::time::{Duration, Instant};

    fn post(texture: &ExternalTexture, w: u32, h: u32) {
        texture.post_frame(CameraFrame {
            width: w,
            height: h,
            pixels: Arc::new(vec![200; (w * h * 4) as usize]),
            timestamp_ns: clock::monotonic_ns(),
        });
    }

    fn wait_until(mut f: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !f() {
            assert!(Instant::now() < deadline, "condition not reached");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_draws_camera_frames_to_display() {
        let display = PreviewSink::new(8, 8);
        let renderer = GlRenderer::spawn(display.clone(), VideoConfig::new(8, 8)).unwrap();
        renderer.change_filter_mode(FilterMode::BlackWhite).unwrap();
        renderer.set_camera_preview_size(4, 4).unwrap();

        post(&renderer.texture(), 4, 4);
        wait_until(|| display.frames_presented() == 1);

        let state = renderer.state().unwrap();
        assert_eq!(state.filter_mode, FilterMode::BlackWhite);
        assert_eq!(state.preview_size, Some((4, 4)));
        assert_eq!(state.frames_drawn, 1);
        assert!(!state.recording_requested);
        assert_eq!(display.last_frame().unwrap().width, 8);
    }

    #[test]
    fn test_recording_feeds_encoder_until_turned_off() {
        let dir = tempfile::tempdir().unwrap();
        let muxer = Arc::new(Muxer::new(
            0,
            dir.path().join("0.mp4"),
            &[TrackKind::Video],
            Arc::new(Mp4Container),
            CompletionBus::new(),
        ));
        let mut encoder = VideoEncoder::new(
            &VideoConfig::new(8, 8),
            &SoftCodecFactory,
            muxer.clone(),
            Arc::new(|e: CaptureError| panic!("unexpected: {}", e)),
        )
        .unwrap();

        let display = PreviewSink::new(8, 8);
        let renderer = GlRenderer::spawn(display.clone(), VideoConfig::new(8, 8)).unwrap();
        let texture = renderer.texture();

        // A frame captured before recording starts is not recorded
        let stale = CameraFrame {
            width: 4,
            height: 4,
            pixels: Arc::new(vec![0; 64]),
            timestamp_ns: clock::monotonic_ns(),
        };
        renderer.change_recording_state(Some(encoder.input())).unwrap();
        assert!(renderer.reset_session_config(VideoConfig::new(16, 16)).is_err());
        texture.post_frame(stale);
        wait_until(|| display.frames_presented() == 1);
        assert_eq!(encoder.stats().frames_submitted(), 0);

        for i in 0..3 {
            post(&texture, 4, 4);
            wait_until(|| display.frames_presented() == 2 + i);
        }
        let state = renderer.state().unwrap();
        assert!(state.recording_active);
        assert_eq!(state.encoder_surface, Some((8, 8)));

        renderer.change_recording_state(None).unwrap();
        post(&texture, 4, 4);
        wait_until(|| display.frames_presented() == 5);
        assert_eq!(encoder.stats().frames_submitted(), 3);

        encoder.stop().unwrap();
        assert!(muxer.outcome().unwrap().is_complete());
        assert!(renderer.reset_session_config(VideoConfig::new(16, 16)).is_ok());
    }

    #[test]
    fn test_pause_releases_context_and_resume_restores_it() {
        let display = PreviewSink::new(4, 4);
        let renderer = GlRenderer::spawn(display.clone(), VideoConfig::new(4, 4)).unwrap();
        let first = renderer.state().unwrap().context_id.unwrap();

        renderer.notify_pausing().unwrap();
        assert_eq!(renderer.state().unwrap().context_id, None);
        post(&renderer.texture(), 4, 4);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(display.frames_presented(), 0);

        renderer.resume().unwrap();
        let second = renderer.state().unwrap().context_id.unwrap();
        assert_ne!(first, second);
        post(&renderer.texture(), 4, 4);
        wait_until(|| display.frames_presented() == 1);
    }
}
