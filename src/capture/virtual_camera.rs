//! Synthetic camera for headless runs and tests
//!
//! Each opened device runs a producer thread that paints a moving bar and
//! posts frames into the bound texture at the configured rate.

use super::traits::{CameraDevice, CameraDriver, CameraInfo, Facing, FlashMode, Resolution};
use crate::render::gpu::{CameraFrame, ExternalTexture};
use crate::utils::clock;
use crate::utils::error::{CaptureError, CaptureResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const DEFAULT_FPS: u32 = 30;

pub struct VirtualCameraDriver {
    cameras: Vec<CameraInfo>,
    fps: u32,
}

impl VirtualCameraDriver {
    /// A back camera ("0") and a front camera ("1")
    pub fn new() -> Self {
        Self::with_cameras(vec![Self::back_camera(), Self::front_camera()])
    }

    pub fn with_cameras(cameras: Vec<CameraInfo>) -> Self {
        Self {
            cameras,
            fps: DEFAULT_FPS,
        }
    }

    /// A driver that reports no devices
    pub fn unavailable() -> Self {
        Self::with_cameras(Vec::new())
    }

    pub fn with_frame_rate(mut self, fps: u32) -> Self {
        self.fps = fps.max(1);
        self
    }

    pub fn back_camera() -> CameraInfo {
        CameraInfo {
            id: "0".to_string(),
            name: "Virtual back camera".to_string(),
            facing: Facing::Back,
            supported_resolutions: vec![
                Resolution::new(1920, 1080),
                Resolution::new(1280, 720),
                Resolution::new(640, 480),
                Resolution::new(320, 240),
                Resolution::new(176, 144),
            ],
            flash_modes: vec![FlashMode::Off, FlashMode::Torch, FlashMode::On, FlashMode::Auto],
            supports_recording_hint: true,
        }
    }

    pub fn front_camera() -> CameraInfo {
        CameraInfo {
            id: "1".to_string(),
            name: "Virtual front camera".to_string(),
            facing: Facing::Front,
            supported_resolutions: vec![
                Resolution::new(1280, 720),
                Resolution::new(640, 480),
                Resolution::new(320, 240),
                Resolution::new(176, 144),
            ],
            flash_modes: vec![FlashMode::Off],
            supports_recording_hint: false,
        }
    }
}

impl Default for VirtualCameraDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl CameraDriver for VirtualCameraDriver {
    fn cameras(&self) -> Vec<CameraInfo> {
        self.cameras.clone()
    }

    fn open(&self, id: &str) -> CaptureResult<Box<dyn CameraDevice>> {
        let info = self
            .cameras
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or_else(|| CaptureError::DeviceUnavailable(format!("no camera with id {}", id)))?;
        Ok(Box::new(VirtualCamera {
            info,
            fps: self.fps,
            size: None,
            flash: FlashMode::Off,
            producer: None,
            closed: false,
        }))
    }
}

struct Producer {
    running: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

struct VirtualCamera {
    info: CameraInfo,
    fps: u32,
    size: Option<Resolution>,
    flash: FlashMode,
    producer: Option<Producer>,
    closed: bool,
}

impl VirtualCamera {
    fn ensure_open(&self) -> CaptureResult<()> {
        if self.closed {
            return Err(CaptureError::DeviceUnavailable(format!(
                "camera {} closed",
                self.info.id
            )));
        }
        Ok(())
    }
}

/// Gray frame with a bright vertical bar that moves one step per frame
fn paint_frame(size: Resolution, index: u64, flash: FlashMode) -> Vec<u8> {
    let (w, h) = (size.width as usize, size.height as usize);
    let base = if flash == FlashMode::Torch { 160 } else { 64 };
    let bar = (index as usize * 4) % w.max(1);
    let mut pixels = vec![0u8; w * h * 4];
    for (i, px) in pixels.chunks_exact_mut(4).enumerate() {
        let x = i % w;
        let lit = x >= bar && x < bar + 8;
        let v = if lit { 240 } else { base };
        px.copy_from_slice(&[v, v / 2, 255 - v, 255]);
    }
    pixels
}

impl CameraDevice for VirtualCamera {
    fn info(&self) -> &CameraInfo {
        &self.info
    }

    fn configure(&mut self, preview: Resolution, _recording_hint: bool) -> CaptureResult<()> {
        self.ensure_open()?;
        if !self.info.supported_resolutions.contains(&preview) {
            return Err(CaptureError::DeviceUnavailable(format!(
                "camera {} cannot preview at {}x{}",
                self.info.id, preview.width, preview.height
            )));
        }
        self.size = Some(preview);
        Ok(())
    }

    fn set_flash_mode(&mut self, mode: FlashMode) -> CaptureResult<()> {
        self.ensure_open()?;
        if !self.info.flash_modes.contains(&mode) {
            return Err(CaptureError::InvalidState(format!("flash {:?} unsupported", mode)));
        }
        self.flash = mode;
        Ok(())
    }

    fn start_preview(&mut self, texture: Arc<ExternalTexture>) -> CaptureResult<()> {
        self.ensure_open()?;
        if self.producer.is_some() {
            return Ok(());
        }
        let size = self
            .size
            .ok_or_else(|| CaptureError::InvalidState("camera not configured".to_string()))?;

        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let flash = self.flash;
        let interval = Duration::from_secs(1) / self.fps;
        let thread = std::thread::Builder::new()
            .name(format!("virtual-camera-{}", self.info.id))
            .spawn(move || {
                let mut next = Instant::now();
                let mut index = 0u64;
                while flag.load(Ordering::Acquire) {
                    texture.post_frame(CameraFrame {
                        width: size.width,
                        height: size.height,
                        pixels: Arc::new(paint_frame(size, index, flash)),
                        timestamp_ns: clock::monotonic_ns(),
                    });
                    index += 1;
                    next += interval;
                    if let Some(wait) = next.checked_duration_since(Instant::now()) {
                        std::thread::sleep(wait);
                    }
                }
            })?;

        tracing::debug!(
            "Virtual camera {} streaming {}x{} @ {}fps",
            self.info.id,
            size.width,
            size.height,
            self.fps
        );
        self.producer = Some(Producer { running, thread });
        Ok(())
    }

    fn stop_preview(&mut self) {
        if let Some(producer) = self.producer.take() {
            producer.running.store(false, Ordering::Release);
            if producer.thread.join().is_err() {
                tracing::error!("Virtual camera {} producer panicked", self.info.id);
            }
        }
    }

    fn close(&mut self) {
        self.stop_preview();
        self.closed = true;
    }
}

impl Drop for VirtualCamera {
    fn drop(&mut self) {
        self.stop_preview();
    }
}
