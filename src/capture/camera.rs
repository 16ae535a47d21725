//! Camera controller
//!
//! Picks a device by facing, negotiates the preview size, streams into the
//! renderer's external texture and applies facing and flash requests. Runs
//! on the coordinator thread.

use super::traits::{CameraDevice, CameraDriver, CameraInfo, Facing, FlashMode, Resolution};
use crate::render::gpu::{ExternalTexture, IDENTITY_MATRIX, MIRROR_MATRIX};
use crate::utils::error::{CaptureError, CaptureResult};
use std::sync::Arc;

/// What `open` actually got
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenedCamera {
    pub width: u32,
    pub height: u32,
    pub facing: Facing,
}

/// Supported size closest to `desired`. Either orientation of the request
/// matches; ties go to the larger mode.
pub fn choose_preview_size(supported: &[Resolution], desired: Resolution) -> Option<Resolution> {
    let distance = |r: &Resolution| {
        let direct = r.width.abs_diff(desired.width) + r.height.abs_diff(desired.height);
        let rotated = r.width.abs_diff(desired.height) + r.height.abs_diff(desired.width);
        direct.min(rotated)
    };
    supported
        .iter()
        .copied()
        .min_by(|a, b| distance(a).cmp(&distance(b)).then(b.area().cmp(&a.area())))
}

/// Device to open for `facing`: that facing, else the opposite, else the
/// driver's first camera
fn pick_camera(cameras: &[CameraInfo], facing: Facing) -> Option<&CameraInfo> {
    cameras
        .iter()
        .find(|c| c.facing == facing)
        .or_else(|| cameras.iter().find(|c| c.facing == facing.opposite()))
        .or_else(|| cameras.first())
}

pub struct CameraController {
    driver: Arc<dyn CameraDriver>,
    device: Option<Box<dyn CameraDevice>>,
    texture: Option<Arc<ExternalTexture>>,

    /// Last size passed to `open`, reused when switching cameras
    requested: Resolution,

    facing: Facing,

    preview_size: Option<Resolution>,

    /// Flash the user asked for; applied on the next open when closed
    flash: FlashMode,

    previewing: bool,
}

impl CameraController {
    pub fn new(driver: Arc<dyn CameraDriver>) -> Self {
        Self {
            driver,
            device: None,
            texture: None,
            requested: Resolution::new(480, 640),
            facing: Facing::Back,
            preview_size: None,
            flash: FlashMode::Off,
            previewing: false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.device.is_some()
    }

    pub fn is_previewing(&self) -> bool {
        self.previewing
    }

    pub fn facing(&self) -> Facing {
        self.facing
    }

    pub fn flash_mode(&self) -> FlashMode {
        self.flash
    }

    pub fn preview_size(&self) -> Option<Resolution> {
        self.preview_size
    }

    /// Open the best device for `facing` and configure the preview size
    /// nearest to `width`x`height`.
    pub fn open(&mut self, width: u32, height: u32, facing: Facing) -> CaptureResult<OpenedCamera> {
        if self.device.is_some() {
            return Err(CaptureError::InvalidState("camera already open".to_string()));
        }
        self.requested = Resolution::new(width, height);

        let cameras = self.driver.cameras();
        let info = pick_camera(&cameras, facing)
            .ok_or_else(|| CaptureError::DeviceUnavailable("no camera found".to_string()))?;
        let size = choose_preview_size(&info.supported_resolutions, self.requested)
            .ok_or_else(|| {
                CaptureError::DeviceUnavailable(format!("camera {} has no preview sizes", info.id))
            })?;

        let mut device = self.driver.open(&info.id)?;
        if let Err(e) = device.configure(size, info.supports_recording_hint) {
            device.close();
            return Err(e);
        }

        if self.flash != FlashMode::Off {
            if info.flash_modes.contains(&self.flash) {
                device.set_flash_mode(self.flash)?;
            } else {
                tracing::debug!("Camera {} has no {:?} flash, turning it off", info.id, self.flash);
                self.flash = FlashMode::Off;
            }
        }

        if info.facing != facing {
            tracing::warn!(
                "No {:?} camera, using {} ({:?})",
                facing,
                info.name,
                info.facing
            );
        }
        tracing::info!(
            "Opened camera {} ({:?}) at {}x{} for requested {}x{}",
            info.name,
            info.facing,
            size.width,
            size.height,
            width,
            height
        );

        self.facing = info.facing;
        self.preview_size = Some(size);
        self.device = Some(device);
        Ok(OpenedCamera {
            width: size.width,
            height: size.height,
            facing: info.facing,
        })
    }

    /// Texture the preview streams into
    pub fn bind_texture(&mut self, texture: Arc<ExternalTexture>) {
        self.texture = Some(texture);
    }

    pub fn start_preview(&mut self) -> CaptureResult<()> {
        if self.previewing {
            return Ok(());
        }
        let texture = self
            .texture
            .clone()
            .ok_or_else(|| CaptureError::InvalidState("no texture bound".to_string()))?;
        let device = self
            .device
            .as_mut()
            .ok_or_else(|| CaptureError::InvalidState("camera not open".to_string()))?;

        let transform = match device.info().facing {
            Facing::Front => MIRROR_MATRIX,
            Facing::Back => IDENTITY_MATRIX,
        };
        texture.set_transform(transform);
        device.start_preview(texture)?;
        self.previewing = true;
        Ok(())
    }

    pub fn stop_preview(&mut self) {
        if !self.previewing {
            return;
        }
        if let Some(device) = self.device.as_mut() {
            device.stop_preview();
        }
        self.previewing = false;
    }

    pub fn close(&mut self) {
        self.stop_preview();
        if let Some(mut device) = self.device.take() {
            tracing::debug!("Closing camera {}", device.info().id);
            device.close();
        }
        self.preview_size = None;
    }

    /// Switch to `facing`, restarting the preview if it was running.
    /// Returns whether the camera now faces that way.
    pub fn request_facing(&mut self, facing: Facing) -> CaptureResult<bool> {
        if facing == self.facing {
            return Ok(true);
        }
        let cameras = self.driver.cameras();
        if !cameras.iter().any(|c| c.facing == facing) {
            tracing::debug!("Ignoring {:?} facing request, no such camera", facing);
            return Ok(false);
        }
        if self.device.is_none() {
            self.facing = facing;
            return Ok(true);
        }

        let was_previewing = self.previewing;
        self.close();
        let opened = self.open(self.requested.width, self.requested.height, facing)?;
        if was_previewing {
            self.start_preview()?;
        }
        Ok(opened.facing == facing)
    }

    pub fn request_other_camera(&mut self) -> CaptureResult<bool> {
        self.request_facing(self.facing.opposite())
    }

    /// Apply a flash mode. Unsupported modes are ignored and return `false`;
    /// while closed the mode is remembered for the next open.
    pub fn request_flash(&mut self, mode: FlashMode) -> CaptureResult<bool> {
        let Some(device) = self.device.as_mut() else {
            self.flash = mode;
            return Ok(true);
        };
        if !device.info().flash_modes.contains(&mode) {
            tracing::debug!("Flash mode {:?} not supported by {}", mode, device.info().id);
            return Ok(false);
        }
        device.set_flash_mode(mode)?;
        self.flash = mode;
        Ok(true)
    }

    /// Torch on or off. Returns the flash mode now in effect.
    pub fn toggle_flash(&mut self) -> CaptureResult<FlashMode> {
        let next = match self.flash {
            FlashMode::Torch => FlashMode::Off,
            _ => FlashMode::Torch,
        };
        self.request_flash(next)?;
        Ok(self.flash)
    }
}

impl Drop for CameraController {
    fn drop(&mut self) {
        self.close();
    }
}
