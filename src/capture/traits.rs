//! Capture trait definitions
//!
//! Driver-agnostic traits for cameras and microphones.

use crate::render::gpu::ExternalTexture;
use crate::utils::error::CaptureResult;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Which way a camera points
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Facing {
    #[default]
    Back,
    Front,
}

impl Facing {
    pub fn opposite(self) -> Self {
        match self {
            Facing::Back => Facing::Front,
            Facing::Front => Facing::Back,
        }
    }
}

/// Flash setting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlashMode {
    #[default]
    Off,
    Torch,
    On,
    Auto,
}

/// Video resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// Information about a camera
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraInfo {
    /// Unique device ID
    pub id: String,

    /// Device name
    pub name: String,

    pub facing: Facing,

    /// Supported preview resolutions, in sensor orientation
    pub supported_resolutions: Vec<Resolution>,

    pub flash_modes: Vec<FlashMode>,

    /// Whether the device can be told a recording is coming
    pub supports_recording_hint: bool,
}

/// Information about an audio input device
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioDeviceInfo {
    pub id: String,
    pub name: String,
    pub is_default: bool,
}

/// Enumerates and opens cameras
pub trait CameraDriver: Send + Sync {
    /// Cameras in driver order; the first is the default device
    fn cameras(&self) -> Vec<CameraInfo>;

    fn open(&self, id: &str) -> CaptureResult<Box<dyn CameraDevice>>;
}

/// An opened camera
pub trait CameraDevice: Send {
    fn info(&self) -> &CameraInfo;

    fn configure(&mut self, preview: Resolution, recording_hint: bool) -> CaptureResult<()>;

    fn set_flash_mode(&mut self, mode: FlashMode) -> CaptureResult<()>;

    /// Start streaming frames into `texture`
    fn start_preview(&mut self, texture: Arc<ExternalTexture>) -> CaptureResult<()>;

    fn stop_preview(&mut self);

    fn close(&mut self);
}

/// An opened microphone delivering interleaved 16-bit PCM
pub trait Microphone: Send {
    /// Block until `buf` is full. Returns the number of samples written.
    fn read(&mut self, buf: &mut [i16]) -> CaptureResult<usize>;

    fn close(&mut self);
}

/// Opens microphones
pub trait MicrophoneSource: Send + Sync {
    fn devices(&self) -> Vec<AudioDeviceInfo>;

    fn open(&self, sample_rate: u32, channels: u16) -> CaptureResult<Box<dyn Microphone>>;
}
