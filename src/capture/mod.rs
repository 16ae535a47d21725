//! Camera and microphone capture
//!
//! Device access goes through the traits in [`traits`]. The virtual camera
//! and tone microphone run anywhere; the `webcam` and `microphone` features
//! add real devices through nokhwa and cpal.

pub mod audio;
pub mod camera;
pub mod traits;
pub mod virtual_camera;

#[cfg(feature = "webcam")]
pub mod webcam;

pub use audio::ToneMicrophoneSource;
pub use camera::{choose_preview_size, CameraController, OpenedCamera};
pub use traits::{
    AudioDeviceInfo, CameraDevice, CameraDriver, CameraInfo, Facing, FlashMode, Microphone,
    MicrophoneSource, Resolution,
};
pub use virtual_camera::VirtualCameraDriver;

#[cfg(feature = "microphone")]
pub use audio::CpalMicrophoneSource;

#[cfg(feature = "webcam")]
pub use webcam::WebcamDriver;
