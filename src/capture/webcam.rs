//! Webcam driver using nokhwa
//!
//! Desktop webcams report as front-facing and have no flash. Preview sizes
//! come from the formats the device advertises, probed once per device.
//! Frames are decoded to RGBA on the capture thread and posted to the texture.

use super::traits::{CameraDevice, CameraDriver, CameraInfo, Facing, FlashMode, Resolution};
use crate::render::gpu::{CameraFrame, ExternalTexture};
use crate::utils::clock;
use crate::utils::error::{CaptureError, CaptureResult};
use nokhwa::pixel_format::RgbAFormat;
use nokhwa::utils::{
    ApiBackend, CameraIndex, RequestedFormat, RequestedFormatType,
    Resolution as FrameResolution,
};
use nokhwa::Camera;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

fn camera_index(id: &str) -> CameraIndex {
    match id.parse::<u32>() {
        Ok(i) => CameraIndex::Index(i),
        Err(_) => CameraIndex::String(id.to_string()),
    }
}

/// Distinct sizes, largest first
fn preview_sizes(sizes: impl IntoIterator<Item = (u32, u32)>) -> Vec<Resolution> {
    let mut sizes: Vec<(u32, u32)> = sizes.into_iter().collect();
    sizes.sort_by_key(|(w, h)| (std::cmp::Reverse(*w as u64 * *h as u64), *w, *h));
    sizes.dedup();
    sizes
        .into_iter()
        .map(|(w, h)| Resolution::new(w, h))
        .collect()
}

/// Ask for the negotiated size, or the largest the device has
fn requested_format(preview: Option<Resolution>) -> RequestedFormatType {
    match preview {
        Some(size) => RequestedFormatType::HighestResolution(FrameResolution::new(
            size.width,
            size.height,
        )),
        None => RequestedFormatType::AbsoluteHighestResolution,
    }
}

fn probe_sizes(index: &CameraIndex) -> Vec<Resolution> {
    let format = RequestedFormat::new::<RgbAFormat>(RequestedFormatType::None);
    let formats = Camera::new(index.clone(), format)
        .and_then(|mut camera| camera.compatible_camera_formats());
    match formats {
        Ok(formats) => preview_sizes(formats.iter().map(|f| {
            let resolution = f.resolution();
            (resolution.width(), resolution.height())
        })),
        Err(e) => {
            tracing::warn!("Cannot read formats of camera {:?}: {:?}", index, e);
            Vec::new()
        }
    }
}

/// Cameras found by the platform backend
#[derive(Debug, Default)]
pub struct WebcamDriver {
    /// Advertised sizes per camera id
    sizes: Mutex<HashMap<String, Vec<Resolution>>>,
}

impl WebcamDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn sizes_for(&self, index: &CameraIndex, id: &str) -> Vec<Resolution> {
        if let Some(sizes) = self.sizes.lock().get(id) {
            return sizes.clone();
        }
        let sizes = probe_sizes(index);
        if !sizes.is_empty() {
            self.sizes.lock().insert(id.to_string(), sizes.clone());
        }
        sizes
    }
}

impl CameraDriver for WebcamDriver {
    fn cameras(&self) -> Vec<CameraInfo> {
        match nokhwa::query(ApiBackend::Auto) {
            Ok(cameras) => cameras
                .into_iter()
                .map(|info| {
                    let id = match info.index() {
                        CameraIndex::Index(i) => i.to_string(),
                        CameraIndex::String(s) => s.to_string(),
                    };
                    CameraInfo {
                        supported_resolutions: self.sizes_for(info.index(), &id),
                        id,
                        name: info.human_name(),
                        facing: Facing::Front,
                        flash_modes: vec![FlashMode::Off],
                        supports_recording_hint: false,
                    }
                })
                .collect(),
            Err(e) => {
                tracing::warn!("Failed to enumerate cameras: {:?}", e);
                Vec::new()
            }
        }
    }

    fn open(&self, id: &str) -> CaptureResult<Box<dyn CameraDevice>> {
        let info = self
            .cameras()
            .into_iter()
            .find(|c| c.id == id)
            .ok_or_else(|| CaptureError::DeviceUnavailable(format!("no camera with id {}", id)))?;
        Ok(Box::new(Webcam {
            info,
            preview: None,
            capture: None,
        }))
    }
}

struct CaptureThread {
    running: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

struct Webcam {
    info: CameraInfo,
    preview: Option<Resolution>,
    capture: Option<CaptureThread>,
}

impl CameraDevice for Webcam {
    fn info(&self) -> &CameraInfo {
        &self.info
    }

    fn configure(&mut self, preview: Resolution, _recording_hint: bool) -> CaptureResult<()> {
        self.preview = Some(preview);
        Ok(())
    }

    fn set_flash_mode(&mut self, mode: FlashMode) -> CaptureResult<()> {
        match mode {
            FlashMode::Off => Ok(()),
            other => Err(CaptureError::InvalidState(format!(
                "webcams have no {:?} flash",
                other
            ))),
        }
    }

    fn start_preview(&mut self, texture: Arc<ExternalTexture>) -> CaptureResult<()> {
        if self.capture.is_some() {
            return Ok(());
        }
        let index = camera_index(&self.info.id);
        let requested = requested_format(self.preview);
        let preview = self.preview;
        let running = Arc::new(AtomicBool::new(true));
        let is_running = running.clone();
        let (started_tx, started_rx) = std::sync::mpsc::channel();

        // The nokhwa handle is created and dropped on the capture thread
        let thread = std::thread::Builder::new()
            .name(format!("webcam-{}", self.info.id))
            .spawn(move || {
                let format = RequestedFormat::new::<RgbAFormat>(requested);
                let mut camera = match Camera::new(index.clone(), format) {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = started_tx.send(Err(CaptureError::DeviceUnavailable(format!(
                            "failed to open camera {:?}: {:?}",
                            index, e
                        ))));
                        return;
                    }
                };
                if let Err(e) = camera.open_stream() {
                    let _ = started_tx.send(Err(CaptureError::DeviceUnavailable(format!(
                        "failed to open camera stream: {:?}",
                        e
                    ))));
                    return;
                }
                let _ = started_tx.send(Ok(()));

                let camera_format = camera.camera_format();
                if let Some(size) = preview {
                    let actual = camera_format.resolution();
                    if (actual.width(), actual.height()) != (size.width, size.height) {
                        tracing::warn!(
                            "Webcam gave {}x{} for requested {}x{}",
                            actual.width(),
                            actual.height(),
                            size.width,
                            size.height
                        );
                    }
                }
                tracing::info!(
                    "Webcam streaming {}x{} @ {}fps ({:?})",
                    camera_format.resolution().width(),
                    camera_format.resolution().height(),
                    camera_format.frame_rate(),
                    camera_format.format()
                );

                while is_running.load(Ordering::Acquire) {
                    let image = match camera.frame().and_then(|f| f.decode_image::<RgbAFormat>()) {
                        Ok(image) => image,
                        Err(e) => {
                            tracing::warn!("Webcam frame dropped: {:?}", e);
                            continue;
                        }
                    };
                    let (width, height) = (image.width(), image.height());
                    texture.post_frame(CameraFrame {
                        width,
                        height,
                        pixels: Arc::new(image.into_raw()),
                        timestamp_ns: clock::monotonic_ns(),
                    });
                }

                if let Err(e) = camera.stop_stream() {
                    tracing::warn!("Failed to stop webcam stream: {:?}", e);
                }
            })?;

        match started_rx.recv() {
            Ok(Ok(())) => {
                self.capture = Some(CaptureThread { running, thread });
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => Err(CaptureError::DeviceUnavailable(
                "webcam thread exited".to_string(),
            )),
        }
    }

    fn stop_preview(&mut self) {
        if let Some(capture) = self.capture.take() {
            capture.running.store(false, Ordering::Release);
            if capture.thread.join().is_err() {
                tracing::error!("Webcam capture thread panicked");
            }
        }
    }

    fn close(&mut self) {
        self.stop_preview();
    }
}

impl Drop for Webcam {
    fn drop(&mut self) {
        self.stop_preview();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_sizes_dedup_largest_first() {
        let sizes = preview_sizes([(640, 480), (1280, 720), (640, 480), (320, 240), (1280, 720)]);
        assert_eq!(
            sizes,
            vec![
                Resolution::new(1280, 720),
                Resolution::new(640, 480),
                Resolution::new(320, 240)
            ]
        );
        assert!(preview_sizes([]).is_empty());
    }

    #[test]
    fn test_requested_format_uses_negotiated_size() {
        let requested = requested_format(Some(Resolution::new(640, 480)));
        assert!(matches!(
            requested,
            RequestedFormatType::HighestResolution(r) if r.width() == 640 && r.height() == 480
        ));
        assert!(matches!(
            requested_format(None),
            RequestedFormatType::AbsoluteHighestResolution
        ));
    }
}
