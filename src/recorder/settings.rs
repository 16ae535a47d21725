//! Recorder settings
//!
//! User-facing configuration, loadable from a JSON file. Every field has a
//! default so partial files work.

use super::state::SessionConfig;
use crate::capture::Facing;
use crate::encoder::{AudioConfig, VideoConfig};
use crate::render::FilterMode;
use crate::utils::error::CaptureResult;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecorderSettings {
    /// Requested video width (portrait by default)
    pub width: u32,

    /// Requested video height
    pub height: u32,

    pub frame_rate: u32,

    /// Overrides the bitrate derived from size and frame rate
    pub video_bitrate: Option<u32>,

    pub sample_rate: u32,

    /// 1 or 2
    pub channels: u16,

    pub audio_bitrate: u32,

    pub attach_location: bool,

    /// Camera to open first
    pub facing: Facing,

    pub filter: FilterMode,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            width: 480,
            height: 640,
            frame_rate: crate::encoder::DEFAULT_FRAME_RATE,
            video_bitrate: None,
            sample_rate: 44_100,
            channels: 1,
            audio_bitrate: 96_000,
            attach_location: true,
            facing: Facing::Back,
            filter: FilterMode::Normal,
        }
    }
}

impl RecorderSettings {
    /// Load settings from a JSON file
    pub fn from_file(path: &Path) -> CaptureResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let settings: RecorderSettings = serde_json::from_str(&content)?;
        tracing::debug!("Loaded recorder settings from {:?}", path);
        Ok(settings)
    }

    pub fn audio_config(&self) -> AudioConfig {
        AudioConfig {
            channels: self.channels,
            sample_rate: self.sample_rate,
            bitrate: self.audio_bitrate,
        }
    }

    pub fn video_config(&self) -> VideoConfig {
        VideoConfig::with_frame_rate(self.width, self.height, self.frame_rate, self.video_bitrate)
    }

    /// Configuration for the segment written to `output_path`
    pub fn session_config(
        &self,
        output_path: impl Into<PathBuf>,
        ordinal: u32,
        session_id: Uuid,
    ) -> SessionConfig {
        SessionConfig::builder(output_path)
            .video_size(self.width, self.height)
            .frame_rate(self.frame_rate)
            .video_bitrate(self.video_bitrate)
            .audio(self.audio_config())
            .attach_location(self.attach_location)
            .ordinal(ordinal)
            .session_id(session_id)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let json = r#"{"width": 720, "height": 1280, "facing": "front", "filter": "emboss"}"#;
        std::fs::write(&path, json).unwrap();

        let settings = RecorderSettings::from_file(&path).unwrap();
        assert_eq!((settings.width, settings.height), (720, 1280));
        assert_eq!(settings.facing, Facing::Front);
        assert_eq!(settings.filter, FilterMode::Emboss);
        assert_eq!(settings.sample_rate, 44_100);
        assert!(settings.attach_location);
    }

    #[test]
    fn test_bad_json_is_serialization_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = RecorderSettings::from_file(&path).unwrap_err();
        assert_eq!(err.code(), "SERIALIZATION_ERROR");
    }

    #[test]
    fn test_session_config_from_settings() {
        let settings = RecorderSettings {
            video_bitrate: Some(500_000),
            channels: 2,
            ..RecorderSettings::default()
        };
        let id = Uuid::new_v4();
        let config = settings.session_config("/tmp/3.mp4", 3, id);
        assert_eq!(config.video.bitrate, 500_000);
        assert_eq!(config.audio.channels, 2);
        assert_eq!(config.ordinal, 3);
        assert_eq!(config.session_id, id);
        assert_eq!(config.video, settings.video_config());
    }
}
