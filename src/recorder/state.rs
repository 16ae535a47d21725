//! Session state
//!
//! Defines the coordinator state machine, per-segment configuration and
//! the events published to the UI.

use crate::capture::{Facing, FlashMode};
use crate::encoder::{AudioConfig, VideoConfig};
use crate::export::StitchReport;
use crate::render::FilterMode;
use crate::utils::error::ErrorResponse;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Current state of the session coordinator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoordinatorState {
    /// No segment in flight
    #[default]
    Idle,
    /// Encoders running into the current segment
    Recording,
    /// Encoders stopped, waiting for the muxer to finish the segment
    Finalizing,
}

/// Parameters of one segment. Immutable once recording starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    pub video: VideoConfig,

    pub audio: AudioConfig,

    /// Segment file in the temporary directory
    pub output_path: PathBuf,

    /// Metadata flag carried from the settings
    pub attach_location: bool,

    pub ordinal: u32,

    /// Shared by every segment of one session
    pub session_id: Uuid,
}

impl SessionConfig {
    pub fn builder(output_path: impl Into<PathBuf>) -> SessionConfigBuilder {
        SessionConfigBuilder {
            width: 480,
            height: 640,
            frame_rate: crate::encoder::DEFAULT_FRAME_RATE,
            video_bitrate: None,
            audio: AudioConfig::default(),
            output_path: output_path.into(),
            attach_location: true,
            ordinal: 0,
            session_id: None,
        }
    }
}

/// Builds a [`SessionConfig`]; the video bitrate defaults to
/// `0.10 * frame_rate * width * height`.
#[derive(Debug, Clone)]
pub struct SessionConfigBuilder {
    width: u32,
    height: u32,
    frame_rate: u32,
    video_bitrate: Option<u32>,
    audio: AudioConfig,
    output_path: PathBuf,
    attach_location: bool,
    ordinal: u32,
    session_id: Option<Uuid>,
}

impl SessionConfigBuilder {
    pub fn video_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn frame_rate(mut self, frame_rate: u32) -> Self {
        self.frame_rate = frame_rate;
        self
    }

    pub fn video_bitrate(mut self, bitrate: Option<u32>) -> Self {
        self.video_bitrate = bitrate;
        self
    }

    pub fn audio(mut self, audio: AudioConfig) -> Self {
        self.audio = audio;
        self
    }

    pub fn attach_location(mut self, attach: bool) -> Self {
        self.attach_location = attach;
        self
    }

    pub fn ordinal(mut self, ordinal: u32) -> Self {
        self.ordinal = ordinal;
        self
    }

    pub fn session_id(mut self, id: Uuid) -> Self {
        self.session_id = Some(id);
        self
    }

    pub fn build(self) -> SessionConfig {
        SessionConfig {
            video: VideoConfig::with_frame_rate(
                self.width,
                self.height,
                self.frame_rate,
                self.video_bitrate,
            ),
            audio: self.audio,
            output_path: self.output_path,
            attach_location: self.attach_location,
            ordinal: self.ordinal,
            session_id: self.session_id.unwrap_or_else(Uuid::new_v4),
        }
    }
}

/// Lifecycle of one segment file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentStatus {
    Writing,
    Finished,
    Promoted,
    Failed,
}

/// A segment the coordinator knows about
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub ordinal: u32,

    /// Current location: temporary while writing, durable once promoted
    pub path: PathBuf,

    pub status: SegmentStatus,

    /// Longest track, known once finished
    pub duration_us: u64,

    pub started_at: DateTime<Utc>,
}

/// Notifications for the UI
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RecordingEvent {
    #[serde(rename_all = "camelCase")]
    RecordingStarted { ordinal: u32 },

    #[serde(rename_all = "camelCase")]
    RecordingStopped { ordinal: u32 },

    #[serde(rename_all = "camelCase")]
    SegmentPromoted {
        ordinal: u32,
        path: PathBuf,
        duration_us: u64,
    },

    #[serde(rename_all = "camelCase")]
    SegmentFailed { ordinal: u32, error: ErrorResponse },

    #[serde(rename_all = "camelCase")]
    SessionFinalized { report: StitchReport },

    #[serde(rename_all = "camelCase")]
    StitchFailed { error: ErrorResponse },

    SessionDiscarded,

    #[serde(rename_all = "camelCase")]
    FacingChanged { facing: Facing },

    #[serde(rename_all = "camelCase")]
    FlashChanged { mode: FlashMode },

    #[serde(rename_all = "camelCase")]
    FilterChanged { mode: FilterMode },

    #[serde(rename_all = "camelCase")]
    Error { error: ErrorResponse },
}

/// Point-in-time view of the session
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: Uuid,

    pub state: CoordinatorState,

    /// Segment being written or finalized
    pub current: Option<Segment>,

    /// Promoted segments in ordinal order
    pub segments: Vec<Segment>,

    /// Recorded time over all promoted segments plus the running one
    pub recording_time_ms: u64,

    pub facing: Facing,

    pub flash: FlashMode,

    pub filter: FilterMode,

    pub paused: bool,

    /// Stitch in progress
    pub stitching: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_applies_bitrate_rule() {
        let config = SessionConfig::builder("/tmp/0.mp4").video_size(1280, 720).build();
        assert_eq!(config.video.bitrate, 2_764_800);
        assert_eq!(config.video.frame_rate, 30);
        assert!(config.attach_location);

        let config = SessionConfig::builder("/tmp/1.mp4")
            .video_bitrate(Some(1_000_000))
            .ordinal(1)
            .build();
        assert_eq!(config.video.bitrate, 1_000_000);
        assert_eq!((config.video.width, config.video.height), (480, 640));
        assert_eq!(config.ordinal, 1);
    }

    #[test]
    fn test_event_serialization() {
        let event = RecordingEvent::SegmentFailed {
            ordinal: 2,
            error: ErrorResponse {
                code: "MUXER_IO".to_string(),
                message: "disk full".to_string(),
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "segmentFailed");
        assert_eq!(json["ordinal"], 2);
        assert_eq!(json["error"]["code"], "MUXER_IO");

        let json = serde_json::to_value(RecordingEvent::SessionDiscarded).unwrap();
        assert_eq!(json["type"], "sessionDiscarded");
    }

    #[test]
    fn test_default_state_is_idle() {
        assert_eq!(CoordinatorState::default(), CoordinatorState::Idle);
        assert_eq!(serde_json::to_value(CoordinatorState::Finalizing).unwrap(), "finalizing");
    }
}
