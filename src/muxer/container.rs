//! Container format abstraction
//!
//! The muxer and the stitcher only talk to these traits. The MPEG-4
//! implementation lives in [`super::mpeg4`].

use crate::utils::error::CaptureResult;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Kind of elementary stream carried by a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Video,
    Audio,
}

/// Per-sample flags reported by the codecs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleFlags {
    pub keyframe: bool,
    pub codec_config: bool,
    pub end_of_stream: bool,
}

impl SampleFlags {
    pub const NONE: SampleFlags = SampleFlags {
        keyframe: false,
        codec_config: false,
        end_of_stream: false,
    };
    pub const KEYFRAME: SampleFlags = SampleFlags {
        keyframe: true,
        codec_config: false,
        end_of_stream: false,
    };
    pub const CODEC_CONFIG: SampleFlags = SampleFlags {
        keyframe: false,
        codec_config: true,
        end_of_stream: false,
    };
    pub const END_OF_STREAM: SampleFlags = SampleFlags {
        keyframe: false,
        codec_config: false,
        end_of_stream: true,
    };
}

/// Video track description taken from the codec-config packet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoTrackFormat {
    pub width: u16,
    pub height: u16,
    /// Sequence parameter set without start code
    pub sps: Vec<u8>,
    /// Picture parameter set without start code
    pub pps: Vec<u8>,
}

/// Audio track description taken from the codec-config packet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioTrackFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bitrate: u32,
    /// Samples per encoded frame
    pub frame_size: u32,
}

/// Codec format registered for one track
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TrackFormat {
    Video(VideoTrackFormat),
    Audio(AudioTrackFormat),
}

impl TrackFormat {
    pub fn kind(&self) -> TrackKind {
        match self {
            TrackFormat::Video(_) => TrackKind::Video,
            TrackFormat::Audio(_) => TrackKind::Audio,
        }
    }

    /// Duration given to a sample when no following sample tells us better
    pub fn nominal_sample_duration_us(&self) -> u64 {
        match self {
            TrackFormat::Video(_) => 1_000_000 / 30,
            TrackFormat::Audio(a) if a.sample_rate > 0 => {
                a.frame_size as u64 * 1_000_000 / a.sample_rate as u64
            }
            TrackFormat::Audio(_) => 0,
        }
    }

    /// Whether samples of `other` can be appended to a track of this format
    /// without re-encoding.
    pub fn is_compatible_with(&self, other: &TrackFormat) -> bool {
        match (self, other) {
            (TrackFormat::Video(a), TrackFormat::Video(b)) => {
                a.width == b.width && a.height == b.height
            }
            (TrackFormat::Audio(a), TrackFormat::Audio(b)) => {
                a.sample_rate == b.sample_rate && a.channels == b.channels
            }
            _ => false,
        }
    }
}

/// One compressed sample as stored in a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSample {
    pub pts_us: u64,
    pub duration_us: u64,
    pub is_sync: bool,
    pub bytes: Bytes,
}

/// Write side of a container file
pub trait ContainerWriter: Send {
    /// Declare the next track. Tracks are indexed in call order from 0.
    fn add_track(&mut self, format: &TrackFormat) -> CaptureResult<()>;

    fn write_sample(&mut self, track_index: usize, sample: &MediaSample) -> CaptureResult<()>;

    /// Write the index and flush. The writer is unusable afterwards.
    fn finish(&mut self) -> CaptureResult<()>;
}

/// Read side of a container file
pub trait ContainerReader: Send {
    /// Track formats in file order
    fn tracks(&self) -> &[TrackFormat];

    fn sample_count(&self, track_index: usize) -> CaptureResult<u32>;

    /// Read sample `sample_index` (0-based) of a track
    fn read_sample(&mut self, track_index: usize, sample_index: u32) -> CaptureResult<Option<MediaSample>>;
}

/// A container format able to create and open files
pub trait ContainerFormat: Send + Sync {
    /// File extension without the dot
    fn extension(&self) -> &'static str;

    fn create(&self, path: &Path) -> CaptureResult<Box<dyn ContainerWriter>>;

    fn open(&self, path: &Path) -> CaptureResult<Box<dyn ContainerReader>>;
}
