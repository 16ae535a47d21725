//! Encoders
//!
//! Each segment gets a fresh [`VideoEncoder`]; the [`AudioEncoder`] is reset
//! per segment. Both drain their codec on a dedicated thread and forward
//! packets into the segment's [`Muxer`](crate::muxer::Muxer).

pub mod audio;
pub mod codec;
mod feed;
pub mod soft;
pub mod video;

pub use audio::AudioEncoder;
pub use codec::{AudioCodec, CodecFactory, CodecOutput, CodecPacket, VideoCodec};
pub use soft::{SoftAudioCodec, SoftCodecFactory, SoftVideoCodec};
pub use video::{EncoderInput, VideoEncoder};

use crate::utils::error::CaptureError;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// PCM frames per audio buffer and per encoded audio frame
pub const AUDIO_FRAME_SIZE: usize = 1024;

/// Bits per pixel per frame used for the default video bitrate
pub const BITS_PER_PIXEL: f32 = 0.10;

pub const DEFAULT_FRAME_RATE: u32 = 30;

/// Default bitrate: `0.10 * frame_rate * width * height`
pub fn default_video_bitrate(width: u32, height: u32, frame_rate: u32) -> u32 {
    (BITS_PER_PIXEL * frame_rate as f32 * width as f32 * height as f32) as u32
}

/// Video encoder parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoConfig {
    pub width: u32,
    pub height: u32,
    pub bitrate: u32,
    pub frame_rate: u32,
}

impl VideoConfig {
    /// 30 fps with the default bitrate for the size
    pub fn new(width: u32, height: u32) -> Self {
        Self::with_frame_rate(width, height, DEFAULT_FRAME_RATE, None)
    }

    /// A missing `bitrate` falls back to the default for size and rate
    pub fn with_frame_rate(width: u32, height: u32, frame_rate: u32, bitrate: Option<u32>) -> Self {
        Self {
            width,
            height,
            bitrate: bitrate.unwrap_or_else(|| default_video_bitrate(width, height, frame_rate)),
            frame_rate,
        }
    }
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self::new(480, 640)
    }
}

/// Audio encoder parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioConfig {
    pub channels: u16,
    pub sample_rate: u32,
    pub bitrate: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            channels: 1,
            sample_rate: 44_100,
            bitrate: 96_000,
        }
    }
}

/// Where encoder threads report errors they cannot handle themselves
pub type FailureSink = Arc<dyn Fn(CaptureError) + Send + Sync>;

/// Counters shared between an encoder's producer, its drain side and callers
#[derive(Debug, Default)]
pub struct EncoderStats {
    pub(crate) frames_submitted: AtomicU64,
    pub(crate) samples_written: AtomicU64,
    pub(crate) dropped_before_start: AtomicU64,
    pub(crate) input_dropped: AtomicU64,
    pub(crate) last_submitted_pts_us: AtomicU64,
}

impl EncoderStats {
    /// Rendered frames or captured PCM buffers handed to the codec
    pub fn frames_submitted(&self) -> u64 {
        self.frames_submitted.load(Ordering::Relaxed)
    }

    pub fn samples_written(&self) -> u64 {
        self.samples_written.load(Ordering::Relaxed)
    }

    /// Encoded samples discarded because the muxer never started or the
    /// start backlog was full
    pub fn dropped_before_start(&self) -> u64 {
        self.dropped_before_start.load(Ordering::Relaxed)
    }

    /// Input buffers discarded because the codec could not keep up
    pub fn input_dropped(&self) -> u64 {
        self.input_dropped.load(Ordering::Relaxed)
    }

    pub fn last_submitted_pts_us(&self) -> u64 {
        self.last_submitted_pts_us.load(Ordering::Relaxed)
    }

    pub(crate) fn record_submitted(&self, pts_us: u64) {
        self.frames_submitted.fetch_add(1, Ordering::Relaxed);
        self.last_submitted_pts_us.store(pts_us, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_bitrate_formula() {
        assert_eq!(default_video_bitrate(480, 640, 30), 921_600);
        assert_eq!(VideoConfig::new(1280, 720).bitrate, 2_764_800);
    }

    #[test]
    fn test_defaults_match_portrait_capture() {
        let video = VideoConfig::default();
        assert_eq!((video.width, video.height, video.frame_rate), (480, 640, 30));
        let audio = AudioConfig::default();
        assert_eq!((audio.channels, audio.sample_rate, audio.bitrate), (1, 44_100, 96_000));
    }
}
