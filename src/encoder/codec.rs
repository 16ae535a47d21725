//! Codec abstraction
//!
//! Video codecs are fed through an input surface the renderer draws into;
//! audio codecs take PCM buffers. Both hand back compressed packets, the
//! first of which is always the codec-config packet.

use super::{AudioConfig, VideoConfig};
use crate::muxer::mpeg4::{sample_rate_for_index, sample_rate_index};
use crate::muxer::{AudioTrackFormat, SampleFlags, TrackFormat, VideoTrackFormat};
use crate::render::gpu::RenderSurface;
use crate::utils::error::{CaptureError, CaptureResult};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

/// AAC-LC audio object type
const AUDIO_OBJECT_TYPE: u8 = 2;

const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// One unit of codec output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecPacket {
    pub bytes: Bytes,
    /// Presentation time as reported by the codec
    pub pts_us: u64,
    pub flags: SampleFlags,
}

/// Result of polling a codec for output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecOutput {
    Packet(CodecPacket),
    /// Nothing ready within the timeout
    TryAgainLater,
    /// Input ended and every packet has been handed out
    EndOfStream,
}

pub trait VideoCodec: Send + Sync {
    /// Surface whose swaps become codec input frames
    fn input_surface(&self) -> Arc<dyn RenderSurface>;

    fn dequeue_output(&self, timeout: Duration) -> CaptureResult<CodecOutput>;

    fn signal_end_of_input(&self) -> CaptureResult<()>;

    fn release(&self);
}

pub trait AudioCodec: Send + Sync {
    /// Offer one PCM buffer. Waits up to `timeout` for room and returns
    /// `false` if the input queue stayed full.
    fn queue_input(&self, pcm: &[i16], pts_us: u64, timeout: Duration) -> CaptureResult<bool>;

    fn dequeue_output(&self, timeout: Duration) -> CaptureResult<CodecOutput>;

    fn signal_end_of_input(&self) -> CaptureResult<()>;

    fn release(&self);
}

/// Creates a codec pair for each segment
pub trait CodecFactory: Send + Sync {
    fn create_video(&self, config: &VideoConfig) -> CaptureResult<Arc<dyn VideoCodec>>;

    fn create_audio(&self, config: &AudioConfig) -> CaptureResult<Arc<dyn AudioCodec>>;
}

/// Annex-B codec-config payload carrying SPS then PPS
pub fn avc_config_packet(sps: &[u8], pps: &[u8]) -> Bytes {
    let mut out = Vec::with_capacity(sps.len() + pps.len() + 8);
    out.extend_from_slice(&START_CODE);
    out.extend_from_slice(sps);
    out.extend_from_slice(&START_CODE);
    out.extend_from_slice(pps);
    Bytes::from(out)
}

/// Build the video track format from a codec-config packet
pub fn video_track_format(config: &VideoConfig, packet: &[u8]) -> CaptureResult<TrackFormat> {
    let units: Vec<&[u8]> = split_annex_b(packet);
    let sps = units.iter().find(|u| u.first().map(|b| b & 0x1f) == Some(7));
    let pps = units.iter().find(|u| u.first().map(|b| b & 0x1f) == Some(8));
    let (Some(sps), Some(pps)) = (sps, pps) else {
        return Err(CaptureError::Codec(format!(
            "codec config without SPS/PPS ({} units)",
            units.len()
        )));
    };

    let width = u16::try_from(config.width)
        .map_err(|_| CaptureError::Codec(format!("width {} too large", config.width)))?;
    let height = u16::try_from(config.height)
        .map_err(|_| CaptureError::Codec(format!("height {} too large", config.height)))?;

    Ok(TrackFormat::Video(VideoTrackFormat {
        width,
        height,
        sps: sps.to_vec(),
        pps: pps.to_vec(),
    }))
}

fn split_annex_b(data: &[u8]) -> Vec<&[u8]> {
    let mut starts = Vec::new();
    let mut i = 0;
    while i + START_CODE.len() <= data.len() {
        if data[i..i + START_CODE.len()] == START_CODE {
            starts.push(i + START_CODE.len());
            i += START_CODE.len();
        } else {
            i += 1;
        }
    }

    starts
        .iter()
        .enumerate()
        .map(|(n, &start)| {
            let end = starts
                .get(n + 1)
                .map(|next| next - START_CODE.len())
                .unwrap_or(data.len());
            &data[start..end]
        })
        .filter(|unit| !unit.is_empty())
        .collect()
}

/// Two-byte AudioSpecificConfig
pub fn audio_specific_config(sample_rate: u32, channels: u16) -> CaptureResult<[u8; 2]> {
    let index = sample_rate_index(sample_rate)
        .ok_or_else(|| CaptureError::Codec(format!("unsupported sample rate {}", sample_rate)))?;
    if !(1..=2).contains(&channels) {
        return Err(CaptureError::Codec(format!("unsupported channel count {}", channels)));
    }
    Ok([
        (AUDIO_OBJECT_TYPE << 3) | (index >> 1),
        ((index & 1) << 7) | ((channels as u8) << 3),
    ])
}

/// Build the audio track format from a codec-config packet
pub fn audio_track_format(config: &AudioConfig, packet: &[u8]) -> CaptureResult<TrackFormat> {
    let [b0, b1] = match packet {
        [b0, b1, ..] => [*b0, *b1],
        _ => return Err(CaptureError::Codec("short AudioSpecificConfig".to_string())),
    };
    let index = ((b0 & 0x07) << 1) | (b1 >> 7);
    let channels = ((b1 >> 3) & 0x0f) as u16;
    let sample_rate = sample_rate_for_index(index)
        .ok_or_else(|| CaptureError::Codec(format!("bad frequency index {}", index)))?;

    Ok(TrackFormat::Audio(AudioTrackFormat {
        sample_rate,
        channels,
        bitrate: config.bitrate,
        frame_size: super::AUDIO_FRAME_SIZE as u32,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_video_format_from_config_packet() {
        let config = VideoConfig::new(640, 480);
        let packet = avc_config_packet(&[0x67, 0x42, 0x00, 0x1e], &[0x68, 0xce, 0x38, 0x80]);
        let format = video_track_format(&config, &packet).unwrap();
        assert_eq!(
            format,
            TrackFormat::Video(VideoTrackFormat {
                width: 640,
                height: 480,
                sps: vec![0x67, 0x42, 0x00, 0x1e],
                pps: vec![0x68, 0xce, 0x38, 0x80],
            })
        );
    }

    #[test]
    fn test_config_without_pps_is_rejected() {
        let config = VideoConfig::new(640, 480);
        let packet = [0, 0, 0, 1, 0x67, 0x42, 0x00, 0x1e];
        assert!(matches!(
            video_track_format(&config, &packet),
            Err(CaptureError::Codec(_))
        ));
    }

    #[test]
    fn test_audio_specific_config_round_trips_layout() {
        let asc = audio_specific_config(44_100, 1).unwrap();
        // AAC-LC, 44.1 kHz, mono
        assert_eq!(asc, [0x12, 0x08]);

        let format = audio_track_format(&AudioConfig::default(), &asc).unwrap();
        let TrackFormat::Audio(audio) = format else {
            panic!("expected audio format");
        };
        assert_eq!(audio.sample_rate, 44_100);
        assert_eq!(audio.channels, 1);
    }

    #[test]
    fn test_unsupported_audio_layouts() {
        assert!(audio_specific_config(44_000, 1).is_err());
        assert!(audio_specific_config(48_000, 6).is_err());
        assert!(audio_track_format(&AudioConfig::default(), &[0x12]).is_err());
    }
}
