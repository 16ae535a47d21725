//! Software codecs
//!
//! Lightweight stand-ins for hardware encoders so the pipeline runs without
//! a media stack. Video frames are XOR-delta run-length coded behind AVC-style
//! NAL headers; audio is G.711 mu-law in 1024-sample frames. The bitstreams
//! are not meant for playback, only to exercise timing, framing and
//! container plumbing with realistic packet shapes.

use super::codec::{
    audio_specific_config, avc_config_packet, AudioCodec, CodecFactory, CodecOutput, CodecPacket,
    VideoCodec,
};
use super::{AudioConfig, VideoConfig};
use crate::muxer::SampleFlags;
use crate::render::gpu::{FrameBuffer, RenderSurface};
use crate::utils::error::{CaptureError, CaptureResult};
use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Frames the input surface buffers before a swap blocks
const VIDEO_INPUT_FRAMES: usize = 4;

/// PCM buffers the audio codec accepts before `queue_input` waits
const AUDIO_INPUT_BUFFERS: usize = 4;

const NAL_IDR: u8 = 0x65;
const NAL_SLICE: u8 = 0x41;

/// Run-length code as (count, value) pairs
pub fn rle_encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() / 8 + 2);
    let mut iter = data.iter().copied().peekable();
    while let Some(value) = iter.next() {
        let mut run: u8 = 1;
        while run < u8::MAX && iter.peek() == Some(&value) {
            iter.next();
            run += 1;
        }
        out.push(run);
        out.push(value);
    }
    out
}

/// G.711 mu-law companding of one sample
pub fn linear_to_ulaw(sample: i16) -> u8 {
    const BIAS: i32 = 0x84;
    const CLIP: i32 = 32_635;

    let mut s = sample as i32;
    let sign = if s < 0 {
        s = -s;
        0x80
    } else {
        0
    };
    s = s.min(CLIP) + BIAS;

    let mut exponent = 7;
    let mut mask = 0x4000;
    while exponent > 0 && (s & mask) == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = (s >> (exponent + 3)) & 0x0f;
    !(sign | (exponent << 4) | mantissa) as u8
}

struct RawFrame {
    pixels: Vec<u8>,
    pts_ns: u64,
}

#[derive(Default)]
struct VideoQueue {
    frames: VecDeque<RawFrame>,
    end_of_input: bool,
    released: bool,
    config_sent: bool,
}

#[derive(Default)]
struct VideoShared {
    queue: Mutex<VideoQueue>,
    frame_ready: Condvar,
    space_ready: Condvar,
}

/// Encoder input surface: each swap queues one frame
struct CodecInputSurface {
    width: u32,
    height: u32,
    next_pts_ns: AtomicU64,
    shared: Arc<VideoShared>,
}

impl RenderSurface for CodecInputSurface {
    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn set_presentation_time(&self, timestamp_ns: u64) {
        self.next_pts_ns.store(timestamp_ns, Ordering::Release);
    }

    fn swap_buffers(&self, frame: &FrameBuffer) -> CaptureResult<()> {
        if frame.width != self.width || frame.height != self.height {
            return Err(CaptureError::InvalidState(format!(
                "swap of {}x{} into {}x{} encoder surface",
                frame.width, frame.height, self.width, self.height
            )));
        }

        let mut queue = self.shared.queue.lock();
        while queue.frames.len() >= VIDEO_INPUT_FRAMES && !queue.released && !queue.end_of_input {
            self.shared
                .space_ready
                .wait_for(&mut queue, Duration::from_millis(50));
        }
        if queue.released || queue.end_of_input {
            return Err(CaptureError::InvalidState(
                "encoder surface no longer accepts frames".to_string(),
            ));
        }
        queue.frames.push_back(RawFrame {
            pixels: frame.pixels.clone(),
            pts_ns: self.next_pts_ns.load(Ordering::Acquire),
        });
        self.shared.frame_ready.notify_one();
        Ok(())
    }

    fn release(&self) {
        let mut queue = self.shared.queue.lock();
        queue.released = true;
        queue.frames.clear();
        self.shared.frame_ready.notify_all();
        self.shared.space_ready.notify_all();
    }
}

/// State touched only by the draining thread
#[derive(Default)]
struct VideoBitstream {
    frame_index: u64,
    reference: Option<Vec<u8>>,
}

/// Software video encoder fed through an input surface
pub struct SoftVideoCodec {
    config: VideoConfig,
    shared: Arc<VideoShared>,
    surface: Arc<CodecInputSurface>,
    bitstream: Mutex<VideoBitstream>,
}

impl SoftVideoCodec {
    pub fn new(config: &VideoConfig) -> Self {
        let shared = Arc::new(VideoShared::default());
        let surface = Arc::new(CodecInputSurface {
            width: config.width,
            height: config.height,
            next_pts_ns: AtomicU64::new(0),
            shared: shared.clone(),
        });
        tracing::debug!(
            "Soft video codec {}x{} @ {}fps, {} bps",
            config.width,
            config.height,
            config.frame_rate,
            config.bitrate
        );
        Self {
            config: config.clone(),
            shared,
            surface,
            bitstream: Mutex::new(VideoBitstream::default()),
        }
    }

    fn sps(&self) -> Vec<u8> {
        let w = (self.config.width as u16).to_be_bytes();
        let h = (self.config.height as u16).to_be_bytes();
        // Baseline profile, level 3.0
        vec![0x67, 0x42, 0x00, 0x1e, w[0], w[1], h[0], h[1]]
    }

    fn encode(&self, frame: RawFrame) -> CodecPacket {
        let mut bitstream = self.bitstream.lock();
        let gop = self.config.frame_rate.max(1) as u64;
        let keyframe = bitstream.frame_index % gop == 0 || bitstream.reference.is_none();

        let body = match (&bitstream.reference, keyframe) {
            (Some(reference), false) => {
                let delta: Vec<u8> = frame
                    .pixels
                    .iter()
                    .zip(reference.iter())
                    .map(|(a, b)| a ^ b)
                    .collect();
                rle_encode(&delta)
            }
            _ => rle_encode(&frame.pixels),
        };

        let nal_len = (body.len() + 1) as u32;
        let mut out = Vec::with_capacity(body.len() + 5);
        out.extend_from_slice(&nal_len.to_be_bytes());
        out.push(if keyframe { NAL_IDR } else { NAL_SLICE });
        out.extend_from_slice(&body);

        bitstream.frame_index += 1;
        bitstream.reference = Some(frame.pixels);

        CodecPacket {
            bytes: Bytes::from(out),
            pts_us: frame.pts_ns / 1_000,
            flags: if keyframe {
                SampleFlags::KEYFRAME
            } else {
                SampleFlags::NONE
            },
        }
    }
}

impl VideoCodec for SoftVideoCodec {
    fn input_surface(&self) -> Arc<dyn RenderSurface> {
        self.surface.clone()
    }

    fn dequeue_output(&self, timeout: Duration) -> CaptureResult<CodecOutput> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.shared.queue.lock();
        if queue.released {
            return Err(CaptureError::Codec("video codec released".to_string()));
        }
        if !queue.config_sent {
            queue.config_sent = true;
            return Ok(CodecOutput::Packet(CodecPacket {
                bytes: avc_config_packet(&self.sps(), &[0x68, 0xce, 0x38, 0x80]),
                pts_us: 0,
                flags: SampleFlags::CODEC_CONFIG,
            }));
        }

        loop {
            if let Some(frame) = queue.frames.pop_front() {
                self.shared.space_ready.notify_one();
                drop(queue);
                return Ok(CodecOutput::Packet(self.encode(frame)));
            }
            if queue.end_of_input {
                return Ok(CodecOutput::EndOfStream);
            }
            if queue.released {
                return Err(CaptureError::Codec("video codec released".to_string()));
            }
            if self
                .shared
                .frame_ready
                .wait_until(&mut queue, deadline)
                .timed_out()
                && queue.frames.is_empty()
                && !queue.end_of_input
            {
                return Ok(CodecOutput::TryAgainLater);
            }
        }
    }

    fn signal_end_of_input(&self) -> CaptureResult<()> {
        let mut queue = self.shared.queue.lock();
        if queue.released {
            return Err(CaptureError::Codec("video codec released".to_string()));
        }
        queue.end_of_input = true;
        self.shared.frame_ready.notify_all();
        self.shared.space_ready.notify_all();
        Ok(())
    }

    fn release(&self) {
        self.surface.release();
    }
}

struct PcmBuffer {
    samples: Vec<i16>,
    pts_us: u64,
}

#[derive(Default)]
struct AudioQueue {
    input: VecDeque<PcmBuffer>,
    end_of_input: bool,
    released: bool,
    config_sent: bool,
}

/// Software mu-law audio encoder
pub struct SoftAudioCodec {
    asc: [u8; 2],
    capacity: usize,
    queue: Mutex<AudioQueue>,
    input_ready: Condvar,
    space_ready: Condvar,
}

impl SoftAudioCodec {
    pub fn new(config: &AudioConfig) -> CaptureResult<Self> {
        Self::with_capacity(config, AUDIO_INPUT_BUFFERS)
    }

    /// Codec whose input queue holds `capacity` buffers
    pub fn with_capacity(config: &AudioConfig, capacity: usize) -> CaptureResult<Self> {
        Ok(Self {
            asc: audio_specific_config(config.sample_rate, config.channels)?,
            capacity: capacity.max(1),
            queue: Mutex::new(AudioQueue::default()),
            input_ready: Condvar::new(),
            space_ready: Condvar::new(),
        })
    }
}

impl AudioCodec for SoftAudioCodec {
    fn queue_input(&self, pcm: &[i16], pts_us: u64, timeout: Duration) -> CaptureResult<bool> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.queue.lock();
        while queue.input.len() >= self.capacity {
            if queue.released {
                break;
            }
            if self.space_ready.wait_until(&mut queue, deadline).timed_out()
                && queue.input.len() >= self.capacity
            {
                return Ok(false);
            }
        }
        if queue.released {
            return Err(CaptureError::Codec("audio codec released".to_string()));
        }
        if queue.end_of_input {
            return Err(CaptureError::InvalidState(
                "audio input after end of stream".to_string(),
            ));
        }
        queue.input.push_back(PcmBuffer {
            samples: pcm.to_vec(),
            pts_us,
        });
        self.input_ready.notify_one();
        Ok(true)
    }

    fn dequeue_output(&self, timeout: Duration) -> CaptureResult<CodecOutput> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.queue.lock();
        if queue.released {
            return Err(CaptureError::Codec("audio codec released".to_string()));
        }
        if !queue.config_sent {
            queue.config_sent = true;
            return Ok(CodecOutput::Packet(CodecPacket {
                bytes: Bytes::copy_from_slice(&self.asc),
                pts_us: 0,
                flags: SampleFlags::CODEC_CONFIG,
            }));
        }

        loop {
            if let Some(buffer) = queue.input.pop_front() {
                self.space_ready.notify_one();
                drop(queue);
                let encoded: Vec<u8> = buffer.samples.iter().map(|s| linear_to_ulaw(*s)).collect();
                return Ok(CodecOutput::Packet(CodecPacket {
                    bytes: Bytes::from(encoded),
                    pts_us: buffer.pts_us,
                    flags: SampleFlags::KEYFRAME,
                }));
            }
            if queue.end_of_input {
                return Ok(CodecOutput::EndOfStream);
            }
            if self.input_ready.wait_until(&mut queue, deadline).timed_out()
                && queue.input.is_empty()
                && !queue.end_of_input
            {
                return Ok(CodecOutput::TryAgainLater);
            }
        }
    }

    fn signal_end_of_input(&self) -> CaptureResult<()> {
        let mut queue = self.queue.lock();
        queue.end_of_input = true;
        self.input_ready.notify_all();
        Ok(())
    }

    fn release(&self) {
        let mut queue = self.queue.lock();
        queue.released = true;
        queue.input.clear();
        self.input_ready.notify_all();
        self.space_ready.notify_all();
    }
}

/// Factory for the software codecs
#[derive(Debug, Clone, Copy, Default)]
pub struct SoftCodecFactory;

impl CodecFactory for SoftCodecFactory {
    fn create_video(&self, config: &VideoConfig) -> CaptureResult<Arc<dyn VideoCodec>> {
        if config.width == 0 || config.height == 0 || config.width > u16::MAX as u32 || config.height > u16::MAX as u32 {
            return Err(CaptureError::Codec(format!(
                "unsupported video size {}x{}",
                config.width, config.height
            )));
        }
        Ok(Arc::new(SoftVideoCodec::new(config)))
    }

    fn create_audio(&self, config: &AudioConfig) -> CaptureResult<Arc<dyn AudioCodec>> {
        Ok(Arc::new(SoftAudioCodec::new(config)?))
    }
}
