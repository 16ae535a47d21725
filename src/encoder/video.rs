//! Video encoder
//!
//! Owns the codec for one segment and a drain thread that moves codec output
//! into the muxer. The renderer only sees an [`EncoderInput`].

use super::codec::{video_track_format, CodecFactory, CodecOutput, VideoCodec};
use super::feed::MuxerFeed;
use super::{EncoderStats, FailureSink, VideoConfig};
use crate::muxer::{Muxer, TrackKind};
use crate::render::gpu::RenderSurface;
use crate::utils::error::{CaptureError, CaptureResult};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Frames held while the muxer waits for the audio track (about 3 s)
const BACKLOG_LIMIT: usize = 90;

const DRAIN_TIMEOUT: Duration = Duration::from_millis(10);

/// What the renderer needs to record: the surface and a frame notifier
#[derive(Clone)]
pub struct EncoderInput {
    surface: Arc<dyn RenderSurface>,
    stats: Arc<EncoderStats>,
}

impl EncoderInput {
    pub fn surface(&self) -> &Arc<dyn RenderSurface> {
        &self.surface
    }

    /// Called after each swap into the encoder surface
    pub fn frame_available(&self, pts_us: u64) {
        self.stats.record_submitted(pts_us);
    }
}

impl std::fmt::Debug for EncoderInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncoderInput")
            .field("size", &self.surface.size())
            .finish()
    }
}

/// Drain-side state, owned by the drain thread
struct VideoDrain {
    codec: Arc<dyn VideoCodec>,
    config: VideoConfig,
    feed: MuxerFeed,
}

impl VideoDrain {
    /// Move every available packet to the muxer. With `block` the first
    /// poll waits briefly for output. Returns `true` once end of stream has
    /// been passed on.
    fn drain(&mut self, block: bool) -> CaptureResult<bool> {
        let timeout = if block { DRAIN_TIMEOUT } else { Duration::ZERO };
        loop {
            match self.codec.dequeue_output(timeout)? {
                CodecOutput::TryAgainLater => return Ok(false),
                CodecOutput::EndOfStream => {
                    self.feed.finish();
                    return Ok(true);
                }
                CodecOutput::Packet(packet) if packet.flags.codec_config => {
                    let format = video_track_format(&self.config, &packet.bytes)?;
                    self.feed.register(format)?;
                }
                CodecOutput::Packet(packet) => self.feed.forward(packet),
            }
        }
    }

    /// Codec failure: report, then still close the track so the muxer can
    /// finish.
    fn fail(&mut self, error: CaptureError) {
        self.feed.report(error);
        self.feed.finish();
    }
}

/// Per-segment video encoder
pub struct VideoEncoder {
    ordinal: u32,
    codec: Arc<dyn VideoCodec>,
    input: EncoderInput,
    drain_thread: Option<JoinHandle<()>>,
}

impl VideoEncoder {
    /// Configure and start a codec and launch its drain thread
    pub fn new(
        config: &VideoConfig,
        codecs: &dyn CodecFactory,
        muxer: Arc<Muxer>,
        on_failure: FailureSink,
    ) -> CaptureResult<Self> {
        let ordinal = muxer.ordinal();
        let codec = codecs.create_video(config)?;
        let stats = Arc::new(EncoderStats::default());
        let input = EncoderInput {
            surface: codec.input_surface(),
            stats: stats.clone(),
        };

        let mut drain = VideoDrain {
            codec: codec.clone(),
            config: config.clone(),
            feed: MuxerFeed::new(TrackKind::Video, muxer, BACKLOG_LIMIT, stats, on_failure),
        };
        let drain_thread = std::thread::Builder::new()
            .name(format!("video-drain-{}", ordinal))
            .spawn(move || loop {
                match drain.drain(true) {
                    Ok(true) => break,
                    Ok(false) => {}
                    Err(e) => {
                        drain.fail(e);
                        break;
                    }
                }
            })?;

        tracing::info!(
            "Video encoder for segment {}: {}x{} @ {}fps, {} bps",
            ordinal,
            config.width,
            config.height,
            config.frame_rate,
            config.bitrate
        );

        Ok(Self {
            ordinal,
            codec,
            input,
            drain_thread: Some(drain_thread),
        })
    }

    pub fn input(&self) -> EncoderInput {
        self.input.clone()
    }

    pub fn input_surface(&self) -> Arc<dyn RenderSurface> {
        self.input.surface.clone()
    }

    pub fn frame_available(&self, pts_us: u64) {
        self.input.frame_available(pts_us);
    }

    pub fn stats(&self) -> Arc<EncoderStats> {
        self.input.stats.clone()
    }

    /// End input, wait for the drain thread to pass end of stream to the
    /// muxer, then release the codec and its surface.
    pub fn stop(&mut self) -> CaptureResult<()> {
        let Some(handle) = self.drain_thread.take() else {
            return Ok(());
        };
        let eos = self.codec.signal_end_of_input();
        if handle.join().is_err() {
            tracing::error!("Video drain thread for segment {} panicked", self.ordinal);
        }
        self.codec.release();
        tracing::debug!(
            "Video encoder for segment {} stopped: {} frames in, {} samples out",
            self.ordinal,
            self.input.stats.frames_submitted(),
            self.input.stats.samples_written()
        );
        eos
    }
}

impl Drop for VideoEncoder {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::debug!("Video encoder dropped with error: {}", e);
        }
    }
}
