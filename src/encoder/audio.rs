//! Audio encoder
//!
//! Lives for the whole session. Each segment calls [`AudioEncoder::reset`]
//! with the new muxer, then `start_recording`/`stop_recording`. Capture,
//! encode and drain all happen on one thread per segment.

use super::codec::{audio_track_format, AudioCodec, CodecFactory, CodecOutput};
use super::feed::MuxerFeed;
use super::{AudioConfig, EncoderStats, FailureSink, AUDIO_FRAME_SIZE};
use crate::capture::traits::{Microphone, MicrophoneSource};
use crate::muxer::{Muxer, TrackKind};
use crate::utils::clock;
use crate::utils::error::{CaptureError, CaptureResult};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// PCM buffers held while the codec is busy
const PCM_BACKLOG: usize = 8;

/// How long one buffer may wait for codec input space
const QUEUE_TIMEOUT: Duration = Duration::from_millis(20);

/// Upper bound on draining the codec after end of input
const EOS_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

const DRAIN_POLL: Duration = Duration::from_millis(10);

/// Encoded samples held while the muxer waits for the video track
const SAMPLE_BACKLOG: usize = 256;

struct AudioSegment {
    codec: Arc<dyn AudioCodec>,
    muxer: Arc<Muxer>,
    on_failure: FailureSink,
    stats: Arc<EncoderStats>,
}

struct AudioWorker {
    running: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

/// Session-long audio encoder
pub struct AudioEncoder {
    config: AudioConfig,
    microphones: Arc<dyn MicrophoneSource>,
    codecs: Arc<dyn CodecFactory>,
    segment: Option<AudioSegment>,
    worker: Option<AudioWorker>,
}

impl AudioEncoder {
    pub fn new(
        config: AudioConfig,
        microphones: Arc<dyn MicrophoneSource>,
        codecs: Arc<dyn CodecFactory>,
    ) -> Self {
        Self {
            config,
            microphones,
            codecs,
            segment: None,
            worker: None,
        }
    }

    pub fn config(&self) -> &AudioConfig {
        &self.config
    }

    pub fn is_recording(&self) -> bool {
        self.worker.is_some()
    }

    /// Counters for the current (or last) segment
    pub fn stats(&self) -> Option<Arc<EncoderStats>> {
        self.segment.as_ref().map(|s| s.stats.clone())
    }

    /// Prepare for a new segment: release the old codec and create a fresh
    /// one bound to `muxer`.
    pub fn reset(
        &mut self,
        config: &AudioConfig,
        muxer: Arc<Muxer>,
        on_failure: FailureSink,
    ) -> CaptureResult<()> {
        if self.is_recording() {
            return Err(CaptureError::InvalidState(
                "cannot reset audio encoder while recording".to_string(),
            ));
        }
        if let Some(previous) = self.segment.take() {
            previous.codec.release();
        }

        let codec = self.codecs.create_audio(config)?;
        self.config = config.clone();
        self.segment = Some(AudioSegment {
            codec,
            muxer,
            on_failure,
            stats: Arc::new(EncoderStats::default()),
        });
        Ok(())
    }

    /// Open the microphone and start the capture thread
    pub fn start_recording(&mut self) -> CaptureResult<()> {
        if self.is_recording() {
            return Err(CaptureError::InvalidState("audio already recording".to_string()));
        }
        let segment = self.segment.as_ref().ok_or_else(|| {
            CaptureError::InvalidState("audio encoder has no segment".to_string())
        })?;

        let microphone = self
            .microphones
            .open(self.config.sample_rate, self.config.channels)?;

        let running = Arc::new(AtomicBool::new(true));
        let ordinal = segment.muxer.ordinal();
        let capture = AudioCapture {
            microphone,
            codec: segment.codec.clone(),
            channels: self.config.channels.max(1) as usize,
            running: running.clone(),
            pending: VecDeque::new(),
            origin_us: None,
            last_pts_us: 0,
            stats: segment.stats.clone(),
            feed: MuxerFeed::new(
                TrackKind::Audio,
                segment.muxer.clone(),
                SAMPLE_BACKLOG,
                segment.stats.clone(),
                segment.on_failure.clone(),
            ),
            config: self.config.clone(),
        };

        let thread = std::thread::Builder::new()
            .name(format!("audio-encoder-{}", ordinal))
            .spawn(move || capture.run())?;

        tracing::info!(
            "Audio encoder for segment {}: {} Hz, {} ch, {} bps",
            ordinal,
            self.config.sample_rate,
            self.config.channels,
            self.config.bitrate
        );
        self.worker = Some(AudioWorker { running, thread });
        Ok(())
    }

    /// Stop capturing and wait until end of stream reached the muxer
    pub fn stop_recording(&mut self) -> CaptureResult<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        worker.running.store(false, Ordering::Release);
        if worker.thread.join().is_err() {
            tracing::error!("Audio encoder thread panicked");
        }
        if let Some(stats) = self.stats() {
            tracing::debug!(
                "Audio encoder stopped: {} buffers in, {} samples out, {} dropped",
                stats.frames_submitted(),
                stats.samples_written(),
                stats.input_dropped()
            );
        }
        Ok(())
    }
}

impl Drop for AudioEncoder {
    fn drop(&mut self) {
        let _ = self.stop_recording();
        if let Some(segment) = self.segment.take() {
            segment.codec.release();
        }
    }
}

/// Capture-thread state
struct AudioCapture {
    microphone: Box<dyn Microphone>,
    codec: Arc<dyn AudioCodec>,
    config: AudioConfig,
    channels: usize,
    running: Arc<AtomicBool>,
    pending: VecDeque<(Vec<i16>, u64)>,
    origin_us: Option<u64>,
    last_pts_us: u64,
    stats: Arc<EncoderStats>,
    feed: MuxerFeed,
}

impl AudioCapture {
    fn run(mut self) {
        let mut buf = vec![0i16; AUDIO_FRAME_SIZE * self.channels];

        while self.running.load(Ordering::Acquire) {
            match self.microphone.read(&mut buf) {
                Ok(0) => {}
                Ok(n) => self.enqueue(buf[..n].to_vec()),
                Err(e) => {
                    self.feed.report(e);
                    break;
                }
            }
            let step = self.feed_codec().and_then(|_| self.drain(Duration::ZERO));
            if let Err(e) = step {
                self.feed.report(e);
                break;
            }
        }

        self.finish();
        self.microphone.close();
    }

    /// Timestamp a captured buffer and queue it for the codec. When the
    /// backlog is full the oldest buffer goes.
    fn enqueue(&mut self, pcm: Vec<i16>) {
        let now = clock::monotonic_us();
        let origin = *self.origin_us.get_or_insert(now);
        let pts = (now - origin).max(self.last_pts_us);
        self.last_pts_us = pts;

        self.pending.push_back((pcm, pts));
        if self.pending.len() > PCM_BACKLOG {
            self.pending.pop_front();
            self.drop_input();
        }
    }

    fn drop_input(&self) {
        let dropped = self.stats.input_dropped.fetch_add(1, Ordering::Relaxed) + 1;
        if dropped == 1 || dropped % 50 == 0 {
            tracing::warn!(
                "Segment {}: audio codec behind, {} buffers dropped",
                self.feed.ordinal(),
                dropped
            );
        }
    }

    /// Hand queued PCM to the codec. A buffer the codec will not take within
    /// the timeout is dropped.
    fn feed_codec(&mut self) -> CaptureResult<()> {
        while let Some((pcm, pts)) = self.pending.front() {
            let accepted = self.codec.queue_input(pcm, *pts, QUEUE_TIMEOUT)?;
            let pts = *pts;
            self.pending.pop_front();
            if accepted {
                self.stats.record_submitted(pts);
            } else {
                self.drop_input();
                break;
            }
        }
        Ok(())
    }

    /// Move codec output to the muxer. Returns `true` at end of stream.
    fn drain(&mut self, timeout: Duration) -> CaptureResult<bool> {
        loop {
            match self.codec.dequeue_output(timeout)? {
                CodecOutput::TryAgainLater => return Ok(false),
                CodecOutput::EndOfStream => return Ok(true),
                CodecOutput::Packet(packet) if packet.flags.codec_config => {
                    let format = audio_track_format(&self.config, &packet.bytes)?;
                    self.feed.register(format)?;
                }
                CodecOutput::Packet(packet) => self.feed.forward(packet),
            }
        }
    }

    fn finish(&mut self) {
        if let Err(e) = self.flush_to_eos() {
            self.feed.report(e);
        }
        self.feed.finish();
    }

    fn flush_to_eos(&mut self) -> CaptureResult<()> {
        let deadline = Instant::now() + EOS_DRAIN_TIMEOUT;
        while !self.pending.is_empty() {
            self.feed_codec()?;
            self.drain(Duration::ZERO)?;
            if Instant::now() >= deadline {
                break;
            }
        }
        self.codec.signal_end_of_input()?;

        while Instant::now() < deadline {
            if self.drain(DRAIN_POLL)? {
                return Ok(());
            }
        }
        tracing::warn!(
            "Segment {}: audio codec did not reach end of stream in time",
            self.feed.ordinal()
        );
        Ok(())
    }
}
