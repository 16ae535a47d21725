//! Codec output to muxer plumbing shared by both encoders
//!
//! Registers the track when the codec-config packet shows up, rebases PTS so
//! the first sample of the segment is at zero, and holds samples back while
//! the muxer is still waiting for the other track.

use super::EncoderStats;
use super::FailureSink;
use crate::muxer::{Muxer, MuxerState, SampleFlags, TrackFormat, TrackId, TrackKind};
use crate::utils::error::{CaptureError, CaptureResult};
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::codec::CodecPacket;

pub(crate) struct MuxerFeed {
    kind: TrackKind,
    muxer: Arc<Muxer>,
    track: Option<TrackId>,
    origin_us: Option<u64>,
    last_pts_us: u64,
    backlog: VecDeque<(Bytes, u64, SampleFlags)>,
    backlog_limit: usize,
    stats: Arc<EncoderStats>,
    on_failure: FailureSink,
    reported: bool,
}

impl MuxerFeed {
    pub(crate) fn new(
        kind: TrackKind,
        muxer: Arc<Muxer>,
        backlog_limit: usize,
        stats: Arc<EncoderStats>,
        on_failure: FailureSink,
    ) -> Self {
        Self {
            kind,
            muxer,
            track: None,
            origin_us: None,
            last_pts_us: 0,
            backlog: VecDeque::new(),
            backlog_limit,
            stats,
            on_failure,
            reported: false,
        }
    }

    pub(crate) fn ordinal(&self) -> u32 {
        self.muxer.ordinal()
    }

    /// Register the track from the codec-config packet and start the muxer
    /// if the other track is already there.
    pub(crate) fn register(&mut self, format: TrackFormat) -> CaptureResult<()> {
        if self.track.is_some() {
            tracing::warn!("Ignoring repeated {:?} codec config", self.kind);
            return Ok(());
        }
        let id = self.muxer.add_track(format)?;
        self.track = Some(id);
        tracing::debug!(
            "Segment {}: {:?} track registered as {}",
            self.muxer.ordinal(),
            self.kind,
            id
        );

        if let Err(e) = self.muxer.start_if_ready() {
            self.report(e);
        }
        Ok(())
    }

    /// Forward one media packet, or hold it until the muxer starts
    pub(crate) fn forward(&mut self, packet: CodecPacket) {
        if self.muxer.state() == MuxerState::Finished {
            return;
        }

        let origin = *self.origin_us.get_or_insert(packet.pts_us);
        let pts = packet.pts_us.saturating_sub(origin).max(self.last_pts_us);
        self.last_pts_us = pts;

        let Some(track) = self.track.filter(|_| self.muxer.is_muxing()) else {
            if self.backlog.len() < self.backlog_limit {
                self.backlog.push_back((packet.bytes, pts, packet.flags));
            } else {
                self.stats.dropped_before_start.fetch_add(1, Ordering::Relaxed);
            }
            return;
        };

        self.flush_backlog(track);
        self.write(track, packet.bytes, pts, packet.flags);
    }

    fn flush_backlog(&mut self, track: TrackId) {
        while let Some((bytes, pts, flags)) = self.backlog.pop_front() {
            self.write(track, bytes, pts, flags);
        }
    }

    fn write(&mut self, track: TrackId, bytes: Bytes, pts_us: u64, flags: SampleFlags) {
        match self.muxer.write_sample(track, bytes, pts_us, flags) {
            Ok(()) => {
                self.stats.samples_written.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => self.report(e),
        }
    }

    /// Hand end of stream to the muxer, or give up on the track if the
    /// codec never produced its config.
    pub(crate) fn finish(&mut self) {
        match self.track {
            Some(track) if self.muxer.is_muxing() => self.flush_backlog(track),
            _ => {
                if !self.backlog.is_empty() {
                    tracing::warn!(
                        "Segment {}: dropping {} {:?} samples, muxer never started",
                        self.muxer.ordinal(),
                        self.backlog.len(),
                        self.kind
                    );
                }
                self.stats
                    .dropped_before_start
                    .fetch_add(self.backlog.len() as u64, Ordering::Relaxed);
                self.backlog.clear();
            }
        }

        let result = match self.track {
            Some(track) => self.muxer.signal_end_of_stream(track),
            None => self.muxer.abandon_track(self.kind),
        };
        if let Err(e) = result {
            tracing::debug!("{:?} end of stream not delivered: {}", self.kind, e);
        }
    }

    /// Pass an error to the coordinator, once per segment. Errors after the
    /// segment already finished (aborted) are only logged.
    pub(crate) fn report(&mut self, error: CaptureError) {
        if self.muxer.state() == MuxerState::Finished {
            tracing::debug!("{:?} error after segment finished: {}", self.kind, error);
            return;
        }
        if self.reported {
            return;
        }
        self.reported = true;
        tracing::error!(
            "{:?} encoder error in segment {}: {}",
            self.kind,
            self.muxer.ordinal(),
            error
        );
        (self.on_failure)(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::muxer::{AudioTrackFormat, CompletionBus, Mp4Container};

    fn audio_format() -> TrackFormat {
        TrackFormat::Audio(AudioTrackFormat {
            sample_rate: 44_100,
            channels: 1,
            bitrate: 96_000,
            frame_size: 1024,
        })
    }

    fn packet(pts_us: u64) -> CodecPacket {
        CodecPacket {
            bytes: Bytes::from_static(&[1, 2, 3]),
            pts_us,
            flags: SampleFlags::KEYFRAME,
        }
    }

    #[test]
    fn test_backlog_is_bounded_and_keeps_the_head() {
        let muxer = Arc::new(Muxer::new(
            0,
            "unused.mp4",
            &[TrackKind::Video, TrackKind::Audio],
            Arc::new(Mp4Container),
            CompletionBus::new(),
        ));
        let stats = Arc::new(EncoderStats::default());
        let mut feed = MuxerFeed::new(
            TrackKind::Audio,
            muxer.clone(),
            2,
            stats.clone(),
            Arc::new(|e: CaptureError| panic!("unexpected: {}", e)),
        );
        feed.register(audio_format()).unwrap();

        for pts in [1_000, 2_000, 3_000] {
            feed.forward(packet(pts));
        }
        assert_eq!(stats.dropped_before_start(), 1);
        assert_eq!(feed.backlog.front().map(|s| s.1), Some(0));
        assert_eq!(feed.backlog.back().map(|s| s.1), Some(1_000));

        feed.finish();
        assert_eq!(stats.dropped_before_start(), 3);
        assert_eq!(muxer.state(), MuxerState::AwaitingTracks);
    }

    #[test]
    fn test_errors_reported_once() {
        let muxer = Arc::new(Muxer::new(
            0,
            "unused.mp4",
            &[TrackKind::Audio],
            Arc::new(Mp4Container),
            CompletionBus::new(),
        ));
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let c = count.clone();
        let mut feed = MuxerFeed::new(
            TrackKind::Audio,
            muxer,
            4,
            Arc::new(EncoderStats::default()),
            Arc::new(move |_e: CaptureError| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );

        feed.report(CaptureError::Codec("first".to_string()));
        feed.report(CaptureError::Codec("second".to_string()));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
