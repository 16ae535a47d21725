//! Segment muxer
//!
//! A [`Muxer`] writes one segment file. It waits until every expected track
//! has registered its codec format, then accepts interleaved samples from the
//! encoder drain threads and closes the file once every track has signalled
//! end of stream. Completion is announced on a [`CompletionBus`].
//!
//! State machine: `AwaitingTracks -> Muxing -> Finished`, never backwards.

pub mod bus;
pub mod container;
pub mod mpeg4;

pub use bus::{CompletionBus, MuxerEvent, SegmentOutcome, SubscriptionId, TrackSummary};
pub use container::{
    AudioTrackFormat, ContainerFormat, ContainerReader, ContainerWriter, MediaSample, SampleFlags,
    TrackFormat, TrackKind, VideoTrackFormat,
};
pub use mpeg4::Mp4Container;

use crate::utils::error::{CaptureError, CaptureResult};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Dense per-muxer track identifier, assigned in registration order
pub type TrackId = u32;

/// Samples a single track may queue while waiting for the other track
/// before interleaving gives way and writes anyway.
const MAX_QUEUED_PER_TRACK: usize = 256;

/// Lifecycle of a muxer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MuxerState {
    AwaitingTracks,
    Muxing,
    Finished,
}

/// Sample held back until the next one tells us its duration
struct PendingSample {
    pts_us: u64,
    is_sync: bool,
    bytes: Bytes,
}

struct TrackSlot {
    format: TrackFormat,
    pending: Option<PendingSample>,
    ready: VecDeque<MediaSample>,
    last_pts: Option<u64>,
    last_delta: Option<u64>,
    eos: bool,
    written: u32,
    end_us: u64,
}

impl TrackSlot {
    fn new(format: TrackFormat) -> Self {
        Self {
            format,
            pending: None,
            ready: VecDeque::new(),
            last_pts: None,
            last_delta: None,
            eos: false,
            written: 0,
            end_us: 0,
        }
    }

    /// Move the pending sample to the ready queue, closing it at `next_pts`
    /// or with the best duration estimate at end of stream.
    fn settle_pending(&mut self, next_pts: Option<u64>) {
        if let Some(p) = self.pending.take() {
            let duration = match next_pts {
                Some(next) => next - p.pts_us,
                None => self
                    .last_delta
                    .unwrap_or_else(|| self.format.nominal_sample_duration_us()),
            };
            if next_pts.is_some() {
                self.last_delta = Some(duration);
            }
            self.ready.push_back(MediaSample {
                pts_us: p.pts_us,
                duration_us: duration,
                is_sync: p.is_sync,
                bytes: p.bytes,
            });
        }
    }

    fn summary(&self) -> TrackSummary {
        TrackSummary {
            kind: self.format.kind(),
            samples: self.written,
            duration_us: self.end_us,
        }
    }
}

struct MuxerInner {
    state: MuxerState,
    tracks: Vec<TrackSlot>,
    abandoned: Vec<TrackKind>,
    writer: Option<Box<dyn ContainerWriter>>,
    io_error: Option<String>,
    outcome: Option<SegmentOutcome>,
}

impl MuxerInner {
    fn registered(&self, kind: TrackKind) -> Option<usize> {
        self.tracks.iter().position(|t| t.format.kind() == kind)
    }

    fn all_registered(&self, expected: &[TrackKind]) -> bool {
        expected.iter().all(|k| self.registered(*k).is_some())
    }

    /// Every expected track has either ended or been given up on
    fn all_resolved(&self, expected: &[TrackKind]) -> bool {
        expected.iter().all(|k| {
            self.abandoned.contains(k)
                || self
                    .registered(*k)
                    .map(|i| self.tracks[i].eos)
                    .unwrap_or(false)
        })
    }

    fn open(&mut self, format: &dyn ContainerFormat, path: &Path) -> CaptureResult<()> {
        self.state = MuxerState::Muxing;
        let result = format.create(path).and_then(|mut writer| {
            for track in &self.tracks {
                writer.add_track(&track.format)?;
            }
            Ok(writer)
        });
        match result {
            Ok(writer) => {
                self.writer = Some(writer);
                Ok(())
            }
            Err(e) => {
                self.io_error = Some(e.to_string());
                Err(CaptureError::MuxerIo(e.to_string()))
            }
        }
    }

    /// Write ready samples in PTS order. Unless `drain_all` is set, stop as
    /// soon as a live track has nothing queued, since it could still deliver
    /// an earlier sample.
    fn flush_ready(&mut self, drain_all: bool) -> CaptureResult<()> {
        loop {
            let overfull = self.tracks.iter().any(|t| t.ready.len() > MAX_QUEUED_PER_TRACK);
            let starved = self.tracks.iter().any(|t| !t.eos && t.ready.is_empty());
            if starved && !drain_all && !overfull {
                return Ok(());
            }

            let next = self
                .tracks
                .iter()
                .enumerate()
                .filter_map(|(i, t)| t.ready.front().map(|s| (i, s.pts_us)))
                .min_by_key(|(_, pts)| *pts);
            let Some((index, _)) = next else {
                return Ok(());
            };
            let Some(sample) = self.tracks[index].ready.pop_front() else {
                return Ok(());
            };

            if self.io_error.is_some() {
                continue;
            }
            let Some(writer) = self.writer.as_mut() else {
                continue;
            };
            if let Err(e) = writer.write_sample(index, &sample) {
                tracing::error!("Muxer write failed on track {}: {}", index, e);
                self.io_error = Some(e.to_string());
                return Err(CaptureError::MuxerIo(e.to_string()));
            }
            let slot = &mut self.tracks[index];
            slot.written += 1;
            slot.end_us = sample.pts_us + sample.duration_us;
        }
    }

    fn finalize(&mut self, expected: &[TrackKind]) -> SegmentOutcome {
        let outcome = match self.state {
            MuxerState::Muxing => {
                for slot in &mut self.tracks {
                    slot.settle_pending(None);
                }
                let _ = self.flush_ready(true);
                if let Some(mut writer) = self.writer.take() {
                    if let Err(e) = writer.finish() {
                        if self.io_error.is_none() {
                            self.io_error = Some(e.to_string());
                        }
                    }
                }
                match &self.io_error {
                    Some(reason) => SegmentOutcome::Failed {
                        reason: reason.clone(),
                    },
                    None => SegmentOutcome::Complete {
                        tracks: self.tracks.iter().map(TrackSlot::summary).collect(),
                    },
                }
            }
            MuxerState::AwaitingTracks => {
                let missing: Vec<String> = expected
                    .iter()
                    .filter(|k| self.registered(**k).is_none())
                    .map(|k| format!("{:?}", k).to_lowercase())
                    .collect();
                SegmentOutcome::Failed {
                    reason: format!("codec config never arrived for {}", missing.join(", ")),
                }
            }
            MuxerState::Finished => self.outcome.clone().unwrap_or(SegmentOutcome::Failed {
                reason: "finished twice".to_string(),
            }),
        };
        self.state = MuxerState::Finished;
        self.outcome = Some(outcome.clone());
        outcome
    }
}

/// Interleaving writer for one segment file
pub struct Muxer {
    ordinal: u32,
    path: PathBuf,
    expected: Vec<TrackKind>,
    format: Arc<dyn ContainerFormat>,
    bus: CompletionBus,
    inner: Mutex<MuxerInner>,
}

impl Muxer {
    /// Create a muxer for `path`. Nothing touches the filesystem until
    /// every track in `expected` is registered and the muxer starts.
    pub fn new(
        ordinal: u32,
        path: impl Into<PathBuf>,
        expected: &[TrackKind],
        format: Arc<dyn ContainerFormat>,
        bus: CompletionBus,
    ) -> Self {
        Self {
            ordinal,
            path: path.into(),
            expected: expected.to_vec(),
            format,
            bus,
            inner: Mutex::new(MuxerInner {
                state: MuxerState::AwaitingTracks,
                tracks: Vec::new(),
                abandoned: Vec::new(),
                writer: None,
                io_error: None,
                outcome: None,
            }),
        }
    }

    pub fn ordinal(&self) -> u32 {
        self.ordinal
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> MuxerState {
        self.inner.lock().state
    }

    pub fn is_muxing(&self) -> bool {
        self.state() == MuxerState::Muxing
    }

    /// Final outcome, once finished
    pub fn outcome(&self) -> Option<SegmentOutcome> {
        self.inner.lock().outcome.clone()
    }

    /// Register the codec format of one expected track
    pub fn add_track(&self, format: TrackFormat) -> CaptureResult<TrackId> {
        let kind = format.kind();
        let mut inner = self.inner.lock();
        if inner.state != MuxerState::AwaitingTracks {
            return Err(CaptureError::InvalidState(format!(
                "add_track({:?}) while {:?}",
                kind, inner.state
            )));
        }
        if !self.expected.contains(&kind) {
            return Err(CaptureError::InvalidState(format!(
                "segment {} does not carry a {:?} track",
                self.ordinal, kind
            )));
        }
        if inner.registered(kind).is_some() || inner.abandoned.contains(&kind) {
            return Err(CaptureError::InvalidState(format!(
                "{:?} track registered twice",
                kind
            )));
        }

        inner.tracks.push(TrackSlot::new(format));
        let id = (inner.tracks.len() - 1) as TrackId;
        tracing::debug!("Segment {}: {:?} track registered as {}", self.ordinal, kind, id);
        Ok(id)
    }

    /// Open the container and begin accepting samples
    pub fn start(&self) -> CaptureResult<()> {
        let mut inner = self.inner.lock();
        if inner.state != MuxerState::AwaitingTracks {
            return Err(CaptureError::InvalidState(format!("start while {:?}", inner.state)));
        }
        if !inner.all_registered(&self.expected) {
            return Err(CaptureError::InvalidState(format!(
                "start with {} of {} tracks registered",
                inner.tracks.len(),
                self.expected.len()
            )));
        }
        inner.open(self.format.as_ref(), &self.path)?;
        tracing::info!("Segment {} muxing into {}", self.ordinal, self.path.display());
        Ok(())
    }

    /// Start if every track is registered. Returns whether the muxer is
    /// accepting samples afterwards.
    pub fn start_if_ready(&self) -> CaptureResult<bool> {
        let mut inner = self.inner.lock();
        match inner.state {
            MuxerState::Muxing => Ok(true),
            MuxerState::Finished => Ok(false),
            MuxerState::AwaitingTracks => {
                if !inner.all_registered(&self.expected) {
                    return Ok(false);
                }
                inner.open(self.format.as_ref(), &self.path)?;
                tracing::info!("Segment {} muxing into {}", self.ordinal, self.path.display());
                Ok(true)
            }
        }
    }

    /// Accept one compressed sample. PTS must not go backwards per track.
    ///
    /// After a write failure the error is latched: this call returns it and
    /// later samples are silently dropped until end of stream.
    pub fn write_sample(
        &self,
        track_id: TrackId,
        bytes: Bytes,
        pts_us: u64,
        flags: SampleFlags,
    ) -> CaptureResult<()> {
        let mut inner = self.inner.lock();
        if inner.state != MuxerState::Muxing {
            return Err(CaptureError::InvalidState(format!(
                "write_sample while {:?}",
                inner.state
            )));
        }
        let slot = inner
            .tracks
            .get_mut(track_id as usize)
            .ok_or(CaptureError::BadTrack(track_id))?;
        if slot.eos {
            return Err(CaptureError::InvalidState(format!(
                "track {} already ended",
                track_id
            )));
        }
        if flags.codec_config {
            // Carried by add_track
            return Ok(());
        }
        if let Some(last) = slot.last_pts {
            if pts_us < last {
                return Err(CaptureError::InvalidState(format!(
                    "track {} pts went backwards: {} < {}",
                    track_id, pts_us, last
                )));
            }
        }

        slot.last_pts = Some(pts_us);
        slot.settle_pending(Some(pts_us));
        slot.pending = Some(PendingSample {
            pts_us,
            is_sync: flags.keyframe,
            bytes,
        });

        if inner.io_error.is_some() {
            for slot in &mut inner.tracks {
                slot.ready.clear();
            }
            return Ok(());
        }
        inner.flush_ready(false)
    }

    /// Mark a track complete. The last track to end closes the file and
    /// publishes [`MuxerEvent::SegmentFinished`].
    pub fn signal_end_of_stream(&self, track_id: TrackId) -> CaptureResult<()> {
        let event = {
            let mut inner = self.inner.lock();
            if inner.state == MuxerState::Finished {
                return Err(CaptureError::InvalidState(
                    "end of stream after finish".to_string(),
                ));
            }
            let muxing = inner.state == MuxerState::Muxing;
            let slot = inner
                .tracks
                .get_mut(track_id as usize)
                .ok_or(CaptureError::BadTrack(track_id))?;
            if slot.eos {
                return Ok(());
            }
            if muxing {
                slot.settle_pending(None);
            } else {
                slot.pending = None;
            }
            slot.eos = true;
            tracing::debug!("Segment {}: track {} reached end of stream", self.ordinal, track_id);

            if muxing {
                // Latched; reported through the outcome
                let _ = inner.flush_ready(false);
            }
            self.finish_if_resolved(&mut inner)
        };

        if let Some(event) = event {
            self.bus.publish(&event);
        }
        Ok(())
    }

    /// Give up on a track whose codec never produced its config. If the
    /// track did register, this is the same as end of stream.
    pub fn abandon_track(&self, kind: TrackKind) -> CaptureResult<()> {
        let registered = self.inner.lock().registered(kind);
        if let Some(index) = registered {
            return self.signal_end_of_stream(index as TrackId);
        }

        let event = {
            let mut inner = self.inner.lock();
            if inner.state == MuxerState::Finished {
                return Ok(());
            }
            if !inner.abandoned.contains(&kind) {
                tracing::warn!("Segment {}: {:?} track abandoned before registering", self.ordinal, kind);
                inner.abandoned.push(kind);
            }
            self.finish_if_resolved(&mut inner)
        };

        if let Some(event) = event {
            self.bus.publish(&event);
        }
        Ok(())
    }

    /// Best-effort close, ending in `Finished` with a failed outcome
    pub fn abort(&self, reason: &str) {
        let event = {
            let mut inner = self.inner.lock();
            if inner.state == MuxerState::Finished {
                return;
            }
            if let Some(mut writer) = inner.writer.take() {
                if let Err(e) = writer.finish() {
                    tracing::debug!("Ignoring close error while aborting: {}", e);
                }
            }
            let outcome = SegmentOutcome::Failed {
                reason: reason.to_string(),
            };
            inner.state = MuxerState::Finished;
            inner.outcome = Some(outcome.clone());
            tracing::warn!("Segment {} aborted: {}", self.ordinal, reason);
            self.finished_event(outcome)
        };
        self.bus.publish(&event);
    }

    fn finish_if_resolved(&self, inner: &mut MuxerInner) -> Option<MuxerEvent> {
        if !inner.all_resolved(&self.expected) {
            return None;
        }
        let outcome = inner.finalize(&self.expected);
        match &outcome {
            SegmentOutcome::Complete { tracks } => tracing::info!(
                "Segment {} closed: {:?}",
                self.ordinal,
                tracks
            ),
            SegmentOutcome::Failed { reason } => {
                tracing::warn!("Segment {} failed: {}", self.ordinal, reason)
            }
        }
        Some(self.finished_event(outcome))
    }

    fn finished_event(&self, outcome: SegmentOutcome) -> MuxerEvent {
        MuxerEvent::SegmentFinished {
            ordinal: self.ordinal,
            path: self.path.clone(),
            outcome,
        }
    }
}

impl std::fmt::Debug for Muxer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Muxer")
            .field("ordinal", &self.ordinal)
            .field("path", &self.path)
            .field("state", &self.state())
            .finish()
    }
}
