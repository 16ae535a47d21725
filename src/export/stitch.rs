//! Segment concatenation
//!
//! Remuxes the promoted segments, in ordinal order, into one file. Samples
//! are copied as they are; each segment's timestamps are shifted by the
//! total duration of the segments before it.

use crate::muxer::{
    CompletionBus, ContainerFormat, ContainerReader, MediaSample, Muxer, SampleFlags,
    SegmentOutcome, TrackFormat, TrackId, TrackKind,
};
use crate::utils::error::{CaptureError, CaptureResult};
use chrono::Utc;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// What went into one stitched segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StitchedSegment {
    pub ordinal: u32,
    pub duration_us: u64,
    pub samples: u64,
}

/// Result of a successful stitch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StitchReport {
    pub output: PathBuf,
    pub segments: Vec<StitchedSegment>,
    pub total_duration_us: u64,
    pub total_samples: u64,
}

/// `<movies>/<unix-millis>-final.mp4`
pub fn final_output_path(movies_dir: &Path, extension: &str) -> PathBuf {
    movies_dir.join(format!("{}-final.{}", Utc::now().timestamp_millis(), extension))
}

pub struct Stitcher {
    format: Arc<dyn ContainerFormat>,
}

impl Stitcher {
    pub fn new(format: Arc<dyn ContainerFormat>) -> Self {
        Self { format }
    }

    /// Concatenate `segments` (already in order) into `output`. On failure
    /// the partial output is deleted.
    pub fn stitch(
        &self,
        segments: &[(u32, PathBuf)],
        output: &Path,
    ) -> CaptureResult<StitchReport> {
        if segments.is_empty() {
            return Err(CaptureError::NoSegments);
        }
        tracing::info!("Stitching {} segments into {:?}", segments.len(), output);

        let muxer = self.output_muxer(&segments[0].1, output)?;
        match self.copy_segments(&muxer, segments) {
            Ok(report) => {
                tracing::info!(
                    "Stitched {:?}: {} samples, {} ms",
                    output,
                    report.total_samples,
                    report.total_duration_us / 1_000
                );
                Ok(report)
            }
            Err(e) => {
                muxer.abort(&e.to_string());
                if output.exists() {
                    if let Err(remove) = std::fs::remove_file(output) {
                        tracing::warn!("Failed to delete partial output {:?}: {}", output, remove);
                    }
                }
                tracing::error!("Stitch failed: {}", e);
                Err(match e {
                    CaptureError::StitchIo(_) => e,
                    other => CaptureError::StitchIo(other.to_string()),
                })
            }
        }
    }

    /// Output muxer with the first segment's tracks
    fn output_muxer(&self, first: &Path, output: &Path) -> CaptureResult<Muxer> {
        let reader = self.format.open(first)?;
        let formats = reader.tracks().to_vec();
        if formats.is_empty() {
            return Err(CaptureError::StitchIo(format!("{:?} has no tracks", first)));
        }
        let kinds: Vec<TrackKind> = formats.iter().map(TrackFormat::kind).collect();
        let muxer = Muxer::new(0, output, &kinds, self.format.clone(), CompletionBus::new());
        for format in formats {
            muxer.add_track(format)?;
        }
        muxer.start()?;
        Ok(muxer)
    }

    fn copy_segments(
        &self,
        muxer: &Muxer,
        segments: &[(u32, PathBuf)],
    ) -> CaptureResult<StitchReport> {
        let mut offset_us = 0u64;
        let mut report = StitchReport {
            output: muxer.path().to_path_buf(),
            segments: Vec::with_capacity(segments.len()),
            total_duration_us: 0,
            total_samples: 0,
        };

        let outputs = self.format.open(&segments[0].1)?.tracks().to_vec();
        for (ordinal, path) in segments {
            let mut reader = self.format.open(path)?;
            let mapping = map_tracks(&outputs, reader.tracks())
                .map_err(|m| CaptureError::StitchIo(format!("segment {}: {}", ordinal, m)))?;
            let (duration_us, samples) = copy_one(muxer, &mut *reader, &mapping, offset_us)?;

            tracing::debug!(
                "Segment {}: {} samples, {} us at offset {}",
                ordinal,
                samples,
                duration_us,
                offset_us
            );
            report.segments.push(StitchedSegment {
                ordinal: *ordinal,
                duration_us,
                samples,
            });
            report.total_samples += samples;
            offset_us += duration_us;
        }
        report.total_duration_us = offset_us;

        for id in 0..outputs.len() as TrackId {
            muxer.signal_end_of_stream(id)?;
        }
        match muxer.outcome() {
            Some(SegmentOutcome::Complete { .. }) => Ok(report),
            Some(SegmentOutcome::Failed { reason }) => Err(CaptureError::StitchIo(reason)),
            None => Err(CaptureError::StitchIo("output did not finish".to_string())),
        }
    }
}

/// Output track for each track of a segment
fn map_tracks(outputs: &[TrackFormat], inputs: &[TrackFormat]) -> Result<Vec<TrackId>, String> {
    inputs
        .iter()
        .map(|input| {
            let (id, output) = outputs
                .iter()
                .enumerate()
                .find(|(_, o)| o.kind() == input.kind())
                .ok_or_else(|| format!("unexpected {:?} track", input.kind()))?;
            if !output.is_compatible_with(input) {
                return Err(format!(
                    "{:?} track format differs from the first segment",
                    input.kind()
                ));
            }
            Ok(id as TrackId)
        })
        .collect()
}

/// Copy every sample of one segment, merging tracks by PTS. Returns the
/// segment duration (latest sample end over all tracks) and sample count.
fn copy_one(
    muxer: &Muxer,
    reader: &mut dyn ContainerReader,
    mapping: &[TrackId],
    offset_us: u64,
) -> CaptureResult<(u64, u64)> {
    let counts = (0..mapping.len())
        .map(|i| reader.sample_count(i))
        .collect::<CaptureResult<Vec<u32>>>()?;
    let mut next = vec![0u32; mapping.len()];
    let mut heads: Vec<Option<MediaSample>> = Vec::with_capacity(mapping.len());
    for track in 0..mapping.len() {
        heads.push(read_next(reader, track, &mut next, &counts)?);
    }

    let mut end_us = 0u64;
    let mut samples = 0u64;
    loop {
        let Some(track) = heads
            .iter()
            .enumerate()
            .filter_map(|(i, h)| h.as_ref().map(|s| (i, s.pts_us)))
            .min_by_key(|(_, pts)| *pts)
            .map(|(i, _)| i)
        else {
            break;
        };
        let Some(sample) = heads[track].take() else {
            break;
        };

        end_us = end_us.max(sample.pts_us + sample.duration_us);
        let flags = SampleFlags {
            keyframe: sample.is_sync,
            ..SampleFlags::NONE
        };
        muxer.write_sample(mapping[track], sample.bytes, sample.pts_us + offset_us, flags)?;
        samples += 1;

        heads[track] = read_next(reader, track, &mut next, &counts)?;
    }
    Ok((end_us, samples))
}

fn read_next(
    reader: &mut dyn ContainerReader,
    track: usize,
    next: &mut [u32],
    counts: &[u32],
) -> CaptureResult<Option<MediaSample>> {
    if next[track] >= counts[track] {
        return Ok(None);
    }
    let sample = reader.read_sample(track, next[track])?;
    next[track] += 1;
    Ok(sample)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::muxer::{AudioTrackFormat, Mp4Container, VideoTrackFormat};
    use bytes::Bytes;
    use tempfile::tempdir;

    fn video(width: u16) -> TrackFormat {
        TrackFormat::Video(VideoTrackFormat {
            width,
            height: 8,
            sps: vec![0x67, 0x42, 0x00, 0x1e],
            pps: vec![0x68, 0xce, 0x38, 0x80],
        })
    }

    fn audio() -> TrackFormat {
        TrackFormat::Audio(AudioTrackFormat {
            sample_rate: 44_100,
            channels: 1,
            bitrate: 96_000,
            frame_size: 1024,
        })
    }

    /// Segment with `frames` video samples 33 ms apart and matching audio
    fn write_segment(path: &Path, width: u16, frames: u64, tag: u8) {
        let muxer = Muxer::new(
            0,
            path,
            &[TrackKind::Video, TrackKind::Audio],
            Arc::new(Mp4Container),
            CompletionBus::new(),
        );
        let v = muxer.add_track(video(width)).unwrap();
        let a = muxer.add_track(audio()).unwrap();
        muxer.start().unwrap();
        for i in 0..frames {
            let flags = if i == 0 { SampleFlags::KEYFRAME } else { SampleFlags::NONE };
            muxer
                .write_sample(v, Bytes::from(vec![tag, i as u8]), i * 33_000, flags)
                .unwrap();
            let pcm = Bytes::from(vec![tag, 0xa0, i as u8]);
            muxer
                .write_sample(a, pcm, i * 33_000, SampleFlags::KEYFRAME)
                .unwrap();
        }
        muxer.signal_end_of_stream(v).unwrap();
        muxer.signal_end_of_stream(a).unwrap();
        assert!(muxer.outcome().unwrap().is_complete());
    }

    #[test]
    fn test_stitch_shifts_later_segments() {
        let dir = tempdir().unwrap();
        let first = dir.path().join("0.mp4");
        let second = dir.path().join("1.mp4");
        write_segment(&first, 8, 3, 1);
        write_segment(&second, 8, 2, 2);

        let output = dir.path().join("final.mp4");
        let stitcher = Stitcher::new(Arc::new(Mp4Container));
        let report = stitcher
            .stitch(&[(0, first), (1, second)], &output)
            .unwrap();

        assert_eq!(report.segments.len(), 2);
        assert_eq!(report.total_samples, 10);
        assert_eq!(report.segments[0].duration_us, 99_000);
        assert_eq!(
            report.total_duration_us,
            report.segments[0].duration_us + report.segments[1].duration_us
        );

        let mut reader = Mp4Container.open(&output).unwrap();
        assert_eq!(reader.sample_count(0).unwrap(), 5);
        let pts: Vec<u64> = (0..5)
            .map(|i| reader.read_sample(0, i).unwrap().unwrap().pts_us)
            .collect();
        assert_eq!(pts, vec![0, 33_000, 66_000, 99_000, 132_000]);

        // Samples are copied untouched
        let fourth = reader.read_sample(0, 3).unwrap().unwrap();
        assert_eq!(fourth.bytes.as_ref(), &[2, 0]);
        assert!(fourth.is_sync);
    }

    /// Segment with independent video (33 ms) and audio (23 ms) sample counts
    fn write_av_segment(path: &Path, frames: u64, buffers: u64) {
        let muxer = Muxer::new(
            0,
            path,
            &[TrackKind::Video, TrackKind::Audio],
            Arc::new(Mp4Container),
            CompletionBus::new(),
        );
        let v = muxer.add_track(video(8)).unwrap();
        let a = muxer.add_track(audio()).unwrap();
        muxer.start().unwrap();
        for i in 0..frames.max(buffers) {
            if i < frames {
                let flags = if i == 0 { SampleFlags::KEYFRAME } else { SampleFlags::NONE };
                muxer
                    .write_sample(v, Bytes::from(vec![0x65, i as u8]), i * 33_000, flags)
                    .unwrap();
            }
            if i < buffers {
                muxer
                    .write_sample(a, Bytes::from(vec![0xa0, i as u8]), i * 23_000, SampleFlags::KEYFRAME)
                    .unwrap();
            }
        }
        muxer.signal_end_of_stream(v).unwrap();
        muxer.signal_end_of_stream(a).unwrap();
        assert!(muxer.outcome().unwrap().is_complete());
    }

    #[test]
    fn test_audio_only_first_segment_keeps_video_in_place() {
        let dir = tempdir().unwrap();
        let first = dir.path().join("0.mp4");
        let second = dir.path().join("1.mp4");
        write_av_segment(&first, 0, 20);
        write_av_segment(&second, 5, 5);

        let output = dir.path().join("final.mp4");
        let report = Stitcher::new(Arc::new(Mp4Container))
            .stitch(&[(0, first), (1, second)], &output)
            .unwrap();
        assert_eq!(report.segments[0].duration_us, 460_000);

        let mut reader = Mp4Container.open(&output).unwrap();
        assert_eq!(reader.sample_count(0).unwrap(), 5);
        assert_eq!(reader.sample_count(1).unwrap(), 25);
        let video: Vec<u64> = (0..5)
            .map(|i| reader.read_sample(0, i).unwrap().unwrap().pts_us)
            .collect();
        assert_eq!(video, vec![460_000, 493_000, 526_000, 559_000, 592_000]);
        // Audio of the second segment lines up with its video
        let audio = reader.read_sample(1, 20).unwrap().unwrap();
        assert_eq!(audio.pts_us, 460_000);
        assert_eq!(audio.bytes.as_ref(), &[0xa0, 0]);
    }

    #[test]
    fn test_single_segment_remux_is_byte_identical() {
        let dir = tempdir().unwrap();
        let segment = dir.path().join("0.mp4");
        write_segment(&segment, 8, 4, 7);
        let output = dir.path().join("out.mp4");
        Stitcher::new(Arc::new(Mp4Container))
            .stitch(&[(0, segment.clone())], &output)
            .unwrap();

        let mut a = Mp4Container.open(&segment).unwrap();
        let mut b = Mp4Container.open(&output).unwrap();
        for track in 0..2 {
            let n = a.sample_count(track).unwrap();
            assert_eq!(b.sample_count(track).unwrap(), n);
            for i in 0..n {
                assert_eq!(a.read_sample(track, i).unwrap(), b.read_sample(track, i).unwrap());
            }
        }
    }

    #[test]
    fn test_empty_list_is_no_segments() {
        let dir = tempdir().unwrap();
        let err = Stitcher::new(Arc::new(Mp4Container))
            .stitch(&[], &dir.path().join("out.mp4"))
            .unwrap_err();
        assert_eq!(err.code(), "NO_SEGMENTS");
    }

    #[test]
    fn test_incompatible_segment_deletes_partial_output() {
        let dir = tempdir().unwrap();
        let first = dir.path().join("0.mp4");
        let second = dir.path().join("1.mp4");
        write_segment(&first, 8, 2, 1);
        write_segment(&second, 16, 2, 2);

        let output = dir.path().join("out.mp4");
        let err = Stitcher::new(Arc::new(Mp4Container))
            .stitch(&[(0, first), (1, second)], &output)
            .unwrap_err();
        assert_eq!(err.code(), "STITCH_IO");
        assert!(!output.exists());
    }

    #[test]
    fn test_final_output_name() {
        let path = final_output_path(Path::new("/movies"), "mp4");
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.ends_with("-final.mp4"));
        assert!(name.trim_end_matches("-final.mp4").parse::<i64>().is_ok());
    }
}
