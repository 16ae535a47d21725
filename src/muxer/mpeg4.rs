//! MPEG-4 container backed by the `mp4` crate
//!
//! Tracks use a microsecond timescale so sample timestamps map one to one.
//! The writer derives decode times from sample durations, which is why the
//! muxer computes every duration from the next sample's PTS. A track whose
//! first sample starts after zero gets an empty edit in its edit list.

use super::container::{
    AudioTrackFormat, ContainerFormat, ContainerReader, ContainerWriter, MediaSample, TrackFormat,
    VideoTrackFormat,
};
use crate::utils::error::{CaptureError, CaptureResult};
use mp4::{
    AacConfig, AudioObjectType, AvcConfig, BoxHeader, BoxType, ChannelConfig, FourCC,
    MediaConfig, MoovBox, Mp4Config, Mp4Reader, Mp4Sample, Mp4Track, Mp4Writer, ReadBox,
    SampleFreqIndex, TrackConfig, TrackType, WriteBox,
};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const MOVIE_TIMESCALE: u32 = 1_000;
const TRACK_TIMESCALE: u32 = 1_000_000;
const AAC_FRAME_SIZE: u32 = 1024;

/// Sampling frequencies in ISO/IEC 14496-3 index order
const SAMPLE_RATES: [u32; 13] = [
    96_000, 88_200, 64_000, 48_000, 44_100, 32_000, 24_000, 22_050, 16_000, 12_000, 11_025, 8_000,
    7_350,
];

fn writer_error(e: mp4::Error) -> CaptureError {
    CaptureError::MuxerIo(e.to_string())
}

fn reader_error(e: mp4::Error) -> CaptureError {
    CaptureError::StitchIo(e.to_string())
}

fn brand(code: &str) -> CaptureResult<FourCC> {
    code.parse::<FourCC>().map_err(writer_error)
}

/// Index of `rate` in the MPEG-4 audio frequency table
pub fn sample_rate_index(rate: u32) -> Option<u8> {
    SAMPLE_RATES.iter().position(|r| *r == rate).map(|i| i as u8)
}

/// Inverse of [`sample_rate_index`]
pub fn sample_rate_for_index(index: u8) -> Option<u32> {
    SAMPLE_RATES.get(index as usize).copied()
}

/// The MPEG-4 (`.mp4`) container format
#[derive(Debug, Clone, Copy, Default)]
pub struct Mp4Container;

impl ContainerFormat for Mp4Container {
    fn extension(&self) -> &'static str {
        "mp4"
    }

    fn create(&self, path: &Path) -> CaptureResult<Box<dyn ContainerWriter>> {
        let file = File::create(path).map_err(|e| {
            CaptureError::MuxerIo(format!("cannot create {}: {}", path.display(), e))
        })?;

        let config = Mp4Config {
            major_brand: brand("isom")?,
            minor_version: 512,
            compatible_brands: vec![brand("isom")?, brand("iso2")?, brand("avc1")?, brand("mp41")?],
            timescale: MOVIE_TIMESCALE,
        };
        let writer = Mp4Writer::write_start(BufWriter::new(file), &config).map_err(writer_error)?;

        Ok(Box::new(Mp4FileWriter {
            inner: Some(writer),
            path: path.to_path_buf(),
            first_pts_us: Vec::new(),
        }))
    }

    fn open(&self, path: &Path) -> CaptureResult<Box<dyn ContainerReader>> {
        Ok(Box::new(Mp4FileReader::open(path)?))
    }
}

struct Mp4FileWriter {
    inner: Option<Mp4Writer<BufWriter<File>>>,
    path: PathBuf,
    /// PTS of the first sample written to each track
    first_pts_us: Vec<Option<u64>>,
}

impl Mp4FileWriter {
    fn writer(&mut self) -> CaptureResult<&mut Mp4Writer<BufWriter<File>>> {
        self.inner
            .as_mut()
            .ok_or_else(|| CaptureError::MuxerIo("container already finished".to_string()))
    }
}

fn track_config(format: &TrackFormat) -> CaptureResult<TrackConfig> {
    let (track_type, media_conf) = match format {
        TrackFormat::Video(v) => {
            // avcC copies profile and level out of SPS bytes 1..4
            if v.sps.len() < 4 || v.pps.is_empty() {
                return Err(CaptureError::Codec("incomplete AVC parameter sets".to_string()));
            }
            (
                TrackType::Video,
                MediaConfig::AvcConfig(AvcConfig {
                    width: v.width,
                    height: v.height,
                    seq_param_set: v.sps.clone(),
                    pic_param_set: v.pps.clone(),
                }),
            )
        }
        TrackFormat::Audio(a) => {
            let index = sample_rate_index(a.sample_rate).ok_or_else(|| {
                CaptureError::Codec(format!("unsupported sample rate {}", a.sample_rate))
            })?;
            let chan_conf = match a.channels {
                1 => ChannelConfig::Mono,
                2 => ChannelConfig::Stereo,
                n => return Err(CaptureError::Codec(format!("unsupported channel count {}", n))),
            };
            (
                TrackType::Audio,
                MediaConfig::AacConfig(AacConfig {
                    bitrate: a.bitrate,
                    profile: AudioObjectType::AacLowComplexity,
                    freq_index: SampleFreqIndex::try_from(index).map_err(writer_error)?,
                    chan_conf,
                }),
            )
        }
    };

    Ok(TrackConfig {
        track_type,
        timescale: TRACK_TIMESCALE,
        language: "und".to_string(),
        media_conf,
    })
}

impl ContainerWriter for Mp4FileWriter {
    fn add_track(&mut self, format: &TrackFormat) -> CaptureResult<()> {
        let config = track_config(format)?;
        self.writer()?.add_track(&config).map_err(writer_error)?;
        self.first_pts_us.push(None);
        Ok(())
    }

    fn write_sample(&mut self, track_index: usize, sample: &MediaSample) -> CaptureResult<()> {
        let Some(first) = self.first_pts_us.get_mut(track_index) else {
            return Err(CaptureError::BadTrack(track_index as u32));
        };
        first.get_or_insert(sample.pts_us);
        let mp4_sample = Mp4Sample {
            start_time: sample.pts_us,
            duration: u32::try_from(sample.duration_us).unwrap_or(u32::MAX),
            rendering_offset: 0,
            is_sync: sample.is_sync,
            bytes: sample.bytes.clone(),
        };
        // mp4 track ids are 1-based
        self.writer()?
            .write_sample(track_index as u32 + 1, &mp4_sample)
            .map_err(writer_error)
    }

    fn finish(&mut self) -> CaptureResult<()> {
        let mut writer = self
            .inner
            .take()
            .ok_or_else(|| CaptureError::MuxerIo("container already finished".to_string()))?;
        writer.write_end().map_err(writer_error)?;
        writer
            .into_writer()
            .flush()
            .map_err(|e| CaptureError::MuxerIo(e.to_string()))?;

        let leads_us: Vec<u64> = self.first_pts_us.iter().map(|p| p.unwrap_or(0)).collect();
        if leads_us.iter().any(|lead| *lead > 0) {
            write_leading_edits(&self.path, &leads_us)?;
        }
        Ok(())
    }
}

/// `media_time` of an empty edit (-1), in either `elst` version
fn is_empty_edit(media_time: u64) -> bool {
    media_time == u64::MAX || media_time == u32::MAX as u64
}

/// Rewrites the trailing `moov` box so every track with a non-zero lead
/// starts with an empty edit of that length.
fn write_leading_edits(path: &Path, leads_us: &[u64]) -> CaptureResult<()> {
    let io_error = |e: std::io::Error| CaptureError::MuxerIo(e.to_string());
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(io_error)?;
    let size = file.metadata().map_err(io_error)?.len();

    let mut reader = BufReader::new(file.try_clone().map_err(io_error)?);
    let mut offset = 0u64;
    let mut found = None;
    while offset < size {
        reader.seek(SeekFrom::Start(offset)).map_err(io_error)?;
        let header = BoxHeader::read(&mut reader).map_err(writer_error)?;
        if header.name == BoxType::MoovBox {
            let moov = MoovBox::read_box(&mut reader, header.size).map_err(writer_error)?;
            found = Some((offset, moov));
            break;
        }
        if header.size == 0 {
            break;
        }
        offset += header.size;
    }
    let (moov_offset, mut moov) =
        found.ok_or_else(|| CaptureError::MuxerIo(format!("no moov box in {}", path.display())))?;

    let movie_timescale = moov.mvhd.timescale.max(1) as u64;
    for (trak, lead_us) in moov.traks.iter_mut().zip(leads_us) {
        if *lead_us == 0 {
            continue;
        }
        let lead = lead_us * movie_timescale / 1_000_000;
        let media = trak.tkhd.duration;
        // mp4 0.14 does not export the edts/elst box types, so they are
        // built through `Default` and filled in field by field.
        let edts = trak.edts.insert(Default::default());
        let elst = edts.elst.insert(Default::default());
        elst.version = 1;
        elst.flags = 0;
        elst.entries.resize_with(2, Default::default);
        elst.entries[0].segment_duration = lead;
        elst.entries[0].media_time = u64::MAX;
        elst.entries[0].media_rate = 1;
        elst.entries[0].media_rate_fraction = 0;
        elst.entries[1].segment_duration = media;
        elst.entries[1].media_time = 0;
        elst.entries[1].media_rate = 1;
        elst.entries[1].media_rate_fraction = 0;
        trak.tkhd.duration = media + lead;
        moov.mvhd.duration = moov.mvhd.duration.max(trak.tkhd.duration);
    }

    file.set_len(moov_offset).map_err(io_error)?;
    file.seek(SeekFrom::Start(moov_offset)).map_err(io_error)?;
    let mut writer = BufWriter::new(file);
    moov.write_box(&mut writer).map_err(writer_error)?;
    writer.flush().map_err(io_error)?;
    tracing::debug!("Wrote leading edits {:?} into {}", leads_us, path.display());
    Ok(())
}

/// Total length of the empty edits at the start of a track, in µs
fn leading_edit_us(track: &Mp4Track, movie_timescale: u64) -> u64 {
    let Some(elst) = track.trak.edts.as_ref().and_then(|edts| edts.elst.as_ref()) else {
        return 0;
    };
    let lead: u64 = elst
        .entries
        .iter()
        .take_while(|entry| is_empty_edit(entry.media_time))
        .map(|entry| entry.segment_duration)
        .sum();
    lead * 1_000_000 / movie_timescale.max(1)
}

struct Mp4FileReader {
    inner: Mp4Reader<BufReader<File>>,
    track_ids: Vec<u32>,
    timescales: Vec<u32>,
    leads_us: Vec<u64>,
    formats: Vec<TrackFormat>,
}

impl Mp4FileReader {
    fn open(path: &Path) -> CaptureResult<Self> {
        let file = File::open(path)
            .map_err(|e| CaptureError::StitchIo(format!("cannot open {}: {}", path.display(), e)))?;
        let size = file
            .metadata()
            .map_err(|e| CaptureError::StitchIo(e.to_string()))?
            .len();
        let inner = Mp4Reader::read_header(BufReader::new(file), size).map_err(reader_error)?;

        let mut ids: Vec<u32> = inner.tracks().keys().copied().collect();
        ids.sort_unstable();

        let mut track_ids = Vec::new();
        let mut timescales = Vec::new();
        let mut leads_us = Vec::new();
        let movie_timescale = inner.timescale() as u64;
        let mut formats = Vec::new();
        for id in ids {
            let Some(track) = inner.tracks().get(&id) else {
                continue;
            };
            let format = match track.track_type().map_err(reader_error)? {
                TrackType::Video => TrackFormat::Video(VideoTrackFormat {
                    width: track.width(),
                    height: track.height(),
                    sps: track.sequence_parameter_set().map_err(reader_error)?.to_vec(),
                    pps: track.picture_parameter_set().map_err(reader_error)?.to_vec(),
                }),
                TrackType::Audio => {
                    let channels = match track.channel_config().map_err(reader_error)? {
                        ChannelConfig::Mono => 1,
                        ChannelConfig::Stereo => 2,
                        other => {
                            return Err(CaptureError::StitchIo(format!(
                                "unsupported channel layout {:?}",
                                other
                            )))
                        }
                    };
                    TrackFormat::Audio(AudioTrackFormat {
                        sample_rate: track.sample_freq_index().map_err(reader_error)?.freq(),
                        channels,
                        bitrate: track.bitrate(),
                        frame_size: AAC_FRAME_SIZE,
                    })
                }
                other => {
                    tracing::debug!("Skipping {:?} track {} in {}", other, id, path.display());
                    continue;
                }
            };
            track_ids.push(id);
            timescales.push(track.timescale().max(1));
            leads_us.push(leading_edit_us(track, movie_timescale));
            formats.push(format);
        }

        Ok(Self {
            inner,
            track_ids,
            timescales,
            leads_us,
            formats,
        })
    }

    fn track_id(&self, track_index: usize) -> CaptureResult<u32> {
        self.track_ids
            .get(track_index)
            .copied()
            .ok_or(CaptureError::BadTrack(track_index as u32))
    }
}

impl ContainerReader for Mp4FileReader {
    fn tracks(&self) -> &[TrackFormat] {
        &self.formats
    }

    fn sample_count(&self, track_index: usize) -> CaptureResult<u32> {
        let id = self.track_id(track_index)?;
        self.inner.sample_count(id).map_err(reader_error)
    }

    fn read_sample(&mut self, track_index: usize, sample_index: u32) -> CaptureResult<Option<MediaSample>> {
        let id = self.track_id(track_index)?;
        let timescale = self.timescales[track_index] as u64;
        let lead_us = self.leads_us[track_index];
        let sample = self
            .inner
            .read_sample(id, sample_index + 1)
            .map_err(reader_error)?;

        Ok(sample.map(|s| MediaSample {
            pts_us: lead_us + s.start_time * 1_000_000 / timescale,
            duration_us: s.duration as u64 * 1_000_000 / timescale,
            is_sync: s.is_sync,
            bytes: s.bytes,
        }))
    }
}
