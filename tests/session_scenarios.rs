//! End-to-end recording sessions against the virtual camera, the tone
//! microphone and the software codecs.

use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use stitchcam_lib::capture::{
    AudioDeviceInfo, Facing, Microphone, MicrophoneSource, ToneMicrophoneSource,
    VirtualCameraDriver,
};
use stitchcam_lib::encoder::{
    AudioCodec, AudioConfig, CodecFactory, CodecOutput, SoftCodecFactory, VideoCodec,
    VideoConfig,
};
use stitchcam_lib::muxer::{
    ContainerFormat, ContainerReader, ContainerWriter, MediaSample, Mp4Container, TrackFormat,
    TrackKind,
};
use stitchcam_lib::recorder::{CoordinatorState, SegmentStatus};
use stitchcam_lib::render::{PreviewSink, RenderSurface};
use stitchcam_lib::{
    CaptureError, CaptureResult, CoordinatorDeps, RecorderSettings, RecordingEvent,
    SessionCoordinator, SessionHandle, SessionPaths,
};
use tempfile::{tempdir, TempDir};
use tokio::sync::broadcast;

/// One frame period at 30 fps
const FRAME_US: u64 = 33_334;

/// Small preview so drawing it does not slow the encoder path down
fn headless() -> CoordinatorDeps {
    CoordinatorDeps::headless(PreviewSink::new(120, 160))
}

fn spawn(dir: &TempDir, deps: CoordinatorDeps) -> SessionHandle {
    let paths = SessionPaths {
        base_dir: dir.path().join("work"),
        movies_dir: dir.path().join("movies"),
    };
    SessionCoordinator::spawn(RecorderSettings::default(), paths, deps).unwrap()
}

fn files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

fn temp_files(dir: &TempDir) -> Vec<String> {
    files(&dir.path().join("work/session_temp"))
}

fn durable_files(dir: &TempDir) -> Vec<String> {
    files(&dir.path().join("work/session"))
}

async fn record(session: &SessionHandle, length: Duration) {
    session.start_record().await.unwrap();
    tokio::time::sleep(length).await;
    session.stop_record().await.unwrap();
    // Round trip so the completion posted during stop has been handled
    session.snapshot().await.unwrap();
}

fn drain(events: &mut broadcast::Receiver<RecordingEvent>) -> Vec<RecordingEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

fn read_tracks(path: &Path) -> Vec<(TrackFormat, Vec<MediaSample>)> {
    let mut reader = Mp4Container.open(path).unwrap();
    let formats = reader.tracks().to_vec();
    formats
        .into_iter()
        .enumerate()
        .map(|(index, format)| {
            let count = reader.sample_count(index).unwrap();
            let samples = (0..count)
                .map(|i| reader.read_sample(index, i).unwrap().unwrap())
                .collect();
            (format, samples)
        })
        .collect()
}

fn track(tracks: &[(TrackFormat, Vec<MediaSample>)], kind: TrackKind) -> &[MediaSample] {
    tracks
        .iter()
        .find(|(format, _)| format.kind() == kind)
        .map(|(_, samples)| samples.as_slice())
        .unwrap()
}

fn end_us(samples: &[MediaSample]) -> u64 {
    samples.last().map(|s| s.pts_us + s.duration_us).unwrap_or(0)
}

fn assert_pts_from_zero(samples: &[MediaSample]) {
    assert_eq!(samples.first().unwrap().pts_us, 0);
    assert!(samples.windows(2).all(|w| w[0].pts_us <= w[1].pts_us));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_single_clip() {
    let dir = tempdir().unwrap();
    let session = spawn(&dir, headless());

    record(&session, Duration::from_millis(2_000)).await;
    assert_eq!(durable_files(&dir), vec!["0.mp4"]);

    let segment = read_tracks(&dir.path().join("work/session/0.mp4"));
    assert_pts_from_zero(track(&segment, TrackKind::Video));
    assert_pts_from_zero(track(&segment, TrackKind::Audio));

    let report = session.finalize_session().await.unwrap();
    assert_eq!(report.segments.len(), 1);
    assert!(report.output.starts_with(dir.path().join("movies")));

    let stitched = read_tracks(&report.output);
    let video = track(&stitched, TrackKind::Video);
    let audio = track(&stitched, TrackKind::Audio);
    assert!((45..=66).contains(&video.len()), "{} video samples", video.len());
    // 2.0 s at 44.1 kHz in 1024-frame packets is about 86
    assert!((70..=95).contains(&audio.len()), "{} audio samples", audio.len());
    let duration = end_us(video).max(end_us(audio));
    assert!((1_800_000..=2_300_000).contains(&duration), "{} us", duration);

    // Stitched segments are gone, the movie stays
    assert!(durable_files(&dir).is_empty());
    assert!(report.output.exists());
    let snapshot = session.snapshot().await.unwrap();
    assert!(snapshot.segments.is_empty());
    assert_eq!(snapshot.recording_time_ms, 0);
    session.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_three_clip_stitch() {
    let dir = tempdir().unwrap();
    let session = spawn(&dir, headless());
    let mut events = session.subscribe();

    for millis in [1_000, 500, 1_500] {
        record(&session, Duration::from_millis(millis)).await;
    }
    assert_eq!(durable_files(&dir), vec!["0.mp4", "1.mp4", "2.mp4"]);

    let promoted: Vec<(u32, u64)> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            RecordingEvent::SegmentPromoted {
                ordinal,
                duration_us,
                ..
            } => Some((ordinal, duration_us)),
            _ => None,
        })
        .collect();
    assert_eq!(promoted.iter().map(|p| p.0).collect::<Vec<_>>(), vec![0, 1, 2]);
    let recorded_us: u64 = promoted.iter().map(|p| p.1).sum();

    let report = session.finalize_session().await.unwrap();
    let ordinals: Vec<u32> = report.segments.iter().map(|s| s.ordinal).collect();
    assert_eq!(ordinals, vec![0, 1, 2]);
    assert!(
        report.total_duration_us.abs_diff(recorded_us) <= FRAME_US,
        "stitched {} vs recorded {}",
        report.total_duration_us,
        recorded_us
    );
    assert!(
        (2_750_000..=3_300_000).contains(&report.total_duration_us),
        "{} us",
        report.total_duration_us
    );

    let stitched = read_tracks(&report.output);
    let video = track(&stitched, TrackKind::Video);
    assert!(video.windows(2).all(|w| w[0].pts_us < w[1].pts_us));
    let audio = track(&stitched, TrackKind::Audio);
    assert!(audio.windows(2).all(|w| w[0].pts_us <= w[1].pts_us));
    let file_us = end_us(video).max(end_us(audio));
    assert!(file_us.abs_diff(report.total_duration_us) <= FRAME_US);
    session.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_discard_mid_recording() {
    let dir = tempdir().unwrap();
    let session = spawn(&dir, headless());
    let mut events = session.subscribe();

    record(&session, Duration::from_millis(300)).await;
    session.start_record().await.unwrap();
    tokio::time::sleep(Duration::from_millis(800)).await;
    session.discard_session().await.unwrap();

    let snapshot = session.snapshot().await.unwrap();
    assert_eq!(snapshot.state, CoordinatorState::Idle);
    assert!(snapshot.current.is_none());
    assert!(snapshot.segments.is_empty());
    assert!(temp_files(&dir).is_empty());
    assert!(durable_files(&dir).is_empty());

    let seen = drain(&mut events);
    assert_eq!(seen.last(), Some(&RecordingEvent::SessionDiscarded));
    assert!(!seen
        .iter()
        .any(|e| matches!(e, RecordingEvent::SegmentPromoted { ordinal: 1, .. })));

    // The session is usable again and numbering restarts
    record(&session, Duration::from_millis(300)).await;
    assert_eq!(durable_files(&dir), vec!["0.mp4"]);
    session.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_facing_switch_between_clips() {
    let dir = tempdir().unwrap();
    let session = spawn(&dir, headless());

    record(&session, Duration::from_millis(1_000)).await;
    assert!(session.request_facing(Facing::Front).await.unwrap());
    let snapshot = session.snapshot().await.unwrap();
    assert_eq!(snapshot.facing, Facing::Front);
    // 480x640 portrait request matches the 640x480 sensor mode
    assert_eq!(
        session.render_state().await.unwrap().preview_size,
        Some((640, 480))
    );
    record(&session, Duration::from_millis(1_000)).await;

    assert_eq!(durable_files(&dir), vec!["0.mp4", "1.mp4"]);
    let sizes: Vec<(u16, u16)> = ["0.mp4", "1.mp4"]
        .iter()
        .map(|name| {
            let tracks = read_tracks(&dir.path().join("work/session").join(name));
            assert!(!track(&tracks, TrackKind::Video).is_empty());
            match &tracks.iter().find(|(f, _)| f.kind() == TrackKind::Video).unwrap().0 {
                TrackFormat::Video(v) => (v.width, v.height),
                TrackFormat::Audio(_) => unreachable!(),
            }
        })
        .collect();
    assert_eq!(sizes, vec![(480, 640), (480, 640)]);

    // Only a back and a front camera: asking again is a no-op
    assert!(session.request_facing(Facing::Front).await.unwrap());
    assert!(session.request_other_camera().await.unwrap());
    assert_eq!(session.snapshot().await.unwrap().facing, Facing::Back);
    session.shutdown().await.unwrap();
}

/// Delays all codec output, including the codec-config packet
struct LateCodecs {
    delay: Duration,
}

struct LateVideo {
    inner: Arc<dyn VideoCodec>,
    ready_at: Instant,
}

struct LateAudio {
    inner: Arc<dyn AudioCodec>,
    ready_at: Instant,
}

fn hold_back(ready_at: Instant, timeout: Duration) -> bool {
    let now = Instant::now();
    if now >= ready_at {
        return false;
    }
    std::thread::sleep(timeout.min(ready_at - now));
    true
}

impl CodecFactory for LateCodecs {
    fn create_video(&self, config: &VideoConfig) -> CaptureResult<Arc<dyn VideoCodec>> {
        Ok(Arc::new(LateVideo {
            inner: SoftCodecFactory.create_video(config)?,
            ready_at: Instant::now() + self.delay,
        }))
    }

    fn create_audio(&self, config: &AudioConfig) -> CaptureResult<Arc<dyn AudioCodec>> {
        Ok(Arc::new(LateAudio {
            inner: SoftCodecFactory.create_audio(config)?,
            ready_at: Instant::now() + self.delay,
        }))
    }
}

impl VideoCodec for LateVideo {
    fn input_surface(&self) -> Arc<dyn RenderSurface> {
        self.inner.input_surface()
    }

    fn dequeue_output(&self, timeout: Duration) -> CaptureResult<CodecOutput> {
        if hold_back(self.ready_at, timeout) {
            return Ok(CodecOutput::TryAgainLater);
        }
        self.inner.dequeue_output(timeout)
    }

    fn signal_end_of_input(&self) -> CaptureResult<()> {
        self.inner.signal_end_of_input()
    }

    fn release(&self) {
        self.inner.release()
    }
}

impl AudioCodec for LateAudio {
    fn queue_input(&self, pcm: &[i16], pts_us: u64, timeout: Duration) -> CaptureResult<bool> {
        self.inner.queue_input(pcm, pts_us, timeout)
    }

    fn dequeue_output(&self, timeout: Duration) -> CaptureResult<CodecOutput> {
        if hold_back(self.ready_at, timeout) {
            return Ok(CodecOutput::TryAgainLater);
        }
        self.inner.dequeue_output(timeout)
    }

    fn signal_end_of_input(&self) -> CaptureResult<()> {
        self.inner.signal_end_of_input()
    }

    fn release(&self) {
        self.inner.release()
    }
}

/// MPEG-4 output that records the order of writer calls
struct LoggingContainer {
    calls: Arc<Mutex<Vec<&'static str>>>,
}

struct LoggingWriter {
    inner: Box<dyn ContainerWriter>,
    calls: Arc<Mutex<Vec<&'static str>>>,
}

impl ContainerFormat for LoggingContainer {
    fn extension(&self) -> &'static str {
        Mp4Container.extension()
    }

    fn create(&self, path: &Path) -> CaptureResult<Box<dyn ContainerWriter>> {
        Ok(Box::new(LoggingWriter {
            inner: Mp4Container.create(path)?,
            calls: self.calls.clone(),
        }))
    }

    fn open(&self, path: &Path) -> CaptureResult<Box<dyn ContainerReader>> {
        Mp4Container.open(path)
    }
}

impl ContainerWriter for LoggingWriter {
    fn add_track(&mut self, format: &TrackFormat) -> CaptureResult<()> {
        self.calls.lock().push("add_track");
        self.inner.add_track(format)
    }

    fn write_sample(&mut self, track_index: usize, sample: &MediaSample) -> CaptureResult<()> {
        self.calls.lock().push("write_sample");
        self.inner.write_sample(track_index, sample)
    }

    fn finish(&mut self) -> CaptureResult<()> {
        self.calls.lock().push("finish");
        self.inner.finish()
    }
}

/// MPEG-4 output whose close takes `delay`
struct SlowCloseContainer {
    delay: Duration,
}

struct SlowCloseWriter {
    inner: Box<dyn ContainerWriter>,
    delay: Duration,
}

impl ContainerFormat for SlowCloseContainer {
    fn extension(&self) -> &'static str {
        Mp4Container.extension()
    }

    fn create(&self, path: &Path) -> CaptureResult<Box<dyn ContainerWriter>> {
        Ok(Box::new(SlowCloseWriter {
            inner: Mp4Container.create(path)?,
            delay: self.delay,
        }))
    }

    fn open(&self, path: &Path) -> CaptureResult<Box<dyn ContainerReader>> {
        Mp4Container.open(path)
    }
}

impl ContainerWriter for SlowCloseWriter {
    fn add_track(&mut self, format: &TrackFormat) -> CaptureResult<()> {
        self.inner.add_track(format)
    }

    fn write_sample(&mut self, track_index: usize, sample: &MediaSample) -> CaptureResult<()> {
        self.inner.write_sample(track_index, sample)
    }

    fn finish(&mut self) -> CaptureResult<()> {
        std::thread::sleep(self.delay);
        self.inner.finish()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_slow_segment_close_does_not_stall_coordinator() {
    let dir = tempdir().unwrap();
    let mut deps = headless();
    deps.container = Arc::new(SlowCloseContainer {
        delay: Duration::from_millis(800),
    });
    let session = spawn(&dir, deps);

    session.start_record().await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let stopper = session.clone();
    let stop = tokio::spawn(async move { stopper.stop_record().await });

    // The coordinator answers while the file is still being closed
    let snapshot = loop {
        let snapshot = session.snapshot().await.unwrap();
        if snapshot.state != CoordinatorState::Recording {
            break snapshot;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };
    assert_eq!(snapshot.state, CoordinatorState::Finalizing);
    assert!(durable_files(&dir).is_empty());

    // stop_record itself resolves once the segment is promoted
    stop.await.unwrap().unwrap();
    assert_eq!(session.snapshot().await.unwrap().state, CoordinatorState::Idle);
    assert_eq!(durable_files(&dir), vec!["0.mp4"]);
    session.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_codec_config_arrives_late() {
    let dir = tempdir().unwrap();
    let calls = Arc::new(Mutex::new(Vec::new()));
    let mut deps = headless();
    deps.codecs = Arc::new(LateCodecs {
        delay: Duration::from_millis(10),
    });
    deps.container = Arc::new(LoggingContainer {
        calls: calls.clone(),
    });
    let session = spawn(&dir, deps);
    let mut events = session.subscribe();

    record(&session, Duration::from_millis(1_000)).await;

    let seen = drain(&mut events);
    assert!(
        !seen.iter().any(|e| matches!(
            e,
            RecordingEvent::SegmentFailed { .. } | RecordingEvent::Error { .. }
        )),
        "{:?}",
        seen
    );
    assert!(seen
        .iter()
        .any(|e| matches!(e, RecordingEvent::SegmentPromoted { ordinal: 0, .. })));

    let calls = calls.lock().clone();
    assert_eq!(&calls[..2], &["add_track", "add_track"]);
    assert_eq!(calls.iter().filter(|c| **c == "add_track").count(), 2);
    assert_eq!(calls.last(), Some(&"finish"));
    assert!(calls.iter().any(|c| *c == "write_sample"));

    let tracks = read_tracks(&dir.path().join("work/session/0.mp4"));
    assert!(!track(&tracks, TrackKind::Video).is_empty());
    assert!(!track(&tracks, TrackKind::Audio).is_empty());
    session.shutdown().await.unwrap();
}

/// The first microphone opened stops delivering after `fail_after`
struct FlakyMicrophones {
    inner: ToneMicrophoneSource,
    opened: AtomicUsize,
    fail_after: Duration,
}

struct DroppingMicrophone {
    inner: Box<dyn Microphone>,
    opened_at: Instant,
    fail_after: Duration,
}

impl MicrophoneSource for FlakyMicrophones {
    fn devices(&self) -> Vec<AudioDeviceInfo> {
        self.inner.devices()
    }

    fn open(&self, sample_rate: u32, channels: u16) -> CaptureResult<Box<dyn Microphone>> {
        let microphone = self.inner.open(sample_rate, channels)?;
        if self.opened.fetch_add(1, Ordering::SeqCst) > 0 {
            return Ok(microphone);
        }
        Ok(Box::new(DroppingMicrophone {
            inner: microphone,
            opened_at: Instant::now(),
            fail_after: self.fail_after,
        }))
    }
}

impl Microphone for DroppingMicrophone {
    fn read(&mut self, buf: &mut [i16]) -> CaptureResult<usize> {
        if self.opened_at.elapsed() >= self.fail_after {
            return Err(CaptureError::DeviceUnavailable(
                "microphone disconnected".to_string(),
            ));
        }
        self.inner.read(buf)
    }

    fn close(&mut self) {
        self.inner.close()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_microphone_drop_out() {
    let dir = tempdir().unwrap();
    let mut deps = headless();
    deps.microphones = Arc::new(FlakyMicrophones {
        inner: ToneMicrophoneSource::new(),
        opened: AtomicUsize::new(0),
        fail_after: Duration::from_millis(200),
    });
    let session = spawn(&dir, deps);
    let mut events = session.subscribe();

    record(&session, Duration::from_millis(1_000)).await;

    let failed = drain(&mut events).into_iter().find_map(|e| match e {
        RecordingEvent::SegmentFailed { ordinal, error } => Some((ordinal, error)),
        _ => None,
    });
    let (ordinal, error) = failed.unwrap();
    assert_eq!(ordinal, 0);
    assert_eq!(error.code, "DEVICE_UNAVAILABLE");
    assert!(durable_files(&dir).is_empty());
    assert!(temp_files(&dir).is_empty());
    assert_eq!(
        session.snapshot().await.unwrap().state,
        CoordinatorState::Idle
    );

    // The failed ordinal is reused
    record(&session, Duration::from_millis(500)).await;
    assert_eq!(durable_files(&dir), vec!["0.mp4"]);
    let snapshot = session.snapshot().await.unwrap();
    assert_eq!(snapshot.segments.len(), 1);
    assert_eq!(snapshot.segments[0].status, SegmentStatus::Promoted);
    session.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_missing_devices_leave_no_files() {
    let dir = tempdir().unwrap();
    let mut deps = headless();
    deps.cameras = Arc::new(VirtualCameraDriver::unavailable());
    let session = spawn(&dir, deps);

    let err = session.start_record().await.unwrap_err();
    assert_eq!(err.code(), "DEVICE_UNAVAILABLE");
    assert_eq!(
        session.snapshot().await.unwrap().state,
        CoordinatorState::Idle
    );
    session.shutdown().await.unwrap();

    let mut deps = headless();
    deps.microphones = Arc::new(ToneMicrophoneSource::unavailable());
    let session = spawn(&dir, deps);
    let mut events = session.subscribe();

    let err = session.start_record().await.unwrap_err();
    assert_eq!(err.code(), "DEVICE_UNAVAILABLE");
    let snapshot = session.snapshot().await.unwrap();
    assert_eq!(snapshot.state, CoordinatorState::Idle);
    assert!(snapshot.current.is_none());
    assert!(temp_files(&dir).is_empty());
    assert!(durable_files(&dir).is_empty());
    assert!(matches!(
        drain(&mut events).as_slice(),
        [RecordingEvent::Error { .. }]
    ));
    session.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_quick_press_writes_playable_segment() {
    let dir = tempdir().unwrap();
    let session = spawn(&dir, headless());

    let pressed = Instant::now();
    session.start_record().await.unwrap();
    session.stop_record().await.unwrap();
    let held_us = pressed.elapsed().as_micros() as u64;
    let snapshot = session.snapshot().await.unwrap();
    assert_eq!(snapshot.state, CoordinatorState::Idle);
    assert!(temp_files(&dir).is_empty());

    assert_eq!(durable_files(&dir), vec!["0.mp4"]);
    let tracks = read_tracks(&dir.path().join("work/session/0.mp4"));
    assert_eq!(tracks.len(), 2);
    // One frame at most when released within a frame period
    let allowed = (1 + held_us / FRAME_US) as usize;
    assert!(track(&tracks, TrackKind::Video).len() <= allowed);
    session.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_context_loss_while_idle_keeps_segments() {
    let dir = tempdir().unwrap();
    let session = spawn(&dir, headless());

    record(&session, Duration::from_millis(500)).await;
    let before = session.render_state().await.unwrap().context_id;
    session.pause().await.unwrap();
    assert_eq!(session.render_state().await.unwrap().context_id, None);
    session.resume().await.unwrap();

    let after = session.render_state().await.unwrap().context_id;
    assert!(after.is_some());
    assert_ne!(before, after);
    assert_eq!(durable_files(&dir), vec!["0.mp4"]);

    record(&session, Duration::from_millis(500)).await;
    assert_eq!(durable_files(&dir), vec!["0.mp4", "1.mp4"]);
    session.shutdown().await.unwrap();
}
