//! stitchcam driver
//!
//! Runs a scripted session: records each clip in `--clips`, then stitches
//! the promoted segments into one movie and prints the report as JSON.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use stitchcam_lib::capture::Facing;
use stitchcam_lib::render::{FilterMode, PreviewSink};
use stitchcam_lib::{
    CoordinatorDeps, RecorderSettings, RecordingEvent, SessionCoordinator, SessionPaths,
};

#[derive(Parser, Debug)]
#[command(name = "stitchcam")]
#[command(about = "Record camera clips and stitch them into one movie", long_about = None)]
struct Args {
    /// Directory holding session_temp/ and session/
    #[arg(long, default_value = "stitchcam-data")]
    base: PathBuf,

    /// Where the stitched movie is written
    #[arg(long, default_value = "stitchcam-movies")]
    movies: PathBuf,

    /// JSON settings file; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    width: Option<u32>,

    #[arg(long)]
    height: Option<u32>,

    /// Video bitrate in bits per second
    #[arg(long)]
    bitrate: Option<u32>,

    #[arg(long)]
    sample_rate: Option<u32>,

    /// Clip lengths in seconds, comma separated
    #[arg(long, value_delimiter = ',', default_values_t = vec![2.0])]
    clips: Vec<f64>,

    /// normal, blackWhite, blur, sharpen, edgeDetect or emboss
    #[arg(long)]
    filter: Option<FilterMode>,

    /// Start on the front camera
    #[arg(long)]
    front: bool,
}

impl Args {
    fn settings(&self) -> Result<RecorderSettings> {
        let mut settings = match &self.config {
            Some(path) => RecorderSettings::from_file(path)
                .with_context(|| format!("failed to load settings from {:?}", path))?,
            None => RecorderSettings::default(),
        };
        if let Some(width) = self.width {
            settings.width = width;
        }
        if let Some(height) = self.height {
            settings.height = height;
        }
        if self.bitrate.is_some() {
            settings.video_bitrate = self.bitrate;
        }
        if let Some(rate) = self.sample_rate {
            settings.sample_rate = rate;
        }
        if let Some(filter) = self.filter {
            settings.filter = filter;
        }
        if self.front {
            settings.facing = Facing::Front;
        }
        Ok(settings)
    }
}

fn deps(settings: &RecorderSettings) -> CoordinatorDeps {
    #[allow(unused_mut)]
    let mut deps = CoordinatorDeps::headless(PreviewSink::new(settings.width, settings.height));

    #[cfg(feature = "webcam")]
    {
        deps.cameras = std::sync::Arc::new(stitchcam_lib::capture::WebcamDriver::new());
    }
    #[cfg(feature = "microphone")]
    {
        deps.microphones = std::sync::Arc::new(stitchcam_lib::capture::CpalMicrophoneSource);
    }
    deps
}

#[tokio::main]
async fn main() -> Result<()> {
    stitchcam_lib::init_tracing();
    let args = Args::parse();
    let settings = args.settings()?;

    tracing::info!(
        "Recording {} clip(s) at {}x{}, audio {} Hz",
        args.clips.len(),
        settings.width,
        settings.height,
        settings.sample_rate
    );

    let paths = SessionPaths {
        base_dir: args.base.clone(),
        movies_dir: args.movies.clone(),
    };
    let deps = deps(&settings);
    let session = SessionCoordinator::spawn(settings, paths, deps)
        .context("failed to start the capture session")?;

    let mut events = session.subscribe();
    let logger = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match &event {
                RecordingEvent::SegmentFailed { ordinal, error } => {
                    tracing::warn!("Segment {} failed: {}", ordinal, error.message)
                }
                other => tracing::debug!("Event: {:?}", other),
            }
        }
    });

    for (index, seconds) in args.clips.iter().enumerate() {
        session.start_record().await?;
        tokio::time::sleep(Duration::from_secs_f64(seconds.max(0.0))).await;
        session.stop_record().await?;
        tracing::info!("Clip {} done ({} s)", index, seconds);
        // Gap between presses
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let report = session.finalize_session().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    session.shutdown().await?;
    logger.abort();
    Ok(())
}
