//! stitchcam - segmented camera capture.
//!
//! Record short clips from a camera and microphone, one segment file per
//! press, and stitch the promoted segments into a single movie without
//! re-encoding.

pub mod capture;
pub mod encoder;
pub mod export;
pub mod muxer;
pub mod recorder;
pub mod render;
pub mod utils;

pub use recorder::{
    CoordinatorDeps, RecorderSettings, RecordingEvent, SessionCoordinator, SessionHandle,
    SessionPaths,
};
pub use utils::error::{CaptureError, CaptureResult, ErrorResponse};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global tracing subscriber. `RUST_LOG` overrides the default
/// filter.
pub fn init_tracing() {
    let result = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stitchcam=debug,stitchcam_lib=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
    if result.is_ok() {
        tracing::info!("Starting stitchcam v{}", env!("CARGO_PKG_VERSION"));
    }
}
