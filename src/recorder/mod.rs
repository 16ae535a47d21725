//! Recording session
//!
//! - [`SessionCoordinator`] runs the record state machine on its own thread
//! - [`SessionHandle`] is the async front door the UI talks to
//! - [`RecorderSettings`] is the user configuration each segment is built from

pub mod coordinator;
pub mod settings;
pub mod state;

pub use coordinator::{CoordinatorDeps, SessionCoordinator, SessionHandle, SessionPaths};
pub use settings::RecorderSettings;
pub use state::{
    CoordinatorState, RecordingEvent, Segment, SegmentStatus, SessionConfig, SessionSnapshot,
};
