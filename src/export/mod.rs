//! Segment storage and final export
//!
//! Finished segments are promoted from the temporary directory into the
//! durable one; finalizing a session stitches them into a single file.

pub mod segments;
pub mod stitch;

pub use segments::{SegmentStore, DURABLE_DIR, TEMP_DIR};
pub use stitch::{final_output_path, StitchReport, StitchedSegment, Stitcher};
