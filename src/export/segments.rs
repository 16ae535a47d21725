//! Segment directories
//!
//! ```text
//! <base>/session_temp/<ordinal>.<ext>   being written or just finished
//! <base>/session/<ordinal>.<ext>        promoted, waiting for the stitch
//! ```

use crate::utils::error::{CaptureError, CaptureResult};
use std::fs;
use std::path::{Path, PathBuf};

pub const TEMP_DIR: &str = "session_temp";
pub const DURABLE_DIR: &str = "session";

/// The temporary and durable segment directories of one base directory
#[derive(Debug, Clone)]
pub struct SegmentStore {
    temp_dir: PathBuf,
    durable_dir: PathBuf,
    extension: &'static str,
}

impl SegmentStore {
    /// Create both directories. Leftovers in the temporary directory are
    /// deleted; promoted segments from an earlier run are kept.
    pub fn open(base: &Path, extension: &'static str) -> CaptureResult<Self> {
        let store = Self {
            temp_dir: base.join(TEMP_DIR),
            durable_dir: base.join(DURABLE_DIR),
            extension,
        };
        fs::create_dir_all(&store.temp_dir)?;
        fs::create_dir_all(&store.durable_dir)?;
        clear_dir(&store.temp_dir)?;

        let kept = store.list_durable()?.len();
        if kept > 0 {
            tracing::info!("Found {} promoted segments in {:?}", kept, store.durable_dir);
        }
        Ok(store)
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    pub fn durable_dir(&self) -> &Path {
        &self.durable_dir
    }

    fn file_name(&self, ordinal: u32) -> String {
        format!("{}.{}", ordinal, self.extension)
    }

    pub fn temp_path(&self, ordinal: u32) -> PathBuf {
        self.temp_dir.join(self.file_name(ordinal))
    }

    pub fn durable_path(&self, ordinal: u32) -> PathBuf {
        self.durable_dir.join(self.file_name(ordinal))
    }

    /// Move a finished segment into the durable directory, keeping its
    /// ordinal
    pub fn promote(&self, ordinal: u32) -> CaptureResult<PathBuf> {
        let from = self.temp_path(ordinal);
        let to = self.durable_path(ordinal);
        fs::rename(&from, &to).map_err(|e| {
            CaptureError::MuxerIo(format!("failed to promote segment {}: {}", ordinal, e))
        })?;
        tracing::debug!("Promoted segment {} to {:?}", ordinal, to);
        Ok(to)
    }

    /// Delete a temporary segment file if it exists
    pub fn discard_temp(&self, ordinal: u32) -> CaptureResult<()> {
        match fs::remove_file(self.temp_path(ordinal)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Promoted segments in ordinal order. Files that do not look like
    /// segments are ignored.
    pub fn list_durable(&self) -> CaptureResult<Vec<(u32, PathBuf)>> {
        let mut segments = Vec::new();
        for entry in fs::read_dir(&self.durable_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(self.extension) {
                continue;
            }
            let ordinal = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u32>().ok());
            if let Some(ordinal) = ordinal {
                segments.push((ordinal, path));
            }
        }
        segments.sort_by_key(|(ordinal, _)| *ordinal);
        Ok(segments)
    }

    /// One past the highest promoted ordinal
    pub fn next_ordinal(&self) -> CaptureResult<u32> {
        Ok(self
            .list_durable()?
            .last()
            .map(|(ordinal, _)| ordinal + 1)
            .unwrap_or(0))
    }

    /// Delete every segment in both directories
    pub fn purge(&self) -> CaptureResult<()> {
        clear_dir(&self.temp_dir)?;
        clear_dir(&self.durable_dir)?;
        tracing::debug!("Purged segment directories");
        Ok(())
    }
}

fn clear_dir(dir: &Path) -> CaptureResult<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_promote_keeps_ordinal_and_order() {
        let dir = tempdir().unwrap();
        let store = SegmentStore::open(dir.path(), "mp4").unwrap();
        assert_eq!(store.next_ordinal().unwrap(), 0);

        for ordinal in [2, 0, 10, 1] {
            fs::write(store.temp_path(ordinal), b"segment").unwrap();
            store.promote(ordinal).unwrap();
        }
        fs::write(store.durable_dir().join("notes.txt"), b"x").unwrap();
        fs::write(store.durable_dir().join("final.mp4"), b"x").unwrap();

        let ordinals: Vec<u32> = store.list_durable().unwrap().iter().map(|s| s.0).collect();
        assert_eq!(ordinals, vec![0, 1, 2, 10]);
        assert_eq!(store.next_ordinal().unwrap(), 11);
        assert!(!store.temp_path(2).exists());
    }

    #[test]
    fn test_open_clears_temp_but_keeps_durable() {
        let dir = tempdir().unwrap();
        let store = SegmentStore::open(dir.path(), "mp4").unwrap();
        fs::write(store.temp_path(0), b"partial").unwrap();
        fs::write(store.durable_path(3), b"done").unwrap();

        let store = SegmentStore::open(dir.path(), "mp4").unwrap();
        assert!(!store.temp_path(0).exists());
        assert_eq!(store.next_ordinal().unwrap(), 4);

        store.purge().unwrap();
        assert!(store.list_durable().unwrap().is_empty());
        assert!(store.discard_temp(9).is_ok());
    }

    #[test]
    fn test_promote_missing_file_fails() {
        let dir = tempdir().unwrap();
        let store = SegmentStore::open(dir.path(), "mp4").unwrap();
        let err = store.promote(5).unwrap_err();
        assert_eq!(err.code(), "MUXER_IO");
    }
}
