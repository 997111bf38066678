//! Durable publishing of finished recordings.

use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::{RecorderError, Result};

/// Where finished recordings end up (a media library, a user folder, ...).
pub trait DurableStorage: Send + Sync {
    /// Copy `source` into storage under `desired_name` and return the
    /// published location. The copy must be complete when this returns.
    fn publish(&self, source: &Path, desired_name: &str) -> Result<PathBuf>;
}

/// Publishes into a plain directory.
#[derive(Debug, Clone)]
pub struct DirectoryStorage {
    root: PathBuf,
}

impl DirectoryStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `desired_name`, or `stem (n).ext` if that is taken.
    fn free_name(&self, desired_name: &str) -> PathBuf {
        let candidate = self.root.join(desired_name);
        if !candidate.exists() {
            return candidate;
        }
        let path = Path::new(desired_name);
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| desired_name.to_string());
        let ext = path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        (1..)
            .map(|n| self.root.join(format!("{} ({}){}", stem, n, ext)))
            .find(|p| !p.exists())
            .unwrap_or(candidate)
    }
}

impl DurableStorage for DirectoryStorage {
    fn publish(&self, source: &Path, desired_name: &str) -> Result<PathBuf> {
        if desired_name.is_empty() || desired_name.contains(['/', '\\']) {
            return Err(RecorderError::ConfigurationRejected(format!(
                "Invalid published file name '{}'",
                desired_name
            )));
        }
        fs::create_dir_all(&self.root).map_err(|e| {
            RecorderError::StreamIOFailure(format!("Failed to create {:?}: {}", self.root, e))
        })?;

        let target = self.free_name(desired_name);
        let copied = fs::copy(source, &target).map_err(|e| {
            RecorderError::StreamIOFailure(format!(
                "Failed to publish {:?} to {:?}: {}",
                source, target, e
            ))
        })?;

        let expected = fs::metadata(source)?.len();
        if copied != expected || fs::metadata(&target)?.len() != expected {
            let _ = fs::remove_file(&target);
            return Err(RecorderError::StreamIOFailure(format!(
                "Published copy {:?} is incomplete ({} of {} bytes)",
                target, copied, expected
            )));
        }

        log::info!("Published recording to {:?} ({} bytes)", target, copied);
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_copies_and_keeps_source() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("mix.mp4");
        fs::write(&source, b"0123456789").unwrap();

        let storage = DirectoryStorage::new(dir.path().join("out"));
        let published = storage.publish(&source, "Recording_1.mp4").unwrap();

        assert_eq!(published, dir.path().join("out").join("Recording_1.mp4"));
        assert_eq!(fs::read(&published).unwrap(), b"0123456789");
        assert!(source.exists());
    }

    #[test]
    fn test_publish_avoids_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.mp4");
        fs::write(&source, b"abc").unwrap();
        let storage = DirectoryStorage::new(dir.path());

        let first = storage.publish(&source, "r.mp4").unwrap();
        let second = storage.publish(&source, "r.mp4").unwrap();
        assert_ne!(first, second);
        assert_eq!(second.file_name().unwrap(), "r (1).mp4");
    }

    #[test]
    fn test_publish_rejects_path_names() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.mp4");
        fs::write(&source, b"abc").unwrap();
        let storage = DirectoryStorage::new(dir.path());
        assert!(storage.publish(&source, "../escape.mp4").is_err());
        assert!(storage.publish(&dir.path().join("missing.mp4"), "x.mp4").is_err());
    }
}
