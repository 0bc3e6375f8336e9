//! Per-item scratch directories.

use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::core::is_safe_id;

/// A scratch directory that is removed when the guard is dropped, unless it
/// was acquired with `keep`.
///
/// Removal also runs on early return and unwinding, so a failed or panicking
/// item never leaks its downloads.
#[derive(Debug)]
pub struct WorkArea {
    path: PathBuf,
    keep: bool,
}

impl WorkArea {
    /// Creates `<work_dir>/<id>`. Leftovers from an earlier attempt are
    /// cleared first unless `keep` is set.
    ///
    /// `id` must be a single path component; anything else is refused before
    /// the filesystem is touched, so the guard only ever removes direct
    /// children of `work_dir`.
    pub fn acquire(work_dir: &Path, id: &str, keep: bool) -> io::Result<Self> {
        if !is_safe_id(id) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("refusing work area for unusable id {id:?}"),
            ));
        }
        let path = work_dir.join(id);
        if !keep && path.exists() {
            std::fs::remove_dir_all(&path)?;
        }
        std::fs::create_dir_all(&path)?;
        Ok(Self { path, keep })
    }

    /// The directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkArea {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to remove work area");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vid1");
        {
            let area = WorkArea::acquire(dir.path(), "vid1", false).unwrap();
            std::fs::write(area.path().join("audio.m4a"), b"data").unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_stale_contents_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vid1");
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join("partial.part"), b"x").unwrap();

        let area = WorkArea::acquire(dir.path(), "vid1", false).unwrap();
        assert!(!area.path().join("partial.part").exists());
    }

    #[test]
    fn test_keep_leaves_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vid1");
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join("audio.m4a"), b"x").unwrap();

        drop(WorkArea::acquire(dir.path(), "vid1", true).unwrap());
        assert!(path.join("audio.m4a").exists());
    }

    #[test]
    fn test_removed_on_panic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vid1");
        let work_dir = dir.path().to_path_buf();

        let result = std::panic::catch_unwind(move || {
            let _area = WorkArea::acquire(&work_dir, "vid1", false).unwrap();
            panic!("collaborator blew up");
        });

        assert!(result.is_err());
        assert!(!path.exists());
    }

    #[test]
    fn test_refuses_paths_outside_work_dir() {
        let root = tempfile::tempdir().unwrap();
        let work_dir = root.path().join("work");
        let victim = root.path().join("victim");
        std::fs::create_dir_all(&victim).unwrap();
        std::fs::write(victim.join("precious.txt"), b"keep me").unwrap();

        for id in ["../victim", "..", ".", "", "/tmp", "a/b"] {
            let err = WorkArea::acquire(&work_dir, id, false).unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::InvalidInput, "id {id:?}");
        }
        assert!(victim.join("precious.txt").exists());
        assert!(!work_dir.exists());
    }
}
