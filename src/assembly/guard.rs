//! Cleanup of half-written outputs

use crate::config::PartialOutputPolicy;
use std::path::{Path, PathBuf};

/// Scope guard for an output that is being written
///
/// Dropped while still armed, it removes the file if the policy is
/// [`PartialOutputPolicy::Delete`]. Call [`disarm`](Self::disarm) once the
/// output is known to be good.
#[derive(Debug)]
pub struct PartialOutput {
    path: PathBuf,
    policy: PartialOutputPolicy,
    armed: bool,
}

impl PartialOutput {
    /// Guard `path` under `policy`
    pub fn new(path: impl Into<PathBuf>, policy: PartialOutputPolicy) -> Self {
        Self {
            path: path.into(),
            policy,
            armed: true,
        }
    }

    /// Guarded path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Keep the output
    pub fn disarm(mut self) -> PathBuf {
        self.armed = false;
        std::mem::take(&mut self.path)
    }
}

impl Drop for PartialOutput {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match self.policy {
            PartialOutputPolicy::Delete => match std::fs::remove_file(&self.path) {
                Ok(()) => {
                    tracing::debug!(path = %self.path.display(), "removed partial output")
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "failed to remove partial output"
                ),
            },
            PartialOutputPolicy::Keep => {
                if self.path.exists() {
                    tracing::warn!(
                        path = %self.path.display(),
                        "partial output left for inspection"
                    );
                }
            }
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn armed_guard_deletes_on_drop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ep.mp4");
        std::fs::write(&path, b"half").unwrap();

        drop(PartialOutput::new(&path, PartialOutputPolicy::Delete));
        assert!(!path.exists());
    }

    #[test]
    fn keep_policy_leaves_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ep.mp4");
        std::fs::write(&path, b"half").unwrap();

        drop(PartialOutput::new(&path, PartialOutputPolicy::Keep));
        assert!(path.exists());
    }

    #[test]
    fn disarmed_guard_keeps_output() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ep.mp4");
        std::fs::write(&path, b"whole").unwrap();

        let kept = PartialOutput::new(&path, PartialOutputPolicy::Delete).disarm();
        assert_eq!(kept, path);
        assert!(path.exists());
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        drop(PartialOutput::new(
            dir.path().join("never-written.mp4"),
            PartialOutputPolicy::Delete,
        ));
    }
}
