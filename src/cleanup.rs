/// Delete-unless-committed ownership of files being written.
use std::fs;
use std::path::PathBuf;

/// Removes its path on drop unless `commit` was called first.
///
/// Output files and freshly written key files are provisional until the
/// whole command has succeeded; arming a guard before the first write
/// keeps partial files from surviving a failure.
pub struct CleanupGuard {
    path: Option<PathBuf>,
}

impl CleanupGuard {
    pub fn arm(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    /// The command succeeded; keep the file.
    pub fn commit(mut self) {
        self.path = None;
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            let _ = fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uncommitted_guard_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial");
        fs::write(&path, b"half-written").unwrap();
        drop(CleanupGuard::arm(&path));
        assert!(!path.exists());
    }

    #[test]
    fn test_committed_guard_keeps_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("complete");
        fs::write(&path, b"done").unwrap();
        CleanupGuard::arm(&path).commit();
        assert!(path.exists());
    }

    #[test]
    fn test_guard_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        drop(CleanupGuard::arm(dir.path().join("never-created")));
    }
}
