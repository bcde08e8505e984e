//! Scratch directories for downloaded media.
//!
//! Each task owns one scratch directory under the media root. Files land
//! under a temp name and are renamed once complete, so a partially written
//! download is never observed at its final path. The directory is removed
//! on drop, which also covers cancellation.

use crate::error::Result;
use rand::RngCore;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

/// Overwrite passes used by [`secure_delete`]
const SECURE_DELETE_PASSES: usize = 3;

/// A task-scoped scratch directory. Dropping it removes the directory and
/// everything inside.
pub struct ScratchDir {
    root: PathBuf,
}

impl ScratchDir {
    /// Create a fresh scratch directory under `media_dir`.
    pub fn create(media_dir: &Path) -> Result<Self> {
        let root = media_dir.join("scratch").join(Uuid::new_v4().to_string());
        std::fs::create_dir_all(&root)?;
        Ok(ScratchDir { root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Final path for a file named by its upstream identity.
    pub fn file_path(&self, name: &str) -> PathBuf {
        // Names come from upstream; keep only the basename.
        let base = Path::new(name)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        self.root.join(base)
    }

    /// Temp-name counterpart used while a download is in flight.
    pub fn temp_path(&self, name: &str) -> PathBuf {
        let final_path = self.file_path(name);
        let mut temp_name = final_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        temp_name.push_str(".part");
        self.root.join(temp_name)
    }

    /// Promote a completed temp file to its final name.
    pub fn commit(&self, name: &str) -> Result<PathBuf> {
        let temp = self.temp_path(name);
        let final_path = self.file_path(name);
        std::fs::rename(&temp, &final_path)?;
        Ok(final_path)
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.root) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to remove scratch dir {}: {}", self.root.display(), e);
            }
        }
    }
}

/// Overwrite a file with zeros, ones, then random bytes before unlinking.
/// Operator-triggered cleanup; ordinary scratch files just get unlinked.
pub fn secure_delete(path: &Path) -> Result<()> {
    let len = match std::fs::metadata(path) {
        Ok(meta) => meta.len() as usize,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    let mut rng = rand::thread_rng();
    for pass in 0..SECURE_DELETE_PASSES {
        let buf = match pass {
            0 => vec![0u8; len],
            1 => vec![0xffu8; len],
            _ => {
                let mut buf = vec![0u8; len];
                rng.fill_bytes(&mut buf);
                buf
            }
        };
        let mut file = OpenOptions::new().write(true).open(path)?;
        file.write_all(&buf)?;
        file.sync_all()?;
    }

    std::fs::remove_file(path)?;
    debug!("securely deleted {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scratch_lifecycle() {
        let media = tempfile::tempdir().unwrap();
        let scratch = ScratchDir::create(media.path()).unwrap();
        let root = scratch.path().to_path_buf();
        assert!(root.is_dir());

        std::fs::write(scratch.temp_path("vol.rar"), b"data").unwrap();
        let final_path = scratch.commit("vol.rar").unwrap();
        assert_eq!(std::fs::read(&final_path).unwrap(), b"data");
        assert!(!scratch.temp_path("vol.rar").exists());

        drop(scratch);
        assert!(!root.exists());
    }

    #[test]
    fn test_file_path_strips_directories() {
        let media = tempfile::tempdir().unwrap();
        let scratch = ScratchDir::create(media.path()).unwrap();
        let path = scratch.file_path("nested/dir/evil.bin");
        assert_eq!(path.parent().unwrap(), scratch.path());
        assert_eq!(path.file_name().unwrap(), "evil.bin");
    }

    #[test]
    fn test_secure_delete_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret.bin");
        std::fs::write(&path, b"sensitive bytes").unwrap();
        secure_delete(&path).unwrap();
        assert!(!path.exists());
        // Deleting a missing file is not an error.
        secure_delete(&path).unwrap();
    }
}
