/// Advisory per-project lock
///
/// Held for the whole of a snapshot or restore so two operators cannot race
/// on the same volumes. Released when dropped.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("another ragctl run holds {path} (pid {owner})")]
    Held { path: PathBuf, owner: String },

    #[error("failed to open lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug)]
pub struct StackLock {
    file: File,
    path: PathBuf,
}

impl StackLock {
    /// Take the lock without blocking
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        let io_err = |source| LockError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(io_err)?;

        if file.try_lock_exclusive().is_err() {
            let owner = std::fs::read_to_string(path)
                .map(|s| s.trim().to_string())
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "unknown".to_string());
            return Err(LockError::Held {
                path: path.to_path_buf(),
                owner,
            });
        }

        // PID is for diagnostics only
        let _ = file.set_len(0);
        let _ = writeln!(file, "{}", std::process::id());
        tracing::debug!(path = %path.display(), "Acquired stack lock");

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for StackLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
        tracing::debug!(path = %self.path.display(), "Released stack lock");
    }
}
