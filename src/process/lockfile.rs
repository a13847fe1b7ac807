//! Single-instance lock file.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("cannot lock {}: program already running", path.display())]
    AlreadyRunning { path: PathBuf },
    #[error("error while locking lock file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Advisory exclusive lock backed by flock(2).
///
/// Released automatically if the holding process dies; on clean release the
/// file is also removed. The unlink happens while the lock is still held, and
/// [`LockFile::acquire`] only keeps a lock on the inode currently linked at
/// the path, so a waiter that locked the removed file retries instead.
#[derive(Debug)]
pub struct LockFile {
    file: Option<File>,
    path: PathBuf,
}

impl LockFile {
    /// Try to acquire without blocking.
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        let io_err = |source| LockError::Io {
            path: path.to_path_buf(),
            source,
        };
        loop {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(path)
                .map_err(io_err)?;

            match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
                Ok(()) => {}
                Err(Errno::EWOULDBLOCK) => {
                    return Err(LockError::AlreadyRunning {
                        path: path.to_path_buf(),
                    })
                }
                Err(errno) => return Err(io_err(errno.into())),
            }

            if still_linked(&file, path).map_err(io_err)? {
                tracing::debug!(path = %path.display(), "Lock file acquired");
                return Ok(Self {
                    file: Some(file),
                    path: path.to_path_buf(),
                });
            }
            // The previous holder removed the file between our open and flock.
            tracing::debug!(path = %path.display(), "Lock file replaced, retrying");
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unlock and remove the file.
    pub fn release(mut self) {
        self.unlock();
    }

    fn unlock(&mut self) {
        let Some(file) = self.file.take() else {
            return;
        };
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "Cannot remove lock file");
        }
        let _ = flock(file.as_raw_fd(), FlockArg::Unlock);
        tracing::debug!(path = %self.path.display(), "Lock file released");
    }
}

/// Whether `file` is still the inode linked at `path`.
fn still_linked(file: &File, path: &Path) -> io::Result<bool> {
    let held = file.metadata()?;
    match std::fs::metadata(path) {
        Ok(current) => Ok(current.dev() == held.dev() && current.ino() == held.ino()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        self.unlock();
    }
}
