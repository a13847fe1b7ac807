//! Pid file bookkeeping.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PidfileError {
    #[error("pidfile {} already exists, another instance may be running", path.display())]
    AlreadyExists { path: PathBuf },
    #[error("error while writing pidfile {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A pid file owned by this process. Removed by [`Pidfile::remove`].
#[derive(Debug)]
pub struct Pidfile {
    path: PathBuf,
}

impl Pidfile {
    /// Create `path` exclusively and write the current pid as decimal text.
    pub fn create(path: &Path) -> Result<Self, PidfileError> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|source| match source.kind() {
                std::io::ErrorKind::AlreadyExists => PidfileError::AlreadyExists {
                    path: path.to_path_buf(),
                },
                _ => PidfileError::Io {
                    path: path.to_path_buf(),
                    source,
                },
            })?;

        let pid = std::process::id();
        file.write_all(pid.to_string().as_bytes())
            .map_err(|source| PidfileError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        tracing::debug!(path = %path.display(), pid, "Pidfile written");
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the file. Failures are logged, never fatal.
    pub fn remove(self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::error!(path = %self.path.display(), error = %e, "Cannot remove pidfile");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_remove_create() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.pid");

        let pidfile = Pidfile::create(&path).unwrap();
        assert!(matches!(
            Pidfile::create(&path),
            Err(PidfileError::AlreadyExists { .. })
        ));

        pidfile.remove();
        assert!(!path.exists());

        let pidfile = Pidfile::create(&path).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, std::process::id().to_string());
        pidfile.remove();
    }
}
