//! Process id file.
//!
//! # Responsibilities
//! - Record the serving process id under an exclusive lock
//! - Read it back for `stop` / `reload`
//!
//! # Design Decisions
//! - `flock(LOCK_EX | LOCK_NB)` makes a second `start` against the same
//!   configuration fail instead of waiting
//! - The file is removed on clean shutdown only; a crash leaves it stale

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Error type for acquiring the pid file.
#[derive(Debug, Error)]
pub enum PidFileError {
    #[error("failed to open pid file {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("pid file {} is locked by another process", .path.display())]
    Locked { path: PathBuf },

    #[error("failed to write pid file {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Error type for reading a pid back.
#[derive(Debug, Error)]
pub enum LookupError {
    #[error("pid file {} does not exist", .path.display())]
    Missing { path: PathBuf },

    #[error("failed to read pid file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("pid file {} holds '{content}', not a process id", .path.display())]
    Invalid { path: PathBuf, content: String },
}

/// A locked pid file, held for the daemon's lifetime.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    file: File,
}

impl PidFile {
    /// Lock `path` and write the current process id into it.
    pub fn acquire(path: &Path) -> Result<Self, PidFileError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o644)
            .open(path)
            .map_err(|source| PidFileError::Open {
                path: path.to_path_buf(),
                source,
            })?;

        try_lock(&file, path)?;

        let write_err = |source: io::Error| PidFileError::Write {
            path: path.to_path_buf(),
            source,
        };
        file.set_len(0).map_err(write_err)?;
        writeln!(file, "{}", std::process::id()).map_err(write_err)?;
        file.sync_all().map_err(write_err)?;

        tracing::debug!(path = %path.display(), pid = std::process::id(), "Pid file locked");
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the file and drop the lock.
    pub fn release(self) {
        if let Err(err) = fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %err, "Failed to remove pid file");
        }
        drop(self.file);
    }
}

/// Fail with [`PidFileError::Locked`] if another process holds `path`.
///
/// The trial lock is dropped before returning, so a detached worker can take
/// it right after. A missing file is free.
pub fn ensure_unlocked(path: &Path) -> Result<(), PidFileError> {
    let file = match OpenOptions::new().read(true).open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(source) => {
            return Err(PidFileError::Open {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    try_lock(&file, path)
}

fn try_lock(file: &File, path: &Path) -> Result<(), PidFileError> {
    // SAFETY: the descriptor is owned by `file` and stays open for the call.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        return Err(if err.kind() == io::ErrorKind::WouldBlock {
            PidFileError::Locked {
                path: path.to_path_buf(),
            }
        } else {
            PidFileError::Open {
                path: path.to_path_buf(),
                source: err,
            }
        });
    }
    Ok(())
}

/// Read the process id stored at `path`.
pub fn read_pid(path: &Path) -> Result<i32, LookupError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(LookupError::Missing {
                path: path.to_path_buf(),
            })
        }
        Err(source) => {
            return Err(LookupError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    match content.trim().parse::<i32>() {
        Ok(pid) if pid > 0 => Ok(pid),
        _ => Err(LookupError::Invalid {
            path: path.to_path_buf(),
            content: content.trim().to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_writes_pid_and_release_removes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roost.pid");

        let pid_file = PidFile::acquire(&path).unwrap();
        assert_eq!(read_pid(&path).unwrap(), std::process::id() as i32);

        pid_file.release();
        assert!(!path.exists());
    }

    #[test]
    fn second_acquire_is_locked_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roost.pid");

        let _held = PidFile::acquire(&path).unwrap();
        assert!(matches!(
            PidFile::acquire(&path),
            Err(PidFileError::Locked { .. })
        ));
    }

    #[test]
    fn unlocked_check_sees_holder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roost.pid");
        ensure_unlocked(&path).unwrap();

        let held = PidFile::acquire(&path).unwrap();
        assert!(matches!(
            ensure_unlocked(&path),
            Err(PidFileError::Locked { .. })
        ));

        held.release();
        ensure_unlocked(&path).unwrap();

        // A stale file left by a crash is not a lock.
        fs::write(&path, "4242\n").unwrap();
        ensure_unlocked(&path).unwrap();
        PidFile::acquire(&path).unwrap();
    }

    #[test]
    fn stale_content_is_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roost.pid");
        fs::write(&path, "99999999999\n").unwrap();

        let _held = PidFile::acquire(&path).unwrap();
        assert_eq!(read_pid(&path).unwrap(), std::process::id() as i32);
    }

    #[test]
    fn lookup_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roost.pid");
        assert!(matches!(read_pid(&path), Err(LookupError::Missing { .. })));

        fs::write(&path, "not-a-pid").unwrap();
        assert!(matches!(read_pid(&path), Err(LookupError::Invalid { .. })));

        fs::write(&path, "").unwrap();
        assert!(matches!(read_pid(&path), Err(LookupError::Invalid { .. })));

        fs::write(&path, "4242\n").unwrap();
        assert_eq!(read_pid(&path).unwrap(), 4242);
    }
}
