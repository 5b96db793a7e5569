//! PID file guarding against a second daemon on the same sockets.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process;

use tracing::{debug, info, warn};

use crate::error::{ServerError, ServerResult};

/// Holds the daemon's PID file; removes it on drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Writes our PID to `path`.
    ///
    /// Fails with [`ServerError::AlreadyRunning`] when the file names a live
    /// process. A file naming a dead process, or holding garbage, is replaced.
    pub fn create(path: impl Into<PathBuf>) -> ServerResult<Self> {
        let path = path.into();

        match read_pid(&path) {
            Some(Ok(pid)) if process_alive(pid) => {
                return Err(ServerError::already_running(path.to_string_lossy()));
            }
            Some(Ok(pid)) => {
                warn!(path = %path.display(), pid, "Replacing PID file of a dead process");
            }
            Some(Err(contents)) => {
                warn!(path = %path.display(), contents = %contents, "Replacing unreadable PID file");
            }
            None => {}
        }

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let pid = process::id();
        let mut file = fs::File::create(&path)?;
        writeln!(file, "{pid}")?;
        file.sync_all()?;
        info!(path = %path.display(), pid, "Wrote PID file");

        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed PID file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove PID file"),
        }
    }
}

/// `None` when there is no file, `Err(contents)` when it is not a PID.
fn read_pid(path: &Path) -> Option<Result<u32, String>> {
    let contents = fs::read_to_string(path).ok()?;
    let trimmed = contents.trim();
    Some(trimmed.parse().map_err(|_| trimmed.to_string()))
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // signal 0 only probes for existence
    unsafe { libc::kill(pid, 0) == 0 }
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}
