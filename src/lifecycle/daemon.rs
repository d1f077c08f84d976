//! Background daemon.
//!
//! `start` re-executes the current binary once with [`DAEMON_ENV`] set. The
//! child sees the marker, skips detaching and serves; the parent returns.

use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};

/// Marks the detached worker process.
pub const DAEMON_ENV: &str = "ROOST_DAEMON";

/// Whether this process is the detached worker.
pub fn is_daemon() -> bool {
    std::env::var_os(DAEMON_ENV).is_some_and(|v| v == "1")
}

/// Spawn the detached worker and return its pid.
///
/// The worker gets the same arguments, stdin from `/dev/null`, stdout and
/// stderr appended to `log`, and a new session.
pub fn detach(log: &Path) -> io::Result<u32> {
    let exe = std::env::current_exe()?;
    let args: Vec<OsString> = std::env::args_os().skip(1).collect();
    detach_with(&exe, &args, log)
}

fn detach_with(exe: &Path, args: &[OsString], log: &Path) -> io::Result<u32> {
    if let Some(dir) = log.parent() {
        fs::create_dir_all(dir)?;
    }
    let stdout = OpenOptions::new().create(true).append(true).open(log)?;
    let stderr = stdout.try_clone()?;

    let mut command = Command::new(exe);
    command
        .args(args)
        .env(DAEMON_ENV, "1")
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr);

    // SAFETY: setsid(2) is async-signal-safe and touches no parent state.
    unsafe {
        command.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = command.spawn()?;
    tracing::debug!(pid = child.id(), exe = %exe.display(), "Daemon spawned");
    Ok(child.id())
}
