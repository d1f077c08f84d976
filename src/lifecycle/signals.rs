//! OS signal handling.
//!
//! # Responsibilities
//! - Translate SIGTERM/SIGINT into [`Control::Stop`]
//! - Translate SIGUSR2 into [`Control::Reload`]
//! - Deliver the same signals to a running daemon for `stop` / `reload`
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - The supervisor consumes a plain channel, so tests can drive it without
//!   raising real signals

use std::io;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

/// Instruction for a serving supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Drain every listener and exit.
    Stop,
    /// Start a new generation and drain the current one.
    Reload,
}

impl Control {
    pub fn signal(self) -> libc::c_int {
        match self {
            Control::Stop => libc::SIGTERM,
            Control::Reload => libc::SIGUSR2,
        }
    }
}

/// Install handlers and forward each signal as a [`Control`].
///
/// Must be called inside a Tokio runtime.
pub fn listen() -> io::Result<mpsc::Receiver<Control>> {
    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut reload = signal(SignalKind::user_defined2())?;

    let (tx, rx) = mpsc::channel(8);
    tokio::spawn(async move {
        loop {
            let control = tokio::select! {
                _ = terminate.recv() => Control::Stop,
                _ = interrupt.recv() => Control::Stop,
                _ = reload.recv() => Control::Reload,
            };
            tracing::info!(?control, "Signal received");
            if tx.send(control).await.is_err() {
                break;
            }
        }
    });
    Ok(rx)
}

/// Deliver `control` to process `pid`.
pub fn send(pid: i32, control: Control) -> io::Result<()> {
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid, control.signal()) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Whether process `pid` still exists.
pub fn is_alive(pid: i32) -> bool {
    // SAFETY: signal 0 only performs the existence and permission check.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_mapping() {
        assert_eq!(Control::Stop.signal(), libc::SIGTERM);
        assert_eq!(Control::Reload.signal(), libc::SIGUSR2);
    }

    #[test]
    fn send_to_missing_process_fails() {
        // Far above any default pid_max.
        let err = send(i32::MAX - 1, Control::Stop).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ESRCH));
    }

    #[test]
    fn liveness() {
        assert!(is_alive(std::process::id() as i32));
        assert!(!is_alive(i32::MAX - 1));
    }
}
