//! Process lifecycle subsystem.
//!
//! # Data Flow
//! ```text
//! start:
//!     resolve config → init servers → detach (daemon.rs)
//!     → lock pid file (pidfile.rs) → launch generation (generation.rs)
//!
//! SIGUSR2 (signals.rs):
//!     re-resolve → re-init → launch next generation on inherited sockets
//!     → drain previous generation in the background
//!
//! SIGTERM/SIGINT (signals.rs):
//!     drain → release pid file → exit
//!
//! stop / reload:
//!     read pid file → deliver SIGTERM / SIGUSR2
//! ```
//!
//! # Design Decisions
//! - Draining has two deadlines: `stop_timeout` for in-flight requests,
//!   then `kill_timeout` before remaining connections are aborted
//! - Unix only (flock, kill, setsid)

pub mod daemon;
pub mod generation;
pub mod pidfile;
pub mod signals;
pub mod supervisor;

pub use generation::{Generation, Launch};
pub use pidfile::{LookupError, PidFile, PidFileError};
pub use signals::Control;
pub use supervisor::{Supervisor, SupervisorError, DEFAULT_CONF_FILE, VERSION};
