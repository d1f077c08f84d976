//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Supervisor, listeners, drains:
//!     → logging::init (process subscriber → stderr / daemon error log)
//!
//! Each server generation:
//!     → LogSink (error): handler and proxy failures
//!     → LogSink (access): one line per finalized request
//! ```

pub mod logging;

pub use logging::LogSink;
