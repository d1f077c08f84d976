//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Start / reload
//!     → listener.rs (bind with SO_REUSEADDR + SO_REUSEPORT, or duplicate the
//!       previous generation's socket for an unchanged address)
//!     → tls.rs (optional rustls acceptor from cert + key)
//!     → axum-server accept loop owned by the supervisor's generation
//! ```
//!
//! # Design Decisions
//! - Each listener failure is reported per server and aggregated
//! - TLS is optional and handled transparently

pub mod listener;
pub mod tls;

pub use listener::{bind, ListenError, ListenErrors};
