//! Outbound pass-through calls.
//!
//! # Data Flow
//! ```text
//! Request::proxy_pass(address, overrides)
//!     → ProxyOptions (inbound method/scheme/path/query/headers/body)
//!     → ProxyOverrides::apply
//!     → client.rs (URL, timeouts, send)
//!     → upstream status + headers + streamed body into the response
//!
//! On failure:
//!     → 502, error logged to the server error sink, chain stops
//! ```

pub mod client;
pub mod options;

pub use client::{ProxyClient, ProxyError};
pub use options::{ProxyOptions, ProxyOverrides};
