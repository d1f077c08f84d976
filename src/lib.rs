//! Roost: an embeddable HTTP server runtime.
//!
//! A host application registers routes and handler chains on one or more
//! [`ServerInstance`]s and hands them to [`cli::run`]. The runtime resolves
//! a YAML configuration, daemonizes, serves every enabled instance and
//! supports graceful stop and reload.

pub mod cli;
pub mod config;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod proxy;

pub use config::{ConfigTree, ResolveContext, ServerConfig};
pub use http::{handler, sync_handler, Flow, Request, ServerInstance};
pub use lifecycle::{Supervisor, SupervisorError};
pub use proxy::ProxyOverrides;
