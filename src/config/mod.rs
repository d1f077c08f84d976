//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (YAML)
//!     → loader.rs (read & deserialize, missing file → defaults)
//!     → tree.rs (defaults, one-way inheritance, settings merge)
//!     → validation.rs (semantic checks)
//!     → ConfigTree (resolved, immutable)
//!     → shared via Arc with every server generation
//!
//! On reload signal:
//!     supervisor re-resolves the same file
//!     → a new tree replaces the old one wholesale
//!     → the new generation of listeners is built from it
//! ```
//!
//! # Design Decisions
//! - Config is immutable once resolved; changes require a reload
//! - All fields have defaults to allow minimal configs
//! - Zero means unset: a server cannot override a global value down to zero

pub mod loader;
pub mod schema;
pub mod tree;
pub mod validation;

pub use loader::{resolve, ConfigError};
pub use schema::{GlobalSpec, ModuleSettings, RawConfig, ServerSpec, UpstreamSpec};
pub use tree::{ConfigTree, ResolveContext, ServerConfig, TlsPaths};
pub use validation::ValidationError;
