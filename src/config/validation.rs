//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate listen addresses and log levels
//! - Detect duplicate server names, shared listen addresses and
//!   half-configured TLS
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Runs on the resolved tree, so inherited values are checked too

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

use thiserror::Error;

use crate::config::tree::ConfigTree;

pub const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// A single semantic problem in a configuration tree.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("server '{server}' has invalid listen address '{listen}'")]
    InvalidListen { server: String, listen: String },

    #[error("{scope} has unknown log level '{level}'")]
    InvalidLogLevel { scope: String, level: String },

    #[error("server name '{0}' is declared more than once")]
    DuplicateServer(String),

    #[error("server '{server}' listens on {listen}, already used by '{other}'")]
    DuplicateListen {
        server: String,
        other: String,
        listen: String,
    },

    #[error("server '{0}' must set both cert and key")]
    IncompleteTls(String),
}

/// Validate a resolved tree.
pub fn validate_config(tree: &ConfigTree) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if !LOG_LEVELS.contains(&tree.log_level()) {
        errors.push(ValidationError::InvalidLogLevel {
            scope: "global".to_string(),
            level: tree.log_level().to_string(),
        });
    }

    let mut seen = HashSet::new();
    let mut bound: HashMap<SocketAddr, &str> = HashMap::new();
    for server in tree.servers() {
        let name = server.name();
        if !seen.insert(name) {
            errors.push(ValidationError::DuplicateServer(name.to_string()));
        }

        match server.listen_address().parse::<SocketAddr>() {
            Err(_) => errors.push(ValidationError::InvalidListen {
                server: name.to_string(),
                listen: server.listen_address().to_string(),
            }),
            // Port 0 asks the kernel for a fresh port each time.
            Ok(addr) if server.is_enabled() && addr.port() != 0 => {
                if let Some(other) = bound.insert(addr, name) {
                    errors.push(ValidationError::DuplicateListen {
                        server: name.to_string(),
                        other: other.to_string(),
                        listen: addr.to_string(),
                    });
                }
            }
            Ok(_) => {}
        }

        if !LOG_LEVELS.contains(&server.log_level()) {
            errors.push(ValidationError::InvalidLogLevel {
                scope: format!("server '{}'", name),
                level: server.log_level().to_string(),
            });
        }

        let spec = server.spec();
        if spec.cert.is_empty() != spec.key.is_empty() {
            errors.push(ValidationError::IncompleteTls(name.to_string()));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
