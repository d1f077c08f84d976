//! Configuration loading from disk.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::config::schema::RawConfig;
use crate::config::tree::{ConfigTree, ResolveContext};
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading. Every variant names the file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid configuration {}: {}", .path.display(), join(.errors))]
    Invalid {
        path: PathBuf,
        errors: Vec<ValidationError>,
    },
}

impl ConfigError {
    /// The configuration file the error refers to.
    pub fn path(&self) -> &Path {
        match self {
            ConfigError::Read { path, .. }
            | ConfigError::Parse { path, .. }
            | ConfigError::Invalid { path, .. } => path,
        }
    }
}

fn join(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Resolve the configuration at `path`.
///
/// A missing file is not an error: the tree is built from compiled defaults.
pub fn resolve(path: &Path, context: &ResolveContext) -> Result<ConfigTree, ConfigError> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "Configuration file absent, using defaults");
        return Ok(ConfigTree::defaults(context.clone()));
    }

    let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let raw: RawConfig = if content.trim().is_empty() {
        RawConfig::default()
    } else {
        serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?
    };

    let tree = ConfigTree::from_raw(raw, context.clone());
    validate_config(&tree).map_err(|errors| ConfigError::Invalid {
        path: path.to_path_buf(),
        errors,
    })?;

    Ok(tree)
}
