//! Configuration schema definitions.
//!
//! The raw types below mirror the on-disk YAML document. Every field derives
//! `Default` as its zero value: a field missing from the file deserializes to
//! zero, and zero is what the resolver treats as "unset" when a server
//! inherits from `global`.
//!
//! ```yaml
//! global:
//!   pid: logs/roost.pid
//!   access_log: logs/access.log
//!   error_log: logs/error.log
//!
//! servers:
//!   - name: api
//!     listen: 127.0.0.1:8000
//!   - name: static
//!     listen: 127.0.0.1:8001
//!     enable: false
//!
//! upstreams:
//!   - name: backend
//!     servers: [127.0.0.1:9000, 127.0.0.1:9001]
//! ```

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub const DEFAULT_SERVER_NAME: &str = "default";
pub const DEFAULT_PID_FILE: &str = "logs/roost.pid";
pub const DEFAULT_ACCESS_LOG: &str = "logs/access.log";
pub const DEFAULT_ERROR_LOG: &str = "logs/error.log";
pub const DEFAULT_LOG_LEVEL: &str = "error";
pub const DEFAULT_STOP_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_KILL_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_MULTIPART_MAX_MEMORY: u64 = 32 << 20;
pub const DEFAULT_MULTIPART_TEMP_PATH: &str = "tmp";
pub const DEFAULT_PROXY_CONNECT_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_PROXY_SEND_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_PROXY_READ_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_LISTEN: &str = "0.0.0.0:8000";
pub const DEFAULT_INDEX: &str = "index";
pub const DEFAULT_PROFILING_PREFIX: &str = "/debug/pprof";

/// Root of the configuration file.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RawConfig {
    /// Deployment-wide settings and per-server fallbacks.
    pub global: GlobalSpec,

    /// Per-server overrides, in file order.
    pub servers: Vec<ServerSpec>,

    /// Upstream groups. Parsed and exposed, not used for balancing.
    pub upstreams: Vec<UpstreamSpec>,
}

/// Global settings.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct GlobalSpec {
    /// Process id file.
    pub pid: String,

    pub access_log: String,
    pub error_log: String,

    /// Error log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Seconds an old generation gets to finish in-flight requests.
    pub stop_timeout: u64,

    /// Seconds after the stop timeout before remaining connections are killed.
    pub kill_timeout: u64,

    /// Largest request body buffered in memory, in bytes.
    pub multipart_max_memory: u64,

    /// Scratch directory handed to upload handlers.
    pub multipart_temp_path: String,

    pub proxy_connect_timeout: u64,
    pub proxy_send_timeout: u64,
    pub proxy_read_timeout: u64,

    /// Carried through to handlers; nothing in the runtime retries.
    pub proxy_retry: u32,

    /// Free-form module settings.
    pub config: ModuleSettings,
}

/// Per-server settings. Zero-valued inheritable fields take the global value.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerSpec {
    pub name: String,

    /// Listen address (e.g., "127.0.0.1:8000").
    pub listen: String,

    /// Whether the server is served. Missing means enabled.
    pub enable: Option<bool>,

    /// Static index directory.
    pub index: String,

    pub access_log: String,
    pub error_log: String,
    pub log_level: String,

    pub multipart_max_memory: u64,
    pub multipart_temp_path: String,

    pub proxy_connect_timeout: u64,
    pub proxy_send_timeout: u64,
    pub proxy_read_timeout: u64,
    pub proxy_retry: u32,

    /// TLS certificate chain (PEM).
    pub cert: String,

    /// TLS private key (PEM).
    pub key: String,

    /// Mount the diagnostics routes.
    pub profiling: bool,

    /// Path prefix for the diagnostics routes.
    pub profiling_prefix: String,

    /// Free-form module settings, merged over the global ones.
    pub config: ModuleSettings,
}

/// A named group of member addresses.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamSpec {
    pub name: String,
    pub servers: Vec<String>,
}

/// Free-form key/value settings handed to handler code untouched.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct ModuleSettings(BTreeMap<String, serde_yaml::Value>);

impl ModuleSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw value for `key`.
    pub fn raw(&self, key: &str) -> Option<&serde_yaml::Value> {
        self.0.get(key)
    }

    /// Deserialize the value stored under `key`.
    ///
    /// Returns `None` when the key is absent or has the wrong shape.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.0
            .get(key)
            .and_then(|v| serde_yaml::from_value(v.clone()).ok())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: serde_yaml::Value) {
        self.0.insert(key.into(), value);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Fill keys missing here from `fallback`. Existing keys win.
    pub fn fill_from(&mut self, fallback: &ModuleSettings) {
        for (key, value) in &fallback.0 {
            self.0.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_are_zero() {
        let raw: RawConfig = serde_yaml::from_str("servers:\n  - name: a\n").unwrap();
        assert_eq!(raw.global, GlobalSpec::default());
        assert_eq!(raw.servers[0].listen, "");
        assert_eq!(raw.servers[0].proxy_read_timeout, 0);
        assert_eq!(raw.servers[0].enable, None);
    }

    #[test]
    fn module_settings_typed_get() {
        let raw: GlobalSpec =
            serde_yaml::from_str("config:\n  retries: 3\n  name: edge\n").unwrap();
        assert_eq!(raw.config.get::<u32>("retries"), Some(3));
        assert_eq!(raw.config.get::<String>("name").as_deref(), Some("edge"));
        assert_eq!(raw.config.get::<u32>("name"), None);
        assert_eq!(raw.config.get::<u32>("absent"), None);
    }

    #[test]
    fn module_settings_fill_keeps_existing() {
        let mut server = ModuleSettings::new();
        server.insert("a", serde_yaml::Value::from(1));
        let mut global = ModuleSettings::new();
        global.insert("a", serde_yaml::Value::from(2));
        global.insert("b", serde_yaml::Value::from(3));

        server.fill_from(&global);
        assert_eq!(server.get::<i64>("a"), Some(1));
        assert_eq!(server.get::<i64>("b"), Some(3));
        assert_eq!(server.len(), 2);
    }
}
