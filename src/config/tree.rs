//! The resolved configuration tree.
//!
//! Resolution order for a tree built from a raw file:
//!
//! ```text
//! global  → compiled defaults for zero fields
//! server  → server-only defaults (name, listen, index, profiling prefix)
//!         → inherit zero fields from global (applied once)
//!         → compiled defaults for anything still zero
//!         → module settings: server keys win, global fills gaps
//! ```
//!
//! A field is unset when it equals its zero value, so a server cannot lower a
//! numeric setting to zero below a non-zero global value.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::schema::*;

/// Values captured when a configuration is resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveContext {
    /// Base directory for relative paths.
    pub prefix: PathBuf,

    /// Version string advertised in the `Server` header.
    pub version: String,
}

impl ResolveContext {
    pub fn new(prefix: impl Into<PathBuf>, version: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            version: version.into(),
        }
    }

    /// Context rooted at the directory holding the running binary.
    pub fn from_binary(version: impl Into<String>) -> Self {
        let prefix = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
            .unwrap_or_else(std::env::temp_dir);
        Self::new(prefix, version)
    }

    /// Resolve `path` against the prefix unless it is already absolute.
    pub fn absolute(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.prefix.join(path)
        }
    }
}

trait Unset {
    fn is_unset(&self) -> bool;
}

impl Unset for String {
    fn is_unset(&self) -> bool {
        self.is_empty()
    }
}

impl Unset for u64 {
    fn is_unset(&self) -> bool {
        *self == 0
    }
}

impl Unset for u32 {
    fn is_unset(&self) -> bool {
        *self == 0
    }
}

/// Copy each zero-valued field of `$dst` from `$src`.
macro_rules! inherit {
    ($dst:expr, $src:expr; $($field:ident),+ $(,)?) => {
        $(
            if $dst.$field.is_unset() {
                $dst.$field = $src.$field.clone();
            }
        )+
    };
}

/// Set each zero-valued field of `$dst` to a compiled default.
macro_rules! default_to {
    ($dst:expr; $($field:ident => $value:expr),+ $(,)?) => {
        $(
            if $dst.$field.is_unset() {
                $dst.$field = $value.into();
            }
        )+
    };
}

fn apply_global_defaults(global: &mut GlobalSpec) {
    default_to!(global;
        pid => DEFAULT_PID_FILE,
        access_log => DEFAULT_ACCESS_LOG,
        error_log => DEFAULT_ERROR_LOG,
        log_level => DEFAULT_LOG_LEVEL,
        stop_timeout => DEFAULT_STOP_TIMEOUT_SECS,
        kill_timeout => DEFAULT_KILL_TIMEOUT_SECS,
        multipart_max_memory => DEFAULT_MULTIPART_MAX_MEMORY,
        multipart_temp_path => DEFAULT_MULTIPART_TEMP_PATH,
        proxy_connect_timeout => DEFAULT_PROXY_CONNECT_TIMEOUT_SECS,
        proxy_send_timeout => DEFAULT_PROXY_SEND_TIMEOUT_SECS,
        proxy_read_timeout => DEFAULT_PROXY_READ_TIMEOUT_SECS,
    );
}

fn apply_server_defaults(spec: &mut ServerSpec) {
    default_to!(spec;
        name => DEFAULT_SERVER_NAME,
        listen => DEFAULT_LISTEN,
        index => DEFAULT_INDEX,
        profiling_prefix => DEFAULT_PROFILING_PREFIX,
    );
}

fn apply_inherited_defaults(spec: &mut ServerSpec) {
    default_to!(spec;
        access_log => DEFAULT_ACCESS_LOG,
        error_log => DEFAULT_ERROR_LOG,
        log_level => DEFAULT_LOG_LEVEL,
        multipart_max_memory => DEFAULT_MULTIPART_MAX_MEMORY,
        multipart_temp_path => DEFAULT_MULTIPART_TEMP_PATH,
        proxy_connect_timeout => DEFAULT_PROXY_CONNECT_TIMEOUT_SECS,
        proxy_send_timeout => DEFAULT_PROXY_SEND_TIMEOUT_SECS,
        proxy_read_timeout => DEFAULT_PROXY_READ_TIMEOUT_SECS,
    );
}

fn resolve_server(spec: &mut ServerSpec, global: &GlobalSpec) {
    apply_server_defaults(spec);
    inherit!(spec, global;
        access_log,
        error_log,
        log_level,
        multipart_max_memory,
        multipart_temp_path,
        proxy_connect_timeout,
        proxy_send_timeout,
        proxy_read_timeout,
        proxy_retry,
    );
    apply_inherited_defaults(spec);
    spec.config.fill_from(&global.config);
}

/// Fully resolved, immutable configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigTree {
    context: ResolveContext,
    global: GlobalSpec,
    servers: Vec<ServerConfig>,
    upstreams: Vec<UpstreamSpec>,
}

impl ConfigTree {
    /// Resolve a raw document.
    pub fn from_raw(raw: RawConfig, context: ResolveContext) -> Self {
        let mut global = raw.global;
        apply_global_defaults(&mut global);

        let servers = raw
            .servers
            .into_iter()
            .map(|mut spec| {
                resolve_server(&mut spec, &global);
                ServerConfig {
                    spec,
                    context: context.clone(),
                }
            })
            .collect();

        Self {
            context,
            global,
            servers,
            upstreams: raw.upstreams,
        }
    }

    /// Tree built purely from compiled defaults.
    pub fn defaults(context: ResolveContext) -> Self {
        Self::from_raw(RawConfig::default(), context)
    }

    /// Unresolve back into a raw document (resolved values included).
    pub fn to_raw(&self) -> RawConfig {
        RawConfig {
            global: self.global.clone(),
            servers: self.servers.iter().map(|s| s.spec.clone()).collect(),
            upstreams: self.upstreams.clone(),
        }
    }

    pub fn context(&self) -> &ResolveContext {
        &self.context
    }

    pub fn global(&self) -> &GlobalSpec {
        &self.global
    }

    pub fn pid_file(&self) -> PathBuf {
        self.context.absolute(&self.global.pid)
    }

    pub fn error_log_path(&self) -> PathBuf {
        self.context.absolute(&self.global.error_log)
    }

    pub fn access_log_path(&self) -> PathBuf {
        self.context.absolute(&self.global.access_log)
    }

    pub fn log_level(&self) -> &str {
        &self.global.log_level
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.global.stop_timeout)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_secs(self.global.kill_timeout)
    }

    pub fn servers(&self) -> &[ServerConfig] {
        &self.servers
    }

    /// The server registered under `name`.
    pub fn server(&self, name: &str) -> Option<&ServerConfig> {
        self.servers.iter().find(|s| s.spec.name == name)
    }

    /// The `default` server, synthesized from `global` when the file has none.
    pub fn default_server(&self) -> ServerConfig {
        if let Some(server) = self.server(DEFAULT_SERVER_NAME) {
            return server.clone();
        }
        let mut spec = ServerSpec {
            name: DEFAULT_SERVER_NAME.to_string(),
            ..ServerSpec::default()
        };
        resolve_server(&mut spec, &self.global);
        ServerConfig {
            spec,
            context: self.context.clone(),
        }
    }

    pub fn upstreams(&self) -> &[UpstreamSpec] {
        &self.upstreams
    }

    pub fn upstream(&self, name: &str) -> Option<&UpstreamSpec> {
        self.upstreams.iter().find(|u| u.name == name)
    }
}

/// TLS material for one server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// One resolved server entry plus the context it was resolved in.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    spec: ServerSpec,
    context: ResolveContext,
}

impl ServerConfig {
    pub fn spec(&self) -> &ServerSpec {
        &self.spec
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn listen_address(&self) -> &str {
        &self.spec.listen
    }

    pub fn is_enabled(&self) -> bool {
        self.spec.enable.unwrap_or(true)
    }

    pub fn version(&self) -> &str {
        &self.context.version
    }

    pub fn access_log_path(&self) -> PathBuf {
        self.context.absolute(&self.spec.access_log)
    }

    pub fn error_log_path(&self) -> PathBuf {
        self.context.absolute(&self.spec.error_log)
    }

    pub fn log_level(&self) -> &str {
        &self.spec.log_level
    }

    pub fn index_dir(&self) -> PathBuf {
        self.context.absolute(&self.spec.index)
    }

    pub fn multipart_temp_dir(&self) -> PathBuf {
        self.context.absolute(&self.spec.multipart_temp_path)
    }

    pub fn multipart_max_memory(&self) -> u64 {
        self.spec.multipart_max_memory
    }

    pub fn proxy_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.spec.proxy_connect_timeout)
    }

    /// Carried for handlers; the proxy client applies only connect and read.
    pub fn proxy_send_timeout(&self) -> Duration {
        Duration::from_secs(self.spec.proxy_send_timeout)
    }

    pub fn proxy_read_timeout(&self) -> Duration {
        Duration::from_secs(self.spec.proxy_read_timeout)
    }

    pub fn proxy_retry(&self) -> u32 {
        self.spec.proxy_retry
    }

    pub fn tls(&self) -> Option<TlsPaths> {
        if self.spec.cert.is_empty() || self.spec.key.is_empty() {
            return None;
        }
        Some(TlsPaths {
            cert: self.context.absolute(&self.spec.cert),
            key: self.context.absolute(&self.spec.key),
        })
    }

    /// Diagnostics prefix when profiling is enabled.
    pub fn profiling(&self) -> Option<&str> {
        self.spec
            .profiling
            .then_some(self.spec.profiling_prefix.as_str())
    }

    pub fn settings(&self) -> &ModuleSettings {
        &self.spec.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ResolveContext {
        ResolveContext::new("/srv/roost", "0.1.0")
    }

    fn tree(yaml: &str) -> ConfigTree {
        ConfigTree::from_raw(serde_yaml::from_str(yaml).unwrap(), ctx())
    }

    #[test]
    fn unset_server_fields_inherit_global() {
        let tree = tree(
            "global:\n  access_log: /var/log/a.log\n  proxy_read_timeout: 7\n  proxy_retry: 2\n\
             servers:\n  - name: a\n    listen: 127.0.0.1:8001\n",
        );
        let server = tree.server("a").unwrap();
        assert_eq!(server.access_log_path(), PathBuf::from("/var/log/a.log"));
        assert_eq!(server.proxy_read_timeout(), Duration::from_secs(7));
        assert_eq!(server.proxy_retry(), 2);
        assert_eq!(server.log_level(), tree.log_level());
    }

    #[test]
    fn explicit_server_values_are_kept() {
        let tree = tree(
            "global:\n  proxy_read_timeout: 7\n  log_level: warn\n\
             servers:\n  - name: a\n    proxy_read_timeout: 3\n    log_level: debug\n",
        );
        let server = tree.server("a").unwrap();
        assert_eq!(server.proxy_read_timeout(), Duration::from_secs(3));
        assert_eq!(server.log_level(), "debug");
    }

    #[test]
    fn zero_override_cannot_beat_global() {
        let tree = tree("global:\n  proxy_retry: 4\nservers:\n  - name: a\n    proxy_retry: 0\n");
        assert_eq!(tree.server("a").unwrap().proxy_retry(), 4);
    }

    #[test]
    fn resolution_is_idempotent() {
        let once = tree(
            "global:\n  pid: p.pid\n  config:\n    k: 1\n\
             servers:\n  - name: a\n    listen: 127.0.0.1:8001\n    config:\n      j: 2\n",
        );
        let twice = ConfigTree::from_raw(once.to_raw(), ctx());
        assert_eq!(once, twice);
    }

    #[test]
    fn defaults_fill_everything() {
        let tree = ConfigTree::defaults(ctx());
        assert_eq!(tree.pid_file(), PathBuf::from("/srv/roost/logs/roost.pid"));
        assert_eq!(tree.stop_timeout(), Duration::from_secs(60));
        assert_eq!(tree.kill_timeout(), Duration::from_secs(60));
        assert!(tree.servers().is_empty());

        let server = tree.default_server();
        assert_eq!(server.name(), "default");
        assert_eq!(server.listen_address(), "0.0.0.0:8000");
        assert_eq!(server.proxy_connect_timeout(), Duration::from_secs(5));
        assert!(server.is_enabled());
        assert!(server.tls().is_none());
        assert!(server.profiling().is_none());
    }

    #[test]
    fn module_settings_merge_keywise() {
        let tree = tree(
            "global:\n  config:\n    a: 1\n    b: 1\n\
             servers:\n  - name: s\n    config:\n      b: 2\n      c: 2\n",
        );
        let settings = tree.server("s").unwrap().settings();
        assert_eq!(settings.get::<i64>("a"), Some(1));
        assert_eq!(settings.get::<i64>("b"), Some(2));
        assert_eq!(settings.get::<i64>("c"), Some(2));
    }

    #[test]
    fn file_default_server_wins_over_synthesized() {
        let tree = tree("servers:\n  - name: default\n    listen: 127.0.0.1:9999\n");
        assert_eq!(tree.default_server().listen_address(), "127.0.0.1:9999");
    }

    #[test]
    fn relative_paths_use_prefix() {
        let tree = tree("servers:\n  - name: a\n    error_log: logs/a.err\n    cert: c.pem\n    key: /k.pem\n");
        let server = tree.server("a").unwrap();
        assert_eq!(server.error_log_path(), PathBuf::from("/srv/roost/logs/a.err"));
        let tls = server.tls().unwrap();
        assert_eq!(tls.cert, PathBuf::from("/srv/roost/c.pem"));
        assert_eq!(tls.key, PathBuf::from("/k.pem"));
    }

    #[test]
    fn disabled_server_reports_disabled() {
        let tree = tree("servers:\n  - name: a\n    enable: false\n");
        assert!(!tree.server("a").unwrap().is_enabled());
    }
}
