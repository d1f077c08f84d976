//! Server instances.
//!
//! # Responsibilities
//! - Hold the routes and init hooks a host application registers
//! - Resolve this instance's slice of the configuration tree
//! - Create directories and open the access/error sinks
//! - Build one runtime snapshot (config, sinks, proxy client, axum router)
//!   per initialization
//!
//! # Design Decisions
//! - The instance never accepts connections itself; the supervisor binds
//!   listeners and serves the router it hands out
//! - A reload re-initializes the instance into a fresh snapshot while the
//!   previous generation keeps serving with the old one

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::HeaderValue;
use axum::Router;
use thiserror::Error;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::config::schema::DEFAULT_SERVER_NAME;
use crate::config::{ConfigTree, ServerConfig};
use crate::http::diagnostics;
use crate::http::handler::BoxedHandler;
use crate::http::router::{RouteTable, RouterGroup};
use crate::http::tracker::RequestTracker;
use crate::observability::LogSink;
use crate::proxy::ProxyClient;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

type InitHook = Box<dyn Fn(&ServerConfig) -> Result<(), BoxError> + Send + Sync>;

/// Error type for [`ServerInstance::init`].
#[derive(Debug, Error)]
pub enum InitError {
    #[error("server '{server}': failed to create directory {}: {source}", .path.display())]
    CreateDir {
        server: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("server '{server}': failed to open log {}: {source}", .path.display())]
    OpenLog {
        server: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("server '{server}': failed to build proxy client: {source}")]
    Proxy {
        server: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("server '{server}': init hook failed: {source}")]
    Hook {
        server: String,
        #[source]
        source: BoxError,
    },

    #[error("server '{0}' has been shut down")]
    Stopped(String),
}

/// Lifecycle of a [`ServerInstance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Unconfigured,
    Initialized,
    Serving,
    Stopped,
}

/// Everything one generation of a server needs to answer requests.
pub struct ServerRuntime {
    config: ServerConfig,
    error_log: LogSink,
    access_log: LogSink,
    proxy: ProxyClient,
    tracker: RequestTracker,
    server_header: HeaderValue,
    started_at: Instant,
}

impl ServerRuntime {
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        self.config.name()
    }

    pub fn error_log(&self) -> &LogSink {
        &self.error_log
    }

    pub fn access_log(&self) -> &LogSink {
        &self.access_log
    }

    pub fn proxy(&self) -> &ProxyClient {
        &self.proxy
    }

    pub fn tracker(&self) -> &RequestTracker {
        &self.tracker
    }

    pub fn is_tls(&self) -> bool {
        self.config.tls().is_some()
    }

    /// Default `Server` response header.
    pub fn server_header(&self) -> &HeaderValue {
        &self.server_header
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

impl std::fmt::Debug for ServerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerRuntime")
            .field("name", &self.config.name())
            .field("listen", &self.config.listen_address())
            .finish()
    }
}

/// One named server registered by the host application.
pub struct ServerInstance {
    name: Option<String>,
    routes: RouteTable,
    hooks: Vec<InitHook>,
    state: ServerState,
    enabled: bool,
    runtime: Option<Arc<ServerRuntime>>,
    app: Option<Router>,
}

impl ServerInstance {
    /// Instance bound to the `servers` entry called `name`.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            name: (!name.is_empty()).then_some(name),
            routes: RouteTable::new(),
            hooks: Vec::new(),
            state: ServerState::Unconfigured,
            enabled: false,
            runtime: None,
            app: None,
        }
    }

    /// Instance bound to the default server.
    pub fn unnamed() -> Self {
        Self::new("")
    }

    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or(DEFAULT_SERVER_NAME)
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn route(&mut self, path: &str, handlers: Vec<BoxedHandler>) -> &mut Self {
        self.routes.route(path, handlers);
        self
    }

    pub fn group(&mut self, prefix: &str, handlers: Vec<BoxedHandler>) -> RouterGroup<'_> {
        self.routes.group(prefix, handlers)
    }

    pub fn default_route(&mut self, handlers: Vec<BoxedHandler>) -> &mut Self {
        self.routes.default_route(handlers);
        self
    }

    /// Hook run at the end of every successful [`init`](Self::init).
    pub fn on_init<F>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(&ServerConfig) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.hooks.push(Box::new(hook));
        self
    }

    /// Initialize from `tree`.
    ///
    /// A named instance without a matching `servers` entry, or whose entry is
    /// disabled, is left disabled and still succeeds.
    pub fn init(&mut self, tree: &ConfigTree) -> Result<(), InitError> {
        if self.state == ServerState::Stopped {
            return Err(InitError::Stopped(self.name().to_string()));
        }

        let config = match &self.name {
            None => Some(tree.default_server()),
            Some(name) => tree.server(name).cloned(),
        };
        let config = match config {
            Some(config) if config.is_enabled() => config,
            _ => {
                tracing::info!(server = %self.name(), "Server not configured or disabled");
                self.enabled = false;
                self.runtime = None;
                self.app = None;
                self.state = ServerState::Initialized;
                return Ok(());
            }
        };

        let runtime = Arc::new(open_runtime(config, &tree.pid_file())?);

        for hook in &self.hooks {
            hook(runtime.config()).map_err(|source| InitError::Hook {
                server: runtime.name().to_string(),
                source,
            })?;
        }

        let app = self.build_app(Arc::clone(&runtime));

        runtime.error_log().in_scope(|| {
            tracing::info!(
                server = %runtime.name(),
                listen = %runtime.config().listen_address(),
                "Server initialized"
            )
        });

        self.enabled = true;
        self.runtime = Some(runtime);
        self.app = Some(app);
        self.state = ServerState::Initialized;
        Ok(())
    }

    /// Build the axum router with all middleware layers.
    fn build_app(&self, runtime: Arc<ServerRuntime>) -> Router {
        let mut routes = self.routes.clone();
        if let Some(prefix) = runtime.config().profiling() {
            if diagnostics::mount(&mut routes, prefix) {
                runtime
                    .error_log()
                    .in_scope(|| tracing::info!(prefix = %prefix, "Diagnostics enabled"));
            } else {
                runtime.error_log().in_scope(|| {
                    tracing::warn!(prefix = %prefix, "Diagnostics prefix clashes with a route")
                });
            }
        }

        routes
            .build(runtime)
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(TraceLayer::new_for_http())
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
            .layer(CatchPanicLayer::new())
    }

    /// Whether this instance belongs in the serve set.
    pub fn enable(&self) -> bool {
        self.enabled && self.state != ServerState::Stopped
    }

    /// Snapshot built by the last successful init.
    pub fn runtime(&self) -> Option<Arc<ServerRuntime>> {
        self.runtime.clone()
    }

    /// Router built by the last successful init.
    pub fn app(&self) -> Option<Router> {
        self.app.clone()
    }

    pub(crate) fn mark_serving(&mut self) {
        if self.state == ServerState::Initialized {
            self.state = ServerState::Serving;
        }
    }

    /// Release sinks and router. Safe to call more than once.
    pub fn shutdown(&mut self) {
        if self.state == ServerState::Stopped {
            return;
        }
        if let Some(runtime) = self.runtime.take() {
            runtime
                .error_log()
                .in_scope(|| tracing::info!(server = %runtime.name(), "Server stopped"));
        }
        self.app = None;
        self.enabled = false;
        self.state = ServerState::Stopped;
    }
}

impl std::fmt::Debug for ServerInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerInstance")
            .field("name", &self.name())
            .field("state", &self.state)
            .field("routes", &self.routes.len())
            .finish()
    }
}

fn open_runtime(config: ServerConfig, pid_file: &Path) -> Result<ServerRuntime, InitError> {
    let server = config.name().to_string();

    let error_path = config.error_log_path();
    let access_path = config.access_log_path();
    let mut dirs = vec![config.index_dir(), config.multipart_temp_dir()];
    dirs.extend(
        [pid_file, error_path.as_path(), access_path.as_path()]
            .into_iter()
            .filter_map(Path::parent)
            .map(Path::to_path_buf),
    );
    for dir in dirs {
        fs::create_dir_all(&dir).map_err(|source| InitError::CreateDir {
            server: server.clone(),
            path: dir,
            source,
        })?;
    }

    let error_log = LogSink::error_log(&error_path, config.log_level()).map_err(|source| {
        InitError::OpenLog {
            server: server.clone(),
            path: error_path.clone(),
            source,
        }
    })?;
    let access_log = LogSink::access_log(&access_path).map_err(|source| InitError::OpenLog {
        server: server.clone(),
        path: access_path.clone(),
        source,
    })?;

    let proxy = ProxyClient::new(config.proxy_connect_timeout())
        .map_err(|source| InitError::Proxy { server, source })?;

    let server_header = HeaderValue::from_str(&format!("roost/{}", config.version()))
        .unwrap_or_else(|_| HeaderValue::from_static("roost"));

    Ok(ServerRuntime {
        config,
        error_log,
        access_log,
        proxy,
        tracker: RequestTracker::new(),
        server_header,
        started_at: Instant::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResolveContext;

    fn tree(dir: &Path, yaml: &str) -> ConfigTree {
        ConfigTree::from_raw(
            serde_yaml::from_str(yaml).unwrap(),
            ResolveContext::new(dir, "test"),
        )
    }

    #[test]
    fn init_creates_directories_and_sinks() {
        let dir = tempfile::tempdir().unwrap();
        let tree = tree(
            dir.path(),
            "global:\n  pid: run/p.pid\nservers:\n  - name: a\n    listen: 127.0.0.1:0\n    \
             access_log: logs/a/access.log\n    error_log: logs/a/error.log\n",
        );

        let mut server = ServerInstance::new("a");
        server.init(&tree).unwrap();

        assert!(server.enable());
        assert_eq!(server.state(), ServerState::Initialized);
        assert!(dir.path().join("run").is_dir());
        assert!(dir.path().join("index").is_dir());
        assert!(dir.path().join("tmp").is_dir());
        assert!(dir.path().join("logs/a/access.log").is_file());
        assert!(dir.path().join("logs/a/error.log").is_file());
        assert!(server.app().is_some());
    }

    #[test]
    fn unknown_name_is_disabled_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let tree = tree(dir.path(), "servers:\n  - name: a\n");

        let mut server = ServerInstance::new("missing");
        server.init(&tree).unwrap();
        assert!(!server.enable());
        assert!(server.runtime().is_none());
    }

    #[test]
    fn disabled_entry_is_not_served() {
        let dir = tempfile::tempdir().unwrap();
        let tree = tree(dir.path(), "servers:\n  - name: a\n    enable: false\n");

        let mut server = ServerInstance::new("a");
        server.init(&tree).unwrap();
        assert!(!server.enable());
    }

    #[test]
    fn unnamed_uses_default_server() {
        let dir = tempfile::tempdir().unwrap();
        let tree = tree(dir.path(), "");

        let mut server = ServerInstance::unnamed();
        server.init(&tree).unwrap();
        assert!(server.enable());
        assert_eq!(server.runtime().unwrap().name(), "default");
    }

    #[test]
    fn failing_hook_fails_init() {
        let dir = tempfile::tempdir().unwrap();
        let tree = tree(dir.path(), "servers:\n  - name: a\n");

        let mut server = ServerInstance::new("a");
        server.on_init(|cfg| {
            if cfg.settings().get::<bool>("ready").unwrap_or(false) {
                Ok(())
            } else {
                Err("not ready".into())
            }
        });

        let err = server.init(&tree).unwrap_err();
        assert!(matches!(err, InitError::Hook { .. }));
        assert!(err.to_string().contains("not ready"));
    }

    #[test]
    fn unwritable_log_path_fails_init() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where a directory is expected.
        std::fs::write(dir.path().join("blocked"), "").unwrap();
        let tree = tree(
            dir.path(),
            "servers:\n  - name: a\n    error_log: blocked/error.log\n",
        );

        let mut server = ServerInstance::new("a");
        assert!(matches!(
            server.init(&tree),
            Err(InitError::CreateDir { .. })
        ));
    }

    #[test]
    fn shutdown_is_idempotent_and_final() {
        let dir = tempfile::tempdir().unwrap();
        let tree = tree(dir.path(), "servers:\n  - name: a\n");

        let mut server = ServerInstance::new("a");
        server.init(&tree).unwrap();
        server.shutdown();
        server.shutdown();

        assert_eq!(server.state(), ServerState::Stopped);
        assert!(!server.enable());
        assert!(matches!(server.init(&tree), Err(InitError::Stopped(_))));
    }
}
