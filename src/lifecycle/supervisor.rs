//! Process supervisor.
//!
//! # Responsibilities
//! - Resolve the configuration and initialize every registered server
//! - Detach into the background unless running in the foreground
//! - Own the pid file and the serving generation
//! - React to stop and reload instructions
//! - Send those instructions to a running daemon
//!
//! # Design Decisions
//! - A reload re-resolves the same file and starts a new generation inside
//!   the same process. The old generation drains in the background with the
//!   deadlines of the configuration it was started with
//! - A reload that fails to resolve, initialize or bind is logged and the
//!   current generation keeps serving
//! - A listener that stops on its own brings the whole process down; every
//!   error collected while draining is reported together

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::config::{self, ConfigError, ConfigTree, ResolveContext};
use crate::http::{InitError, ServerInstance};
use crate::lifecycle::daemon;
use crate::lifecycle::generation::{Generation, Launch};
use crate::lifecycle::pidfile::{self, LookupError, PidFile, PidFileError};
use crate::lifecycle::signals::{self, Control};
use crate::net::{ListenError, ListenErrors};
use crate::observability::logging;

/// Version advertised by servers started through the supervisor.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Configuration file used when `-c` is not given, relative to the prefix.
pub const DEFAULT_CONF_FILE: &str = "conf/roost.yaml";

/// Extra time `stop` waits beyond the daemon's own drain deadlines.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Error type for supervisor operations.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Lookup(#[from] LookupError),

    #[error(transparent)]
    Init(#[from] InitError),

    #[error(transparent)]
    Listen(#[from] ListenErrors),

    #[error(transparent)]
    PidFile(#[from] PidFileError),

    #[error("failed to install signal handlers: {0}")]
    Signal(#[source] io::Error),

    #[error("failed to signal process {pid}: {source}")]
    Deliver {
        pid: i32,
        #[source]
        source: io::Error,
    },

    #[error("failed to start daemon: {0}")]
    Daemonize(#[source] io::Error),

    #[error("failed to build async runtime: {0}")]
    Runtime(#[source] io::Error),
}

/// Runs a set of [`ServerInstance`]s as one process.
#[derive(Debug)]
pub struct Supervisor {
    servers: Vec<ServerInstance>,
    context: ResolveContext,
}

impl Supervisor {
    /// Supervisor rooted at the directory holding the running binary.
    pub fn new(servers: Vec<ServerInstance>) -> Self {
        Self {
            servers,
            context: ResolveContext::from_binary(VERSION),
        }
    }

    /// Resolve relative paths against `prefix` instead.
    pub fn with_prefix(mut self, prefix: impl Into<PathBuf>) -> Self {
        self.context.prefix = prefix.into();
        self
    }

    pub fn context(&self) -> &ResolveContext {
        &self.context
    }

    pub fn servers(&self) -> &[ServerInstance] {
        &self.servers
    }

    pub fn default_conf_file(&self) -> PathBuf {
        self.context.prefix.join(DEFAULT_CONF_FILE)
    }

    /// Resolve the configuration at `conf`.
    pub fn resolve(&self, conf: &Path) -> Result<ConfigTree, SupervisorError> {
        Ok(config::resolve(conf, &self.context)?)
    }

    /// Initialize every server from `tree`, returning how many are enabled.
    fn init_servers(&mut self, tree: &ConfigTree) -> Result<usize, SupervisorError> {
        for server in &mut self.servers {
            server.init(tree)?;
        }
        Ok(self.servers.iter().filter(|s| s.enable()).count())
    }

    fn launches(&self) -> Vec<Launch> {
        self.servers
            .iter()
            .filter(|s| s.enable())
            .filter_map(|s| {
                let runtime = s.runtime()?;
                let app = s.app()?;
                Some(Launch {
                    name: runtime.name().to_string(),
                    listen: runtime.config().listen_address().to_string(),
                    tls: runtime.config().tls(),
                    app,
                })
            })
            .collect()
    }

    fn mark_serving(&mut self) {
        for server in self.servers.iter_mut().filter(|s| s.enable()) {
            server.mark_serving();
        }
    }

    fn shutdown_servers(&mut self) {
        for server in &mut self.servers {
            server.shutdown();
        }
    }

    /// `start`: validate, then detach or serve until stopped.
    ///
    /// Configuration and initialization errors, and a pid file already
    /// locked by a running daemon, surface in the calling process before
    /// anything is detached.
    pub fn start(&mut self, conf: &Path, foreground: bool) -> Result<(), SupervisorError> {
        let tree = self.resolve(conf)?;
        logging::init(tree.log_level());

        let enabled = self.init_servers(&tree)?;
        tracing::info!(conf = %conf.display(), enabled, "Configuration loaded");

        if !foreground && !daemon::is_daemon() {
            pidfile::ensure_unlocked(&tree.pid_file())?;
            let pid = daemon::detach(&tree.error_log_path()).map_err(SupervisorError::Daemonize)?;
            tracing::info!(pid, "Started in background");
            return Ok(());
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(SupervisorError::Runtime)?;

        runtime.block_on(async {
            let controls = signals::listen().map_err(SupervisorError::Signal)?;
            self.serve_initialized(conf, tree, controls).await
        })
    }

    /// Resolve, initialize and serve until `controls` says stop.
    pub async fn serve(
        &mut self,
        conf: &Path,
        controls: mpsc::Receiver<Control>,
    ) -> Result<(), SupervisorError> {
        let tree = self.resolve(conf)?;
        self.init_servers(&tree)?;
        self.serve_initialized(conf, tree, controls).await
    }

    async fn serve_initialized(
        &mut self,
        conf: &Path,
        tree: ConfigTree,
        controls: mpsc::Receiver<Control>,
    ) -> Result<(), SupervisorError> {
        let pid_file = match PidFile::acquire(&tree.pid_file()) {
            Ok(pid_file) => pid_file,
            Err(err) => {
                self.shutdown_servers();
                return Err(err.into());
            }
        };

        let result = self.supervise(conf, tree, controls).await;

        self.shutdown_servers();
        pid_file.release();
        match &result {
            Ok(()) => tracing::info!("Shutdown complete"),
            Err(err) => tracing::error!(error = %err, "Shutdown after failure"),
        }
        result
    }

    async fn supervise(
        &mut self,
        conf: &Path,
        mut tree: ConfigTree,
        mut controls: mpsc::Receiver<Control>,
    ) -> Result<(), SupervisorError> {
        let mut generation = Generation::launch(1, self.launches(), None).await?;
        self.mark_serving();
        if generation.is_empty() {
            tracing::warn!("No enabled servers, waiting for stop or reload");
        }

        let mut draining: JoinSet<Vec<ListenError>> = JoinSet::new();
        let mut failures = Vec::new();

        loop {
            tokio::select! {
                control = controls.recv() => match control {
                    Some(Control::Reload) => {
                        let next_id = generation.id() + 1;
                        match self.reload_generation(conf, &generation, next_id).await {
                            Ok((next, next_tree)) => {
                                let previous = std::mem::replace(&mut generation, next);
                                draining.spawn(
                                    previous.drain(tree.stop_timeout(), tree.kill_timeout()),
                                );
                                tree = next_tree;
                                tracing::info!(generation = next_id, "Reload complete");
                            }
                            Err(err) => {
                                tracing::error!(error = %err, "Reload failed, keeping current servers");
                            }
                        }
                    }
                    Some(Control::Stop) | None => break,
                },
                (server, result) = generation.next_exit() => {
                    let source = match result {
                        Ok(()) => io::Error::other("listener closed unexpectedly"),
                        Err(source) => source,
                    };
                    tracing::error!(server = %server, error = %source, "Listener failed");
                    failures.push(ListenError::Serve { server, source });
                    break;
                }
                Some(joined) = draining.join_next(), if !draining.is_empty() => {
                    if let Ok(errors) = joined {
                        log_drain_errors(&errors);
                    }
                }
            }
        }

        tracing::info!("Stopping");
        failures.extend(
            generation
                .drain(tree.stop_timeout(), tree.kill_timeout())
                .await,
        );
        while let Some(joined) = draining.join_next().await {
            if let Ok(errors) = joined {
                log_drain_errors(&errors);
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ListenErrors(failures).into())
        }
    }

    async fn reload_generation(
        &mut self,
        conf: &Path,
        current: &Generation,
        id: u64,
    ) -> Result<(Generation, ConfigTree), SupervisorError> {
        tracing::info!(conf = %conf.display(), generation = id, "Reloading");
        let tree = self.resolve(conf)?;
        self.init_servers(&tree)?;
        let next = Generation::launch(id, self.launches(), Some(current)).await?;
        self.mark_serving();
        Ok((next, tree))
    }

    /// `stop`: signal the daemon and wait until it has exited.
    pub fn stop(&self, conf: &Path) -> Result<i32, SupervisorError> {
        let tree = self.resolve(conf)?;
        let pid_path = tree.pid_file();
        let pid = signal(&pid_path, Control::Stop)?;

        let deadline = Instant::now() + tree.stop_timeout() + tree.kill_timeout() + STOP_GRACE;
        while pid_path.exists() && signals::is_alive(pid) {
            if Instant::now() >= deadline {
                tracing::warn!(pid, "Process still running after stop deadline");
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        Ok(pid)
    }

    /// `reload`: ask the daemon to start a new generation.
    pub fn reload(&self, conf: &Path) -> Result<i32, SupervisorError> {
        let tree = self.resolve(conf)?;
        signal(&tree.pid_file(), Control::Reload)
    }
}

fn signal(pid_path: &Path, control: Control) -> Result<i32, SupervisorError> {
    let pid = pidfile::read_pid(pid_path)?;
    signals::send(pid, control).map_err(|source| SupervisorError::Deliver { pid, source })?;
    tracing::info!(pid, ?control, "Signal sent");
    Ok(pid)
}

fn log_drain_errors(errors: &[ListenError]) {
    for err in errors {
        tracing::warn!(error = %err, "Error while draining previous generation");
    }
}
