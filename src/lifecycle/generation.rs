//! One generation of serving listeners.
//!
//! # Responsibilities
//! - Bind (or inherit) one listener per enabled server and serve its router
//! - Report a listener that stops on its own
//! - Drain: stop accepting, let in-flight requests finish, then force-close
//!
//! # Design Decisions
//! - Every member keeps a duplicate of its socket. A reload hands the
//!   duplicate to the next generation for any unchanged address, so the
//!   listening socket is never closed while connections arrive
//! - All binds of a generation are attempted before any failure is
//!   reported, and a failed launch leaves the previous generation untouched

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use tokio::task::JoinSet;

use crate::config::TlsPaths;
use crate::net::tls::load_tls_config;
use crate::net::{self, ListenError, ListenErrors};

/// What one server contributes to a generation.
#[derive(Clone)]
pub struct Launch {
    pub name: String,
    pub listen: String,
    pub tls: Option<TlsPaths>,
    pub app: Router,
}

struct Member {
    name: String,
    listen: String,
    local_addr: SocketAddr,
    handle: Handle,
    spare: Option<std::net::TcpListener>,
}

struct Prepared {
    launch: Launch,
    listener: std::net::TcpListener,
    spare: std::net::TcpListener,
    tls: Option<RustlsConfig>,
}

type Exit = (String, io::Result<()>);

/// Listeners started together and drained together.
pub struct Generation {
    id: u64,
    members: Vec<Member>,
    tasks: JoinSet<Exit>,
}

impl Generation {
    /// Bind every launch and start serving.
    ///
    /// Addresses also served by `previous` reuse its socket.
    pub async fn launch(
        id: u64,
        launches: Vec<Launch>,
        previous: Option<&Generation>,
    ) -> Result<Self, ListenErrors> {
        let mut errors = Vec::new();
        let mut prepared = Vec::new();

        for launch in launches {
            match prepare(launch, previous).await {
                Ok(p) => prepared.push(p),
                Err(err) => errors.push(err),
            }
        }
        if !errors.is_empty() {
            return Err(ListenErrors(errors));
        }

        let mut generation = Self {
            id,
            members: Vec::with_capacity(prepared.len()),
            tasks: JoinSet::new(),
        };
        for p in prepared {
            generation.spawn(p);
        }
        Ok(generation)
    }

    fn spawn(&mut self, p: Prepared) {
        let Prepared {
            launch,
            listener,
            spare,
            tls,
        } = p;
        let local_addr = spare
            .local_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
        let handle = Handle::new();
        let service = launch
            .app
            .into_make_service_with_connect_info::<SocketAddr>();
        let name = launch.name.clone();

        match tls {
            Some(config) => {
                let server = axum_server::tls_rustls::from_tcp_rustls(listener, config)
                    .handle(handle.clone());
                self.tasks.spawn(async move { (name, server.serve(service).await) });
            }
            None => {
                let server = axum_server::from_tcp(listener).handle(handle.clone());
                self.tasks.spawn(async move { (name, server.serve(service).await) });
            }
        }

        tracing::info!(
            generation = self.id,
            server = %launch.name,
            address = %local_addr,
            tls = launch.tls.is_some(),
            "Serving"
        );
        self.members.push(Member {
            name: launch.name,
            listen: launch.listen,
            local_addr,
            handle,
            spare: Some(spare),
        });
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Bound address per server name.
    pub fn local_addrs(&self) -> Vec<(String, SocketAddr)> {
        self.members
            .iter()
            .map(|m| (m.name.clone(), m.local_addr))
            .collect()
    }

    fn spare_for(&self, listen: &str) -> Option<io::Result<std::net::TcpListener>> {
        self.members
            .iter()
            .find(|m| m.listen == listen)
            .and_then(|m| m.spare.as_ref())
            .map(std::net::TcpListener::try_clone)
    }

    /// Wait for a serving task to end on its own.
    ///
    /// Never resolves for an empty generation.
    pub async fn next_exit(&mut self) -> Exit {
        match self.tasks.join_next().await {
            Some(Ok(exit)) => exit,
            Some(Err(err)) => ("<task>".to_string(), Err(io::Error::other(err))),
            None => std::future::pending().await,
        }
    }

    /// Stop accepting, give in-flight requests `stop_timeout`, then abort
    /// whatever is still running after a further `kill_timeout`.
    ///
    /// Returns the errors serving tasks ended with.
    pub async fn drain(mut self, stop_timeout: Duration, kill_timeout: Duration) -> Vec<ListenError> {
        tracing::info!(generation = self.id, "Draining");
        for member in &mut self.members {
            member.spare = None;
            member.handle.graceful_shutdown(Some(stop_timeout));
        }

        let mut errors = Vec::new();
        let tasks = &mut self.tasks;
        let drained = tokio::time::timeout(stop_timeout + kill_timeout, async {
            while let Some(joined) = tasks.join_next().await {
                collect(joined, &mut errors);
            }
        })
        .await;

        if drained.is_err() {
            tracing::warn!(generation = self.id, "Drain deadline passed, closing connections");
            for member in &self.members {
                member.handle.shutdown();
            }
            self.tasks.abort_all();
            while self.tasks.join_next().await.is_some() {}
        }

        tracing::info!(generation = self.id, "Drained");
        errors
    }
}

fn collect(joined: Result<Exit, tokio::task::JoinError>, errors: &mut Vec<ListenError>) {
    match joined {
        Ok((_, Ok(()))) => {}
        Ok((server, Err(source))) => errors.push(ListenError::Serve { server, source }),
        Err(err) if err.is_cancelled() => {}
        Err(err) => errors.push(ListenError::Serve {
            server: "<task>".to_string(),
            source: io::Error::other(err),
        }),
    }
}

async fn prepare(launch: Launch, previous: Option<&Generation>) -> Result<Prepared, ListenError> {
    let bind_err = |source: io::Error| ListenError::Bind {
        server: launch.name.clone(),
        listen: launch.listen.clone(),
        source,
    };

    let spare = match previous.and_then(|p| p.spare_for(&launch.listen)) {
        Some(inherited) => {
            tracing::debug!(server = %launch.name, listen = %launch.listen, "Inheriting listener");
            inherited.map_err(bind_err)?
        }
        None => net::bind(&launch.name, &launch.listen)?,
    };
    let listener = spare.try_clone().map_err(bind_err)?;

    let tls = match &launch.tls {
        Some(paths) => Some(load_tls_config(paths).await.map_err(|source| {
            ListenError::Tls {
                server: launch.name.clone(),
                source,
            }
        })?),
        None => None,
    };

    Ok(Prepared {
        launch,
        listener,
        spare,
        tls,
    })
}
