//! TCP listener binding.
//!
//! # Responsibilities
//! - Bind configured addresses with address and port reuse
//! - Report bind failures per server
//!
//! # Design Decisions
//! - Listeners are returned as std sockets in non-blocking mode so they can
//!   be duplicated with `try_clone` and handed to the next generation
//! - `SO_REUSEPORT` lets a replacement bind beside a socket that is still
//!   draining

use std::io;
use std::net::{AddrParseError, SocketAddr};

use thiserror::Error;
use tokio::net::TcpSocket;

const BACKLOG: u32 = 1024;

/// Error type for one server's listener.
#[derive(Debug, Error)]
pub enum ListenError {
    #[error("server '{server}': invalid listen address '{listen}': {source}")]
    Address {
        server: String,
        listen: String,
        #[source]
        source: AddrParseError,
    },

    #[error("server '{server}': failed to bind {listen}: {source}")]
    Bind {
        server: String,
        listen: String,
        #[source]
        source: io::Error,
    },

    #[error("server '{server}': failed to load TLS material: {source}")]
    Tls {
        server: String,
        #[source]
        source: io::Error,
    },

    #[error("server '{server}' stopped serving: {source}")]
    Serve {
        server: String,
        #[source]
        source: io::Error,
    },
}

impl ListenError {
    pub fn server(&self) -> &str {
        match self {
            ListenError::Address { server, .. }
            | ListenError::Bind { server, .. }
            | ListenError::Tls { server, .. }
            | ListenError::Serve { server, .. } => server,
        }
    }
}

/// Every listener failure of one start or reload.
#[derive(Debug, Error)]
#[error("{}", join(.0))]
pub struct ListenErrors(pub Vec<ListenError>);

fn join(errors: &[ListenError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl ListenErrors {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ListenError> {
        self.0.iter()
    }
}

/// Bind `listen` for `server`.
///
/// Must be called inside a Tokio runtime.
pub fn bind(server: &str, listen: &str) -> Result<std::net::TcpListener, ListenError> {
    let addr: SocketAddr = listen.parse().map_err(|source| ListenError::Address {
        server: server.to_string(),
        listen: listen.to_string(),
        source,
    })?;

    let bind_err = |source: io::Error| ListenError::Bind {
        server: server.to_string(),
        listen: listen.to_string(),
        source,
    };

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(bind_err)?;
    socket.set_reuseaddr(true).map_err(bind_err)?;
    #[cfg(unix)]
    socket.set_reuseport(true).map_err(bind_err)?;
    socket.bind(addr).map_err(bind_err)?;

    let listener = socket.listen(BACKLOG).map_err(bind_err)?;
    let listener = listener.into_std().map_err(bind_err)?;

    tracing::info!(
        server = %server,
        address = %listener.local_addr().map_err(bind_err)?,
        "Listener bound"
    );
    Ok(listener)
}
