//! Route table.
//!
//! Routes are registered on a [`ServerInstance`](crate::http::ServerInstance)
//! before it is initialized and compiled into an axum router once per
//! generation. Paths use axum syntax: `/users/{id}`, `/files/{*rest}`.
//! Every route answers any method.

use std::sync::Arc;

use axum::http::StatusCode;
use axum::routing::any;
use axum::Router;

use crate::http::handler::{sync_handler, BoxedHandler, HandlerChain};
use crate::http::request::{dispatch, Request};
use crate::http::server::ServerRuntime;

/// Join a group prefix and a relative path.
///
/// A trailing slash on `path` is kept, so `("/api", "/")` is `/api/`.
pub fn join_path(prefix: &str, path: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    if path.is_empty() {
        return if prefix.is_empty() {
            "/".to_string()
        } else if prefix.starts_with('/') {
            prefix.to_string()
        } else {
            format!("/{prefix}")
        };
    }
    let path = path.trim_start_matches('/');
    let joined = format!("{prefix}/{path}");
    if joined.starts_with('/') {
        joined
    } else {
        format!("/{joined}")
    }
}

/// Registered routes plus the fallback chain.
#[derive(Debug, Default, Clone)]
pub struct RouteTable {
    routes: Vec<(String, HandlerChain)>,
    fallback: Option<HandlerChain>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handlers` for `path`. Registering a path again replaces it.
    pub fn route(&mut self, path: &str, handlers: Vec<BoxedHandler>) {
        self.insert(join_path("", path), HandlerChain::new(handlers));
    }

    /// A group whose routes share `prefix` and run `handlers` first.
    pub fn group(&mut self, prefix: &str, handlers: Vec<BoxedHandler>) -> RouterGroup<'_> {
        RouterGroup {
            prefix: join_path("", prefix),
            chain: HandlerChain::new(handlers),
            table: self,
        }
    }

    /// Chain for requests no route matches. Defaults to a 404.
    pub fn default_route(&mut self, handlers: Vec<BoxedHandler>) {
        self.fallback = Some(HandlerChain::new(handlers));
    }

    pub fn contains(&self, path: &str) -> bool {
        self.routes.iter().any(|(p, _)| p == path)
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.routes.iter().map(|(p, _)| p.as_str())
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    fn insert(&mut self, path: String, chain: HandlerChain) {
        match self.routes.iter_mut().find(|(p, _)| *p == path) {
            Some(entry) => entry.1 = chain,
            None => self.routes.push((path, chain)),
        }
    }

    /// Compile into an axum router bound to one runtime snapshot.
    pub(crate) fn build(&self, runtime: Arc<ServerRuntime>) -> Router {
        let mut router = Router::new();
        for (path, chain) in &self.routes {
            router = router.route(path, any(endpoint(Arc::clone(&runtime), chain.clone())));
        }

        let fallback = self.fallback.clone().unwrap_or_else(not_found);
        router.fallback(endpoint(runtime, fallback))
    }
}

fn endpoint(
    runtime: Arc<ServerRuntime>,
    chain: HandlerChain,
) -> impl Fn(axum::extract::Request) -> futures_util::future::BoxFuture<'static, axum::response::Response>
       + Clone
       + Send
       + Sync
       + 'static {
    move |req| Box::pin(dispatch(Arc::clone(&runtime), chain.clone(), req))
}

fn not_found() -> HandlerChain {
    HandlerChain::new(vec![sync_handler(|req: &mut Request| {
        req.exit_with(StatusCode::NOT_FOUND, "404 page not found")
    })])
}

/// Routes sharing a prefix and leading handlers. Groups nest.
pub struct RouterGroup<'a> {
    table: &'a mut RouteTable,
    prefix: String,
    chain: HandlerChain,
}

impl RouterGroup<'_> {
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Register `path` under the group prefix; group handlers run first.
    pub fn route(&mut self, path: &str, handlers: Vec<BoxedHandler>) -> &mut Self {
        let path = join_path(&self.prefix, path);
        let chain = self.chain.extend(&handlers);
        self.table.insert(path, chain);
        self
    }

    /// Nested group: prefixes and handlers accumulate.
    pub fn group(&mut self, prefix: &str, handlers: Vec<BoxedHandler>) -> RouterGroup<'_> {
        RouterGroup {
            prefix: join_path(&self.prefix, prefix),
            chain: self.chain.extend(&handlers),
            table: &mut *self.table,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::handler::Flow;

    fn pass() -> BoxedHandler {
        sync_handler(|req: &mut Request| req.next())
    }

    fn stop() -> BoxedHandler {
        sync_handler(|_: &mut Request| Flow::Stop)
    }

    #[test]
    fn join_paths() {
        assert_eq!(join_path("", ""), "/");
        assert_eq!(join_path("", "/x"), "/x");
        assert_eq!(join_path("/", "x"), "/x");
        assert_eq!(join_path("/api", ""), "/api");
        assert_eq!(join_path("/api/", "/v1"), "/api/v1");
        assert_eq!(join_path("/api", "/"), "/api/");
        assert_eq!(join_path("api", "items/{id}"), "/api/items/{id}");
    }

    #[test]
    fn groups_accumulate_prefix_and_handlers() {
        let mut table = RouteTable::new();
        {
            let mut api = table.group("/api", vec![pass()]);
            api.route("/status", vec![stop()]);
            let mut v1 = api.group("/v1", vec![pass()]);
            v1.route("/items/{id}", vec![stop()]);
        }
        table.route("/health", vec![stop()]);

        let paths: Vec<_> = table.paths().collect();
        assert_eq!(paths, vec!["/api/status", "/api/v1/items/{id}", "/health"]);

        let chain_len = |path: &str| {
            table
                .routes
                .iter()
                .find(|(p, _)| p == path)
                .map(|(_, c)| c.len())
        };
        assert_eq!(chain_len("/api/status"), Some(2));
        assert_eq!(chain_len("/api/v1/items/{id}"), Some(3));
        assert_eq!(chain_len("/health"), Some(1));
    }

    #[test]
    fn re_registering_replaces() {
        let mut table = RouteTable::new();
        table.route("/x", vec![pass(), stop()]);
        table.route("x", vec![stop()]);
        assert_eq!(table.len(), 1);
        assert!(table.contains("/x"));
    }
}
