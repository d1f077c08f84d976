//! Outbound call options.

use std::collections::BTreeMap;
use std::time::Duration;

use axum::http::{HeaderMap, Method};
use bytes::Bytes;

/// Everything needed to issue one outbound call.
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    pub scheme: String,
    /// `host:port` of the upstream.
    pub address: String,
    pub method: Method,
    /// Path on the upstream, e.g. `/v1/items`.
    pub uri: String,
    pub args: BTreeMap<String, String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub connect_timeout: Duration,
    /// Overall deadline for the call, body included.
    pub read_timeout: Duration,
}

/// Caller-side overrides for [`Request::proxy_pass`](crate::http::Request::proxy_pass).
///
/// Anything left unset is taken from the inbound request and the server
/// configuration.
#[derive(Debug, Clone, Default)]
pub struct ProxyOverrides {
    scheme: Option<String>,
    method: Option<Method>,
    uri: Option<String>,
    args: Option<BTreeMap<String, String>>,
    headers: Option<HeaderMap>,
    body: Option<Bytes>,
    connect_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
}

impl ProxyOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = Some(scheme.into());
        self
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    pub fn uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    pub fn args(mut self, args: BTreeMap<String, String>) -> Self {
        self.args = Some(args);
        self
    }

    /// Replace the forwarded headers entirely.
    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = Some(headers);
        self
    }

    /// Send `body` instead of the inbound request body.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// Whether the inbound body is still needed.
    pub fn has_body(&self) -> bool {
        self.body.is_some()
    }

    pub fn apply(self, options: &mut ProxyOptions) {
        if let Some(scheme) = self.scheme {
            options.scheme = scheme;
        }
        if let Some(method) = self.method {
            options.method = method;
        }
        if let Some(uri) = self.uri {
            options.uri = uri;
        }
        if let Some(args) = self.args {
            options.args = args;
        }
        if let Some(headers) = self.headers {
            options.headers = headers;
        }
        if let Some(body) = self.body {
            options.body = body;
        }
        if let Some(timeout) = self.connect_timeout {
            options.connect_timeout = timeout;
        }
        if let Some(timeout) = self.read_timeout {
            options.read_timeout = timeout;
        }
    }
}
