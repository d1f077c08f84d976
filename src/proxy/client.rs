//! Outbound HTTP client.
//!
//! # Responsibilities
//! - Build the destination URL from scheme, address, path and query
//! - Apply the connect timeout and the overall read timeout
//! - Forward caller headers verbatim
//!
//! # Design Decisions
//! - One client per server generation, no process-wide client
//! - Never retries; the caller decides what a failure means
//! - Hop-by-hop headers are forwarded untouched. Only the framing headers the
//!   client computes itself (`Host`, `Content-Length`, `Transfer-Encoding`) are
//!   dropped before sending.

use std::time::Duration;

use reqwest::header::{CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use thiserror::Error;
use url::Url;

use crate::proxy::options::ProxyOptions;

/// Error type for outbound calls.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid upstream url '{url}': {source}")]
    Url {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("upstream call to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Shared outbound client.
#[derive(Debug, Clone)]
pub struct ProxyClient {
    client: reqwest::Client,
    connect_timeout: Duration,
}

impl ProxyClient {
    pub fn new(connect_timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: build_client(connect_timeout)?,
            connect_timeout,
        })
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Issue one call. The response body is not read.
    pub async fn send(&self, options: ProxyOptions) -> Result<reqwest::Response, ProxyError> {
        let url = build_url(&options)?;

        // A per-call connect timeout needs its own connector.
        let client = if options.connect_timeout == self.connect_timeout {
            self.client.clone()
        } else {
            build_client(options.connect_timeout).map_err(|source| ProxyError::Transport {
                url: url.to_string(),
                source,
            })?
        };

        let mut headers = options.headers;
        for name in [HOST, CONTENT_LENGTH, TRANSFER_ENCODING] {
            headers.remove(name);
        }

        let mut request = client
            .request(options.method, url.clone())
            .headers(headers)
            .body(options.body);
        if !options.read_timeout.is_zero() {
            request = request.timeout(options.read_timeout);
        }

        tracing::debug!(url = %url, "Proxying request");

        request.send().await.map_err(|source| ProxyError::Transport {
            url: url.to_string(),
            source,
        })
    }
}

fn build_client(connect_timeout: Duration) -> reqwest::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().no_proxy();
    if !connect_timeout.is_zero() {
        builder = builder.connect_timeout(connect_timeout);
    }
    builder.build()
}

/// Destination URL for `options`, query pairs percent-encoded.
pub fn build_url(options: &ProxyOptions) -> Result<Url, ProxyError> {
    let base = format!("{}://{}", options.scheme, options.address);
    let mut url = Url::parse(&base).map_err(|source| ProxyError::Url { url: base, source })?;

    url.set_path(&options.uri);
    if options.args.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(options.args.iter());
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, Method};
    use bytes::Bytes;
    use std::collections::BTreeMap;

    fn options(address: &str) -> ProxyOptions {
        ProxyOptions {
            scheme: "http".into(),
            address: address.into(),
            method: Method::GET,
            uri: "/a b/c".into(),
            args: BTreeMap::from([
                ("q".to_string(), "x&y".to_string()),
                ("n".to_string(), "1".to_string()),
            ]),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            connect_timeout: Duration::from_millis(200),
            read_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn url_encodes_path_and_query() {
        let url = build_url(&options("127.0.0.1:9000")).unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:9000/a%20b/c?n=1&q=x%26y");
    }

    #[test]
    fn url_without_args_has_no_query() {
        let mut opts = options("example.com");
        opts.args.clear();
        assert_eq!(build_url(&opts).unwrap().as_str(), "http://example.com/a%20b/c");
    }

    #[test]
    fn bad_address_is_a_url_error() {
        let err = build_url(&options("exa mple:99999")).unwrap_err();
        assert!(matches!(err, ProxyError::Url { .. }));
    }

    #[tokio::test]
    async fn unreachable_upstream_is_a_transport_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = ProxyClient::new(Duration::from_millis(200)).unwrap();
        let err = client.send(options(&addr.to_string())).await.unwrap_err();
        assert!(matches!(err, ProxyError::Transport { .. }));
    }
}
