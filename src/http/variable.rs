//! Per-request variables.

use std::path::PathBuf;
use std::time::Instant;

/// Values captured when a request enters the pipeline.
#[derive(Debug, Clone)]
pub struct Variable {
    /// When the request entered the pipeline.
    pub start_time: Instant,

    /// Configured listen address of the serving server.
    pub server_addr: String,

    /// Static index directory.
    pub index: PathBuf,

    /// Path and query as received.
    pub request_uri: String,

    /// Free-form trailer appended to the access log line. `-` when unset.
    pub log_attach: String,
}

impl Variable {
    pub fn new(server_addr: &str, index: PathBuf, request_uri: &str) -> Self {
        Self {
            start_time: Instant::now(),
            server_addr: server_addr.to_string(),
            index,
            request_uri: request_uri.to_string(),
            log_attach: "-".to_string(),
        }
    }

    /// Seconds since the request started, millisecond precision.
    pub fn elapsed_secs(&self) -> f64 {
        self.start_time.elapsed().as_millis() as f64 / 1000.0
    }
}
