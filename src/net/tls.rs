//! TLS configuration and certificate loading.

use std::io;

use axum_server::tls_rustls::RustlsConfig;

use crate::config::TlsPaths;

/// Load TLS configuration from certificate and key files.
pub async fn load_tls_config(paths: &TlsPaths) -> Result<RustlsConfig, io::Error> {
    for (what, path) in [("Certificate", &paths.cert), ("Private key", &paths.key)] {
        if !path.exists() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} file not found: {}", what, path.display()),
            ));
        }
    }

    RustlsConfig::from_pem_file(&paths.cert, &paths.key).await
}
