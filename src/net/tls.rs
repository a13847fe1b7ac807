//! TLS configuration and certificate loading.

use std::path::{Path, PathBuf};

use axum_server::tls_rustls::RustlsConfig;
use thiserror::Error;

use crate::config::schema::SslConfig;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("ssl is not enabled")]
    Disabled,
    #[error("{what} file not found: {}", path.display())]
    Missing { what: &'static str, path: PathBuf },
    #[error("cannot load certificate {} / key {}: {source}", cert.display(), key.display())]
    Load {
        cert: PathBuf,
        key: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Load the PEM certificate chain and private key named by `[http.ssl]`.
pub async fn load_tls_config(ssl: &SslConfig) -> Result<RustlsConfig, TlsError> {
    if !ssl.ssl {
        return Err(TlsError::Disabled);
    }
    let cert = Path::new(&ssl.cert);
    let key = Path::new(&ssl.key);
    for (what, path) in [("certificate", cert), ("private key", key)] {
        if !path.exists() {
            return Err(TlsError::Missing {
                what,
                path: path.to_path_buf(),
            });
        }
    }

    RustlsConfig::from_pem_file(cert, key)
        .await
        .map_err(|source| TlsError::Load {
            cert: cert.to_path_buf(),
            key: key.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_and_missing_files_are_reported() {
        let off = SslConfig::default();
        assert!(matches!(load_tls_config(&off).await, Err(TlsError::Disabled)));

        let missing = SslConfig {
            ssl: true,
            cert: "/nonexistent/cert.pem".into(),
            key: "/nonexistent/key.pem".into(),
        };
        let err = load_tls_config(&missing).await.unwrap_err();
        assert!(err.to_string().starts_with("certificate file not found"));
    }
}
