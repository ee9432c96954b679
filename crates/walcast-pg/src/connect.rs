//! Postgres connection setup with TLS support.

use std::sync::Arc;

use rustls::ClientConfig;
use tokio::task::JoinHandle;
use tokio_postgres::Client;
use tokio_postgres_rustls_improved::MakeRustlsConnect;
use tracing::error;

use crate::error::{PgError, PgResult};

/// Connect to Postgres with TLS settings derived from the sslmode in the
/// connection string.
///
/// The connection is driven on a spawned task whose handle is returned so
/// callers can wait for it to wind down after dropping the client.
pub async fn connect_postgres(connection_string: &str) -> PgResult<(Client, JoinHandle<()>)> {
    if requires_tls(connection_string) {
        let config =
            ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
                .with_safe_default_protocol_versions()
                .map_err(|e| PgError::Connection(format!("TLS config error: {}", e)))?
                .with_root_certificates(root_certs())
                .with_no_client_auth();

        let connector = MakeRustlsConnect::new(config);

        let (client, connection) = tokio_postgres::connect(connection_string, connector)
            .await
            .map_err(|e| PgError::Connection(e.to_string()))?;

        let handle = tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "Postgres connection error");
            }
        });

        Ok((client, handle))
    } else {
        let (client, connection) =
            tokio_postgres::connect(connection_string, tokio_postgres::NoTls)
                .await
                .map_err(|e| PgError::Connection(e.to_string()))?;

        let handle = tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "Postgres connection error");
            }
        });

        Ok((client, handle))
    }
}

fn root_certs() -> rustls::RootCertStore {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    roots
}

fn requires_tls(connection_string: &str) -> bool {
    ["sslmode=require", "sslmode=verify-ca", "sslmode=verify-full"]
        .iter()
        .any(|mode| connection_string.contains(mode))
}
