use tonic::transport::{Channel, Endpoint};

use crate::config::TlsConfig;
use crate::tls::{client_tls_config, TlsError};

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("invalid hub address {addr}: {source}")]
    InvalidAddress {
        addr: String,
        source: tonic::transport::Error,
    },

    #[error("TLS setup failed: {0}")]
    Tls(#[from] TlsError),

    #[error("TLS config rejected: {0}")]
    TlsConfig(tonic::transport::Error),

    #[error("auth token is not a valid header value")]
    InvalidToken,
}

/// Channel to the hub that connects on first use.
///
/// Connection failures surface as `unavailable` on the call, where retry policy applies.
/// TLS is used when enabled in `tls` or when the address is `https://`.
pub async fn connect_lazy(addr: &str, tls: &TlsConfig) -> Result<Channel, ConnectError> {
    let endpoint =
        Endpoint::from_shared(addr.to_string()).map_err(|source| ConnectError::InvalidAddress {
            addr: addr.to_string(),
            source,
        })?;

    let use_tls = tls.enabled || addr.starts_with("https://");
    let endpoint = if use_tls {
        let tls_config = client_tls_config(tls).await?;
        endpoint
            .tls_config(tls_config)
            .map_err(ConnectError::TlsConfig)?
    } else {
        endpoint
    };

    Ok(endpoint.connect_lazy())
}
