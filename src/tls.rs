//! Certificate loading for the hub's gRPC endpoints.
//!
//! The hub serves mutual TLS when fully configured. Clients and agents verify the hub against a
//! CA and may present their own identity.

use std::path::{Path, PathBuf};

use tokio::fs;
use tonic::transport::{Certificate, ClientTlsConfig, Identity, ServerTlsConfig};

use crate::config::TlsConfig;

/// Name the hub certificate is issued for. Peers connect by IP, so trust comes from the CA.
pub const TLS_DOMAIN_NAME: &str = "deploy-hub";

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("CA certificate path not configured")]
    MissingCaCert,

    #[error("Certificate path not configured")]
    MissingCert,

    #[error("Private key path not configured")]
    MissingKey,

    #[error("CA certificate not found: {0}")]
    CaCertNotFound(PathBuf),

    #[error("Certificate not found: {0}")]
    CertNotFound(PathBuf),

    #[error("Private key not found: {0}")]
    KeyNotFound(PathBuf),

    #[error("Failed to read file: {0}")]
    IoError(#[from] std::io::Error),
}

async fn read_existing(
    path: &Path,
    not_found: fn(PathBuf) -> TlsError,
) -> Result<Vec<u8>, TlsError> {
    if !path.exists() {
        return Err(not_found(path.to_path_buf()));
    }
    Ok(fs::read(path).await?)
}

/// Loaded certificate, key and CA, ready for tonic.
#[derive(Clone)]
pub struct TlsIdentity {
    identity: Identity,
    ca_cert: Certificate,
}

impl TlsIdentity {
    /// Load all three files named by `config`.
    pub async fn load(config: &TlsConfig) -> Result<Self, TlsError> {
        let ca_cert_path = config
            .ca_cert_path
            .as_ref()
            .ok_or(TlsError::MissingCaCert)?;
        let cert_path = config.cert_path.as_ref().ok_or(TlsError::MissingCert)?;
        let key_path = config.key_path.as_ref().ok_or(TlsError::MissingKey)?;

        let ca_pem = read_existing(ca_cert_path, TlsError::CaCertNotFound).await?;
        let cert_pem = read_existing(cert_path, TlsError::CertNotFound).await?;
        let key_pem = read_existing(key_path, TlsError::KeyNotFound).await?;

        Ok(Self {
            identity: Identity::from_pem(cert_pem, key_pem),
            ca_cert: Certificate::from_pem(ca_pem),
        })
    }

    /// Server side: present the hub certificate and require CA-signed client certificates.
    pub fn server_tls_config(&self) -> ServerTlsConfig {
        ServerTlsConfig::new()
            .identity(self.identity.clone())
            .client_ca_root(self.ca_cert.clone())
    }

    pub fn client_tls_config(&self) -> ClientTlsConfig {
        ClientTlsConfig::new()
            .domain_name(TLS_DOMAIN_NAME)
            .ca_certificate(self.ca_cert.clone())
            .identity(self.identity.clone())
    }
}

/// Client TLS from whatever subset of files is configured.
///
/// The CA is required to verify the hub; certificate and key are only sent when both are set.
pub async fn client_tls_config(config: &TlsConfig) -> Result<ClientTlsConfig, TlsError> {
    let ca_cert_path = config
        .ca_cert_path
        .as_ref()
        .ok_or(TlsError::MissingCaCert)?;
    let ca_pem = read_existing(ca_cert_path, TlsError::CaCertNotFound).await?;

    let mut tls = ClientTlsConfig::new()
        .domain_name(TLS_DOMAIN_NAME)
        .ca_certificate(Certificate::from_pem(ca_pem));

    if let (Some(cert_path), Some(key_path)) = (&config.cert_path, &config.key_path) {
        let cert_pem = read_existing(cert_path, TlsError::CertNotFound).await?;
        let key_pem = read_existing(key_path, TlsError::KeyNotFound).await?;
        tls = tls.identity(Identity::from_pem(cert_pem, key_pem));
    }

    Ok(tls)
}
