//! Tests for TLS configuration and certificate loading.
//!
//! These tests verify:
//! - TLS configuration validation
//! - Certificate file loading and error reporting
//! - Hub startup with unusable TLS material, with and without the plaintext fallback


use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use deploy_hub::client::DeployApi;
use deploy_hub::config::TlsConfig;
use deploy_hub::deployment::DeploymentState;
use deploy_hub::error::HubError;
use deploy_hub::node::HubNode;
use deploy_hub::tls::{client_tls_config, TlsError, TlsIdentity};
use test_harness::{test_hub_config, test_request, TestHub};

const PLACEHOLDER_PEM: &str = "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n";

/// Write placeholder PEM files for ca, hub cert and hub key into a temporary directory
fn write_pem_files() -> TempDir {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    for name in ["ca.crt", "hub.crt", "hub.key"] {
        std::fs::write(temp_dir.path().join(name), PLACEHOLDER_PEM).expect("Failed to write PEM");
    }
    temp_dir
}

fn tls_config(dir: &Path) -> TlsConfig {
    TlsConfig {
        enabled: true,
        ca_cert_path: Some(dir.join("ca.crt")),
        cert_path: Some(dir.join("hub.crt")),
        key_path: Some(dir.join("hub.key")),
        allow_insecure: false,
    }
}

fn missing_files_config(allow_insecure: bool) -> TlsConfig {
    TlsConfig {
        enabled: true,
        ca_cert_path: Some(PathBuf::from("/nonexistent/ca.crt")),
        cert_path: Some(PathBuf::from("/nonexistent/hub.crt")),
        key_path: Some(PathBuf::from("/nonexistent/hub.key")),
        allow_insecure,
    }
}

// ============================================================================
// TlsConfig Unit Tests
// ============================================================================

#[test]
fn test_tls_config_is_complete_when_all_paths_set() {
    let dir = PathBuf::from("/etc/deploy-hub");
    assert!(tls_config(&dir).is_complete());
}

#[test]
fn test_tls_config_is_not_complete_when_key_missing() {
    let mut config = tls_config(Path::new("/etc/deploy-hub"));
    config.key_path = None;
    assert!(!config.is_complete());
}

// ============================================================================
// TlsIdentity Loading Tests
// ============================================================================

#[tokio::test]
async fn test_load_identity_from_files() {
    let temp_dir = write_pem_files();
    let result = TlsIdentity::load(&tls_config(temp_dir.path())).await;
    assert!(result.is_ok(), "Should load PEM files: {:?}", result.err());
}

#[tokio::test]
async fn test_load_reports_missing_cert_file() {
    let temp_dir = write_pem_files();
    std::fs::remove_file(temp_dir.path().join("hub.crt")).unwrap();

    let result = TlsIdentity::load(&tls_config(temp_dir.path())).await;
    assert!(matches!(result, Err(TlsError::CertNotFound(_))));
}

#[tokio::test]
async fn test_load_reports_missing_key_file() {
    let temp_dir = write_pem_files();
    std::fs::remove_file(temp_dir.path().join("hub.key")).unwrap();

    let result = TlsIdentity::load(&tls_config(temp_dir.path())).await;
    assert!(matches!(result, Err(TlsError::KeyNotFound(_))));
}

#[tokio::test]
async fn test_load_requires_key_path() {
    let temp_dir = write_pem_files();
    let mut config = tls_config(temp_dir.path());
    config.key_path = None;

    let result = TlsIdentity::load(&config).await;
    assert!(matches!(result, Err(TlsError::MissingKey)));
}

#[tokio::test]
async fn test_client_tls_needs_only_ca() {
    let temp_dir = write_pem_files();
    let config = TlsConfig {
        enabled: true,
        ca_cert_path: Some(temp_dir.path().join("ca.crt")),
        ..Default::default()
    };
    assert!(client_tls_config(&config).await.is_ok());
}

#[tokio::test]
async fn test_client_tls_reports_missing_ca_file() {
    let result = client_tls_config(&missing_files_config(false)).await;
    assert!(matches!(result, Err(TlsError::CaCertNotFound(_))));
}

// ============================================================================
// Hub Startup Tests
// ============================================================================

#[tokio::test]
async fn test_hub_refuses_to_start_with_missing_certificates() {
    let mut config = test_hub_config();
    config.tls = missing_files_config(false);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

    let result = HubNode::new(config)
        .serve(listener, CancellationToken::new())
        .await;
    assert!(matches!(
        result,
        Err(HubError::Tls(TlsError::CaCertNotFound(_)))
    ));
}

#[tokio::test]
async fn test_hub_falls_back_to_plaintext_when_allowed() {
    let mut config = test_hub_config();
    config.tls = missing_files_config(true);
    let hub = TestHub::start_with(config).await;

    let client = hub.deploy_api(None).await;
    let status = client.deploy(&test_request("dev")).await.unwrap();
    assert_eq!(status.state, DeploymentState::Pending);
}
