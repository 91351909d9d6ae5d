use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// TLS configuration for the gRPC endpoints.
///
/// On the server, a complete config enables mutual TLS: the hub presents its certificate and
/// requires client certificates signed by the CA. Clients and agents use the same files to
/// present their own identity and verify the hub.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// Enable TLS. If false, all other TLS settings are ignored.
    pub enabled: bool,

    /// Path to the CA certificate (PEM format).
    pub ca_cert_path: Option<PathBuf>,

    /// Path to this process's certificate (PEM format).
    pub cert_path: Option<PathBuf>,

    /// Path to the private key matching `cert_path` (PEM format).
    pub key_path: Option<PathBuf>,

    /// When true and TLS files are missing, run in plaintext with a warning instead of failing.
    pub allow_insecure: bool,
}

impl TlsConfig {
    /// Check if TLS is properly configured with all required files.
    pub fn is_complete(&self) -> bool {
        self.enabled
            && self.ca_cert_path.is_some()
            && self.cert_path.is_some()
            && self.key_path.is_some()
    }
}

/// Pre-shared bearer tokens accepted by the hub. Empty means no authentication.
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    pub tokens: Vec<String>,
}

impl AuthConfig {
    pub fn is_enabled(&self) -> bool {
        !self.tokens.is_empty()
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.tokens.push(token.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub listen_addr: SocketAddr,
    /// Read-only HTTP API; disabled when unset.
    pub api_addr: Option<SocketAddr>,
    /// How long a watcher of an unknown ID waits for a submit before it is told `inactive`.
    pub unknown_id_grace: Duration,
    /// How long finished deployments stay in memory.
    pub retention: Duration,
    pub reap_interval: Duration,
    pub tls: TlsConfig,
    pub auth: AuthConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 9090)),
            api_addr: None,
            unknown_id_grace: Duration::from_secs(30),
            retention: Duration::from_secs(3600),
            reap_interval: Duration::from_secs(60),
            tls: TlsConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl HubConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_api_addr(mut self, addr: SocketAddr) -> Self {
        self.api_addr = Some(addr);
        self
    }

    pub fn with_unknown_id_grace(mut self, grace: Duration) -> Self {
        self.unknown_id_grace = grace;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_auth(mut self, auth: AuthConfig) -> Self {
        self.auth = auth;
        self
    }
}

/// Fixed-interval retry for transient transport errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    /// Retries after the first attempt; `None` retries until the overall timeout.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    pub fn disabled() -> Self {
        Self {
            max_attempts: Some(0),
            ..Default::default()
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Whether another try is allowed after `retries` retries already happened.
    pub fn allows(&self, retries: u32) -> bool {
        self.max_attempts.map(|max| retries < max).unwrap_or(true)
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Hub address, `http://host:port` or `https://host:port`.
    pub server: String,
    pub retry: RetryPolicy,
    /// Follow the deployment until it finishes instead of returning after submit.
    pub wait: bool,
    /// Bounds the whole operation, retries and resubmissions included.
    pub timeout: Duration,
    pub tls: TlsConfig,
    pub auth_token: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: "http://127.0.0.1:9090".to_string(),
            retry: RetryPolicy::default(),
            wait: false,
            timeout: Duration::from_secs(600),
            tls: TlsConfig::default(),
            auth_token: None,
        }
    }
}

impl ClientConfig {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            ..Default::default()
        }
    }

    pub fn with_wait(mut self, wait: bool) -> Self {
        self.wait = wait;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub cluster: String,
    pub agent_id: String,
    pub reconnect_interval: Duration,
    /// How many final statuses the agent remembers for re-reporting redelivered requests.
    pub finished_capacity: usize,
}

impl AgentConfig {
    pub fn new(cluster: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            agent_id: agent_id.into(),
            reconnect_interval: Duration::from_secs(5),
            finished_capacity: 1024,
        }
    }

    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    pub fn with_finished_capacity(mut self, capacity: usize) -> Self {
        self.finished_capacity = capacity;
        self
    }
}
