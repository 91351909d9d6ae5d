use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{ArgAction, Parser};
use serde::Serialize;
use tokio_stream::StreamExt;
use uuid::Uuid;

use deploy_hub::client::{DeployApi, DeployError, Deployer, ExitCode, GrpcDeployApi};
use deploy_hub::config::{AuthConfig, ClientConfig, HubConfig, LogFormat, RetryPolicy, TlsConfig};
use deploy_hub::deployment::{DeploymentRequest, DeploymentStatus, Repository, ValidationError};
use deploy_hub::node::HubNode;
use deploy_hub::shutdown::install_shutdown_handler;
use deploy_hub::telemetry;

#[derive(Parser, Debug)]
#[command(name = "deploy-hub")]
#[command(version)]
#[command(about = "Relays Kubernetes deployment requests from CI pipelines to cluster agents")]
#[command(propagate_version = true)]
struct Args {
    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text, env = "LOG_FORMAT")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the deployment hub
    Server(ServerArgs),

    /// Send a deployment request and optionally wait for it to finish
    Deploy(DeployArgs),

    /// Follow the status of a deployment until it finishes
    Status {
        #[command(flatten)]
        client: ClientArgs,

        /// The deployment ID (UUID)
        id: Uuid,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Address for the gRPC services
    #[arg(long, default_value = "0.0.0.0:9090", env = "DEPLOY_HUB_LISTEN")]
    listen: SocketAddr,

    /// Address for the read-only HTTP API (optional)
    #[arg(long, env = "DEPLOY_HUB_API_LISTEN")]
    api_listen: Option<SocketAddr>,

    /// Seconds a watcher of an unknown deployment waits before being told to resubmit
    #[arg(long, default_value = "30")]
    unknown_id_grace: u64,

    /// Seconds finished deployments stay in memory
    #[arg(long, default_value = "3600")]
    retention: u64,

    /// Seconds between reaper runs
    #[arg(long, default_value = "60")]
    reap_interval: u64,

    /// Accepted bearer tokens (comma-separated). No tokens disables authentication.
    #[arg(long, env = "DEPLOY_HUB_TOKENS", value_delimiter = ',')]
    auth_tokens: Vec<String>,

    // === TLS Options ===
    /// Enable mutual TLS for gRPC
    #[arg(long)]
    tls: bool,

    /// Path to CA certificate (PEM format)
    #[arg(long, requires = "tls")]
    ca_cert: Option<PathBuf>,

    /// Path to hub certificate (PEM format)
    #[arg(long, requires = "tls")]
    cert: Option<PathBuf>,

    /// Path to hub private key (PEM format)
    #[arg(long, requires = "tls")]
    key: Option<PathBuf>,

    /// Run in plaintext when --tls is given but certificates cannot be loaded.
    /// NOT recommended for production.
    #[arg(long)]
    allow_insecure: bool,
}

// =============================================================================
// Client Arguments (shared by deploy and status)
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Hub address (use https:// for TLS)
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:9090", env = "DEPLOY_SERVER")]
    server: String,

    /// Bearer token for the hub
    #[arg(long, env = "DEPLOY_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Path to CA certificate (PEM format) for TLS
    #[arg(long)]
    ca_cert: Option<PathBuf>,

    /// Path to client certificate (PEM format) for mTLS
    #[arg(long)]
    cert: Option<PathBuf>,

    /// Path to client private key (PEM format) for mTLS
    #[arg(long)]
    key: Option<PathBuf>,

    /// Retry when the hub is unavailable
    #[arg(long, action = ArgAction::Set, default_value_t = true, env = "RETRY")]
    retry: bool,

    /// Seconds between retries
    #[arg(long, default_value = "5", env = "RETRY_INTERVAL")]
    retry_interval: u64,

    /// Give up after this many retries (unbounded when unset)
    #[arg(long, env = "MAX_RETRIES")]
    max_retries: Option<u32>,

    /// Seconds before giving up on the whole operation
    #[arg(long, default_value = "600", env = "TIMEOUT")]
    timeout: u64,
}

impl ClientArgs {
    fn client_config(&self, wait: bool) -> ClientConfig {
        let retry = if self.retry {
            let policy =
                RetryPolicy::default().with_interval(Duration::from_secs(self.retry_interval));
            match self.max_retries {
                Some(max) => policy.with_max_attempts(max),
                None => policy,
            }
        } else {
            RetryPolicy::disabled()
        };

        ClientConfig {
            server: self.server.clone(),
            retry,
            wait,
            timeout: Duration::from_secs(self.timeout),
            tls: TlsConfig {
                enabled: self.ca_cert.is_some(),
                ca_cert_path: self.ca_cert.clone(),
                cert_path: self.cert.clone(),
                key_path: self.key.clone(),
                allow_insecure: false,
            },
            auth_token: self.token.clone(),
        }
    }
}

// =============================================================================
// Deploy Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct DeployArgs {
    #[command(flatten)]
    client: ClientArgs,

    /// Target cluster
    #[arg(long, env = "CLUSTER")]
    cluster: String,

    /// Team owning the deployment
    #[arg(long, env = "TEAM")]
    team: String,

    /// Prepared resources: a JSON array of Kubernetes resources
    #[arg(long, env = "RESOURCE")]
    resource: PathBuf,

    /// Repository owner
    #[arg(long, default_value = "navikt", env = "OWNER")]
    owner: String,

    /// Repository name
    #[arg(long, default_value = "", env = "REPOSITORY")]
    repository: String,

    /// Git commit the resources were built from
    #[arg(long = "ref", default_value = "master", env = "REF")]
    git_ref: String,

    /// GitHub environment name
    #[arg(long, default_value = "", env = "ENVIRONMENT")]
    environment: String,

    /// Reuse an existing deployment ID
    #[arg(long)]
    id: Option<Uuid>,

    /// Wait for the deployment to finish
    #[arg(long, env = "WAIT")]
    wait: bool,

    /// Print the payload before sending it
    #[arg(long, env = "PRINT_PAYLOAD")]
    print_payload: bool,

    /// Prepare and print, but do not send anything
    #[arg(long, env = "DRY_RUN")]
    dry_run: bool,
}

#[derive(Serialize)]
struct StatusOutput<'a> {
    id: String,
    state: String,
    message: &'a str,
    cluster: &'a str,
}

fn print_status(status: &DeploymentStatus) {
    let output = StatusOutput {
        id: status.request_id.to_string(),
        state: status.state.to_string(),
        message: &status.message,
        cluster: &status.cluster,
    };
    match serde_json::to_string(&output) {
        Ok(line) => println!("{}", line),
        Err(e) => tracing::warn!(error = %e, "Failed to render status"),
    }
}

/// Reads the prepared payload and checks it holds at least one resource.
async fn load_payload(path: &Path) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    let raw = tokio::fs::read(path).await?;
    let resources: Vec<serde_json::Value> = serde_json::from_slice(&raw)?;
    if resources.is_empty() {
        return Err(ValidationError::ResourceRequired.into());
    }
    Ok(serde_json::to_vec(&resources)?)
}

async fn run_deploy(args: DeployArgs) -> ExitCode {
    let payload = match load_payload(&args.resource).await {
        Ok(payload) => payload,
        Err(e) => {
            tracing::error!(path = %args.resource.display(), error = %e, "Unusable resource file");
            return ExitCode::InvocationFailure;
        }
    };

    if args.print_payload {
        match serde_json::from_slice::<serde_json::Value>(&payload)
            .and_then(|v| serde_json::to_string_pretty(&v))
        {
            Ok(pretty) => println!("{}", pretty),
            Err(e) => tracing::warn!(error = %e, "Failed to print payload"),
        }
    }

    let config = args.client.client_config(args.wait);
    let mut request = DeploymentRequest::new(args.cluster, args.team, payload, config.timeout)
        .with_repository(Repository::new(args.owner, args.repository))
        .with_git_ref(args.git_ref)
        .with_trace_parent(telemetry::new_trace_parent());
    request.github_environment = args.environment;
    if let Some(id) = args.id {
        request = request.with_id(id);
    }

    if let Err(e) = request.validate() {
        tracing::error!(error = %e, "Invalid deployment request");
        return ExitCode::InvocationFailure;
    }

    if args.dry_run {
        tracing::info!(trace_parent = %request.trace_parent, "Dry run, not sending the request");
        return ExitCode::Success;
    }

    let api = match GrpcDeployApi::connect(&config).await {
        Ok(api) => api,
        Err(e) => {
            tracing::error!(server = %config.server, error = %e, "Cannot set up hub connection");
            return ExitCode::InvocationFailure;
        }
    };

    let deployer = Deployer::new(api, config).on_status(Arc::new(print_status));
    match deployer.deploy(request).await {
        Ok(status) => ExitCode::for_status(&status),
        Err(e) => {
            tracing::error!(error = %e, "Deployment did not complete");
            e.exit_code()
        }
    }
}

async fn run_status(client: ClientArgs, id: Uuid) -> ExitCode {
    let config = client.client_config(true);
    let api = match GrpcDeployApi::connect(&config).await {
        Ok(api) => api,
        Err(e) => {
            tracing::error!(server = %config.server, error = %e, "Cannot set up hub connection");
            return ExitCode::InvocationFailure;
        }
    };

    let follow = async {
        let mut stream = api.status(id, "").await?;
        let mut last = None;
        while let Some(status) = stream.next().await {
            let status = status?;
            print_status(&status);
            last = Some(status);
        }
        Ok::<_, tonic::Status>(last)
    };

    match tokio::time::timeout(config.timeout, follow).await {
        Ok(Ok(Some(status))) => ExitCode::for_status(&status),
        Ok(Ok(None)) => ExitCode::Unavailable,
        Ok(Err(status)) => {
            tracing::error!(code = ?status.code(), error = status.message(), "Watching failed");
            ExitCode::Unavailable
        }
        Err(_) => DeployError::Timeout { id: Some(id) }.exit_code(),
    }
}

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let tls = TlsConfig {
        enabled: args.tls,
        ca_cert_path: args.ca_cert,
        cert_path: args.cert,
        key_path: args.key,
        allow_insecure: args.allow_insecure,
    };
    if tls.enabled && !tls.is_complete() && !tls.allow_insecure {
        return Err("TLS enabled but missing required paths (--ca-cert, --cert, --key)".into());
    }

    let config = HubConfig {
        listen_addr: args.listen,
        api_addr: args.api_listen,
        unknown_id_grace: Duration::from_secs(args.unknown_id_grace),
        retention: Duration::from_secs(args.retention),
        reap_interval: Duration::from_secs(args.reap_interval.max(1)),
        tls,
        auth: AuthConfig {
            tokens: args.auth_tokens.into_iter().filter(|t| !t.is_empty()).collect(),
        },
    };

    tracing::info!(
        listen = %config.listen_addr,
        api = ?config.api_addr,
        auth = config.auth.is_enabled(),
        "Starting deployment hub"
    );

    let shutdown = install_shutdown_handler()?;
    HubNode::new(config).run(shutdown).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    telemetry::init_logging(args.log_format);

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::Deploy(deploy_args) => {
            let code = run_deploy(deploy_args).await;
            std::process::exit(code.code());
        }
        Commands::Status { client, id } => {
            let code = run_status(client, id).await;
            std::process::exit(code.code());
        }
    }

    Ok(())
}
