//! Logging setup and W3C trace context helpers.
//!
//! A trace parent looks like `00-3b03c24a4efad25e514890c874dc9e33-59c10f1945da62ca-01`:
//! version, trace ID, span ID, flags.

use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::config::LogFormat;
use crate::deployment::DeploymentRequest;

/// Install the global subscriber. `RUST_LOG` overrides the default `info` filter.
pub fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Fresh sampled trace parent for a new deployment.
pub fn new_trace_parent() -> String {
    let trace_id = Uuid::new_v4().simple().to_string();
    let span_id = &Uuid::new_v4().simple().to_string()[..16];
    format!("00-{}-{}-01", trace_id, span_id)
}

/// Trace ID part of a trace parent, or `None` if it isn't one.
pub fn trace_id(trace_parent: &str) -> Option<&str> {
    let parts: Vec<&str> = trace_parent.split('-').collect();
    match parts.as_slice() {
        [_, trace_id, _, _] if trace_id.len() == 32 => Some(trace_id),
        _ => None,
    }
}

/// Span carrying the fields we filter deployments on.
pub fn deployment_span(request: &DeploymentRequest) -> tracing::Span {
    tracing::info_span!(
        "deployment",
        deployment_id = %request.id.map(|id| id.to_string()).unwrap_or_default(),
        cluster = %request.cluster,
        team = %request.team,
        repository = %request.repository.full_name(),
        git_ref = %request.git_ref,
        trace_id = trace_id(&request.trace_parent).unwrap_or(""),
    )
}
