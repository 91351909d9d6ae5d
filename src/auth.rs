//! Per-call authentication for the gRPC services.
//!
//! Runs as a tonic interceptor, so a rejected call never reaches hub code.

use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;
use tonic::metadata::{Ascii, MetadataMap, MetadataValue};
use tonic::service::Interceptor;
use tonic::{Request, Status};

use crate::config::AuthConfig;

pub const AUTHORIZATION_HEADER: &str = "authorization";
const BEARER_PREFIX: &str = "Bearer ";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing authorization header")]
    MissingCredentials,

    #[error("malformed authorization header")]
    Malformed,

    #[error("invalid credentials")]
    InvalidCredentials,
}

impl From<AuthError> for Status {
    fn from(err: AuthError) -> Self {
        Status::unauthenticated(err.to_string())
    }
}

pub trait Authenticator: Send + Sync + 'static {
    fn authenticate(&self, metadata: &MetadataMap) -> Result<(), AuthError>;
}

/// Accepts every call.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authenticator for AllowAll {
    fn authenticate(&self, _metadata: &MetadataMap) -> Result<(), AuthError> {
        Ok(())
    }
}

/// Accepts calls carrying `authorization: Bearer <token>` for one of the configured tokens.
#[derive(Debug, Clone)]
pub struct TokenAuthenticator {
    tokens: HashSet<String>,
}

impl TokenAuthenticator {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
        }
    }
}

impl Authenticator for TokenAuthenticator {
    fn authenticate(&self, metadata: &MetadataMap) -> Result<(), AuthError> {
        let header = metadata
            .get(AUTHORIZATION_HEADER)
            .ok_or(AuthError::MissingCredentials)?
            .to_str()
            .map_err(|_| AuthError::Malformed)?;
        let token = header
            .strip_prefix(BEARER_PREFIX)
            .ok_or(AuthError::Malformed)?
            .trim();

        if self.tokens.contains(token) {
            Ok(())
        } else {
            Err(AuthError::InvalidCredentials)
        }
    }
}

/// Picks the authenticator for a hub configuration.
pub fn from_config(config: &AuthConfig) -> Arc<dyn Authenticator> {
    if config.is_enabled() {
        Arc::new(TokenAuthenticator::new(config.tokens.iter().cloned()))
    } else {
        Arc::new(AllowAll)
    }
}

/// Server-side interceptor running an [`Authenticator`] on every call.
#[derive(Clone)]
pub struct AuthInterceptor {
    authenticator: Arc<dyn Authenticator>,
}

impl AuthInterceptor {
    pub fn new(authenticator: Arc<dyn Authenticator>) -> Self {
        Self { authenticator }
    }
}

impl Interceptor for AuthInterceptor {
    fn call(&mut self, request: Request<()>) -> Result<Request<()>, Status> {
        if let Err(e) = self.authenticator.authenticate(request.metadata()) {
            tracing::warn!(error = %e, "Rejected unauthenticated call");
            return Err(e.into());
        }
        Ok(request)
    }
}

/// Client-side interceptor attaching a bearer token, if any.
#[derive(Clone, Default)]
pub struct BearerToken {
    value: Option<MetadataValue<Ascii>>,
}

impl BearerToken {
    pub fn new(token: Option<&str>) -> Result<Self, AuthError> {
        let value = match token {
            Some(token) => Some(
                format!("{}{}", BEARER_PREFIX, token)
                    .parse::<MetadataValue<Ascii>>()
                    .map_err(|_| AuthError::Malformed)?,
            ),
            None => None,
        };
        Ok(Self { value })
    }
}

impl Interceptor for BearerToken {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        if let Some(value) = &self.value {
            request
                .metadata_mut()
                .insert(AUTHORIZATION_HEADER, value.clone());
        }
        Ok(request)
    }
}
