use std::{
    future::{ready, Future},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};
use tonic::{body::BoxBody, metadata::MetadataMap, service::Interceptor, Status};
use tower::{Layer, Service};
use tracing::{info, warn};

use crate::{
    context::ClaimSet,
    error::AuthError,
    metrics::Metrics,
    validator::TokenValidator,
};

/// Metadata key carrying the bearer credential
pub const AUTHORIZATION_KEY: &str = "authorization";

/// Scheme prefix including its separator
pub const BEARER_PREFIX: &str = "Bearer ";

/// Method label used when the transport does not expose the gRPC path
pub const UNKNOWN_METHOD: &str = "unknown";

pub(crate) type BoxFuture<T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'static>>;

/// Extracts the bearer credential from call metadata and verifies it
pub struct Authenticator {
    validator: Arc<dyn TokenValidator>,
    metrics: Arc<Metrics>,
}

impl Authenticator {
    pub fn new(validator: Arc<dyn TokenValidator>, metrics: Arc<Metrics>) -> Self {
        Self { validator, metrics }
    }

    /// Authenticate one call. Emits exactly one log record whatever the outcome.
    pub fn authenticate(
        &self,
        method: &str,
        metadata: Option<&MetadataMap>,
    ) -> Result<ClaimSet, AuthError> {
        let result = self.verify(method, metadata);

        match &result {
            Ok(claims) => {
                info!(method, subject = %claims.subject, "authenticated request");
                self.metrics.record_auth_result("ok");
            }
            Err(e) => {
                warn!(method, reason = e.kind(), error = %e, "authentication failed");
                self.metrics.record_auth_result(e.kind());
            }
        }

        result
    }

    fn verify(&self, method: &str, metadata: Option<&MetadataMap>) -> Result<ClaimSet, AuthError> {
        let metadata = metadata.ok_or(AuthError::MissingMetadata)?;

        let value = metadata
            .get(AUTHORIZATION_KEY)
            .ok_or(AuthError::MissingCredential)?
            .to_str()
            .map_err(|_| AuthError::MalformedCredential)?;

        let token = value
            .strip_prefix(BEARER_PREFIX)
            .filter(|token| !token.is_empty())
            .ok_or(AuthError::MalformedCredential)?;

        self.validator
            .validate(token)
            .map_err(|source| AuthError::InvalidToken {
                method: method.to_string(),
                source,
            })
    }
}

/// Tower layer running [`Authenticator`] in front of a gRPC service
#[derive(Clone)]
pub struct AuthLayer {
    authenticator: Arc<Authenticator>,
}

impl AuthLayer {
    pub fn new(authenticator: Arc<Authenticator>) -> Self {
        Self { authenticator }
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = AuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthService {
            inner,
            authenticator: self.authenticator.clone(),
        }
    }
}

/// Service produced by [`AuthLayer`]
#[derive(Clone)]
pub struct AuthService<S> {
    inner: S,
    authenticator: Arc<Authenticator>,
}

impl<S, B> Service<http::Request<B>> for AuthService<S>
where
    S: Service<http::Request<B>, Response = http::Response<BoxBody>>,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: http::Request<B>) -> Self::Future {
        let metadata = MetadataMap::from_headers(req.headers().clone());
        let outcome = self.authenticator.authenticate(req.uri().path(), Some(&metadata));

        match outcome {
            Ok(claims) => {
                req.extensions_mut().insert(claims);
                Box::pin(self.inner.call(req))
            }
            Err(e) => Box::pin(ready(Ok(Status::from(&e).to_http()))),
        }
    }
}

/// Per-service interceptor variant for `XxxServer::with_interceptor`
#[derive(Clone)]
pub struct AuthInterceptor {
    authenticator: Arc<Authenticator>,
}

impl AuthInterceptor {
    pub fn new(authenticator: Arc<Authenticator>) -> Self {
        Self { authenticator }
    }
}

impl Interceptor for AuthInterceptor {
    fn call(&mut self, mut request: tonic::Request<()>) -> Result<tonic::Request<()>, Status> {
        let claims = self
            .authenticator
            .authenticate(UNKNOWN_METHOD, Some(request.metadata()))?;
        request.extensions_mut().insert(claims);
        Ok(request)
    }
}
