use std::{
    future::ready,
    sync::Arc,
    task::{Context, Poll},
    time::Instant,
};
use tonic::{body::BoxBody, Status};
use tower::{Layer, Service};
use tracing::debug;

use crate::{
    auth::BoxFuture,
    context::caller_identity,
    error::AdmissionError,
    metrics::Metrics,
    registry::LimiterRegistry,
};

/// Evaluates the global, method and caller limiters for each call
pub struct AdmissionStage {
    registry: Arc<LimiterRegistry>,
    metrics: Arc<Metrics>,
}

impl AdmissionStage {
    pub fn new(registry: Arc<LimiterRegistry>, metrics: Arc<Metrics>) -> Self {
        Self { registry, metrics }
    }

    pub fn registry(&self) -> &Arc<LimiterRegistry> {
        &self.registry
    }

    /// Admit or reject one call.
    ///
    /// Tiers are checked global, then method, then caller; the first rejection
    /// ends evaluation so later tiers keep their tokens.
    pub fn admit(&self, method: &str, identity: Option<&str>) -> Result<(), AdmissionError> {
        let _timer = self.metrics.start_admission_timer();
        let result = self.evaluate(method, identity);

        match &result {
            Ok(()) => self.metrics.record_admitted(),
            Err(e) => {
                debug!(method, tier = e.tier(), "call rejected");
                self.metrics.record_rejected(e.tier());
            }
        }

        result
    }

    fn evaluate(&self, method: &str, identity: Option<&str>) -> Result<(), AdmissionError> {
        let global = self.registry.global_limiter();
        if !global.allow() {
            return Err(AdmissionError::GlobalRateLimitExceeded);
        }

        // An unconfigured method resolves to the global bucket, already charged above
        let method_limiter = self.registry.resolve_method_limiter(method);
        if !Arc::ptr_eq(&method_limiter, global) && !method_limiter.allow() {
            return Err(AdmissionError::MethodRateLimitExceeded {
                method: method.to_string(),
            });
        }

        if !self.registry.caller_limiting_enabled() {
            return Ok(());
        }

        let identity = identity
            .filter(|identity| !identity.is_empty())
            .ok_or(AdmissionError::MissingIdentity)?;

        // Limiting may have been switched off since the check above
        let Some(entry) = self.registry.resolve_caller_limiter(identity, Instant::now()) else {
            return Ok(());
        };

        if !entry.limiter().allow() {
            return Err(AdmissionError::CallerRateLimitExceeded {
                caller: identity.to_string(),
            });
        }

        Ok(())
    }
}

/// Tower layer running [`AdmissionStage`] after the auth layer
#[derive(Clone)]
pub struct AdmissionLayer {
    stage: Arc<AdmissionStage>,
}

impl AdmissionLayer {
    pub fn new(stage: Arc<AdmissionStage>) -> Self {
        Self { stage }
    }
}

impl<S> Layer<S> for AdmissionLayer {
    type Service = AdmissionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AdmissionService {
            inner,
            stage: self.stage.clone(),
        }
    }
}

/// Service produced by [`AdmissionLayer`]
#[derive(Clone)]
pub struct AdmissionService<S> {
    inner: S,
    stage: Arc<AdmissionStage>,
}

impl<S, B> Service<http::Request<B>> for AdmissionService<S>
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

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        let outcome = self
            .stage
            .admit(req.uri().path(), caller_identity(req.extensions()));

        match outcome {
            Ok(()) => Box::pin(self.inner.call(req)),
            Err(e) => Box::pin(ready(Ok(Status::from(&e).to_http()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LimitSpec, RegistryConfig};
    use std::time::Duration;

    fn stage(config: RegistryConfig) -> AdmissionStage {
        let registry = Arc::new(LimiterRegistry::new(config).unwrap());
        AdmissionStage::new(registry, Arc::new(Metrics::new().unwrap()))
    }

    #[test]
    fn test_global_limit() {
        let stage = stage(RegistryConfig::new(LimitSpec::new(2.0, 2)));

        assert!(stage.admit("/svc/Call", None).is_ok());
        assert!(stage.admit("/svc/Call", None).is_ok());
        assert_eq!(
            stage.admit("/svc/Call", None),
            Err(AdmissionError::GlobalRateLimitExceeded)
        );
    }

    #[test]
    fn test_method_limit() {
        let stage = stage(
            RegistryConfig::new(LimitSpec::new(100.0, 100))
                .with_method("/svc/Slow", LimitSpec::new(1.0, 1)),
        );

        assert!(stage.admit("/svc/Slow", None).is_ok());
        assert_eq!(
            stage.admit("/svc/Slow", None),
            Err(AdmissionError::MethodRateLimitExceeded {
                method: "/svc/Slow".to_string()
            })
        );
        assert!(stage.admit("/svc/Fast", None).is_ok());
    }

    #[test]
    fn test_missing_identity_when_caller_limiting_enabled() {
        let stage = stage(
            RegistryConfig::new(LimitSpec::new(100.0, 100))
                .with_per_caller(LimitSpec::new(1.0, 1)),
        );

        assert_eq!(stage.admit("/svc/Call", None), Err(AdmissionError::MissingIdentity));
        assert_eq!(stage.admit("/svc/Call", Some("")), Err(AdmissionError::MissingIdentity));
    }

    #[test]
    fn test_identity_not_required_when_caller_limiting_disabled() {
        let stage = stage(RegistryConfig::new(LimitSpec::new(100.0, 100)));
        assert!(stage.admit("/svc/Call", None).is_ok());
        assert_eq!(stage.registry().caller_count(), 0);
    }

    #[test]
    fn test_caller_limit_is_per_identity() {
        let stage = stage(
            RegistryConfig::new(LimitSpec::new(100.0, 100))
                .with_per_caller(LimitSpec::new(1.0, 1)),
        );

        assert!(stage.admit("/svc/Call", Some("u1")).is_ok());
        assert!(stage.admit("/svc/Call", Some("u2")).is_ok());
        assert_eq!(
            stage.admit("/svc/Call", Some("u1")),
            Err(AdmissionError::CallerRateLimitExceeded {
                caller: "u1".to_string()
            })
        );
        assert_eq!(stage.registry().caller_count(), 2);
    }

    #[test]
    fn test_rejected_caller_still_refreshes_last_seen() {
        let stage = stage(
            RegistryConfig::new(LimitSpec::new(100.0, 100))
                .with_per_caller(LimitSpec::new(0.001, 1)),
        );

        assert!(stage.admit("/svc/Call", Some("u1")).is_ok());
        let entry = stage.registry().resolve_caller_limiter("u1", Instant::now()).unwrap();
        let first_seen = entry.last_seen();

        std::thread::sleep(Duration::from_millis(5));
        assert!(stage.admit("/svc/Call", Some("u1")).is_err());
        assert!(entry.last_seen() > first_seen);
    }

    #[test]
    fn test_global_rejection_spends_no_lower_tier_tokens() {
        let stage = stage(
            RegistryConfig::new(LimitSpec::new(0.001, 1))
                .with_method("/svc/Call", LimitSpec::new(0.001, 5))
                .with_per_caller(LimitSpec::new(0.001, 2)),
        );

        assert!(stage.admit("/svc/Call", Some("u1")).is_ok());
        for _ in 0..10 {
            assert_eq!(
                stage.admit("/svc/Call", Some("u1")),
                Err(AdmissionError::GlobalRateLimitExceeded)
            );
        }

        // Method tier: 5 - 1 tokens left
        let method = stage.registry().resolve_method_limiter("/svc/Call");
        assert_eq!((0..10).filter(|_| method.allow()).count(), 4);

        // Caller tier: 2 - 1 tokens left
        let caller = stage.registry().resolve_caller_limiter("u1", Instant::now()).unwrap();
        assert_eq!((0..10).filter(|_| caller.limiter().allow()).count(), 1);
    }

    #[test]
    fn test_method_rejection_spends_no_caller_tokens() {
        let stage = stage(
            RegistryConfig::new(LimitSpec::new(100.0, 100))
                .with_method("/svc/Call", LimitSpec::new(0.001, 1))
                .with_per_caller(LimitSpec::new(0.001, 3)),
        );

        assert!(stage.admit("/svc/Call", Some("u1")).is_ok());
        assert!(matches!(
            stage.admit("/svc/Call", Some("u1")),
            Err(AdmissionError::MethodRateLimitExceeded { .. })
        ));

        let caller = stage.registry().resolve_caller_limiter("u1", Instant::now()).unwrap();
        assert_eq!((0..10).filter(|_| caller.limiter().allow()).count(), 2);
    }
}
