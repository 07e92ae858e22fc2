use parking_lot::Mutex;
use std::sync::Arc;
use tracing::info;

use crate::{
    admission::{AdmissionLayer, AdmissionStage},
    auth::{AuthInterceptor, AuthLayer, Authenticator},
    config::RegistryConfig,
    error::Result,
    metrics::Metrics,
    registry::LimiterRegistry,
    sweeper::{Sweeper, SweeperHandle},
    validator::TokenValidator,
};

/// Auth and admission stages wired to one limiter registry, plus its sweeper
pub struct Gatekeeper {
    registry: Arc<LimiterRegistry>,
    authenticator: Arc<Authenticator>,
    admission: Arc<AdmissionStage>,
    metrics: Arc<Metrics>,
    sweeper: Mutex<Option<SweeperHandle>>,
}

impl Gatekeeper {
    /// Build the stages and start the idle sweeper. Must be called inside a tokio runtime.
    pub fn new(
        config: RegistryConfig,
        validator: Arc<dyn TokenValidator>,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let sweep_interval = config.sweep_interval;
        let max_idle = config.max_idle;

        let registry = Arc::new(LimiterRegistry::new(config)?.with_metrics(metrics.clone()));
        let authenticator = Arc::new(Authenticator::new(validator, metrics.clone()));
        let admission = Arc::new(AdmissionStage::new(registry.clone(), metrics.clone()));
        let sweeper = Sweeper::spawn(registry.clone(), metrics.clone());

        info!(
            methods = registry.method_count(),
            per_caller = registry.caller_limiting_enabled(),
            ?sweep_interval,
            ?max_idle,
            "gatekeeper started"
        );

        Ok(Self {
            registry,
            authenticator,
            admission,
            metrics,
            sweeper: Mutex::new(Some(sweeper)),
        })
    }

    /// First layer of the chain: authenticates and injects the claim set
    pub fn auth_layer(&self) -> AuthLayer {
        AuthLayer::new(self.authenticator.clone())
    }

    /// Second layer of the chain: global, method and caller limits
    pub fn admission_layer(&self) -> AdmissionLayer {
        AdmissionLayer::new(self.admission.clone())
    }

    /// Per-service alternative to [`Gatekeeper::auth_layer`].
    ///
    /// Interceptors run inside the server-level layers, after admission. Do not
    /// pair it with [`Gatekeeper::admission_layer`] while per-caller limiting is
    /// on: admission would find no claims and reject every call as missing
    /// identity.
    pub fn auth_interceptor(&self) -> AuthInterceptor {
        AuthInterceptor::new(self.authenticator.clone())
    }

    pub fn authenticator(&self) -> &Arc<Authenticator> {
        &self.authenticator
    }

    pub fn admission(&self) -> &Arc<AdmissionStage> {
        &self.admission
    }

    pub fn registry(&self) -> &Arc<LimiterRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn sweeper_running(&self) -> bool {
        self.sweeper
            .lock()
            .as_ref()
            .is_some_and(SweeperHandle::is_running)
    }

    /// Stop the sweeper. Calling it again is a no-op.
    pub async fn shutdown(&self) {
        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            sweeper.stop().await;
            info!("gatekeeper stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::LimitSpec, validator::JwtValidator};

    fn create_test_gatekeeper() -> Gatekeeper {
        let config = RegistryConfig::new(LimitSpec::new(10.0, 10))
            .with_method("/svc/Slow", LimitSpec::new(1.0, 1));
        Gatekeeper::new(
            config,
            Arc::new(JwtValidator::new("secret")),
            Arc::new(Metrics::new().unwrap()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_gatekeeper_creation() {
        let gatekeeper = create_test_gatekeeper();
        assert_eq!(gatekeeper.registry().method_count(), 1);
        assert!(!gatekeeper.registry().caller_limiting_enabled());
        assert!(gatekeeper.admission().admit("/svc/Slow", None).is_ok());
        assert!(gatekeeper.sweeper_running());

        gatekeeper.shutdown().await;
        assert!(!gatekeeper.sweeper_running());
    }

    #[tokio::test]
    async fn test_interceptor_needs_identity_for_caller_limits() {
        use jsonwebtoken::{encode, EncodingKey, Header};
        use tonic::service::Interceptor;

        let gatekeeper = Gatekeeper::new(
            RegistryConfig::new(LimitSpec::new(10.0, 10)).with_per_caller(LimitSpec::new(1.0, 1)),
            Arc::new(JwtValidator::new("secret")),
            Arc::new(Metrics::new().unwrap()),
        )
        .unwrap();

        // Admission ahead of the interceptor sees no claims
        assert_eq!(
            gatekeeper.admission().admit("/svc/Call", None),
            Err(crate::error::AdmissionError::MissingIdentity)
        );

        let token = encode(
            &Header::default(),
            &serde_json::json!({ "sub": "u1", "exp": chrono::Utc::now().timestamp() + 600 }),
            &EncodingKey::from_secret(b"secret"),
        )
        .unwrap();
        let mut request = tonic::Request::new(());
        request
            .metadata_mut()
            .insert("authorization", format!("Bearer {}", token).parse().unwrap());

        let request = gatekeeper.auth_interceptor().call(request).unwrap();
        let subject = crate::context::ClaimSet::from_request(&request)
            .map(|claims| claims.subject.clone());
        assert_eq!(subject.as_deref(), Some("u1"));
        assert!(gatekeeper.admission().admit("/svc/Call", subject.as_deref()).is_ok());

        gatekeeper.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_twice() {
        let gatekeeper = create_test_gatekeeper();
        gatekeeper.shutdown().await;
        gatekeeper.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let result = Gatekeeper::new(
            RegistryConfig::new(LimitSpec::new(0.0, 1)),
            Arc::new(JwtValidator::new("secret")),
            Arc::new(Metrics::new().unwrap()),
        );
        assert!(result.is_err());
    }
}
