use anyhow::Result;
use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use prometheus::TextEncoder;
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, signal};
use tonic::transport::Server;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rpc_gatekeeper::{
    config::{load_config_from_file, LimitSpec, RegistryConfig},
    metrics::Metrics,
    service::Gatekeeper,
    validator::JwtValidator,
};

const DEFAULT_GLOBAL_RATE: f64 = 1000.0;
const DEFAULT_GLOBAL_BURST: u32 = 2000;

#[derive(Clone)]
struct AppState {
    gatekeeper: Arc<Gatekeeper>,
    metrics: Arc<Metrics>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rpc_gatekeeper=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting RPC Gatekeeper");

    let metrics = Arc::new(Metrics::new()?);
    let config = load_registry_config()?;

    let secret = std::env::var("JWT_SECRET")
        .map_err(|_| anyhow::anyhow!("JWT_SECRET must be set"))?;
    let validator = Arc::new(JwtValidator::new(&secret));

    let gatekeeper = Arc::new(Gatekeeper::new(config, validator, metrics.clone())?);
    let state = AppState {
        gatekeeper: gatekeeper.clone(),
        metrics,
    };

    // Start HTTP server for health checks and metrics
    let http_addr = std::env::var("HTTP_PORT")
        .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        .parse::<SocketAddr>()?;

    let http_server = start_http_server(state, http_addr);

    // Start gRPC server
    let grpc_addr = std::env::var("GRPC_PORT")
        .unwrap_or_else(|_| "0.0.0.0:8081".to_string())
        .parse::<SocketAddr>()?;

    let grpc_server = start_grpc_server(gatekeeper.clone(), grpc_addr);

    info!("HTTP server listening on {}", http_addr);
    info!("gRPC server listening on {}", grpc_addr);

    // Wait for shutdown signal
    tokio::select! {
        result = http_server => {
            if let Err(e) = result {
                warn!("HTTP server error: {}", e);
            }
        }
        result = grpc_server => {
            if let Err(e) = result {
                warn!("gRPC server error: {}", e);
            }
        }
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    gatekeeper.shutdown().await;
    info!("Service stopped");
    Ok(())
}

fn load_registry_config() -> Result<RegistryConfig> {
    match std::env::var("CONFIG_PATH") {
        Ok(config_path) => {
            info!("Loading configuration from: {}", config_path);
            let config = load_config_from_file(&config_path)?;
            Ok(RegistryConfig::try_from(config)?)
        }
        Err(_) => {
            warn!("CONFIG_PATH not set, using default global limit only");
            Ok(RegistryConfig::new(LimitSpec::new(
                DEFAULT_GLOBAL_RATE,
                DEFAULT_GLOBAL_BURST,
            )))
        }
    }
}

async fn start_http_server(state: AppState, addr: SocketAddr) -> Result<()> {
    let app: Router = Router::new()
        .route("/healthcheck", get(health_check))
        .route("/metrics", get(metrics_handler))
        .with_state(state);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn start_grpc_server(gatekeeper: Arc<Gatekeeper>, addr: SocketAddr) -> Result<()> {
    info!("Starting gRPC server with tonic at {}", addr);

    // Auth runs first so admission can read the caller's claims
    let middleware = tower::ServiceBuilder::new()
        .layer(gatekeeper.auth_layer())
        .layer(gatekeeper.admission_layer())
        .into_inner();

    Server::builder()
        .layer(middleware)
        .add_service(probe::ProbeServer)
        .serve(addr)
        .await
        .map_err(|e| anyhow::anyhow!("gRPC server error: {}", e))?;

    Ok(())
}

async fn health_check(State(state): State<AppState>) -> Result<Json<serde_json::Value>, StatusCode> {
    if !state.gatekeeper.sweeper_running() {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    Ok(Json(json!({
        "status": "healthy",
        "caller_limiters": state.gatekeeper.registry().caller_count(),
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}

async fn metrics_handler(State(state): State<AppState>) -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = state.metrics.registry().gather();

    match encoder.encode_to_string(&metric_families) {
        Ok(metrics) => Ok(metrics),
        Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

/// Minimal unary service used to exercise the middleware chain:
/// `/gatekeeper.v1.Probe/Check` takes and returns `google.protobuf.Empty`
/// and reports the authenticated subject in the `x-subject` response header.
mod probe {
    use std::{
        convert::Infallible,
        task::{Context, Poll},
    };
    use tonic::{
        body::BoxBody,
        codec::ProstCodec,
        codegen::{Body, BoxFuture, Service, StdError},
        metadata::{Ascii, MetadataValue},
        server::{Grpc, NamedService, UnaryService},
        Status,
    };
    use tracing::debug;

    use rpc_gatekeeper::context::ClaimSet;

    const CHECK_PATH: &str = "/gatekeeper.v1.Probe/Check";

    #[derive(Clone, Debug, Default)]
    pub struct ProbeServer;

    struct CheckSvc;

    impl UnaryService<()> for CheckSvc {
        type Response = ();
        type Future = BoxFuture<tonic::Response<()>, Status>;

        fn call(&mut self, request: tonic::Request<()>) -> Self::Future {
            let subject = ClaimSet::from_request(&request)
                .map(|claims| claims.subject.clone())
                .unwrap_or_default();

            Box::pin(async move {
                debug!(%subject, "probe check");
                let mut response = tonic::Response::new(());
                if let Ok(value) = subject.parse::<MetadataValue<Ascii>>() {
                    response.metadata_mut().insert("x-subject", value);
                }
                Ok(response)
            })
        }
    }

    impl<B> Service<http::Request<B>> for ProbeServer
    where
        B: Body + Send + 'static,
        B::Error: Into<StdError> + Send + 'static,
    {
        type Response = http::Response<BoxBody>;
        type Error = Infallible;
        type Future = BoxFuture<Self::Response, Self::Error>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, req: http::Request<B>) -> Self::Future {
            match req.uri().path() {
                CHECK_PATH => Box::pin(async move {
                    let mut grpc = Grpc::new(ProstCodec::<(), ()>::default());
                    Ok(grpc.unary(CheckSvc, req).await)
                }),
                _ => Box::pin(async move { Ok(Status::unimplemented("unknown method").to_http()) }),
            }
        }
    }

    impl NamedService for ProbeServer {
        const NAME: &'static str = "gatekeeper.v1.Probe";
    }
}
