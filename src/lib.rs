//! RPC Gatekeeper
//!
//! Request-admission middleware for tonic gRPC services. Each call is first
//! authenticated from its bearer credential, with the verified claims placed in
//! the request extensions, and then admitted through a global, a per-method and
//! a per-caller token bucket before it reaches the service.

pub mod admission;
pub mod auth;
pub mod bucket;
pub mod config;
pub mod context;
pub mod error;
pub mod metrics;
pub mod registry;
pub mod service;
pub mod sweeper;
pub mod validator;

// Re-export main types
pub use admission::{AdmissionLayer, AdmissionStage};
pub use auth::{AuthInterceptor, AuthLayer, Authenticator};
pub use config::{AdmissionConfig, LimitSpec, RegistryConfig};
pub use context::ClaimSet;
pub use error::{AdmissionError, AuthError, GatekeeperError, Result, TokenError};
pub use registry::LimiterRegistry;
pub use service::Gatekeeper;
pub use validator::{JwtValidator, TokenValidator};
