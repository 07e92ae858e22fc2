//! Call-scoped identity.
//!
//! The verified [`ClaimSet`] travels in the request extensions keyed by its own
//! type, so the auth stage, the admission stage and service handlers all read
//! the same value without any string keys.

use http::Extensions;

/// Verified identity attributes decoded from a bearer credential
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimSet {
    pub subject: String,
    pub roles: Vec<String>,
    pub permissions: Vec<String>,
}

impl ClaimSet {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            roles: Vec::new(),
            permissions: Vec::new(),
        }
    }

    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_permissions<I, S>(mut self, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.permissions = permissions.into_iter().map(Into::into).collect();
        self
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.iter().any(|p| p == permission)
    }

    /// Claims injected by the auth stage, if any
    pub fn from_extensions(extensions: &Extensions) -> Option<&ClaimSet> {
        extensions.get::<ClaimSet>()
    }

    /// Claims as seen by a tonic handler
    pub fn from_request<T>(request: &tonic::Request<T>) -> Option<&ClaimSet> {
        request.extensions().get::<ClaimSet>()
    }
}

/// Rate-limiting identity of the call: the authenticated subject, when non-empty
pub fn caller_identity(extensions: &Extensions) -> Option<&str> {
    ClaimSet::from_extensions(extensions)
        .map(|claims| claims.subject.as_str())
        .filter(|subject| !subject.is_empty())
}
