//! Trusted-caller gate and role-based login.
//!
//! Privileged coordinator entry points are guarded by a whitelist of caller
//! identities, checked explicitly at each entry point. Node sources and
//! their policies are added to the whitelist at registration and revoked at
//! unregistration, so for source-originated calls the whitelist tracks the
//! source registry exactly.
//!
//! Credential verification itself is an external collaborator; the core
//! only consumes identities and drives the ordered role-fallback login.

use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Administrator role name.
pub const ROLE_ADMIN: &str = "admin";

/// Regular user role name.
pub const ROLE_USER: &str = "user";

// =============================================================================
// Caller Identities
// =============================================================================

/// Identity of a collaborator invoking a coordinator entry point.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallerId(String);

impl CallerId {
    /// The administration interface.
    pub fn admin() -> Self {
        Self("admin".to_string())
    }

    /// The user-facing allocation interface.
    pub fn allocation() -> Self {
        Self("allocation".to_string())
    }

    /// The monitoring interface.
    pub fn monitoring() -> Self {
        Self("monitoring".to_string())
    }

    /// The allocation-selection collaborator.
    pub fn selector() -> Self {
        Self("selector".to_string())
    }

    /// The authentication collaborator.
    pub fn authentication() -> Self {
        Self("authentication".to_string())
    }

    /// The owning process's lifecycle management (shutdown trigger).
    pub fn process() -> Self {
        Self("process".to_string())
    }

    /// A registered node source.
    pub fn source(name: &str) -> Self {
        Self(format!("source:{name}"))
    }

    /// The acquisition policy attached to a node source.
    pub fn policy(source_name: &str) -> Self {
        Self(format!("policy:{source_name}"))
    }

    /// An arbitrary identity, for callers outside the bootstrap set.
    pub fn named(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl std::fmt::Display for CallerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whitelist of identities permitted to invoke privileged entry points.
#[derive(Debug, Default)]
pub struct TrustedCallers {
    callers: HashSet<CallerId>,
}

impl TrustedCallers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, caller: CallerId) {
        debug!(caller = %caller, "Registered trusted caller");
        self.callers.insert(caller);
    }

    pub fn revoke(&mut self, caller: &CallerId) {
        debug!(caller = %caller, "Revoked trusted caller");
        self.callers.remove(caller);
    }

    pub fn contains(&self, caller: &CallerId) -> bool {
        self.callers.contains(caller)
    }
}

// =============================================================================
// Role-Fallback Login
// =============================================================================

/// Opaque credentials passed through to the authentication collaborator.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub secret: String,
}

/// A failed login attempt or an exhausted attempt list.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("login as {role} denied: {reason}")]
    Denied { role: String, reason: String },

    #[error("all login attempts failed: {0}")]
    AllAttemptsFailed(String),
}

/// External credential-verification collaborator.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Verify the credentials for `role`, where membership in any of
    /// `allowed_roles` is sufficient.
    async fn login_as(
        &self,
        role: &str,
        allowed_roles: &[&str],
        credentials: &Credentials,
    ) -> Result<(), AuthError>;
}

/// Log in with an explicit ordered list of role attempts: first as admin,
/// then as user (an admin may always act as a user). Stops at the first
/// success and returns the granted role; if every attempt fails the
/// combined failure is surfaced.
pub async fn login_with_role_fallback(
    authenticator: &dyn Authenticator,
    credentials: &Credentials,
) -> Result<String, AuthError> {
    let attempts: [(&str, &[&str]); 2] = [
        (ROLE_ADMIN, &[ROLE_ADMIN]),
        (ROLE_USER, &[ROLE_ADMIN, ROLE_USER]),
    ];

    let mut failures = Vec::new();
    for (role, allowed) in attempts {
        match authenticator.login_as(role, allowed, credentials).await {
            Ok(()) => {
                debug!(user = %credentials.username, role, "Login succeeded");
                return Ok(role.to_string());
            }
            Err(e) => failures.push(e.to_string()),
        }
    }

    Err(AuthError::AllAttemptsFailed(failures.join("; ")))
}

/// Mock authenticator granting a fixed set of roles to one secret.
pub struct MockAuthenticator {
    granted_roles: HashSet<String>,
    secret: String,
}

impl MockAuthenticator {
    pub fn granting(roles: &[&str], secret: &str) -> Self {
        Self {
            granted_roles: roles.iter().map(|r| r.to_string()).collect(),
            secret: secret.to_string(),
        }
    }
}

#[async_trait]
impl Authenticator for MockAuthenticator {
    async fn login_as(
        &self,
        role: &str,
        allowed_roles: &[&str],
        credentials: &Credentials,
    ) -> Result<(), AuthError> {
        if credentials.secret != self.secret {
            return Err(AuthError::Denied {
                role: role.to_string(),
                reason: "bad secret".to_string(),
            });
        }
        if allowed_roles.iter().any(|r| self.granted_roles.contains(*r)) {
            Ok(())
        } else {
            Err(AuthError::Denied {
                role: role.to_string(),
                reason: "role not granted".to_string(),
            })
        }
    }
}
