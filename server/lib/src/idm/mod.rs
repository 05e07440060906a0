//! The authentication decision making modules.

pub mod authenticator;
pub mod authflow;
pub mod policy;
pub mod remember;
pub mod sandbox;
pub mod sessionbind;
pub mod translate;

use broker_proto::errors::{AuthenticationError, ConfigError, OperationError};
use uuid::Uuid;

use crate::idm::translate::RemotelyAuthenticatedPrincipal;

/// The combined fault type of the core. Configuration errors propagate to
/// the operator, authentication errors are denials, operation errors are
/// collaborator faults.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdmError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Authentication(#[from] AuthenticationError),
    #[error(transparent)]
    Operation(#[from] OperationError),
}

/// The explicit per-request context. The realm a request is scoped to is
/// always threaded through calls; nothing in the core consults ambient or
/// global state for it.
#[derive(Debug, Clone, Default)]
pub struct InvocationContext {
    pub realm_name: Option<String>,
}

impl InvocationContext {
    pub fn for_realm(realm_name: &str) -> Self {
        InvocationContext {
            realm_name: Some(realm_name.to_string()),
        }
    }
}

/// The locally known entity an authentication resolved to, together with
/// what it was authenticated with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedEntity {
    pub entity_id: Uuid,
    /// Identity values the entity was authenticated with.
    pub authenticated_with: Vec<String>,
    /// Authentication method names asserted by the verifiers, combined
    /// across factors.
    pub authentication_methods: Vec<String>,
    /// Set when the credential used is outdated and must be changed.
    pub outdated_credential_id: Option<Uuid>,
    pub remote_idp: Option<String>,
}

impl AuthenticatedEntity {
    pub fn local(entity_id: Uuid, method: &str) -> Self {
        AuthenticatedEntity {
            entity_id,
            authenticated_with: Vec::with_capacity(0),
            authentication_methods: vec![method.to_string()],
            outdated_credential_id: None,
            remote_idp: None,
        }
    }
}

/// The outcome of one verifier invocation. Immutable once produced; either
/// a local or a remote sub-result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthenticationResult {
    Success {
        authenticated_entity: AuthenticatedEntity,
        /// Present when the factor was a remote login.
        remote_principal: Option<Box<RemotelyAuthenticatedPrincipal>>,
    },
    Deny {
        cause: String,
    },
    /// The remote identity is valid but has no local counterpart. Not an
    /// error - the caller may offer registration or account association.
    UnknownRemotePrincipal(Box<RemotelyAuthenticatedPrincipal>),
    /// The verifier did not apply to the presented input at all.
    NotApplicable,
}
