//! Authenticator instances and their capability interfaces. An
//! authenticator is one configured way to perform a factor: a verifier plus
//! metadata, registered under a stable string id. There is no inheritance
//! between verifier kinds; an instance holds exactly one capability.

use crate::prelude::*;

use hashbrown::HashMap;

use crate::stores::DirectoryReadTxn;

/// A verifier of locally held credentials (password, OTP, key, ...). The
/// wire-level check itself happens in the protocol adapter; the core only
/// needs the metadata to select and describe factors.
pub trait CredentialVerifier: Send + Sync {
    /// The authentication method this verifier asserts, e.g. "password".
    fn method(&self) -> &str;

    /// The credential definition this verifier checks against an entity.
    fn credential_name(&self) -> &str;
}

/// A verifier of remote assertions (SAML, OIDC, ...).
pub trait RemoteAuthnVerifier: Send + Sync {
    /// The upstream protocol name, e.g. "saml2".
    fn protocol(&self) -> &str;

    /// The translation profile applied to this verifier's assertions.
    fn translation_profile(&self) -> &str;
}

/// The single capability an authenticator instance holds.
#[derive(Clone)]
pub enum VerifierKind {
    Credential(Arc<dyn CredentialVerifier>),
    Remote(Arc<dyn RemoteAuthnVerifier>),
}

/// One configured authenticator: a verifier plus its instance id.
#[derive(Clone)]
pub struct AuthenticatorInstance {
    pub id: String,
    pub verifier: VerifierKind,
}

impl AuthenticatorInstance {
    pub fn credential(id: &str, verifier: Arc<dyn CredentialVerifier>) -> Self {
        AuthenticatorInstance {
            id: id.to_string(),
            verifier: VerifierKind::Credential(verifier),
        }
    }

    pub fn remote(id: &str, verifier: Arc<dyn RemoteAuthnVerifier>) -> Self {
        AuthenticatorInstance {
            id: id.to_string(),
            verifier: VerifierKind::Remote(verifier),
        }
    }

    /// Whether the entity can currently use this authenticator. A local
    /// authenticator needs a valid credential of its definition; remote
    /// authenticators are always usable.
    pub fn usable_by(
        &self,
        entity_id: Uuid,
        txn: &dyn DirectoryReadTxn,
    ) -> Result<bool, OperationError> {
        match &self.verifier {
            VerifierKind::Credential(verifier) => {
                let state = txn.get_credential_state(entity_id, verifier.credential_name())?;
                Ok(state == CredentialState::Valid)
            }
            VerifierKind::Remote(_) => Ok(true),
        }
    }
}

impl std::fmt::Debug for AuthenticatorInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.verifier {
            VerifierKind::Credential(v) => format!("credential({})", v.method()),
            VerifierKind::Remote(v) => format!("remote({})", v.protocol()),
        };
        f.debug_struct("AuthenticatorInstance")
            .field("id", &self.id)
            .field("kind", &kind)
            .finish()
    }
}

/// All configured authenticator instances, keyed by instance id.
#[derive(Default)]
pub struct AuthenticatorRegistry {
    instances: HashMap<String, Arc<AuthenticatorInstance>>,
}

impl AuthenticatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, instance: AuthenticatorInstance) {
        self.instances
            .insert(instance.id.clone(), Arc::new(instance));
    }

    pub fn get(&self, id: &str) -> Result<Arc<AuthenticatorInstance>, ConfigError> {
        self.instances
            .get(id)
            .cloned()
            .ok_or_else(|| ConfigError::MissingAuthenticator(id.to_string()))
    }
}
