//! Collaborator interfaces of the authentication core. Storage of entities,
//! tokens and sessions, and the transport-level session of a request, are
//! all external concerns consumed through these traits. In-memory
//! implementations for tests live in [`crate::testkit`].

use time::OffsetDateTime;
use uuid::Uuid;

use broker_proto::authn::{AuthenticationOptionKey, AuthenticationRealm, RememberMeInfo};
use broker_proto::errors::{ConfigError, OperationError};
use broker_proto::identity::{Attribute, CredentialState, IdentityValue};
use broker_proto::session::LoginSession;

use crate::idm::translate::{MappingResult, TranslationProfile};

/// A consistent read view over the entity directory. All lookups made
/// through one value of this trait must observe a single snapshot, so that
/// an attribute/group/credential fetch is never interleaved with a
/// concurrent update of the same entity.
pub trait DirectoryReadTxn {
    /// Resolve an identity value to the owning entity. Fails with
    /// [`OperationError::NoMatchingEntries`] when no entity owns it.
    fn resolve_identity(
        &self,
        value: &str,
        candidate_types: &[&str],
    ) -> Result<Uuid, OperationError>;

    fn is_enabled(&self, entity_id: Uuid) -> Result<bool, OperationError>;

    /// Display label of the entity. Callers treat failures as "no label".
    fn entity_label(&self, entity_id: Uuid) -> Result<String, OperationError>;

    fn get_identities(&self, entity_id: Uuid) -> Result<Vec<IdentityValue>, OperationError>;

    fn get_attributes(
        &self,
        entity_id: Uuid,
        group: &str,
    ) -> Result<Vec<Attribute>, OperationError>;

    fn get_groups(&self, entity_id: Uuid) -> Result<Vec<String>, OperationError>;

    fn get_credential_state(
        &self,
        entity_id: Uuid,
        credential: &str,
    ) -> Result<CredentialState, OperationError>;
}

/// The entity directory collaborator. `read` opens a consistent snapshot;
/// the core never caches directory content across requests.
pub trait EntityDirectory: Send + Sync {
    fn read(&self) -> Result<Box<dyn DirectoryReadTxn + '_>, OperationError>;
}

/// Source of configured translation profiles.
pub trait TranslationProfileStore: Send + Sync {
    fn get_profile(&self, name: &str) -> Result<TranslationProfile, ConfigError>;
}

/// The side effect boundary of translation: persisting mapped identities,
/// attributes and groups into the local store. A dry-run translation never
/// calls this.
pub trait TranslationPersistence: Send + Sync {
    fn apply(&self, result: &MappingResult) -> Result<(), OperationError>;
}

/// Opaque token storage keyed by a type tag and a series id. Contents are
/// serialized records owned by the caller. `delete` of an absent token is
/// not an error, and all operations must be safe to race.
pub trait TokenStore: Send + Sync {
    fn put(
        &self,
        token_type: &str,
        series_id: &str,
        contents: &[u8],
        expires: OffsetDateTime,
    ) -> Result<(), OperationError>;

    fn get(&self, token_type: &str, series_id: &str) -> Result<Option<Vec<u8>>, OperationError>;

    fn update(
        &self,
        token_type: &str,
        series_id: &str,
        contents: &[u8],
        expires: OffsetDateTime,
    ) -> Result<(), OperationError>;

    fn delete(&self, token_type: &str, series_id: &str) -> Result<(), OperationError>;

    fn list_by_type(
        &self,
        token_type: &str,
    ) -> Result<Vec<(String, Vec<u8>)>, OperationError>;
}

/// The external session manager. Always the owner of created sessions.
pub trait SessionStore: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    fn create_session(
        &self,
        entity_id: Uuid,
        realm: &AuthenticationRealm,
        label: &str,
        outdated_credential_id: Option<Uuid>,
        remember_me_info: RememberMeInfo,
        first_factor_option: &AuthenticationOptionKey,
        second_factor_option: Option<&AuthenticationOptionKey>,
    ) -> Result<LoginSession, OperationError>;
}

/// Sink for failed authentication signals. The lockout policy behind it is
/// external; the core only reports.
pub trait UnsuccessfulAccessCounter: Send + Sync {
    fn record_failure(&self, source_ip: &str);
}

/// The transport-level session of the current request. `reinitialize` must
/// replace the underlying session with a fresh one (session fixation
/// defence) before `bind` attaches a login session to it.
pub trait TransportSessions {
    fn reinitialize(&mut self) -> Result<(), OperationError>;

    fn bind(&mut self, session: &LoginSession);
}
