//! In-memory collaborator implementations for tests. These back the store
//! traits with mutex-guarded maps and record enough call history for
//! assertions. Available to dependent crates through the `test` feature.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use hashbrown::HashMap;

use crate::idm::authenticator::CredentialVerifier;
use crate::idm::translate::{MappingResult, TranslationProfile};
use crate::prelude::*;
use crate::stores::{
    DirectoryReadTxn, EntityDirectory, SessionStore, TokenStore, TranslationPersistence,
    TranslationProfileStore, TransportSessions, UnsuccessfulAccessCounter,
};

pub struct TestCredentialVerifier {
    method: String,
    credential_name: String,
}

impl TestCredentialVerifier {
    pub fn new(method: &str, credential_name: &str) -> Self {
        TestCredentialVerifier {
            method: method.to_string(),
            credential_name: credential_name.to_string(),
        }
    }
}

impl CredentialVerifier for TestCredentialVerifier {
    fn method(&self) -> &str {
        &self.method
    }

    fn credential_name(&self) -> &str {
        &self.credential_name
    }
}

/// One directory entity, built up with chained setters.
#[derive(Debug, Clone)]
pub struct TestEntity {
    pub label: String,
    pub enabled: bool,
    pub identities: Vec<IdentityValue>,
    pub attributes: Vec<Attribute>,
    pub groups: Vec<String>,
    pub credentials: HashMap<String, CredentialState>,
}

impl TestEntity {
    pub fn enabled(label: &str) -> Self {
        TestEntity {
            label: label.to_string(),
            enabled: true,
            identities: Vec::new(),
            attributes: Vec::new(),
            groups: Vec::new(),
            credentials: HashMap::new(),
        }
    }

    pub fn disabled(label: &str) -> Self {
        let mut entity = Self::enabled(label);
        entity.enabled = false;
        entity
    }

    pub fn with_identity(mut self, identity: IdentityValue) -> Self {
        self.identities.push(identity);
        self
    }

    pub fn with_attribute(mut self, attribute: Attribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn with_group(mut self, group: &str) -> Self {
        self.groups.push(group.to_string());
        self
    }

    pub fn with_credential(mut self, name: &str, state: CredentialState) -> Self {
        self.credentials.insert(name.to_string(), state);
        self
    }
}

/// An in-memory entity directory. `read` clones the current state, so a
/// transaction observes a consistent snapshot regardless of later writes.
#[derive(Default)]
pub struct TestDirectory {
    entities: Mutex<HashMap<Uuid, TestEntity>>,
}

impl TestDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_entity(&self, entity: TestEntity) -> Uuid {
        let entity_id = Uuid::new_v4();
        if let Ok(mut entities) = self.entities.lock() {
            entities.insert(entity_id, entity);
        }
        entity_id
    }
}

impl EntityDirectory for TestDirectory {
    fn read(&self) -> Result<Box<dyn DirectoryReadTxn + '_>, OperationError> {
        let entities = self
            .entities
            .lock()
            .map_err(|_| OperationError::Backend)?
            .clone();
        Ok(Box::new(TestDirectoryTxn { entities }))
    }
}

pub struct TestDirectoryTxn {
    entities: HashMap<Uuid, TestEntity>,
}

impl TestDirectoryTxn {
    fn entity(&self, entity_id: Uuid) -> Result<&TestEntity, OperationError> {
        self.entities
            .get(&entity_id)
            .ok_or(OperationError::NoMatchingEntries)
    }
}

impl DirectoryReadTxn for TestDirectoryTxn {
    fn resolve_identity(
        &self,
        value: &str,
        candidate_types: &[&str],
    ) -> Result<Uuid, OperationError> {
        self.entities
            .iter()
            .find(|(_, entity)| {
                entity.identities.iter().any(|identity| {
                    identity.value == value
                        && candidate_types.contains(&identity.id_type.as_str())
                })
            })
            .map(|(entity_id, _)| *entity_id)
            .ok_or(OperationError::NoMatchingEntries)
    }

    fn is_enabled(&self, entity_id: Uuid) -> Result<bool, OperationError> {
        self.entity(entity_id).map(|entity| entity.enabled)
    }

    fn entity_label(&self, entity_id: Uuid) -> Result<String, OperationError> {
        self.entity(entity_id).map(|entity| entity.label.clone())
    }

    fn get_identities(&self, entity_id: Uuid) -> Result<Vec<IdentityValue>, OperationError> {
        self.entity(entity_id).map(|entity| entity.identities.clone())
    }

    fn get_attributes(
        &self,
        entity_id: Uuid,
        group: &str,
    ) -> Result<Vec<Attribute>, OperationError> {
        self.entity(entity_id).map(|entity| {
            entity
                .attributes
                .iter()
                .filter(|attribute| attribute.group == group)
                .cloned()
                .collect()
        })
    }

    fn get_groups(&self, entity_id: Uuid) -> Result<Vec<String>, OperationError> {
        self.entity(entity_id).map(|entity| entity.groups.clone())
    }

    fn get_credential_state(
        &self,
        entity_id: Uuid,
        credential: &str,
    ) -> Result<CredentialState, OperationError> {
        self.entity(entity_id).map(|entity| {
            entity
                .credentials
                .get(credential)
                .copied()
                .unwrap_or(CredentialState::Disabled)
        })
    }
}

/// In-memory token storage. Tracks how often `get` was called so tests can
/// assert that some paths never reach storage.
#[derive(Default)]
pub struct TestTokenStore {
    tokens: Mutex<HashMap<(String, String), (Vec<u8>, OffsetDateTime)>>,
    reads: AtomicUsize,
}

impl TestTokenStore {
    pub fn count(&self, token_type: &str) -> usize {
        self.tokens
            .lock()
            .map(|tokens| {
                tokens
                    .keys()
                    .filter(|(stored_type, _)| stored_type == token_type)
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }
}

impl TokenStore for TestTokenStore {
    fn put(
        &self,
        token_type: &str,
        series_id: &str,
        contents: &[u8],
        expires: OffsetDateTime,
    ) -> Result<(), OperationError> {
        let mut tokens = self.tokens.lock().map_err(|_| OperationError::Backend)?;
        tokens.insert(
            (token_type.to_string(), series_id.to_string()),
            (contents.to_vec(), expires),
        );
        Ok(())
    }

    fn get(
        &self,
        token_type: &str,
        series_id: &str,
    ) -> Result<Option<Vec<u8>>, OperationError> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let tokens = self.tokens.lock().map_err(|_| OperationError::Backend)?;
        Ok(tokens
            .get(&(token_type.to_string(), series_id.to_string()))
            .map(|(contents, _)| contents.clone()))
    }

    fn update(
        &self,
        token_type: &str,
        series_id: &str,
        contents: &[u8],
        expires: OffsetDateTime,
    ) -> Result<(), OperationError> {
        let mut tokens = self.tokens.lock().map_err(|_| OperationError::Backend)?;
        let key = (token_type.to_string(), series_id.to_string());
        if !tokens.contains_key(&key) {
            return Err(OperationError::NoMatchingEntries);
        }
        tokens.insert(key, (contents.to_vec(), expires));
        Ok(())
    }

    fn delete(&self, token_type: &str, series_id: &str) -> Result<(), OperationError> {
        let mut tokens = self.tokens.lock().map_err(|_| OperationError::Backend)?;
        tokens.remove(&(token_type.to_string(), series_id.to_string()));
        Ok(())
    }

    fn list_by_type(
        &self,
        token_type: &str,
    ) -> Result<Vec<(String, Vec<u8>)>, OperationError> {
        let tokens = self.tokens.lock().map_err(|_| OperationError::Backend)?;
        Ok(tokens
            .iter()
            .filter(|((stored_type, _), _)| stored_type == token_type)
            .map(|((_, series_id), (contents, _))| (series_id.clone(), contents.clone()))
            .collect())
    }
}

#[derive(Default)]
pub struct TestSessionStore {
    sessions: Mutex<Vec<LoginSession>>,
}

impl TestSessionStore {
    pub fn created(&self) -> usize {
        self.sessions.lock().map(|sessions| sessions.len()).unwrap_or(0)
    }
}

impl SessionStore for TestSessionStore {
    fn create_session(
        &self,
        entity_id: Uuid,
        realm: &AuthenticationRealm,
        label: &str,
        outdated_credential_id: Option<Uuid>,
        remember_me_info: RememberMeInfo,
        first_factor_option: &AuthenticationOptionKey,
        second_factor_option: Option<&AuthenticationOptionKey>,
    ) -> Result<LoginSession, OperationError> {
        let session = LoginSession {
            id: Uuid::new_v4(),
            entity_id,
            realm: realm.name.clone(),
            label: label.to_string(),
            started: OffsetDateTime::now_utc(),
            expires: None,
            remember_me_info,
            first_factor_option: first_factor_option.clone(),
            second_factor_option: second_factor_option.cloned(),
            outdated_credential_id,
            authenticated_identities: Vec::new(),
            remote_idp: None,
        };
        let mut sessions = self.sessions.lock().map_err(|_| OperationError::Backend)?;
        sessions.push(session.clone());
        Ok(session)
    }
}

#[derive(Default)]
pub struct TestAccessCounter {
    failures: Mutex<HashMap<String, usize>>,
}

impl TestAccessCounter {
    pub fn count_for(&self, source_ip: &str) -> usize {
        self.failures
            .lock()
            .map(|failures| failures.get(source_ip).copied().unwrap_or(0))
            .unwrap_or(0)
    }
}

impl UnsuccessfulAccessCounter for TestAccessCounter {
    fn record_failure(&self, source_ip: &str) {
        if let Ok(mut failures) = self.failures.lock() {
            *failures.entry(source_ip.to_string()).or_insert(0) += 1;
        }
    }
}

/// A transport session that records the call order of `reinitialize` and
/// `bind`.
#[derive(Default)]
pub struct TestTransport {
    reinitializations: usize,
    bound: Vec<LoginSession>,
    reinitialized_before_bind: bool,
}

impl TestTransport {
    pub fn reinitializations(&self) -> usize {
        self.reinitializations
    }

    pub fn bound_sessions(&self) -> usize {
        self.bound.len()
    }

    pub fn reinitialized_before_bind(&self) -> bool {
        self.reinitialized_before_bind
    }
}

impl TransportSessions for TestTransport {
    fn reinitialize(&mut self) -> Result<(), OperationError> {
        self.reinitializations += 1;
        Ok(())
    }

    fn bind(&mut self, session: &LoginSession) {
        if self.bound.is_empty() {
            self.reinitialized_before_bind = self.reinitializations > 0;
        }
        self.bound.push(session.clone());
    }
}

#[derive(Default)]
pub struct TestProfileStore {
    profiles: HashMap<String, TranslationProfile>,
}

impl TestProfileStore {
    pub fn with_profile(profile: TranslationProfile) -> Self {
        let mut profiles = HashMap::new();
        profiles.insert(profile.name.clone(), profile);
        TestProfileStore { profiles }
    }
}

impl TranslationProfileStore for TestProfileStore {
    fn get_profile(&self, name: &str) -> Result<TranslationProfile, ConfigError> {
        self.profiles
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::MissingTranslationProfile(name.to_string()))
    }
}

/// Records applied mapping results instead of writing anywhere.
#[derive(Default)]
pub struct TestPersistence {
    applied: Mutex<Vec<MappingResult>>,
}

impl TestPersistence {
    pub fn applied(&self) -> usize {
        self.applied.lock().map(|applied| applied.len()).unwrap_or(0)
    }
}

impl TranslationPersistence for TestPersistence {
    fn apply(&self, result: &MappingResult) -> Result<(), OperationError> {
        let mut applied = self.applied.lock().map_err(|_| OperationError::Backend)?;
        applied.push(result.clone());
        Ok(())
    }
}
