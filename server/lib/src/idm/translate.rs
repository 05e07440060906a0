//! Translation of remote authentication assertions into local entity terms.
//!
//! A translation profile is an ordered list of rules. Each rule has a
//! boolean condition and an action, both rhai expressions evaluated over
//! the raw remote input. Running a profile yields a [`MappingResult`],
//! which is then resolved against the entity directory to find the single
//! local entity the remote principal corresponds to, if any.

use crate::prelude::*;

use rhai::{Array, Dynamic, Map, Scope};

use crate::idm::policy::ExpressionCache;
use crate::idm::{AuthenticatedEntity, AuthenticationResult};
use crate::stores::{EntityDirectory, TranslationPersistence, TranslationProfileStore};

/// How a mapped identity participates in local entity resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityEffectMode {
    /// The identity must resolve to an existing local entity. Translation
    /// fails if it does not.
    RequireMatch,
    /// Resolve to an existing entity if one owns the identity, otherwise
    /// persistence may create it.
    MatchOrCreate,
    /// The identity is attached to whatever entity the other rules
    /// resolve; it never drives resolution itself.
    Add,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedIdentity {
    pub identity: IdentityValue,
    pub effect: IdentityEffectMode,
}

/// The output of running a profile's rules, before entity resolution.
#[derive(Debug, Clone, Default)]
pub struct MappingResult {
    pub identities: Vec<MappedIdentity>,
    pub attributes: Vec<Attribute>,
    pub groups: Vec<String>,
    pub authenticated_with: Vec<String>,
    pub mapped_to_existing_entity: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranslationAction {
    MapIdentity {
        identity_type: String,
        expression: String,
        effect: IdentityEffectMode,
    },
    MapAttribute {
        name: String,
        group: String,
        expression: String,
    },
    MapGroup {
        expression: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslationRule {
    pub condition: String,
    pub action: TranslationAction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslationProfile {
    pub name: String,
    pub rules: Vec<TranslationRule>,
}

/// Raw, already-decoded data from a remote identity provider, as handed
/// over by a protocol adapter.
#[derive(Debug, Clone, Default)]
pub struct RemotelyAuthenticatedInput {
    pub idp_name: String,
    pub identities: Vec<IdentityValue>,
    pub attributes: Vec<Attribute>,
    pub groups: Vec<String>,
    pub session_participants: Vec<String>,
    pub protocol: Option<RemoteProtocolMetadata>,
}

/// The fully translated view of a remote principal. Carries everything
/// needed to either continue authentication against the resolved local
/// entity, or to drive registration / account association when no local
/// entity was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotelyAuthenticatedPrincipal {
    pub idp_name: String,
    pub profile_name: String,
    pub identities: Vec<MappedIdentity>,
    pub attributes: Vec<Attribute>,
    pub groups: Vec<String>,
    pub local_mapped_principal: Option<Uuid>,
    pub authenticated_with: Vec<String>,
    pub session_participants: Vec<String>,
    pub protocol: Option<RemoteProtocolMetadata>,
    pub created_at: OffsetDateTime,
}

#[derive(Clone, Copy)]
enum ResolvedEntity {
    None,
    One(Uuid),
    Ambiguous(Uuid, Uuid),
}

pub struct RemoteIdentityTranslator {
    profiles: Arc<dyn TranslationProfileStore>,
    directory: Arc<dyn EntityDirectory>,
    persistence: Arc<dyn TranslationPersistence>,
    expressions: Arc<ExpressionCache>,
}

impl RemoteIdentityTranslator {
    pub fn new(
        profiles: Arc<dyn TranslationProfileStore>,
        directory: Arc<dyn EntityDirectory>,
        persistence: Arc<dyn TranslationPersistence>,
        expressions: Arc<ExpressionCache>,
    ) -> Self {
        RemoteIdentityTranslator {
            profiles,
            directory,
            persistence,
            expressions,
        }
    }

    /// Apply the named profile to `input`. With `dry_run` the mapping and
    /// resolution behave identically, only persistence is skipped. A
    /// `preset` identity is injected as a require-match entry, so
    /// translation fails unless the directory confirms it.
    pub fn translate(
        &self,
        input: &RemotelyAuthenticatedInput,
        profile_name: &str,
        dry_run: bool,
        preset: Option<IdentityValue>,
    ) -> Result<RemotelyAuthenticatedPrincipal, IdmError> {
        let profile = self.profiles.get_profile(profile_name)?;
        trace!(profile = %profile.name, idp = %input.idp_name, dry_run, "running translation profile");

        let mut result = self.run_rules(&profile, input)?;

        if let Some(identity) = preset {
            result.identities.insert(
                0,
                MappedIdentity {
                    identity,
                    effect: IdentityEffectMode::RequireMatch,
                },
            );
        }

        self.resolve(&mut result)?;

        if !dry_run {
            self.persistence.apply(&result)?;
        }

        Ok(RemotelyAuthenticatedPrincipal {
            idp_name: input.idp_name.clone(),
            profile_name: profile.name,
            identities: result.identities,
            attributes: result.attributes,
            groups: result.groups,
            local_mapped_principal: result.mapped_to_existing_entity,
            authenticated_with: result.authenticated_with,
            session_participants: input.session_participants.clone(),
            protocol: input.protocol.clone(),
            created_at: OffsetDateTime::now_utc(),
        })
    }

    fn run_rules(
        &self,
        profile: &TranslationProfile,
        input: &RemotelyAuthenticatedInput,
    ) -> Result<MappingResult, IdmError> {
        let template = input_scope(input);
        let mut result = MappingResult::default();

        for (idx, rule) in profile.rules.iter().enumerate() {
            let mut scope = template.clone();
            let matched = self
                .expressions
                .eval_bool(&rule.condition, &mut scope)
                .map_err(|e| {
                    security_error!(
                        profile = %profile.name,
                        rule = idx,
                        err = %e,
                        "translation rule condition failed to evaluate"
                    );
                    e
                })?;
            if !matched {
                continue;
            }

            match &rule.action {
                TranslationAction::MapIdentity {
                    identity_type,
                    expression,
                    effect,
                } => {
                    let mut scope = template.clone();
                    let value = self.expressions.eval_value(expression, &mut scope)?;
                    let value = value.to_string();
                    if value.is_empty() {
                        trace!(rule = idx, "identity expression yielded nothing, skipping");
                        continue;
                    }
                    result.identities.push(MappedIdentity {
                        identity: IdentityValue::new(identity_type, &value),
                        effect: *effect,
                    });
                }
                TranslationAction::MapAttribute {
                    name,
                    group,
                    expression,
                } => {
                    let mut scope = template.clone();
                    let value = self.expressions.eval_value(expression, &mut scope)?;
                    let values = dynamic_to_values(value);
                    if values.is_empty() {
                        continue;
                    }
                    result.attributes.push(Attribute {
                        name: name.clone(),
                        group: group.clone(),
                        values,
                    });
                }
                TranslationAction::MapGroup { expression } => {
                    let mut scope = template.clone();
                    let value = self.expressions.eval_value(expression, &mut scope)?;
                    for group in dynamic_to_values(value) {
                        result.groups.push(group);
                    }
                }
            }
        }

        Ok(result)
    }

    /// Resolve the mapped identities to at most one local entity. Two
    /// identities owned by two distinct entities is a hard failure, never
    /// a silent pick.
    fn resolve(&self, result: &mut MappingResult) -> Result<(), IdmError> {
        let txn = self.directory.read()?;
        let mut resolved = ResolvedEntity::None;

        for mapped in &result.identities {
            if mapped.effect == IdentityEffectMode::Add {
                continue;
            }
            let candidate_types = [mapped.identity.id_type.as_str()];
            match txn.resolve_identity(&mapped.identity.value, &candidate_types) {
                Ok(entity_id) => {
                    resolved = match resolved {
                        ResolvedEntity::None => ResolvedEntity::One(entity_id),
                        ResolvedEntity::One(prev) if prev == entity_id => {
                            ResolvedEntity::One(prev)
                        }
                        ResolvedEntity::One(prev) => ResolvedEntity::Ambiguous(prev, entity_id),
                        ambiguous => ambiguous,
                    };
                    if let ResolvedEntity::Ambiguous(a, b) = resolved {
                        security_error!(
                            first = %a,
                            second = %b,
                            "mapped identities resolve to distinct entities"
                        );
                        return Err(AuthenticationError::AmbiguousMapping(a, b).into());
                    }
                    result
                        .authenticated_with
                        .push(mapped.identity.to_string());
                }
                Err(OperationError::NoMatchingEntries) => {
                    if mapped.effect == IdentityEffectMode::RequireMatch {
                        security_info!(
                            identity = %mapped.identity,
                            "require-match identity has no local entity"
                        );
                        return Err(AuthenticationError::RequiredMatchFailed.into());
                    }
                    trace!(identity = %mapped.identity, "identity not present locally");
                }
                Err(e) => return Err(e.into()),
            }
        }

        if let ResolvedEntity::One(entity_id) = resolved {
            result.mapped_to_existing_entity = Some(entity_id);
        } else {
            result.authenticated_with.clear();
        }
        Ok(())
    }

    /// Turn a translated principal into an authentication result. An
    /// unresolved principal is an expected outcome for registration or
    /// account association flows, not an error.
    pub fn assemble_authentication_result(
        &self,
        principal: RemotelyAuthenticatedPrincipal,
    ) -> Result<AuthenticationResult, IdmError> {
        if principal.identities.is_empty() {
            security_info!(idp = %principal.idp_name, "translation mapped no identities");
            return Err(AuthenticationError::NoMappedIdentities.into());
        }

        let Some(entity_id) = principal.local_mapped_principal else {
            return Ok(AuthenticationResult::UnknownRemotePrincipal(Box::new(
                principal,
            )));
        };

        let txn = self.directory.read()?;
        if !txn.is_enabled(entity_id)? {
            security_info!(%entity_id, "remote login for disabled entity");
            return Err(AuthenticationError::DisabledAccount.into());
        }

        let authenticated_entity = AuthenticatedEntity {
            entity_id,
            authenticated_with: principal.authenticated_with.clone(),
            authentication_methods: vec![format!("remote:{}", principal.idp_name)],
            outdated_credential_id: None,
            remote_idp: Some(principal.idp_name.clone()),
        };

        Ok(AuthenticationResult::Success {
            authenticated_entity,
            remote_principal: Some(Box::new(principal)),
        })
    }
}

/// The evaluation scope of translation rules: the raw remote input keyed
/// the way rule authors address it.
fn input_scope(input: &RemotelyAuthenticatedInput) -> Scope<'static> {
    let mut scope = Scope::new();

    scope.push_constant("idp", input.idp_name.clone());

    let mut attr = Map::new();
    let mut attrs = Map::new();
    for attribute in &input.attributes {
        let scalar = attribute.values.first().cloned().unwrap_or_default();
        attr.insert(attribute.name.as_str().into(), Dynamic::from(scalar));
        let values: Array = attribute
            .values
            .iter()
            .map(|v| Dynamic::from(v.clone()))
            .collect();
        attrs.insert(attribute.name.as_str().into(), Dynamic::from(values));
    }
    scope.push_constant("attr", attr);
    scope.push_constant("attrs", attrs);

    let primary = input.identities.first();
    scope.push_constant(
        "id",
        primary.map(|i| i.value.clone()).unwrap_or_default(),
    );
    scope.push_constant(
        "id_type",
        primary.map(|i| i.id_type.clone()).unwrap_or_default(),
    );

    let mut ids_by_type = Map::new();
    for identity in &input.identities {
        let values = ids_by_type
            .entry(identity.id_type.as_str().into())
            .or_insert_with(|| Dynamic::from(Array::new()));
        if let Some(mut array) = values.write_lock::<Array>() {
            array.push(Dynamic::from(identity.value.clone()));
        }
    }
    scope.push_constant("ids_by_type", ids_by_type);

    let groups: Array = input
        .groups
        .iter()
        .map(|g| Dynamic::from(g.clone()))
        .collect();
    scope.push_constant("groups", groups);

    scope
}

fn dynamic_to_values(value: Dynamic) -> Vec<String> {
    if value.is_unit() {
        return Vec::with_capacity(0);
    }
    if value.is_array() {
        return value
            .cast::<Array>()
            .into_iter()
            .map(|v| v.to_string())
            .filter(|v| !v.is_empty())
            .collect();
    }
    let single = value.to_string();
    if single.is_empty() {
        Vec::with_capacity(0)
    } else {
        vec![single]
    }
}
