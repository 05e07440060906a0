//! The authentication flow state machine. A flow names the authenticators
//! usable as first and second factor and the policy deciding whether the
//! second factor is demanded. Verification itself happens in the
//! transport adapters; this engine only consumes their results.
//!
//! Progression is strictly first factor then second factor. A failed
//! first factor is terminal, the second factor is never consulted.

use crate::prelude::*;

use crate::idm::authenticator::AuthenticatorInstance;
use crate::idm::policy::{ExpressionCache, PolicyExpressionContext};
use crate::idm::translate::RemotelyAuthenticatedPrincipal;
use crate::idm::{AuthenticatedEntity, AuthenticationResult};
use crate::stores::EntityDirectory;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecondFactorPolicy {
    /// Single factor flow.
    Never,
    /// Second factor always demanded.
    Require,
    /// A boolean expression decides per entity. Evaluation failure of any
    /// kind demands the second factor, never skips it.
    DynamicExpression(String),
}

#[derive(Clone)]
pub struct AuthenticationFlow {
    pub name: String,
    pub first_factor: Vec<Arc<AuthenticatorInstance>>,
    pub second_factor: Vec<Arc<AuthenticatorInstance>>,
    pub policy: SecondFactorPolicy,
}

/// Pending state between a successful first factor and the outcome of the
/// second. Lives only for the duration of one authentication attempt.
#[derive(Debug, Clone)]
pub struct PartialAuthnState {
    pub primary: AuthenticatedEntity,
    pub remote_principal: Option<Box<RemotelyAuthenticatedPrincipal>>,
    pub first_factor_option: AuthenticationOptionKey,
    pub second_factor_required: bool,
    pub selected_second_factor: Option<Arc<AuthenticatorInstance>>,
}

/// A terminal non-success outcome of a flow step. Unknown remote
/// principals are not denials, callers route them to registration or
/// account association.
#[derive(Debug)]
pub enum AuthnStepFailure {
    UnknownRemotePrincipal(Box<RemotelyAuthenticatedPrincipal>),
    Rejected(AuthenticationError),
}

pub struct AuthenticationFlowEngine {
    directory: Arc<dyn EntityDirectory>,
    expressions: Arc<ExpressionCache>,
}

impl AuthenticationFlowEngine {
    pub fn new(directory: Arc<dyn EntityDirectory>, expressions: Arc<ExpressionCache>) -> Self {
        AuthenticationFlowEngine {
            directory,
            expressions,
        }
    }

    /// Consume the first factor's result. On success, decides whether a
    /// second factor is demanded and which authenticator instance will
    /// provide it.
    pub fn process_primary_authn_result(
        &self,
        result: AuthenticationResult,
        flow: &AuthenticationFlow,
        option_key: &AuthenticationOptionKey,
    ) -> Result<PartialAuthnState, AuthnStepFailure> {
        let (primary, remote_principal) = match result {
            AuthenticationResult::Success {
                authenticated_entity,
                remote_principal,
            } => (authenticated_entity, remote_principal),
            AuthenticationResult::Deny { cause } => {
                security_info!(flow = %flow.name, %cause, "first factor denied");
                return Err(AuthnStepFailure::Rejected(AuthenticationError::Denied(
                    cause,
                )));
            }
            AuthenticationResult::UnknownRemotePrincipal(principal) => {
                return Err(AuthnStepFailure::UnknownRemotePrincipal(principal));
            }
            AuthenticationResult::NotApplicable => {
                return Err(AuthnStepFailure::Rejected(AuthenticationError::Denied(
                    "authenticator not applicable".to_string(),
                )));
            }
        };

        let upstream = remote_principal
            .as_ref()
            .and_then(|principal| principal.protocol.as_ref());
        let second_factor_required =
            self.second_factor_required(&primary, flow, option_key, upstream);

        let selected_second_factor = if second_factor_required {
            let Some(instance) = self.select_second_factor(primary.entity_id, flow) else {
                security_info!(
                    flow = %flow.name,
                    entity_id = %primary.entity_id,
                    "second factor demanded but no usable authenticator"
                );
                return Err(AuthnStepFailure::Rejected(
                    AuthenticationError::SecondFactorUnavailable,
                ));
            };
            Some(instance)
        } else {
            None
        };

        Ok(PartialAuthnState {
            primary,
            remote_principal,
            first_factor_option: option_key.clone(),
            second_factor_required,
            selected_second_factor,
        })
    }

    fn second_factor_required(
        &self,
        primary: &AuthenticatedEntity,
        flow: &AuthenticationFlow,
        option_key: &AuthenticationOptionKey,
        upstream: Option<&RemoteProtocolMetadata>,
    ) -> bool {
        let expression = match &flow.policy {
            SecondFactorPolicy::Never => return false,
            SecondFactorPolicy::Require => return true,
            SecondFactorPolicy::DynamicExpression(expression) => expression,
        };

        // Fail closed. Whatever goes wrong here, the second factor stays
        // demanded.
        let txn = match self.directory.read() {
            Ok(txn) => txn,
            Err(e) => {
                security_error!(flow = %flow.name, err = %e, "policy context txn failed");
                return true;
            }
        };
        let context = match PolicyExpressionContext::build(
            txn.as_ref(),
            primary.entity_id,
            flow,
            option_key,
            upstream,
        ) {
            Ok(context) => context,
            Err(e) => {
                security_error!(flow = %flow.name, err = %e, "policy context build failed");
                return true;
            }
        };

        let mut scope = context.scope();
        match self.expressions.eval_bool(expression, &mut scope) {
            Ok(required) => {
                trace!(flow = %flow.name, required, "dynamic second factor policy evaluated");
                required
            }
            Err(e) => {
                security_error!(flow = %flow.name, err = %e, "dynamic policy evaluation failed");
                true
            }
        }
    }

    fn select_second_factor(
        &self,
        entity_id: Uuid,
        flow: &AuthenticationFlow,
    ) -> Option<Arc<AuthenticatorInstance>> {
        let txn = match self.directory.read() {
            Ok(txn) => txn,
            Err(e) => {
                admin_error!(flow = %flow.name, err = %e, "second factor selection txn failed");
                return None;
            }
        };
        for instance in &flow.second_factor {
            match instance.usable_by(entity_id, txn.as_ref()) {
                Ok(true) => return Some(instance.clone()),
                Ok(false) => {}
                Err(e) => {
                    admin_warn!(
                        authenticator = %instance.id,
                        err = %e,
                        "skipping second factor instance"
                    );
                }
            }
        }
        None
    }

    /// Terminate an attempt that needs no second factor, or whose second
    /// factor was skipped by a remember-me token.
    pub fn finalize_after_primary_authn(
        &self,
        state: PartialAuthnState,
        second_factor_skipped: bool,
    ) -> Result<AuthenticatedEntity, AuthnStepFailure> {
        if state.second_factor_required && !second_factor_skipped {
            return Err(AuthnStepFailure::Rejected(
                AuthenticationError::InvalidAuthState,
            ));
        }
        Ok(state.primary)
    }

    /// Consume the second factor's result and combine it with the pending
    /// first factor state. A failed second factor is terminal regardless
    /// of the first factor's success.
    pub fn process_secondary_authn_result(
        &self,
        state: PartialAuthnState,
        result: AuthenticationResult,
    ) -> Result<AuthenticatedEntity, AuthnStepFailure> {
        if !state.second_factor_required {
            return Err(AuthnStepFailure::Rejected(
                AuthenticationError::InvalidAuthState,
            ));
        }

        let secondary = match result {
            AuthenticationResult::Success {
                authenticated_entity,
                ..
            } => authenticated_entity,
            AuthenticationResult::Deny { cause } => {
                security_info!(entity_id = %state.primary.entity_id, %cause, "second factor denied");
                return Err(AuthnStepFailure::Rejected(AuthenticationError::Denied(
                    cause,
                )));
            }
            AuthenticationResult::UnknownRemotePrincipal(_)
            | AuthenticationResult::NotApplicable => {
                return Err(AuthnStepFailure::Rejected(
                    AuthenticationError::InvalidAuthState,
                ));
            }
        };

        if secondary.entity_id != state.primary.entity_id {
            security_error!(
                first = %state.primary.entity_id,
                second = %secondary.entity_id,
                "second factor verified a different entity"
            );
            return Err(AuthnStepFailure::Rejected(AuthenticationError::Denied(
                "second factor entity mismatch".to_string(),
            )));
        }

        let mut combined = state.primary;
        combined
            .authenticated_with
            .extend(secondary.authenticated_with);
        combined
            .authentication_methods
            .extend(secondary.authentication_methods);
        if combined.outdated_credential_id.is_none() {
            combined.outdated_credential_id = secondary.outdated_credential_id;
        }
        Ok(combined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{TestCredentialVerifier, TestDirectory, TestEntity};

    fn password_instance() -> Arc<AuthenticatorInstance> {
        Arc::new(AuthenticatorInstance::credential(
            "pwd",
            Arc::new(TestCredentialVerifier::new("password", "sys:password")),
        ))
    }

    fn totp_instance() -> Arc<AuthenticatorInstance> {
        Arc::new(AuthenticatorInstance::credential(
            "totp",
            Arc::new(TestCredentialVerifier::new("totp", "sys:totp")),
        ))
    }

    fn flow(policy: SecondFactorPolicy) -> AuthenticationFlow {
        AuthenticationFlow {
            name: "flow".to_string(),
            first_factor: vec![password_instance()],
            second_factor: vec![totp_instance()],
            policy,
        }
    }

    fn engine(directory: Arc<TestDirectory>) -> AuthenticationFlowEngine {
        AuthenticationFlowEngine::new(directory, Arc::new(ExpressionCache::default()))
    }

    fn success_for(entity_id: Uuid) -> AuthenticationResult {
        AuthenticationResult::Success {
            authenticated_entity: AuthenticatedEntity::local(entity_id, "password"),
            remote_principal: None,
        }
    }

    #[test]
    fn test_denied_first_factor_is_terminal() {
        sketching::test_init();
        let engine = engine(Arc::new(TestDirectory::new()));
        let result = engine.process_primary_authn_result(
            AuthenticationResult::Deny {
                cause: "bad password".to_string(),
            },
            &flow(SecondFactorPolicy::Require),
            &AuthenticationOptionKey::new("pwd"),
        );
        assert!(matches!(
            result,
            Err(AuthnStepFailure::Rejected(AuthenticationError::Denied(_)))
        ));
    }

    #[test]
    fn test_policy_never_completes_after_first_factor() {
        sketching::test_init();
        let directory = Arc::new(TestDirectory::new());
        let entity_id = directory.add_entity(TestEntity::enabled("User"));
        let engine = engine(directory);

        let state = engine
            .process_primary_authn_result(
                success_for(entity_id),
                &flow(SecondFactorPolicy::Never),
                &AuthenticationOptionKey::new("pwd"),
            )
            .expect("primary processing failed");
        assert!(!state.second_factor_required);
        assert!(state.selected_second_factor.is_none());

        let entity = engine
            .finalize_after_primary_authn(state, false)
            .expect("finalize failed");
        assert_eq!(entity.entity_id, entity_id);
    }

    #[test]
    fn test_require_selects_usable_second_factor() {
        sketching::test_init();
        let directory = Arc::new(TestDirectory::new());
        let entity_id = directory.add_entity(
            TestEntity::enabled("User").with_credential("sys:totp", CredentialState::Valid),
        );
        let engine = engine(directory);

        let state = engine
            .process_primary_authn_result(
                success_for(entity_id),
                &flow(SecondFactorPolicy::Require),
                &AuthenticationOptionKey::new("pwd"),
            )
            .expect("primary processing failed");
        assert!(state.second_factor_required);
        assert_eq!(
            state.selected_second_factor.as_ref().map(|i| i.id.as_str()),
            Some("totp")
        );

        // Demanding a second factor means the attempt cannot finalize yet.
        assert!(matches!(
            engine.finalize_after_primary_authn(state, false),
            Err(AuthnStepFailure::Rejected(
                AuthenticationError::InvalidAuthState
            ))
        ));
    }

    #[test]
    fn test_require_without_usable_instance_fails() {
        sketching::test_init();
        let directory = Arc::new(TestDirectory::new());
        // No totp credential enrolled.
        let entity_id = directory.add_entity(TestEntity::enabled("User"));
        let engine = engine(directory);

        let result = engine.process_primary_authn_result(
            success_for(entity_id),
            &flow(SecondFactorPolicy::Require),
            &AuthenticationOptionKey::new("pwd"),
        );
        assert!(matches!(
            result,
            Err(AuthnStepFailure::Rejected(
                AuthenticationError::SecondFactorUnavailable
            ))
        ));
    }

    #[test]
    fn test_dynamic_policy_false_skips_second_factor() {
        sketching::test_init();
        let directory = Arc::new(TestDirectory::new());
        let entity_id = directory.add_entity(
            TestEntity::enabled("User")
                .with_attribute(Attribute::new("department", "/", &["engineering"]))
                .with_credential("sys:totp", CredentialState::Valid),
        );
        let engine = engine(directory);

        let state = engine
            .process_primary_authn_result(
                success_for(entity_id),
                &flow(SecondFactorPolicy::DynamicExpression(
                    r#"attr["department"] == "finance""#.to_string(),
                )),
                &AuthenticationOptionKey::new("pwd"),
            )
            .expect("primary processing failed");
        assert!(!state.second_factor_required);
    }

    #[test]
    fn test_dynamic_policy_failure_is_fail_closed() {
        sketching::test_init();
        let directory = Arc::new(TestDirectory::new());
        let entity_id = directory.add_entity(
            TestEntity::enabled("User").with_credential("sys:totp", CredentialState::Valid),
        );
        let engine = engine(directory);

        // Parse error, runtime error and a non-boolean result all demand
        // the second factor.
        for expression in ["(((", "undefined_fn()", "40 + 2"] {
            let state = engine
                .process_primary_authn_result(
                    success_for(entity_id),
                    &flow(SecondFactorPolicy::DynamicExpression(
                        expression.to_string(),
                    )),
                    &AuthenticationOptionKey::new("pwd"),
                )
                .expect("primary processing failed");
            assert!(state.second_factor_required, "expression {:?}", expression);
        }
    }

    #[test]
    fn test_secondary_success_combines_methods() {
        sketching::test_init();
        let directory = Arc::new(TestDirectory::new());
        let entity_id = directory.add_entity(
            TestEntity::enabled("User").with_credential("sys:totp", CredentialState::Valid),
        );
        let engine = engine(directory);

        let state = engine
            .process_primary_authn_result(
                success_for(entity_id),
                &flow(SecondFactorPolicy::Require),
                &AuthenticationOptionKey::new("pwd"),
            )
            .expect("primary processing failed");

        let entity = engine
            .process_secondary_authn_result(
                state,
                AuthenticationResult::Success {
                    authenticated_entity: AuthenticatedEntity::local(entity_id, "totp"),
                    remote_principal: None,
                },
            )
            .expect("secondary processing failed");
        assert_eq!(
            entity.authentication_methods,
            vec!["password".to_string(), "totp".to_string()]
        );
    }

    #[test]
    fn test_secondary_entity_mismatch_is_denied() {
        sketching::test_init();
        let directory = Arc::new(TestDirectory::new());
        let entity_id = directory.add_entity(
            TestEntity::enabled("User").with_credential("sys:totp", CredentialState::Valid),
        );
        let other_id = directory.add_entity(
            TestEntity::enabled("Other").with_credential("sys:totp", CredentialState::Valid),
        );
        let engine = engine(directory);

        let state = engine
            .process_primary_authn_result(
                success_for(entity_id),
                &flow(SecondFactorPolicy::Require),
                &AuthenticationOptionKey::new("pwd"),
            )
            .expect("primary processing failed");

        let result = engine.process_secondary_authn_result(
            state,
            AuthenticationResult::Success {
                authenticated_entity: AuthenticatedEntity::local(other_id, "totp"),
                remote_principal: None,
            },
        );
        assert!(matches!(
            result,
            Err(AuthnStepFailure::Rejected(AuthenticationError::Denied(_)))
        ));
    }

    #[test]
    fn test_failed_second_factor_is_terminal() {
        sketching::test_init();
        let directory = Arc::new(TestDirectory::new());
        let entity_id = directory.add_entity(
            TestEntity::enabled("User").with_credential("sys:totp", CredentialState::Valid),
        );
        let engine = engine(directory);

        let state = engine
            .process_primary_authn_result(
                success_for(entity_id),
                &flow(SecondFactorPolicy::Require),
                &AuthenticationOptionKey::new("pwd"),
            )
            .expect("primary processing failed");

        let result = engine.process_secondary_authn_result(
            state,
            AuthenticationResult::Deny {
                cause: "bad code".to_string(),
            },
        );
        assert!(matches!(
            result,
            Err(AuthnStepFailure::Rejected(AuthenticationError::Denied(_)))
        ));
    }
}
