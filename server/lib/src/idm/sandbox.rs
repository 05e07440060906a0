//! Sandboxed flow processing for diagnosing authenticator behaviour,
//! typically a misbehaving remote IdP. The real verification logic runs,
//! its log output is captured and returned, and nothing is persisted.
//! Nothing escapes the sandbox boundary: a panicking verifier becomes a
//! failed result carrying the captured logs.

use std::panic::{catch_unwind, AssertUnwindSafe};

use sketching::LogCapture;

use crate::prelude::*;

use crate::idm::authflow::{AuthenticationFlow, AuthenticationFlowEngine, AuthnStepFailure, PartialAuthnState};
use crate::idm::translate::RemotelyAuthenticatedPrincipal;
use crate::idm::{AuthenticatedEntity, AuthenticationResult};

#[derive(Debug)]
pub enum SandboxOutcome {
    /// The flow completed; no session was created.
    Completed(AuthenticatedEntity),
    /// The first factor passed and a second factor would be demanded.
    SecondFactorRequired(Box<PartialAuthnState>),
    /// The remote principal has no local counterpart.
    UnknownRemotePrincipal(Box<RemotelyAuthenticatedPrincipal>),
    /// Verification was denied, errored or panicked.
    Failed(String),
}

/// What a sandboxed run produced, alongside everything the verification
/// logged while it ran.
#[derive(Debug)]
pub struct SandboxedAuthnResult {
    pub outcome: SandboxOutcome,
    pub logs: Vec<String>,
}

impl AuthenticationFlowEngine {
    /// Run a primary verification and process its result, capturing logs
    /// and suppressing persistence.
    pub fn sandbox_primary_authn<F>(
        &self,
        verify: F,
        flow: &AuthenticationFlow,
        option_key: &AuthenticationOptionKey,
    ) -> SandboxedAuthnResult
    where
        F: FnOnce() -> Result<AuthenticationResult, AuthenticationError>,
    {
        let capture = LogCapture::new();
        let outcome = capture.scoped(|| {
            let result = match catch_unwind(AssertUnwindSafe(verify)) {
                Err(_) => {
                    return SandboxOutcome::Failed("verifier panicked".to_string());
                }
                Ok(Err(e)) => return SandboxOutcome::Failed(e.to_string()),
                Ok(Ok(result)) => result,
            };
            match self.process_primary_authn_result(result, flow, option_key) {
                Ok(state) if state.second_factor_required => {
                    SandboxOutcome::SecondFactorRequired(Box::new(state))
                }
                Ok(state) => SandboxOutcome::Completed(state.primary),
                Err(AuthnStepFailure::UnknownRemotePrincipal(principal)) => {
                    SandboxOutcome::UnknownRemotePrincipal(principal)
                }
                Err(AuthnStepFailure::Rejected(e)) => SandboxOutcome::Failed(e.to_string()),
            }
        });
        SandboxedAuthnResult {
            outcome,
            logs: capture.lines(),
        }
    }

    /// Sandboxed counterpart of second factor processing.
    pub fn sandbox_secondary_authn<F>(
        &self,
        state: PartialAuthnState,
        verify: F,
    ) -> SandboxedAuthnResult
    where
        F: FnOnce() -> Result<AuthenticationResult, AuthenticationError>,
    {
        let capture = LogCapture::new();
        let outcome = capture.scoped(|| {
            let result = match catch_unwind(AssertUnwindSafe(verify)) {
                Err(_) => {
                    return SandboxOutcome::Failed("verifier panicked".to_string());
                }
                Ok(Err(e)) => return SandboxOutcome::Failed(e.to_string()),
                Ok(Ok(result)) => result,
            };
            match self.process_secondary_authn_result(state, result) {
                Ok(entity) => SandboxOutcome::Completed(entity),
                Err(AuthnStepFailure::Rejected(e)) => SandboxOutcome::Failed(e.to_string()),
                Err(AuthnStepFailure::UnknownRemotePrincipal(principal)) => {
                    SandboxOutcome::UnknownRemotePrincipal(principal)
                }
            }
        });
        SandboxedAuthnResult {
            outcome,
            logs: capture.lines(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idm::authflow::SecondFactorPolicy;
    use crate::idm::authenticator::AuthenticatorInstance;
    use crate::idm::policy::ExpressionCache;
    use crate::testkit::{TestCredentialVerifier, TestDirectory, TestEntity};

    fn engine(directory: Arc<TestDirectory>) -> AuthenticationFlowEngine {
        AuthenticationFlowEngine::new(directory, Arc::new(ExpressionCache::default()))
    }

    fn single_factor_flow() -> AuthenticationFlow {
        AuthenticationFlow {
            name: "flow".to_string(),
            first_factor: vec![Arc::new(AuthenticatorInstance::credential(
                "pwd",
                Arc::new(TestCredentialVerifier::new("password", "sys:password")),
            ))],
            second_factor: Vec::with_capacity(0),
            policy: SecondFactorPolicy::Never,
        }
    }

    #[test]
    fn test_sandbox_captures_verifier_logs() {
        sketching::test_init();
        let directory = Arc::new(TestDirectory::new());
        let entity_id = directory.add_entity(TestEntity::enabled("User"));
        let engine = engine(directory);

        let result = engine.sandbox_primary_authn(
            || {
                info!(target_entity = %entity_id, "checking assertion signature");
                Ok(AuthenticationResult::Success {
                    authenticated_entity: AuthenticatedEntity::local(entity_id, "password"),
                    remote_principal: None,
                })
            },
            &single_factor_flow(),
            &AuthenticationOptionKey::new("pwd"),
        );
        assert!(matches!(result.outcome, SandboxOutcome::Completed(_)));
        assert!(result
            .logs
            .iter()
            .any(|line| line.contains("checking assertion signature")));
    }

    #[test]
    fn test_sandbox_contains_panics() {
        sketching::test_init();
        let directory = Arc::new(TestDirectory::new());
        let engine = engine(directory);

        let result = engine.sandbox_primary_authn(
            || {
                warn!("assertion has no subject");
                panic!("verifier exploded");
            },
            &single_factor_flow(),
            &AuthenticationOptionKey::new("pwd"),
        );
        match result.outcome {
            SandboxOutcome::Failed(cause) => assert!(cause.contains("panicked")),
            other => panic!("expected failure, got {:?}", other),
        }
        assert!(result
            .logs
            .iter()
            .any(|line| line.contains("assertion has no subject")));
    }

    #[test]
    fn test_sandbox_denial_carries_logs() {
        sketching::test_init();
        let directory = Arc::new(TestDirectory::new());
        let engine = engine(directory);

        let result = engine.sandbox_primary_authn(
            || {
                error!("signature mismatch");
                Ok(AuthenticationResult::Deny {
                    cause: "signature mismatch".to_string(),
                })
            },
            &single_factor_flow(),
            &AuthenticationOptionKey::new("pwd"),
        );
        assert!(matches!(result.outcome, SandboxOutcome::Failed(_)));
        assert!(result
            .logs
            .iter()
            .any(|line| line.contains("signature mismatch")));
    }

    #[test]
    fn test_sandbox_secondary_contains_panics() {
        sketching::test_init();
        let directory = Arc::new(TestDirectory::new());
        let entity_id = directory.add_entity(
            TestEntity::enabled("User").with_credential("sys:totp", CredentialState::Valid),
        );
        let engine = engine(directory);

        let flow = AuthenticationFlow {
            name: "flow".to_string(),
            first_factor: vec![Arc::new(AuthenticatorInstance::credential(
                "pwd",
                Arc::new(TestCredentialVerifier::new("password", "sys:password")),
            ))],
            second_factor: vec![Arc::new(AuthenticatorInstance::credential(
                "totp",
                Arc::new(TestCredentialVerifier::new("totp", "sys:totp")),
            ))],
            policy: SecondFactorPolicy::Require,
        };
        let state = engine
            .process_primary_authn_result(
                AuthenticationResult::Success {
                    authenticated_entity: AuthenticatedEntity::local(entity_id, "password"),
                    remote_principal: None,
                },
                &flow,
                &AuthenticationOptionKey::new("pwd"),
            )
            .expect("primary processing failed");

        let result = engine.sandbox_secondary_authn(state, || {
            warn!("totp device clock skewed");
            panic!("verifier exploded");
        });
        match result.outcome {
            SandboxOutcome::Failed(cause) => assert!(cause.contains("panicked")),
            other => panic!("expected failure, got {:?}", other),
        }
        assert!(result
            .logs
            .iter()
            .any(|line| line.contains("totp device clock skewed")));
    }

    #[test]
    fn test_sandbox_verifier_error_is_typed_failure() {
        sketching::test_init();
        let directory = Arc::new(TestDirectory::new());
        let engine = engine(directory);

        let result = engine.sandbox_primary_authn(
            || Err(AuthenticationError::InvalidAuthState),
            &single_factor_flow(),
            &AuthenticationOptionKey::new("pwd"),
        );
        assert!(matches!(result.outcome, SandboxOutcome::Failed(_)));
    }
}
