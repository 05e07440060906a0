//! Materialisation of a finished authentication into a login session, and
//! its attachment to the transport-level session of the request.
//!
//! The realm of the invocation context is compared against the realm the
//! session is created for. On mismatch the session is still created, for
//! programmatic use by the caller, but never attached to the transport -
//! a session minted under one realm must not leak into a request scoped
//! to another.

use crate::prelude::*;

use crate::idm::remember::RememberMeTokenService;
use crate::idm::{AuthenticatedEntity, InvocationContext};
use crate::stores::{EntityDirectory, SessionStore, TransportSessions};

/// A created session plus the cookie instructions the transport must
/// apply.
#[derive(Debug)]
pub struct BoundSession {
    pub session: LoginSession,
    pub cookies: Vec<CookieCommand>,
}

pub struct SessionBinder {
    sessions: Arc<dyn SessionStore>,
    directory: Arc<dyn EntityDirectory>,
    remember_me: Arc<RememberMeTokenService>,
}

impl SessionBinder {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        directory: Arc<dyn EntityDirectory>,
        remember_me: Arc<RememberMeTokenService>,
    ) -> Self {
        SessionBinder {
            sessions,
            directory,
            remember_me,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn bind(
        &self,
        entity: &AuthenticatedEntity,
        first_factor_option: &AuthenticationOptionKey,
        second_factor_option: Option<&AuthenticationOptionKey>,
        realm: &AuthenticationRealm,
        machine: &LoginMachineDetails,
        remember_me_requested: bool,
        remember_me_info: RememberMeInfo,
        ctx: &InvocationContext,
        transport: &mut dyn TransportSessions,
        now: OffsetDateTime,
    ) -> Result<BoundSession, OperationError> {
        // Label lookup is best effort, a session without one is fine.
        let label = match self.directory.read() {
            Ok(txn) => txn.entity_label(entity.entity_id).unwrap_or_default(),
            Err(e) => {
                admin_warn!(err = %e, "label lookup failed, session gets none");
                String::new()
            }
        };

        let mut session = self.sessions.create_session(
            entity.entity_id,
            realm,
            &label,
            entity.outdated_credential_id,
            remember_me_info,
            first_factor_option,
            second_factor_option,
        )?;
        session.authenticated_identities = entity.authenticated_with.clone();
        session.remote_idp = entity.remote_idp.clone();

        if ctx.realm_name.as_deref() == Some(realm.name.as_str()) {
            // Fresh transport session before binding, so a session id
            // fixed before authentication never survives it.
            transport.reinitialize()?;
            transport.bind(&session);
            security_access!(
                entity_id = %entity.entity_id,
                realm = %realm.name,
                session_id = %session.id,
                "session bound"
            );
        } else {
            security_info!(
                entity_id = %entity.entity_id,
                session_realm = %realm.name,
                context_realm = ?ctx.realm_name,
                "session created outside its invocation realm, not binding to transport"
            );
        }

        let mut cookies = Vec::with_capacity(1);
        if remember_me_requested {
            if let Some(cookie) = self.remember_me.issue(
                realm,
                machine,
                entity.entity_id,
                now,
                first_factor_option,
                second_factor_option,
            )? {
                cookies.push(cookie);
            }
        }

        Ok(BoundSession { session, cookies })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{
        TestDirectory, TestEntity, TestSessionStore, TestTokenStore, TestTransport,
    };

    struct Fixture {
        binder: SessionBinder,
        sessions: Arc<TestSessionStore>,
        tokens: Arc<TestTokenStore>,
        entity_id: Uuid,
    }

    fn fixture() -> Fixture {
        let directory = Arc::new(TestDirectory::new());
        let entity_id = directory.add_entity(TestEntity::enabled("Test User"));
        let sessions = Arc::new(TestSessionStore::default());
        let tokens = Arc::new(TestTokenStore::default());
        let remember_me = Arc::new(RememberMeTokenService::new(
            tokens.clone(),
            sessions.clone(),
            directory.clone(),
        ));
        let binder = SessionBinder::new(sessions.clone(), directory, remember_me);
        Fixture {
            binder,
            sessions,
            tokens,
            entity_id,
        }
    }

    fn realm(name: &str, policy: RememberMePolicy) -> AuthenticationRealm {
        AuthenticationRealm {
            name: name.to_string(),
            remember_me_policy: policy,
            remember_me_for_days: 14,
        }
    }

    #[test]
    fn test_bind_in_matching_realm_reinitializes_first() {
        sketching::test_init();
        let fx = fixture();
        let mut transport = TestTransport::default();

        let bound = fx
            .binder
            .bind(
                &AuthenticatedEntity::local(fx.entity_id, "password"),
                &AuthenticationOptionKey::new("pwd"),
                None,
                &realm("main", RememberMePolicy::Disallow),
                &LoginMachineDetails::default(),
                false,
                RememberMeInfo::default(),
                &InvocationContext::for_realm("main"),
                &mut transport,
                OffsetDateTime::now_utc(),
            )
            .expect("bind failed");

        assert_eq!(bound.session.entity_id, fx.entity_id);
        assert_eq!(bound.session.label, "Test User");
        assert_eq!(transport.bound_sessions(), 1);
        assert!(transport.reinitialized_before_bind());
        assert!(bound.cookies.is_empty());
    }

    #[test]
    fn test_bind_in_foreign_realm_skips_transport() {
        sketching::test_init();
        let fx = fixture();
        let mut transport = TestTransport::default();

        let bound = fx
            .binder
            .bind(
                &AuthenticatedEntity::local(fx.entity_id, "password"),
                &AuthenticationOptionKey::new("pwd"),
                None,
                &realm("realm-a", RememberMePolicy::Disallow),
                &LoginMachineDetails::default(),
                false,
                RememberMeInfo::default(),
                &InvocationContext::for_realm("realm-b"),
                &mut transport,
                OffsetDateTime::now_utc(),
            )
            .expect("bind failed");

        // The session exists for programmatic use, the transport is
        // untouched.
        assert_eq!(bound.session.realm, "realm-a");
        assert_eq!(fx.sessions.created(), 1);
        assert_eq!(transport.bound_sessions(), 0);
        assert_eq!(transport.reinitializations(), 0);
    }

    #[test]
    fn test_bind_without_context_realm_skips_transport() {
        sketching::test_init();
        let fx = fixture();
        let mut transport = TestTransport::default();

        fx.binder
            .bind(
                &AuthenticatedEntity::local(fx.entity_id, "password"),
                &AuthenticationOptionKey::new("pwd"),
                None,
                &realm("main", RememberMePolicy::Disallow),
                &LoginMachineDetails::default(),
                false,
                RememberMeInfo::default(),
                &InvocationContext::default(),
                &mut transport,
                OffsetDateTime::now_utc(),
            )
            .expect("bind failed");
        assert_eq!(transport.bound_sessions(), 0);
    }

    #[test]
    fn test_remember_me_cookie_issued_on_request() {
        sketching::test_init();
        let fx = fixture();
        let mut transport = TestTransport::default();

        let bound = fx
            .binder
            .bind(
                &AuthenticatedEntity::local(fx.entity_id, "password"),
                &AuthenticationOptionKey::new("pwd"),
                Some(&AuthenticationOptionKey::new("totp")),
                &realm("main", RememberMePolicy::AllowForWholeAuthn),
                &LoginMachineDetails::default(),
                true,
                RememberMeInfo::default(),
                &InvocationContext::for_realm("main"),
                &mut transport,
                OffsetDateTime::now_utc(),
            )
            .expect("bind failed");

        assert_eq!(bound.cookies.len(), 1);
        assert_eq!(bound.cookies[0].name(), "REMEMBERME_main");
        assert_eq!(fx.tokens.count(REMEMBER_ME_TOKEN_TYPE), 1);
    }

    #[test]
    fn test_remember_me_request_honours_realm_policy() {
        sketching::test_init();
        let fx = fixture();
        let mut transport = TestTransport::default();

        let bound = fx
            .binder
            .bind(
                &AuthenticatedEntity::local(fx.entity_id, "password"),
                &AuthenticationOptionKey::new("pwd"),
                None,
                &realm("main", RememberMePolicy::Disallow),
                &LoginMachineDetails::default(),
                true,
                RememberMeInfo::default(),
                &InvocationContext::for_realm("main"),
                &mut transport,
                OffsetDateTime::now_utc(),
            )
            .expect("bind failed");
        assert!(bound.cookies.is_empty());
        assert_eq!(fx.tokens.count(REMEMBER_ME_TOKEN_TYPE), 0);
    }

    #[test]
    fn test_remote_details_carried_onto_session() {
        sketching::test_init();
        let fx = fixture();
        let mut transport = TestTransport::default();

        let mut entity = AuthenticatedEntity::local(fx.entity_id, "saml2");
        entity.authenticated_with = vec!["[email] user@example.com".to_string()];
        entity.remote_idp = Some("upstream-idp".to_string());

        let bound = fx
            .binder
            .bind(
                &entity,
                &AuthenticationOptionKey::with_option("saml", "idp1"),
                None,
                &realm("main", RememberMePolicy::Disallow),
                &LoginMachineDetails::default(),
                false,
                RememberMeInfo::default(),
                &InvocationContext::for_realm("main"),
                &mut transport,
                OffsetDateTime::now_utc(),
            )
            .expect("bind failed");
        assert_eq!(
            bound.session.authenticated_identities,
            vec!["[email] user@example.com".to_string()]
        );
        assert_eq!(bound.session.remote_idp.as_deref(), Some("upstream-idp"));
    }
}
