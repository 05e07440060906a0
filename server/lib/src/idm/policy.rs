//! Dynamic policy expression support. Policies are boolean rhai expressions
//! evaluated against a read-only context built from the authenticated
//! entity. The engine is hardened against runaway scripts, and compiled
//! expressions are held in a bounded time based cache so that profile and
//! policy edits become visible after the TTL without a restart.

use crate::prelude::*;

use std::sync::Mutex;
use std::time::Instant;

use hashbrown::HashMap;
use rhai::{Array, Dynamic, Engine, Map, Scope, AST};

use crate::idm::authenticator::VerifierKind;
use crate::idm::authflow::AuthenticationFlow;
use crate::stores::DirectoryReadTxn;

const MAX_EXPRESSION_OPERATIONS: u64 = 100_000;
const MAX_EXPRESSION_CALL_DEPTH: usize = 32;
const MAX_EXPRESSION_STRING_SIZE: usize = 65_536;
const MAX_EXPRESSION_ARRAY_SIZE: usize = 10_000;
const MAX_EXPRESSION_MAP_SIZE: usize = 10_000;

/// Upper bound on distinct cached expressions. A deployment has a handful
/// of configured policies; hitting this means something is generating
/// expressions and the cache degrades to recompiling.
const EXPRESSION_CACHE_CAPACITY: usize = 512;

pub const DEFAULT_EXPRESSION_TTL: Duration = Duration::from_secs(300);

struct CachedExpression {
    ast: Arc<AST>,
    compiled_at: Instant,
}

/// A hardened expression engine with a bounded, time based cache of
/// compiled expressions. Recompilation after TTL expiry is transparent to
/// callers.
pub struct ExpressionCache {
    engine: Engine,
    ttl: Duration,
    compiled: Mutex<HashMap<String, CachedExpression>>,
}

impl ExpressionCache {
    pub fn new(ttl: Duration) -> Self {
        let mut engine = Engine::new();
        engine.set_max_operations(MAX_EXPRESSION_OPERATIONS);
        engine.set_max_call_levels(MAX_EXPRESSION_CALL_DEPTH);
        engine.set_max_string_size(MAX_EXPRESSION_STRING_SIZE);
        engine.set_max_array_size(MAX_EXPRESSION_ARRAY_SIZE);
        engine.set_max_map_size(MAX_EXPRESSION_MAP_SIZE);

        ExpressionCache {
            engine,
            ttl,
            compiled: Mutex::new(HashMap::new()),
        }
    }

    fn compile(&self, expression: &str) -> Result<Arc<AST>, ConfigError> {
        let mut compiled = self
            .compiled
            .lock()
            .map_err(|_| ConfigError::InvalidExpression("expression cache poisoned".to_string()))?;

        if let Some(cached) = compiled.get(expression) {
            if cached.compiled_at.elapsed() < self.ttl {
                return Ok(cached.ast.clone());
            }
        }

        let ast = self
            .engine
            .compile(expression)
            .map(Arc::new)
            .map_err(|e| ConfigError::InvalidExpression(e.to_string()))?;

        if compiled.len() >= EXPRESSION_CACHE_CAPACITY {
            compiled.retain(|_, cached| cached.compiled_at.elapsed() < self.ttl);
            if compiled.len() >= EXPRESSION_CACHE_CAPACITY {
                compiled.clear();
            }
        }

        compiled.insert(
            expression.to_string(),
            CachedExpression {
                ast: ast.clone(),
                compiled_at: Instant::now(),
            },
        );
        Ok(ast)
    }

    /// Evaluate a boolean expression. Compile failures and runtime
    /// failures, including a non-boolean result, are reported the same
    /// way - callers decide what a failed evaluation means.
    pub fn eval_bool(
        &self,
        expression: &str,
        scope: &mut Scope<'_>,
    ) -> Result<bool, ConfigError> {
        let ast = self.compile(expression)?;
        self.engine
            .eval_ast_with_scope::<bool>(scope, &ast)
            .map_err(|e| ConfigError::InvalidExpression(e.to_string()))
    }

    /// Evaluate an expression to an arbitrary value, for translation rule
    /// value expressions.
    pub fn eval_value(
        &self,
        expression: &str,
        scope: &mut Scope<'_>,
    ) -> Result<Dynamic, ConfigError> {
        let ast = self.compile(expression)?;
        self.engine
            .eval_ast_with_scope::<Dynamic>(scope, &ast)
            .map_err(|e| ConfigError::InvalidExpression(e.to_string()))
    }
}

impl Default for ExpressionCache {
    fn default() -> Self {
        Self::new(DEFAULT_EXPRESSION_TTL)
    }
}

/// The read-only evaluation environment of a dynamic second-factor policy.
/// Rebuilt for every evaluation from a single directory snapshot; never
/// cached across requests.
#[derive(Debug, Clone)]
pub struct PolicyExpressionContext {
    ids_by_type: Map,
    attr: Map,
    attrs: Map,
    groups: Array,
    has_valid_2f_credential: bool,
    authn_option: String,
    upstream: Option<RemoteProtocolMetadata>,
}

impl PolicyExpressionContext {
    pub fn build(
        txn: &dyn DirectoryReadTxn,
        entity_id: Uuid,
        flow: &AuthenticationFlow,
        first_factor_option: &AuthenticationOptionKey,
        upstream: Option<&RemoteProtocolMetadata>,
    ) -> Result<Self, OperationError> {
        let mut ids_by_type = Map::new();
        for identity in txn.get_identities(entity_id)? {
            let values = ids_by_type
                .entry(identity.id_type.as_str().into())
                .or_insert_with(|| Dynamic::from(Array::new()));
            if let Some(mut array) = values.write_lock::<Array>() {
                array.push(Dynamic::from(identity.value.clone()));
            }
        }

        let mut attr = Map::new();
        let mut attrs = Map::new();
        for attribute in txn.get_attributes(entity_id, "/")? {
            let scalar = attribute.values.first().cloned().unwrap_or_default();
            attr.insert(attribute.name.as_str().into(), Dynamic::from(scalar));
            let values: Array = attribute
                .values
                .iter()
                .map(|v| Dynamic::from(v.clone()))
                .collect();
            attrs.insert(attribute.name.as_str().into(), Dynamic::from(values));
        }

        let groups: Array = txn
            .get_groups(entity_id)?
            .into_iter()
            .map(Dynamic::from)
            .collect();

        let mut has_valid_2f_credential = false;
        for instance in &flow.second_factor {
            if matches!(instance.verifier, VerifierKind::Credential(_))
                && instance.usable_by(entity_id, txn)?
            {
                has_valid_2f_credential = true;
                break;
            }
        }

        Ok(PolicyExpressionContext {
            ids_by_type,
            attr,
            attrs,
            groups,
            has_valid_2f_credential,
            authn_option: first_factor_option.to_string(),
            upstream: upstream.cloned(),
        })
    }

    /// Materialise the context as an expression scope.
    pub fn scope(&self) -> Scope<'static> {
        let mut scope = Scope::new();
        scope.push_constant("ids_by_type", self.ids_by_type.clone());
        scope.push_constant("attr", self.attr.clone());
        scope.push_constant("attrs", self.attrs.clone());
        scope.push_constant("groups", self.groups.clone());
        scope.push_constant("has_valid_2f_credential", self.has_valid_2f_credential);
        scope.push_constant("authn_option", self.authn_option.clone());
        if let Some(meta) = &self.upstream {
            scope.push_constant("upstream_protocol", meta.protocol.clone());
            scope.push_constant("upstream_idp", meta.issuer.clone());
            let acrs: Array = meta
                .authn_context_class_refs
                .iter()
                .map(|r| Dynamic::from(r.clone()))
                .collect();
            scope.push_constant("upstream_acrs", acrs);
        }
        scope
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idm::authenticator::AuthenticatorInstance;
    use crate::idm::authflow::SecondFactorPolicy;
    use crate::stores::EntityDirectory;
    use crate::testkit::{TestCredentialVerifier, TestDirectory, TestEntity};

    fn test_flow(second_factor: Vec<Arc<AuthenticatorInstance>>) -> AuthenticationFlow {
        AuthenticationFlow {
            name: "flow".to_string(),
            first_factor: vec![Arc::new(AuthenticatorInstance::credential(
                "pwd",
                Arc::new(TestCredentialVerifier::new("password", "sys:password")),
            ))],
            second_factor,
            policy: SecondFactorPolicy::Require,
        }
    }

    #[test]
    fn test_eval_bool_rejects_non_boolean() {
        sketching::test_init();
        let cache = ExpressionCache::default();
        let mut scope = Scope::new();
        assert!(cache.eval_bool("1 + 1", &mut scope).is_err());
        assert!(cache.eval_bool("no a valid expr ((", &mut scope).is_err());
        assert_eq!(cache.eval_bool("1 + 1 == 2", &mut scope), Ok(true));
    }

    #[test]
    fn test_cache_ttl_recompile_is_transparent() {
        sketching::test_init();
        let cache = ExpressionCache::new(Duration::from_millis(10));
        let mut scope = Scope::new();
        assert_eq!(cache.eval_bool("2 > 1", &mut scope), Ok(true));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.eval_bool("2 > 1", &mut scope), Ok(true));
    }

    #[test]
    fn test_context_exposes_entity_state() {
        sketching::test_init();
        let directory = TestDirectory::new();
        let entity_id = directory.add_entity(
            TestEntity::enabled("Test User")
                .with_identity(IdentityValue::new("username", "tuser"))
                .with_identity(IdentityValue::new("email", "tuser@example.com"))
                .with_attribute(Attribute::new("department", "/", &["finance"]))
                .with_group("/staff")
                .with_credential("sys:totp", CredentialState::Valid),
        );

        let totp = Arc::new(AuthenticatorInstance::credential(
            "totp",
            Arc::new(TestCredentialVerifier::new("totp", "sys:totp")),
        ));
        let flow = test_flow(vec![totp]);

        let txn = directory.read().expect("failed to open read txn");
        let context = PolicyExpressionContext::build(
            txn.as_ref(),
            entity_id,
            &flow,
            &AuthenticationOptionKey::new("pwd"),
            None,
        )
        .expect("failed to build context");

        let cache = ExpressionCache::default();
        let mut scope = context.scope();
        assert_eq!(
            cache.eval_bool(r#"attr["department"] == "finance""#, &mut scope),
            Ok(true)
        );
        let mut scope = context.scope();
        assert_eq!(
            cache.eval_bool(r#"groups.contains("/staff")"#, &mut scope),
            Ok(true)
        );
        let mut scope = context.scope();
        assert_eq!(
            cache.eval_bool("has_valid_2f_credential", &mut scope),
            Ok(true)
        );
        let mut scope = context.scope();
        assert_eq!(
            cache.eval_bool(r#"authn_option == "pwd""#, &mut scope),
            Ok(true)
        );
        let mut scope = context.scope();
        assert_eq!(
            cache.eval_bool(
                r#"ids_by_type["email"].contains("tuser@example.com")"#,
                &mut scope
            ),
            Ok(true)
        );
    }

    #[test]
    fn test_context_upstream_metadata() {
        sketching::test_init();
        let directory = TestDirectory::new();
        let entity_id = directory.add_entity(TestEntity::enabled("Remote User"));
        let flow = test_flow(Vec::with_capacity(0));

        let meta = RemoteProtocolMetadata {
            protocol: "saml2".to_string(),
            issuer: "https://idp.example.com".to_string(),
            authn_context_class_refs: vec!["urn:mace:pwd".to_string()],
        };

        let txn = directory.read().expect("failed to open read txn");
        let context = PolicyExpressionContext::build(
            txn.as_ref(),
            entity_id,
            &flow,
            &AuthenticationOptionKey::with_option("saml", "idp1"),
            Some(&meta),
        )
        .expect("failed to build context");

        let cache = ExpressionCache::default();
        let mut scope = context.scope();
        assert_eq!(
            cache.eval_bool(
                r#"upstream_protocol == "saml2" && upstream_acrs.contains("urn:mace:pwd")"#,
                &mut scope
            ),
            Ok(true)
        );
    }
}
