use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies one selectable authentication option: which authenticator was
/// used, and which option of that authenticator (a multi-option authenticator
/// exposes e.g. one option per upstream IdP).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct AuthenticationOptionKey {
    pub authenticator: String,
    pub option: Option<String>,
}

impl AuthenticationOptionKey {
    pub fn new(authenticator: &str) -> Self {
        AuthenticationOptionKey {
            authenticator: authenticator.to_string(),
            option: None,
        }
    }

    pub fn with_option(authenticator: &str, option: &str) -> Self {
        AuthenticationOptionKey {
            authenticator: authenticator.to_string(),
            option: Some(option.to_string()),
        }
    }
}

impl fmt::Display for AuthenticationOptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.option {
            Some(option) => write!(f, "{}.{}", self.authenticator, option),
            None => write!(f, "{}", self.authenticator),
        }
    }
}

/// What a realm permits remember-me tokens to bypass.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RememberMePolicy {
    /// No remember-me tokens are issued for this realm.
    Disallow,
    /// A remembered login skips only the second factor.
    AllowForSecondFactor,
    /// A remembered login skips the whole authentication.
    AllowForWholeAuthn,
}

/// Which factors of a login were skipped because of a remember-me token.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RememberMeInfo {
    pub first_factor_skipped: bool,
    pub second_factor_skipped: bool,
}

/// An authentication realm groups endpoints that share login sessions and
/// remember-me settings. Read-only at authentication time.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AuthenticationRealm {
    pub name: String,
    pub remember_me_policy: RememberMePolicy,
    /// Lifetime of remember-me tokens issued under this realm.
    pub remember_me_for_days: u32,
}

/// Metadata about the upstream protocol exchange that produced a remote
/// login, carried for dynamic policy evaluation and diagnostics.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RemoteProtocolMetadata {
    pub protocol: String,
    pub issuer: String,
    pub authn_context_class_refs: Vec<String>,
}
