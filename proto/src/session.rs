use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::authn::{AuthenticationOptionKey, RememberMeInfo, RememberMePolicy};

/// The token type tag under which remember-me records are stored.
pub const REMEMBER_ME_TOKEN_TYPE: &str = "rememberMe";

/// Cookie name prefix for remember-me cookies; the realm name is appended.
pub const REMEMBER_ME_COOKIE_PFX: &str = "REMEMBERME_";

/// Details of the machine a login was performed from, recorded on sessions
/// and remember-me tokens.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct LoginMachineDetails {
    pub ip: String,
    pub os: String,
    pub browser: String,
}

/// A login session as created by the external session store. The core fills
/// in the authenticated identities and remote IdP after binding.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LoginSession {
    pub id: Uuid,
    pub entity_id: Uuid,
    pub realm: String,
    /// Display label of the entity, empty when it could not be resolved.
    pub label: String,
    pub started: OffsetDateTime,
    pub expires: Option<OffsetDateTime>,
    pub remember_me_info: RememberMeInfo,
    pub first_factor_option: AuthenticationOptionKey,
    pub second_factor_option: Option<AuthenticationOptionKey>,
    /// Set when the login used a credential that is outdated and must be
    /// changed by the user.
    pub outdated_credential_id: Option<Uuid>,
    /// Identity values the entity was authenticated with.
    pub authenticated_identities: Vec<String>,
    pub remote_idp: Option<String>,
}

/// The persisted half of a remember-me token. Only the hash of the validator
/// is stored; the validator itself lives in the cookie on the client.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RememberMeTokenRecord {
    pub entity_id: Uuid,
    pub realm: String,
    /// The realm's remember-me policy at issuance time. A token is only
    /// usable while the realm still has the same policy.
    pub policy: RememberMePolicy,
    /// Hex encoded SHA-256 of the validator secret.
    pub validator_hash: String,
    pub first_factor_option: AuthenticationOptionKey,
    pub second_factor_option: Option<AuthenticationOptionKey>,
    pub machine: LoginMachineDetails,
    pub issued_at: OffsetDateTime,
    pub expires: OffsetDateTime,
}

/// An instruction for the transport layer to set or remove a cookie. The
/// core never touches HTTP itself.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum CookieCommand {
    Set {
        name: String,
        value: String,
        max_age_seconds: i64,
    },
    /// Emitted with max-age zero semantics: the transport must expire the
    /// cookie immediately.
    Remove { name: String },
}

impl CookieCommand {
    pub fn name(&self) -> &str {
        match self {
            CookieCommand::Set { name, .. } => name,
            CookieCommand::Remove { name } => name,
        }
    }
}

pub fn remember_me_cookie_name(realm_name: &str) -> String {
    format!("{}{}", REMEMBER_ME_COOKIE_PFX, realm_name)
}
