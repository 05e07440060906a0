use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A fault in the deployed configuration. These are never converted to a
/// denial - they propagate to the operator, who has to fix the deployment.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[serde(rename_all = "lowercase")]
pub enum ConfigError {
    #[error("translation profile '{0}' does not exist")]
    MissingTranslationProfile(String),
    #[error("authentication flow '{0}' does not exist")]
    MissingFlow(String),
    #[error("authenticator '{0}' is not registered")]
    MissingAuthenticator(String),
    #[error("invalid configuration expression: {0}")]
    InvalidExpression(String),
}

/// An expected authentication failure. Always surfaced to the caller as a
/// typed denial, never as a crash, so that "deny" can not be confused with
/// "broken".
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[serde(rename_all = "lowercase")]
pub enum AuthenticationError {
    #[error("authentication denied: {0}")]
    Denied(String),
    #[error("the account is disabled")]
    DisabledAccount,
    #[error("mapped identities resolve to distinct entities {0} and {1}")]
    AmbiguousMapping(Uuid, Uuid),
    #[error("a required identity match could not be confirmed")]
    RequiredMatchFailed,
    #[error("the mapping produced no usable identities")]
    NoMappedIdentities,
    #[error("a second factor is required but none is available")]
    SecondFactorUnavailable,
    #[error("the authentication attempt is in an invalid state")]
    InvalidAuthState,
}

/// Faults from the external collaborators (directory, stores) or from the
/// machinery itself. Mostly opaque to authentication outcomes.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[serde(rename_all = "lowercase")]
pub enum OperationError {
    #[error("no matching entries")]
    NoMatchingEntries,
    #[error("backend failure")]
    Backend,
    #[error("serde json failure")]
    SerdeJsonError,
    #[error("cryptography failure")]
    CryptographyError,
    #[error("invalid state")]
    InvalidState,
}
