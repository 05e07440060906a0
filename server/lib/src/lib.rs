//! The identity broker core library. This implements the decision making of
//! an authentication attempt: whether a principal is valid, how many factors
//! are required, how a remotely asserted identity maps onto a local entity,
//! and how a successful authentication is remembered across sessions. All
//! persistence and transport concerns are consumed through the collaborator
//! traits in [`stores`].

#![deny(warnings)]
#![warn(unused_extern_crates)]
// Enable some groups of clippy lints.
#![deny(clippy::suspicious)]
#![deny(clippy::perf)]
// Specific lints to enforce.
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::needless_pass_by_value)]
#![deny(clippy::trivially_copy_pass_by_ref)]
#![deny(clippy::disallowed_types)]
#![deny(clippy::manual_let_else)]
#![allow(clippy::unreachable)]

#[macro_use]
extern crate tracing;

pub mod idm;
pub mod stores;
#[cfg(any(test, feature = "test"))]
pub mod testkit;

/// A prelude of imports that should be imported by all other broker modules
/// to help make imports cleaner.
pub mod prelude {
    pub use std::sync::Arc;
    pub use std::time::Duration;

    pub use broker_proto::authn::{
        AuthenticationOptionKey, AuthenticationRealm, RememberMeInfo, RememberMePolicy,
        RemoteProtocolMetadata,
    };
    pub use broker_proto::errors::{AuthenticationError, ConfigError, OperationError};
    pub use broker_proto::identity::{Attribute, CredentialState, IdentityValue};
    pub use broker_proto::session::{
        remember_me_cookie_name, CookieCommand, LoginMachineDetails, LoginSession,
        RememberMeTokenRecord, REMEMBER_ME_TOKEN_TYPE,
    };
    pub use sketching::{
        admin_debug, admin_error, admin_info, admin_warn, request_error, request_info,
        request_trace, request_warn, security_access, security_critical, security_debug,
        security_error, security_info, tagged_event, EventTag,
    };
    pub use time::OffsetDateTime;
    pub use uuid::Uuid;

    pub use crate::idm::IdmError;
}
