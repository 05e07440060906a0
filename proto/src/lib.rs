//! Shared value types of the identity broker. These are the types that cross
//! crate boundaries: the error taxonomy, authentication configuration values,
//! identity/attribute primitives and the persisted session/token records.
//! Anything that requires engine logic lives in `brokerd_lib` instead.

#![deny(warnings)]
#![warn(unused_extern_crates)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::unreachable)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::needless_pass_by_value)]
#![deny(clippy::trivially_copy_pass_by_ref)]

pub mod authn;
pub mod errors;
pub mod identity;
pub mod session;
