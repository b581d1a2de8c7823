//! Handshake authentication.
//!
//! Namespaces never talk to the auth provider directly; they go through
//! [`AuthGate`], which owns the per-class validation shapes and the
//! multi-tenant token path.

mod error;
mod gate;
mod provider;
mod token;

pub use error::AuthError;
pub use gate::{AuthGate, OrgContext, org_middleware};
pub use provider::{AuthIdentity, AuthProvider, HttpAuthProvider, StaticAuthProvider};
pub use token::{OrgTokenClaims, OrgTokenValidator};
