//! Auth error taxonomy.
//!
//! Clients only ever see a generic "unauthorized"; the variants exist for
//! logging and tests.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing credentials")]
    MissingCredentials,

    #[error("unauthorized")]
    Unauthorized,

    #[error("untrusted origin: {0}")]
    UntrustedOrigin(String),

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("token is scoped to a different org")]
    WrongOrg,

    #[error("auth provider error: {0}")]
    Provider(String),
}
