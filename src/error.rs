use crate::types::{RoleId, RoleValue};
use thiserror::Error;

/// Store-layer error type.
pub type StoreError = Box<dyn std::error::Error + Send + Sync>;

/// Crate result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by this crate.
///
/// Every variant maps to a stable, caller-visible `(code, message)` pair through
/// [`Error::code`] and [`Error::public_message`]. The `Display` text carries the
/// detail operators need and is meant for logs only.
#[derive(Debug, Error)]
pub enum Error {
    /// Unknown user, wrong password or disabled account.
    #[error("invalid credentials")]
    InvalidCredentials,
    /// Captcha missing, expired, already used or wrong.
    #[error("invalid captcha")]
    CaptchaInvalid,
    /// Bearer token missing, malformed or not decodable.
    #[error("invalid bearer token")]
    InvalidToken,
    /// Session logged out, expired or superseded by a newer login.
    #[error("session expired or missing")]
    SessionExpiredOrMissing,
    /// Role unknown or not active.
    #[error("role {0} inactive or missing")]
    RoleInactiveOrMissing(RoleId),
    /// No policy rule grants the request.
    #[error("policy denied {method} {path} for role {role}")]
    PolicyDenied {
        role: RoleValue,
        path: String,
        method: String,
    },
    /// OAuth code exchange or user info lookup failed.
    #[error("oauth exchange failed: {0}")]
    ExchangeFailed(String),
    /// Federated identity has no local account.
    #[error("no local account for federated identity from {provider}")]
    UserNotProvisioned { provider: String },
    /// Backing store fault or request deadline exceeded.
    #[error("backing store unavailable: {0}")]
    BackingStoreUnavailable(#[source] StoreError),
    /// A policy replace failed after the role's rules were cleared.
    #[error("replacing rules for role {role} failed, role has no rules: {source}")]
    PolicyReplaceFailed {
        role: RoleValue,
        #[source]
        source: StoreError,
    },
    /// Invalid identifier input.
    #[error("invalid id: {0}")]
    InvalidId(String),
    /// Invalid policy rule input.
    #[error("invalid policy rule: {0}")]
    InvalidRule(String),
    /// Session expiry too close to now.
    #[error("invalid session expiry: {0}")]
    InvalidExpiry(String),
    /// OAuth state not in `{random}-{provider}` form or not matching the provider.
    #[error("invalid oauth state")]
    InvalidState,
    /// No OAuth provider configured under this name.
    #[error("unknown oauth provider {0}")]
    UnknownProvider(String),
    /// Role still assigned to at least one user.
    #[error("role {0} is assigned to users")]
    RoleInUse(RoleId),
    /// Entity not found for an administrative operation.
    #[error("not found: {0}")]
    NotFound(String),
    /// Password hashing or token signing failure.
    #[error("crypto error: {0}")]
    Crypto(String),
    /// Configuration could not be loaded.
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<StoreError> for Error {
    fn from(error: StoreError) -> Self {
        Self::BackingStoreUnavailable(error)
    }
}

impl Error {
    /// Returns the caller-visible status code.
    pub fn code(&self) -> u16 {
        match self {
            Self::InvalidCredentials
            | Self::CaptchaInvalid
            | Self::InvalidToken
            | Self::SessionExpiredOrMissing
            | Self::UserNotProvisioned { .. } => 401,
            Self::RoleInactiveOrMissing(_) | Self::PolicyDenied { .. } => 403,
            Self::InvalidId(_)
            | Self::InvalidRule(_)
            | Self::InvalidExpiry(_)
            | Self::InvalidState
            | Self::UnknownProvider(_) => 400,
            Self::RoleInUse(_) => 409,
            Self::NotFound(_) => 404,
            Self::ExchangeFailed(_) => 502,
            Self::BackingStoreUnavailable(_)
            | Self::PolicyReplaceFailed { .. }
            | Self::Crypto(_)
            | Self::Config(_) => 500,
        }
    }

    /// Returns the caller-visible message.
    ///
    /// Messages never say which verification step failed.
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::InvalidCredentials => "invalid credentials",
            Self::CaptchaInvalid => "invalid captcha",
            Self::InvalidToken | Self::SessionExpiredOrMissing => "unauthorized",
            Self::RoleInactiveOrMissing(_) | Self::PolicyDenied { .. } => "forbidden",
            Self::ExchangeFailed(_) => "oauth exchange failed",
            Self::UserNotProvisioned { .. } => "user not provisioned",
            Self::InvalidId(_)
            | Self::InvalidRule(_)
            | Self::InvalidExpiry(_)
            | Self::InvalidState
            | Self::UnknownProvider(_) => "bad request",
            Self::RoleInUse(_) => "role in use",
            Self::NotFound(_) => "not found",
            Self::PolicyReplaceFailed { .. } => "policy update failed",
            Self::BackingStoreUnavailable(_) | Self::Crypto(_) | Self::Config(_) => {
                "service unavailable"
            }
        }
    }

    /// Returns true when the error reflects an infrastructure fault rather
    /// than a legitimate denial.
    pub fn is_outage(&self) -> bool {
        matches!(
            self,
            Self::BackingStoreUnavailable(_) | Self::PolicyReplaceFailed { .. } | Self::Crypto(_)
        )
    }

    pub(crate) fn deadline() -> Self {
        Self::BackingStoreUnavailable("request deadline exceeded".into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_message_should_not_reveal_step() {
        assert_eq!(
            Error::SessionExpiredOrMissing.public_message(),
            Error::InvalidToken.public_message()
        );
        let denied = Error::PolicyDenied {
            role: RoleValue::from_string("viewer".to_string()),
            path: "/api/admin/role".to_string(),
            method: "DELETE".to_string(),
        };
        assert_eq!(denied.public_message(), "forbidden");
        assert_eq!(
            Error::RoleInactiveOrMissing(RoleId::new(3)).public_message(),
            "forbidden"
        );
    }

    #[test]
    fn outage_should_be_distinguishable_from_denial() {
        let outage = Error::from(StoreError::from("connection reset"));
        assert!(outage.is_outage());
        assert!(!Error::InvalidCredentials.is_outage());
        assert_eq!(Error::deadline().code(), 500);
    }
}
