use std::fmt;

use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{RoleId, SessionSource, UserId};

/// Bearer token claims.
///
/// Ids travel as decimal strings. `sid` is the session token the claims were
/// minted for; a later login for the same user replaces it.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SessionClaims {
    pub user_id: String,
    pub role_id: String,
    /// Session token.
    pub sid: String,
    /// `local` or `oauth:<provider>`.
    pub src: String,
    /// Unix seconds.
    pub iat: i64,
    /// Unix seconds.
    pub exp: i64,
}

impl SessionClaims {
    /// Creates claims for a session.
    pub fn new(
        user_id: UserId,
        role_id: RoleId,
        sid: impl Into<String>,
        source: &SessionSource,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id: user_id.to_string(),
            role_id: role_id.to_string(),
            sid: sid.into(),
            src: source.to_string(),
            iat: issued_at.timestamp(),
            exp: expires_at.timestamp(),
        }
    }

    /// Parses the user id claim.
    pub fn user_id(&self) -> Result<UserId> {
        self.user_id.parse()
    }

    /// Parses the role id claim.
    pub fn role_id(&self) -> Result<RoleId> {
        self.role_id.parse()
    }
}

/// HS256 signer and verifier for [`SessionClaims`].
#[derive(Clone)]
pub struct TokenCodec {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCodec")
            .field("keys", &"<redacted>")
            .field("validation", &self.validation)
            .finish()
    }
}

impl TokenCodec {
    /// Creates a codec keyed by `secret`. An empty secret is a config error.
    pub fn new(secret: &[u8]) -> Result<Self> {
        if secret.is_empty() {
            return Err(Error::Config("token signing secret is empty".to_string()));
        }
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp"]);
        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
        })
    }

    /// Signs `claims`.
    pub fn encode(&self, claims: &SessionClaims) -> Result<String> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key)
            .map_err(|err| Error::Crypto(format!("sign token: {err}")))
    }

    /// Verifies signature and expiry.
    pub fn decode(&self, token: &str) -> Result<SessionClaims> {
        decode::<SessionClaims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|_| Error::InvalidToken)
    }
}

/// Extracts the token from an `Authorization: Bearer <token>` value.
pub fn bearer_token(header: Option<&str>) -> Result<&str> {
    let token = header
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .ok_or(Error::InvalidToken)?;
    if token.is_empty() {
        return Err(Error::InvalidToken);
    }
    Ok(token)
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;

    fn claims(expires_in: TimeDelta) -> SessionClaims {
        let now = Utc::now();
        SessionClaims::new(
            UserId::new(1),
            RoleId::new(2),
            "sid-1",
            &SessionSource::Local,
            now,
            now + expires_in,
        )
    }

    #[test]
    fn codec_should_round_trip_claims() {
        let codec = TokenCodec::new(b"secret").unwrap();
        let claims = claims(TimeDelta::hours(1));
        let decoded = codec.decode(&codec.encode(&claims).unwrap()).unwrap();

        assert_eq!(decoded, claims);
        assert_eq!(decoded.user_id().unwrap(), UserId::new(1));
        assert_eq!(decoded.role_id().unwrap(), RoleId::new(2));
        assert_eq!(decoded.src, "local");
    }

    #[test]
    fn codec_should_reject_foreign_signature() {
        let token = TokenCodec::new(b"one")
            .unwrap()
            .encode(&claims(TimeDelta::hours(1)))
            .unwrap();
        let result = TokenCodec::new(b"two").unwrap().decode(&token);
        assert!(matches!(result, Err(Error::InvalidToken)));
    }

    #[test]
    fn codec_should_reject_expired_token() {
        let codec = TokenCodec::new(b"secret").unwrap();
        let token = codec.encode(&claims(TimeDelta::hours(-1))).unwrap();
        assert!(matches!(codec.decode(&token), Err(Error::InvalidToken)));
    }

    #[test]
    fn bearer_token_should_require_scheme() {
        assert_eq!(bearer_token(Some("Bearer abc")).unwrap(), "abc");
        assert!(bearer_token(Some("Basic abc")).is_err());
        assert!(bearer_token(Some("Bearer ")).is_err());
        assert!(bearer_token(None).is_err());
    }
}
