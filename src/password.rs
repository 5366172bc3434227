use std::fmt;

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{self, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params};
use serde::Deserialize;

use crate::error::{Error, Result};

/// Plain-text password. Never printed.
#[derive(Clone, Deserialize)]
#[serde(transparent)]
pub struct Password(String);

impl Password {
    /// Wraps a plain-text password.
    pub fn new(password: impl Into<String>) -> Self {
        Self(password.into())
    }

    /// Returns the plain text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Password(<redacted>)")
    }
}

/// Hashes a password with Argon2id at the default cost and a fresh salt.
pub fn hash_password(password: &Password) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_str().as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| Error::Crypto(format!("hash password: {err}")))
}

/// Checks a password against a PHC hash string.
///
/// Returns `Ok(false)` on mismatch. Hashes that are not Argon2id or whose
/// cost is below the default are refused as a crypto error.
pub fn verify_password(password: &Password, hash: &str) -> Result<bool> {
    let parsed =
        PasswordHash::new(hash).map_err(|err| Error::Crypto(format!("parse hash: {err}")))?;
    if parsed.algorithm != Algorithm::Argon2id.ident() {
        return Err(Error::Crypto(format!(
            "unsupported hash algorithm {}",
            parsed.algorithm
        )));
    }
    let params =
        Params::try_from(&parsed).map_err(|err| Error::Crypto(format!("hash params: {err}")))?;
    if params.m_cost() < Params::DEFAULT_M_COST
        || params.t_cost() < Params::DEFAULT_T_COST
        || params.p_cost() < Params::DEFAULT_P_COST
    {
        return Err(Error::Crypto("hash cost below minimum".to_string()));
    }

    match Argon2::default().verify_password(password.as_str().as_bytes(), &parsed) {
        Ok(()) => Ok(true),
        Err(password_hash::Error::Password) => Ok(false),
        Err(err) => Err(Error::Crypto(format!("verify password: {err}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_should_verify_same_password_only() {
        let password = Password::new("correct horse");
        let hash = hash_password(&password).unwrap();

        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_password(&password, &hash).unwrap());
        assert!(!verify_password(&Password::new("wrong horse"), &hash).unwrap());
    }

    #[test]
    fn hash_should_salt_each_call() {
        let password = Password::new("correct horse");
        assert_ne!(hash_password(&password).unwrap(), hash_password(&password).unwrap());
    }

    #[test]
    fn verify_should_refuse_downgraded_cost() {
        let password = Password::new("correct horse");
        let weak = Argon2::new(
            Algorithm::Argon2id,
            argon2::Version::V0x13,
            Params::new(1024, 1, 1, None).unwrap(),
        );
        let salt = SaltString::generate(&mut OsRng);
        let hash = weak
            .hash_password(password.as_str().as_bytes(), &salt)
            .unwrap()
            .to_string();

        assert!(matches!(verify_password(&password, &hash), Err(Error::Crypto(_))));
    }

    #[test]
    fn password_debug_should_redact() {
        assert_eq!(format!("{:?}", Password::new("hunter2")), "Password(<redacted>)");
    }
}
