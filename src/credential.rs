use std::fmt;
use std::sync::{Arc, OnceLock};

use crate::error::{Error, Result};
use crate::oauth::{FederatedIdentity, IdentityKind};
use crate::password::{Password, hash_password, verify_password};
use crate::store::Store;
use crate::types::{ProviderName, RoleId, User, UserId, Username};

static DUMMY_HASH: OnceLock<String> = OnceLock::new();

/// Local account proven by a credential.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VerifiedIdentity {
    pub user_id: UserId,
    pub role_id: RoleId,
    pub username: Username,
}

impl From<&User> for VerifiedIdentity {
    fn from(user: &User) -> Self {
        Self {
            user_id: user.id,
            role_id: user.role_id,
            username: user.username.clone(),
        }
    }
}

/// Checks local passwords and maps federated identities to local accounts.
pub struct CredentialVerifier<S> {
    store: Arc<S>,
}

impl<S> fmt::Debug for CredentialVerifier<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialVerifier").finish_non_exhaustive()
    }
}

impl<S> CredentialVerifier<S>
where
    S: Store,
{
    /// Creates a new verifier over `store`.
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Verifies a username and password.
    ///
    /// Unknown users, wrong passwords and disabled accounts all yield
    /// [`Error::InvalidCredentials`], and all of them pay for one hash
    /// verification.
    pub async fn verify_local(
        &self,
        username: &str,
        password: &Password,
    ) -> Result<VerifiedIdentity> {
        let user = match Username::new(username) {
            Ok(username) => self.store.find_user_by_username(&username).await?,
            Err(_) => None,
        };

        let stored_hash = user.as_ref().map(|user| user.password_hash.clone());
        let password = password.clone();
        let matched = tokio::task::spawn_blocking(move || match stored_hash {
            Some(hash) => verify_password(&password, &hash),
            None => {
                let _ = verify_password(&password, dummy_hash()?);
                Ok(false)
            }
        })
        .await
        .map_err(|err| Error::Crypto(format!("password task: {err}")))?;

        let matched = match matched {
            Ok(matched) => matched,
            Err(err) => {
                tracing::error!(username = %username, error = %err, "stored password hash rejected");
                return Err(err);
            }
        };

        match user {
            Some(user) if matched && user.status.is_active() => Ok(VerifiedIdentity::from(&user)),
            Some(user) if matched => {
                tracing::info!(user_id = %user.id, "login refused for disabled account");
                Err(Error::InvalidCredentials)
            }
            _ => Err(Error::InvalidCredentials),
        }
    }

    /// Maps a federated identity to an existing local account.
    ///
    /// Stable handles are matched against the handles stored for `provider`.
    /// Anything else falls back to username equality, which trusts the
    /// provider not to hand out arbitrary usernames. Accounts are never
    /// created here.
    pub async fn resolve_federated_user(
        &self,
        provider: &ProviderName,
        identity: &FederatedIdentity,
    ) -> Result<VerifiedIdentity> {
        let user = match identity.kind {
            IdentityKind::StableHandle => {
                self.store
                    .find_user_by_federated_handle(provider, &identity.credential)
                    .await?
            }
            IdentityKind::Username => {
                tracing::warn!(
                    provider = %provider,
                    "resolving federated identity by username equality"
                );
                match Username::new(&identity.credential) {
                    Ok(username) => self.store.find_user_by_username(&username).await?,
                    Err(_) => None,
                }
            }
        };

        match user {
            Some(user) if user.status.is_active() => Ok(VerifiedIdentity::from(&user)),
            _ => Err(Error::UserNotProvisioned {
                provider: provider.to_string(),
            }),
        }
    }
}

fn dummy_hash() -> Result<&'static str> {
    if let Some(hash) = DUMMY_HASH.get() {
        return Ok(hash);
    }
    let hash = hash_password(&Password::new("dummy password for unknown users"))?;
    Ok(DUMMY_HASH.get_or_init(|| hash))
}

#[cfg(all(test, feature = "memory-store"))]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::memory_store::MemoryStore;
    use crate::types::Status;

    fn user(id: u64, name: &str, password: &str, status: Status) -> User {
        User {
            id: UserId::new(id),
            username: Username::new(name).unwrap(),
            password_hash: hash_password(&Password::new(password)).unwrap(),
            role_id: RoleId::new(1),
            status,
            federated_handles: BTreeMap::new(),
        }
    }

    fn identity(credential: &str, kind: IdentityKind) -> FederatedIdentity {
        FederatedIdentity {
            credential: credential.to_string(),
            email: None,
            mobile: None,
            nickname: None,
            picture: None,
            kind,
        }
    }

    #[tokio::test]
    async fn verify_local_should_accept_correct_password() {
        let store = Arc::new(MemoryStore::new());
        store.add_user(user(1, "admin", "simple-admin", Status::Active));
        let verifier = CredentialVerifier::new(store);

        let verified = verifier
            .verify_local("admin", &Password::new("simple-admin"))
            .await
            .unwrap();
        assert_eq!(verified.user_id, UserId::new(1));
        assert_eq!(verified.role_id, RoleId::new(1));
    }

    #[tokio::test]
    async fn verify_local_should_not_distinguish_failures() {
        let store = Arc::new(MemoryStore::new());
        store.add_user(user(1, "admin", "simple-admin", Status::Active));
        store.add_user(user(2, "frozen", "frozen-pass", Status::Disabled));
        let verifier = CredentialVerifier::new(store);

        for (name, password) in [
            ("admin", "wrong"),
            ("nobody", "simple-admin"),
            ("frozen", "frozen-pass"),
            ("bad name!", "x"),
        ] {
            let result = verifier.verify_local(name, &Password::new(password)).await;
            assert!(matches!(result, Err(Error::InvalidCredentials)), "{name}");
        }
    }

    #[tokio::test]
    async fn resolve_should_match_stable_handle_only() {
        let store = Arc::new(MemoryStore::new());
        let corp = ProviderName::new("corp").unwrap();
        let mut linked = user(1, "alice", "pw", Status::Active);
        linked.federated_handles.insert(corp.clone(), "ZhangSan".to_string());
        store.add_user(linked);
        store.add_user(user(2, "ZhangSan", "pw", Status::Active));
        let verifier = CredentialVerifier::new(store);

        let verified = verifier
            .resolve_federated_user(&corp, &identity("ZhangSan", IdentityKind::StableHandle))
            .await
            .unwrap();
        assert_eq!(verified.user_id, UserId::new(1));
    }

    #[tokio::test]
    async fn resolve_should_never_provision() {
        let store = Arc::new(MemoryStore::new());
        let github = ProviderName::new("github").unwrap();
        let verifier = CredentialVerifier::new(store);

        let result = verifier
            .resolve_federated_user(&github, &identity("octocat", IdentityKind::Username))
            .await;
        assert!(matches!(result, Err(Error::UserNotProvisioned { .. })));
    }
}
