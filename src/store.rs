use crate::error::StoreError;
use crate::oauth::ProviderConfig;
use crate::policy::Rule;
use crate::types::{ProviderName, Role, RoleDraft, RoleId, RoleValue, Session, User, UserId, Username};
use async_trait::async_trait;

/// Store interface for local accounts.
#[async_trait]
pub trait UserStore {
    /// Returns the account with this username.
    async fn find_user_by_username(
        &self,
        username: &Username,
    ) -> std::result::Result<Option<User>, StoreError>;

    /// Returns the account with this id.
    async fn find_user_by_id(&self, id: UserId) -> std::result::Result<Option<User>, StoreError>;

    /// Returns the account linked to a stable provider handle.
    async fn find_user_by_federated_handle(
        &self,
        provider: &ProviderName,
        handle: &str,
    ) -> std::result::Result<Option<User>, StoreError>;

    /// Returns how many accounts are assigned to a role.
    async fn count_users_with_role(&self, role: RoleId) -> std::result::Result<u64, StoreError>;
}

/// Store interface for roles.
#[async_trait]
pub trait RoleStore {
    /// Returns the role with this id.
    async fn find_role_by_id(&self, id: RoleId) -> std::result::Result<Option<Role>, StoreError>;

    /// Returns every role.
    async fn list_roles(&self) -> std::result::Result<Vec<Role>, StoreError>;

    /// Creates a role and returns it with its assigned id.
    async fn create_role(&self, draft: RoleDraft) -> std::result::Result<Role, StoreError>;

    /// Overwrites an existing role. Returns false if it does not exist.
    async fn update_role(&self, role: &Role) -> std::result::Result<bool, StoreError>;

    /// Deletes a role. Returns false if it did not exist.
    async fn delete_role(&self, id: RoleId) -> std::result::Result<bool, StoreError>;
}

/// Store interface for persisted sessions.
#[async_trait]
pub trait SessionStore {
    /// Returns the session of a user, expired or not.
    async fn find_session_by_user_id(
        &self,
        user: UserId,
    ) -> std::result::Result<Option<Session>, StoreError>;

    /// Inserts the session, or replaces the one already held by the same user.
    async fn replace_session_by_user_id(
        &self,
        session: &Session,
    ) -> std::result::Result<(), StoreError>;

    /// Deletes the session of a user. Returns false if there was none.
    async fn delete_session_by_user_id(&self, user: UserId)
    -> std::result::Result<bool, StoreError>;

    /// Returns every stored session.
    async fn list_sessions(&self) -> std::result::Result<Vec<Session>, StoreError>;
}

/// Store interface for OAuth provider configuration.
#[async_trait]
pub trait ProviderStore {
    /// Returns the provider with this name.
    async fn find_provider_by_name(
        &self,
        name: &ProviderName,
    ) -> std::result::Result<Option<ProviderConfig>, StoreError>;
}

/// Store interface for policy rules.
#[async_trait]
pub trait PolicyStore {
    /// Replaces every rule of a subject in one transaction.
    async fn replace_policy_rules_for_subject(
        &self,
        subject: &RoleValue,
        rules: &[Rule],
    ) -> std::result::Result<(), StoreError>;

    /// Returns the rules of a subject.
    async fn query_policy_rules_for_subject(
        &self,
        subject: &RoleValue,
    ) -> std::result::Result<Vec<Rule>, StoreError>;
}

/// Composite store trait.
pub trait Store:
    UserStore + RoleStore + SessionStore + ProviderStore + PolicyStore + Send + Sync
{
}

impl<T> Store for T where
    T: UserStore + RoleStore + SessionStore + ProviderStore + PolicyStore + Send + Sync
{
}
