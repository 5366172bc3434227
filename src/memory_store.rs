use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::StoreError;
use crate::oauth::ProviderConfig;
use crate::policy::Rule;
use crate::store::{PolicyStore, ProviderStore, RoleStore, SessionStore, UserStore};
use crate::types::{ProviderName, Role, RoleDraft, RoleId, RoleValue, Session, User, UserId, Username};

/// In-memory store implementation for tests and demos.
///
/// Clones share state. Outages and slow responses can be simulated with
/// [`MemoryStore::set_unavailable`] and [`MemoryStore::set_latency`].
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    users: RwLock<HashMap<UserId, User>>,
    roles: RwLock<BTreeMap<RoleId, Role>>,
    next_role_id: AtomicU64,
    sessions: RwLock<HashMap<UserId, Session>>,
    providers: RwLock<HashMap<ProviderName, ProviderConfig>>,
    rules: RwLock<HashMap<RoleValue, Vec<Rule>>>,
    unavailable: AtomicBool,
    policy_writes_failing: AtomicBool,
    latency: RwLock<Duration>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a user.
    pub fn add_user(&self, user: User) {
        self.inner.users.write().insert(user.id, user);
    }

    /// Adds or replaces a role, keeping generated ids above it.
    pub fn add_role(&self, role: Role) {
        self.inner
            .next_role_id
            .fetch_max(role.id.get(), Ordering::SeqCst);
        self.inner.roles.write().insert(role.id, role);
    }

    /// Adds or replaces an OAuth provider.
    pub fn add_provider(&self, provider: ProviderConfig) {
        self.inner
            .providers
            .write()
            .insert(provider.name.clone(), provider);
    }

    /// Seeds policy rules for a role.
    pub fn add_rules(&self, role: RoleValue, rules: impl IntoIterator<Item = Rule>) {
        self.inner.rules.write().entry(role).or_default().extend(rules);
    }

    /// Makes every store call fail until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Makes policy replacement fail without touching stored rules.
    pub fn set_policy_writes_failing(&self, failing: bool) {
        self.inner
            .policy_writes_failing
            .store(failing, Ordering::SeqCst);
    }

    /// Delays every store call.
    pub fn set_latency(&self, latency: Duration) {
        *self.inner.latency.write() = latency;
    }

    async fn round_trip(&self) -> std::result::Result<(), StoreError> {
        let latency = *self.inner.latency.read();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err("memory store unavailable".into());
        }
        Ok(())
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn find_user_by_username(
        &self,
        username: &Username,
    ) -> std::result::Result<Option<User>, StoreError> {
        self.round_trip().await?;
        let guard = self.inner.users.read();
        Ok(guard.values().find(|user| &user.username == username).cloned())
    }

    async fn find_user_by_id(&self, id: UserId) -> std::result::Result<Option<User>, StoreError> {
        self.round_trip().await?;
        Ok(self.inner.users.read().get(&id).cloned())
    }

    async fn find_user_by_federated_handle(
        &self,
        provider: &ProviderName,
        handle: &str,
    ) -> std::result::Result<Option<User>, StoreError> {
        self.round_trip().await?;
        let guard = self.inner.users.read();
        Ok(guard
            .values()
            .find(|user| {
                user.federated_handles
                    .get(provider)
                    .is_some_and(|stored| stored == handle)
            })
            .cloned())
    }

    async fn count_users_with_role(&self, role: RoleId) -> std::result::Result<u64, StoreError> {
        self.round_trip().await?;
        let guard = self.inner.users.read();
        Ok(guard.values().filter(|user| user.role_id == role).count() as u64)
    }
}

#[async_trait]
impl RoleStore for MemoryStore {
    async fn find_role_by_id(&self, id: RoleId) -> std::result::Result<Option<Role>, StoreError> {
        self.round_trip().await?;
        Ok(self.inner.roles.read().get(&id).cloned())
    }

    async fn list_roles(&self) -> std::result::Result<Vec<Role>, StoreError> {
        self.round_trip().await?;
        Ok(self.inner.roles.read().values().cloned().collect())
    }

    async fn create_role(&self, draft: RoleDraft) -> std::result::Result<Role, StoreError> {
        self.round_trip().await?;
        let mut guard = self.inner.roles.write();
        if guard.values().any(|role| role.value == draft.value) {
            return Err(format!("role value {} already exists", draft.value).into());
        }
        let id = RoleId::new(self.inner.next_role_id.fetch_add(1, Ordering::SeqCst) + 1);
        let role = draft.into_role(id);
        guard.insert(id, role.clone());
        Ok(role)
    }

    async fn update_role(&self, role: &Role) -> std::result::Result<bool, StoreError> {
        self.round_trip().await?;
        let mut guard = self.inner.roles.write();
        match guard.get_mut(&role.id) {
            Some(existing) => {
                *existing = role.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_role(&self, id: RoleId) -> std::result::Result<bool, StoreError> {
        self.round_trip().await?;
        Ok(self.inner.roles.write().remove(&id).is_some())
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn find_session_by_user_id(
        &self,
        user: UserId,
    ) -> std::result::Result<Option<Session>, StoreError> {
        self.round_trip().await?;
        Ok(self.inner.sessions.read().get(&user).cloned())
    }

    async fn replace_session_by_user_id(
        &self,
        session: &Session,
    ) -> std::result::Result<(), StoreError> {
        self.round_trip().await?;
        self.inner
            .sessions
            .write()
            .insert(session.user_id, session.clone());
        Ok(())
    }

    async fn delete_session_by_user_id(
        &self,
        user: UserId,
    ) -> std::result::Result<bool, StoreError> {
        self.round_trip().await?;
        Ok(self.inner.sessions.write().remove(&user).is_some())
    }

    async fn list_sessions(&self) -> std::result::Result<Vec<Session>, StoreError> {
        self.round_trip().await?;
        let mut sessions: Vec<Session> = self.inner.sessions.read().values().cloned().collect();
        sessions.sort_by_key(|session| session.user_id);
        Ok(sessions)
    }
}

#[async_trait]
impl ProviderStore for MemoryStore {
    async fn find_provider_by_name(
        &self,
        name: &ProviderName,
    ) -> std::result::Result<Option<ProviderConfig>, StoreError> {
        self.round_trip().await?;
        Ok(self.inner.providers.read().get(name).cloned())
    }
}

#[async_trait]
impl PolicyStore for MemoryStore {
    async fn replace_policy_rules_for_subject(
        &self,
        subject: &RoleValue,
        rules: &[Rule],
    ) -> std::result::Result<(), StoreError> {
        self.round_trip().await?;
        if self.inner.policy_writes_failing.load(Ordering::SeqCst) {
            return Err(format!("policy write for {subject} rejected").into());
        }
        self.inner
            .rules
            .write()
            .insert(subject.clone(), rules.to_vec());
        Ok(())
    }

    async fn query_policy_rules_for_subject(
        &self,
        subject: &RoleValue,
    ) -> std::result::Result<Vec<Rule>, StoreError> {
        self.round_trip().await?;
        Ok(self
            .inner
            .rules
            .read()
            .get(subject)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use futures::executor::block_on;

    use super::*;
    use crate::types::Status;

    fn draft(value: &str) -> RoleDraft {
        RoleDraft {
            name: value.to_string(),
            value: RoleValue::new(value).unwrap(),
            default_router: String::new(),
            status: Status::Active,
            remark: String::new(),
            order_no: 0,
        }
    }

    #[test]
    fn create_role_should_allocate_ids_after_seeded_roles() {
        let store = MemoryStore::new();
        store.add_role(draft("admin").into_role(RoleId::new(7)));

        let created = block_on(store.create_role(draft("viewer"))).unwrap();
        assert_eq!(created.id, RoleId::new(8));
    }

    #[test]
    fn create_role_should_reject_duplicate_value() {
        let store = MemoryStore::new();
        block_on(store.create_role(draft("viewer"))).unwrap();
        assert!(block_on(store.create_role(draft("viewer"))).is_err());
    }

    #[test]
    fn unavailable_store_should_fail_every_call() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(block_on(store.list_roles()).is_err());
        assert!(block_on(store.find_session_by_user_id(UserId::new(1))).is_err());

        store.set_unavailable(false);
        assert!(block_on(store.list_roles()).is_ok());
    }

    #[test]
    fn failing_policy_write_should_keep_stored_rules() {
        let store = MemoryStore::new();
        let role = RoleValue::new("viewer").unwrap();
        let rule = Rule::new("/api/admin/role/list", "GET").unwrap();
        store.add_rules(role.clone(), [rule.clone()]);
        store.set_policy_writes_failing(true);

        assert!(block_on(store.replace_policy_rules_for_subject(&role, &[])).is_err());
        assert_eq!(
            block_on(store.query_policy_rules_for_subject(&role)).unwrap(),
            vec![rule]
        );
    }
}
