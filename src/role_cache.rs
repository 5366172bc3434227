use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::cache::TtlCache;
use crate::error::{Error, Result};
use crate::policy::PolicyEngine;
use crate::store::Store;
use crate::types::{Page, Role, RoleDraft, RoleId, Status};

/// Read-through cache of roles by id.
///
/// A load that started before an [`RoleCache::invalidate`] never lands in
/// the cache, so readers after an invalidation see the store's current row.
/// Misses are not cached.
pub struct RoleCache<S> {
    store: Arc<S>,
    cache: TtlCache<RoleId, Arc<Role>>,
    epoch: AtomicU64,
}

impl<S> fmt::Debug for RoleCache<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoleCache")
            .field("cached", &self.cache.len())
            .field("epoch", &self.epoch.load(Ordering::Relaxed))
            .finish()
    }
}

impl<S> RoleCache<S>
where
    S: Store,
{
    /// Creates a new role cache holding up to `capacity` roles for `ttl`.
    pub fn new(store: Arc<S>, capacity: usize, ttl: Duration) -> Self {
        Self {
            store,
            cache: TtlCache::new(capacity, ttl),
            epoch: AtomicU64::new(0),
        }
    }

    /// Returns the role, loading it on a miss. `None` when the store has no
    /// such role.
    pub async fn get(&self, id: RoleId) -> Result<Option<Arc<Role>>> {
        if let Some(role) = self.cache.get(&id) {
            return Ok(Some(role));
        }

        let epoch = self.epoch.load(Ordering::SeqCst);
        let Some(role) = self.store.find_role_by_id(id).await? else {
            return Ok(None);
        };
        let role = Arc::new(role);
        let ttl = self.cache.default_ttl();
        let stored = self.cache.insert_when(id, role.clone(), ttl, || {
            self.epoch.load(Ordering::SeqCst) == epoch
        });
        if !stored {
            tracing::debug!(role_id = %id, "role load raced an invalidation, not cached");
        }
        Ok(Some(role))
    }

    /// Drops the cached role and fences out loads already in flight.
    pub fn invalidate(&self, id: RoleId) {
        self.cache.remove_with(&id, || {
            self.epoch.fetch_add(1, Ordering::SeqCst);
        });
    }
}

/// Role mutations. Each one invalidates the [`RoleCache`] before returning.
///
/// A role's `value` names its policy subject and never changes; deleting a
/// role clears its rules first, so a later role reusing the value starts
/// with none.
pub struct RoleAdmin<S> {
    store: Arc<S>,
    cache: Arc<RoleCache<S>>,
    policy: Arc<PolicyEngine<S>>,
}

impl<S> fmt::Debug for RoleAdmin<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoleAdmin").finish_non_exhaustive()
    }
}

impl<S> RoleAdmin<S>
where
    S: Store,
{
    /// Creates a new role administrator over the shared cache and policy.
    pub fn new(store: Arc<S>, cache: Arc<RoleCache<S>>, policy: Arc<PolicyEngine<S>>) -> Self {
        Self {
            store,
            cache,
            policy,
        }
    }

    /// Creates a role. The store assigns the id.
    pub async fn create(&self, draft: RoleDraft) -> Result<Role> {
        let role = self.store.create_role(draft).await?;
        self.cache.invalidate(role.id);
        tracing::info!(role_id = %role.id, role = %role.value, "role created");
        Ok(role)
    }

    /// Overwrites a role's attributes. Changing `value` is refused.
    pub async fn update(&self, role: Role) -> Result<Role> {
        let current = self
            .store
            .find_role_by_id(role.id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("role {}", role.id)))?;
        if current.value != role.value {
            return Err(Error::InvalidId(format!(
                "role {} value {} cannot change to {}",
                role.id, current.value, role.value
            )));
        }

        let updated = self.store.update_role(&role).await;
        self.cache.invalidate(role.id);
        if !updated? {
            return Err(Error::NotFound(format!("role {}", role.id)));
        }
        tracing::info!(role_id = %role.id, role = %role.value, "role updated");
        Ok(role)
    }

    /// Enables or disables a role.
    pub async fn set_status(&self, id: RoleId, status: Status) -> Result<Role> {
        let mut role = self
            .store
            .find_role_by_id(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("role {id}")))?;
        role.status = status;
        self.update(role).await
    }

    /// Deletes a role no user is assigned to, together with its rules.
    pub async fn delete(&self, id: RoleId) -> Result<()> {
        let role = self
            .store
            .find_role_by_id(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("role {id}")))?;
        let assigned = self.store.count_users_with_role(id).await?;
        if assigned > 0 {
            return Err(Error::RoleInUse(id));
        }
        self.policy.replace_rules(&role.value, Vec::new()).await?;

        let deleted = self.store.delete_role(id).await;
        self.cache.invalidate(id);
        if !deleted? {
            return Err(Error::NotFound(format!("role {id}")));
        }
        tracing::info!(role_id = %id, role = %role.value, "role deleted");
        Ok(())
    }

    /// Pages roles ordered by `order_no`, then id.
    pub async fn list(&self, page: u64, page_size: u64) -> Result<Page<Role>> {
        let mut roles = self.store.list_roles().await?;
        roles.sort_by_key(|role| (role.order_no, role.id));
        Ok(Page::slice(roles, page, page_size))
    }
}
