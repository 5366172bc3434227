use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use subtle::ConstantTimeEq;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::cache::TtlCache;
use crate::error::{Error, Result};
use crate::store::Store;
use crate::types::{Page, Session, SessionSource, UserId, Username};

/// Shortest lifetime a new session may be issued with.
pub const MIN_SESSION_LIFETIME_MS: i64 = 5_000;

#[derive(Clone, Debug)]
struct CachedSession {
    token: String,
    expires_at: DateTime<Utc>,
}

impl From<&Session> for CachedSession {
    fn from(session: &Session) -> Self {
        Self {
            token: session.token.clone(),
            expires_at: session.expires_at,
        }
    }
}

/// A user's lock, held while writing or filling that user's session.
///
/// The map entry is removed on release when no other task holds or awaits
/// the same lock.
struct UserLock<'a> {
    locks: &'a DashMap<UserId, Arc<Mutex<()>>>,
    user_id: UserId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for UserLock<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks
            .remove_if(&self.user_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Filter for [`Sessions::list`].
#[derive(Clone, Debug, Default)]
pub struct SessionFilter {
    /// 1-based page number.
    pub page: u64,
    /// Items per page, at least 1.
    pub page_size: u64,
    /// Username substring.
    pub username: Option<String>,
    pub user_id: Option<UserId>,
}

/// Administrative view of a live session. Carries no token.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct SessionView {
    pub user_id: UserId,
    pub username: Option<Username>,
    pub source: SessionSource,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Session store: at most one live session per user.
///
/// Existence checks are served from a cache whose entries never outlive the
/// session they describe. Every write and every cache fill for a user runs
/// under that user's lock, so a replace is never interleaved with a stale
/// fill.
pub struct Sessions<S> {
    store: Arc<S>,
    cache: TtlCache<UserId, CachedSession>,
    locks: DashMap<UserId, Arc<Mutex<()>>>,
}

impl<S> fmt::Debug for Sessions<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sessions")
            .field("cached", &self.cache.len())
            .finish()
    }
}

impl<S> Sessions<S>
where
    S: Store,
{
    /// Creates a new session store caching up to `capacity` sessions.
    pub fn new(store: Arc<S>, capacity: usize) -> Self {
        Self {
            store,
            // Entry TTLs are always the session's remaining lifetime.
            cache: TtlCache::new(capacity, Duration::ZERO),
            locks: DashMap::new(),
        }
    }

    /// Issues a session, replacing any session `user_id` already holds.
    pub async fn issue(
        &self,
        user_id: UserId,
        token: String,
        source: SessionSource,
        expires_at: DateTime<Utc>,
    ) -> Result<Session> {
        let issued_at = Utc::now();
        check_expiry(issued_at, expires_at)?;

        let session = Session {
            user_id,
            token,
            source,
            issued_at,
            expires_at,
        };

        let _lock = self.lock_user(user_id).await;
        self.write(&session).await?;
        tracing::debug!(user_id = %user_id, source = %session.source, "session issued");
        Ok(session)
    }

    /// Moves the expiry of the live session of `user_id` to `expires_at`.
    ///
    /// `token` must still be current. A revoked, expired or superseded
    /// session yields [`Error::SessionExpiredOrMissing`].
    pub async fn renew(
        &self,
        user_id: UserId,
        token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<Session> {
        let now = Utc::now();
        check_expiry(now, expires_at)?;

        let _lock = self.lock_user(user_id).await;
        let mut session = match self.store.find_session_by_user_id(user_id).await? {
            Some(session)
                if !session.is_expired_at(now)
                    && bool::from(session.token.as_bytes().ct_eq(token.as_bytes())) =>
            {
                session
            }
            _ => return Err(Error::SessionExpiredOrMissing),
        };
        session.expires_at = expires_at;
        self.write(&session).await?;
        tracing::debug!(user_id = %user_id, expires_at = %expires_at, "session renewed");
        Ok(session)
    }

    /// Returns whether `user_id` holds a live session.
    pub async fn exists(&self, user_id: UserId) -> Result<bool> {
        Ok(self.lookup(user_id).await?.is_some())
    }

    /// Returns whether `token` is the live session of `user_id`.
    ///
    /// False for a token superseded by a later login.
    pub async fn is_current(&self, user_id: UserId, token: &str) -> Result<bool> {
        Ok(self
            .lookup(user_id)
            .await?
            .is_some_and(|cached| bool::from(cached.token.as_bytes().ct_eq(token.as_bytes()))))
    }

    /// Deletes the session of `user_id`. Revoking a missing session is a no-op.
    pub async fn revoke(&self, user_id: UserId) -> Result<()> {
        let _lock = self.lock_user(user_id).await;
        self.cache.remove(&user_id);
        let deleted = self.store.delete_session_by_user_id(user_id).await?;
        if deleted {
            tracing::info!(user_id = %user_id, "session revoked");
        }
        Ok(())
    }

    /// Lists live sessions; expired ones met on the way are deleted.
    pub async fn list(&self, filter: &SessionFilter) -> Result<Page<SessionView>> {
        let now = Utc::now();
        let mut views = Vec::new();
        for session in self.store.list_sessions().await? {
            if filter.user_id.is_some_and(|user_id| user_id != session.user_id) {
                continue;
            }
            if session.is_expired_at(now) {
                self.purge_if_expired(session.user_id).await?;
                continue;
            }
            let username = self
                .store
                .find_user_by_id(session.user_id)
                .await?
                .map(|user| user.username);
            if let Some(needle) = filter.username.as_deref().filter(|value| !value.is_empty()) {
                let matched = username
                    .as_ref()
                    .is_some_and(|name| name.as_str().contains(needle));
                if !matched {
                    continue;
                }
            }
            views.push(SessionView {
                user_id: session.user_id,
                username,
                source: session.source,
                issued_at: session.issued_at,
                expires_at: session.expires_at,
            });
        }
        Ok(Page::slice(views, filter.page, filter.page_size))
    }

    async fn lookup(&self, user_id: UserId) -> Result<Option<CachedSession>> {
        if let Some(cached) = self.cache.get(&user_id) {
            if cached.expires_at > Utc::now() {
                return Ok(Some(cached));
            }
        }

        let _lock = self.lock_user(user_id).await;
        if let Some(cached) = self.cache.get(&user_id) {
            if cached.expires_at > Utc::now() {
                return Ok(Some(cached));
            }
        }

        match self.store.find_session_by_user_id(user_id).await? {
            Some(session) if session.is_expired_at(Utc::now()) => {
                self.cache.remove(&user_id);
                self.store.delete_session_by_user_id(user_id).await?;
                tracing::debug!(user_id = %user_id, "expired session deleted");
                Ok(None)
            }
            Some(session) => {
                let cached = CachedSession::from(&session);
                self.cache
                    .insert_with_ttl(user_id, cached.clone(), remaining(session.expires_at));
                Ok(Some(cached))
            }
            None => Ok(None),
        }
    }

    async fn purge_if_expired(&self, user_id: UserId) -> Result<()> {
        let _lock = self.lock_user(user_id).await;
        let expired = self
            .store
            .find_session_by_user_id(user_id)
            .await?
            .is_some_and(|session| session.is_expired_at(Utc::now()));
        if expired {
            self.cache.remove(&user_id);
            self.store.delete_session_by_user_id(user_id).await?;
            tracing::debug!(user_id = %user_id, "expired session deleted");
        }
        Ok(())
    }

    /// Writes `session` through to the store, then the cache. Callers hold
    /// the user's lock.
    async fn write(&self, session: &Session) -> Result<()> {
        if let Err(err) = self.store.replace_session_by_user_id(session).await {
            self.cache.remove(&session.user_id);
            return Err(err.into());
        }
        self.cache.insert_with_ttl(
            session.user_id,
            CachedSession::from(session),
            remaining(session.expires_at),
        );
        Ok(())
    }

    async fn lock_user(&self, user_id: UserId) -> UserLock<'_> {
        let mut held = UserLock {
            locks: &self.locks,
            user_id,
            guard: None,
        };
        let lock = self.locks.entry(user_id).or_default().clone();
        held.guard = Some(lock.lock_owned().await);
        held
    }
}

fn check_expiry(now: DateTime<Utc>, expires_at: DateTime<Utc>) -> Result<()> {
    let lifetime = (expires_at - now).num_milliseconds();
    if lifetime < MIN_SESSION_LIFETIME_MS {
        return Err(Error::InvalidExpiry(format!(
            "expiry must be at least {MIN_SESSION_LIFETIME_MS}ms ahead, got {lifetime}ms"
        )));
    }
    Ok(())
}

fn remaining(expires_at: DateTime<Utc>) -> Duration {
    (expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}
