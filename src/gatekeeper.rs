use std::fmt;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};

use crate::captcha::{CaptchaChallenge, CaptchaStore};
use crate::config::GatekeeperConfig;
use crate::credential::{CredentialVerifier, VerifiedIdentity};
use crate::error::{Error, Result};
use crate::oauth::{LoginVariant, OAuth, OAuthState};
use crate::password::Password;
use crate::policy::PolicyEngine;
use crate::role_cache::{RoleAdmin, RoleCache};
use crate::session::Sessions;
use crate::store::Store;
use crate::token::{SessionClaims, TokenCodec, bearer_token};
use crate::types::{ProviderName, RoleId, RoleValue, SessionSource, UserId};

const SESSION_TOKEN_LEN: usize = 32;

/// Stage of request authorization at which a request was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStep {
    /// No usable bearer token.
    Unauthenticated,
    /// Token did not decode to a user and role.
    IdentityResolved,
    /// Session logged out, expired or superseded.
    SessionValidated,
    /// Role missing or disabled.
    RoleValidated,
    /// No rule grants the path and method.
    PolicyChecked,
}

impl AuthStep {
    /// HTTP status for a rejection at this step.
    pub fn status(self) -> u16 {
        match self {
            Self::Unauthenticated | Self::IdentityResolved | Self::SessionValidated => 401,
            Self::RoleValidated | Self::PolicyChecked => 403,
        }
    }
}

/// Request turned away by [`Gatekeeper::authorize`].
///
/// Outages and denials at the same step share a status and message; only
/// [`Rejection::is_outage`] and the logs tell them apart.
#[derive(Debug)]
pub struct Rejection {
    step: AuthStep,
    error: Error,
}

impl Rejection {
    /// Step the request failed at.
    pub fn step(&self) -> AuthStep {
        self.step
    }

    /// 401 or 403.
    pub fn status(&self) -> u16 {
        self.step.status()
    }

    /// Caller-visible message. Never carries the internal reason.
    pub fn message(&self) -> &'static str {
        if self.status() == 401 {
            "unauthorized"
        } else {
            "forbidden"
        }
    }

    /// Internal reason, for logs.
    pub fn error(&self) -> &Error {
        &self.error
    }

    /// True when a store error or timeout, not a denial, turned the request away.
    pub fn is_outage(&self) -> bool {
        self.error.is_outage()
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.step, self.error)
    }
}

/// Caller whose bearer token names its current session.
///
/// Produced by [`Gatekeeper::authenticate`]; role and policy are unchecked.
#[derive(Clone)]
pub struct SessionPrincipal {
    pub user_id: UserId,
    pub role_id: RoleId,
    /// When the session was first established.
    pub issued_at: DateTime<Utc>,
    sid: String,
}

impl fmt::Debug for SessionPrincipal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionPrincipal")
            .field("user_id", &self.user_id)
            .field("role_id", &self.role_id)
            .field("issued_at", &self.issued_at)
            .finish_non_exhaustive()
    }
}

/// Caller admitted by [`Gatekeeper::authorize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: UserId,
    pub role_id: RoleId,
    pub role: RoleValue,
}

/// Local login input.
#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: Password,
    #[serde(default)]
    pub captcha_id: String,
    #[serde(default)]
    pub captcha: String,
}

/// Bearer token handed out by a successful login.
#[derive(Clone, Serialize)]
pub struct IssuedToken {
    pub token: String,
    pub user_id: UserId,
    pub role_id: RoleId,
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for IssuedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedToken")
            .field("token", &"<redacted>")
            .field("user_id", &self.user_id)
            .field("role_id", &self.role_id)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Builder for [`Gatekeeper`].
pub struct GatekeeperBuilder<S> {
    store: Arc<S>,
    config: GatekeeperConfig,
}

impl<S> GatekeeperBuilder<S>
where
    S: Store,
{
    /// Creates a builder that takes ownership of `store`.
    pub fn new(store: S) -> Self {
        Self::from_shared(Arc::new(store))
    }

    /// Starts from a store the caller keeps a handle to.
    pub fn from_shared(store: Arc<S>) -> Self {
        Self {
            store,
            config: GatekeeperConfig::default(),
        }
    }

    /// Replaces the default settings.
    pub fn config(mut self, config: GatekeeperConfig) -> Self {
        self.config = config;
        self
    }

    /// Builds the components and loads every role's policy rules.
    pub async fn build(self) -> Result<Gatekeeper<S>> {
        let Self { store, config } = self;
        let capacity = config.cache.capacity;

        let codec = TokenCodec::new(config.auth.access_secret.as_bytes())?;
        let oauth = OAuth::new(
            store.clone(),
            config.oauth_timeout(),
            config.provider_ttl(),
            capacity,
        )?;
        let roles = Arc::new(RoleCache::new(store.clone(), capacity, config.role_ttl()));
        let policy = Arc::new(PolicyEngine::load(store.clone()).await?);
        let captcha = CaptchaStore::new(
            config.captcha.key_len,
            config.captcha_ttl(),
            config.captcha.capacity,
        );

        Ok(Gatekeeper {
            verifier: CredentialVerifier::new(store.clone()),
            sessions: Sessions::new(store.clone(), capacity),
            role_admin: RoleAdmin::new(store.clone(), roles.clone(), policy.clone()),
            roles,
            oauth,
            policy,
            captcha,
            codec,
            store,
            config,
        })
    }
}

/// Authentication and authorization core.
///
/// Every component is built once and shared by reference; there is no
/// global state.
pub struct Gatekeeper<S> {
    store: Arc<S>,
    verifier: CredentialVerifier<S>,
    oauth: OAuth<S>,
    sessions: Sessions<S>,
    roles: Arc<RoleCache<S>>,
    role_admin: RoleAdmin<S>,
    policy: Arc<PolicyEngine<S>>,
    captcha: CaptchaStore,
    codec: TokenCodec,
    config: GatekeeperConfig,
}

impl<S> fmt::Debug for Gatekeeper<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gatekeeper")
            .field("sessions", &self.sessions)
            .field("roles", &self.roles)
            .field("policy", &self.policy)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S> Gatekeeper<S>
where
    S: Store,
{
    /// Decides whether the bearer of `authorization` may call `method` on
    /// `path`.
    ///
    /// Store lookups run under the configured request deadline. Errors and
    /// timeouts deny the request.
    pub async fn authorize(
        &self,
        authorization: Option<&str>,
        path: &str,
        method: &str,
    ) -> std::result::Result<Principal, Rejection> {
        let session = self.authenticate(authorization).await?;
        let (user_id, role_id) = (session.user_id, session.role_id);

        let role = self
            .within_deadline(self.roles.get(role_id))
            .await
            .map_err(|err| self.reject(AuthStep::RoleValidated, err))?
            .filter(|role| role.status.is_active())
            .ok_or_else(|| {
                self.reject(AuthStep::RoleValidated, Error::RoleInactiveOrMissing(role_id))
            })?;

        if !self.policy.evaluate(&role.value, path, method) {
            return Err(self.reject(
                AuthStep::PolicyChecked,
                Error::PolicyDenied {
                    role: role.value.clone(),
                    path: path.to_string(),
                    method: method.to_string(),
                },
            ));
        }

        Ok(Principal {
            user_id,
            role_id,
            role: role.value.clone(),
        })
    }

    /// Resolves the bearer of `authorization` to its current session.
    ///
    /// Runs the token and session steps of [`Gatekeeper::authorize`] only, so
    /// a caller whose role is disabled or has no rules can still end or renew
    /// its own session.
    pub async fn authenticate(
        &self,
        authorization: Option<&str>,
    ) -> std::result::Result<SessionPrincipal, Rejection> {
        let token = bearer_token(authorization)
            .map_err(|err| self.reject(AuthStep::Unauthenticated, err))?;

        let claims = self
            .codec
            .decode(token)
            .map_err(|err| self.reject(AuthStep::IdentityResolved, err))?;
        let (user_id, role_id) = claims
            .user_id()
            .and_then(|user_id| Ok((user_id, claims.role_id()?)))
            .map_err(|_| self.reject(AuthStep::IdentityResolved, Error::InvalidToken))?;
        let issued_at = DateTime::from_timestamp(claims.iat, 0)
            .ok_or_else(|| self.reject(AuthStep::IdentityResolved, Error::InvalidToken))?;

        let current = self
            .within_deadline(self.sessions.is_current(user_id, &claims.sid))
            .await
            .map_err(|err| self.reject(AuthStep::SessionValidated, err))?;
        if !current {
            return Err(self.reject(AuthStep::SessionValidated, Error::SessionExpiredOrMissing));
        }

        Ok(SessionPrincipal {
            user_id,
            role_id,
            issued_at,
            sid: claims.sid,
        })
    }

    /// Creates a captcha challenge for the local login form.
    pub fn captcha_challenge(&self) -> CaptchaChallenge {
        self.captcha.generate()
    }

    /// Local login. The captcha is checked first and consumed either way.
    pub async fn login(&self, request: &LoginRequest) -> Result<IssuedToken> {
        if self.config.captcha.enabled
            && !self.captcha.verify(&request.captcha_id, &request.captcha)
        {
            tracing::info!(decision = "deny", "login captcha rejected");
            return Err(Error::CaptchaInvalid);
        }

        let identity = match self
            .verifier
            .verify_local(&request.username, &request.password)
            .await
        {
            Ok(identity) => identity,
            Err(err) => {
                tracing::info!(decision = "deny", error = %err, "local login rejected");
                return Err(err);
            }
        };
        self.establish(&identity, SessionSource::Local).await
    }

    /// Starts a federated login and returns the provider redirect URL.
    pub async fn begin_oauth(&self, provider: &str, variant: LoginVariant) -> Result<String> {
        let provider = ProviderName::new(provider)
            .map_err(|_| Error::UnknownProvider(provider.to_string()))?;
        let state = OAuthState::new(provider);
        self.oauth.begin(&state, variant).await
    }

    /// Completes a federated login from the provider callback.
    pub async fn oauth_callback(&self, code: &str, state: &str) -> Result<IssuedToken> {
        let provider = OAuthState::parse(state)?.provider().clone();
        let identity = self.oauth.complete(&provider, code, state).await?;
        let verified = match self
            .verifier
            .resolve_federated_user(&provider, &identity)
            .await
        {
            Ok(verified) => verified,
            Err(err) => {
                tracing::info!(decision = "deny", provider = %provider, error = %err, "federated login rejected");
                return Err(err);
            }
        };
        self.establish(&verified, SessionSource::OAuth(provider)).await
    }

    /// Revokes the session of `user_id`.
    pub async fn logout(&self, user_id: UserId) -> Result<()> {
        self.sessions.revoke(user_id).await
    }

    /// Renews the caller's session for another full lifetime and signs a
    /// fresh token for it.
    ///
    /// Refused once the session is older than `auth.max_refresh_secs`, or
    /// when the caller's role is missing or disabled.
    pub async fn refresh(&self, session: &SessionPrincipal) -> Result<IssuedToken> {
        let active = self
            .within_deadline(self.roles.get(session.role_id))
            .await?
            .is_some_and(|role| role.status.is_active());
        if !active {
            return Err(Error::RoleInactiveOrMissing(session.role_id));
        }

        let now = Utc::now();
        let max_refresh = TimeDelta::from_std(self.config.max_refresh())
            .map_err(|_| Error::Config("max_refresh_secs out of range".to_string()))?;
        if now - session.issued_at > max_refresh {
            tracing::info!(decision = "deny", user_id = %session.user_id, "session too old to refresh");
            return Err(Error::SessionExpiredOrMissing);
        }

        let renewed = self
            .sessions
            .renew(session.user_id, &session.sid, now + self.lifetime()?)
            .await?;
        let claims = SessionClaims::new(
            session.user_id,
            session.role_id,
            renewed.token.as_str(),
            &renewed.source,
            renewed.issued_at,
            renewed.expires_at,
        );
        let token = self.codec.encode(&claims)?;

        tracing::info!(user_id = %session.user_id, expires_at = %renewed.expires_at, "session refreshed");
        Ok(IssuedToken {
            token,
            user_id: session.user_id,
            role_id: session.role_id,
            expires_at: renewed.expires_at,
        })
    }

    /// Issues a session for a verified identity and signs its bearer token.
    pub async fn establish(
        &self,
        identity: &VerifiedIdentity,
        source: SessionSource,
    ) -> Result<IssuedToken> {
        let lifetime = self.lifetime()?;
        let sid: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(SESSION_TOKEN_LEN)
            .map(char::from)
            .collect();

        let session = self
            .sessions
            .issue(identity.user_id, sid, source, Utc::now() + lifetime)
            .await?;
        let claims = SessionClaims::new(
            identity.user_id,
            identity.role_id,
            session.token.as_str(),
            &session.source,
            session.issued_at,
            session.expires_at,
        );
        let token = self.codec.encode(&claims)?;

        tracing::info!(
            user_id = %identity.user_id,
            role_id = %identity.role_id,
            source = %session.source,
            "session established"
        );
        Ok(IssuedToken {
            token,
            user_id: identity.user_id,
            role_id: identity.role_id,
            expires_at: session.expires_at,
        })
    }

    /// Returns the backing store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Returns the session store.
    pub fn sessions(&self) -> &Sessions<S> {
        &self.sessions
    }

    /// Returns the role cache.
    pub fn roles(&self) -> &Arc<RoleCache<S>> {
        &self.roles
    }

    /// Returns the role administrator.
    pub fn role_admin(&self) -> &RoleAdmin<S> {
        &self.role_admin
    }

    /// Returns the policy engine.
    pub fn policy(&self) -> &PolicyEngine<S> {
        &self.policy
    }

    /// Returns the captcha store.
    pub fn captcha(&self) -> &CaptchaStore {
        &self.captcha
    }

    /// Returns the OAuth client.
    pub fn oauth(&self) -> &OAuth<S> {
        &self.oauth
    }

    /// Returns the settings the gatekeeper was built with.
    pub fn config(&self) -> &GatekeeperConfig {
        &self.config
    }

    fn lifetime(&self) -> Result<TimeDelta> {
        TimeDelta::from_std(self.config.access_expire())
            .map_err(|_| Error::Config("access_expire_secs out of range".to_string()))
    }

    async fn within_deadline<T>(&self, future: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.config.request_deadline(), future)
            .await
            .unwrap_or_else(|_| Err(Error::deadline()))
    }

    fn reject(&self, step: AuthStep, error: Error) -> Rejection {
        if error.is_outage() {
            tracing::error!(outage = true, ?step, error = %error, "authorization failed closed");
        } else {
            tracing::info!(decision = "deny", ?step, reason = %error, "request denied");
        }
        Rejection { step, error }
    }
}
