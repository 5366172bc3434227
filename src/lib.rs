//! Authentication and role-based authorization core for HTTP admin backends.
//!
//! The crate verifies local passwords and OAuth2 federated logins, keeps at
//! most one live session per user, caches roles, and evaluates
//! `(role, path, method)` allow rules. [`Gatekeeper`] ties these together:
//! every request either yields a [`Principal`] or a [`Rejection`] that fails
//! closed on store errors and timeouts.
//!
//! # Examples
//!
//! Authorizing a request against the in-memory store (enable `memory-store`):
//! ```no_run
//! # #[cfg(feature = "memory-store")]
//! # async fn demo() -> rs_gatekeeper::Result<()> {
//! use rs_gatekeeper::{GatekeeperBuilder, GatekeeperConfig, MemoryStore};
//!
//! let mut config = GatekeeperConfig::default();
//! config.auth.access_secret = "change-me".to_string();
//! let gatekeeper = GatekeeperBuilder::new(MemoryStore::new())
//!     .config(config)
//!     .build()
//!     .await?;
//! let decision = gatekeeper
//!     .authorize(Some("Bearer <token>"), "/api/admin/role/list", "GET")
//!     .await;
//! assert!(decision.is_err());
//! # Ok(())
//! # }
//! ```
//!
//! Gating an axum router (enable `axum`):
//! ```no_run
//! # #[cfg(all(feature = "axum", feature = "memory-store"))]
//! # fn demo(gatekeeper: std::sync::Arc<rs_gatekeeper::Gatekeeper<rs_gatekeeper::MemoryStore>>) {
//! use axum::{Router, routing::get};
//!
//! let protected = Router::new().route("/api/admin/role/list", get(|| async { "[]" }));
//! let app = rs_gatekeeper::axum::routes(gatekeeper, protected);
//! # let _ = app;
//! # }
//! ```
#![forbid(unsafe_code)]

mod cache;
mod captcha;
mod config;
mod credential;
mod error;
mod gatekeeper;
mod oauth;
mod password;
mod policy;
mod role_cache;
mod session;
mod store;
mod token;
mod types;

#[cfg(feature = "memory-store")]
mod memory_store;

#[cfg(feature = "axum")]
pub mod axum;

pub use crate::cache::TtlCache;
pub use crate::captcha::{CaptchaChallenge, CaptchaStore};
pub use crate::config::{
    AuthSettings, CacheSettings, CaptchaSettings, GatekeeperConfig, OAuthSettings, SeedSettings,
};
pub use crate::credential::{CredentialVerifier, VerifiedIdentity};
pub use crate::error::{Error, Result, StoreError};
pub use crate::gatekeeper::{
    AuthStep, Gatekeeper, GatekeeperBuilder, IssuedToken, LoginRequest, Principal, Rejection,
    SessionPrincipal,
};
pub use crate::oauth::{
    AuthStyle, FederatedIdentity, IdentityKind, LoginVariant, OAuth, OAuthState, ProviderConfig,
};
pub use crate::password::{Password, hash_password, verify_password};
pub use crate::policy::{PolicyEngine, Rule};
pub use crate::role_cache::{RoleAdmin, RoleCache};
pub use crate::session::{MIN_SESSION_LIFETIME_MS, SessionFilter, SessionView, Sessions};
pub use crate::store::{PolicyStore, ProviderStore, RoleStore, SessionStore, Store, UserStore};
pub use crate::token::{SessionClaims, TokenCodec, bearer_token};
pub use crate::types::{
    Page, ProviderName, Role, RoleDraft, RoleId, RoleValue, Session, SessionSource, Status, User,
    UserId, Username,
};

#[cfg(feature = "memory-store")]
pub use crate::memory_store::MemoryStore;
