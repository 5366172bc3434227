use std::fmt;
use std::time::Duration;

use config::{Config as Cfg, Environment, File, FileFormat};
use serde::Deserialize;

use crate::error::{Error, Result};

/// Runtime settings.
///
/// Loaded from an optional `gatekeeper.{toml,yaml,json}` file, then
/// `GATEKEEPER__SECTION__FIELD` environment variables. Every field has a
/// default.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatekeeperConfig {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub auth: AuthSettings,
    pub captcha: CaptchaSettings,
    pub cache: CacheSettings,
    pub oauth: OAuthSettings,
    pub seed: SeedSettings,
}

impl Default for GatekeeperConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            log_level: "info".to_string(),
            auth: AuthSettings::default(),
            captcha: CaptchaSettings::default(),
            cache: CacheSettings::default(),
            oauth: OAuthSettings::default(),
            seed: SeedSettings::default(),
        }
    }
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    /// Token signing key.
    pub access_secret: String,
    pub access_expire_secs: u64,
    /// How long after login a session may still be renewed.
    pub max_refresh_secs: u64,
    /// Deadline for backing-store calls made while authorizing a request.
    pub request_deadline_ms: u64,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            access_secret: String::new(),
            access_expire_secs: 86_400,
            max_refresh_secs: 3_600,
            request_deadline_ms: 3_000,
        }
    }
}

impl fmt::Debug for AuthSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSettings")
            .field("access_secret", &"<redacted>")
            .field("access_expire_secs", &self.access_expire_secs)
            .field("max_refresh_secs", &self.max_refresh_secs)
            .field("request_deadline_ms", &self.request_deadline_ms)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CaptchaSettings {
    pub enabled: bool,
    pub key_len: usize,
    pub ttl_secs: u64,
    /// Outstanding challenges kept at once, apart from the other caches.
    pub capacity: usize,
    /// Return the answer from the challenge endpoint. Local testing only.
    pub expose_answer: bool,
}

impl Default for CaptchaSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            key_len: 6,
            ttl_secs: 300,
            capacity: 4_096,
            expose_answer: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub role_ttl_secs: u64,
    pub provider_ttl_secs: u64,
    pub capacity: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            role_ttl_secs: 86_400,
            provider_ttl_secs: 86_400,
            capacity: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OAuthSettings {
    pub timeout_ms: u64,
}

impl Default for OAuthSettings {
    fn default() -> Self {
        Self { timeout_ms: 10_000 }
    }
}

/// Initial administrator created by the demo server.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct SeedSettings {
    pub admin_username: String,
    pub admin_password: String,
}

impl Default for SeedSettings {
    fn default() -> Self {
        Self {
            admin_username: "admin".to_string(),
            admin_password: String::new(),
        }
    }
}

impl fmt::Debug for SeedSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeedSettings")
            .field("admin_username", &self.admin_username)
            .field("admin_password", &"<redacted>")
            .finish()
    }
}

impl GatekeeperConfig {
    /// Loads `.env`, the optional config file and the environment.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        Cfg::builder()
            .add_source(File::with_name("gatekeeper").required(false))
            .add_source(Environment::with_prefix("GATEKEEPER").separator("__"))
            .build()
            .and_then(|config| config.try_deserialize())
            .map_err(|err| Error::Config(err.to_string()))
    }

    /// Parses settings from TOML text.
    pub fn from_toml(text: &str) -> Result<Self> {
        Cfg::builder()
            .add_source(File::from_str(text, FileFormat::Toml))
            .build()
            .and_then(|config| config.try_deserialize())
            .map_err(|err| Error::Config(err.to_string()))
    }

    /// Window after login in which a session may be renewed.
    pub fn max_refresh(&self) -> Duration {
        Duration::from_secs(self.auth.max_refresh_secs)
    }

    /// Lifetime of a new or renewed session.
    pub fn access_expire(&self) -> Duration {
        Duration::from_secs(self.auth.access_expire_secs)
    }

    /// Deadline for store calls made while authorizing.
    pub fn request_deadline(&self) -> Duration {
        Duration::from_millis(self.auth.request_deadline_ms)
    }

    /// Role cache entry lifetime.
    pub fn role_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.role_ttl_secs)
    }

    /// Provider config cache entry lifetime.
    pub fn provider_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.provider_ttl_secs)
    }

    /// How long a captcha challenge stays answerable.
    pub fn captcha_ttl(&self) -> Duration {
        Duration::from_secs(self.captcha.ttl_secs)
    }

    /// Timeout for each call to an OAuth provider.
    pub fn oauth_timeout(&self) -> Duration {
        Duration::from_millis(self.oauth.timeout_ms)
    }

    /// `host:port` the demo server listens on.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_source_should_yield_defaults() {
        let config = GatekeeperConfig::from_toml("").unwrap();
        assert_eq!(config.bind_addr(), "0.0.0.0:8080");
        assert!(config.captcha.enabled);
        assert_eq!(config.captcha_ttl(), Duration::from_secs(300));
        assert_eq!(config.role_ttl(), Duration::from_secs(86_400));
        assert_eq!(config.request_deadline(), Duration::from_millis(3_000));
        assert_eq!(config.max_refresh(), Duration::from_secs(3_600));
    }

    #[test]
    fn sections_should_override_defaults() {
        let config = GatekeeperConfig::from_toml(
            r#"
            port = 9000
            [auth]
            access_secret = "s3cret"
            access_expire_secs = 600
            [captcha]
            enabled = false
            capacity = 64
            [cache]
            capacity = 16
            "#,
        )
        .unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.access_expire(), Duration::from_secs(600));
        assert!(!config.captcha.enabled);
        assert_eq!(config.captcha.key_len, 6);
        assert_eq!(config.captcha.capacity, 64);
        assert_eq!(config.cache.capacity, 16);
    }

    #[test]
    fn debug_should_redact_secrets() {
        let config = GatekeeperConfig::from_toml("[auth]\naccess_secret = \"s3cret\"").unwrap();
        assert!(!format!("{config:?}").contains("s3cret"));
    }
}
