//! OAuth2 federation against configured providers.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use rand::distributions::Alphanumeric;
use reqwest::header::ACCEPT;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::cache::TtlCache;
use crate::error::{Error, Result};
use crate::store::Store;
use crate::types::ProviderName;

const STATE_NONCE_LEN: usize = 32;
const CORP_TOKEN_MARGIN: Duration = Duration::from_secs(60);

/// How a provider expects the code exchange and user info calls.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthStyle {
    /// Client credentials in the form body; user info URL gets the access
    /// token appended.
    #[default]
    InParams,
    /// Client credentials via HTTP Basic; user info fetched with
    /// `Authorization: Bearer`.
    InHeader,
    /// Corporate directory: the code resolves to an internal user handle
    /// that a second privileged call turns into contact details.
    CorpSso,
}

/// Provider-specific authorization sub-flow.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginVariant {
    /// Scan a QR code on the provider's page.
    #[default]
    #[serde(alias = "QRCode", alias = "qrcode")]
    QrCode,
    /// Already inside the provider's own app.
    #[serde(alias = "Inside")]
    Inside,
    /// App-to-app quick login.
    #[serde(alias = "Quick")]
    Quick,
}

impl FromStr for LoginVariant {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        let normalized: String = value
            .chars()
            .filter(|ch| *ch != '_')
            .map(|ch| ch.to_ascii_lowercase())
            .collect();
        match normalized.as_str() {
            "" | "qrcode" => Ok(Self::QrCode),
            "inside" => Ok(Self::Inside),
            "quick" => Ok(Self::Quick),
            _ => Err(Error::InvalidId(format!("unknown login variant {value:?}"))),
        }
    }
}

/// Stored configuration of one OAuth provider.
#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: ProviderName,
    /// Client id; the agent id for [`AuthStyle::CorpSso`].
    pub client_id: String,
    /// Client secret; the corp secret for [`AuthStyle::CorpSso`].
    pub client_secret: String,
    /// Application id; the corp id for [`AuthStyle::CorpSso`].
    #[serde(default)]
    pub app_id: Option<String>,
    pub auth_url: String,
    /// Authorization URL used by [`LoginVariant::Inside`].
    #[serde(default)]
    pub in_app_auth_url: Option<String>,
    pub token_url: String,
    pub info_url: String,
    /// Second lookup turning an internal handle into contact details.
    #[serde(default)]
    pub directory_url: Option<String>,
    pub redirect_url: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub auth_style: AuthStyle,
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("name", &self.name)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("app_id", &self.app_id)
            .field("auth_url", &self.auth_url)
            .field("token_url", &self.token_url)
            .field("info_url", &self.info_url)
            .field("directory_url", &self.directory_url)
            .field("redirect_url", &self.redirect_url)
            .field("scopes", &self.scopes)
            .field("auth_style", &self.auth_style)
            .finish()
    }
}

/// What the federated identity's credential can be trusted to be.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IdentityKind {
    /// Stable provider-internal handle, matched against stored handles.
    StableHandle,
    /// Display-level username, matched against local usernames.
    Username,
}

/// Identity proven by a provider.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FederatedIdentity {
    pub credential: String,
    pub email: Option<String>,
    pub mobile: Option<String>,
    pub nickname: Option<String>,
    pub picture: Option<String>,
    pub kind: IdentityKind,
}

/// OAuth `state` value in `{nonce}-{provider}` form.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OAuthState {
    nonce: String,
    provider: ProviderName,
}

impl OAuthState {
    /// Creates a fresh state for `provider`.
    pub fn new(provider: ProviderName) -> Self {
        let nonce = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(STATE_NONCE_LEN)
            .map(char::from)
            .collect();
        Self { nonce, provider }
    }

    /// Splits on the first `-`; both halves must be present.
    pub fn parse(value: &str) -> Result<Self> {
        let (nonce, provider) = value.split_once('-').ok_or(Error::InvalidState)?;
        if nonce.is_empty() || !nonce.chars().all(|ch| ch.is_ascii_alphanumeric()) {
            return Err(Error::InvalidState);
        }
        let provider = ProviderName::new(provider).map_err(|_| Error::InvalidState)?;
        Ok(Self {
            nonce: nonce.to_string(),
            provider,
        })
    }

    /// Returns the provider the state was issued for.
    pub fn provider(&self) -> &ProviderName {
        &self.provider
    }
}

impl fmt::Display for OAuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.nonce, self.provider)
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct ProviderUserInfo {
    #[serde(default)]
    credential: Option<String>,
    #[serde(default, alias = "login")]
    username: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    mobile: Option<String>,
    #[serde(default, alias = "name")]
    nickname: Option<String>,
    #[serde(default, alias = "avatar_url")]
    picture: Option<String>,
}

#[derive(Deserialize)]
struct CorpEnvelope<T> {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
    #[serde(flatten)]
    body: T,
}

#[derive(Deserialize)]
struct CorpToken {
    access_token: Option<String>,
    #[serde(default)]
    expires_in: u64,
}

#[derive(Deserialize)]
struct CorpCodeUser {
    #[serde(default, alias = "UserId")]
    userid: Option<String>,
}

#[derive(Deserialize)]
struct CorpDirectoryUser {
    #[serde(default)]
    userid: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    mobile: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    avatar: Option<String>,
}

/// OAuth2 client over the providers held in the backing store.
pub struct OAuth<S> {
    store: Arc<S>,
    client: reqwest::Client,
    providers: TtlCache<ProviderName, Arc<ProviderConfig>>,
    corp_tokens: TtlCache<ProviderName, String>,
}

impl<S> fmt::Debug for OAuth<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuth")
            .field("cached_providers", &self.providers.len())
            .finish()
    }
}

impl<S> OAuth<S>
where
    S: Store,
{
    /// Creates a client whose provider calls time out after `timeout`.
    pub fn new(
        store: Arc<S>,
        timeout: Duration,
        provider_ttl: Duration,
        capacity: usize,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| Error::Config(format!("http client: {err}")))?;
        Ok(Self {
            store,
            client,
            providers: TtlCache::new(capacity, provider_ttl),
            corp_tokens: TtlCache::new(capacity, provider_ttl),
        })
    }

    /// Returns a provider's configuration, cached after the first lookup.
    pub async fn provider(&self, name: &ProviderName) -> Result<Arc<ProviderConfig>> {
        if let Some(config) = self.providers.get(name) {
            return Ok(config);
        }
        let config = self
            .store
            .find_provider_by_name(name)
            .await?
            .ok_or_else(|| Error::UnknownProvider(name.to_string()))?;
        let config = Arc::new(config);
        self.providers.insert(name.clone(), config.clone());
        Ok(config)
    }

    /// Drops a cached provider configuration after an administrative edit.
    pub fn invalidate_provider(&self, name: &ProviderName) {
        self.providers.remove(name);
        self.corp_tokens.remove(name);
    }

    /// Builds the authorization redirect URL for `state`'s provider.
    pub async fn begin(&self, state: &OAuthState, variant: LoginVariant) -> Result<String> {
        let config = self.provider(state.provider()).await?;
        let state = state.to_string();
        let url = match (config.auth_style, variant) {
            (AuthStyle::CorpSso, LoginVariant::Inside) => {
                let base = config
                    .in_app_auth_url
                    .as_deref()
                    .unwrap_or(config.auth_url.as_str());
                let mut url = with_query(
                    base,
                    &[
                        ("appid", config.app_id.as_deref().unwrap_or_default()),
                        ("redirect_uri", config.redirect_url.as_str()),
                        ("response_type", "code"),
                        ("scope", "snsapi_base"),
                        ("state", state.as_str()),
                        ("agentid", config.client_id.as_str()),
                    ],
                );
                url.push_str("#wechat_redirect");
                url
            }
            (AuthStyle::CorpSso, _) => {
                let mut url = authorization_url(&config, &state);
                append_query(
                    &mut url,
                    &[
                        ("login_type", "CorpApp"),
                        ("appid", config.app_id.as_deref().unwrap_or_default()),
                        ("agentid", config.client_id.as_str()),
                    ],
                );
                url
            }
            _ => authorization_url(&config, &state),
        };
        tracing::debug!(provider = %config.name, ?variant, "oauth redirect built");
        Ok(url)
    }

    /// Exchanges an authorization code for the provider's view of the user.
    ///
    /// Any transport, status or decoding failure is [`Error::ExchangeFailed`].
    /// Nothing is retried.
    pub async fn complete(
        &self,
        provider: &ProviderName,
        code: &str,
        state: &str,
    ) -> Result<FederatedIdentity> {
        let parsed = OAuthState::parse(state)?;
        if parsed.provider() != provider {
            return Err(Error::InvalidState);
        }
        if code.is_empty() {
            return Err(Error::ExchangeFailed("empty authorization code".to_string()));
        }
        let config = self.provider(provider).await?;
        let result = match config.auth_style {
            AuthStyle::CorpSso => self.complete_corp(&config, code).await,
            _ => self.complete_standard(&config, code).await,
        };
        if let Err(err) = &result {
            tracing::warn!(provider = %provider, error = %err, "oauth exchange failed");
        }
        result
    }

    async fn complete_standard(
        &self,
        config: &ProviderConfig,
        code: &str,
    ) -> Result<FederatedIdentity> {
        let mut form = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", config.redirect_url.as_str()),
        ];
        let mut request = self.client.post(&config.token_url).header(ACCEPT, "application/json");
        match config.auth_style {
            AuthStyle::InHeader => {
                request = request.basic_auth(&config.client_id, Some(&config.client_secret));
            }
            _ => {
                form.push(("client_id", config.client_id.as_str()));
                form.push(("client_secret", config.client_secret.as_str()));
            }
        }
        let token: TokenResponse = send_json(request.form(&form), "token exchange").await?;

        let request = match config.auth_style {
            AuthStyle::InHeader => self
                .client
                .get(&config.info_url)
                .bearer_auth(&token.access_token),
            _ => self.client.get(format!(
                "{}{}",
                config.info_url,
                urlencoding::encode(&token.access_token)
            )),
        };
        let info: ProviderUserInfo =
            send_json(request.header(ACCEPT, "application/json"), "user info").await?;

        let credential = info
            .credential
            .or_else(|| info.username.clone())
            .or_else(|| info.email.clone())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| Error::ExchangeFailed("user info carries no identifier".to_string()))?;
        Ok(FederatedIdentity {
            credential,
            email: info.email,
            mobile: info.mobile,
            nickname: info.nickname,
            picture: info.picture,
            kind: IdentityKind::Username,
        })
    }

    async fn complete_corp(&self, config: &ProviderConfig, code: &str) -> Result<FederatedIdentity> {
        let access_token = self.corp_access_token(config).await?;

        let request = self.client.get(&config.info_url).query(&[
            ("access_token", access_token.as_str()),
            ("code", code),
        ]);
        let resolved: CorpEnvelope<CorpCodeUser> = send_json(request, "code resolution").await?;
        let handle = corp_body(resolved, "code resolution")?
            .userid
            .filter(|value| !value.is_empty())
            .ok_or_else(|| Error::ExchangeFailed("code resolved to no internal user".to_string()))?;

        let directory_url = config
            .directory_url
            .as_deref()
            .ok_or_else(|| Error::ExchangeFailed("provider has no directory url".to_string()))?;
        let request = self.client.get(directory_url).query(&[
            ("access_token", access_token.as_str()),
            ("userid", handle.as_str()),
        ]);
        let directory: CorpEnvelope<CorpDirectoryUser> =
            send_json(request, "directory lookup").await?;
        let user = corp_body(directory, "directory lookup")?;

        Ok(FederatedIdentity {
            credential: user.userid.unwrap_or(handle),
            email: user.email.filter(|value| !value.is_empty()),
            mobile: user.mobile.filter(|value| !value.is_empty()),
            nickname: user.name,
            picture: user.avatar,
            kind: IdentityKind::StableHandle,
        })
    }

    async fn corp_access_token(&self, config: &ProviderConfig) -> Result<String> {
        if let Some(token) = self.corp_tokens.get(&config.name) {
            return Ok(token);
        }
        let request = self.client.get(&config.token_url).query(&[
            ("corpid", config.app_id.as_deref().unwrap_or_default()),
            ("corpsecret", config.client_secret.as_str()),
        ]);
        let response: CorpEnvelope<CorpToken> = send_json(request, "corp token").await?;
        let body = corp_body(response, "corp token")?;
        let token = body
            .access_token
            .filter(|value| !value.is_empty())
            .ok_or_else(|| Error::ExchangeFailed("corp token missing".to_string()))?;
        let ttl = Duration::from_secs(body.expires_in).saturating_sub(CORP_TOKEN_MARGIN);
        self.corp_tokens
            .insert_with_ttl(config.name.clone(), token.clone(), ttl);
        Ok(token)
    }
}

fn authorization_url(config: &ProviderConfig, state: &str) -> String {
    let scope = config.scopes.join(" ");
    let mut pairs = vec![
        ("client_id", config.client_id.as_str()),
        ("redirect_uri", config.redirect_url.as_str()),
        ("response_type", "code"),
    ];
    if !scope.is_empty() {
        pairs.push(("scope", scope.as_str()));
    }
    pairs.push(("state", state));
    with_query(&config.auth_url, &pairs)
}

fn with_query(base: &str, pairs: &[(&str, &str)]) -> String {
    let mut url = base.to_string();
    append_query(&mut url, pairs);
    url
}

fn append_query(url: &mut String, pairs: &[(&str, &str)]) {
    for (key, value) in pairs {
        url.push(if url.contains('?') { '&' } else { '?' });
        url.push_str(key);
        url.push('=');
        url.push_str(&urlencoding::encode(value));
    }
}

async fn send_json<T: DeserializeOwned>(request: reqwest::RequestBuilder, step: &str) -> Result<T> {
    let response = request
        .send()
        .await
        .map_err(|err| Error::ExchangeFailed(format!("{step}: {err}")))?;
    let status = response.status();
    if !status.is_success() {
        return Err(Error::ExchangeFailed(format!("{step}: provider returned {status}")));
    }
    response
        .json::<T>()
        .await
        .map_err(|err| Error::ExchangeFailed(format!("{step}: {err}")))
}

fn corp_body<T>(envelope: CorpEnvelope<T>, step: &str) -> Result<T> {
    if envelope.errcode != 0 {
        return Err(Error::ExchangeFailed(format!(
            "{step}: errcode {} {}",
            envelope.errcode, envelope.errmsg
        )));
    }
    Ok(envelope.body)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(style: AuthStyle) -> ProviderConfig {
        ProviderConfig {
            name: ProviderName::new("corp").unwrap(),
            client_id: "1000002".to_string(),
            client_secret: "secret".to_string(),
            app_id: Some("ww123".to_string()),
            auth_url: "https://sso.example.com/qrConnect".to_string(),
            in_app_auth_url: Some("https://open.example.com/authorize".to_string()),
            token_url: "https://api.example.com/gettoken".to_string(),
            info_url: "https://api.example.com/getuserinfo".to_string(),
            directory_url: Some("https://api.example.com/user/get".to_string()),
            redirect_url: "http://localhost:3100/oauth/login/callback".to_string(),
            scopes: vec!["email".to_string(), "openid".to_string()],
            auth_style: style,
        }
    }

    #[test]
    fn state_should_embed_provider_after_first_dash() {
        let state = OAuthState::new(ProviderName::new("github").unwrap());
        let parsed = OAuthState::parse(&state.to_string()).unwrap();
        assert_eq!(parsed.provider().as_str(), "github");
        assert_eq!(parsed, state);
    }

    #[test]
    fn state_should_keep_dashes_in_provider_name() {
        let parsed = OAuthState::parse("abc123-corp-sso").unwrap();
        assert_eq!(parsed.provider().as_str(), "corp-sso");
    }

    #[test]
    fn state_should_reject_missing_segments() {
        for value in ["", "abc", "abc-", "-github"] {
            assert!(matches!(OAuthState::parse(value), Err(Error::InvalidState)));
        }
    }

    #[test]
    fn login_variant_should_parse_legacy_names() {
        assert_eq!("QRCode".parse::<LoginVariant>().unwrap(), LoginVariant::QrCode);
        assert_eq!("Inside".parse::<LoginVariant>().unwrap(), LoginVariant::Inside);
        assert_eq!("quick".parse::<LoginVariant>().unwrap(), LoginVariant::Quick);
        assert_eq!("".parse::<LoginVariant>().unwrap(), LoginVariant::QrCode);
        assert!("popup".parse::<LoginVariant>().is_err());
    }

    #[test]
    fn authorization_url_should_encode_parameters() {
        let url = authorization_url(&provider(AuthStyle::InHeader), "n0nce-corp");
        assert!(url.starts_with("https://sso.example.com/qrConnect?client_id=1000002"));
        assert!(url.contains("redirect_uri=http%3A%2F%2Flocalhost%3A3100%2Foauth%2Flogin%2Fcallback"));
        assert!(url.contains("scope=email%20openid"));
        assert!(url.ends_with("state=n0nce-corp"));
    }

    #[test]
    fn provider_debug_should_redact_secret() {
        let rendered = format!("{:?}", provider(AuthStyle::CorpSso));
        assert!(!rendered.contains("\"secret\""));
        assert!(rendered.contains("<redacted>"));
    }
}
