//! Axum integration: the gating layer and the login endpoints.

use std::future::poll_fn;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::gatekeeper::{Gatekeeper, IssuedToken, LoginRequest, Rejection, SessionPrincipal};
use crate::oauth::LoginVariant;
use crate::store::Store;

use ::axum::Router;
use ::axum::body::Body;
use ::axum::extract::{Extension, Json, Query, State};
use ::axum::response::{IntoResponse, Response};
use ::axum::routing::{get, post};
use ::http::header::AUTHORIZATION;
use ::http::{Request, StatusCode};
use ::tower::{Layer, Service};

/// Caller-visible rejection body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub code: u16,
    pub message: String,
}

fn error_response(status: u16, message: &str) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = ErrorBody {
        code: status.as_u16(),
        message: message.to_string(),
    };
    (status, Json(body)).into_response()
}

impl Error {
    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        if self.is_outage() {
            tracing::error!(outage = true, error = %self, "request failed");
        }
        error_response(self.code(), self.public_message())
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        error_response(self.status(), self.message())
    }
}

/// What a [`GatekeeperLayer`] checks before calling the inner service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// Every step, through [`Gatekeeper::authorize`]. Inserts a
    /// [`Principal`](crate::Principal).
    Authorize,
    /// Token and session only, through [`Gatekeeper::authenticate`]. Inserts
    /// a [`SessionPrincipal`].
    Authenticate,
}

/// Middleware layer that gates requests through the [`Gatekeeper`].
pub struct GatekeeperLayer<S> {
    gatekeeper: Arc<Gatekeeper<S>>,
    gate: Gate,
}

impl<S> GatekeeperLayer<S> {
    /// Creates a new layer that authorizes every request.
    pub fn new(gatekeeper: Arc<Gatekeeper<S>>) -> Self {
        Self {
            gatekeeper,
            gate: Gate::Authorize,
        }
    }

    /// Creates a new layer that only requires a current session.
    pub fn authenticate_only(gatekeeper: Arc<Gatekeeper<S>>) -> Self {
        Self {
            gatekeeper,
            gate: Gate::Authenticate,
        }
    }
}

impl<S> Clone for GatekeeperLayer<S> {
    fn clone(&self) -> Self {
        Self {
            gatekeeper: self.gatekeeper.clone(),
            gate: self.gate,
        }
    }
}

impl<S, Inner> Layer<Inner> for GatekeeperLayer<S>
where
    S: Store,
{
    type Service = GatekeeperService<Inner, S>;

    fn layer(&self, inner: Inner) -> Self::Service {
        GatekeeperService {
            inner,
            gatekeeper: self.gatekeeper.clone(),
            gate: self.gate,
        }
    }
}

/// Middleware service produced by [`GatekeeperLayer`].
pub struct GatekeeperService<Inner, S> {
    inner: Inner,
    gatekeeper: Arc<Gatekeeper<S>>,
    gate: Gate,
}

impl<Inner: Clone, S> Clone for GatekeeperService<Inner, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            gatekeeper: self.gatekeeper.clone(),
            gate: self.gate,
        }
    }
}

impl<Inner, S> Service<Request<Body>> for GatekeeperService<Inner, S>
where
    Inner: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    Inner::Future: Send + 'static,
    S: Store + 'static,
{
    type Response = Response;
    type Error = Inner::Error;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let mut inner = self.inner.clone();
        let gatekeeper = self.gatekeeper.clone();
        let gate = self.gate;

        Box::pin(async move {
            let authorization = req
                .headers()
                .get(AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);

            let admitted = match gate {
                Gate::Authorize => {
                    let path = req.uri().path().to_string();
                    let method = req.method().as_str().to_string();
                    gatekeeper
                        .authorize(authorization.as_deref(), &path, &method)
                        .await
                        .map(|principal| {
                            req.extensions_mut().insert(principal);
                        })
                }
                Gate::Authenticate => gatekeeper
                    .authenticate(authorization.as_deref())
                    .await
                    .map(|session| {
                        req.extensions_mut().insert(session);
                    }),
            };

            match admitted {
                Ok(()) => {
                    poll_fn(|cx| inner.poll_ready(cx)).await?;
                    inner.call(req).await
                }
                Err(rejection) => Ok(rejection.into_response()),
            }
        })
    }
}

/// Body returned by the login and callback endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBody {
    pub code: u16,
    pub token: String,
    /// Unix seconds.
    pub expire: i64,
}

impl From<IssuedToken> for TokenBody {
    fn from(issued: IssuedToken) -> Self {
        Self {
            code: 0,
            token: issued.token,
            expire: issued.expires_at.timestamp(),
        }
    }
}

/// Body of `GET /api/captcha`. `answer` is only set when exposing answers is configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptchaBody {
    pub captcha_id: String,
    pub answer_len: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
}

/// Body of `POST /api/oauth/login`.
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthLoginBody {
    pub provider: String,
    #[serde(default)]
    pub login_type: String,
}

/// Provider URL to send the browser to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedirectBody {
    pub url: String,
}

/// Query string of `GET /api/oauth/callback`.
#[derive(Debug, Clone, Deserialize)]
pub struct CallbackQuery {
    pub code: String,
    pub state: String,
}

/// Bare success body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OkBody {
    pub code: u16,
}

async fn captcha<S: Store + 'static>(
    State(gatekeeper): State<Arc<Gatekeeper<S>>>,
) -> Json<CaptchaBody> {
    let challenge = gatekeeper.captcha_challenge();
    let expose = gatekeeper.config().captcha.expose_answer;
    Json(CaptchaBody {
        answer_len: challenge.answer.len(),
        answer: expose.then_some(challenge.answer),
        captcha_id: challenge.id,
    })
}

async fn login<S: Store + 'static>(
    State(gatekeeper): State<Arc<Gatekeeper<S>>>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<TokenBody>, Error> {
    let issued = gatekeeper.login(&request).await?;
    Ok(Json(issued.into()))
}

async fn logout<S: Store + 'static>(
    State(gatekeeper): State<Arc<Gatekeeper<S>>>,
    Extension(session): Extension<SessionPrincipal>,
) -> Result<Json<OkBody>, Error> {
    gatekeeper.logout(session.user_id).await?;
    Ok(Json(OkBody { code: 0 }))
}

async fn refresh_token<S: Store + 'static>(
    State(gatekeeper): State<Arc<Gatekeeper<S>>>,
    Extension(session): Extension<SessionPrincipal>,
) -> Result<Json<TokenBody>, Error> {
    let issued = gatekeeper.refresh(&session).await?;
    Ok(Json(issued.into()))
}

async fn oauth_login<S: Store + 'static>(
    State(gatekeeper): State<Arc<Gatekeeper<S>>>,
    Json(body): Json<OAuthLoginBody>,
) -> Result<Json<RedirectBody>, Error> {
    let variant: LoginVariant = body.login_type.parse()?;
    let url = gatekeeper.begin_oauth(&body.provider, variant).await?;
    Ok(Json(RedirectBody { url }))
}

async fn oauth_callback<S: Store + 'static>(
    State(gatekeeper): State<Arc<Gatekeeper<S>>>,
    Query(query): Query<CallbackQuery>,
) -> Result<Json<TokenBody>, Error> {
    let issued = gatekeeper.oauth_callback(&query.code, &query.state).await?;
    Ok(Json(issued.into()))
}

/// Mounts the login endpoints and gates `protected` behind a
/// [`GatekeeperLayer`].
///
/// `/api/logout` and `/api/refresh_token` need a current session but no
/// policy rule.
pub fn routes<S>(gatekeeper: Arc<Gatekeeper<S>>, protected: Router) -> Router
where
    S: Store + 'static,
{
    let public = Router::new()
        .route("/api/captcha", get(captcha::<S>))
        .route("/api/login", post(login::<S>))
        .route("/api/oauth/login", post(oauth_login::<S>))
        .route("/api/oauth/callback", get(oauth_callback::<S>))
        .with_state(gatekeeper.clone());

    let session = Router::new()
        .route("/api/logout", post(logout::<S>))
        .route("/api/refresh_token", post(refresh_token::<S>))
        .with_state(gatekeeper.clone())
        .layer(GatekeeperLayer::authenticate_only(gatekeeper.clone()));

    let gated = protected.layer(GatekeeperLayer::new(gatekeeper));

    public.merge(session).merge(gated)
}
