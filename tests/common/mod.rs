#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, OnceLock};

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::routing::{delete, get, post};
use http_body_util::BodyExt;
use rs_gatekeeper::{
    Gatekeeper, GatekeeperBuilder, GatekeeperConfig, MemoryStore, Password, ProviderName, Role,
    RoleId, RoleValue, Rule, Status, User, UserId, Username, hash_password,
};
use serde_json::Value;
use tower::ServiceExt;

pub const ADMIN_PASSWORD: &str = "simple-admin";
pub const VIEWER_PASSWORD: &str = "simple-viewer";

pub const ADMIN_ROLE: RoleId = RoleId::new(1);
pub const VIEWER_ROLE: RoleId = RoleId::new(2);

pub fn role(id: RoleId, value: &str) -> Role {
    Role {
        id,
        name: value.to_string(),
        value: RoleValue::new(value).unwrap(),
        default_router: "dashboard".to_string(),
        status: Status::Active,
        remark: String::new(),
        order_no: id.get() as u32,
    }
}

/// Argon2 at the default cost is slow in debug builds; hash each fixture
/// password once per test binary.
fn hashed(password: &str) -> String {
    static HASHES: OnceLock<Mutex<HashMap<String, String>>> = OnceLock::new();
    let mut hashes = HASHES.get_or_init(Default::default).lock().unwrap();
    hashes
        .entry(password.to_string())
        .or_insert_with(|| hash_password(&Password::new(password)).unwrap())
        .clone()
}

pub fn user(id: u64, username: &str, password: &str, role_id: RoleId) -> User {
    User {
        id: UserId::new(id),
        username: Username::new(username).unwrap(),
        password_hash: hashed(password),
        role_id,
        status: Status::Active,
        federated_handles: BTreeMap::new(),
    }
}

pub fn linked_user(id: u64, username: &str, role_id: RoleId, provider: &str, handle: &str) -> User {
    let mut user = user(id, username, "unused-password", role_id);
    user.federated_handles
        .insert(ProviderName::new(provider).unwrap(), handle.to_string());
    user
}

/// Store with an `admin` role granted every admin GET and a `viewer` role
/// granted reads only.
pub fn seeded_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.add_role(role(ADMIN_ROLE, "admin"));
    store.add_role(role(VIEWER_ROLE, "viewer"));
    store.add_user(user(1, "admin", ADMIN_PASSWORD, ADMIN_ROLE));
    store.add_user(user(2, "viewer", VIEWER_PASSWORD, VIEWER_ROLE));
    store.add_rules(
        RoleValue::new("admin").unwrap(),
        [
            Rule::new("/api/admin/*", "GET").unwrap(),
            Rule::new("/api/admin/*", "DELETE").unwrap(),
        ],
    );
    store.add_rules(
        RoleValue::new("viewer").unwrap(),
        [
            Rule::new("/api/admin/role/list", "GET").unwrap(),
            Rule::new("/api/admin/user/:id", "GET").unwrap(),
        ],
    );
    store
}

pub fn config() -> GatekeeperConfig {
    let mut config = GatekeeperConfig::default();
    config.auth.access_secret = "integration-secret".to_string();
    config.captcha.expose_answer = true;
    config.oauth.timeout_ms = 500;
    config
}

pub async fn gatekeeper(
    store: Arc<MemoryStore>,
    config: GatekeeperConfig,
) -> Arc<Gatekeeper<MemoryStore>> {
    Arc::new(
        GatekeeperBuilder::from_shared(store)
            .config(config)
            .build()
            .await
            .unwrap(),
    )
}

pub fn app(gatekeeper: Arc<Gatekeeper<MemoryStore>>) -> Router {
    let protected = Router::new()
        .route("/api/admin/role/list", get(|| async { "[]" }))
        .route("/api/admin/role/{id}", delete(|| async { "deleted" }))
        .route("/api/admin/user/{id}", get(|| async { "{}" }))
        .route("/api/admin/user", post(|| async { "created" }));
    rs_gatekeeper::axum::routes(gatekeeper, protected)
}

pub async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

pub fn get_with(uri: &str, token: Option<&str>) -> Request<Body> {
    with_token(Request::get(uri), token)
        .body(Body::empty())
        .unwrap()
}

pub fn method_with(method: &str, uri: &str, token: Option<&str>) -> Request<Body> {
    with_token(Request::builder().method(method).uri(uri), token)
        .body(Body::empty())
        .unwrap()
}

pub fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn with_token(builder: axum::http::request::Builder, token: Option<&str>) -> axum::http::request::Builder {
    match token {
        Some(token) => builder.header("authorization", format!("Bearer {token}")),
        None => builder,
    }
}

/// Logs in over HTTP after solving a fresh captcha; returns the bearer token.
pub async fn login(app: &Router, username: &str, password: &str) -> String {
    let (status, challenge) = send(app, get_with("/api/captcha", None)).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        app,
        post_json(
            "/api/login",
            serde_json::json!({
                "username": username,
                "password": password,
                "captcha_id": challenge["captcha_id"],
                "captcha": challenge["answer"],
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["code"], 0);
    body["token"].as_str().unwrap().to_string()
}
