use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{delete, get, put};
use axum::{Json, Router};
use rand::Rng;
use rand::distributions::Alphanumeric;
use rs_gatekeeper::{
    Error, Gatekeeper, GatekeeperBuilder, GatekeeperConfig, MemoryStore, Page, Password, Role,
    RoleId, RoleValue, Rule, SessionFilter, SessionView, Status, User, UserId, Username,
    hash_password,
};
use serde::Deserialize;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

type AppState = Arc<Gatekeeper<MemoryStore>>;

#[derive(Debug, Deserialize)]
struct PageQuery {
    #[serde(default = "first_page")]
    page: u64,
    #[serde(default = "default_page_size")]
    page_size: u64,
    username: Option<String>,
}

fn first_page() -> u64 {
    1
}

fn default_page_size() -> u64 {
    20
}

fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .json()
                .flatten_event(true),
        )
        .init();
}

/// Seeds an `admin` role with full access to `/api/admin/*` and one account
/// holding it.
fn seed(store: &MemoryStore, config: &GatekeeperConfig) -> Result<(), Error> {
    let admin = RoleValue::new("admin")?;
    store.add_role(Role {
        id: RoleId::new(1),
        name: "Administrator".to_string(),
        value: admin.clone(),
        default_router: "dashboard".to_string(),
        status: Status::Active,
        remark: "seeded at startup".to_string(),
        order_no: 1,
    });
    let rules = ["GET", "POST", "PUT", "DELETE"]
        .into_iter()
        .map(|method| Rule::new("/api/admin/*", method))
        .collect::<Result<Vec<_>, _>>()?;
    store.add_rules(admin, rules);

    let password = if config.seed.admin_password.is_empty() {
        let generated: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(16)
            .map(char::from)
            .collect();
        tracing::warn!(
            username = %config.seed.admin_username,
            "no seed password configured, generated one for this run"
        );
        // Printed once, never logged.
        eprintln!(
            "generated password for {}: {generated}",
            config.seed.admin_username
        );
        generated
    } else {
        config.seed.admin_password.clone()
    };
    store.add_user(User {
        id: UserId::new(1),
        username: Username::new(&config.seed.admin_username)?,
        password_hash: hash_password(&Password::new(password))?,
        role_id: RoleId::new(1),
        status: Status::Active,
        federated_handles: BTreeMap::new(),
    });
    Ok(())
}

async fn list_roles(
    State(gatekeeper): State<AppState>,
    Query(query): Query<PageQuery>,
) -> Result<Json<Page<Role>>, Error> {
    let page = gatekeeper
        .role_admin()
        .list(query.page, query.page_size)
        .await?;
    Ok(Json(page))
}

async fn list_sessions(
    State(gatekeeper): State<AppState>,
    Query(query): Query<PageQuery>,
) -> Result<Json<Page<SessionView>>, Error> {
    let filter = SessionFilter {
        page: query.page,
        page_size: query.page_size,
        username: query.username,
        user_id: None,
    };
    Ok(Json(gatekeeper.sessions().list(&filter).await?))
}

async fn kick_session(
    State(gatekeeper): State<AppState>,
    Path(user_id): Path<u64>,
) -> Result<Json<serde_json::Value>, Error> {
    gatekeeper.sessions().revoke(UserId::new(user_id)).await?;
    Ok(Json(serde_json::json!({ "code": 0 })))
}

async fn replace_rules(
    State(gatekeeper): State<AppState>,
    Path(role): Path<String>,
    Json(rules): Json<Vec<Rule>>,
) -> Result<Json<Vec<Rule>>, Error> {
    let role = RoleValue::new(role)?;
    gatekeeper.policy().replace_rules(&role, rules).await?;
    Ok(Json(gatekeeper.policy().rules_for(&role)))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
    tracing::info!("shutting down");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = GatekeeperConfig::load()?;
    init_tracing(&config.log_level);

    let store = MemoryStore::new();
    seed(&store, &config)?;

    let bind_addr = config.bind_addr();
    let gatekeeper: AppState = Arc::new(GatekeeperBuilder::new(store).config(config).build().await?);

    let protected = Router::new()
        .route("/api/admin/role/list", get(list_roles))
        .route("/api/admin/session/list", get(list_sessions))
        .route("/api/admin/session/{user_id}", delete(kick_session))
        .route("/api/admin/policy/{role}", put(replace_rules))
        .with_state(gatekeeper.clone());
    let app = rs_gatekeeper::axum::routes(gatekeeper, protected);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "gatekeeper listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}
