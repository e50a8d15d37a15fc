use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, Method},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::{Deserialize, Deserializer, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use ambulink_net::BrokerStats;
use ambulink_shared::{ClientStatus, Direction, ResourceKind, SubjectKind};
use ambulink_store::{Client, Database, PermissionGrant, User};

use crate::acl::AclAuthorizer;
use crate::config::ServerConfig;
use crate::error::{BridgeError, ServerError};
use crate::gateway::Notification;
use crate::permissions::{load_holder_owners, CacheStats, Permissions};
use crate::session::{self, SessionRequest};
use crate::state::Bridge;

#[derive(Clone)]
pub struct AppState {
    pub bridge: Bridge,
    pub acl: AclAuthorizer,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(bridge: Bridge, config: ServerConfig) -> Self {
        Self {
            acl: bridge.authorizer(),
            bridge,
            config: Arc::new(config),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/mqtt/acl", post(mqtt_acl))
        .route("/mqtt/superuser", post(mqtt_superuser))
        .route("/api/clients/:client_id", put(upsert_client))
        .route("/admin/cache", get(admin_cache_stats))
        .route("/admin/cache/clear", post(admin_cache_clear))
        .route("/admin/grants", put(admin_set_grant).delete(admin_delete_grant))
        .route("/admin/groups/:group_id/members", post(admin_add_member))
        .route(
            "/admin/groups/:group_id/members/:user_id",
            delete(admin_remove_member),
        )
        .route("/admin/broker", get(admin_broker_stats))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    broker_connected: bool,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        broker_connected: state.bridge.gateway.connection().is_connected(),
    })
}

// ─── Broker auth hooks ───

#[derive(Deserialize)]
struct AclRequest {
    username: String,
    clientid: String,
    /// 1 = subscribe, 2 = publish
    acc: u8,
    topic: String,
}

#[derive(Deserialize)]
struct SuperuserRequest {
    username: String,
}

async fn mqtt_acl(
    State(state): State<AppState>,
    Json(req): Json<AclRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let direction = Direction::from_acc(req.acc)
        .ok_or_else(|| ServerError::BadRequest(format!("Unknown acc value {}", req.acc)))?;

    let allowed = state
        .acl
        .authorize(&req.username, &req.clientid, direction, &req.topic)
        .await?;
    if !allowed {
        return Err(ServerError::Forbidden(format!("{} on '{}'", verb(direction), req.topic)));
    }
    Ok(Json(serde_json::json!({ "result": "allow" })))
}

fn verb(direction: Direction) -> &'static str {
    match direction {
        Direction::Subscribe => "subscribe",
        Direction::Publish => "publish",
    }
}

async fn mqtt_superuser(
    State(state): State<AppState>,
    Json(req): Json<SuperuserRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    if !state.acl.is_superuser(&req.username).await? {
        return Err(ServerError::Forbidden("Not a superuser".into()));
    }
    Ok(Json(serde_json::json!({ "result": "allow" })))
}

// ─── Session upsert ───

/// Distinguish an absent field (`None`) from an explicit `null`
/// (`Some(None)`).
fn double_option<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[derive(Deserialize)]
struct ClientUpsertRequest {
    username: String,
    #[serde(default)]
    status: Option<ClientStatus>,
    #[serde(default, deserialize_with = "double_option")]
    ambulance: Option<Option<i64>>,
    #[serde(default, deserialize_with = "double_option")]
    hospital: Option<Option<i64>>,
}

async fn upsert_client(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(client_id): Path<String>,
    Json(req): Json<ClientUpsertRequest>,
) -> Result<Json<Option<Client>>, ServerError> {
    verify_admin_token(&headers, &state.config)?;

    let request = SessionRequest {
        status: req.status,
        ambulance: req.ambulance,
        hospital: req.hospital,
    };
    let outcome = {
        let db = state.bridge.db.lock().await;
        db.transaction(|db| {
            session::upsert(db, &state.bridge.cache, &req.username, &client_id, &request)
        })?
    };
    state.bridge.gateway.publish_all(&outcome.notifications).await;

    Ok(Json(outcome.client))
}

// ─── Admin ───

fn verify_admin_token(headers: &HeaderMap, config: &ServerConfig) -> Result<(), ServerError> {
    let Some(ref expected) = config.admin_token else {
        return Err(ServerError::Forbidden(
            "Admin API is disabled (no ADMIN_TOKEN configured)".into(),
        ));
    };

    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let token = auth.strip_prefix("Bearer ").unwrap_or(auth);

    // Constant-time comparison to prevent timing attacks on admin token.
    use subtle::ConstantTimeEq;
    let token_bytes = token.as_bytes();
    let expected_bytes = expected.as_bytes();
    if token_bytes.len() != expected_bytes.len()
        || token_bytes.ct_eq(expected_bytes).unwrap_u8() != 1
    {
        return Err(ServerError::Forbidden("Invalid admin token".into()));
    }

    Ok(())
}

async fn admin_cache_stats(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<CacheStats>, ServerError> {
    verify_admin_token(&headers, &state.config)?;
    Ok(Json(state.bridge.cache.stats()))
}

async fn admin_cache_clear(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ServerError> {
    verify_admin_token(&headers, &state.config)?;

    state.bridge.cache.invalidate();
    state.bridge.gateway.publish_cache_clear().await;

    info!("Admin cleared the permission cache");
    Ok(Json(serde_json::json!({ "cleared": true })))
}

async fn admin_broker_stats(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<BrokerStats>, ServerError> {
    verify_admin_token(&headers, &state.config)?;
    Ok(Json(state.bridge.gateway.connection().stats()))
}

/// Users whose effective permissions a grant on `(kind, id)` affects.
fn subject_users(db: &Database, kind: SubjectKind, id: i64) -> Result<Vec<User>, BridgeError> {
    match kind {
        SubjectKind::User => Ok(vec![db.get_user(id)?]),
        SubjectKind::Group => Ok(db.list_group_members(id)?),
    }
}

/// Drop cached permissions everywhere and republish the affected profiles.
async fn permissions_changed(state: &AppState, notifications: Vec<Notification>) {
    state.bridge.cache.invalidate();
    state.bridge.gateway.publish_cache_clear().await;
    state.bridge.gateway.publish_all(&notifications).await;
}

fn profiles(db: &Database, users: &[User]) -> Result<Vec<Notification>, BridgeError> {
    let holders = load_holder_owners(db)?;
    users
        .iter()
        .map(|user| {
            let perms = Permissions::load(db, user, holders.clone())?;
            Ok(Notification::profile(&perms))
        })
        .collect()
}

async fn admin_set_grant(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(grant): Json<PermissionGrant>,
) -> Result<Json<PermissionGrant>, ServerError> {
    verify_admin_token(&headers, &state.config)?;

    let notifications = {
        let db = state.bridge.db.lock().await;
        db.transaction(|db| {
            let users = subject_users(db, grant.subject_kind, grant.subject_id)?;
            db.set_grant(&grant)?;
            profiles(db, &users)
        })?
    };
    permissions_changed(&state, notifications).await;

    info!(
        subject = %grant.subject_kind.as_str(),
        subject_id = grant.subject_id,
        resource = %grant.resource_kind.as_str(),
        resource_id = grant.resource_id,
        can_read = grant.can_read,
        can_write = grant.can_write,
        "Admin set grant"
    );
    Ok(Json(grant))
}

#[derive(Deserialize)]
struct GrantKey {
    subject_kind: SubjectKind,
    subject_id: i64,
    resource_kind: ResourceKind,
    resource_id: i64,
}

async fn admin_delete_grant(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(key): Json<GrantKey>,
) -> Result<Json<serde_json::Value>, ServerError> {
    verify_admin_token(&headers, &state.config)?;

    let (deleted, notifications) = {
        let db = state.bridge.db.lock().await;
        db.transaction(|db| {
            let users = subject_users(db, key.subject_kind, key.subject_id)?;
            let deleted = db.delete_grant(
                key.subject_kind,
                key.subject_id,
                key.resource_kind,
                key.resource_id,
            )?;
            Ok::<_, BridgeError>((deleted, profiles(db, &users)?))
        })?
    };
    if deleted {
        permissions_changed(&state, notifications).await;
    }

    Ok(Json(serde_json::json!({ "deleted": deleted })))
}

#[derive(Deserialize)]
struct AddMemberRequest {
    user_id: i64,
}

async fn admin_add_member(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(group_id): Path<i64>,
    Json(req): Json<AddMemberRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    verify_admin_token(&headers, &state.config)?;
    change_membership(&state, group_id, req.user_id, true).await
}

async fn admin_remove_member(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path((group_id, user_id)): Path<(i64, i64)>,
) -> Result<Json<serde_json::Value>, ServerError> {
    verify_admin_token(&headers, &state.config)?;
    change_membership(&state, group_id, user_id, false).await
}

async fn change_membership(
    state: &AppState,
    group_id: i64,
    user_id: i64,
    add: bool,
) -> Result<Json<serde_json::Value>, ServerError> {
    let (changed, notifications) = {
        let db = state.bridge.db.lock().await;
        db.transaction(|db| {
            let user = db.get_user(user_id)?;
            let changed = if add {
                db.add_group_member(group_id, user_id)?
            } else {
                db.remove_group_member(group_id, user_id)?
            };
            Ok::<_, BridgeError>((changed, profiles(db, &[user])?))
        })?
    };
    if changed {
        permissions_changed(state, notifications).await;
        info!(group_id, user_id, add, "Admin changed group membership");
    }

    Ok(Json(serde_json::json!({ "changed": changed })))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}
