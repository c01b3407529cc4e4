pub mod config;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod pairing;
pub mod quota;
pub mod registry;
pub mod template;
pub mod transport;
pub mod types;

pub use config::Config;
pub use error::EngineError;

use self::config::{expand_tilde, load_config, resolve_database_url};
use self::db::DbKind;
use self::dispatcher::CampaignInput;
use self::registry::SessionRegistry;
use self::transport::{SidecarTransport, Transport};
use self::types::MessageKind;

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::AnyPool;
use tracing::error;

/// Pacing window used when a start request leaves the delays unset.
pub const DEFAULT_MIN_DELAY_SECONDS: u64 = 3;
pub const DEFAULT_MAX_DELAY_SECONDS: u64 = 6;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub pool: AnyPool,
    pub registry: SessionRegistry,
    pub db_kind: DbKind,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StartCampaignRequest {
    pub tenant_id: String,
    pub name: String,
    pub template: String,
    pub contact_ids: Vec<String>,
    pub message_type: Option<String>,
    pub media_path: Option<String>,
    pub min_delay_seconds: Option<u64>,
    pub max_delay_seconds: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct StartCampaignResponse {
    pub campaign_id: String,
    pub status: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateTenantRequest {
    pub name: String,
    pub quota_limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub tenants: i64,
    pub campaigns: i64,
    pub deliveries: i64,
}

#[derive(Debug, Deserialize)]
pub struct TenantQuery {
    pub tenant_id: String,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn create_app() -> anyhow::Result<(AppState, Router)> {
    let config = load_config();
    let transport: Arc<dyn Transport> =
        Arc::new(SidecarTransport::new(&config.transport.sidecar_url));
    create_app_with_transport(config, transport).await
}

pub async fn create_app_with_transport(
    config: Config,
    transport: Arc<dyn Transport>,
) -> anyhow::Result<(AppState, Router)> {
    sqlx::any::install_default_drivers();

    let db_url = resolve_database_url(&config);
    let db_kind = db::db_kind_from_url(&db_url);
    let pool = AnyPool::connect(&db_url).await?;
    db::init_db(&pool, db_kind).await?;

    let registry = SessionRegistry::new(
        transport,
        pool.clone(),
        db_kind,
        expand_tilde(&config.transport.credentials_dir),
        &config.transport,
    );

    let state = AppState {
        config: config.clone(),
        pool,
        registry,
        db_kind,
    };

    let authed_routes = Router::new()
        .route("/v1/campaigns", post(start_campaign).get(list_campaigns))
        .route("/v1/campaigns/:campaign_id", get(get_campaign))
        .route("/v1/campaigns/:campaign_id/progress", get(campaign_progress))
        .route("/v1/tenants", post(create_tenant))
        .route("/v1/tenants/:tenant_id/api-key/rotate", post(rotate_api_key))
        .route("/v1/tenants/:tenant_id/stats", get(tenant_stats))
        .route("/v1/transport/:tenant_id/code", get(pairing_code))
        .route("/v1/transport/:tenant_id/status", get(transport_status))
        .route("/v1/transport/:tenant_id/restore", post(transport_restore))
        .route("/v1/transport/:tenant_id/logout", post(transport_logout))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let public_routes = Router::new()
        .route("/v1/health", get(health))
        .route("/v1/status", get(status));

    let app = Router::new()
        .merge(authed_routes)
        .merge(public_routes)
        .with_state(state.clone());

    Ok((state, app))
}

async fn require_auth(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: axum::http::Request<axum::body::Body>,
    next: middleware::Next,
) -> impl IntoResponse {
    if let Some(token) = state.config.auth.token.as_ref() {
        let header = headers
            .get("X-Blast-Engine-Token")
            .and_then(|v| v.to_str().ok());
        if header != Some(token.as_str()) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }
    next.run(req).await
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let tenants = sqlx::query_scalar::<_, i64>("SELECT COUNT(1) FROM tenants")
        .fetch_one(&state.pool)
        .await
        .unwrap_or(0);
    let campaigns = sqlx::query_scalar::<_, i64>("SELECT COUNT(1) FROM campaigns")
        .fetch_one(&state.pool)
        .await
        .unwrap_or(0);
    let deliveries = sqlx::query_scalar::<_, i64>("SELECT COUNT(1) FROM deliveries")
        .fetch_one(&state.pool)
        .await
        .unwrap_or(0);
    Json(StatusResponse {
        tenants,
        campaigns,
        deliveries,
    })
}

fn resolve_kind(raw: Option<&str>) -> Result<MessageKind, EngineError> {
    match raw {
        None => Ok(MessageKind::Text),
        Some(raw) => MessageKind::parse(raw)
            .ok_or_else(|| EngineError::InvalidRequest(format!("unknown message type: {raw}"))),
    }
}

async fn start_campaign(
    State(state): State<AppState>,
    Json(req): Json<StartCampaignRequest>,
) -> impl IntoResponse {
    let kind = match resolve_kind(req.message_type.as_deref()) {
        Ok(kind) => kind,
        Err(err) => return err.into_response(),
    };

    let input = CampaignInput {
        tenant_id: req.tenant_id,
        name: req.name,
        template: req.template,
        contact_ids: req.contact_ids,
        kind,
        media_path: req.media_path,
        min_delay_seconds: req.min_delay_seconds.unwrap_or(DEFAULT_MIN_DELAY_SECONDS),
        max_delay_seconds: req.max_delay_seconds.unwrap_or(DEFAULT_MAX_DELAY_SECONDS),
    };

    match dispatcher::start_campaign(
        state.pool.clone(),
        state.db_kind,
        state.registry.clone(),
        &state.config.pacing,
        input,
    )
    .await
    {
        Ok(campaign_id) => (
            StatusCode::CREATED,
            Json(StartCampaignResponse {
                campaign_id,
                status: "started".to_string(),
            }),
        )
            .into_response(),
        Err(err) => err.into_response(),
    }
}

async fn campaign_progress(
    State(state): State<AppState>,
    Path(campaign_id): Path<String>,
) -> impl IntoResponse {
    match dispatcher::campaign_progress(&state.pool, state.db_kind, &campaign_id).await {
        Ok(progress) => Json(progress).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn get_campaign(
    State(state): State<AppState>,
    Path(campaign_id): Path<String>,
) -> impl IntoResponse {
    let campaign = db::get_campaign(&state.pool, state.db_kind, &campaign_id)
        .await
        .unwrap_or(None);
    let Some(campaign) = campaign else {
        return EngineError::CampaignNotFound(campaign_id).into_response();
    };
    let deliveries = db::list_deliveries(&state.pool, state.db_kind, &campaign.id)
        .await
        .unwrap_or_default();
    Json(json!({"campaign": campaign, "deliveries": deliveries})).into_response()
}

async fn list_campaigns(
    State(state): State<AppState>,
    Query(query): Query<TenantQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(100).min(500);
    let offset = query.offset.unwrap_or(0);
    let campaigns = db::list_campaigns(&state.pool, state.db_kind, &query.tenant_id, limit, offset)
        .await
        .unwrap_or_default();
    Json(campaigns)
}

async fn create_tenant(
    State(state): State<AppState>,
    Json(req): Json<CreateTenantRequest>,
) -> impl IntoResponse {
    let name = req.name.trim().to_string();
    if name.is_empty() {
        return EngineError::InvalidRequest("tenant name is required".to_string()).into_response();
    }
    let quota_limit = req
        .quota_limit
        .unwrap_or(state.config.quota.default_daily_limit);
    if quota_limit < 0 {
        return EngineError::InvalidRequest("quota_limit must not be negative".to_string())
            .into_response();
    }

    let record = db::TenantRecord {
        id: db::new_id(),
        name,
        api_key: db::new_api_key(),
        quota_limit,
        created_at: Utc::now(),
    };
    match db::insert_tenant(&state.pool, state.db_kind, &record).await {
        Ok(()) => (StatusCode::CREATED, Json(record)).into_response(),
        Err(err) => {
            error!("create_tenant error: {err:?}");
            EngineError::Storage(err).into_response()
        }
    }
}

async fn rotate_api_key(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> impl IntoResponse {
    let api_key = db::new_api_key();
    match db::rotate_api_key(&state.pool, state.db_kind, &tenant_id, &api_key).await {
        Ok(true) => Json(json!({"tenant_id": tenant_id, "api_key": api_key})).into_response(),
        Ok(false) => EngineError::TenantNotFound(tenant_id).into_response(),
        Err(err) => {
            error!("rotate_api_key error: {err:?}");
            EngineError::Storage(err).into_response()
        }
    }
}

async fn tenant_stats(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> impl IntoResponse {
    let tenant = db::get_tenant(&state.pool, state.db_kind, &tenant_id)
        .await
        .unwrap_or(None);
    let Some(tenant) = tenant else {
        return EngineError::TenantNotFound(tenant_id).into_response();
    };
    match db::tenant_stats(&state.pool, state.db_kind, &tenant.id).await {
        Ok(stats) => Json(stats).into_response(),
        Err(err) => EngineError::Storage(err).into_response(),
    }
}

async fn pairing_code(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> impl IntoResponse {
    match pairing::request_pairing_code(&state.registry, &state.config.transport, &tenant_id).await
    {
        Ok(qr) => Json(json!({"tenant_id": tenant_id, "qr": qr})).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn transport_status(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> impl IntoResponse {
    match state.registry.connection_status(&tenant_id).await {
        Ok(status) => Json(json!({"tenant_id": tenant_id, "status": status})).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn transport_restore(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> impl IntoResponse {
    match state.registry.restore(&tenant_id).await {
        Ok(connected) => {
            Json(json!({"tenant_id": tenant_id, "connected": connected})).into_response()
        }
        Err(err) => err.into_response(),
    }
}

async fn transport_logout(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> impl IntoResponse {
    match state.registry.logout(&tenant_id).await {
        Ok(()) => Json(json!({"tenant_id": tenant_id, "status": "disconnected"})).into_response(),
        Err(err) => err.into_response(),
    }
}
