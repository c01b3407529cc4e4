use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub database: DatabaseConfig,
    pub transport: TransportConfig,
    pub pacing: PacingConfig,
    pub quota: QuotaConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8094,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub token: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self { token: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub sqlite_path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            sqlite_path: "~/.blast-engine/state.sqlite".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    pub sidecar_url: String,
    /// Per-tenant credential material lives in subdirectories of this path.
    pub credentials_dir: String,
    /// How long a pairing-code request blocks waiting for the first code.
    pub pairing_wait_seconds: u64,
    /// Pairing codes older than this are dropped and the flow restarts.
    pub code_ttl_seconds: u64,
    /// Delay before the single reconnect attempt after an unexpected close.
    pub reconnect_backoff_seconds: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            sidecar_url: "http://127.0.0.1:4040".to_string(),
            credentials_dir: "~/.blast-engine/credentials".to_string(),
            pairing_wait_seconds: 3,
            code_ttl_seconds: 60,
            reconnect_backoff_seconds: 3,
        }
    }
}

/// Safety clamp for the per-recipient delay window. Requested delays are
/// clamped into `[min_delay_floor_seconds, max_delay_ceiling_seconds]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacingConfig {
    pub min_delay_floor_seconds: u64,
    pub max_delay_ceiling_seconds: u64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            min_delay_floor_seconds: 1,
            max_delay_ceiling_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Daily send limit applied to tenants created without an explicit one.
    pub default_daily_limit: i64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            default_daily_limit: 300,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            database: DatabaseConfig::default(),
            transport: TransportConfig::default(),
            pacing: PacingConfig::default(),
            quota: QuotaConfig::default(),
        }
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

pub fn load_config() -> Config {
    let config_path = resolve_config_path();

    let mut cfg = Config::default();

    if config_path.exists() {
        if let Ok(raw) = fs::read_to_string(&config_path) {
            if let Ok(file_cfg) = serde_json::from_str::<Config>(&raw) {
                cfg = file_cfg;
            }
        }
    }

    // Override from environment
    if let Ok(token) = env::var("BLAST_ENGINE_TOKEN") {
        if !token.trim().is_empty() {
            cfg.auth.token = Some(token);
        }
    }

    if let Ok(url) = env::var("BLAST_ENGINE_DATABASE_URL") {
        if !url.trim().is_empty() {
            cfg.database.url = Some(url);
        }
    }

    if let Ok(path) = env::var("BLAST_ENGINE_SQLITE_PATH") {
        if !path.trim().is_empty() {
            cfg.database.sqlite_path = path;
        }
    }

    if let Ok(url) = env::var("BLAST_ENGINE_SIDECAR_URL") {
        if !url.trim().is_empty() {
            cfg.transport.sidecar_url = url;
        }
    }

    if let Ok(dir) = env::var("BLAST_ENGINE_CREDENTIALS_DIR") {
        if !dir.trim().is_empty() {
            cfg.transport.credentials_dir = dir;
        }
    }

    cfg
}

pub fn resolve_config_path() -> PathBuf {
    env::var("BLAST_ENGINE_CONFIG")
        .ok()
        .map(PathBuf::from)
        .unwrap_or_else(|| expand_tilde("~/.blast-engine/blast-engine.json"))
}

pub fn resolve_database_url(cfg: &Config) -> String {
    if let Some(url) = cfg.database.url.as_ref() {
        return url.to_string();
    }

    let path = expand_tilde(&cfg.database.sqlite_path);
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    format!("sqlite://{}", path.to_string_lossy())
}
