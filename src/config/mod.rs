// src/config/mod.rs
// Central configuration for the ATLAS backend

pub mod limits;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

pub use limits::{LimitSource, RateLimitConfig, RateLimitSettings, ScopeKey};

pub static CONFIG: Lazy<AtlasConfig> = Lazy::new(AtlasConfig::from_env);

/// Main configuration structure - composes all domain configs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AtlasConfig {
    pub server: ServerConfig,
    pub chat: ChatConfig,
    pub worker: WorkerPoolConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    pub default_provider: String,
    pub default_model: String,
    pub router_enabled: bool,
    pub router_model: String,
    /// "async" runs turns on the in-process engine; "worker" routes them
    /// through the subprocess pool.
    pub execution_mode: String,
    pub max_async_concurrent_chats: usize,
    /// Minimum interval between throttled assistant-message flushes.
    pub db_update_throttle_ms: u64,
    /// Window within which an identical (chat_id, message) pair is rejected.
    pub duplicate_window_ms: u64,
    /// Grace period during which tool decisions for a cleared domain
    /// session are answered as stale instead of re-executed.
    pub stale_decision_grace_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    pub pool_size: usize,
    pub max_parallel_spawn: usize,
    pub init_timeout_secs: f64,
    pub spawn_retry_delay_secs: f64,
    pub spawn_retry_delay_max_secs: f64,
    pub slow_start_threshold_secs: f64,
}

impl AtlasConfig {
    pub fn from_env() -> Self {
        Self {
            server: ServerConfig {
                host: env_or("ATLAS_HOST", "127.0.0.1"),
                port: env_parse("ATLAS_PORT", 5100),
                database_url: env_or("ATLAS_DATABASE_URL", "sqlite://data/atlas.db"),
            },
            chat: ChatConfig {
                default_provider: env_or("ATLAS_DEFAULT_PROVIDER", "openrouter"),
                default_model: env_or("ATLAS_DEFAULT_MODEL", "gemini-2.5-flash"),
                router_enabled: env_parse("ATLAS_ROUTER_ENABLED", true),
                router_model: env_or("ATLAS_ROUTER_MODEL", "gemini-2.5-flash-lite"),
                execution_mode: env_or("ATLAS_EXECUTION_MODE", "async"),
                max_async_concurrent_chats: env_parse("ATLAS_MAX_ASYNC_CONCURRENT_CHATS", 10),
                db_update_throttle_ms: 250,
                duplicate_window_ms: 1_000,
                stale_decision_grace_secs: 10,
            },
            worker: WorkerPoolConfig {
                pool_size: env_parse("ATLAS_WORKER_POOL_SIZE", 4),
                max_parallel_spawn: env_parse("ATLAS_WORKER_MAX_PARALLEL_SPAWN", 5),
                init_timeout_secs: 40.0,
                spawn_retry_delay_secs: 1.0,
                spawn_retry_delay_max_secs: 8.0,
                slow_start_threshold_secs: 12.0,
            },
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
