// src/state.rs
// Application state: wiring for the store, bus, limiter, engines and
// managers shared across handlers

use anyhow::Result;
use std::sync::Arc;
use tracing::info;

use crate::config::{AtlasConfig, RateLimitSettings};
use crate::dispatch::Dispatcher;
use crate::engine::{AsyncEngine, DomainExecutor, EngineContext, NullDomainExecutor, RetryConfig};
use crate::events::EventBus;
use crate::limits::RateLimiter;
use crate::providers::ProviderMap;
use crate::router::ModelRouter;
use crate::store::ChatStore;
use crate::terminal::TerminalManager;
use crate::tools::{NullToolExecutor, ToolExecutor};
use crate::versioning::VersioningService;
use crate::web::{NullWebDriver, WebDriver, WebSessionManager};
use crate::worker::WorkerPool;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: ChatStore,
    pub bus: Arc<EventBus>,
    pub limiter: Arc<RateLimiter>,
    pub providers: ProviderMap,
    pub dispatcher: Arc<Dispatcher>,
    pub versioning: Arc<VersioningService>,
    pub terminals: Arc<TerminalManager>,
    pub web: Arc<WebSessionManager>,
    pub config: AtlasConfig,
}

/// Pluggable collaborators, overridable for tests and embedders.
#[derive(Default)]
pub struct StateOverrides {
    pub providers: Option<ProviderMap>,
    pub domains: Option<Arc<dyn DomainExecutor>>,
    pub tools: Option<Arc<dyn ToolExecutor>>,
    pub web_driver: Option<Arc<dyn WebDriver>>,
    pub retry: Option<RetryConfig>,
}

impl AppState {
    pub async fn new(config: AtlasConfig) -> Result<Self> {
        Self::with_overrides(config, StateOverrides::default()).await
    }

    pub async fn with_overrides(config: AtlasConfig, overrides: StateOverrides) -> Result<Self> {
        let store = ChatStore::connect(&config.server.database_url).await?;
        Self::from_store(config, store, overrides).await
    }

    /// Wire the full state around an already-open store (tests use
    /// in-memory pools).
    pub async fn from_store(
        config: AtlasConfig,
        store: ChatStore,
        overrides: StateOverrides,
    ) -> Result<Self> {
        let bus = Arc::new(EventBus::new());
        let limiter = Arc::new(RateLimiter::new(Arc::new(RateLimitSettings::new())));

        let providers = overrides.providers.unwrap_or_else(ProviderMap::standard);
        let domains: Arc<dyn DomainExecutor> = overrides
            .domains
            .unwrap_or_else(|| Arc::new(NullDomainExecutor));
        let tools: Arc<dyn ToolExecutor> = overrides
            .tools
            .unwrap_or_else(|| Arc::new(NullToolExecutor));
        let web_driver: Arc<dyn WebDriver> = overrides
            .web_driver
            .unwrap_or_else(|| Arc::new(NullWebDriver));

        let web = Arc::new(WebSessionManager::new(web_driver));

        let engine_ctx = Arc::new(EngineContext {
            store: store.clone(),
            bus: bus.clone(),
            limiter: limiter.clone(),
            providers: providers.clone(),
            domains,
            tools,
            web: web.clone(),
            chat: config.chat.clone(),
            retry: overrides.retry.unwrap_or_default(),
        });
        let engine = AsyncEngine::new(engine_ctx);

        let pool = WorkerPool::new(
            config.worker.clone(),
            config.server.database_url.clone(),
            bus.clone(),
            store.clone(),
        );

        let router = ModelRouter::new(providers.clone());
        let dispatcher = Arc::new(Dispatcher::new(engine, pool, router));

        let versioning = Arc::new(VersioningService::new(store.clone()));
        let terminals = Arc::new(TerminalManager::new(store.clone()));

        info!("Application state initialized");
        Ok(Self {
            store,
            bus,
            limiter,
            providers,
            dispatcher,
            versioning,
            terminals,
            web,
            config,
        })
    }
}
