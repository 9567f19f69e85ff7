//! Shared application state, assembled once at startup.

use std::sync::Arc;
use std::time::Instant;

use switchboard_core::audit::AuditRecorder;
use switchboard_core::auth::{RevocationCache, TokenValidator};
use switchboard_core::config::GatewayConfig;
use switchboard_core::confirm::ConfirmationStore;
use switchboard_core::orchestrator::Orchestrator;
use switchboard_core::providers::llm::LlmClient;
use switchboard_core::routing::RoleRouter;
use switchboard_core::screen::AbuseFilter;
use switchboard_core::store::ControlStore;
use switchboard_core::tools::ToolClient;

pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub validator: TokenValidator,
    pub revocations: Arc<RevocationCache>,
    pub router: RoleRouter,
    pub filter: Arc<AbuseFilter>,
    pub tools: Arc<ToolClient>,
    pub confirmations: ConfirmationStore,
    pub orchestrator: Arc<Orchestrator>,
    pub audit: Arc<AuditRecorder>,
    pub store: ControlStore,
    pub started_at: Instant,
}

pub type SharedState = Arc<AppState>;

/// Wire the core components together. The model client is injected so
/// tests can script it; production passes the configured provider.
pub fn build_state(config: GatewayConfig, llm: Arc<dyn LlmClient>) -> anyhow::Result<SharedState> {
    let config = Arc::new(config);

    let store = ControlStore::open(&config.store_path)
        .map_err(|e| anyhow::anyhow!("opening control store: {}", e))?;

    let validator = TokenValidator::from_settings(config.auth.clone())?;
    let revocations = RevocationCache::new(config.auth.fail_closed);

    let descriptors = config.descriptors();
    let router = RoleRouter::new(descriptors, config.all_access_role.clone());

    let filter = Arc::new(AbuseFilter::new(
        &config.filter.extra_blocklist,
        config.filter.max_query_chars,
    )?);

    let tools = Arc::new(ToolClient::new(
        &config.servers,
        config.timeouts.clone(),
        &config.breaker,
    )?);

    let confirmations = ConfirmationStore::new(store.clone());
    let audit = Arc::new(AuditRecorder::new(config.audit_log.as_deref()));

    let orchestrator = Orchestrator::new(
        llm,
        Arc::clone(&tools) as Arc<dyn switchboard_core::tools::ToolInvoker>,
        confirmations.clone(),
        Arc::clone(&filter),
        Arc::clone(&audit),
        &config.turn,
    );

    Ok(Arc::new(AppState {
        config,
        validator,
        revocations,
        router,
        filter,
        tools,
        confirmations,
        orchestrator,
        audit,
        store,
        started_at: Instant::now(),
    }))
}
