//! Assembles every component crate into one running deployment: the
//! same dependency graph the gateway command wires together for the
//! agent loop, replayed here for the Flow Engine.

use std::sync::Arc;

use anyhow::{Context, Result};
use flowmail_core::config::Config;
use flowmail_core::utils::{expand_home, get_data_path};
use flowmail_engine::{FlowStore, LlmDecisionMaker};
use flowmail_gateway::{HttpGatewayTransport, LocalTransport, Transport};
use flowmail_identity::IdentityView;
use flowmail_llm::{HttpLlmProvider, LlmProvider};
use flowmail_router::Router;
use flowmail_store::MailStore;
use flowmail_tools::{
    backends::calendar::{CalendarTool, InMemoryCalendarBackend},
    backends::datasafe::{DatasafeDownloadTool, InMemoryDatasafeBackend},
    backends::directory::{DirectoryTool, InMemoryDirectoryBackend},
    backends::email_action::EmailActionTool,
    backends::kanban::{InMemoryKanbanBackend, KanbanTool},
    ToolRegistry,
};

/// Every live component a running deployment needs, built once at
/// startup and shared behind `Arc` across the webhook server, the
/// sweeper, and the CLI's flow-introspection commands.
pub struct Components {
    pub config: Config,
    pub identity: Arc<IdentityView>,
    pub mail: Arc<MailStore>,
    pub flows: Arc<FlowStore>,
    pub router: Arc<Router>,
    pub engine: Arc<flowmail_engine::FlowEngine>,
}

/// Path to the admin-managed identity snapshot. Out of scope to write;
/// this only needs to know where to read it from.
pub fn identity_path() -> std::path::PathBuf {
    if let Ok(p) = std::env::var("FLOWMAIL_IDENTITY_PATH") {
        return std::path::PathBuf::from(expand_home(&p));
    }
    get_data_path().join("identity.json")
}

pub fn build(config: Config) -> Result<Components> {
    let data_dir = get_data_path();
    std::fs::create_dir_all(&data_dir).context("failed to create data directory")?;

    let identity = Arc::new(IdentityView::load(identity_path()).context("failed to load identity snapshot")?);
    let mail = Arc::new(MailStore::open(&data_dir).context("failed to open mail store")?);
    let flows = Arc::new(FlowStore::open(&data_dir).context("failed to open flow store")?);

    let transport: Arc<dyn Transport> = match (&config.gateway.mailgun_key, &config.gateway.mailgun_domain) {
        (Some(key), Some(domain)) => Arc::new(HttpGatewayTransport::new(
            reqwest::Client::new(),
            "https://api.mailgun.net",
            domain.clone(),
            key.clone(),
        )),
        _ => Arc::new(LocalTransport::new()),
    };
    let router = Arc::new(Router::new(mail.clone(), transport));

    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(EmailActionTool::new(mail.clone(), router.clone())));
    tools.register(Arc::new(CalendarTool::new(Box::new(InMemoryCalendarBackend::default()))));
    tools.register(Arc::new(DirectoryTool::new(Box::new(InMemoryDirectoryBackend::default()))));
    tools.register(Arc::new(KanbanTool::new(Box::new(InMemoryKanbanBackend::default()))));
    tools.register(Arc::new(DatasafeDownloadTool::new(Box::new(InMemoryDatasafeBackend::default()))));
    let tools = Arc::new(tools);

    let provider: Arc<dyn LlmProvider> =
        Arc::new(HttpLlmProvider::new(config.llm.api_base.clone(), config.llm.api_key.clone()));
    let decision_maker = Arc::new(LlmDecisionMaker::new(
        provider,
        tools.clone(),
        config.llm.model_default.clone(),
        config.llm.model_tools.clone(),
        config.engine.tool_loop_cap,
    ));

    let engine = Arc::new(flowmail_engine::FlowEngine::new(
        identity.clone(),
        mail.clone(),
        flows.clone(),
        router.clone(),
        tools,
        decision_maker,
        config.engine.max_rounds_default,
        config.engine.timeout_minutes_default,
    ));

    Ok(Components { config, identity, mail, flows, router, engine })
}
