use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use rusqlite::Connection;
use tracing::{info, warn};

mod app;
mod bus_consumer;
mod http;
mod mcp_bridge;
mod mcp_lifecycle;
mod reminder_dispatch;
mod stop;
mod update;
mod ws;

use nanobot_agent::claude_cli::ClaudeCliProvider;
use nanobot_agent::mcp_adapter::McpRuntime;
use nanobot_agent::prompt::PromptBuilder;
use nanobot_agent::router;
use nanobot_agent::runtime::AgentRuntime;
use nanobot_core::config::{MemoryMaintenanceConfig, NanobotConfig};
use nanobot_core::reminder::SystemEventAction;
use nanobot_core::types::ChannelOutbound;
use nanobot_discord::adapter::DiscordAdapter;
use nanobot_memory::manager::MemoryManager;
use nanobot_scheduler::{Schedule, SchedulerEngine, SchedulerHandle};
use nanobot_sessions::SessionManager;
use nanobot_telegram::adapter::TelegramAdapter;
use nanobot_terminal::manager::TerminalManager;
use nanobot_users::resolver::UserResolver;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // `nanobot-gateway mcp-bridge` runs a stdio MCP server for Claude Code
    // instead of the HTTP/WS gateway — must not touch stdout for logging,
    // since the JSON-RPC frames share that stream.
    if std::env::args().nth(1).as_deref() == Some("mcp-bridge") {
        let config_path = std::env::var("NANOBOT_CONFIG").ok();
        let config = NanobotConfig::load(config_path.as_deref()).unwrap_or_default();
        return mcp_bridge::run(&config);
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nanobot_gateway=info,tower_http=debug".into()),
        )
        .init();

    // load config: explicit path > NANOBOT_CONFIG env > ~/.nanobot/nanobot.toml
    let config_path = std::env::var("NANOBOT_CONFIG").ok();
    let config = NanobotConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        NanobotConfig::default()
    });

    mcp_lifecycle::ensure_mcp_registration(&config);

    let bind = config.gateway.bind.clone();
    let port = config.gateway.port;

    if let Some(parent) = Path::new(&config.database.path).parent() {
        std::fs::create_dir_all(parent).ok();
    }

    let agent = build_agent_runtime(&config)?;
    let memory = MemoryManager::new(open_db(&config.database.path)?);
    let sessions = SessionManager::new(open_db(&config.database.path)?);
    let users = UserResolver::new(Arc::new(std::sync::Mutex::new(open_db(&config.database.path)?)));
    let scheduler = SchedulerHandle::new(open_db(&config.database.path)?)?;
    seed_system_jobs(&scheduler, &config.memory_maintenance)?;
    let terminal = TerminalManager::new();
    let mcp = Arc::new(McpRuntime::start(&config.mcp).await);

    let (fired_tx, fired_rx) = tokio::sync::mpsc::channel(64);
    let engine = SchedulerEngine::new(open_db(&config.database.path)?, Some(fired_tx))?;
    let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(engine.run(shutdown_rx));
    // _shutdown_tx has no trigger point yet (the gateway runs until killed);
    // held here so the watch channel doesn't close under the engine's recv.

    let channels = config.channels.clone();

    let bus = nanobot_channels::bus::MessageBus::new();
    let bus_inbound = bus.inbound_sender();

    let max_concurrent_subagents = config.agent.max_concurrent_subagents;
    let state = Arc::new(app::AppState::new(
        config, agent, users, memory, sessions, scheduler, terminal, mcp, bus_inbound,
    ));
    state.attach_subagents(
        std::env::current_dir().unwrap_or_else(|_| Path::new(".").to_path_buf()),
        max_concurrent_subagents,
    );
    let router = app::build_router(state.clone());

    tokio::spawn(bus_consumer::run(state.clone(), bus));

    let mut delivery_senders = reminder_dispatch::DeliverySenders::default();

    if let Some(discord_cfg) = channels.discord.clone() {
        let (delivery_tx, delivery_rx) = tokio::sync::mpsc::channel(64);
        delivery_senders.discord = Some(delivery_tx);
        let adapter = DiscordAdapter::new(&discord_cfg, state.clone());
        tokio::spawn(adapter.run(Some(delivery_rx)));
    }

    if let Some(telegram_cfg) = channels.telegram.clone() {
        let (delivery_tx, delivery_rx) = tokio::sync::mpsc::channel(64);
        let (outbound_tx, outbound_rx) = tokio::sync::mpsc::channel::<ChannelOutbound>(64);
        delivery_senders.telegram = Some(delivery_tx);
        state.channel_senders.insert("telegram".to_string(), outbound_tx);
        let adapter = TelegramAdapter::new(&telegram_cfg, state.clone());
        tokio::spawn(adapter.run(Some(delivery_rx), Some(outbound_rx)));
    }

    tokio::spawn(reminder_dispatch::run(state.clone(), delivery_senders, fired_rx));

    let addr: SocketAddr = format!("{}:{}", bind, port).parse()?;
    info!("nanobot gateway listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}

fn open_db(path: &str) -> anyhow::Result<Connection> {
    Ok(Connection::open(path)?)
}

/// Idempotently seed the two `system:`-named maintenance jobs the auto-memory
/// pipeline (C10) runs on. Skipped if a job with the same id already exists,
/// so restarts don't reset `state`/`next_run`.
fn seed_system_jobs(scheduler: &SchedulerHandle, cfg: &MemoryMaintenanceConfig) -> anyhow::Result<()> {
    seed_system_job(
        scheduler,
        "system:memory_auto_integrate",
        "memory_auto_integrate",
        cfg.auto_integrate_interval_min * 60,
    )?;
    seed_system_job(
        scheduler,
        "system:memory_maintenance",
        "memory_maintenance",
        cfg.maintenance_tick_interval_min * 60,
    )?;
    Ok(())
}

fn seed_system_job(scheduler: &SchedulerHandle, id: &str, event: &str, every_secs: u64) -> anyhow::Result<()> {
    if scheduler.get_job(id)?.is_some() {
        return Ok(());
    }
    let action = SystemEventAction {
        event: event.to_string(),
        state: serde_json::json!({}),
    };
    scheduler.add_job_full(
        Some(id.to_string()),
        id,
        Schedule::Interval { every_secs },
        &serde_json::to_string(&action)?,
        true,
        false,
    )?;
    info!(job_id = id, "seeded system maintenance job");
    Ok(())
}

/// Build the agent's provider router from `[providers]`, falling back to
/// driving the Claude Code CLI directly when nothing is configured.
fn build_agent_runtime(config: &NanobotConfig) -> anyhow::Result<AgentRuntime> {
    let prompt = PromptBuilder::load(config.agent.soul_path.as_deref(), None);
    let model = config.agent.model.clone();

    let provider: Box<dyn nanobot_agent::provider::LlmProvider> =
        match router::build_from_config(&config.providers) {
            Some(r) => Box::new(r),
            None => {
                warn!("no LLM provider configured, falling back to the Claude Code CLI");
                Box::new(ClaudeCliProvider::new("claude".to_string()))
            }
        };

    Ok(AgentRuntime::new(provider, prompt, model, config.clone()))
}
