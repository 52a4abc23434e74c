mod config;
mod gateway;
mod nudge;
mod orchestrator;
mod participant;
mod rate_limit;
mod reply;
mod scheduler;
mod server;
mod store;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::gateway::http::HttpGateway;
use crate::gateway::ChatGateway;
use crate::nudge::NudgeDispatcher;
use crate::orchestrator::{FollowUpOrchestrator, FollowUpSettings};
use crate::participant::Numbering;
use crate::rate_limit::{CallLimiter, MinIntervalLimiter};
use crate::scheduler::tasks::{register_tasks, Schedules, Sweep};
use crate::scheduler::Scheduler;
use crate::server::AppState;
use crate::store::nudges::NudgeQueue;
use crate::store::sent::SentRegistry;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Command {
    Serve,
    RunOnce,
    Cleanup,
}

/// `followbot [serve|run-once|cleanup] [config.toml]`
fn parse_args(args: &[String]) -> (Command, PathBuf) {
    let (command, rest) = match args.first().map(String::as_str) {
        Some("serve") => (Command::Serve, &args[1..]),
        Some("run-once") => (Command::RunOnce, &args[1..]),
        Some("cleanup") => (Command::Cleanup, &args[1..]),
        _ => (Command::Serve, args),
    };
    let config_path = rest
        .first()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));
    (command, config_path)
}

/// Everything the triggers share
struct Services {
    config: Config,
    gateway: Arc<dyn ChatGateway>,
    limiter: Arc<dyn CallLimiter>,
    numbering: Numbering,
    registry: SentRegistry,
    nudges: NudgeQueue,
    orchestrator: Arc<FollowUpOrchestrator>,
}

impl Services {
    fn build(config: Config) -> Result<Self> {
        let store = Store::open(&config.storage.database_path)?;
        let registry = SentRegistry::new(store.connection());
        let nudges = NudgeQueue::new(store.connection());

        let gateway: Arc<dyn ChatGateway> = Arc::new(HttpGateway::new(config.gateway.clone())?);
        // One limiter for every caller: the upstream limit is per account
        let limiter: Arc<dyn CallLimiter> =
            Arc::new(MinIntervalLimiter::new(config.followup.call_spacing()));
        let numbering = Numbering::new(&config.numbering);

        let orchestrator = Arc::new(FollowUpOrchestrator::new(
            Arc::clone(&gateway),
            registry.clone(),
            Arc::new(nudges.clone()),
            Arc::clone(&limiter),
            numbering.clone(),
            FollowUpSettings::from_config(&config),
        ));

        Ok(Self {
            config,
            gateway,
            limiter,
            numbering,
            registry,
            nudges,
            orchestrator,
        })
    }

    fn sweep(&self) -> Sweep {
        Sweep {
            registry: self.registry.clone(),
            nudges: self.nudges.clone(),
            suppression_window: self.config.registry.suppression_window(),
            nudge_retention: self.config.dispatch.retention(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,followbot=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (command, config_path) = parse_args(&args);

    info!("Loading configuration from: {}", config_path.display());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    info!("Configuration loaded successfully");
    info!("  Trigger: {:?}", config.followup.trigger);
    info!("  Call spacing: {}s", config.followup.call_spacing_secs);
    info!(
        "  Suppression window: {}s",
        config.registry.suppression_window_secs
    );
    info!("  Nudges: {}", config.nudges.len());
    info!("  Database: {}", config.storage.database_path.display());

    let services = Services::build(config)?;

    match command {
        Command::RunOnce => {
            let report = services.orchestrator.run_once().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.success {
                anyhow::bail!("Follow-up pass failed");
            }
        }
        Command::Cleanup => {
            let report = services.sweep().run().await?;
            info!(
                "Old sent numbers cleaned up successfully ({} removed, {} finished nudge(s) purged)",
                report.evicted, report.purged
            );
        }
        Command::Serve => serve(services).await?,
    }

    Ok(())
}

async fn serve(services: Services) -> Result<()> {
    let config = &services.config;
    let suppression_window = config.registry.suppression_window();

    let dispatcher = Arc::new(NudgeDispatcher::new(
        services.nudges.clone(),
        Arc::clone(&services.gateway),
        Arc::clone(&services.limiter),
        config.dispatch.max_attempts,
        config.dispatch.batch_size,
    ));

    let mut scheduler = Scheduler::new().await?;
    register_tasks(
        &scheduler,
        Schedules {
            followup: &config.followup.schedule,
            cleanup: &config.registry.cleanup_schedule,
            dispatch: &config.dispatch.poll_schedule,
        },
        Arc::clone(&services.orchestrator),
        services.sweep(),
        dispatcher,
    )
    .await?;
    scheduler.start().await?;

    let state = AppState {
        orchestrator: Arc::clone(&services.orchestrator),
        registry: services.registry.clone(),
        gateway: Arc::clone(&services.gateway),
        limiter: Arc::clone(&services.limiter),
        numbering: services.numbering.clone(),
        suppression_window,
    };

    info!("Followbot is starting...");
    server::serve(&config.server.bind, state, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown requested");
    })
    .await?;

    scheduler.shutdown().await?;
    Ok(())
}
