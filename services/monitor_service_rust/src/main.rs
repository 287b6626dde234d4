mod config;
mod onebot_client;

use anyhow::{Context, Result};
use async_trait::async_trait;
use config::Config;
use dotenv::dotenv;
use onebot_client::OneBotClient;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use worldstate_core::monitor::{
    FissureMonitor, NodeDirectory, VoidTraderMonitor, ZarimanBountyMonitor,
};
use worldstate_core::subscriptions::JsonFileSubscriptionStore;
use worldstate_core::{
    CoreConfig, HttpWorldStateFetcher, LogSink, MonitorContext, MonitorEngine, NotificationSink,
    SubscriptionMatcher, WorldStateClient, WorldStateListener, WorldStateSnapshot,
};

/// Logs every new snapshot the shared client produces.
struct SnapshotLogger;

#[async_trait]
impl WorldStateListener for SnapshotLogger {
    async fn on_snapshot(&self, snapshot: Arc<WorldStateSnapshot>) -> Result<()> {
        let fissures = snapshot
            .payload
            .get("ActiveMissions")
            .and_then(|v| v.as_array())
            .map(Vec::len);
        info!(
            platform = %snapshot.platform,
            version = snapshot.version,
            fissures = ?fissures,
            "New world state snapshot"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    info!("Starting Worldstate Monitor Service...");

    // Config: any error here is fatal before a loop starts
    let core_config = CoreConfig::from_env().context("Invalid core configuration")?;
    let config = Config::from_env().context("Invalid service configuration")?;

    // World state
    let fetcher = HttpWorldStateFetcher::new(
        core_config.endpoints(),
        core_config.world_state.request_timeout,
    )?;
    let client = Arc::new(WorldStateClient::new(
        Arc::new(fetcher),
        &core_config.world_state,
    ));
    client.subscribe(Arc::new(SnapshotLogger));

    // Subscriptions
    let store = Arc::new(JsonFileSubscriptionStore::new(&config.subscriptions_path));
    let matcher = Arc::new(SubscriptionMatcher::load(
        store,
        core_config.max_subscriptions_per_owner,
    ));
    info!(
        "Subscriptions: {} criteria from {}",
        matcher.len(),
        config.subscriptions_path.display()
    );

    // Sink
    let sink: Arc<dyn NotificationSink> = if config.dry_run {
        warn!("DRY_RUN enabled: notifications are logged, not sent");
        Arc::new(LogSink)
    } else {
        Arc::new(OneBotClient::new(
            config.onebot_api_base_url.clone(),
            config.onebot_access_token.clone(),
            config.onebot_timeout,
        )?)
    };

    // Node names
    let nodes = match &config.nodes_path {
        Some(path) => NodeDirectory::load(path).unwrap_or_else(|e| {
            error!("Node names unavailable, using raw ids: {:#}", e);
            NodeDirectory::empty()
        }),
        None => NodeDirectory::empty(),
    };

    // Monitors
    let ctx = MonitorContext::new(client.clone(), matcher.clone(), sink);
    let platform = core_config.world_state.platform.clone();

    let fissure = MonitorEngine::new(
        FissureMonitor::new(
            platform.clone(),
            nodes.clone(),
            core_config.fissure.display_targets.clone(),
        ),
        ctx.clone(),
        &core_config.fissure,
    );
    let void_trader = MonitorEngine::new(
        VoidTraderMonitor::new(
            platform,
            nodes.clone(),
            core_config.void_trader.display_targets.clone(),
        ),
        ctx.clone(),
        &core_config.void_trader,
    );
    let zariman = MonitorEngine::new(
        ZarimanBountyMonitor::new(
            core_config.zariman_target_node.clone(),
            &core_config.zariman_target_challenges,
            nodes,
            core_config.zariman.display_targets.clone(),
        ),
        ctx,
        &core_config.zariman,
    );

    fissure.start().await;
    void_trader.start().await;
    zariman.start().await;
    info!("All monitors running");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received, stopping monitors...");

    tokio::join!(fissure.stop(), void_trader.stop(), zariman.stop());

    let cache = client.cache_info(&core_config.world_state.platform);
    info!(
        version = ?cache.version,
        age_secs = ?cache.age_secs,
        "Worldstate Monitor Service stopped"
    );
    Ok(())
}
