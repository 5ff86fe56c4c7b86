//! Process entry point: XMPP connection flags, logging, and the composition
//! root wiring external adapters into the core components.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use jicofo_core::adapters::{
    AllocatedChannels, BridgeControlAdapter, BridgeDiscoveryAdapter, BridgeDiscoveryEvent, ChannelAllocationError,
    FeatureDiscoveryAdapter, OfferContents, SessionAdapter, SupportedFeatures,
};
use jicofo_core::allocator::BridgeControlFactory;
use jicofo_core::bridge::{
    BridgeRegistry, BridgeSelector, HealthCheckAdapter, HealthCheckOutcome, HealthChecker, HealthCheckerConfig,
    SelectionStrategy,
};
use jicofo_core::events::BridgeEvent;
use jicofo_core::source::{MediaSourceGroupMap, MediaSourceMap};
use jicofo_core::{ConferenceController, JicofoConfig};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// XMPP connection flags (§6 CLI surface).
#[derive(Parser, Debug)]
#[command(name = "jicofo", version, about = "Conference focus component")]
struct Cli {
    #[arg(long, default_value = "localhost")]
    host: String,

    #[arg(long, default_value_t = 5347)]
    port: u16,

    #[arg(long)]
    domain: Option<String>,

    #[arg(long, default_value = "focus")]
    subdomain: String,

    #[arg(long)]
    secret: Option<String>,

    #[arg(long)]
    user_domain: Option<String>,

    #[arg(long)]
    user_name: Option<String>,

    #[arg(long)]
    user_password: Option<String>,

    #[arg(long, default_value = "single")]
    bridge_selection_strategy: String,
}

fn resolve_secret(flag: Option<String>, env_var: &str) -> Option<String> {
    flag.or_else(|| std::env::var(env_var).ok())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_logging();

    let cli = Cli::parse();
    tracing::info!(host = cli.host, port = cli.port, subdomain = cli.subdomain, "starting jicofo");

    let secret = resolve_secret(cli.secret, "JICOFO_SECRET");
    let user_password = resolve_secret(cli.user_password, "JICOFO_AUTH_PASSWORD");
    if secret.is_none() && user_password.is_none() {
        bail!("no component secret or user password configured (set --secret/--user_password or JICOFO_SECRET/JICOFO_AUTH_PASSWORD)");
    }

    let mut config = JicofoConfig::default();
    config.bridge_selection_strategy = SelectionStrategy::from_config_name(&cli.bridge_selection_strategy);

    let registry = Arc::new(BridgeRegistry::new(config.bridge_failure_reset_threshold));
    let selector = Arc::new(BridgeSelector::new(config.bridge_selection_strategy, config.bridge_failure_reset_threshold));
    let session: Arc<dyn SessionAdapter> = Arc::new(LoggingSessionAdapter);
    let feature_discovery: Arc<dyn FeatureDiscoveryAdapter> = Arc::new(LoggingFeatureDiscoveryAdapter);
    let bridge_control: Arc<dyn BridgeControlFactory> = Arc::new(LoggingBridgeControlFactory);

    let controller = Arc::new(ConferenceController::new(
        format!("{}.{}", cli.subdomain, cli.domain.as_deref().unwrap_or("meet.example.com")),
        config.max_sources_per_user,
        config.enable_lip_sync,
        config.open_sctp,
        registry.clone(),
        selector,
        session,
        feature_discovery,
        bridge_control,
    ));

    // C5: per-bridge health probing, started/stopped as bridge-discovery
    // events arrive (§4.5).
    let health_checker = Arc::new(HealthChecker::new(
        Arc::new(LoggingHealthCheckAdapter),
        registry.clone(),
        HealthCheckerConfig {
            interval: config.health_check_interval,
            request_timeout: config.health_check_retry,
            second_chance_delay: config.health_check_retry,
        },
    ));

    // §6 item 4: bridge-discovery push notifications feed the registry and
    // drive the health-checker's task lifecycle.
    let bridge_discovery: Arc<dyn BridgeDiscoveryAdapter> = Arc::new(LoggingBridgeDiscoveryAdapter);
    {
        let registry = registry.clone();
        let health_checker = health_checker.clone();
        bridge_discovery.subscribe_bridge_updates(Box::new(move |event| match event {
            BridgeDiscoveryEvent::BridgeUp { jid, version } => {
                registry.add_bridge(&jid, version);
                health_checker.start_for_bridge(&jid);
            }
            BridgeDiscoveryEvent::BridgeDown { jid } => {
                health_checker.stop_for_bridge(&jid);
                registry.remove_bridge(&jid);
            }
            BridgeDiscoveryEvent::BridgeStats { jid, stats } => {
                registry.set_stats(&jid, stats);
            }
        }));
    }

    // C5 emits bridge-down events that C9 translates into per-participant
    // re-invites (§4.9, §5).
    {
        let controller = controller.clone();
        let mut events = registry.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                match event {
                    BridgeEvent::Down { bridge_jid } | BridgeEvent::HealthCheckFailed { bridge_jid } => {
                        controller.on_bridge_down(&bridge_jid).await;
                    }
                    BridgeEvent::Up { .. } | BridgeEvent::VideoStreamsChanged { .. } => {}
                }
            }
        });
    }

    tracing::info!("jicofo composition root wired, entering idle wait (chat-room/session transport not attached in this build)");
    tokio::signal::ctrl_c().await.context("failed to wait for shutdown signal")?;
    health_checker.shutdown().await;
    tracing::info!("shutting down");
    Ok(())
}

/// Placeholder session adapter: logs what would be sent over the wire. A
/// real deployment replaces this with the Jingle/XMPP transport (out of
/// scope for the core, §1).
struct LoggingSessionAdapter;

#[async_trait::async_trait]
impl SessionAdapter for LoggingSessionAdapter {
    async fn initiate_session(&self, target_jid: &str, _contents: &OfferContents, _start_muted: (bool, bool)) -> bool {
        tracing::debug!(target_jid, "session-initiate (no transport attached)");
        false
    }

    async fn replace_transport(&self, target_jid: &str, _contents: &OfferContents, _start_muted: (bool, bool)) -> bool {
        tracing::debug!(target_jid, "transport-replace (no transport attached)");
        false
    }

    async fn send_add_source(&self, target_jid: &str, _sources: &MediaSourceMap, _groups: &MediaSourceGroupMap) {
        tracing::debug!(target_jid, "source-add (no transport attached)");
    }

    async fn send_remove_source(&self, target_jid: &str, _sources: &MediaSourceMap, _groups: &MediaSourceGroupMap) {
        tracing::debug!(target_jid, "source-remove (no transport attached)");
    }

    async fn terminate_session(&self, target_jid: &str, reason: &str, _message: &str) {
        tracing::debug!(target_jid, reason, "session-terminate (no transport attached)");
    }
}

struct LoggingFeatureDiscoveryAdapter;

#[async_trait::async_trait]
impl FeatureDiscoveryAdapter for LoggingFeatureDiscoveryAdapter {
    async fn discover_features(&self, jid: &str) -> std::result::Result<SupportedFeatures, String> {
        tracing::debug!(jid, "feature discovery (no transport attached)");
        Err("no discovery transport attached".to_string())
    }
}

struct LoggingBridgeControlFactory;

struct LoggingBridgeControlAdapter;

#[async_trait::async_trait]
impl BridgeControlAdapter for LoggingBridgeControlAdapter {
    async fn create_channels(
        &self,
        endpoint_id: &str,
        _stat_id: &str,
        _initiator: bool,
        _contents: &OfferContents,
    ) -> std::result::Result<AllocatedChannels, ChannelAllocationError> {
        tracing::debug!(endpoint_id, "create_channels (no bridge control attached)");
        Err(ChannelAllocationError::Other { reason: "no bridge control attached".into() })
    }

    async fn expire_channels(&self, endpoint_id: &str) {
        tracing::debug!(endpoint_id, "expire_channels (no bridge control attached)");
    }

    fn is_disposed(&self) -> bool {
        false
    }
}

impl BridgeControlFactory for LoggingBridgeControlFactory {
    fn get(&self, _bridge_jid: &str) -> Arc<dyn BridgeControlAdapter> {
        Arc::new(LoggingBridgeControlAdapter)
    }
}

/// Placeholder health-check adapter: no `checkHealth` IQ transport attached
/// in this build, so every bridge is reported unsupported rather than faked
/// as healthy (§6 item 5).
struct LoggingHealthCheckAdapter;

#[async_trait::async_trait]
impl HealthCheckAdapter for LoggingHealthCheckAdapter {
    async fn check_health(&self, bridge_jid: &str, _timeout: Duration) -> HealthCheckOutcome {
        tracing::debug!(bridge_jid, "check_health (no transport attached)");
        HealthCheckOutcome::Timeout
    }

    fn supports_health_check(&self, _bridge_jid: &str) -> bool {
        false
    }
}

/// Placeholder bridge-discovery adapter: no MUC/presence transport attached
/// in this build, so the callback is stored but never invoked (§6 item 4).
struct LoggingBridgeDiscoveryAdapter;

impl BridgeDiscoveryAdapter for LoggingBridgeDiscoveryAdapter {
    fn subscribe_bridge_updates(&self, _callback: Box<dyn Fn(BridgeDiscoveryEvent) + Send + Sync>) {
        tracing::debug!("subscribe_bridge_updates (no discovery transport attached)");
    }
}
