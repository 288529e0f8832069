//! Process root: wire the store, registry, cache and workers once, then run
//! until ctrl-c. The HTTP/API layer and the real message-bus bridge attach to
//! the library handles (`StateManager`, `CalibrationManager`, `DmxControl`);
//! a headless gateway still ingests, tracks and drives DMX.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use stagetrack_gateway::dmx::engine::DmxEngine;
use stagetrack_gateway::dmx::frame::FixtureProfile;
use stagetrack_gateway::events::EventLog;
use stagetrack_gateway::ingress;
use stagetrack_gateway::publisher::{ChannelPublisher, Publisher};
use stagetrack_gateway::range_cache::RangeCache;
use stagetrack_gateway::registry::AnchorRegistry;
use stagetrack_gateway::settings::{keys, Settings};
use stagetrack_gateway::state::{StateManager, SystemState};
use stagetrack_gateway::store::Store;
use stagetrack_gateway::tracking::TrackingEngine;
use stagetrack_gateway::clock;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stagetrack=info,stagetrack_gateway=info".into()),
        )
        .init();

    info!("StageTrack gateway v{} starting", env!("CARGO_PKG_VERSION"));

    let store_path = env_or("STAGETRACK_STORE", "stagetrack.json");
    let events_path = env_or("STAGETRACK_EVENTS", "events.jsonl");
    let udp_port: u16 = env_or("STAGETRACK_UDP_PORT", "")
        .parse()
        .unwrap_or(ingress::DEFAULT_UDP_PORT);

    let store = Store::open(&store_path).await;

    // runtime states do not survive a restart; an operator re-arms LIVE
    let boot_state = store.get_setting(keys::SYSTEM_STATE).await;
    if matches!(boot_state.as_deref(), Some("LIVE") | Some("CALIBRATION")) {
        store
            .set_setting(keys::SYSTEM_STATE, SystemState::Setup.as_str(), clock::now_ms())
            .await;
        info!("reset stale {} state to SETUP", boot_state.unwrap_or_default());
    }
    // a fresh store still needs one patchable fixture type
    if store.profiles().await.is_empty() {
        store
            .upsert_profile("basic-moving-head", FixtureProfile::basic_moving_head(), clock::now_ms())
            .await;
    }

    let settings = Settings::new(store.clone());
    let rates = settings.rates().await;

    let events = EventLog::new(Some(events_path.into()));
    let cache = Arc::new(RangeCache::new(rates.lost_timeout_ms));
    let registry = Arc::new(AnchorRegistry::new(store.clone()));

    let (publisher, mut outbox) = ChannelPublisher::new(256);
    let publisher: Arc<dyn Publisher> = Arc::new(publisher);

    let tracking = Arc::new(TrackingEngine::new(
        cache.clone(),
        registry.clone(),
        settings.clone(),
        publisher.clone(),
    ));
    let state = Arc::new(StateManager::new(
        store.clone(),
        registry.clone(),
        events.clone(),
        tracking.latest(),
    ));
    let dmx = DmxEngine::new(store.clone(), state.clone(), events.clone(), tracking.latest());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ingestion: UDP datagrams → parsed batches → cache + device upkeep
    let (batch_tx, batch_rx) = mpsc::channel(256);
    tokio::spawn(ingress::run_ingest(
        batch_rx,
        cache.clone(),
        store.clone(),
        shutdown_rx.clone(),
    ));
    tokio::spawn(ingress::run_udp_ingress(
        udp_port,
        batch_tx,
        state.clone(),
        shutdown_rx.clone(),
    ));

    tokio::spawn(tracking.clone().run(shutdown_rx.clone()));
    tokio::spawn(dmx.run(shutdown_rx.clone()));

    // outbound payloads; the bus bridge consumes this channel in a full
    // deployment, a headless gateway just traces them
    tokio::spawn(async move {
        while let Some(msg) = outbox.recv().await {
            debug!("outbound {}: {}", msg.topic, msg.payload);
        }
    });

    tokio::signal::ctrl_c().await.ok();
    info!("shutting down");
    shutdown_tx.send(true).ok();
    // give every worker one tick to notice before transports drop
    tokio::time::sleep(Duration::from_millis(200)).await;
}
