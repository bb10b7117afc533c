use pulse_alert::dispatch::Dispatcher;
use pulse_alert::engine::AlertEngine;
use pulse_alert::{ThresholdConfig, ThresholdOverride};
use pulse_notify::webhook::WebhookNotifier;
use pulse_notify::{LogNotifier, Notifier};
use pulse_server::bus::ConfigBus;
use pulse_server::discovery::DiscoveryScanner;
use pulse_server::hub::StateHub;
use pulse_server::poller::{RateCache, Supervisor};
use pulse_server::app;
use pulse_server::state::AppState;
use pulse_store::system::{
    SystemSettings, WebhookSettings, OVERRIDES_FILE, SYSTEM_FILE, THRESHOLDS_FILE, WEBHOOKS_FILE,
};
use pulse_store::{HistoryRing, NodeStore, StoreError};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::signal;
use tracing_subscriber::EnvFilter;

/// Exit code for unreadable/invalid configuration.
const EXIT_CONFIG: i32 = 2;
/// Exit code for an encryption-key mismatch on the credential store.
const EXIT_CRYPTO: i32 = 3;

fn fail(e: StoreError) -> ! {
    let code = match e {
        StoreError::Crypto(_) => EXIT_CRYPTO,
        _ => EXIT_CONFIG,
    };
    tracing::error!(error = %e, "startup failed");
    std::process::exit(code);
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pulse=info")),
        )
        .init();

    let data_dir = PathBuf::from(
        std::env::args()
            .nth(1)
            .unwrap_or_else(|| "./data".to_string()),
    );
    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        tracing::error!(path = %data_dir.display(), error = %e, "cannot create data directory");
        std::process::exit(EXIT_CONFIG);
    }

    let settings: SystemSettings =
        match pulse_store::system::load_json_or_default(&data_dir.join(SYSTEM_FILE)) {
            Ok(s) => s,
            Err(e) => fail(e),
        };

    let node_store = match NodeStore::open(&data_dir) {
        Ok(s) => Arc::new(s),
        Err(e) => fail(e),
    };
    let nodes = match node_store.load() {
        Ok(nodes) => nodes,
        Err(e) => fail(e),
    };
    tracing::info!(
        nodes = nodes.len(),
        data_dir = %data_dir.display(),
        poll_interval_secs = settings.poll_interval_secs,
        "pulse starting"
    );

    let mut threshold_config: ThresholdConfig =
        match pulse_store::system::load_json_or_default(&data_dir.join(THRESHOLDS_FILE)) {
            Ok(c) => c,
            Err(e) => fail(e),
        };
    let overrides: HashMap<String, ThresholdOverride> =
        match pulse_store::system::load_json_or_default(&data_dir.join(OVERRIDES_FILE)) {
            Ok(o) => o,
            Err(e) => fail(e),
        };
    if !overrides.is_empty() {
        threshold_config.overrides = overrides;
    }

    let webhooks: WebhookSettings =
        match pulse_store::system::load_json_or_default(&data_dir.join(WEBHOOKS_FILE)) {
            Ok(w) => w,
            Err(e) => fail(e),
        };
    let notifiers: Vec<Arc<dyn Notifier>> = if webhooks.urls.is_empty() {
        vec![Arc::new(LogNotifier)]
    } else {
        webhooks
            .urls
            .iter()
            .map(|url| Arc::new(WebhookNotifier::new(url.clone())) as Arc<dyn Notifier>)
            .collect()
    };

    let (dispatcher, drain_handle) = Dispatcher::spawn(notifiers);
    let engine = Arc::new(Mutex::new(AlertEngine::new(threshold_config)));
    let hub = StateHub::new();
    let history = Arc::new(Mutex::new(HistoryRing::default()));
    let rates = Arc::new(RateCache::new());
    let bus = ConfigBus::new();
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let supervisor = Supervisor::new(
        Duration::from_secs(settings.poll_interval_secs.max(1)),
        settings.upstream_timeout_secs,
        rates,
        hub.clone(),
        history.clone(),
        engine.clone(),
        dispatcher.clone(),
        bus.clone(),
        shutdown_rx,
    );
    let supervisor_handle = tokio::spawn(supervisor.run(nodes.clone()));

    let state = AppState {
        hub: hub.clone(),
        history,
        engine,
        dispatcher: dispatcher.clone(),
        node_store,
        nodes: Arc::new(RwLock::new(nodes)),
        bus,
        settings: Arc::new(settings.clone()),
        data_dir,
        start_time: chrono::Utc::now(),
    };

    let discovery_handle = if settings.discovery_enabled {
        let scanner = DiscoveryScanner::new(
            state.clone(),
            Duration::from_secs(settings.discovery_interval_secs.max(30)),
        );
        Some(tokio::spawn(scanner.run()))
    } else {
        tracing::info!("discovery scanner disabled");
        None
    };

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], settings.listen_port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "cannot bind listener");
            std::process::exit(EXIT_CONFIG);
        }
    };
    tracing::info!(addr = %addr, "serving");

    let router = app::build_router(state.clone());
    let serve = axum::serve(listener, router)
        .with_graceful_shutdown(async {
            signal::ctrl_c().await.ok();
        })
        .await;
    if let Err(e) = serve {
        tracing::error!(error = %e, "HTTP server error");
    }

    // Shutdown: stop workers, then drain the notifier queue with a bounded
    // grace period.
    tracing::info!("shutting down");
    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(2), supervisor_handle).await;
    if let Some(handle) = discovery_handle {
        handle.abort();
    }
    drop(state);
    drop(dispatcher);
    match tokio::time::timeout(Duration::from_secs(5), drain_handle).await {
        Ok(_) => tracing::info!("notifier queue drained"),
        Err(_) => tracing::warn!("notifier queue not drained within the shutdown deadline"),
    }
    tracing::info!("stopped");
}
