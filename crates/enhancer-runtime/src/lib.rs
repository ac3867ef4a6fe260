//! Annotation engine: watches a chat surface, resolves each author's label
//! across the privilege boundary and renders it back onto the entries.

pub mod applier;
pub mod cache;
pub mod client;
pub mod relay;
pub mod store;
pub mod surface;
pub mod watcher;

use std::sync::Arc;
use std::time::Duration;

use enhancer_config::{Config, ConfigError};
use enhancer_contracts::{contracts_manifest_v1, ChannelId, ControlSignal, CONTRACT_VERSION};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub use applier::Applier;
pub use cache::{CacheState, Claim, Resolution, ResolutionCache, Resolver};
pub use client::{FeedClient, Lookup};
pub use relay::{BoundaryPort, Relay, RelayDiagnostics, TransportError};
pub use store::{Persistence, StoreBackend, StoreError};
pub use surface::{
    AnnotationState, ChatEntry, ChatNode, ChatSurface, EntryKind, EntryRef, LabelBasis, LiveChat,
};
pub use watcher::{EntrySink, Watcher};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("resolution client setup failed: {0}")]
    Client(String),
    #[error("engine is stopped")]
    Stopped,
}

type SignalEnvelope = (ControlSignal, oneshot::Sender<()>);

/// Running engine. Dropping the handle stops every task.
pub struct EngineHandle {
    applier: Applier,
    relay: Relay,
    signals: mpsc::Sender<SignalEnvelope>,
    tasks: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    /// Delivers a control signal and waits until it has been applied.
    pub async fn signal(&self, signal: ControlSignal) -> Result<(), EngineError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.signals
            .send((signal, ack_tx))
            .await
            .map_err(|_| EngineError::Stopped)?;
        ack_rx.await.map_err(|_| EngineError::Stopped)
    }

    /// Stores an override on behalf of the nickname editor, then applies it.
    /// Blank labels remove the override.
    pub async fn set_override(&self, key: &ChannelId, label: &str) -> Result<(), EngineError> {
        self.applier.persistence().set_override(key, label).await?;
        self.signal(ControlSignal::OverridesChanged).await
    }

    pub fn applier(&self) -> &Applier {
        &self.applier
    }

    pub fn cache(&self) -> &ResolutionCache {
        self.applier.cache()
    }

    pub fn relay_diagnostics(&self) -> RelayDiagnostics {
        self.relay.diagnostics()
    }

    pub fn shutdown(mut self) {
        self.abort_tasks();
        info!("engine stopped");
    }

    /// Stops the long-lived tasks and cancels the per-key lookup and
    /// render tasks spawned on their behalf.
    fn abort_tasks(&mut self) {
        self.applier.cache().shutdown();
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

/// Starts the engine with the feed client the config describes.
pub async fn start(
    cfg: &Config,
    surface: Arc<dyn ChatSurface>,
) -> Result<EngineHandle, EngineError> {
    let client = FeedClient::new(&cfg.lookup).map_err(EngineError::Client)?;
    start_with_lookup(cfg, surface, Arc::new(client)).await
}

/// Starts the engine over an arbitrary privileged-side lookup.
pub async fn start_with_lookup(
    cfg: &Config,
    surface: Arc<dyn ChatSurface>,
    lookup: Arc<dyn Lookup>,
) -> Result<EngineHandle, EngineError> {
    let manifest = contracts_manifest_v1();
    info!(
        contract_version = CONTRACT_VERSION,
        contracts_sha256 = manifest.contracts_set_sha256,
        store = %cfg.store.kind,
        mode = %cfg.display.mode,
        "starting annotation engine"
    );

    let backend = StoreBackend::from_config(&cfg.store)?;
    let capacity = cfg.relay.queue_capacity;
    let (port, worker) = relay::spawn_privileged_worker(lookup, capacity);
    let (bridge_tx, bridge_rx) = mpsc::channel(capacity);
    let (response_tx, response_rx) = mpsc::channel(capacity);
    let bridge = relay::spawn_bridge(port, bridge_rx, response_tx);
    let (relay, dispatcher) = Relay::spawn(
        bridge_tx,
        response_rx,
        cfg.relay.request_timeout_ms.map(Duration::from_millis),
    );

    let cache = ResolutionCache::new(Arc::new(relay.clone()));
    let applier = Applier::new(
        cache,
        surface.clone(),
        Persistence::new(backend),
        cfg.display.mode,
    );
    applier.load_persisted(cfg.store.label_max_age_ms).await;

    let watcher = tokio::spawn(Watcher::new(surface, Arc::new(applier.clone())).run());
    let (signals, signal_rx) = mpsc::channel(16);
    let control = tokio::spawn(control_loop(applier.clone(), signal_rx));

    Ok(EngineHandle {
        applier,
        relay,
        signals,
        tasks: vec![worker, bridge, dispatcher, watcher, control],
    })
}

async fn control_loop(applier: Applier, mut signals: mpsc::Receiver<SignalEnvelope>) {
    while let Some((signal, ack)) = signals.recv().await {
        debug!(?signal, "control signal received");
        match signal {
            ControlSignal::DisplayModeChanged { mode } => applier.set_display_mode(mode).await,
            ControlSignal::OverridesChanged => applier.overrides_changed().await,
            ControlSignal::ClearCache => applier.clear_cache().await,
        }
        let _ = ack.send(());
    }
}
