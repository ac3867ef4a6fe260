//! Live chat author annotation.
//!
//! Load a config, mirror the chat into a [`LiveChat`] and call [`launch`]:
//!
//! ```no_run
//! # async fn run() -> Result<(), handle_enhancer::EngineError> {
//! use std::sync::Arc;
//! use handle_enhancer::{launch, LiveChat};
//!
//! let chat = LiveChat::new();
//! let engine = launch("./config/example-config.yaml", Arc::new(chat.clone())).await?;
//! # engine.shutdown();
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use tracing::warn;
use tracing_subscriber::EnvFilter;

pub use enhancer_config::{Config, ConfigError, Logging};
pub use enhancer_contracts::{ChannelId, ControlSignal, DisplayMode, CONTRACT_VERSION};
pub use enhancer_runtime::{
    start, start_with_lookup, AnnotationState, ChatEntry, ChatNode, ChatSurface, EngineError,
    EngineHandle, EntryKind, EntryRef, LiveChat, Lookup,
};

/// Installs the global fmt subscriber. `RUST_LOG` wins over the configured
/// filter. A second call is a no-op.
pub fn init_tracing(cfg: &Logging) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::try_new(&cfg.filter).unwrap_or_else(|err| {
            eprintln!("invalid logging.filter {:?}: {err}; using info", cfg.filter);
            EnvFilter::new("info")
        })
    });
    if tracing_subscriber::fmt().with_env_filter(filter).try_init().is_err() {
        warn!("tracing subscriber already installed");
    }
}

/// Loads and validates the config at `config_path`, installs logging and
/// starts the engine on `surface`.
pub async fn launch(
    config_path: &str,
    surface: Arc<dyn ChatSurface>,
) -> Result<EngineHandle, EngineError> {
    let cfg = enhancer_config::load_and_validate(config_path)?;
    init_tracing(&cfg.logging);
    start(&cfg, surface).await
}
