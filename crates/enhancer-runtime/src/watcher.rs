use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::surface::{ChatNode, ChatSurface, EntryRef, Insertion, Scope};

/// Receives every qualifying entry the watcher sees.
#[async_trait]
pub trait EntrySink: Send + Sync {
    async fn submit(&self, entry: &EntryRef);
}

/// Feeds entries from a [`ChatSurface`] to a sink: first the entries already
/// present, then every inserted subtree.
pub struct Watcher {
    surface: Arc<dyn ChatSurface>,
    sink: Arc<dyn EntrySink>,
}

impl Watcher {
    pub fn new(surface: Arc<dyn ChatSurface>, sink: Arc<dyn EntrySink>) -> Self {
        Self { surface, sink }
    }

    /// Runs until the container subscription closes.
    pub async fn run(self) {
        let Some(mut insertions) = self.attach().await else {
            debug!("document subscription closed before chat container appeared");
            return;
        };

        for node in self.surface.container_nodes() {
            self.submit_node(&node).await;
        }
        while let Some(Insertion { nodes }) = insertions.recv().await {
            for node in &nodes {
                self.submit_node(node).await;
            }
        }
        debug!("chat container subscription closed");
    }

    /// Subscribes to the container, waiting for it through the document
    /// scope if needed. The subscription is in place before any scan.
    async fn attach(&self) -> Option<tokio::sync::mpsc::UnboundedReceiver<Insertion>> {
        if self.surface.container_present() {
            info!("chat container present; watching");
            return Some(self.surface.subscribe(Scope::Container));
        }

        info!("chat container absent; watching document until it appears");
        let mut document = self.surface.subscribe(Scope::Document);
        // The container may have appeared between the check and subscribing.
        while !self.surface.container_present() {
            document.recv().await?;
        }
        let container = self.surface.subscribe(Scope::Container);
        drop(document);
        info!("chat container appeared; narrowed observation to container");
        Some(container)
    }

    async fn submit_node(&self, node: &ChatNode) {
        for entry in node.qualifying_entries() {
            if !entry.has_author_chip() {
                debug!(kind = entry.kind().tag(), "skipping entry without author chip");
                continue;
            }
            self.sink.submit(&entry).await;
        }
    }
}
