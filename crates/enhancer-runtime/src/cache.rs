use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use enhancer_contracts::ChannelId;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Performs the lookup for a key on behalf of the cache. Absence means the
/// key could not be resolved, for whatever reason.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, key: &ChannelId) -> Option<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Resolved(String),
    Failed,
}

impl Resolution {
    pub fn label(&self) -> Option<&str> {
        match self {
            Resolution::Resolved(label) => Some(label),
            Resolution::Failed => None,
        }
    }

    fn from_lookup(label: Option<String>) -> Self {
        match label {
            Some(label) => Resolution::Resolved(label),
            None => Resolution::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheState {
    Pending,
    Settled(Resolution),
}

/// Outcome of [`ResolutionCache::request`].
#[derive(Debug)]
pub enum Claim {
    Ready(Resolution),
    /// This call started the lookup.
    Issued(Waiter),
    AlreadyPending(Waiter),
}

/// Completion handle for a pending key.
#[derive(Debug)]
pub struct Waiter {
    rx: oneshot::Receiver<Resolution>,
    epoch: u64,
}

impl Waiter {
    /// `None` when the cache was cleared before the lookup completed.
    pub async fn wait(self) -> Option<Resolution> {
        self.rx.await.ok()
    }

    /// Clear generation the waiter was registered in.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

enum Slot {
    Pending {
        waiters: Vec<oneshot::Sender<Resolution>>,
    },
    Settled(Resolution),
}

#[derive(Default)]
struct CacheInner {
    epoch: u64,
    slots: HashMap<ChannelId, Slot>,
}

/// Process-lifetime map of key to resolution state with at most one lookup
/// in flight per key. Only methods on this type mutate the map.
#[derive(Clone)]
pub struct ResolutionCache {
    inner: Arc<Mutex<CacheInner>>,
    resolver: Arc<dyn Resolver>,
    shutdown: CancellationToken,
}

impl ResolutionCache {
    pub fn new(resolver: Arc<dyn Resolver>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CacheInner::default())),
            resolver,
            shutdown: CancellationToken::new(),
        }
    }

    pub async fn request(&self, key: &ChannelId) -> Claim {
        let mut inner = self.inner.lock().await;
        match inner.slots.get_mut(key) {
            Some(Slot::Settled(resolution)) => return Claim::Ready(resolution.clone()),
            Some(Slot::Pending { waiters }) => {
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                return Claim::AlreadyPending(Waiter {
                    rx,
                    epoch: inner.epoch,
                });
            }
            None => {}
        }

        let (tx, rx) = oneshot::channel();
        inner
            .slots
            .insert(key.clone(), Slot::Pending { waiters: vec![tx] });
        let epoch = inner.epoch;
        drop(inner);

        self.issue(key.clone(), epoch);
        Claim::Issued(Waiter { rx, epoch })
    }

    pub async fn state(&self, key: &ChannelId) -> Option<CacheState> {
        let inner = self.inner.lock().await;
        inner.slots.get(key).map(|slot| match slot {
            Slot::Pending { .. } => CacheState::Pending,
            Slot::Settled(resolution) => CacheState::Settled(resolution.clone()),
        })
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.slots.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Preloads resolved labels for keys the cache has not seen yet.
    pub async fn seed(&self, labels: impl IntoIterator<Item = (ChannelId, String)>) -> usize {
        let mut inner = self.inner.lock().await;
        let mut seeded = 0;
        for (key, label) in labels {
            if inner.slots.contains_key(&key) {
                continue;
            }
            inner
                .slots
                .insert(key, Slot::Settled(Resolution::Resolved(label)));
            seeded += 1;
        }
        seeded
    }

    /// Drops every entry and every waiter. Lookups already in flight still
    /// finish, but their waiters are gone.
    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        inner.epoch += 1;
        let dropped = inner.slots.len();
        inner.slots.clear();
        debug!(dropped, epoch = inner.epoch, "resolution cache cleared");
    }

    /// Runs `persist` only if no clear happened since `epoch`. The cache stays
    /// locked while it runs, so a concurrent clear is ordered after the write.
    pub async fn persist_if_current<F>(&self, epoch: u64, persist: F) -> bool
    where
        F: Future<Output = ()>,
    {
        let inner = self.inner.lock().await;
        if inner.epoch != epoch {
            return false;
        }
        persist.await;
        drop(inner);
        true
    }

    /// Cancels every lookup task still in flight. Pending slots stay pending
    /// and their waiters are never woken.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Token tracked by lookup tasks; cancelled by [`ResolutionCache::shutdown`].
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn issue(&self, key: ChannelId, epoch: u64) {
        let cache = self.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let label = tokio::select! {
                () = shutdown.cancelled() => {
                    debug!(key = %key, "lookup abandoned on shutdown");
                    return;
                }
                label = cache.resolver.resolve(&key) => label,
            };
            cache.complete(key, epoch, Resolution::from_lookup(label)).await;
        });
    }

    async fn complete(&self, key: ChannelId, epoch: u64, resolution: Resolution) {
        let mut inner = self.inner.lock().await;
        if epoch != inner.epoch {
            // Late result from before a clear: fill a vacant slot, wake nobody.
            if !inner.slots.contains_key(&key) {
                debug!(key = %key, "late resolution repopulates cleared cache");
                inner.slots.insert(key, Slot::Settled(resolution));
            }
            return;
        }

        let waiters = match inner
            .slots
            .insert(key.clone(), Slot::Settled(resolution.clone()))
        {
            Some(Slot::Pending { waiters }) => waiters,
            Some(Slot::Settled(previous)) => {
                inner.slots.insert(key, Slot::Settled(previous));
                return;
            }
            None => Vec::new(),
        };
        drop(inner);

        debug!(
            key = %key,
            waiters = waiters.len(),
            resolved = resolution.label().is_some(),
            "resolution settled"
        );
        for waiter in waiters {
            let _ = waiter.send(resolution.clone());
        }
    }
}
