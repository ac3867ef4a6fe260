use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use enhancer_contracts::{ChannelId, DisplayMode, OverrideDocument};
use enhancer_kernel::{effective_label, format_label, is_fresh, stored_label};
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::cache::{Claim, Resolution, ResolutionCache};
use crate::store::Persistence;
use crate::surface::{ChatSurface, EntryRef, LabelBasis};
use crate::watcher::EntrySink;

struct ApplierInner {
    cache: ResolutionCache,
    surface: Arc<dyn ChatSurface>,
    persistence: Persistence,
    mode: RwLock<DisplayMode>,
    overrides: RwLock<OverrideDocument>,
}

/// Renders labels onto chat entries and keeps every visible entry of a key
/// consistent with the cache, the overrides and the display mode.
#[derive(Clone)]
pub struct Applier {
    inner: Arc<ApplierInner>,
}

impl Applier {
    pub fn new(
        cache: ResolutionCache,
        surface: Arc<dyn ChatSurface>,
        persistence: Persistence,
        mode: DisplayMode,
    ) -> Self {
        Self {
            inner: Arc::new(ApplierInner {
                cache,
                surface,
                persistence,
                mode: RwLock::new(mode),
                overrides: RwLock::new(OverrideDocument::new()),
            }),
        }
    }

    pub fn display_mode(&self) -> DisplayMode {
        *self.inner.mode.read()
    }

    pub fn overrides(&self) -> OverrideDocument {
        self.inner.overrides.read().clone()
    }

    pub fn cache(&self) -> &ResolutionCache {
        &self.inner.cache
    }

    pub fn persistence(&self) -> &Persistence {
        &self.inner.persistence
    }

    /// Loads overrides and seeds the cache with stored labels younger than
    /// `max_age_ms`. Returns the number of labels seeded.
    pub async fn load_persisted(&self, max_age_ms: Option<u64>) -> usize {
        if let Some(overrides) = self.inner.persistence.load_overrides().await {
            *self.inner.overrides.write() = overrides;
        }
        let Some(labels) = self.inner.persistence.load_labels().await else {
            return 0;
        };
        let total = labels.len();
        let now = Utc::now();
        let fresh: Vec<(ChannelId, String)> = labels
            .into_iter()
            .filter(|(_, stored)| is_fresh(stored, now, max_age_ms))
            .map(|(key, stored)| (key, stored.label))
            .collect();
        let seeded = self.inner.cache.seed(fresh).await;
        info!(
            seeded,
            stale = total.saturating_sub(seeded),
            overrides = self.inner.overrides.read().len(),
            "loaded persisted labels"
        );
        seeded
    }

    /// Claims and annotates one entry. Settled keys and overridden keys are
    /// rendered before this returns; otherwise rendering happens when the
    /// lookup completes.
    pub async fn apply(&self, entry: &EntryRef) {
        let (Some(key), Some(_)) = (entry.key(), entry.raw_name()) else {
            debug!(kind = entry.kind().tag(), "skipping entry without key or author name");
            return;
        };
        if !entry.claim() {
            return;
        }
        self.resolve_entry(entry, key).await;
    }

    async fn resolve_entry(&self, entry: &EntryRef, key: &ChannelId) {
        if self.inner.overrides.read().contains_key(key) {
            self.render(entry, LabelBasis::Override);
            return;
        }
        match self.inner.cache.request(key).await {
            Claim::Ready(resolution) => self.render(entry, basis_of(&resolution)),
            claim => {
                let applier = self.clone();
                let key = key.clone();
                let shutdown = self.inner.cache.shutdown_token();
                tokio::spawn(async move {
                    tokio::select! {
                        () = shutdown.cancelled() => {}
                        () = applier.await_resolution(key, claim) => {}
                    }
                });
            }
        }
    }

    /// Waits for the pending lookup of `key`. A wait cut short by a cache
    /// clear is re-requested.
    async fn await_resolution(self, key: ChannelId, mut claim: Claim) {
        loop {
            let (waiter, issued) = match claim {
                Claim::Ready(resolution) => {
                    self.render_key(&key, &resolution);
                    return;
                }
                Claim::Issued(waiter) => (waiter, true),
                Claim::AlreadyPending(waiter) => (waiter, false),
            };
            let epoch = waiter.epoch();
            match waiter.wait().await {
                Some(resolution) => {
                    if issued {
                        if let Some(label) = resolution.label() {
                            let save = self
                                .inner
                                .persistence
                                .save_label(&key, stored_label(label, Utc::now()));
                            if !self.inner.cache.persist_if_current(epoch, save).await {
                                debug!(key = %key, "cache cleared since lookup; label not persisted");
                            }
                        }
                    }
                    self.render_key(&key, &resolution);
                    return;
                }
                None => {
                    debug!(
                        key = %key,
                        "pending lookup discarded by cache clear; requesting again"
                    );
                    claim = self.inner.cache.request(&key).await;
                }
            }
        }
    }

    /// Renders every visible entry of `key` from a settled resolution.
    pub fn render_key(&self, key: &ChannelId, resolution: &Resolution) {
        let basis = basis_of(resolution);
        let mut rendered = 0usize;
        for entry in self.annotatable_entries() {
            if entry.key() == Some(key) {
                self.render(&entry, basis.clone());
                rendered += 1;
            }
        }
        debug!(key = %key, rendered, "rendered entries for key");
    }

    /// Visible entries that carry an author chip. Only these are ever
    /// annotated.
    fn annotatable_entries(&self) -> impl Iterator<Item = EntryRef> {
        self.inner
            .surface
            .visible_entries()
            .into_iter()
            .filter(|entry| entry.has_author_chip())
    }

    fn render(&self, entry: &EntryRef, basis: LabelBasis) {
        let (Some(key), Some(raw_name)) = (entry.key(), entry.raw_name()) else {
            return;
        };
        let mode = self.display_mode();
        let overrides = self.inner.overrides.read();
        let resolved = match &basis {
            LabelBasis::Override => None,
            LabelBasis::Lookup(label) => label.as_deref(),
        };
        let label = effective_label(overrides.get(key).map(String::as_str), resolved);
        let text = format_label(mode, label, raw_name);
        drop(overrides);
        entry.annotate(text, basis);
    }

    pub async fn set_display_mode(&self, mode: DisplayMode) {
        *self.inner.mode.write() = mode;
        info!(mode = %mode, "display mode changed");
        self.refresh_annotated().await;
    }

    /// Reloads overrides from the store and re-renders.
    pub async fn overrides_changed(&self) {
        match self.inner.persistence.load_overrides().await {
            Some(overrides) => *self.inner.overrides.write() = overrides,
            None => debug!("store unavailable; keeping current overrides"),
        }
        self.refresh_annotated().await;
    }

    /// Forgets every resolution, in memory and in the store. Rendered
    /// entries keep their text.
    pub async fn clear_cache(&self) {
        self.inner.cache.clear().await;
        self.inner.persistence.clear_labels().await;
        info!("label cache cleared");
    }

    /// Re-renders every annotated entry without resolving again. Entries
    /// that showed an override which no longer exists are resolved now.
    pub async fn refresh_annotated(&self) {
        let overrides = self.overrides();
        for entry in self.annotatable_entries() {
            let Some(basis) = entry.basis() else {
                continue;
            };
            let Some(key) = entry.key() else {
                continue;
            };
            match basis {
                LabelBasis::Override if !overrides.contains_key(key) => {
                    self.resolve_entry(&entry, key).await;
                }
                basis => self.render(&entry, basis),
            }
        }
    }
}

fn basis_of(resolution: &Resolution) -> LabelBasis {
    LabelBasis::Lookup(resolution.label().map(str::to_string))
}

#[async_trait]
impl EntrySink for Applier {
    async fn submit(&self, entry: &EntryRef) {
        self.apply(entry).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheState, Resolver};
    use crate::store::{MemoryStore, SqliteStore, StoreBackend};
    use crate::surface::{AnnotationState, ChatEntry, ChatNode, EntryKind, LiveChat};
    use enhancer_contracts::StoredLabel;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Semaphore;

    struct StubResolver {
        labels: HashMap<String, String>,
        gate: Semaphore,
        calls: AtomicUsize,
    }

    impl StubResolver {
        fn new(labels: &[(&str, &str)]) -> Arc<Self> {
            Arc::new(Self {
                labels: labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                gate: Semaphore::new(0),
                calls: AtomicUsize::new(0),
            })
        }

        fn open(&self) {
            self.gate.add_permits(1_000);
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Resolver for StubResolver {
        async fn resolve(&self, key: &ChannelId) -> Option<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let permit = self.gate.acquire().await.ok()?;
            permit.forget();
            self.labels.get(key.as_str()).cloned()
        }
    }

    struct Fixture {
        chat: LiveChat,
        resolver: Arc<StubResolver>,
        applier: Applier,
    }

    fn fixture(labels: &[(&str, &str)], backend: StoreBackend) -> Fixture {
        let chat = LiveChat::with_container();
        let resolver = StubResolver::new(labels);
        let applier = Applier::new(
            ResolutionCache::new(resolver.clone()),
            Arc::new(chat.clone()),
            Persistence::new(backend),
            DisplayMode::Both,
        );
        Fixture {
            chat,
            resolver,
            applier,
        }
    }

    fn memory() -> StoreBackend {
        StoreBackend::Memory(MemoryStore::default())
    }

    fn post(chat: &LiveChat, key: &str, raw: &str) -> EntryRef {
        let entry = ChatEntry::message(EntryKind::TextMessage, key, raw);
        chat.insert(vec![ChatNode::entry(entry.clone())]);
        entry
    }

    async fn eventually(check: impl Fn() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn resolution_updates_every_entry_of_the_key() {
        let fx = fixture(&[("UCa", "@alice")], memory());
        let first = post(&fx.chat, "UCa", "Alice");
        let second = post(&fx.chat, "UCa", "Alice");
        let other = post(&fx.chat, "UCb", "Bob");

        fx.applier.apply(&first).await;
        fx.applier.apply(&second).await;
        assert_eq!(first.annotation(), AnnotationState::AwaitingResolution);

        fx.resolver.open();
        eventually(|| second.rendered().is_some()).await;
        assert_eq!(first.rendered().as_deref(), Some("@alice (Alice)"));
        assert_eq!(second.rendered().as_deref(), Some("@alice (Alice)"));
        assert_eq!(other.annotation(), AnnotationState::Unannotated);
        assert_eq!(fx.resolver.calls(), 1);
    }

    #[tokio::test]
    async fn late_joiner_renders_from_settled_state_immediately() {
        let fx = fixture(&[("UCa", "@alice")], memory());
        fx.resolver.open();
        let first = post(&fx.chat, "UCa", "Alice");
        fx.applier.apply(&first).await;
        eventually(|| first.rendered().is_some()).await;

        let late = post(&fx.chat, "UCa", "Alice");
        fx.applier.apply(&late).await;
        assert_eq!(late.annotation(), AnnotationState::Annotated);
        assert_eq!(late.rendered().as_deref(), Some("@alice (Alice)"));
        assert_eq!(fx.resolver.calls(), 1);
    }

    #[tokio::test]
    async fn apply_on_annotated_entry_changes_nothing() {
        let fx = fixture(&[("UCa", "@alice")], memory());
        fx.resolver.open();
        let entry = post(&fx.chat, "UCa", "Alice");
        fx.applier.apply(&entry).await;
        eventually(|| entry.rendered().is_some()).await;

        fx.applier.set_display_mode(DisplayMode::Name).await;
        let before = entry.rendered();
        fx.applier.apply(&entry).await;
        assert_eq!(entry.rendered(), before);
        assert_eq!(fx.resolver.calls(), 1);
    }

    #[tokio::test]
    async fn failed_lookup_renders_raw_name() {
        let fx = fixture(&[], memory());
        fx.resolver.open();
        let entry = post(&fx.chat, "UCx", "Xavier");
        fx.applier.apply(&entry).await;
        eventually(|| entry.annotation() == AnnotationState::Annotated).await;
        assert_eq!(entry.rendered().as_deref(), Some("Xavier"));
        assert_eq!(entry.basis(), Some(LabelBasis::Lookup(None)));
    }

    #[tokio::test]
    async fn mode_change_rerenders_without_resolving() {
        let fx = fixture(&[("UCa", "@alice")], memory());
        fx.resolver.open();
        let entry = post(&fx.chat, "UCa", "Alice");
        fx.applier.apply(&entry).await;
        eventually(|| entry.rendered().is_some()).await;

        fx.applier.set_display_mode(DisplayMode::Name).await;
        assert_eq!(entry.rendered().as_deref(), Some("@alice"));
        fx.applier.set_display_mode(DisplayMode::Handle).await;
        assert_eq!(entry.rendered().as_deref(), Some("Alice"));
        assert_eq!(fx.resolver.calls(), 1);
    }

    #[tokio::test]
    async fn override_wins_and_skips_lookup() {
        let fx = fixture(&[("UCa", "@alice")], memory());
        fx.applier
            .persistence()
            .set_override(&ChannelId::new("UCa"), "Ally")
            .await
            .unwrap();
        fx.applier.overrides_changed().await;

        let entry = post(&fx.chat, "UCa", "Alice");
        fx.applier.apply(&entry).await;
        assert_eq!(entry.rendered().as_deref(), Some("Ally (Alice)"));
        assert_eq!(fx.resolver.calls(), 0);
        assert_eq!(fx.applier.cache().state(&ChannelId::new("UCa")).await, None);
    }

    #[tokio::test]
    async fn removed_override_falls_back_to_lookup() {
        let fx = fixture(&[("UCa", "@alice")], memory());
        fx.resolver.open();
        let key = ChannelId::new("UCa");
        fx.applier.persistence().set_override(&key, "Ally").await.unwrap();
        fx.applier.overrides_changed().await;
        let entry = post(&fx.chat, "UCa", "Alice");
        fx.applier.apply(&entry).await;

        fx.applier.persistence().remove_override(&key).await.unwrap();
        fx.applier.overrides_changed().await;
        eventually(|| entry.rendered().as_deref() == Some("@alice (Alice)")).await;
        assert_eq!(fx.resolver.calls(), 1);
    }

    #[tokio::test]
    async fn issuing_caller_persists_resolved_label() {
        let fx = fixture(&[("UCa", "@alice")], memory());
        fx.resolver.open();
        let entry = post(&fx.chat, "UCa", "Alice");
        fx.applier.apply(&entry).await;
        eventually(|| entry.rendered().is_some()).await;

        let mut stored = None;
        for _ in 0..200 {
            stored = fx
                .applier
                .persistence()
                .load_labels()
                .await
                .unwrap()
                .remove(&ChannelId::new("UCa"));
            if stored.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(stored.map(|s| s.label).as_deref(), Some("@alice"));
    }

    #[tokio::test]
    async fn persisted_labels_seed_cache_respecting_age() {
        let mut backend = memory();
        backend
            .save_label(&ChannelId::new("UCa"), stored_label("@alice", Utc::now()))
            .unwrap();
        backend
            .save_label(
                &ChannelId::new("UCold"),
                StoredLabel {
                    label: "@old".to_string(),
                    observed_at: "2020-01-01T00:00:00Z".to_string(),
                },
            )
            .unwrap();
        let fx = fixture(&[], backend);
        assert_eq!(fx.applier.load_persisted(Some(60 * 60 * 1000)).await, 1);

        let entry = post(&fx.chat, "UCa", "Alice");
        fx.applier.apply(&entry).await;
        assert_eq!(entry.rendered().as_deref(), Some("@alice (Alice)"));
        assert_eq!(fx.resolver.calls(), 0);
    }

    #[tokio::test]
    async fn clear_during_pending_requests_again() {
        let fx = fixture(&[("UCa", "@alice")], memory());
        let entry = post(&fx.chat, "UCa", "Alice");
        fx.applier.apply(&entry).await;
        eventually(|| fx.resolver.calls() == 1).await;

        fx.applier.clear_cache().await;
        eventually(|| fx.resolver.calls() == 2).await;
        assert_eq!(entry.annotation(), AnnotationState::AwaitingResolution);

        fx.resolver.open();
        eventually(|| entry.rendered().is_some()).await;
        assert_eq!(entry.rendered().as_deref(), Some("@alice (Alice)"));
        assert!(matches!(
            fx.applier.cache().state(&ChannelId::new("UCa")).await,
            Some(CacheState::Settled(_))
        ));
    }

    #[tokio::test]
    async fn clear_keeps_rendered_text() {
        let fx = fixture(&[("UCa", "@alice")], memory());
        fx.resolver.open();
        let entry = post(&fx.chat, "UCa", "Alice");
        fx.applier.apply(&entry).await;
        eventually(|| entry.rendered().is_some()).await;

        fx.applier.clear_cache().await;
        assert!(fx.applier.cache().is_empty().await);
        assert_eq!(entry.rendered().as_deref(), Some("@alice (Alice)"));
    }

    #[tokio::test]
    async fn entry_without_author_chip_is_never_rendered() {
        let fx = fixture(&[("UCa", "@alice")], memory());
        let chipless = ChatEntry::new(
            EntryKind::TextMessage,
            Some("UCa".into()),
            Some("Alice".into()),
            false,
        );
        fx.chat.insert(vec![ChatNode::entry(chipless.clone())]);
        let entry = post(&fx.chat, "UCa", "Alice");

        fx.applier.apply(&entry).await;
        fx.resolver.open();
        eventually(|| entry.rendered().is_some()).await;
        assert_eq!(entry.rendered().as_deref(), Some("@alice (Alice)"));
        assert_eq!(chipless.annotation(), AnnotationState::Unannotated);
        assert_eq!(chipless.rendered(), None);

        fx.applier.set_display_mode(DisplayMode::Name).await;
        assert_eq!(entry.rendered().as_deref(), Some("@alice"));
        assert_eq!(chipless.rendered(), None);
    }

    #[tokio::test]
    async fn label_settled_before_clear_is_not_persisted() {
        let fx = fixture(&[("UCa", "@alice")], memory());
        let key = ChannelId::new("UCa");
        let claim = fx.applier.cache().request(&key).await;
        assert!(matches!(claim, Claim::Issued(_)));
        fx.resolver.open();
        for _ in 0..200 {
            if matches!(fx.applier.cache().state(&key).await, Some(CacheState::Settled(_))) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // The waiter already holds the resolution, but the clear wins.
        fx.applier.clear_cache().await;
        fx.applier.clone().await_resolution(key.clone(), claim).await;

        let labels = fx.applier.persistence().load_labels().await.unwrap();
        assert!(labels.is_empty(), "stale label written after clear: {labels:?}");
    }

    #[tokio::test]
    async fn shutdown_ends_pending_waits() {
        let fx = fixture(&[("UCa", "@alice")], memory());
        let entry = post(&fx.chat, "UCa", "Alice");
        fx.applier.apply(&entry).await;
        eventually(|| fx.resolver.calls() == 1).await;

        let before = Arc::strong_count(&fx.applier.inner);
        fx.applier.cache().shutdown();
        eventually(|| Arc::strong_count(&fx.applier.inner) < before).await;
        fx.resolver.open();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(entry.annotation(), AnnotationState::AwaitingResolution);
    }

    #[tokio::test]
    async fn malformed_entry_is_left_alone() {
        let fx = fixture(&[], memory());
        let entry = ChatEntry::new(EntryKind::TextMessage, None, Some("Anon".into()), true);
        fx.applier.apply(&entry).await;
        assert_eq!(entry.annotation(), AnnotationState::Unannotated);
        assert_eq!(fx.resolver.calls(), 0);
    }

    #[tokio::test]
    async fn broken_store_degrades_to_memory() {
        let path = std::env::temp_dir().join(format!(
            "enhancer-applier-degraded-{}.db",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        let backend = StoreBackend::Sqlite(SqliteStore::new(path.to_str().unwrap()).unwrap());
        let fx = fixture(&[("UCa", "@alice")], backend);
        fx.applier.persistence().break_for_test().await;
        assert_eq!(fx.applier.load_persisted(None).await, 0);
        assert!(fx.applier.persistence().is_degraded());

        fx.resolver.open();
        let entry = post(&fx.chat, "UCa", "Alice");
        fx.applier.apply(&entry).await;
        eventually(|| entry.rendered().is_some()).await;
        assert_eq!(entry.rendered().as_deref(), Some("@alice (Alice)"));
    }
}
