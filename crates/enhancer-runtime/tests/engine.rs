use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use enhancer_contracts::{ChannelId, ControlSignal, DisplayMode};
use enhancer_runtime::{
    start, start_with_lookup, AnnotationState, CacheState, ChatEntry, ChatNode, EngineHandle,
    EntryKind, EntryRef, LiveChat, Lookup, Resolution,
};

#[derive(Clone, Default)]
struct FeedStats {
    calls: Arc<AtomicUsize>,
}

impl FeedStats {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

async fn feed(
    State(stats): State<FeedStats>,
    Query(q): Query<HashMap<String, String>>,
) -> (StatusCode, String) {
    stats.calls.fetch_add(1, Ordering::SeqCst);
    let id = q.get("channel_id").cloned().unwrap_or_default();
    if id.starts_with("missing") {
        return (StatusCode::NOT_FOUND, String::new());
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    let handle = id.to_lowercase();
    (
        StatusCode::OK,
        format!("<feed><title>@{handle}</title><entry><title>clip</title></entry></feed>"),
    )
}

async fn feed_server() -> (String, FeedStats) {
    let stats = FeedStats::default();
    let router = Router::new()
        .route("/feeds/videos.xml", get(feed))
        .with_state(stats.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (format!("http://{addr}/feeds/videos.xml"), stats)
}

fn memory_config(endpoint: &str) -> enhancer_config::Config {
    enhancer_config::parse_and_validate(&format!(
        r#"
lookup:
  feed_endpoint: "{endpoint}"
  timeout_ms: 2000
store:
  type: "memory"
"#
    ))
    .unwrap()
}

fn sqlite_config(endpoint: &str, path: &str) -> enhancer_config::Config {
    enhancer_config::parse_and_validate(&format!(
        r#"
lookup:
  feed_endpoint: "{endpoint}"
  timeout_ms: 2000
relay:
  request_timeout_ms: 5000
display:
  mode: "name"
store:
  type: "sqlite"
  sqlite_path: "{path}"
"#
    ))
    .unwrap()
}

fn temp_db_path(tag: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir()
        .join(format!("enhancer-engine-{tag}-{nanos}.db"))
        .to_string_lossy()
        .to_string()
}

fn message(key: &str, raw: &str) -> EntryRef {
    ChatEntry::message(EntryKind::TextMessage, key, raw)
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn engine(chat: &LiveChat, cfg: &enhancer_config::Config) -> EngineHandle {
    start(cfg, Arc::new(chat.clone())).await.unwrap()
}

#[tokio::test]
async fn annotates_chat_with_one_fetch_per_author() {
    let (endpoint, stats) = feed_server().await;
    let chat = LiveChat::with_container();
    let existing = message("UCAlice", "Alice");
    chat.insert(vec![ChatNode::entry(existing.clone())]);
    let handle = engine(&chat, &memory_config(&endpoint)).await;

    let again = message("UCAlice", "Alice");
    let paid = ChatEntry::message(EntryKind::PaidMessage, "UCBob", "Bob");
    let sticker = ChatEntry::message(EntryKind::PaidSticker, "UCAlice", "Alice");
    chat.insert(vec![
        ChatNode::entry(again.clone()),
        ChatNode::element("div")
            .with_child(ChatNode::entry(paid.clone()))
            .with_child(ChatNode::entry(sticker.clone())),
    ]);

    eventually("all entries annotated", || {
        [&existing, &again, &paid, &sticker]
            .iter()
            .all(|e| e.annotation() == AnnotationState::Annotated)
    })
    .await;
    assert_eq!(existing.rendered().as_deref(), Some("@ucalice (Alice)"));
    assert_eq!(sticker.rendered().as_deref(), Some("@ucalice (Alice)"));
    assert_eq!(paid.rendered().as_deref(), Some("@ucbob (Bob)"));
    assert_eq!(stats.calls(), 2);
    assert_eq!(handle.relay_diagnostics().resolved, 2);
    handle.shutdown();
}

#[tokio::test]
async fn waits_for_container_before_watching() {
    let (endpoint, _stats) = feed_server().await;
    let chat = LiveChat::new();
    let _handle = engine(&chat, &memory_config(&endpoint)).await;
    eventually("document observer", || chat.document_observers() == 1).await;

    chat.mount_container();
    let entry = message("UCAlice", "Alice");
    chat.insert(vec![ChatNode::entry(entry.clone())]);
    eventually("entry annotated", || entry.rendered().is_some()).await;
    assert_eq!(chat.document_observers(), 0);
}

#[tokio::test]
async fn display_mode_change_rerenders_without_fetching() {
    let (endpoint, stats) = feed_server().await;
    let chat = LiveChat::with_container();
    let handle = engine(&chat, &memory_config(&endpoint)).await;
    let entry = message("UCAlice", "Alice");
    chat.insert(vec![ChatNode::entry(entry.clone())]);
    eventually("entry annotated", || entry.rendered().is_some()).await;

    handle
        .signal(ControlSignal::DisplayModeChanged {
            mode: DisplayMode::Name,
        })
        .await
        .unwrap();
    assert_eq!(entry.rendered().as_deref(), Some("@ucalice"));
    handle
        .signal(ControlSignal::DisplayModeChanged {
            mode: DisplayMode::Handle,
        })
        .await
        .unwrap();
    assert_eq!(entry.rendered().as_deref(), Some("Alice"));
    assert_eq!(stats.calls(), 1);
}

#[tokio::test]
async fn override_replaces_label_on_visible_entries() {
    let (endpoint, _stats) = feed_server().await;
    let chat = LiveChat::with_container();
    let handle = engine(&chat, &memory_config(&endpoint)).await;
    let entry = message("UCAlice", "Alice");
    chat.insert(vec![ChatNode::entry(entry.clone())]);
    eventually("entry annotated", || entry.rendered().is_some()).await;

    let key = ChannelId::new("UCAlice");
    handle.set_override(&key, " Ally ").await.unwrap();
    assert_eq!(entry.rendered().as_deref(), Some("Ally (Alice)"));
    assert_eq!(handle.applier().overrides().get(&key).map(String::as_str), Some("Ally"));

    handle.set_override(&key, "").await.unwrap();
    assert_eq!(entry.rendered().as_deref(), Some("@ucalice (Alice)"));
}

#[tokio::test]
async fn missing_channel_is_not_retried() {
    let (endpoint, stats) = feed_server().await;
    let chat = LiveChat::with_container();
    let handle = engine(&chat, &memory_config(&endpoint)).await;
    let first = message("missing-1", "Ghost");
    chat.insert(vec![ChatNode::entry(first.clone())]);
    eventually("entry annotated", || first.annotation() == AnnotationState::Annotated).await;
    assert_eq!(first.rendered().as_deref(), Some("Ghost"));

    let second = message("missing-1", "Ghost");
    chat.insert(vec![ChatNode::entry(second.clone())]);
    eventually("second entry annotated", || {
        second.annotation() == AnnotationState::Annotated
    })
    .await;
    assert_eq!(stats.calls(), 1);
    assert_eq!(
        handle.cache().state(&ChannelId::new("missing-1")).await,
        Some(CacheState::Settled(Resolution::Failed))
    );
    assert_eq!(handle.relay_diagnostics().not_found, 1);
}

#[tokio::test]
async fn sqlite_labels_survive_restart() {
    let (endpoint, stats) = feed_server().await;
    let path = temp_db_path("restart");
    let cfg = sqlite_config(&endpoint, &path);

    let chat = LiveChat::with_container();
    let handle = engine(&chat, &cfg).await;
    let entry = message("UCAlice", "Alice");
    chat.insert(vec![ChatNode::entry(entry.clone())]);
    eventually("entry annotated", || entry.rendered().is_some()).await;
    assert_eq!(entry.rendered().as_deref(), Some("@ucalice"));
    handle.set_override(&ChannelId::new("UCBob"), "Bobby").await.unwrap();
    // The label is written by the task that issued the lookup.
    eventually("label persisted", || stored_label_count(&path) == 1).await;
    handle.shutdown();

    let chat = LiveChat::with_container();
    let _handle = engine(&chat, &cfg).await;
    let alice = message("UCAlice", "Alice");
    let bob = message("UCBob", "Bob");
    chat.insert(vec![ChatNode::entry(alice.clone()), ChatNode::entry(bob.clone())]);
    eventually("entries annotated", || {
        alice.rendered().is_some() && bob.rendered().is_some()
    })
    .await;
    assert_eq!(alice.rendered().as_deref(), Some("@ucalice"));
    assert_eq!(bob.rendered().as_deref(), Some("Bobby"));
    assert_eq!(stats.calls(), 1);
}

fn stored_label_count(path: &str) -> usize {
    let Ok(store) = enhancer_runtime::store::SqliteStore::new(path) else {
        return 0;
    };
    enhancer_runtime::StoreBackend::Sqlite(store)
        .load_labels()
        .map(|labels| labels.len())
        .unwrap_or(0)
}

#[tokio::test]
async fn clear_cache_fetches_again() {
    let (endpoint, stats) = feed_server().await;
    let chat = LiveChat::with_container();
    let handle = engine(&chat, &memory_config(&endpoint)).await;
    let entry = message("UCAlice", "Alice");
    chat.insert(vec![ChatNode::entry(entry.clone())]);
    eventually("entry annotated", || entry.rendered().is_some()).await;

    handle.signal(ControlSignal::ClearCache).await.unwrap();
    assert!(handle.cache().is_empty().await);
    assert_eq!(entry.rendered().as_deref(), Some("@ucalice (Alice)"));

    let later = message("UCAlice", "Alice");
    chat.insert(vec![ChatNode::entry(later.clone())]);
    eventually("later entry annotated", || later.rendered().is_some()).await;
    assert_eq!(stats.calls(), 2);
}

/// Lookup that never answers.
struct StalledLookup {
    calls: AtomicUsize,
}

#[async_trait::async_trait]
impl Lookup for StalledLookup {
    async fn lookup(&self, _key: &ChannelId) -> Option<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::future::pending::<()>().await;
        None
    }
}

#[tokio::test]
async fn shutdown_releases_tasks_waiting_on_unanswered_lookups() {
    let cfg = enhancer_config::parse_and_validate(
        r#"
lookup:
  feed_endpoint: "http://127.0.0.1:9/feeds/videos.xml"
relay:
  request_timeout_ms: null
store:
  type: "memory"
"#,
    )
    .unwrap();
    assert_eq!(cfg.relay.request_timeout_ms, None);

    let lookup = Arc::new(StalledLookup {
        calls: AtomicUsize::new(0),
    });
    let chat = LiveChat::with_container();
    let surface = Arc::new(chat.clone());
    let surface_ref = Arc::downgrade(&surface);
    let handle = start_with_lookup(&cfg, surface, lookup.clone()).await.unwrap();

    let entry = message("UCAlice", "Alice");
    chat.insert(vec![ChatNode::entry(entry.clone())]);
    eventually("lookup reached the privileged side", || {
        lookup.calls.load(Ordering::SeqCst) == 1
    })
    .await;
    assert_eq!(entry.annotation(), AnnotationState::AwaitingResolution);

    handle.shutdown();
    // Every task that could still render onto the surface has ended.
    eventually("engine tasks released the surface", || {
        surface_ref.upgrade().is_none()
    })
    .await;
    eventually("worker released the lookup", || Arc::strong_count(&lookup) == 1).await;
    assert_eq!(entry.annotation(), AnnotationState::AwaitingResolution);
}
