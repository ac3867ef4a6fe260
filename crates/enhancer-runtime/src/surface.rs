//! In-process model of the live chat the engine annotates.
//!
//! Hosts mirror their chat into a [`LiveChat`] (or provide their own
//! [`ChatSurface`]); the watcher only sees node insertions and the applier
//! only sees the entries currently visible.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use enhancer_contracts::ChannelId;
use parking_lot::Mutex;
use tokio::sync::mpsc;

pub const CONTAINER_TAG: &str = "yt-live-chat-app";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    TextMessage,
    PaidMessage,
    MembershipItem,
    PaidSticker,
}

impl EntryKind {
    pub const ALL: [EntryKind; 4] = [
        EntryKind::TextMessage,
        EntryKind::PaidMessage,
        EntryKind::MembershipItem,
        EntryKind::PaidSticker,
    ];

    pub fn tag(self) -> &'static str {
        match self {
            EntryKind::TextMessage => "yt-live-chat-text-message-renderer",
            EntryKind::PaidMessage => "yt-live-chat-paid-message-renderer",
            EntryKind::MembershipItem => "yt-live-chat-membership-item-renderer",
            EntryKind::PaidSticker => "yt-live-chat-paid-sticker-renderer",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.tag() == tag)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnotationState {
    Unannotated,
    AwaitingResolution,
    Annotated,
}

/// What an annotated entry's label was rendered from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelBasis {
    /// A user override; the key was never resolved for this entry.
    Override,
    /// The cache's settled result, `None` for a failed lookup.
    Lookup(Option<String>),
}

#[derive(Debug)]
struct EntryState {
    annotation: AnnotationState,
    rendered: Option<String>,
    basis: Option<LabelBasis>,
}

static NEXT_ENTRY_ID: AtomicU64 = AtomicU64::new(1);

/// One chat entry. Key and raw name come from the entry's data and may be
/// missing; such entries are never annotated.
#[derive(Debug)]
pub struct ChatEntry {
    id: u64,
    kind: EntryKind,
    key: Option<ChannelId>,
    raw_name: Option<String>,
    author_chip: bool,
    state: Mutex<EntryState>,
}

pub type EntryRef = Arc<ChatEntry>;

impl ChatEntry {
    pub fn new(
        kind: EntryKind,
        key: Option<ChannelId>,
        raw_name: Option<String>,
        author_chip: bool,
    ) -> EntryRef {
        Arc::new(Self {
            id: NEXT_ENTRY_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            key,
            raw_name,
            author_chip,
            state: Mutex::new(EntryState {
                annotation: AnnotationState::Unannotated,
                rendered: None,
                basis: None,
            }),
        })
    }

    pub fn message(kind: EntryKind, key: impl Into<ChannelId>, raw_name: &str) -> EntryRef {
        Self::new(kind, Some(key.into()), Some(raw_name.to_string()), true)
    }

    /// System entries carry no author chip.
    pub fn system(kind: EntryKind) -> EntryRef {
        Self::new(kind, None, None, false)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    pub fn key(&self) -> Option<&ChannelId> {
        self.key.as_ref()
    }

    pub fn raw_name(&self) -> Option<&str> {
        self.raw_name.as_deref()
    }

    pub fn has_author_chip(&self) -> bool {
        self.author_chip
    }

    pub fn annotation(&self) -> AnnotationState {
        self.state.lock().annotation
    }

    pub fn rendered(&self) -> Option<String> {
        self.state.lock().rendered.clone()
    }

    pub fn basis(&self) -> Option<LabelBasis> {
        self.state.lock().basis.clone()
    }

    /// Text currently shown for the author.
    pub fn display_name(&self) -> Option<String> {
        self.rendered().or_else(|| self.raw_name.clone())
    }

    /// `Unannotated -> AwaitingResolution`. False when the entry was already
    /// claimed.
    pub fn claim(&self) -> bool {
        let mut state = self.state.lock();
        if state.annotation != AnnotationState::Unannotated {
            return false;
        }
        state.annotation = AnnotationState::AwaitingResolution;
        true
    }

    pub fn annotate(&self, rendered: String, basis: LabelBasis) {
        let mut state = self.state.lock();
        state.annotation = AnnotationState::Annotated;
        state.rendered = Some(rendered);
        state.basis = Some(basis);
    }
}

/// A node inserted into the chat. Only nodes with a qualifying tag carry an
/// entry.
#[derive(Debug, Clone)]
pub struct ChatNode {
    pub tag: String,
    pub entry: Option<EntryRef>,
    pub children: Vec<ChatNode>,
}

impl ChatNode {
    pub fn element(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            entry: None,
            children: Vec::new(),
        }
    }

    pub fn entry(entry: EntryRef) -> Self {
        Self {
            tag: entry.kind().tag().to_string(),
            entry: Some(entry),
            children: Vec::new(),
        }
    }

    pub fn with_child(mut self, child: ChatNode) -> Self {
        self.children.push(child);
        self
    }

    /// This node and every descendant that is a chat entry, in document
    /// order.
    pub fn qualifying_entries(&self) -> Vec<EntryRef> {
        let mut out = Vec::new();
        self.collect_entries(&mut out);
        out
    }

    fn collect_entries(&self, out: &mut Vec<EntryRef>) {
        if EntryKind::from_tag(&self.tag).is_some() {
            if let Some(entry) = &self.entry {
                out.push(entry.clone());
            }
        }
        for child in &self.children {
            child.collect_entries(out);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Document,
    Container,
}

#[derive(Debug, Clone)]
pub struct Insertion {
    pub nodes: Vec<ChatNode>,
}

pub trait ChatSurface: Send + Sync {
    fn container_present(&self) -> bool;
    /// Snapshot of the container's top-level nodes; empty when absent.
    fn container_nodes(&self) -> Vec<ChatNode>;
    fn subscribe(&self, scope: Scope) -> mpsc::UnboundedReceiver<Insertion>;
    fn visible_entries(&self) -> Vec<EntryRef>;
}

#[derive(Default)]
struct LiveChatInner {
    container: Option<Vec<ChatNode>>,
    document_subscribers: Vec<mpsc::UnboundedSender<Insertion>>,
    container_subscribers: Vec<mpsc::UnboundedSender<Insertion>>,
}

/// Chat held in memory. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct LiveChat {
    inner: Arc<Mutex<LiveChatInner>>,
}

impl LiveChat {
    /// A page where the chat container has not been created yet.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_container() -> Self {
        let chat = Self::new();
        chat.inner.lock().container = Some(Vec::new());
        chat
    }

    /// Creates the container if missing. Document observers see the
    /// insertion.
    pub fn mount_container(&self) {
        let mut inner = self.inner.lock();
        if inner.container.is_some() {
            return;
        }
        inner.container = Some(Vec::new());
        let insertion = Insertion {
            nodes: vec![ChatNode::element(CONTAINER_TAG)],
        };
        broadcast(&mut inner.document_subscribers, &insertion);
    }

    /// Appends nodes to the container. Returns false when there is no
    /// container yet.
    pub fn insert(&self, nodes: Vec<ChatNode>) -> bool {
        let mut inner = self.inner.lock();
        let Some(container) = inner.container.as_mut() else {
            return false;
        };
        container.extend(nodes.iter().cloned());
        let insertion = Insertion { nodes };
        broadcast(&mut inner.container_subscribers, &insertion);
        broadcast(&mut inner.document_subscribers, &insertion);
        true
    }

    /// An insertion somewhere else on the page.
    pub fn insert_outside(&self, nodes: Vec<ChatNode>) {
        let mut inner = self.inner.lock();
        broadcast(&mut inner.document_subscribers, &Insertion { nodes });
    }

    /// Drops every top-level node holding the entry with `entry_id`.
    pub fn remove(&self, entry_id: u64) {
        let mut inner = self.inner.lock();
        if let Some(container) = inner.container.as_mut() {
            container.retain(|node| {
                !node
                    .qualifying_entries()
                    .iter()
                    .any(|entry| entry.id() == entry_id)
            });
        }
    }

    /// Keeps only the newest `keep` top-level nodes.
    pub fn truncate(&self, keep: usize) {
        let mut inner = self.inner.lock();
        if let Some(container) = inner.container.as_mut() {
            let excess = container.len().saturating_sub(keep);
            container.drain(..excess);
        }
    }

    pub fn document_observers(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.document_subscribers.retain(|tx| !tx.is_closed());
        inner.document_subscribers.len()
    }

    /// Ends every subscription.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.document_subscribers.clear();
        inner.container_subscribers.clear();
    }
}

fn broadcast(subscribers: &mut Vec<mpsc::UnboundedSender<Insertion>>, insertion: &Insertion) {
    subscribers.retain(|tx| tx.send(insertion.clone()).is_ok());
}

impl ChatSurface for LiveChat {
    fn container_present(&self) -> bool {
        self.inner.lock().container.is_some()
    }

    fn container_nodes(&self) -> Vec<ChatNode> {
        self.inner.lock().container.clone().unwrap_or_default()
    }

    fn subscribe(&self, scope: Scope) -> mpsc::UnboundedReceiver<Insertion> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        match scope {
            Scope::Document => inner.document_subscribers.push(tx),
            Scope::Container => inner.container_subscribers.push(tx),
        }
        rx
    }

    fn visible_entries(&self) -> Vec<EntryRef> {
        let inner = self.inner.lock();
        inner
            .container
            .iter()
            .flatten()
            .flat_map(ChatNode::qualifying_entries)
            .collect()
    }
}
