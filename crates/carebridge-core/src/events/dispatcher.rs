use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::topic::{Topic, TopicPattern};
use super::types::{DeliveryMode, Event, EventContext, SubscriberError};
use crate::error::Result;

/// Type alias for subscriber callbacks.
pub type SubscriberCallback =
    Arc<dyn Fn(Event) -> BoxFuture<'static, std::result::Result<(), SubscriberError>> + Send + Sync>;

/// Wrap an async closure as a [`SubscriberCallback`].
pub fn subscriber<F, Fut>(f: F) -> SubscriberCallback
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), SubscriberError>> + Send + 'static,
{
    Arc::new(move |event| Box::pin(f(event)))
}

/// Opaque handle identifying a subscription for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Introspection view of a registered subscription.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub pattern: TopicPattern,
    pub mode: DeliveryMode,
}

enum Delivery {
    /// Invoked inline on the emitter's task.
    Sync(SubscriberCallback),
    /// Queued to a dedicated worker, preserving per-subscriber ordering.
    Async(mpsc::UnboundedSender<Event>),
}

struct Registered {
    id: SubscriptionId,
    pattern: TopicPattern,
    mode: DeliveryMode,
    seq: u64,
    delivery: Delivery,
}

#[derive(Default)]
struct TrieNode {
    children: HashMap<String, TrieNode>,
    exact: Vec<Arc<Registered>>,
    wildcard: Vec<Arc<Registered>>,
}

impl TrieNode {
    fn insert(&mut self, registered: Arc<Registered>) {
        match registered.pattern.clone() {
            TopicPattern::Exact(topic) => {
                let node = topic
                    .segments()
                    .fold(self, |node, segment| node.child_mut(segment));
                node.exact.push(registered);
            }
            TopicPattern::Prefix(prefix) => {
                let node = prefix
                    .iter()
                    .fold(self, |node, segment| node.child_mut(segment));
                node.wildcard.push(registered);
            }
        }
    }

    fn child_mut(&mut self, segment: &str) -> &mut TrieNode {
        self.children.entry(segment.to_string()).or_default()
    }

    fn remove(&mut self, pattern: &TopicPattern, id: SubscriptionId) {
        let segments: Vec<&str> = match pattern {
            TopicPattern::Exact(topic) => topic.segments().collect(),
            TopicPattern::Prefix(prefix) => prefix.iter().map(String::as_str).collect(),
        };
        let mut node = self;
        for segment in segments {
            match node.children.get_mut(segment) {
                Some(child) => node = child,
                None => return,
            }
        }
        node.exact.retain(|r| r.id != id);
        node.wildcard.retain(|r| r.id != id);
    }

    /// All subscriptions matching `topic`: wildcard entries along the
    /// segment path plus exact entries at the terminal node.
    fn collect(&self, topic: &Topic) -> Vec<Arc<Registered>> {
        let mut matched: Vec<Arc<Registered>> = self.wildcard.iter().cloned().collect();
        let mut node = self;
        for segment in topic.segments() {
            match node.children.get(segment) {
                Some(child) => {
                    node = child;
                    matched.extend(node.wildcard.iter().cloned());
                }
                None => return matched,
            }
        }
        matched.extend(node.exact.iter().cloned());
        matched
    }
}

#[derive(Default)]
struct TrieState {
    root: TrieNode,
    patterns: HashMap<SubscriptionId, (TopicPattern, DeliveryMode)>,
}

type EventCreator = Arc<dyn Fn(&EventContext) -> Value + Send + Sync>;

/// The in-process event bus: one per host, injected into every gateway.
///
/// Matching subscribers are invoked in registration order, synchronous
/// before asynchronous. Subscriber failures and panics are logged and never
/// reach the emitter.
pub struct EventDispatcher {
    state: RwLock<TrieState>,
    seq: AtomicU64,
    source: String,
    creator: RwLock<EventCreator>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::with_source("carebridge")
    }

    /// Create a dispatcher whose events carry the given source-system name.
    pub fn with_source(source: impl Into<String>) -> Self {
        Self {
            state: RwLock::new(TrieState::default()),
            seq: AtomicU64::new(0),
            source: source.into(),
            creator: RwLock::new(Arc::new(|ctx: &EventContext| ctx.default_payload())),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Create a dispatcher wrapped in an Arc for sharing across gateways.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a subscriber for `pattern` with the given delivery mode.
    pub fn subscribe(
        &self,
        pattern: &str,
        mode: DeliveryMode,
        callback: SubscriberCallback,
    ) -> Result<SubscriptionId> {
        let pattern = TopicPattern::parse(pattern)?;
        let id = SubscriptionId(Uuid::new_v4());
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);

        let delivery = match mode {
            DeliveryMode::Sync => Delivery::Sync(callback),
            DeliveryMode::Async => {
                let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
                let worker = tokio::spawn(async move {
                    while let Some(event) = rx.recv().await {
                        deliver_isolated(id, &callback, event).await;
                    }
                });
                let mut workers = self.workers.lock().expect("workers lock poisoned");
                workers.retain(|handle| !handle.is_finished());
                workers.push(worker);
                Delivery::Async(tx)
            }
        };

        let registered = Arc::new(Registered {
            id,
            pattern: pattern.clone(),
            mode,
            seq,
            delivery,
        });

        let mut state = self.state.write().expect("dispatcher lock poisoned");
        state.root.insert(registered);
        state.patterns.insert(id, (pattern.clone(), mode));
        debug!(pattern = %pattern, ?mode, "Registered event subscription");
        Ok(id)
    }

    /// Remove a subscription. Returns false when the id is unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut state = self.state.write().expect("dispatcher lock poisoned");
        match state.patterns.remove(&id) {
            Some((pattern, _mode)) => {
                state.root.remove(&pattern, id);
                true
            }
            None => false,
        }
    }

    /// Introspection view of every registered subscription.
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.state
            .read()
            .expect("dispatcher lock poisoned")
            .patterns
            .iter()
            .map(|(id, (pattern, mode))| Subscription {
                id: *id,
                pattern: pattern.clone(),
                mode: *mode,
            })
            .collect()
    }

    pub fn subscription_count(&self) -> usize {
        self.state
            .read()
            .expect("dispatcher lock poisoned")
            .patterns
            .len()
    }

    /// Install the pluggable payload factory used by every gateway.
    pub fn set_event_creator<F>(&self, creator: F)
    where
        F: Fn(&EventContext) -> Value + Send + Sync + 'static,
    {
        *self.creator.write().expect("creator lock poisoned") = Arc::new(creator);
    }

    /// Build an event payload from operation context via the installed
    /// creator.
    pub fn create_payload(&self, context: &EventContext) -> Value {
        let creator = self.creator.read().expect("creator lock poisoned").clone();
        creator(context)
    }

    /// Emit `payload` under `topic`. Returns the number of subscribers the
    /// event was delivered (sync) or queued (async) to.
    pub async fn emit(&self, topic: &str, payload: Value) -> Result<usize> {
        let topic = Topic::parse(topic)?;
        let event = Event::new(topic.clone(), payload, self.source.clone());

        let mut matched = {
            let state = self.state.read().expect("dispatcher lock poisoned");
            state.root.collect(&topic)
        };
        // Sync subscribers first, then registration order within each mode.
        matched.sort_by_key(|r| (r.mode == DeliveryMode::Async, r.seq));

        let mut delivered = 0;
        for registered in matched {
            match &registered.delivery {
                Delivery::Sync(callback) => {
                    deliver_isolated(registered.id, callback, event.clone()).await;
                    delivered += 1;
                }
                Delivery::Async(tx) => {
                    if tx.send(event.clone()).is_ok() {
                        delivered += 1;
                    } else {
                        debug!(subscription = %registered.id, "Async subscriber worker gone");
                    }
                }
            }
        }
        Ok(delivered)
    }

    /// Build the payload from `context` via the installed creator and emit
    /// it under `topic`.
    pub async fn emit_with_context(&self, topic: &str, context: &EventContext) -> Result<usize> {
        let payload = self.create_payload(context);
        self.emit(topic, payload).await
    }

    /// Drop all subscriptions and cancel async delivery workers. Called by
    /// the host during graceful shutdown.
    pub fn shutdown(&self) {
        let mut state = self.state.write().expect("dispatcher lock poisoned");
        state.root = TrieNode::default();
        state.patterns.clear();
        drop(state);

        let mut workers = self.workers.lock().expect("workers lock poisoned");
        for worker in workers.drain(..) {
            worker.abort();
        }
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("subscription_count", &self.subscription_count())
            .field("source", &self.source)
            .finish()
    }
}

async fn deliver_isolated(id: SubscriptionId, callback: &SubscriberCallback, event: Event) {
    let topic = event.topic.clone();
    match AssertUnwindSafe(callback(event)).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            warn!(subscription = %id, topic = %topic, error = %e, "Event subscriber failed");
        }
        Err(panic) => {
            let panic_msg = if let Some(s) = panic.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic.downcast_ref::<String>() {
                s.clone()
            } else {
                "Unknown panic".to_string()
            };
            error!(subscription = %id, topic = %topic, panic = %panic_msg, "Event subscriber panicked");
        }
    }
}
