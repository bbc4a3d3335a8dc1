//! In-process event bus.
//!
//! Single-process publish/subscribe connecting every component of the
//! core. Subscribers register for a specific event kind or as wildcard
//! sinks, optionally narrowed by a topic pattern. Handlers run inline on
//! the publishing task so that events from one publisher are observed in
//! publication order; handler failures are logged and never abort
//! publication or other handlers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use futures::future::BoxFuture;
use serde_json::Value;

use crate::domain::models::{topic_matches, AgentId, Event, EventKind};

/// Handle returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

/// An async event handler. Errors are captured and logged by the bus.
pub type EventSink = Arc<dyn Fn(Event) -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

/// Wrap an infallible async closure into an [`EventSink`].
pub fn sink<F, Fut>(f: F) -> EventSink
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Arc::new(move |event| {
        let fut = f(event);
        Box::pin(async move {
            fut.await;
            Ok(())
        })
    })
}

struct Subscription {
    token: SubscriptionToken,
    /// `None` subscribes to every kind (wildcard sink).
    kind: Option<EventKind>,
    /// Optional topic pattern, e.g. `agents` or `circles:*`.
    topic: Option<String>,
    handler: EventSink,
}

impl Subscription {
    fn matches(&self, event: &Event) -> bool {
        if self.kind.is_some_and(|k| k != event.kind) {
            return false;
        }
        match &self.topic {
            None => true,
            Some(pattern) => event.topics.iter().any(|t| topic_matches(pattern, t)),
        }
    }
}

/// Configuration for the event bus.
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Bounded history ring size. The ring is advisory; tests consult it.
    pub history_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self { history_capacity: 1024 }
    }
}

/// Central pub/sub for the orchestration core.
pub struct EventBus {
    // Read-mostly: publishes snapshot under a read lock, registration
    // takes the write lock. No lock is held across an await.
    subscriptions: RwLock<Vec<Subscription>>,
    history: Mutex<VecDeque<Event>>,
    next_token: AtomicU64,
    config: EventBusConfig,
}

impl EventBus {
    pub fn new(config: EventBusConfig) -> Self {
        Self {
            subscriptions: RwLock::new(Vec::new()),
            history: Mutex::new(VecDeque::with_capacity(config.history_capacity)),
            next_token: AtomicU64::new(0),
            config,
        }
    }

    /// Register a handler for `kind` (or every kind when `None`).
    pub fn subscribe(&self, kind: Option<EventKind>, handler: EventSink) -> SubscriptionToken {
        self.subscribe_filtered(kind, None, handler)
    }

    /// Register a handler narrowed by a topic pattern (`T` or `T:*`).
    pub fn subscribe_filtered(
        &self,
        kind: Option<EventKind>,
        topic: Option<String>,
        handler: EventSink,
    ) -> SubscriptionToken {
        let token = SubscriptionToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let mut subs = self.subscriptions.write().expect("subscriber table poisoned");
        subs.push(Subscription { token, kind, topic, handler });
        token
    }

    /// Remove a subscription. Returns `true` when it existed.
    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        let mut subs = self.subscriptions.write().expect("subscriber table poisoned");
        let before = subs.len();
        subs.retain(|s| s.token != token);
        subs.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriptions.read().expect("subscriber table poisoned").len()
    }

    /// Publish an event to every matching handler, in registration
    /// order, on the calling task. Handler errors are logged and do not
    /// stop delivery.
    pub async fn publish(&self, event: Event) {
        {
            let mut history = self.history.lock().expect("history ring poisoned");
            if history.len() >= self.config.history_capacity {
                history.pop_front();
            }
            history.push_back(event.clone());
        }

        let handlers: Vec<EventSink> = {
            let subs = self.subscriptions.read().expect("subscriber table poisoned");
            subs.iter()
                .filter(|s| s.matches(&event))
                .map(|s| Arc::clone(&s.handler))
                .collect()
        };

        for handler in handlers {
            if let Err(error) = handler(event.clone()).await {
                tracing::warn!(kind = %event.kind, error, "event handler failed");
            }
        }
    }

    /// Build and publish an event in one call, returning its id-bearing
    /// copy for correlation.
    pub async fn emit(&self, kind: EventKind, payload: Value, source: Option<AgentId>) -> Event {
        let event = Event::new(kind, payload, source);
        self.publish(event.clone()).await;
        event
    }

    /// Recent events, newest last, optionally filtered by kind and
    /// bounded by `limit`.
    pub fn history(&self, kind: Option<EventKind>, limit: Option<usize>) -> Vec<Event> {
        let history = self.history.lock().expect("history ring poisoned");
        let filtered: Vec<Event> = history
            .iter()
            .filter(|e| kind.is_none_or(|k| e.kind == k))
            .cloned()
            .collect();
        match limit {
            Some(n) if filtered.len() > n => filtered[filtered.len() - n..].to_vec(),
            _ => filtered,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EventBusConfig::default())
    }
}
