//! In-process publish/subscribe event bus.
//!
//! Created once per daemon process and passed by reference to every
//! collaborator; the kernel and plugins broadcast lifecycle events
//! (`process:started`, `config:changed`, …) without coupling publishers to
//! subscribers. Not a broker: nothing crosses the process boundary here.
//!
//! Fan-out iterates a snapshot of the subscriptions matching the topic, in
//! insertion order, so subscribing or unsubscribing from inside a handler
//! never skips or double-invokes the handlers that were present when the
//! emission began.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{debug, trace, warn};

type SyncCallback = Box<dyn Fn(&str, &Value) -> Result<()> + Send + Sync>;
type AsyncCallback = Box<dyn Fn(String, Value) -> BoxFuture<'static, Result<()>> + Send + Sync>;

enum Callback {
    Sync(SyncCallback),
    Async(AsyncCallback),
}

/// Identity token for one subscription; revokes exactly that handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Debug, Clone, PartialEq, Eq)]
enum TopicPattern {
    /// `*` — every topic.
    All,
    /// `ns:*` — every topic under the namespace prefix, colon included.
    Namespace(String),
    Exact(String),
}

impl TopicPattern {
    fn parse(raw: &str) -> Self {
        if raw == "*" {
            TopicPattern::All
        } else if let Some(ns) = raw.strip_suffix(":*") {
            TopicPattern::Namespace(format!("{ns}:"))
        } else {
            TopicPattern::Exact(raw.to_string())
        }
    }

    fn matches(&self, topic: &str) -> bool {
        match self {
            TopicPattern::All => true,
            TopicPattern::Namespace(prefix) => topic.starts_with(prefix.as_str()),
            TopicPattern::Exact(exact) => exact == topic,
        }
    }
}

struct Subscription {
    id: HandlerId,
    raw_pattern: String,
    pattern: TopicPattern,
    once: bool,
    callback: Arc<Callback>,
}

struct Inner {
    next_id: u64,
    subs: Vec<Subscription>,
}

/// The bus itself. Cheap to share behind an `Arc`.
pub struct EventBus {
    inner: Mutex<Inner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 1,
                subs: Vec::new(),
            }),
        }
    }

    fn subscribe(&self, pattern: &str, once: bool, callback: Callback) -> HandlerId {
        let mut inner = self.inner.lock().expect("event bus lock poisoned");
        let id = HandlerId(inner.next_id);
        inner.next_id += 1;
        inner.subs.push(Subscription {
            id,
            raw_pattern: pattern.to_string(),
            pattern: TopicPattern::parse(pattern),
            once,
            callback: Arc::new(callback),
        });
        trace!(pattern = %pattern, id = id.0, "Subscribed");
        id
    }

    /// Subscribe a synchronous handler to an exact topic or wildcard pattern.
    pub fn on<F>(&self, pattern: &str, handler: F) -> HandlerId
    where
        F: Fn(&str, &Value) -> Result<()> + Send + Sync + 'static,
    {
        self.subscribe(pattern, false, Callback::Sync(Box::new(handler)))
    }

    /// Subscribe an asynchronous handler. Awaited by
    /// [`emit_async`](Self::emit_async); scheduled fire-and-forget by the
    /// synchronous [`emit`](Self::emit).
    pub fn on_async<F, Fut>(&self, pattern: &str, handler: F) -> HandlerId
    where
        F: Fn(String, Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.subscribe(
            pattern,
            false,
            Callback::Async(Box::new(move |topic, payload| {
                Box::pin(handler(topic, payload))
            })),
        )
    }

    /// Subscribe a handler that fires at most once across repeated emissions.
    ///
    /// The subscription is consumed when an emission's snapshot includes it,
    /// even if an earlier handler's failure aborts that fail-fast emission
    /// before this one runs. At-most-once, not exactly-once.
    pub fn once<F>(&self, topic: &str, handler: F) -> HandlerId
    where
        F: Fn(&str, &Value) -> Result<()> + Send + Sync + 'static,
    {
        self.subscribe(topic, true, Callback::Sync(Box::new(handler)))
    }

    /// Revoke exactly the subscription behind `id`.
    pub fn unsubscribe(&self, id: HandlerId) -> bool {
        let mut inner = self.inner.lock().expect("event bus lock poisoned");
        let before = inner.subs.len();
        inner.subs.retain(|s| s.id != id);
        inner.subs.len() != before
    }

    /// Remove every handler registered with exactly this pattern string.
    pub fn off(&self, topic: &str) -> usize {
        let mut inner = self.inner.lock().expect("event bus lock poisoned");
        let before = inner.subs.len();
        inner.subs.retain(|s| s.raw_pattern != topic);
        before - inner.subs.len()
    }

    /// Remove every subscription on the bus.
    pub fn remove_all(&self) {
        self.inner
            .lock()
            .expect("event bus lock poisoned")
            .subs
            .clear();
    }

    /// Count the handlers that would fire for this exact topic, wildcard
    /// matches included.
    pub fn listener_count(&self, topic: &str) -> usize {
        self.inner
            .lock()
            .expect("event bus lock poisoned")
            .subs
            .iter()
            .filter(|s| s.pattern.matches(topic))
            .count()
    }

    /// Snapshot the matching callbacks in insertion order, consuming the
    /// one-shot subscriptions so they cannot fire again.
    fn matched(&self, topic: &str) -> Vec<Arc<Callback>> {
        let mut inner = self.inner.lock().expect("event bus lock poisoned");
        let matched: Vec<Arc<Callback>> = inner
            .subs
            .iter()
            .filter(|s| s.pattern.matches(topic))
            .map(|s| Arc::clone(&s.callback))
            .collect();
        inner
            .subs
            .retain(|s| !(s.once && s.pattern.matches(topic)));
        matched
    }

    /// Synchronous fan-out.
    ///
    /// Handler failures are not caught: the first error aborts the remaining
    /// handlers of this emission and propagates to the caller. These are
    /// in-process programming errors, not operational conditions. Async
    /// subscribers are spawned onto the runtime and their outcome is not
    /// observed here; use [`emit_async`](Self::emit_async) to await them.
    pub fn emit(&self, topic: &str, payload: Value) -> Result<()> {
        trace!(topic = %topic, "Emitting event");
        for callback in self.matched(topic) {
            match &*callback {
                Callback::Sync(f) => f(topic, &payload)?,
                Callback::Async(f) => match tokio::runtime::Handle::try_current() {
                    Ok(handle) => {
                        let fut = f(topic.to_string(), payload.clone());
                        let topic = topic.to_string();
                        handle.spawn(async move {
                            if let Err(err) = fut.await {
                                warn!(topic = %topic, "Async subscriber failed: {err}");
                            }
                        });
                    }
                    Err(_) => {
                        anyhow::bail!("async subscriber for '{topic}' requires a runtime; use emit_async")
                    }
                },
            }
        }
        Ok(())
    }

    /// Invoke all matching handlers, async ones included, and wait for every
    /// one to finish. One handler's failure fails the aggregate; the first
    /// error in subscription order is reported.
    pub async fn emit_async(&self, topic: &str, payload: Value) -> Result<()> {
        trace!(topic = %topic, "Emitting event (async)");
        let futures: Vec<BoxFuture<'static, Result<()>>> = self
            .matched(topic)
            .into_iter()
            .map(|callback| {
                let topic = topic.to_string();
                let payload = payload.clone();
                let fut: BoxFuture<'static, Result<()>> = Box::pin(async move {
                    match &*callback {
                        Callback::Sync(f) => f(&topic, &payload),
                        Callback::Async(f) => f(topic.clone(), payload.clone()).await,
                    }
                });
                fut
            })
            .collect();

        let results = futures::future::join_all(futures).await;
        let total = results.len();
        for result in results {
            if let Err(err) = result {
                debug!(topic = %topic, handlers = total, "Aggregate emission failed");
                return Err(err);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, impl Fn(&str, &Value) -> Result<()> + Send + Sync + Clone) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&count);
        (count, move |_: &str, _: &Value| {
            inner.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn namespace_wildcard_matches_the_namespace_only() {
        let bus = EventBus::new();
        let (count, handler) = counter();
        bus.on("process:*", handler);
        bus.emit("process:start", json!({})).unwrap();
        bus.emit("process:stop", json!({})).unwrap();
        bus.emit("other:start", json!({})).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn star_matches_every_topic() {
        let bus = EventBus::new();
        let (count, handler) = counter();
        bus.on("*", handler);
        bus.emit("a", json!(1)).unwrap();
        bus.emit("b:c", json!(2)).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn once_fires_exactly_once() {
        let bus = EventBus::new();
        let (count, handler) = counter();
        bus.once("tick", handler);
        bus.emit("tick", Value::Null).unwrap();
        bus.emit("tick", Value::Null).unwrap();
        bus.emit("tick", Value::Null).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn once_is_consumed_by_an_aborted_emission() {
        let bus = EventBus::new();
        let (count, handler) = counter();
        bus.on("tick", |_, _| anyhow::bail!("wiring bug"));
        bus.once("tick", handler);

        assert!(bus.emit("tick", Value::Null).is_err());
        // Snapshotted and consumed without firing: at-most-once.
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(bus.listener_count("tick"), 1);
    }

    #[test]
    fn off_removes_all_handlers_on_that_exact_topic() {
        let bus = EventBus::new();
        let (count_a, handler_a) = counter();
        let (count_b, handler_b) = counter();
        let (count_other, handler_other) = counter();
        bus.on("tick", handler_a);
        bus.on("tick", handler_b);
        bus.on("tock", handler_other);
        assert_eq!(bus.off("tick"), 2);
        bus.emit("tick", Value::Null).unwrap();
        bus.emit("tock", Value::Null).unwrap();
        assert_eq!(count_a.load(Ordering::SeqCst), 0);
        assert_eq!(count_b.load(Ordering::SeqCst), 0);
        assert_eq!(count_other.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_stops_exactly_that_handler() {
        let bus = EventBus::new();
        let (count_a, handler_a) = counter();
        let (count_b, handler_b) = counter();
        let id = bus.on("tick", handler_a);
        bus.on("tick", handler_b);
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.emit("tick", Value::Null).unwrap();
        assert_eq!(count_a.load(Ordering::SeqCst), 0);
        assert_eq!(count_b.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listener_count_includes_wildcards() {
        let bus = EventBus::new();
        bus.on("process:*", |_, _| Ok(()));
        bus.on("process:start", |_, _| Ok(()));
        bus.on("*", |_, _| Ok(()));
        bus.on("other", |_, _| Ok(()));
        assert_eq!(bus.listener_count("process:start"), 3);
    }

    #[test]
    fn emit_is_fail_fast_and_propagates() {
        let bus = EventBus::new();
        let (count, handler) = counter();
        bus.on("tick", |_, _| anyhow::bail!("wiring bug"));
        bus.on("tick", handler);
        let err = bus.emit("tick", Value::Null).unwrap_err();
        assert!(err.to_string().contains("wiring bug"));
        // Remaining handlers of that emission were abandoned.
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn handlers_run_in_insertion_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            // Mix of wildcard and exact: merged set still insertion order.
            let pattern = if tag == "second" { "ns:*" } else { "ns:tick" };
            bus.on(pattern, move |_, _| {
                order.lock().unwrap().push(tag);
                Ok(())
            });
        }
        bus.emit("ns:tick", Value::Null).unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn subscribing_during_emission_does_not_affect_the_snapshot() {
        let bus = Arc::new(EventBus::new());
        let (count, handler) = counter();
        let bus_ref = Arc::clone(&bus);
        bus.on("tick", move |_, _| {
            // Mutating the subscriber list mid-emission must not skip or
            // double-invoke anything already snapshotted.
            bus_ref.on("tick", |_, _| Ok(()));
            Ok(())
        });
        bus.on("tick", handler);
        bus.emit("tick", Value::Null).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count("tick"), 3);
    }

    #[tokio::test]
    async fn emit_async_awaits_every_handler() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let count = Arc::clone(&count);
            bus.on_async("go", move |_, _| {
                let count = Arc::clone(&count);
                async move {
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                    count.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            });
        }
        bus.emit_async("go", Value::Null).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn emit_async_fails_the_aggregate_on_one_failure() {
        let bus = EventBus::new();
        let (count, handler) = counter();
        bus.on("go", handler);
        bus.on_async("go", |_, _| async { anyhow::bail!("async wiring bug") });
        let err = bus.emit_async("go", Value::Null).await.unwrap_err();
        assert!(err.to_string().contains("async wiring bug"));
        // The sync sibling still ran; emit_async waits for everyone.
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn remove_all_clears_the_bus() {
        let bus = EventBus::new();
        bus.on("*", |_, _| Ok(()));
        bus.on("a", |_, _| Ok(()));
        bus.remove_all();
        assert_eq!(bus.listener_count("a"), 0);
    }
}
