//! Abstract gossip bus contract and its backends.
//!
//! `publish` is best-effort and never fails; `subscribe`/`unsubscribe` are
//! thread-safe. Every backend clones its listener list under a lock and
//! releases the lock before invoking listeners, so a slow or panicking
//! listener can never hold up a concurrent `subscribe`/`unsubscribe`.

use meshrabiya_codec::{verify_envelope, DelegationMessage, SignedEnvelope};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// A message as it travels over the bus: the wire-format JSON plus a topic
/// label backends may use for logging or routing.
#[derive(Debug, Clone)]
pub struct WireMessage {
    pub topic: String,
    pub json: String,
}

impl WireMessage {
    pub fn new(topic: impl Into<String>, json: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            json: json.into(),
        }
    }
}

/// What a listener receives: either a verified, typed delegation message
/// (typed adapter) or the exact raw JSON that was published (verbatim
/// adapter).
#[derive(Debug, Clone)]
pub enum GossipPayload {
    Typed(DelegationMessage),
    Raw(String),
}

pub trait GossipListener: Send + Sync {
    fn on_message(&self, payload: GossipPayload);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub trait GossipBus: Send + Sync {
    fn publish(&self, msg: WireMessage);
    fn subscribe(&self, listener: Arc<dyn GossipListener>) -> SubscriptionId;
    fn unsubscribe(&self, id: SubscriptionId);
}

/// Wraps a closure as a `GossipListener`, for callers that would rather not
/// define a named type (e.g. the Orchestrator's offer-collection filter).
struct FnListener<F> {
    f: F,
}

impl<F> GossipListener for FnListener<F>
where
    F: Fn(GossipPayload) + Send + Sync,
{
    fn on_message(&self, payload: GossipPayload) {
        (self.f)(payload)
    }
}

pub fn listener_fn<F>(f: F) -> Arc<dyn GossipListener>
where
    F: Fn(GossipPayload) + Send + Sync + 'static,
{
    Arc::new(FnListener { f })
}

#[derive(Default)]
struct Registry {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(SubscriptionId, Arc<dyn GossipListener>)>>,
}

impl Registry {
    fn add(&self, listener: Arc<dyn GossipListener>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.listeners.lock().unwrap().push((id, listener));
        id
    }

    fn remove(&self, id: SubscriptionId) {
        self.listeners.lock().unwrap().retain(|(existing, _)| *existing != id);
    }

    fn snapshot(&self) -> Vec<Arc<dyn GossipListener>> {
        self.listeners
            .lock()
            .unwrap()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect()
    }
}

/// Used when no mesh node is attached. `publish` logs and discards;
/// `subscribe` never fires.
#[derive(Debug, Default)]
pub struct NoOpGossipBus;

impl GossipBus for NoOpGossipBus {
    fn publish(&self, msg: WireMessage) {
        tracing::debug!(topic = %msg.topic, "no-op gossip bus discarding publish");
    }

    fn subscribe(&self, _listener: Arc<dyn GossipListener>) -> SubscriptionId {
        SubscriptionId(0)
    }

    fn unsubscribe(&self, _id: SubscriptionId) {}
}

/// Deserializes inbound messages as `SignedEnvelope`, verifies the
/// signature, and dispatches the typed payload to listeners. Anything
/// unparsable or unverifiable is dropped.
#[derive(Default)]
pub struct MmcpGossipBus {
    registry: Registry,
}

impl MmcpGossipBus {
    pub fn new() -> Self {
        Self::default()
    }
}

impl GossipBus for MmcpGossipBus {
    fn publish(&self, msg: WireMessage) {
        let envelope: SignedEnvelope = match serde_json::from_str(&msg.json) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(topic = %msg.topic, error = %e, "dropping unparsable gossip message");
                return;
            }
        };
        if !verify_envelope(&envelope) {
            tracing::warn!(topic = %msg.topic, "dropping gossip message that failed verification");
            return;
        }
        for listener in self.registry.snapshot() {
            listener.on_message(GossipPayload::Typed(envelope.wrapper.clone()));
        }
    }

    fn subscribe(&self, listener: Arc<dyn GossipListener>) -> SubscriptionId {
        self.registry.add(listener)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.registry.remove(id);
    }
}

/// Forwards the exact wrapped JSON string to listeners, unmodified. Used
/// when downstream consumers must reproduce byte-identical payloads, e.g.
/// for re-signing or audit. Replays the most recent payload to a listener
/// that subscribes after it was published.
#[derive(Default)]
pub struct JsonFlowGossipBus {
    registry: Registry,
    last_payload: Mutex<Option<String>>,
}

impl JsonFlowGossipBus {
    pub fn new() -> Self {
        Self::default()
    }
}

impl GossipBus for JsonFlowGossipBus {
    fn publish(&self, msg: WireMessage) {
        *self.last_payload.lock().unwrap() = Some(msg.json.clone());
        for listener in self.registry.snapshot() {
            listener.on_message(GossipPayload::Raw(msg.json.clone()));
        }
    }

    fn subscribe(&self, listener: Arc<dyn GossipListener>) -> SubscriptionId {
        let id = self.registry.add(listener.clone());
        let last = self.last_payload.lock().unwrap().clone();
        if let Some(payload) = last {
            listener.on_message(GossipPayload::Raw(payload));
        }
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.registry.remove(id);
    }
}
