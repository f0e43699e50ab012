//! Event registration, subscription and dispatch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use super::{Event, EventDef, EventDefinition, FieldSpec};
use crate::conntrack::ConntrackEntry;
use crate::error::{EmitError, EventError, ListenerError, ListenerFailure};
use crate::packet::Packet;
use crate::proto::LayerStack;

/// Identifies a subscription for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Receives events of the definitions it subscribed to.
pub trait EventListener: Send + Sync {
    fn name(&self) -> &str;

    /// Handle one event. An error is reported to the emitter but does not
    /// stop delivery to other listeners.
    fn on_event(&self, event: &Event, cx: &mut EventContext<'_>) -> Result<(), ListenerError>;
}

/// Notified when a definition gains its first or loses its last listener.
pub trait ListenerWatch: Send + Sync {
    fn listeners_changed(&self, bus: &EventBus, definition: &EventDef, has_listeners: bool);
}

#[derive(Clone)]
pub(crate) struct Subscription {
    id: SubscriptionId,
    listener: Arc<dyn EventListener>,
}

/// Processing context handed to listeners.
///
/// Carries the packet and layer stack that produced the event and, when
/// the emitting layer or one below it is tracked, exclusive access to that
/// conntrack entry.
pub struct EventContext<'a> {
    bus: &'a EventBus,
    packet: Option<&'a Packet>,
    stack: Option<&'a LayerStack>,
    conntrack: Option<&'a mut ConntrackEntry>,
}

impl<'a> EventContext<'a> {
    /// A context outside of packet processing.
    pub fn new(bus: &'a EventBus) -> Self {
        Self {
            bus,
            packet: None,
            stack: None,
            conntrack: None,
        }
    }

    pub fn with_packet(mut self, packet: &'a Packet, stack: &'a LayerStack) -> Self {
        self.packet = Some(packet);
        self.stack = Some(stack);
        self
    }

    pub fn with_conntrack(mut self, entry: Option<&'a mut ConntrackEntry>) -> Self {
        self.conntrack = entry;
        self
    }

    pub fn bus(&self) -> &'a EventBus {
        self.bus
    }

    pub fn packet(&self) -> Option<&'a Packet> {
        self.packet
    }

    pub fn stack(&self) -> Option<&'a LayerStack> {
        self.stack
    }

    pub fn conntrack(&self) -> Option<&ConntrackEntry> {
        self.conntrack.as_deref()
    }

    pub fn conntrack_mut(&mut self) -> Option<&mut ConntrackEntry> {
        self.conntrack.as_deref_mut()
    }

    /// Emit another event from within a listener, in the same context.
    pub fn emit(&mut self, event: Event) -> Result<usize, EmitError> {
        let bus = self.bus;
        bus.emit(event, self)
    }
}

/// Registry of event definitions and their subscribers.
#[derive(Default)]
pub struct EventBus {
    definitions: RwLock<HashMap<String, EventDef>>,
    next_subscription: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition. Names are unique.
    pub fn register_definition(
        &self,
        name: &str,
        version: u32,
        fields: Vec<FieldSpec>,
    ) -> Result<EventDef, EventError> {
        let mut definitions = self.definitions.write();
        if definitions.contains_key(name) {
            return Err(EventError::DuplicateDefinition(name.to_string()));
        }
        let definition = Arc::new(EventDefinition::new(name, version, fields));
        definitions.insert(name.to_string(), definition.clone());
        debug!(event = name, version, "registered event definition");
        Ok(definition)
    }

    pub fn definition(&self, name: &str) -> Option<EventDef> {
        self.definitions.read().get(name).cloned()
    }

    /// All definitions, sorted by name.
    pub fn definitions(&self) -> Vec<EventDef> {
        let mut all: Vec<EventDef> = self.definitions.read().values().cloned().collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    pub fn has_subscribers(&self, definition: &EventDef) -> bool {
        definition.has_subscribers()
    }

    /// Add `listener` to the definition's subscriber list.
    ///
    /// Listeners are called in subscription order.
    pub fn subscribe(
        &self,
        definition: &EventDef,
        listener: Arc<dyn EventListener>,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        let name = listener.name().to_string();

        let first = {
            let mut subscribers = definition.subscribers.write();
            let mut next = Vec::with_capacity(subscribers.len() + 1);
            next.extend(subscribers.iter().cloned());
            next.push(Subscription { id, listener });
            let first = subscribers.is_empty();
            definition
                .subscriber_count
                .store(next.len(), Ordering::SeqCst);
            *subscribers = Arc::new(next);
            first
        };

        debug!(event = definition.name(), listener = %name, "subscribed");
        if first {
            self.notify_watchers(definition, true);
        }
        id
    }

    /// Remove a subscription. Returns false if it was not present.
    pub fn unsubscribe(&self, definition: &EventDef, id: SubscriptionId) -> bool {
        let (removed, last) = {
            let mut subscribers = definition.subscribers.write();
            if !subscribers.iter().any(|sub| sub.id == id) {
                return false;
            }
            let next: Vec<Subscription> = subscribers
                .iter()
                .filter(|sub| sub.id != id)
                .cloned()
                .collect();
            let last = next.is_empty();
            definition
                .subscriber_count
                .store(next.len(), Ordering::SeqCst);
            *subscribers = Arc::new(next);
            (true, last)
        };

        debug!(event = definition.name(), "unsubscribed");
        if last {
            self.notify_watchers(definition, false);
        }
        removed
    }

    /// Watch the definition's listener set. `watch` is told immediately if
    /// the set is already non-empty.
    pub fn watch_listeners(&self, definition: &EventDef, watch: Arc<dyn ListenerWatch>) {
        definition.watchers.lock().push(watch.clone());
        if definition.has_subscribers() {
            watch.listeners_changed(self, definition, true);
        }
    }

    /// Stop watching; matches by pointer.
    pub fn unwatch_listeners(&self, definition: &EventDef, watch: &Arc<dyn ListenerWatch>) {
        definition
            .watchers
            .lock()
            .retain(|existing| !Arc::ptr_eq(existing, watch));
    }

    fn notify_watchers(&self, definition: &EventDef, has_listeners: bool) {
        let watchers = definition.watchers.lock().clone();
        for watch in watchers {
            watch.listeners_changed(self, definition, has_listeners);
        }
    }

    /// Close `event` and deliver it to every current subscriber of its
    /// definition, in subscription order.
    ///
    /// Returns the number of listeners that accepted it. If any failed, the
    /// error lists them; the others were still called.
    pub fn emit(&self, mut event: Event, cx: &mut EventContext<'_>) -> Result<usize, EmitError> {
        event.close();
        let definition = event.definition().clone();
        definition.emitted.fetch_add(1, Ordering::Relaxed);

        let snapshot = definition.subscribers.read().clone();
        let mut delivered = 0;
        let mut failures = Vec::new();

        for subscription in snapshot.iter() {
            match subscription.listener.on_event(&event, cx) {
                Ok(()) => delivered += 1,
                Err(error) => {
                    warn!(
                        event = definition.name(),
                        listener = subscription.listener.name(),
                        %error,
                        "event listener failed"
                    );
                    failures.push(ListenerFailure {
                        listener: subscription.listener.name().to_string(),
                        error,
                    });
                }
            }
        }

        if failures.is_empty() {
            Ok(delivered)
        } else {
            Err(EmitError {
                event: definition.name().to_string(),
                delivered,
                failures,
            })
        }
    }
}
