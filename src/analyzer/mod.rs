//! Analyzers correlate decoder events into higher-level events.
//!
//! An analyzer only listens upstream while one of its own output events
//! has a listener, so unused analyzers cost nothing per packet.

mod ppp_chap;
mod tftp_file;

pub use ppp_chap::{PppChapAnalyzer, CHAP_CHALLENGE_RESPONSE, CHAP_MSCHAPV2};
pub use tftp_file::{TftpFileAnalyzer, TFTP_FILE};

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::conntrack::AnalyzerId;
use crate::error::AnalyzerError;
use crate::event::{EventBus, EventDef, EventListener, ListenerWatch, SubscriptionId};

pub trait Analyzer: EventListener + ListenerWatch {
    fn id(&self) -> AnalyzerId;

    /// Start watching the output events.
    fn start(&self, bus: &EventBus) -> Result<(), AnalyzerError>;

    /// Stop watching and drop every upstream subscription.
    fn stop(&self, bus: &EventBus);
}

/// Look up a definition an analyzer depends on.
pub(crate) fn require(
    bus: &EventBus,
    analyzer: &'static str,
    event: &'static str,
) -> Result<EventDef, AnalyzerError> {
    bus.definition(event)
        .ok_or(AnalyzerError::MissingEvent { analyzer, event })
}

#[derive(Default)]
struct UpstreamState {
    /// Output definitions that currently have listeners.
    active: BTreeSet<String>,
    subscriptions: Vec<(EventDef, SubscriptionId)>,
    watch: Option<Arc<dyn ListenerWatch>>,
}

/// Upstream subscriptions of an analyzer, held while any output is in use.
pub(crate) struct Upstream {
    analyzer: AnalyzerId,
    inputs: Vec<EventDef>,
    outputs: Vec<EventDef>,
    state: Mutex<UpstreamState>,
}

impl Upstream {
    pub(crate) fn new(analyzer: AnalyzerId, inputs: Vec<EventDef>, outputs: Vec<EventDef>) -> Self {
        Self {
            analyzer,
            inputs,
            outputs,
            state: Mutex::new(UpstreamState::default()),
        }
    }

    pub(crate) fn start(&self, bus: &EventBus, watch: Arc<dyn ListenerWatch>) {
        self.state.lock().watch = Some(watch.clone());
        for output in &self.outputs {
            bus.watch_listeners(output, watch.clone());
        }
    }

    pub(crate) fn stop(&self, bus: &EventBus) {
        let (watch, subscriptions) = {
            let mut state = self.state.lock();
            state.active.clear();
            (state.watch.take(), std::mem::take(&mut state.subscriptions))
        };
        if let Some(watch) = watch {
            for output in &self.outputs {
                bus.unwatch_listeners(output, &watch);
            }
        }
        for (definition, id) in subscriptions {
            bus.unsubscribe(&definition, id);
        }
    }

    pub(crate) fn output_changed(
        &self,
        bus: &EventBus,
        listener: Arc<dyn EventListener>,
        output: &EventDef,
        has_listeners: bool,
    ) {
        let mut state = self.state.lock();
        let was_active = !state.active.is_empty();
        if has_listeners {
            state.active.insert(output.name().to_string());
        } else {
            state.active.remove(output.name());
        }
        let active = !state.active.is_empty();

        if active && !was_active {
            debug!(analyzer = %self.analyzer, "output in use, subscribing upstream");
            for input in &self.inputs {
                let id = bus.subscribe(input, listener.clone());
                state.subscriptions.push((input.clone(), id));
            }
        } else if !active && was_active {
            debug!(analyzer = %self.analyzer, "output unused, unsubscribing upstream");
            for (definition, id) in state.subscriptions.drain(..) {
                bus.unsubscribe(&definition, id);
            }
        }
    }

    pub(crate) fn is_subscribed(&self) -> bool {
        !self.state.lock().subscriptions.is_empty()
    }
}
