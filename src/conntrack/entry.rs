//! Conntrack entries.

use std::any::Any;
use std::fmt;

use tracing::trace;

use super::attach::{AnalyzerId, Attachment, Attachments};
use super::ConntrackKey;
use crate::packet::Timestamp;
use crate::proto::Protocol;

/// Private per-flow state of the decoder owning a conntrack entry.
pub trait FlowState: Any + Send {
    /// Runs once when the owning entry closes.
    fn on_close(&mut self) {}
}

/// Flow state for decoders that keep none.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFlow;

impl FlowState for NoFlow {}

trait ErasedFlow: Send {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn close(&mut self);
}

impl<T: FlowState> ErasedFlow for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn close(&mut self) {
        self.on_close()
    }
}

/// Type-erased flow state, as produced by a decoder's initializer.
pub struct BoxedFlow(Box<dyn ErasedFlow>);

impl BoxedFlow {
    pub fn new<T: FlowState>(state: T) -> Self {
        Self(Box::new(state))
    }
}

/// State of one tracked flow.
pub struct ConntrackEntry {
    id: u64,
    protocol: Protocol,
    key: ConntrackKey,
    created: Timestamp,
    last_seen: Timestamp,
    invalid: bool,
    closed: bool,
    flow: Option<BoxedFlow>,
    attachments: Attachments,
}

impl ConntrackEntry {
    pub(crate) fn new(
        id: u64,
        protocol: Protocol,
        key: ConntrackKey,
        timestamp: Timestamp,
        flow: Option<BoxedFlow>,
    ) -> Self {
        Self {
            id,
            protocol,
            key,
            created: timestamp,
            last_seen: timestamp,
            invalid: false,
            closed: false,
            flow,
            attachments: Attachments::default(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn key(&self) -> &ConntrackKey {
        &self.key
    }

    pub fn created(&self) -> Timestamp {
        self.created
    }

    pub fn last_seen(&self) -> Timestamp {
        self.last_seen
    }

    /// Record activity; never moves `last_seen` backwards.
    pub(crate) fn touch(&mut self, timestamp: Timestamp) {
        if timestamp > self.last_seen {
            self.last_seen = timestamp;
        }
    }

    /// Whether the owning decoder judged this flow corrupt.
    pub fn is_invalid(&self) -> bool {
        self.invalid
    }

    /// Flag the flow as corrupt; later packets on its key are ignored.
    pub fn mark_invalid(&mut self) {
        if !self.invalid {
            trace!(protocol = %self.protocol, key = %self.key, "conntrack marked invalid");
            self.invalid = true;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Decoder-private state, if it has type `T`.
    pub fn flow<T: FlowState>(&self) -> Option<&T> {
        self.flow.as_ref()?.0.as_any().downcast_ref::<T>()
    }

    pub fn flow_mut<T: FlowState>(&mut self) -> Option<&mut T> {
        self.flow.as_mut()?.0.as_any_mut().downcast_mut::<T>()
    }

    pub(crate) fn flow_any_mut(&mut self) -> Option<&mut dyn Any> {
        self.flow.as_mut().map(|flow| flow.0.as_any_mut())
    }

    /// Bind analyzer state to this flow, replacing (and cleaning up) any
    /// earlier attachment by the same analyzer.
    pub fn attach<T: Attachment>(&mut self, analyzer: AnalyzerId, state: T) -> bool {
        self.attachments.attach(analyzer, state)
    }

    pub fn attachment<T: Attachment>(&self, analyzer: AnalyzerId) -> Option<&T> {
        self.attachments.get(analyzer)
    }

    pub fn attachment_mut<T: Attachment>(&mut self, analyzer: AnalyzerId) -> Option<&mut T> {
        self.attachments.get_mut(analyzer)
    }

    pub fn has_attachment(&self, analyzer: AnalyzerId) -> bool {
        self.attachments.contains(analyzer)
    }

    /// Remove the analyzer's attachment, running its cleanup.
    pub fn detach(&mut self, analyzer: AnalyzerId) -> bool {
        self.attachments.detach(analyzer)
    }

    /// Remove the analyzer's attachment and return it without cleanup.
    pub fn take_attachment<T: Attachment>(&mut self, analyzer: AnalyzerId) -> Option<T> {
        self.attachments.take(analyzer)
    }

    pub fn attachment_count(&self) -> usize {
        self.attachments.len()
    }

    /// Close the flow: analyzer attachments are cleaned up first, then the
    /// decoder state. Later calls do nothing.
    pub(crate) fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.invalid = true;
        self.attachments.cleanup_all();
        if let Some(mut flow) = self.flow.take() {
            flow.0.close();
        }
        trace!(protocol = %self.protocol, key = %self.key, id = self.id, "conntrack closed");
    }
}

impl Drop for ConntrackEntry {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for ConntrackEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConntrackEntry")
            .field("id", &self.id)
            .field("protocol", &self.protocol)
            .field("key", &self.key)
            .field("created", &self.created)
            .field("last_seen", &self.last_seen)
            .field("invalid", &self.invalid)
            .field("closed", &self.closed)
            .field("attachments", &self.attachments.len())
            .finish()
    }
}
