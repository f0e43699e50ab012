//! Analyzer attachments.

use std::any::Any;
use std::fmt;

use tracing::trace;

/// Identifies the analyzer owning an attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AnalyzerId(&'static str);

impl AnalyzerId {
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    pub fn name(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for AnalyzerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Per-flow state an analyzer binds to a conntrack entry.
///
/// The table never looks inside; it only runs `cleanup` when the entry
/// closes or the analyzer detaches.
pub trait Attachment: Any + Send {
    fn cleanup(&mut self) {}
}

trait ErasedAttachment: Send {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
    fn cleanup(&mut self);
}

impl<T: Attachment> ErasedAttachment for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }

    fn cleanup(&mut self) {
        Attachment::cleanup(self)
    }
}

/// One slot per analyzer.
#[derive(Default)]
pub(crate) struct Attachments {
    slots: Vec<(AnalyzerId, Box<dyn ErasedAttachment>)>,
}

impl Attachments {
    fn position(&self, id: AnalyzerId) -> Option<usize> {
        self.slots.iter().position(|(owner, _)| *owner == id)
    }

    /// Store `state` for `id`. A previous attachment is cleaned up and
    /// replaced; returns whether one existed.
    pub(crate) fn attach<T: Attachment>(&mut self, id: AnalyzerId, state: T) -> bool {
        match self.position(id) {
            Some(pos) => {
                let mut previous = std::mem::replace(&mut self.slots[pos].1, Box::new(state));
                previous.cleanup();
                true
            }
            None => {
                self.slots.push((id, Box::new(state)));
                false
            }
        }
    }

    pub(crate) fn get<T: Attachment>(&self, id: AnalyzerId) -> Option<&T> {
        let pos = self.position(id)?;
        self.slots[pos].1.as_any().downcast_ref::<T>()
    }

    pub(crate) fn get_mut<T: Attachment>(&mut self, id: AnalyzerId) -> Option<&mut T> {
        let pos = self.position(id)?;
        self.slots[pos].1.as_any_mut().downcast_mut::<T>()
    }

    pub(crate) fn contains(&self, id: AnalyzerId) -> bool {
        self.position(id).is_some()
    }

    /// Remove and clean up the attachment of `id`.
    pub(crate) fn detach(&mut self, id: AnalyzerId) -> bool {
        match self.position(id) {
            Some(pos) => {
                let (_, mut state) = self.slots.remove(pos);
                state.cleanup();
                true
            }
            None => false,
        }
    }

    /// Remove the attachment of `id` and hand it back without cleanup.
    pub(crate) fn take<T: Attachment>(&mut self, id: AnalyzerId) -> Option<T> {
        let pos = self.position(id)?;
        if !self.slots[pos].1.as_any().is::<T>() {
            return None;
        }
        let (_, state) = self.slots.remove(pos);
        state.into_any().downcast::<T>().ok().map(|boxed| *boxed)
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn cleanup_all(&mut self) {
        for (id, mut state) in self.slots.drain(..) {
            trace!(analyzer = %id, "cleaning up attachment");
            state.cleanup();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const FIRST: AnalyzerId = AnalyzerId::new("first");
    const SECOND: AnalyzerId = AnalyzerId::new("second");

    struct Tracked {
        value: u32,
        cleanups: Arc<AtomicUsize>,
    }

    impl Attachment for Tracked {
        fn cleanup(&mut self) {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn tracked(value: u32, cleanups: &Arc<AtomicUsize>) -> Tracked {
        Tracked {
            value,
            cleanups: cleanups.clone(),
        }
    }

    #[test]
    fn test_attach_and_get() {
        let cleanups = Arc::new(AtomicUsize::new(0));
        let mut attachments = Attachments::default();

        assert!(!attachments.attach(FIRST, tracked(1, &cleanups)));
        assert_eq!(attachments.get::<Tracked>(FIRST).map(|t| t.value), Some(1));
        assert!(attachments.get::<Tracked>(SECOND).is_none());

        attachments.get_mut::<Tracked>(FIRST).unwrap().value = 5;
        assert_eq!(attachments.get::<Tracked>(FIRST).unwrap().value, 5);
    }

    #[test]
    fn test_replace_cleans_previous() {
        let cleanups = Arc::new(AtomicUsize::new(0));
        let mut attachments = Attachments::default();

        attachments.attach(FIRST, tracked(1, &cleanups));
        assert!(attachments.attach(FIRST, tracked(2, &cleanups)));
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
        assert_eq!(attachments.len(), 1);
        assert_eq!(attachments.get::<Tracked>(FIRST).unwrap().value, 2);
    }

    #[test]
    fn test_detach_runs_cleanup_take_does_not() {
        let cleanups = Arc::new(AtomicUsize::new(0));
        let mut attachments = Attachments::default();

        attachments.attach(FIRST, tracked(1, &cleanups));
        attachments.attach(SECOND, tracked(2, &cleanups));

        assert!(attachments.detach(FIRST));
        assert!(!attachments.detach(FIRST));
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);

        let taken = attachments.take::<Tracked>(SECOND).unwrap();
        assert_eq!(taken.value, 2);
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
        assert!(!attachments.contains(SECOND));
    }

    #[test]
    fn test_wrong_type_is_not_returned() {
        struct Other;
        impl Attachment for Other {}

        let cleanups = Arc::new(AtomicUsize::new(0));
        let mut attachments = Attachments::default();
        attachments.attach(FIRST, tracked(1, &cleanups));

        assert!(attachments.get::<Other>(FIRST).is_none());
        assert!(attachments.take::<Other>(FIRST).is_none());
        assert!(attachments.contains(FIRST));
    }

    #[test]
    fn test_cleanup_all() {
        let cleanups = Arc::new(AtomicUsize::new(0));
        let mut attachments = Attachments::default();
        attachments.attach(FIRST, tracked(1, &cleanups));
        attachments.attach(SECOND, tracked(2, &cleanups));

        attachments.cleanup_all();
        assert_eq!(cleanups.load(Ordering::SeqCst), 2);
        assert_eq!(attachments.len(), 0);
    }
}
