use std::{cell::RefCell, rc::Rc};

use log::debug;

use crate::relation::RelationLocatorBackend;

use super::StorageManager;

/// Broadcast channel used to tell every process that the state it caches for
/// a relation (open files, fork sizes) is stale.
///
/// Messages are fire-and-forget. Callers must send them before changing the
/// files on disk, so that no process that processed the message can observe
/// a smaller size than the one it will find by asking the kernel again.
pub trait SmgrInvalidation {
    fn invalidate_smgr(&self, rlocator: RelationLocatorBackend);
}

/// Invalidation channel that drops every message.
#[derive(Debug, Default)]
pub struct NoInvalidation;

impl SmgrInvalidation for NoInvalidation {
    fn invalidate_smgr(&self, _rlocator: RelationLocatorBackend) {}
}

/// In-memory invalidation queue shared by many storage managers living on
/// the same OS process.
///
/// Every storage manager that wants to receive messages takes a cursor with
/// [InvalidationQueue::subscribe] and periodically calls
/// [InvalidationCursor::accept]. Messages are never trimmed from the queue.
#[derive(Debug, Clone, Default)]
pub struct InvalidationQueue {
    messages: Rc<RefCell<Vec<RelationLocatorBackend>>>,
}

impl InvalidationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a cursor that will receive every message sent from now on.
    pub fn subscribe(&self) -> InvalidationCursor {
        InvalidationCursor {
            queue: self.clone(),
            next: self.len(),
        }
    }

    /// Total number of messages ever sent.
    pub fn len(&self) -> usize {
        self.messages.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SmgrInvalidation for InvalidationQueue {
    fn invalidate_smgr(&self, rlocator: RelationLocatorBackend) {
        debug!("Sending smgr invalidation for {:?}", rlocator);
        self.messages.borrow_mut().push(rlocator);
    }
}

/// Read position of one receiver on an [InvalidationQueue].
#[derive(Debug)]
pub struct InvalidationCursor {
    queue: InvalidationQueue,
    next: usize,
}

impl InvalidationCursor {
    /// Deliver every message not seen yet to the given storage manager.
    ///
    /// Return the number of messages processed.
    pub fn accept(&mut self, smgr: &StorageManager) -> usize {
        let pending = self.queue.messages.borrow()[self.next..].to_vec();
        self.next += pending.len();
        for rlocator in &pending {
            smgr.invalidate(rlocator);
        }
        pending.len()
    }

    /// Return true if there are messages waiting to be accepted.
    pub fn has_pending(&self) -> bool {
        self.next < self.queue.len()
    }
}
