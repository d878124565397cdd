//! Recycling cache for message item storage.
//!
//! Posting a message on the hot path should not hit the allocator every time,
//! so retired fire-and-forget items are parked here and reused by the next
//! `post`. The pool is an explicit object: each queue owns one by default and
//! several queues may share one through `Arc`.

use crossbeam_channel::{Receiver, Sender, TryRecvError};

use crate::asyncmsgq::MsgItem;

/// Bounded free list of message items, shareable between queues.
pub struct ItemPool {
    free_tx: Sender<Box<MsgItem>>,
    free_rx: Receiver<Box<MsgItem>>,
    capacity: usize,
}

impl ItemPool {
    /// A pool that keeps at most `capacity` idle items. 0 disables reuse.
    pub fn new(capacity: usize) -> Self {
        let (free_tx, free_rx) = crossbeam_channel::bounded(capacity);
        Self {
            free_tx,
            free_rx,
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of idle items currently parked.
    pub fn len(&self) -> usize {
        self.free_rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.free_rx.is_empty()
    }

    pub(crate) fn take(&self) -> Box<MsgItem> {
        match self.free_rx.try_recv() {
            Ok(item) => item,
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => Box::default(),
        }
    }

    /// Parks a retired item. The item must already be released; a full pool
    /// frees it instead.
    pub(crate) fn recycle(&self, item: Box<MsgItem>) {
        debug_assert!(item.is_released());
        let _ = self.free_tx.try_send(item);
    }
}

impl std::fmt::Debug for ItemPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItemPool")
            .field("capacity", &self.capacity)
            .field("idle", &self.len())
            .finish()
    }
}
