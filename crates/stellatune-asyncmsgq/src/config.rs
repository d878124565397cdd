//! Queue sizing knobs.

/// Slot count used when a queue is created with capacity 0.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Number of recycled message items kept per pool by default.
pub const DEFAULT_ITEM_POOL_CAPACITY: usize = 256;

/// Construction parameters for [`new_async_msgq_with_config`](crate::new_async_msgq_with_config).
#[derive(Debug, Clone)]
pub struct AsyncMsgQConfig {
    /// Fixed number of queue slots. 0 selects [`DEFAULT_QUEUE_CAPACITY`].
    pub capacity: usize,
    /// Upper bound of idle item storage kept for reuse. 0 disables pooling.
    pub item_pool_capacity: usize,
}

impl Default for AsyncMsgQConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_QUEUE_CAPACITY,
            item_pool_capacity: DEFAULT_ITEM_POOL_CAPACITY,
        }
    }
}

impl AsyncMsgQConfig {
    pub(crate) fn effective_capacity(&self) -> usize {
        effective_capacity(self.capacity)
    }
}

pub(crate) fn effective_capacity(capacity: usize) -> usize {
    if capacity == 0 {
        DEFAULT_QUEUE_CAPACITY
    } else {
        capacity
    }
}
