//! Fixed-capacity single-consumer queue with a pollable readiness fd.
//!
//! Items travel through a lock-free SPSC ring. Blocking on either side waits
//! on a single-slot wake channel: producers send a token after every push,
//! the consumer after every pop. Stale tokens only cost an extra loop turn.
//!
//! The closed check and the ring push form one critical section under a
//! short gate lock that [`AsyncQCloser::close`] also takes, so once a queue
//! reports closed no item can land in the ring behind the consumer's back.
//! The gate is never held across a blocking wait.
//!
//! On unix the readiness fd is one end of a non-blocking socket pair. A byte
//! is only written while the consumer is armed (between
//! [`AsyncQConsumer::before_wait`] and [`AsyncQConsumer::after_wait`]).
//! `pending` is raised before the push and `armed` is swapped after it, both
//! `SeqCst`: either the producer sees the consumer armed and writes a byte, or
//! the consumer sees the pending item and skips the wait.

#[cfg(unix)]
use std::os::fd::{AsFd, BorrowedFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicIsize, Ordering};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use ringbuf::traits::{Consumer as _, Observer as _, Producer as _, Split as _};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use tracing::debug;

use crate::config::effective_capacity;
use crate::error::AsyncMsgQError;
use crate::notifier::Notifier;

/// Outcome of arming the readiness fd before a multiplexed wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitState {
    /// Items are already queued; drain instead of waiting.
    DataAvailable,
    /// Nothing queued; the fd becomes readable on the next push.
    Armed,
}

/// A rejected push. Both variants hand the item back to the caller.
#[derive(Debug)]
pub enum PushError<T> {
    /// Every slot is occupied and the caller asked not to block.
    Full(T),
    /// The queue was closed, by either side.
    Closed(T),
}

impl<T> PushError<T> {
    pub fn into_inner(self) -> T {
        match self {
            Self::Full(item) | Self::Closed(item) => item,
        }
    }
}

struct Shared {
    gate: Mutex<()>,
    pending: AtomicIsize,
    armed: AtomicBool,
    closed: AtomicBool,
    data_tx: Sender<()>,
    space_tx: Sender<()>,
    notifier: Notifier,
}

impl Shared {
    fn close(&self) {
        {
            let _gate = self.gate.lock();
            if self.closed.swap(true, Ordering::SeqCst) {
                return;
            }
        }
        let _ = self.data_tx.try_send(());
        let _ = self.space_tx.try_send(());
        self.notify_if_armed();
    }

    fn notify_if_armed(&self) {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.notifier.notify();
        }
    }
}

/// Producer half. Owned by a single pushing thread at a time.
pub struct AsyncQProducer<T> {
    ring: HeapProd<T>,
    space_rx: Receiver<()>,
    shared: Arc<Shared>,
}

/// Consumer half. Dropping it closes the queue and drops every queued item.
pub struct AsyncQConsumer<T> {
    ring: HeapCons<T>,
    data_rx: Receiver<()>,
    shared: Arc<Shared>,
}

/// Closes a queue without access to its producer half.
#[derive(Clone)]
pub struct AsyncQCloser {
    shared: Arc<Shared>,
}

/// Creates a queue with `capacity` slots (0 selects the default).
pub fn async_queue<T>(
    capacity: usize,
) -> Result<(AsyncQProducer<T>, AsyncQConsumer<T>), AsyncMsgQError> {
    let notifier = Notifier::new()?;
    let (ring_prod, ring_cons) = HeapRb::<T>::new(effective_capacity(capacity)).split();
    let (data_tx, data_rx) = crossbeam_channel::bounded::<()>(1);
    let (space_tx, space_rx) = crossbeam_channel::bounded::<()>(1);
    let shared = Arc::new(Shared {
        gate: Mutex::new(()),
        pending: AtomicIsize::new(0),
        armed: AtomicBool::new(false),
        closed: AtomicBool::new(false),
        data_tx,
        space_tx,
        notifier,
    });

    Ok((
        AsyncQProducer {
            ring: ring_prod,
            space_rx,
            shared: Arc::clone(&shared),
        },
        AsyncQConsumer {
            ring: ring_cons,
            data_rx,
            shared,
        },
    ))
}

impl<T> AsyncQProducer<T> {
    /// Enqueues `item`. With `may_block` a full queue waits for the consumer
    /// to free a slot; otherwise the item comes back as [`PushError::Full`].
    pub fn push(&mut self, item: T, may_block: bool) -> Result<(), PushError<T>> {
        let mut item = item;
        loop {
            match self.push_if_open(item) {
                Ok(()) => {
                    let _ = self.shared.data_tx.try_send(());
                    self.shared.notify_if_armed();
                    return Ok(());
                },
                Err(PushError::Full(back)) if may_block => {
                    item = back;
                    if self.space_rx.recv().is_err() {
                        return Err(PushError::Closed(item));
                    }
                },
                Err(err) => return Err(err),
            }
        }
    }

    fn push_if_open(&mut self, item: T) -> Result<(), PushError<T>> {
        let _gate = self.shared.gate.lock();
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(PushError::Closed(item));
        }
        self.shared.pending.fetch_add(1, Ordering::SeqCst);
        self.ring.try_push(item).map_err(|back| {
            self.shared.pending.fetch_sub(1, Ordering::SeqCst);
            PushError::Full(back)
        })
    }

    /// Number of slots in the ring.
    pub fn capacity(&self) -> usize {
        self.ring.capacity().get()
    }

    /// A handle that can close the queue from any thread.
    pub fn closer(&self) -> AsyncQCloser {
        AsyncQCloser {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Drop for AsyncQProducer<T> {
    fn drop(&mut self) {
        self.shared.close();
    }
}

impl AsyncQCloser {
    pub fn close(&self) {
        self.shared.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

impl<T> AsyncQConsumer<T> {
    /// Dequeues the oldest item. With `wait` an empty queue blocks until an
    /// item arrives; `None` means empty (not waiting) or closed and drained.
    pub fn pop(&mut self, wait: bool) -> Option<T> {
        loop {
            // Read before the pop: every push accepted before close is in the ring.
            let closed = self.shared.closed.load(Ordering::SeqCst);
            if let Some(item) = self.ring.try_pop() {
                self.shared.pending.fetch_sub(1, Ordering::SeqCst);
                let _ = self.shared.space_tx.try_send(());
                return Some(item);
            }
            if !wait || closed {
                return None;
            }
            if self.data_rx.recv().is_err() {
                return None;
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Raw readiness fd for registration with an external poller.
    #[cfg(unix)]
    pub fn fd(&self) -> RawFd {
        self.shared.notifier.fd()
    }

    /// Arms the readiness fd. Fails with [`AsyncMsgQError::Closed`] once the
    /// queue is closed and empty, since nothing can arrive anymore.
    pub fn before_wait(&self) -> Result<WaitState, AsyncMsgQError> {
        self.shared.armed.store(true, Ordering::SeqCst);
        let closed = self.shared.closed.load(Ordering::SeqCst);
        if self.shared.pending.load(Ordering::SeqCst) > 0 || !self.ring.is_empty() {
            self.shared.armed.store(false, Ordering::SeqCst);
            return Ok(WaitState::DataAvailable);
        }
        if closed {
            self.shared.armed.store(false, Ordering::SeqCst);
            return Err(AsyncMsgQError::Closed);
        }
        Ok(WaitState::Armed)
    }

    /// Disarms and drains the readiness fd after the wait returned.
    pub fn after_wait(&self) {
        self.shared.armed.store(false, Ordering::SeqCst);
        self.shared.notifier.drain();
    }
}

#[cfg(unix)]
impl<T> AsFd for AsyncQConsumer<T> {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.shared.notifier.as_fd()
    }
}

impl<T> Drop for AsyncQConsumer<T> {
    fn drop(&mut self) {
        // After close returns no push can succeed, so one drain retires all.
        self.shared.close();
        let mut retired = 0usize;
        while let Some(item) = self.ring.try_pop() {
            drop(item);
            retired += 1;
        }
        if retired > 0 {
            debug!(retired, "asyncq consumer dropped with queued items");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    use super::{PushError, WaitState, async_queue};
    use crate::config::DEFAULT_QUEUE_CAPACITY;
    use crate::error::AsyncMsgQError;

    #[cfg(unix)]
    fn fd_readable<T>(cons: &super::AsyncQConsumer<T>) -> bool {
        use mio::unix::SourceFd;
        use mio::{Events, Interest, Poll, Token};

        let mut poll = Poll::new().expect("poll");
        let fd = cons.fd();
        poll.registry()
            .register(&mut SourceFd(&fd), Token(0), Interest::READABLE)
            .expect("register");
        let mut events = Events::with_capacity(1);
        poll.poll(&mut events, Some(Duration::ZERO)).expect("poll");
        !events.is_empty()
    }

    #[test]
    fn pops_in_push_order() {
        let (mut prod, mut cons) = async_queue::<u32>(4).expect("queue");
        for i in 0..4 {
            prod.push(i, false).expect("push");
        }
        let popped: Vec<_> = std::iter::from_fn(|| cons.pop(false)).collect();
        assert_eq!(popped, vec![0, 1, 2, 3]);
    }

    #[test]
    fn zero_capacity_selects_default() {
        let (prod, _cons) = async_queue::<u8>(0).expect("queue");
        assert_eq!(prod.capacity(), DEFAULT_QUEUE_CAPACITY);
    }

    #[test]
    fn non_blocking_push_reports_full() {
        let (mut prod, _cons) = async_queue::<u8>(1).expect("queue");
        prod.push(1, false).expect("push");
        match prod.push(2, false) {
            Err(PushError::Full(2)) => {},
            other => panic!("expected full, got {other:?}"),
        }
    }

    #[test]
    fn blocking_push_waits_for_space() {
        let (mut prod, mut cons) = async_queue::<u8>(1).expect("queue");
        prod.push(1, false).expect("push");
        let join = thread::spawn(move || {
            prod.push(2, true).expect("blocking push");
            prod
        });
        thread::sleep(Duration::from_millis(30));
        assert_eq!(cons.pop(false), Some(1));
        let _prod = join.join().expect("join producer");
        assert_eq!(cons.pop(true), Some(2));
    }

    #[test]
    fn blocking_pop_wakes_on_push() {
        let (mut prod, mut cons) = async_queue::<u8>(2).expect("queue");
        let join = thread::spawn(move || cons.pop(true));
        thread::sleep(Duration::from_millis(20));
        prod.push(9, true).expect("push");
        assert_eq!(join.join().expect("join consumer"), Some(9));
    }

    #[test]
    fn close_drains_then_reports_empty() {
        let (mut prod, mut cons) = async_queue::<u8>(2).expect("queue");
        prod.push(5, false).expect("push");
        prod.closer().close();
        assert!(matches!(prod.push(6, false), Err(PushError::Closed(6))));
        assert_eq!(cons.pop(true), Some(5));
        assert_eq!(cons.pop(true), None);
    }

    #[test]
    fn dropping_producer_wakes_blocked_consumer() {
        let (prod, mut cons) = async_queue::<u8>(2).expect("queue");
        let join = thread::spawn(move || cons.pop(true));
        thread::sleep(Duration::from_millis(20));
        drop(prod);
        assert_eq!(join.join().expect("join consumer"), None);
    }

    #[test]
    fn dropping_consumer_fails_blocked_producer() {
        let (mut prod, cons) = async_queue::<u8>(1).expect("queue");
        prod.push(1, false).expect("push");
        let join = thread::spawn(move || prod.push(2, true));
        thread::sleep(Duration::from_millis(20));
        drop(cons);
        let result = join.join().expect("join producer");
        assert!(matches!(result, Err(PushError::Closed(2))));
    }

    #[test]
    fn push_racing_consumer_drop_never_strands_item() {
        for round in 0..500 {
            let (mut prod, cons) = async_queue::<Arc<()>>(4).expect("queue");
            let token = Arc::new(());
            let barrier = Arc::new(Barrier::new(2));

            let pusher = {
                let token = Arc::clone(&token);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let accepted = prod.push(token, true).is_ok();
                    (prod, accepted)
                })
            };
            barrier.wait();
            if round % 2 == 0 {
                thread::yield_now();
            }
            drop(cons);

            // The producer half (and its ring) is still alive here.
            let (_prod, _accepted) = pusher.join().expect("join pusher");
            assert_eq!(Arc::strong_count(&token), 1, "item stranded in round {round}");
        }
    }

    #[test]
    fn items_pushed_before_close_are_seen_before_closed() {
        const ITEMS: usize = 64;
        for _ in 0..50 {
            let (mut prod, mut cons) = async_queue::<usize>(8).expect("queue");
            let closer = prod.closer();
            let pusher = thread::spawn(move || {
                for i in 0..ITEMS {
                    prod.push(i, true).expect("push");
                }
                closer.close();
                prod
            });

            let mut received = Vec::with_capacity(ITEMS);
            loop {
                match cons.before_wait() {
                    Ok(WaitState::DataAvailable) => {
                        received.extend(std::iter::from_fn(|| cons.pop(false)));
                    },
                    Ok(WaitState::Armed) => {
                        cons.after_wait();
                        thread::yield_now();
                    },
                    Err(AsyncMsgQError::Closed) => break,
                    Err(e) => panic!("unexpected error: {e}"),
                }
            }
            let _prod = pusher.join().expect("join pusher");
            assert_eq!(received, (0..ITEMS).collect::<Vec<_>>());
        }
    }

    #[cfg(unix)]
    #[test]
    fn readiness_fd_follows_arm_protocol() {
        use std::os::fd::{AsFd, AsRawFd};

        let (mut prod, mut cons) = async_queue::<u8>(4).expect("queue");
        assert_eq!(cons.as_fd().as_raw_fd(), cons.fd());

        // Unarmed pushes never touch the fd.
        prod.push(1, false).expect("push");
        assert!(!fd_readable(&cons));
        assert_eq!(cons.before_wait().expect("arm"), WaitState::DataAvailable);
        assert_eq!(cons.pop(false), Some(1));

        assert_eq!(cons.before_wait().expect("arm"), WaitState::Armed);
        prod.push(2, false).expect("push");
        assert!(fd_readable(&cons));
        cons.after_wait();
        assert!(!fd_readable(&cons));
        assert_eq!(cons.pop(false), Some(2));
    }

    #[test]
    fn before_wait_reports_closed_once_drained() {
        let (mut prod, mut cons) = async_queue::<u8>(4).expect("queue");
        assert_eq!(cons.before_wait().expect("arm"), WaitState::Armed);
        prod.push(3, false).expect("push");
        drop(prod);
        cons.after_wait();
        assert_eq!(cons.before_wait().expect("arm"), WaitState::DataAvailable);
        assert_eq!(cons.pop(false), Some(3));
        assert!(matches!(cons.before_wait(), Err(AsyncMsgQError::Closed)));
    }
}
