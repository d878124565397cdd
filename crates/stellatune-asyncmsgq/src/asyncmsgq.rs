//! Async message queue between producer threads and one consumer thread.
//!
//! [`AsyncMsgQ`] is the producer handle: it is `Clone + Send + Sync`, and
//! every clone pushes through one writer mutex so the underlying SPSC ring
//! sees a single producer. [`AsyncMsgQReader`] is the consumer: it pops one
//! message at a time as the "current" message, dispatches it and retires it
//! with [`AsyncMsgQReader::done`].
//!
//! Ownership: every message takes one reference on its target and one on its
//! chunk's block when it is created, and drops both when it is retired, for
//! posted and sent messages alike. Retirement happens exactly once, on
//! `done`, on teardown of the reader, or when a post fails because the queue
//! is closed. Sent messages release their references before the sender is
//! woken, so the sender observes the same reference counts it started with.

use std::any::Any;
#[cfg(unix)]
use std::os::fd::{AsFd, BorrowedFd, RawFd};
use std::sync::Arc;

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::asyncq::{
    AsyncQCloser, AsyncQConsumer, AsyncQProducer, PushError, WaitState, async_queue,
};
use crate::config::AsyncMsgQConfig;
use crate::error::AsyncMsgQError;
use crate::memblock::MemChunk;
use crate::msgobject::{MsgObjectRef, dispatch};
use crate::pool::ItemPool;

/// Opaque message payload.
pub type Userdata = Box<dyn Any + Send>;

/// Runs when a posted message is retired, receiving its userdata.
pub type FreeCb = Box<dyn FnOnce(Option<Userdata>) + Send>;

/// Outcome of [`AsyncMsgQ::send`].
pub struct Reply {
    /// Result code passed to [`AsyncMsgQReader::done`].
    pub result: i32,
    /// The userdata handed to `send`, after the consumer had its way with it.
    pub userdata: Option<Userdata>,
}

impl std::fmt::Debug for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reply")
            .field("result", &self.result)
            .field("has_userdata", &self.userdata.is_some())
            .finish()
    }
}

#[derive(Default)]
pub(crate) struct MsgItem {
    code: i32,
    object: Option<MsgObjectRef>,
    userdata: Option<Userdata>,
    free_cb: Option<FreeCb>,
    offset: i64,
    chunk: Option<MemChunk>,
    reply_tx: Option<Sender<Reply>>,
}

impl MsgItem {
    /// Runs the free callback and drops the target and chunk references.
    fn release(&mut self) {
        let userdata = self.userdata.take();
        if let Some(free_cb) = self.free_cb.take() {
            free_cb(userdata);
        }
        self.object = None;
        self.chunk = None;
    }

    pub(crate) fn is_released(&self) -> bool {
        self.object.is_none()
            && self.userdata.is_none()
            && self.free_cb.is_none()
            && self.chunk.is_none()
            && self.reply_tx.is_none()
    }
}

impl Drop for MsgItem {
    fn drop(&mut self) {
        // An unanswered reply_tx is dropped here, failing the blocked sender.
        self.release();
    }
}

struct Writer {
    producer: Mutex<AsyncQProducer<Box<MsgItem>>>,
    closer: AsyncQCloser,
    pool: Arc<ItemPool>,
}

/// Producer handle. Clones share one queue.
#[derive(Clone)]
pub struct AsyncMsgQ {
    writer: Arc<Writer>,
}

/// Consumer handle. Exactly one exists per queue; dropping it closes the
/// queue and retires every message still queued or outstanding.
pub struct AsyncMsgQReader {
    consumer: AsyncQConsumer<Box<MsgItem>>,
    pool: Arc<ItemPool>,
    current: Option<Box<MsgItem>>,
}

/// The current message as seen by the consumer.
pub struct Message<'a> {
    pub object: Option<&'a MsgObjectRef>,
    pub code: i32,
    pub userdata: Option<&'a mut (dyn Any + Send)>,
    pub offset: i64,
    pub chunk: Option<&'a MemChunk>,
}

impl Message<'_> {
    /// Hands the message to its target, see [`dispatch`].
    pub fn dispatch(self) -> i32 {
        dispatch(
            self.object,
            self.code,
            self.userdata,
            self.offset,
            self.chunk,
        )
    }
}

impl std::fmt::Debug for Message<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("object", &self.object.map(|o| o.type_name()))
            .field("code", &self.code)
            .field("has_userdata", &self.userdata.is_some())
            .field("offset", &self.offset)
            .field("chunk_len", &self.chunk.map(MemChunk::length))
            .finish()
    }
}

/// Creates a queue with `capacity` slots (0 selects the default) and its own
/// item pool.
pub fn new_async_msgq(
    capacity: usize,
) -> Result<(AsyncMsgQ, AsyncMsgQReader), AsyncMsgQError> {
    new_async_msgq_with_config(&AsyncMsgQConfig {
        capacity,
        ..AsyncMsgQConfig::default()
    })
}

/// Creates a queue sized and pooled according to `config`.
pub fn new_async_msgq_with_config(
    config: &AsyncMsgQConfig,
) -> Result<(AsyncMsgQ, AsyncMsgQReader), AsyncMsgQError> {
    let pool = Arc::new(ItemPool::new(config.item_pool_capacity));
    new_async_msgq_with_pool(config.effective_capacity(), pool)
}

/// Creates a queue whose posted items recycle through a shared `pool`.
pub fn new_async_msgq_with_pool(
    capacity: usize,
    pool: Arc<ItemPool>,
) -> Result<(AsyncMsgQ, AsyncMsgQReader), AsyncMsgQError> {
    let (producer, consumer) = async_queue::<Box<MsgItem>>(capacity)?;
    let writer = Writer {
        closer: producer.closer(),
        producer: Mutex::new(producer),
        pool: Arc::clone(&pool),
    };
    Ok((
        AsyncMsgQ {
            writer: Arc::new(writer),
        },
        AsyncMsgQReader {
            consumer,
            pool,
            current: None,
        },
    ))
}

impl AsyncMsgQ {
    /// Enqueues a fire-and-forget message, blocking while the queue is full.
    ///
    /// `free_cb` runs with `userdata` once the consumer retires the message,
    /// or immediately if the queue is already closed.
    pub fn post(
        &self,
        object: Option<&MsgObjectRef>,
        code: i32,
        userdata: Option<Userdata>,
        offset: i64,
        chunk: Option<&MemChunk>,
        free_cb: Option<FreeCb>,
    ) -> Result<(), AsyncMsgQError> {
        let item = self.build_posted(object, code, userdata, offset, chunk, free_cb);
        self.push(item, true)
    }

    /// Like [`post`](Self::post) but fails with [`AsyncMsgQError::Full`]
    /// instead of blocking. A rejected message is retired right away.
    pub fn try_post(
        &self,
        object: Option<&MsgObjectRef>,
        code: i32,
        userdata: Option<Userdata>,
        offset: i64,
        chunk: Option<&MemChunk>,
        free_cb: Option<FreeCb>,
    ) -> Result<(), AsyncMsgQError> {
        let item = self.build_posted(object, code, userdata, offset, chunk, free_cb);
        self.push(item, false)
    }

    /// Enqueues a message and blocks until the consumer retires it.
    ///
    /// Must not be called from the thread that drains this queue.
    pub fn send(
        &self,
        object: Option<&MsgObjectRef>,
        code: i32,
        userdata: Option<Userdata>,
        offset: i64,
        chunk: Option<&MemChunk>,
    ) -> Result<Reply, AsyncMsgQError> {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        let item = Box::new(MsgItem {
            code,
            object: object.cloned(),
            userdata,
            free_cb: None,
            offset,
            chunk: chunk.cloned(),
            reply_tx: Some(reply_tx),
        });
        self.push(item, true)?;
        reply_rx.recv().map_err(|_| AsyncMsgQError::ReplyDropped)
    }

    /// Stops accepting messages. Already queued messages are still delivered.
    pub fn close(&self) {
        debug!("asyncmsgq closed by producer");
        self.writer.closer.close();
    }

    pub fn is_closed(&self) -> bool {
        self.writer.closer.is_closed()
    }

    pub fn pool(&self) -> &Arc<ItemPool> {
        &self.writer.pool
    }

    fn build_posted(
        &self,
        object: Option<&MsgObjectRef>,
        code: i32,
        userdata: Option<Userdata>,
        offset: i64,
        chunk: Option<&MemChunk>,
        free_cb: Option<FreeCb>,
    ) -> Box<MsgItem> {
        let mut item = self.writer.pool.take();
        item.code = code;
        item.object = object.cloned();
        item.userdata = userdata;
        item.free_cb = free_cb;
        item.offset = offset;
        item.chunk = chunk.cloned();
        item.reply_tx = None;
        item
    }

    fn push(&self, item: Box<MsgItem>, may_block: bool) -> Result<(), AsyncMsgQError> {
        let result = self.writer.producer.lock().push(item, may_block);
        result.map_err(|err| match err {
            PushError::Full(item) => {
                self.retire_rejected(item);
                AsyncMsgQError::Full
            },
            PushError::Closed(item) => {
                self.retire_rejected(item);
                AsyncMsgQError::Closed
            },
        })
    }

    fn retire_rejected(&self, mut item: Box<MsgItem>) {
        if item.reply_tx.take().is_some() {
            return;
        }
        item.release();
        self.writer.pool.recycle(item);
    }
}

impl std::fmt::Debug for AsyncMsgQ {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncMsgQ")
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl AsyncMsgQReader {
    /// Pops the next message and makes it current.
    ///
    /// With `wait` an empty queue blocks until a message arrives or the queue
    /// is closed. Panics if the previous message was not retired with
    /// [`done`](Self::done).
    pub fn get(&mut self, wait: bool) -> Result<Message<'_>, AsyncMsgQError> {
        assert!(
            self.current.is_none(),
            "asyncmsgq get() while a message is still outstanding"
        );
        let Some(item) = self.consumer.pop(wait) else {
            return Err(AsyncMsgQError::NotAvailable);
        };
        trace!(
            code = item.code,
            object = item.object.as_ref().map(|o| o.type_name()),
            offset = item.offset,
            chunk_len = item.chunk.as_ref().map(MemChunk::length),
            reply = item.reply_tx.is_some(),
            "asyncmsgq get"
        );

        let item = &mut **self.current.insert(item);
        Ok(Message {
            object: item.object.as_ref(),
            code: item.code,
            userdata: item.userdata.as_deref_mut(),
            offset: item.offset,
            chunk: item.chunk.as_ref(),
        })
    }

    /// Retires the current message.
    ///
    /// A sent message releases its references and wakes its sender with
    /// `result`. A posted message runs its free callback, releases its
    /// references and goes back to the pool. Panics without a current message.
    pub fn done(&mut self, result: i32) {
        let Some(mut item) = self.current.take() else {
            panic!("asyncmsgq done() without a current message");
        };

        match item.reply_tx.take() {
            Some(reply_tx) => {
                let userdata = item.userdata.take();
                drop(item);
                if reply_tx.send(Reply { result, userdata }).is_err() {
                    debug!("asyncmsgq sender vanished before reply");
                }
            },
            None => {
                item.release();
                self.pool.recycle(item);
            },
        }
    }

    pub fn has_current(&self) -> bool {
        self.current.is_some()
    }

    /// Dispatches and retires messages until one with `code` was handled.
    ///
    /// Fails with [`AsyncMsgQError::NotAvailable`] if the queue closes first.
    pub fn wait_for(&mut self, code: i32) -> Result<(), AsyncMsgQError> {
        loop {
            let message = self.get(true)?;
            let seen = message.code;
            let result = message.dispatch();
            self.done(result);
            if seen == code {
                return Ok(());
            }
        }
    }

    /// Dispatches and retires every message that is queued right now.
    pub fn dispatch_pending(&mut self) -> usize {
        let mut dispatched = 0;
        loop {
            let Ok(message) = self.get(false) else {
                return dispatched;
            };
            let result = message.dispatch();
            self.done(result);
            dispatched += 1;
        }
    }

    /// Handles readiness of the queue fd reported by an event loop.
    ///
    /// Consumes the readiness signal, then drains and re-arms until arming
    /// finds the queue empty, so a message pushed during the drain is not
    /// left behind until the next unrelated wakeup.
    pub fn on_readable(&mut self) -> Result<usize, AsyncMsgQError> {
        self.after_wait();
        let mut dispatched = 0;
        loop {
            dispatched += self.dispatch_pending();
            if self.before_wait()? == WaitState::Armed {
                return Ok(dispatched);
            }
        }
    }

    /// Readiness fd for an external poller, see [`before_wait`](Self::before_wait).
    #[cfg(unix)]
    pub fn fd(&self) -> RawFd {
        self.consumer.fd()
    }

    /// Arms the readiness fd; see [`WaitState`].
    pub fn before_wait(&self) -> Result<WaitState, AsyncMsgQError> {
        self.consumer.before_wait()
    }

    pub fn after_wait(&self) {
        self.consumer.after_wait();
    }

    pub fn is_closed(&self) -> bool {
        self.consumer.is_closed()
    }
}

#[cfg(unix)]
impl AsFd for AsyncMsgQReader {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.consumer.as_fd()
    }
}

impl Drop for AsyncMsgQReader {
    fn drop(&mut self) {
        if self.current.take().is_some() {
            debug!("asyncmsgq reader dropped with an outstanding message");
        }
        // Queued messages are retired when the consumer half drains its ring.
    }
}

impl std::fmt::Debug for AsyncMsgQReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncMsgQReader")
            .field("has_current", &self.current.is_some())
            .field("closed", &self.is_closed())
            .finish()
    }
}
