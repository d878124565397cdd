//! Event loop driving an [`AsyncMsgQReader`] through its readiness fd.
//!
//! Each iteration drains the queue, arms the fd, and only blocks in `poll`
//! when arming found the queue empty. A message pushed between the last drain
//! and the wait either shows up in `before_wait` or makes the fd readable, so
//! it is never stranded until an unrelated wakeup.

use std::io;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use tracing::debug;

use crate::asyncmsgq::AsyncMsgQReader;
use crate::asyncq::WaitState;
use crate::error::AsyncMsgQError;

const MSGQ_TOKEN: Token = Token(0);
const EVENT_CAPACITY: usize = 8;

/// Single-queue event loop. Owns the reader and a `mio` poller watching its
/// readiness fd.
pub struct MsgQLoop {
    poll: Poll,
    events: Events,
    reader: AsyncMsgQReader,
}

impl MsgQLoop {
    pub fn new(reader: AsyncMsgQReader) -> Result<Self, AsyncMsgQError> {
        let poll = Poll::new()?;
        let fd = reader.fd();
        poll.registry()
            .register(&mut SourceFd(&fd), MSGQ_TOKEN, Interest::READABLE)?;
        Ok(Self {
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
            reader,
        })
    }

    /// Runs one drain/arm/wait/drain cycle and returns how many messages were
    /// dispatched. `timeout` bounds the wait; `None` waits indefinitely.
    ///
    /// Fails with [`AsyncMsgQError::Closed`] once the queue is closed and
    /// fully drained.
    pub fn iterate(&mut self, timeout: Option<Duration>) -> Result<usize, AsyncMsgQError> {
        let mut dispatched = self.reader.dispatch_pending();
        while self.reader.before_wait()? == WaitState::DataAvailable {
            dispatched += self.reader.dispatch_pending();
        }

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {},
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
            Err(e) => {
                self.reader.after_wait();
                return Err(e.into());
            },
        }

        // Timeouts drain too: a push racing the timeout only leaves a byte.
        self.reader.after_wait();
        dispatched += self.reader.dispatch_pending();
        Ok(dispatched)
    }

    /// Iterates until every producer is gone or the queue was closed.
    pub fn run(&mut self) -> Result<(), AsyncMsgQError> {
        loop {
            match self.iterate(None) {
                Ok(_) => {},
                Err(AsyncMsgQError::Closed) => {
                    debug!("asyncmsgq loop finished: queue closed");
                    return Ok(());
                },
                Err(e) => return Err(e),
            }
        }
    }

    pub fn reader(&self) -> &AsyncMsgQReader {
        &self.reader
    }

    pub fn reader_mut(&mut self) -> &mut AsyncMsgQReader {
        &mut self.reader
    }

    pub fn into_reader(self) -> AsyncMsgQReader {
        let Self { poll, reader, .. } = self;
        let fd = reader.fd();
        if let Err(e) = poll.registry().deregister(&mut SourceFd(&fd)) {
            debug!("asyncmsgq loop deregister failed: {e}");
        }
        reader
    }
}

impl std::fmt::Debug for MsgQLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MsgQLoop")
            .field("reader", &self.reader)
            .finish()
    }
}
