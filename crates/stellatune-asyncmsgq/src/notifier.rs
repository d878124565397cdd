//! Readiness signal behind the queue's pollable fd.
//!
//! On unix this is a non-blocking socket pair: producers write a byte, the
//! event loop polls the read end. Other targets have no fd to hand out, so the
//! signal is a no-op there and consumers block on the queue directly.

#[cfg(unix)]
pub(crate) use unix::Notifier;

#[cfg(not(unix))]
pub(crate) use fallback::Notifier;

#[cfg(unix)]
mod unix {
    use std::io::{self, Read, Write};
    use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
    use std::os::unix::net::UnixStream;

    use tracing::warn;

    use crate::error::AsyncMsgQError;

    pub(crate) struct Notifier {
        tx: UnixStream,
        rx: UnixStream,
    }

    impl Notifier {
        pub(crate) fn new() -> Result<Self, AsyncMsgQError> {
            let (tx, rx) =
                UnixStream::pair().map_err(|source| AsyncMsgQError::Notifier { source })?;
            tx.set_nonblocking(true)
                .and_then(|()| rx.set_nonblocking(true))
                .map_err(|source| AsyncMsgQError::Notifier { source })?;
            Ok(Self { tx, rx })
        }

        pub(crate) fn notify(&self) {
            match (&self.tx).write(&[1u8]) {
                Ok(_) => {},
                // A full socket buffer is already readable.
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {},
                Err(e) => warn!("asyncq readiness notify failed: {e}"),
            }
        }

        pub(crate) fn drain(&self) {
            let mut buf = [0u8; 64];
            loop {
                match (&self.rx).read(&mut buf) {
                    Ok(0) => break,
                    Ok(_) => continue,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!("asyncq readiness drain failed: {e}");
                        break;
                    },
                }
            }
        }

        pub(crate) fn fd(&self) -> RawFd {
            self.rx.as_raw_fd()
        }

        pub(crate) fn as_fd(&self) -> BorrowedFd<'_> {
            self.rx.as_fd()
        }
    }
}

#[cfg(not(unix))]
mod fallback {
    use crate::error::AsyncMsgQError;

    pub(crate) struct Notifier;

    impl Notifier {
        pub(crate) fn new() -> Result<Self, AsyncMsgQError> {
            Ok(Self)
        }

        pub(crate) fn notify(&self) {}

        pub(crate) fn drain(&self) {}
    }
}
