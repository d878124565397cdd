//! Cross-thread message queue between the control thread and realtime audio
//! threads.
//!
//! Any number of producer threads hand coded messages, reference-counted
//! targets and memory chunks to a single consumer through [`AsyncMsgQ`].
//! Messages are either posted (fire-and-forget, retired by the consumer) or
//! sent (the producer blocks until the consumer replies). The consumer side,
//! [`AsyncMsgQReader`], can block on the queue directly or, on unix, embed
//! its readiness fd into an event loop such as `MsgQLoop`.
#![deny(clippy::wildcard_imports)]

pub mod asyncmsgq;
pub mod asyncq;
pub mod config;
pub mod error;
#[cfg(unix)]
pub mod mainloop;
pub mod memblock;
pub mod msgobject;
mod notifier;
pub mod pool;
pub mod server;


pub use asyncmsgq::{
    AsyncMsgQ, AsyncMsgQReader, FreeCb, Message, Reply, Userdata, new_async_msgq,
    new_async_msgq_with_config, new_async_msgq_with_pool,
};
pub use asyncq::WaitState;
pub use config::AsyncMsgQConfig;
pub use error::AsyncMsgQError;
#[cfg(unix)]
pub use mainloop::MsgQLoop;
pub use memblock::{MemBlock, MemChunk};
pub use msgobject::{MsgObject, MsgObjectRef, dispatch};
pub use pool::ItemPool;
pub use server::{CORE_MESSAGE_UNLOAD_MODULE, Core, Module};
