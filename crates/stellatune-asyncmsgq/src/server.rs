//! Server core: the main-thread message target and its module registry.
//!
//! Realtime threads must not tear down modules themselves, so they post
//! [`CORE_MESSAGE_UNLOAD_MODULE`] to the core queue and the main thread
//! unloads the module when its event loop dispatches the message.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::asyncmsgq::{AsyncMsgQ, AsyncMsgQReader, new_async_msgq_with_config};
use crate::config::AsyncMsgQConfig;
use crate::error::AsyncMsgQError;
#[cfg(unix)]
use crate::mainloop::MsgQLoop;
use crate::memblock::MemChunk;
use crate::msgobject::{MsgObject, MsgObjectRef};

/// Userdata: the `u32` index returned by [`Core::load_module`].
pub const CORE_MESSAGE_UNLOAD_MODULE: i32 = 0;

/// A loadable unit owned by [`Core`].
pub trait Module: Send {
    /// Name used in log output.
    fn name(&self) -> &str;

    /// Called once, on the main thread, right before the module is dropped.
    fn unload(&mut self) {}
}

/// Main-thread message target owning the loaded modules.
///
/// Module indexes are handed out once and never reused.
pub struct Core {
    msgq: AsyncMsgQ,
    modules: Mutex<BTreeMap<u32, Box<dyn Module>>>,
    next_index: AtomicU32,
}

impl Core {
    /// Creates the core and the loop that services its queue. The loop must
    /// run on the main thread.
    #[cfg(unix)]
    pub fn new(config: &AsyncMsgQConfig) -> Result<(Arc<Self>, MsgQLoop), AsyncMsgQError> {
        let (core, reader) = Self::with_reader(config)?;
        Ok((core, MsgQLoop::new(reader)?))
    }

    /// Creates the core and hands back the raw reader of its queue, for
    /// callers that drain it without the unix event loop.
    pub fn with_reader(
        config: &AsyncMsgQConfig,
    ) -> Result<(Arc<Self>, AsyncMsgQReader), AsyncMsgQError> {
        let (msgq, reader) = new_async_msgq_with_config(config)?;
        let core = Arc::new(Self {
            msgq,
            modules: Mutex::new(BTreeMap::new()),
            next_index: AtomicU32::new(0),
        });
        Ok((core, reader))
    }

    pub fn msgq(&self) -> &AsyncMsgQ {
        &self.msgq
    }

    /// Registers `module` and returns its index, or `None` once the index
    /// space is used up.
    pub fn load_module(&self, module: Box<dyn Module>) -> Option<u32> {
        let Ok(index) = self
            .next_index
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |i| i.checked_add(1))
        else {
            warn!(name = module.name(), "module index space exhausted");
            return None;
        };
        debug!(index, name = module.name(), "module loaded");
        self.modules.lock().insert(index, module);
        Some(index)
    }

    /// Unloads the module at `index`; returns whether it existed.
    pub fn unload_module(&self, index: u32) -> bool {
        let Some(mut module) = self.modules.lock().remove(&index) else {
            return false;
        };
        debug!(index, name = module.name(), "module unloaded");
        module.unload();
        true
    }

    /// Asks the main thread to unload the module at `index`. Safe to call
    /// from any thread, including realtime ones while the queue has room.
    pub fn request_unload_module(self: &Arc<Self>, index: u32) -> Result<(), AsyncMsgQError> {
        let target: MsgObjectRef = Arc::clone(self) as MsgObjectRef;
        self.msgq.post(
            Some(&target),
            CORE_MESSAGE_UNLOAD_MODULE,
            Some(Box::new(index)),
            0,
            None,
            None,
        )
    }

    pub fn has_module(&self, index: u32) -> bool {
        self.modules.lock().contains_key(&index)
    }

    pub fn module_count(&self) -> usize {
        self.modules.lock().len()
    }

    fn unload_all(&self) {
        let modules = std::mem::take(&mut *self.modules.lock());
        for (index, mut module) in modules {
            debug!(index, name = module.name(), "module unloaded on shutdown");
            module.unload();
        }
    }
}

impl MsgObject for Core {
    fn process_msg(
        &self,
        code: i32,
        userdata: Option<&mut (dyn Any + Send)>,
        _offset: i64,
        _chunk: Option<&MemChunk>,
    ) -> i32 {
        match code {
            CORE_MESSAGE_UNLOAD_MODULE => {
                let Some(index) = userdata.and_then(|u| u.downcast_ref::<u32>()).copied() else {
                    warn!("unload module message without a module index");
                    return -1;
                };
                if self.unload_module(index) { 0 } else { -1 }
            },
            _ => -1,
        }
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        self.unload_all();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    #[cfg(unix)]
    use std::time::Duration;

    #[cfg(unix)]
    use super::CORE_MESSAGE_UNLOAD_MODULE;
    use super::{Core, Module};
    use crate::config::AsyncMsgQConfig;
    #[cfg(unix)]
    use crate::msgobject::MsgObjectRef;

    struct TestModule {
        unloads: Arc<AtomicUsize>,
    }

    impl Module for TestModule {
        fn name(&self) -> &str {
            "module-test"
        }

        fn unload(&mut self) {
            self.unloads.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn module(unloads: &Arc<AtomicUsize>) -> Box<dyn Module> {
        Box::new(TestModule {
            unloads: Arc::clone(unloads),
        })
    }

    #[cfg(unix)]
    #[test]
    fn unload_request_from_other_thread_runs_on_loop() {
        let (core, mut msgq_loop) = Core::new(&AsyncMsgQConfig::default()).expect("core");
        let unloads = Arc::new(AtomicUsize::new(0));
        let index = core.load_module(module(&unloads)).expect("index");

        let remote = Arc::clone(&core);
        std::thread::spawn(move || remote.request_unload_module(index))
            .join()
            .expect("join poster")
            .expect("post unload");

        // The module stays until the main loop dispatches.
        assert!(core.has_module(index));
        let dispatched = msgq_loop
            .iterate(Some(Duration::from_millis(200)))
            .expect("iterate");
        assert_eq!(dispatched, 1);
        assert!(!core.has_module(index));
        assert_eq!(unloads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unload_request_runs_when_reader_dispatches() {
        let (core, mut reader) = Core::with_reader(&AsyncMsgQConfig::default()).expect("core");
        let unloads = Arc::new(AtomicUsize::new(0));
        let index = core.load_module(module(&unloads)).expect("index");

        core.request_unload_module(index).expect("post unload");
        assert!(core.has_module(index));
        assert_eq!(reader.dispatch_pending(), 1);
        assert!(!core.has_module(index));
        assert_eq!(unloads.load(Ordering::SeqCst), 1);
    }

    #[cfg(unix)]
    #[test]
    fn unknown_code_and_index_fail() {
        let (core, mut msgq_loop) = Core::new(&AsyncMsgQConfig::default()).expect("core");
        let target: MsgObjectRef = Arc::clone(&core) as MsgObjectRef;
        let sender = core.msgq().clone();
        let join = std::thread::spawn(move || {
            let unknown = sender
                .send(Some(&target), 42, None, 0, None)
                .expect("send unknown code");
            let missing = sender
                .send(
                    Some(&target),
                    CORE_MESSAGE_UNLOAD_MODULE,
                    Some(Box::new(7u32)),
                    0,
                    None,
                )
                .expect("send missing index");
            (unknown.result, missing.result)
        });
        let mut handled = 0;
        while handled < 2 {
            handled += msgq_loop
                .iterate(Some(Duration::from_millis(200)))
                .expect("iterate");
        }
        assert_eq!(join.join().expect("join sender"), (-1, -1));
    }

    #[test]
    fn dropping_core_unloads_remaining_modules() {
        let (core, reader) = Core::with_reader(&AsyncMsgQConfig::default()).expect("core");
        let unloads = Arc::new(AtomicUsize::new(0));
        core.load_module(module(&unloads)).expect("first index");
        core.load_module(module(&unloads)).expect("second index");
        assert_eq!(core.module_count(), 2);
        drop(reader);
        drop(core);
        assert_eq!(unloads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn pending_unload_does_not_keep_core_alive_after_reader_teardown() {
        let (core, reader) = Core::with_reader(&AsyncMsgQConfig::default()).expect("core");
        let unloads = Arc::new(AtomicUsize::new(0));
        let index = core.load_module(module(&unloads)).expect("index");
        core.request_unload_module(index).expect("post unload");
        assert_eq!(Arc::strong_count(&core), 2);

        drop(reader);
        assert_eq!(Arc::strong_count(&core), 1);
        drop(core);
        assert_eq!(unloads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn exhausted_index_space_never_replaces_a_live_module() {
        let (core, _reader) = Core::with_reader(&AsyncMsgQConfig::default()).expect("core");
        let unloads = Arc::new(AtomicUsize::new(0));
        core.next_index.store(u32::MAX - 1, Ordering::Relaxed);

        let last = core.load_module(module(&unloads)).expect("last index");
        assert_eq!(last, u32::MAX - 1);
        assert!(core.load_module(module(&unloads)).is_none());
        assert!(core.load_module(module(&unloads)).is_none());

        assert_eq!(core.module_count(), 1);
        assert!(core.has_module(last));
        // Rejected modules are dropped without ever being loaded.
        assert_eq!(unloads.load(Ordering::SeqCst), 0);
    }
}
