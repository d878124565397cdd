//! Message targets and the dispatch trampoline.
//!
//! Anything that can interpret a coded message implements [`MsgObject`]. The
//! queue stores targets as [`MsgObjectRef`], so it holds a reference for as
//! long as a message addressed to the target is in flight.

use std::any::Any;
use std::sync::Arc;

use crate::memblock::MemChunk;

pub trait MsgObject: Send + Sync + 'static {
    /// Handles one message and returns its result code. Negative codes mean
    /// failure and are passed back to the producer unchanged.
    fn process_msg(
        &self,
        code: i32,
        userdata: Option<&mut (dyn Any + Send)>,
        offset: i64,
        chunk: Option<&MemChunk>,
    ) -> i32;

    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

pub type MsgObjectRef = Arc<dyn MsgObject>;

/// Calls `object`'s handler, or succeeds with 0 when there is no target.
pub fn dispatch(
    object: Option<&MsgObjectRef>,
    code: i32,
    userdata: Option<&mut (dyn Any + Send)>,
    offset: i64,
    chunk: Option<&MemChunk>,
) -> i32 {
    match object {
        Some(object) => object.process_msg(code, userdata, offset, chunk),
        None => 0,
    }
}
