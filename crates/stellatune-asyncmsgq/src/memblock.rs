//! Reference-counted audio memory shared between threads.
//!
//! A [`MemBlock`] is immutable once created and shared through `Arc`, so
//! cloning a [`MemChunk`] acquires a reference on its block and dropping it
//! releases that reference.

use std::sync::Arc;

/// Immutable byte buffer shared between threads through `Arc`.
pub struct MemBlock {
    data: Box<[u8]>,
}

impl MemBlock {
    pub fn new(data: impl Into<Box<[u8]>>) -> Arc<Self> {
        Arc::new(Self { data: data.into() })
    }

    pub fn zeroed(len: usize) -> Arc<Self> {
        Self::new(vec![0u8; len])
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

impl std::fmt::Debug for MemBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemBlock")
            .field("len", &self.data.len())
            .finish()
    }
}

/// A byte range inside a [`MemBlock`]. The range is checked on construction
/// and cannot be changed afterwards.
#[derive(Debug, Clone)]
pub struct MemChunk {
    block: Arc<MemBlock>,
    index: usize,
    length: usize,
}

impl MemChunk {
    /// Panics if the range does not fit inside `block`.
    pub fn new(block: Arc<MemBlock>, index: usize, length: usize) -> Self {
        assert!(
            index
                .checked_add(length)
                .is_some_and(|end| end <= block.len()),
            "memchunk range {index}+{length} exceeds block of {} bytes",
            block.len()
        );
        Self {
            block,
            index,
            length,
        }
    }

    /// Chunk covering the whole block.
    pub fn whole(block: Arc<MemBlock>) -> Self {
        let length = block.len();
        Self {
            block,
            index: 0,
            length,
        }
    }

    pub fn block(&self) -> &Arc<MemBlock> {
        &self.block
    }

    /// Offset of the first byte inside the block.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Number of bytes covered.
    pub fn length(&self) -> usize {
        self.length
    }

    pub fn bytes(&self) -> &[u8] {
        &self.block.as_slice()[self.index..self.index + self.length]
    }
}
