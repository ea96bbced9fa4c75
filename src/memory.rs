use fixedbitset::FixedBitSet;
use serde::{Deserialize, Serialize};

/// Handle to a block owned by a [`MemoryContext`]. Only meaningful for the context that issued it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(u32);

impl BlockId {
    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub(crate) fn from_index(index: usize) -> Self {
        BlockId(index as u32)
    }
}

/// What a storage does when its current block is full.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum MemoryChainingRule {
    /// Chain new blocks while the pool has any.
    #[default]
    Grow,
    /// Chain up to `blocks_per_storage` blocks, then signal a spill.
    Bounded { blocks_per_storage: usize },
    /// Never chain past the first block.
    SpillOnFull,
}

impl MemoryChainingRule {
    /// Whether a storage currently holding `held` blocks may take another one.
    pub fn allows_chain(&self, held: usize) -> bool {
        match self {
            MemoryChainingRule::Grow => true,
            MemoryChainingRule::Bounded { blocks_per_storage } => held < *blocks_per_storage,
            MemoryChainingRule::SpillOnFull => held == 0,
        }
    }
}

/// Fixed-capacity byte buffer filled front to back.
pub struct MemoryBlock {
    data: Box<[u8]>,
    used: usize,
}

impl MemoryBlock {
    fn new(size: usize) -> Self {
        Self {
            data: vec![0u8; size].into_boxed_slice(),
            used: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.used
    }

    /// Writes `parts` contiguously and returns the start offset, or `None` if they do not fit.
    pub fn append(&mut self, parts: &[&[u8]]) -> Option<u32> {
        let total: usize = parts.iter().map(|p| p.len()).sum();
        if total > self.remaining() {
            return None;
        }
        let start = self.used;
        for part in parts {
            self.data[self.used..self.used + part.len()].copy_from_slice(part);
            self.used += part.len();
        }
        Some(start as u32)
    }

    pub fn bytes(&self, offset: usize, len: usize) -> &[u8] {
        &self.data[offset..offset + len]
    }

    pub fn bytes_mut(&mut self, offset: usize, len: usize) -> &mut [u8] {
        &mut self.data[offset..offset + len]
    }

    fn reset(&mut self) {
        self.used = 0;
    }
}

/// A bounded pool of equally sized memory blocks.
///
/// Blocks are created lazily up to `max_blocks` and recycled through
/// `release`. `teardown` drops every block and may be called at any point;
/// handles issued before it must not be used afterwards.
pub struct MemoryContext {
    block_size: usize,
    max_blocks: usize,
    blocks: Vec<MemoryBlock>,
    /// Set bit = block exists and is free.
    free: FixedBitSet,
    in_use: usize,
    peak_in_use: usize,
}

impl MemoryContext {
    pub fn new(block_size: usize, max_blocks: usize) -> Self {
        Self {
            block_size,
            max_blocks,
            blocks: Vec::new(),
            free: FixedBitSet::with_capacity(max_blocks),
            in_use: 0,
            peak_in_use: 0,
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn max_blocks(&self) -> usize {
        self.max_blocks
    }

    pub fn capacity_bytes(&self) -> usize {
        self.block_size.saturating_mul(self.max_blocks)
    }

    pub fn blocks_in_use(&self) -> usize {
        self.in_use
    }

    pub fn peak_blocks_in_use(&self) -> usize {
        self.peak_in_use
    }

    pub fn has_free_block(&self) -> bool {
        self.in_use < self.max_blocks
    }

    pub fn allocate(&mut self) -> Option<BlockId> {
        let index = match self.free.ones().next() {
            Some(index) => {
                self.free.set(index, false);
                index
            }
            None if self.blocks.len() < self.max_blocks => {
                self.blocks.push(MemoryBlock::new(self.block_size));
                self.blocks.len() - 1
            }
            None => return None,
        };
        self.in_use += 1;
        self.peak_in_use = self.peak_in_use.max(self.in_use);
        Some(BlockId::from_index(index))
    }

    pub fn release(&mut self, id: BlockId) {
        let index = id.index();
        if index >= self.blocks.len() || self.free.contains(index) {
            return;
        }
        self.blocks[index].reset();
        self.free.insert(index);
        self.in_use -= 1;
    }

    pub fn block(&self, id: BlockId) -> &MemoryBlock {
        &self.blocks[id.index()]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut MemoryBlock {
        &mut self.blocks[id.index()]
    }

    pub fn teardown(&mut self) {
        self.blocks = Vec::new();
        self.free.clear();
        self.in_use = 0;
    }
}
