use crate::accumulator::Accumulator;
use crate::comparator::{Comparator, KeyOrder};
use crate::memory::{BlockId, MemoryChainingRule, MemoryContext};
use crate::EngineError;
use smallvec::SmallVec;
use std::sync::Arc;

/// `[next: u64][key_len: u32][value_len: u32]`, little-endian, followed by key and value bytes.
pub const RECORD_HEADER_LEN: usize = 16;
const INITIAL_SLOTS: usize = 16;
const MAX_LOAD: f64 = 0.75;

pub fn record_len(key_len: usize, value_len: usize) -> usize {
    RECORD_HEADER_LEN + key_len + value_len
}

/// Location of a record inside the block pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordAddr {
    block: BlockId,
    offset: u32,
}

impl RecordAddr {
    // Stored +1 so that zero marks an empty slot / end of chain.
    fn pack(self) -> u64 {
        (((self.block.index() as u64) << 32) | self.offset as u64) + 1
    }

    fn unpack(raw: u64) -> Option<Self> {
        if raw == 0 {
            return None;
        }
        let raw = raw - 1;
        Some(Self {
            block: BlockId::from_index((raw >> 32) as usize),
            offset: raw as u32,
        })
    }
}

/// A record borrowed from its memory block.
pub struct RecordView<'m> {
    pub key: &'m [u8],
    pub value: &'m [u8],
    next: Option<RecordAddr>,
}

impl<'m> RecordView<'m> {
    pub fn read(memory: &'m MemoryContext, addr: RecordAddr) -> Self {
        let block = memory.block(addr.block);
        let offset = addr.offset as usize;
        let header = block.bytes(offset, RECORD_HEADER_LEN);
        let next = u64::from_le_bytes(header[0..8].try_into().unwrap_or_default());
        let key_len = u32::from_le_bytes(header[8..12].try_into().unwrap_or_default()) as usize;
        let value_len = u32::from_le_bytes(header[12..16].try_into().unwrap_or_default()) as usize;
        let body = offset + RECORD_HEADER_LEN;
        Self {
            key: block.bytes(body, key_len),
            value: block.bytes(body + key_len, value_len),
            next: RecordAddr::unpack(next),
        }
    }

    pub fn next(&self) -> Option<RecordAddr> {
        self.next
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Accumulated,
    /// No block could be obtained under the chaining rule; the storage is unchanged.
    NoMemory,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetractOutcome {
    Deducted,
    Absent,
    NoMemory,
}

/// Open-addressing hash table whose records live in pooled memory blocks.
///
/// With an accumulator every key owns exactly one record holding its state.
/// Without one every pair is retained and records of equal keys are chained,
/// newest first.
pub struct BinaryStorage {
    comparator: Arc<dyn Comparator>,
    accumulator: Option<Arc<dyn Accumulator>>,
    rule: MemoryChainingRule,
    blocks: SmallVec<[BlockId; 4]>,
    slots: Vec<u64>,
    hashes: Vec<u64>,
    keys: usize,
    records: usize,
    scratch: Vec<u8>,
}

impl BinaryStorage {
    pub fn new(
        comparator: Arc<dyn Comparator>,
        accumulator: Option<Arc<dyn Accumulator>>,
        rule: MemoryChainingRule,
    ) -> Self {
        Self {
            comparator,
            accumulator,
            rule,
            blocks: SmallVec::new(),
            slots: vec![0; INITIAL_SLOTS],
            hashes: vec![0; INITIAL_SLOTS],
            keys: 0,
            records: 0,
            scratch: Vec::new(),
        }
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.keys
    }

    pub fn records(&self) -> usize {
        self.records
    }

    pub fn is_empty(&self) -> bool {
        self.keys == 0
    }

    pub fn blocks_held(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_accumulating(&self) -> bool {
        self.accumulator.is_some()
    }

    pub fn insert_or_accumulate(
        &mut self,
        memory: &mut MemoryContext,
        key: &[u8],
        value: &[u8],
    ) -> Result<InsertOutcome, EngineError> {
        if self.needs_growth() {
            self.grow_slots();
        }
        let hash = self.comparator.hash(key);
        let (slot, found) = self.find(memory, hash, key);

        match (found, self.accumulator.clone()) {
            (None, accumulator) => {
                self.scratch.clear();
                match &accumulator {
                    Some(acc) => acc.init(value, &mut self.scratch),
                    None => self.scratch.extend_from_slice(value),
                }
                let state = std::mem::take(&mut self.scratch);
                let written = self.write_record(memory, None, key, &state);
                self.scratch = state;
                let Some(addr) = written? else {
                    return Ok(InsertOutcome::NoMemory);
                };
                self.slots[slot] = addr.pack();
                self.hashes[slot] = hash;
                self.keys += 1;
                self.records += 1;
                Ok(InsertOutcome::Inserted)
            }
            (Some(addr), Some(acc)) => {
                self.scratch.clear();
                acc.accumulate(RecordView::read(memory, addr).value, value, &mut self.scratch);
                let stored = self.store_state(memory, slot, addr, key)?;
                Ok(if stored {
                    InsertOutcome::Accumulated
                } else {
                    InsertOutcome::NoMemory
                })
            }
            (Some(head), None) => {
                let Some(addr) = self.write_record(memory, Some(head), key, value)? else {
                    return Ok(InsertOutcome::NoMemory);
                };
                self.slots[slot] = addr.pack();
                self.records += 1;
                Ok(InsertOutcome::Inserted)
            }
        }
    }

    /// Deducts `value` from the resident state of `key`.
    pub fn retract(
        &mut self,
        memory: &mut MemoryContext,
        key: &[u8],
        value: &[u8],
    ) -> Result<RetractOutcome, EngineError> {
        let Some(acc) = self.accumulator.clone().filter(|a| a.supports_deduct()) else {
            return Err(EngineError::Unsupported(
                "retraction needs an accumulator with deduct support".to_string(),
            ));
        };
        let hash = self.comparator.hash(key);
        let (slot, found) = self.find(memory, hash, key);
        let Some(addr) = found else {
            return Ok(RetractOutcome::Absent);
        };
        self.scratch.clear();
        if !acc.deduct(RecordView::read(memory, addr).value, value, &mut self.scratch) {
            return Err(EngineError::Unsupported("accumulator refused to deduct".to_string()));
        }
        if self.store_state(memory, slot, addr, key)? {
            Ok(RetractOutcome::Deducted)
        } else {
            Ok(RetractOutcome::NoMemory)
        }
    }

    /// Value of `key`; the newest one in retain mode.
    pub fn lookup<'m>(&self, memory: &'m MemoryContext, key: &[u8]) -> Option<&'m [u8]> {
        let (_, found) = self.find(memory, self.comparator.hash(key), key);
        found.map(|addr| RecordView::read(memory, addr).value)
    }

    /// Every value stored under `key`, newest first.
    pub fn values<'m>(&self, memory: &'m MemoryContext, key: &[u8]) -> ChainIter<'m> {
        let (_, found) = self.find(memory, self.comparator.hash(key), key);
        ChainIter { memory, next: found }
    }

    /// Head record of a slot; slots are walked by index so owners can resume across calls.
    pub fn slot_head(&self, slot: usize) -> Option<RecordAddr> {
        self.slots.get(slot).copied().and_then(RecordAddr::unpack)
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// All records in hash-table order.
    pub fn iter<'a>(
        &'a self,
        memory: &'a MemoryContext,
    ) -> impl Iterator<Item = RecordView<'a>> + 'a {
        self.slots
            .iter()
            .filter_map(|raw| RecordAddr::unpack(*raw))
            .flat_map(move |head| ChainIter { memory, next: Some(head) })
            .map(move |(addr, _)| RecordView::read(memory, addr))
    }

    /// Addresses of all records sorted by key under `order`. Equal keys keep chain order.
    pub fn sorted_addresses(&self, memory: &MemoryContext, order: &KeyOrder) -> Vec<RecordAddr> {
        let mut addrs: Vec<RecordAddr> = Vec::with_capacity(self.records);
        for head in self.slots.iter().filter_map(|raw| RecordAddr::unpack(*raw)) {
            addrs.extend(ChainIter { memory, next: Some(head) }.map(|(addr, _)| addr));
        }
        addrs.sort_by(|a, b| {
            order.compare(RecordView::read(memory, *a).key, RecordView::read(memory, *b).key)
        });
        addrs
    }

    /// Drops every record and hands the blocks back to the pool.
    pub fn clear(&mut self, memory: &mut MemoryContext) {
        for block in self.blocks.drain(..) {
            memory.release(block);
        }
        self.slots = vec![0; INITIAL_SLOTS];
        self.hashes = vec![0; INITIAL_SLOTS];
        self.keys = 0;
        self.records = 0;
    }

    /// Forgets block handles without releasing them; used after the pool was torn down.
    pub(crate) fn forget(&mut self) {
        self.blocks.clear();
        self.slots = vec![0; INITIAL_SLOTS];
        self.hashes = vec![0; INITIAL_SLOTS];
        self.keys = 0;
        self.records = 0;
    }

    fn needs_growth(&self) -> bool {
        (self.keys + 1) as f64 > self.slots.len() as f64 * MAX_LOAD
    }

    fn slot_for(hash: u64, mask: usize) -> usize {
        // Partition routing consumes the low bits; probe from the high half.
        ((hash >> 32) ^ (hash << 7)) as usize & mask
    }

    fn find(&self, memory: &MemoryContext, hash: u64, key: &[u8]) -> (usize, Option<RecordAddr>) {
        let mask = self.slots.len() - 1;
        let mut idx = Self::slot_for(hash, mask);
        loop {
            match RecordAddr::unpack(self.slots[idx]) {
                None => return (idx, None),
                Some(addr)
                    if self.hashes[idx] == hash
                        && self.comparator.equals(RecordView::read(memory, addr).key, key) =>
                {
                    return (idx, Some(addr));
                }
                Some(_) => idx = (idx + 1) & mask,
            }
        }
    }

    fn grow_slots(&mut self) {
        let new_len = self.slots.len() * 2;
        let mask = new_len - 1;
        let mut slots = vec![0u64; new_len];
        let mut hashes = vec![0u64; new_len];
        for (raw, hash) in self.slots.iter().zip(self.hashes.iter()) {
            if *raw == 0 {
                continue;
            }
            let mut idx = Self::slot_for(*hash, mask);
            while slots[idx] != 0 {
                idx = (idx + 1) & mask;
            }
            slots[idx] = *raw;
            hashes[idx] = *hash;
        }
        self.slots = slots;
        self.hashes = hashes;
    }

    /// Stores `self.scratch` as the new state of the record at `addr`.
    /// Returns false when a relocation was needed and no memory was available,
    /// or when the grown state no longer fits in a block. Spilling the key
    /// lets its next value start a fresh state.
    fn store_state(
        &mut self,
        memory: &mut MemoryContext,
        slot: usize,
        addr: RecordAddr,
        key: &[u8],
    ) -> Result<bool, EngineError> {
        let (value_offset, old_len) = {
            let view = RecordView::read(memory, addr);
            (addr.offset as usize + RECORD_HEADER_LEN + view.key.len(), view.value.len())
        };
        if self.scratch.len() == old_len {
            memory
                .block_mut(addr.block)
                .bytes_mut(value_offset, old_len)
                .copy_from_slice(&self.scratch);
            return Ok(true);
        }
        if record_len(key.len(), self.scratch.len()) > memory.block_size() {
            return Ok(false);
        }
        let state = std::mem::take(&mut self.scratch);
        let written = self.write_record(memory, None, key, &state);
        self.scratch = state;
        match written? {
            Some(new_addr) => {
                // The old record stays behind as dead space until the storage is cleared.
                self.slots[slot] = new_addr.pack();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn write_record(
        &mut self,
        memory: &mut MemoryContext,
        next: Option<RecordAddr>,
        key: &[u8],
        value: &[u8],
    ) -> Result<Option<RecordAddr>, EngineError> {
        let needed = record_len(key.len(), value.len());
        if needed > memory.block_size() {
            return Err(EngineError::PairTooLarge {
                record_len: needed,
                block_size: memory.block_size(),
            });
        }
        let next_raw = next.map(RecordAddr::pack).unwrap_or(0).to_le_bytes();
        let key_len = (key.len() as u32).to_le_bytes();
        let value_len = (value.len() as u32).to_le_bytes();
        let parts: [&[u8]; 5] = [&next_raw, &key_len, &value_len, key, value];

        if let Some(&block) = self.blocks.last() {
            if let Some(offset) = memory.block_mut(block).append(&parts) {
                return Ok(Some(RecordAddr { block, offset }));
            }
        }
        if !self.rule.allows_chain(self.blocks.len()) {
            return Ok(None);
        }
        let Some(block) = memory.allocate() else {
            return Ok(None);
        };
        self.blocks.push(block);
        Ok(memory
            .block_mut(block)
            .append(&parts)
            .map(|offset| RecordAddr { block, offset }))
    }
}

/// Walks a chain of records with equal keys.
pub struct ChainIter<'m> {
    memory: &'m MemoryContext,
    next: Option<RecordAddr>,
}

impl<'m> Iterator for ChainIter<'m> {
    type Item = (RecordAddr, &'m [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let addr = self.next?;
        let view = RecordView::read(self.memory, addr);
        self.next = view.next();
        Some((addr, view.value))
    }
}
