use crate::accumulator::Accumulator;
use crate::comparator::{Comparator, KeyOrder};
use crate::memory::{MemoryChainingRule, MemoryContext};
use crate::merge::{compact_chunks, MergeCursor};
use crate::spill::{Chunk, SpillContext};
use crate::storage::{BinaryStorage, InsertOutcome, RecordView, RetractOutcome};
use crate::EngineError;
use std::sync::Arc;
use tracing::{debug, warn};

/// One independently buffered input of a partition: resident records plus
/// the chunks spilled so far.
///
/// Aggregators use a value lane and a retraction lane, the joiner a build
/// lane and a probe lane. Lanes of one partition always spill together.
pub struct Lane {
    storage: BinaryStorage,
    chunks: Vec<Chunk>,
}

impl Lane {
    pub fn storage(&self) -> &BinaryStorage {
        &self.storage
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }
}

struct Partition {
    lanes: Vec<Lane>,
    spills: usize,
}

impl Partition {
    fn blocks_held(&self) -> usize {
        self.lanes.iter().map(|l| l.storage.blocks_held()).sum()
    }

    fn has_spilled(&self) -> bool {
        self.lanes.iter().any(|l| !l.chunks.is_empty())
    }
}

/// Hash-routed partitions sharing one block pool and one spill directory.
///
/// Owns the memory context and the spill context of its operation; dropping
/// the table frees every block and deletes every chunk.
pub struct PartitionTable {
    memory: MemoryContext,
    spill: Option<SpillContext>,
    partitions: Vec<Partition>,
    comparator: Arc<dyn Comparator>,
    order: KeyOrder,
    accumulators: Vec<Option<Arc<dyn Accumulator>>>,
    fan_in: usize,
    spills: usize,
}

impl PartitionTable {
    /// `lanes` holds the accumulator of each lane; `None` keeps every pair of that lane.
    pub fn new(
        memory: MemoryContext,
        spill: Option<SpillContext>,
        partition_count: usize,
        order: KeyOrder,
        lanes: Vec<Option<Arc<dyn Accumulator>>>,
        rule: MemoryChainingRule,
        fan_in: usize,
    ) -> Self {
        let comparator = order.comparator().clone();
        let partitions = (0..partition_count)
            .map(|_| Partition {
                lanes: lanes
                    .iter()
                    .map(|acc| Lane {
                        storage: BinaryStorage::new(comparator.clone(), acc.clone(), rule),
                        chunks: Vec::new(),
                    })
                    .collect(),
                spills: 0,
            })
            .collect();
        Self {
            memory,
            spill,
            partitions,
            comparator,
            order,
            accumulators: lanes,
            fan_in,
            spills: 0,
        }
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn partition_of(&self, key: &[u8]) -> usize {
        (self.comparator.hash(key) % self.partitions.len() as u64) as usize
    }

    pub fn memory(&self) -> &MemoryContext {
        &self.memory
    }

    pub fn order(&self) -> &KeyOrder {
        &self.order
    }

    pub fn accumulator(&self, lane: usize) -> Option<&Arc<dyn Accumulator>> {
        self.accumulators[lane].as_ref()
    }

    pub fn lane(&self, partition: usize, lane: usize) -> &Lane {
        &self.partitions[partition].lanes[lane]
    }

    pub fn spills(&self) -> usize {
        self.spills
    }

    pub fn partition_spills(&self, partition: usize) -> usize {
        self.partitions[partition].spills
    }

    pub fn has_spilled(&self, partition: usize) -> bool {
        self.partitions[partition].has_spilled()
    }

    pub fn chunks_written(&self) -> usize {
        self.spill.as_ref().map_or(0, |s| s.chunks_written())
    }

    pub fn bytes_spilled(&self) -> u64 {
        self.spill.as_ref().map_or(0, |s| s.bytes_written())
    }

    /// Inserts into `lane` of the key's partition, spilling until the pair fits.
    pub fn insert(&mut self, lane: usize, key: &[u8], value: &[u8]) -> Result<(), EngineError> {
        let partition = self.partition_of(key);
        self.insert_into(partition, lane, key, value)
    }

    /// Deducts from the resident state of `key` in `lane`, or records the
    /// retraction in `retraction_lane` when the key is not resident.
    pub fn retract(
        &mut self,
        lane: usize,
        retraction_lane: usize,
        key: &[u8],
        value: &[u8],
    ) -> Result<(), EngineError> {
        let partition = self.partition_of(key);
        loop {
            let storage = &mut self.partitions[partition].lanes[lane].storage;
            match storage.retract(&mut self.memory, key, value)? {
                RetractOutcome::Deducted => return Ok(()),
                RetractOutcome::Absent => {
                    return self.insert_into(partition, retraction_lane, key, value);
                }
                RetractOutcome::NoMemory => self.relieve(partition)?,
            }
        }
    }

    fn insert_into(
        &mut self,
        partition: usize,
        lane: usize,
        key: &[u8],
        value: &[u8],
    ) -> Result<(), EngineError> {
        loop {
            let storage = &mut self.partitions[partition].lanes[lane].storage;
            match storage.insert_or_accumulate(&mut self.memory, key, value)? {
                InsertOutcome::Inserted | InsertOutcome::Accumulated => return Ok(()),
                InsertOutcome::NoMemory => self.relieve(partition)?,
            }
        }
    }

    /// Frees memory for `target`: spills it when it holds blocks, otherwise the largest partition.
    fn relieve(&mut self, target: usize) -> Result<(), EngineError> {
        if self.spill.is_none() {
            return Err(EngineError::MemoryExhausted { partition: target });
        }
        let victim = if self.partitions[target].blocks_held() > 0 {
            target
        } else {
            match self
                .partitions
                .iter()
                .enumerate()
                .filter(|(_, p)| p.blocks_held() > 0)
                .max_by_key(|(_, p)| p.blocks_held())
            {
                Some((idx, _)) => idx,
                None => return Err(EngineError::MemoryExhausted { partition: target }),
            }
        };
        if victim != target {
            warn!(
                target,
                victim,
                blocks = self.partitions[victim].blocks_held(),
                "partition holds no memory, spilling the largest partition instead"
            );
        }
        self.spill_partition(victim)
    }

    /// Writes every lane of `partition` to sorted chunks and returns its blocks to the pool.
    pub fn spill_partition(&mut self, partition: usize) -> Result<(), EngineError> {
        let Some(spill) = self.spill.as_mut() else {
            return Err(EngineError::MemoryExhausted { partition });
        };
        let memory = &mut self.memory;
        let part = &mut self.partitions[partition];
        for (lane, accumulator) in part.lanes.iter_mut().zip(self.accumulators.iter()) {
            if lane.storage.records() == 0 {
                lane.storage.clear(memory);
                continue;
            }
            let addrs = lane.storage.sorted_addresses(memory, &self.order);
            let view_of = &*memory;
            let chunks = spill.write_sorted(
                partition,
                addrs.iter().map(|addr| {
                    let view = RecordView::read(view_of, *addr);
                    Ok((view.key, view.value))
                }),
            )?;
            lane.chunks.extend(chunks);
            lane.storage.clear(memory);

            if lane.chunks.len() > self.fan_in {
                let chunks = std::mem::take(&mut lane.chunks);
                lane.chunks = compact_chunks(
                    chunks,
                    partition,
                    self.fan_in,
                    &self.order,
                    accumulator.clone(),
                    spill,
                    memory,
                )?;
            }
        }
        part.spills += 1;
        self.spills += 1;
        debug!(
            partition,
            spills = part.spills,
            blocks_in_use = self.memory.blocks_in_use(),
            "spilled partition"
        );
        Ok(())
    }

    /// Streaming merge of one lane: its chunks (oldest first) and its resident records.
    pub fn merge_cursor(&self, partition: usize, lane: usize) -> Result<MergeCursor, EngineError> {
        let l = &self.partitions[partition].lanes[lane];
        let resident = l.storage.sorted_addresses(&self.memory, &self.order);
        let (buffer_size, endian) = match &self.spill {
            Some(spill) => (spill.buffer_size(), spill.endian()),
            None => (0, Default::default()),
        };
        MergeCursor::new(
            &l.chunks,
            resident,
            &self.memory,
            self.order.clone(),
            self.accumulators[lane].clone(),
            buffer_size,
            endian,
        )
    }

    /// Drops the resident records and chunk files of a partition that has been emitted.
    pub fn release(&mut self, partition: usize) -> Result<(), EngineError> {
        let memory = &mut self.memory;
        for lane in self.partitions[partition].lanes.iter_mut() {
            lane.storage.clear(memory);
            for chunk in lane.chunks.drain(..) {
                chunk.remove()?;
            }
        }
        Ok(())
    }

    /// Returns every block and deletes the spill directory. Safe to call repeatedly.
    pub fn teardown(&mut self) {
        for part in self.partitions.iter_mut() {
            for lane in part.lanes.iter_mut() {
                lane.storage.forget();
                lane.chunks.clear();
            }
        }
        self.memory.teardown();
        if let Some(spill) = self.spill.take() {
            let dir = spill.path().to_path_buf();
            if let Err(e) = spill.close() {
                warn!(dir = %dir.display(), error = %e, "failed to remove spill directory");
            }
        }
    }

    pub fn blocks_in_use(&self) -> usize {
        self.memory.blocks_in_use()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accumulator::SumAccumulator;
    use crate::comparator::{BytewiseComparator, SortOrder};
    use crate::pair::Endianness;
    use crate::storage::record_len;
    use tempfile::TempDir;

    const E: Endianness = Endianness::Big;

    fn table(
        memory: MemoryContext,
        spill: Option<SpillContext>,
        partitions: usize,
    ) -> PartitionTable {
        let order = KeyOrder::new(Arc::new(BytewiseComparator), SortOrder::Ascending);
        let sum: Arc<dyn Accumulator> = Arc::new(SumAccumulator::new(E));
        PartitionTable::new(
            memory,
            spill,
            partitions,
            order,
            vec![Some(sum.clone()), Some(sum)],
            MemoryChainingRule::Grow,
            4,
        )
    }

    #[test]
    fn test_routing_is_stable_and_in_range() {
        let table = table(MemoryContext::new(256, 2), None, 7);
        for i in 0..100u32 {
            let key = i.to_le_bytes();
            let p = table.partition_of(&key);
            assert!(p < 7);
            assert_eq!(p, table.partition_of(&key));
        }
    }

    #[test]
    fn test_pool_exhaustion_without_spill_is_fatal() {
        let mut table = table(MemoryContext::new(2 * record_len(1, 8), 1), None, 1);
        table.insert(0, b"a", &E.encode_i64(1)).unwrap();
        table.insert(0, b"b", &E.encode_i64(1)).unwrap();
        let err = table.insert(0, b"c", &E.encode_i64(1)).unwrap_err();
        assert!(matches!(err, EngineError::MemoryExhausted { partition: 0 }));
    }

    #[test]
    fn test_exhaustion_spills_and_frees_blocks() {
        let temp_dir = TempDir::new().unwrap();
        let spill = SpillContext::new(temp_dir.path(), 256, 1 << 20, E).unwrap();
        let mut table = table(MemoryContext::new(2 * record_len(1, 8), 1), Some(spill), 1);
        for key in [b"a", b"b", b"c", b"d", b"e"] {
            table.insert(0, key, &E.encode_i64(1)).unwrap();
        }
        assert_eq!(table.spills(), 2);
        assert!(table.has_spilled(0));
        assert_eq!(table.lane(0, 0).storage().len(), 1);
        assert_eq!(table.lane(0, 0).chunks().len(), 2);
        assert_eq!(table.blocks_in_use(), 1);
    }

    #[test]
    fn test_foreign_partition_is_relieved() {
        let temp_dir = TempDir::new().unwrap();
        let spill = SpillContext::new(temp_dir.path(), 256, 1 << 20, E).unwrap();
        let mut table = table(MemoryContext::new(1024, 1), Some(spill), 2);
        let keys: Vec<[u8; 4]> = (0..64u32).map(|i| i.to_le_bytes()).collect();
        let first = keys.iter().find(|k| table.partition_of(*k) == 0).unwrap();
        let second = keys.iter().find(|k| table.partition_of(*k) == 1).unwrap();

        table.insert(0, first, &E.encode_i64(1)).unwrap();
        table.insert(0, second, &E.encode_i64(1)).unwrap();
        assert!(table.has_spilled(0));
        assert!(!table.has_spilled(1));
    }

    #[test]
    fn test_merge_cursor_sees_spilled_and_resident_state() {
        let temp_dir = TempDir::new().unwrap();
        let spill = SpillContext::new(temp_dir.path(), 256, 1 << 20, E).unwrap();
        let mut table = table(MemoryContext::new(1024, 4), Some(spill), 1);
        table.insert(0, b"k", &E.encode_i64(2)).unwrap();
        table.spill_partition(0).unwrap();
        table.insert(0, b"k", &E.encode_i64(3)).unwrap();

        let mut cursor = table.merge_cursor(0, 0).unwrap();
        let pair = cursor.next_pair(table.memory()).unwrap().unwrap();
        assert_eq!(E.decode_i64(&pair.value), Some(5));
        assert!(cursor.next_pair(table.memory()).unwrap().is_none());
    }

    #[test]
    fn test_retraction_of_spilled_key_goes_to_retraction_lane() {
        let temp_dir = TempDir::new().unwrap();
        let spill = SpillContext::new(temp_dir.path(), 256, 1 << 20, E).unwrap();
        let mut table = table(MemoryContext::new(1024, 4), Some(spill), 1);
        table.insert(0, b"k", &E.encode_i64(10)).unwrap();
        table.retract(0, 1, b"k", &E.encode_i64(1)).unwrap();
        assert_eq!(table.lane(0, 1).storage().len(), 0);

        table.spill_partition(0).unwrap();
        table.retract(0, 1, b"k", &E.encode_i64(4)).unwrap();
        assert_eq!(
            table.lane(0, 1).storage().lookup(table.memory(), b"k").and_then(|v| E.decode_i64(v)),
            Some(4)
        );
    }

    #[test]
    fn test_teardown_removes_everything() {
        let temp_dir = TempDir::new().unwrap();
        let spill = SpillContext::new(temp_dir.path(), 256, 1 << 20, E).unwrap();
        let mut table = table(MemoryContext::new(1024, 4), Some(spill), 2);
        table.insert(0, b"k", &E.encode_i64(2)).unwrap();
        table.spill_partition(table.partition_of(b"k")).unwrap();
        table.insert(0, b"j", &E.encode_i64(2)).unwrap();

        table.teardown();
        table.teardown();
        assert_eq!(table.blocks_in_use(), 0);
        assert_eq!(std::fs::read_dir(temp_dir.path()).unwrap().count(), 0);
    }
}
