use crate::accumulator::Accumulator;
use crate::aggregator::{PartitionedAggregator, SortedPartitionedAggregator};
use crate::comparator::{Comparator, KeyOrder};
use crate::config::OperationConfig;
use crate::joiner::PartitionedJoiner;
use crate::memory::MemoryContext;
use crate::pair::Endianness;
use crate::partition::PartitionTable;
use crate::spill::SpillContext;
use crate::EngineError;
use std::sync::Arc;
use tracing::debug;

/// Wires memory, configuration and callbacks into ready-to-use operators.
///
/// Every constructor validates the configuration first, so a bad setting
/// never surfaces mid-run.
pub struct OperationFactory;

impl OperationFactory {
    /// Without an accumulator every value is kept and emitted grouped by key.
    pub fn aggregator(
        memory: MemoryContext,
        config: &OperationConfig,
        comparator: Arc<dyn Comparator>,
        accumulator: Option<Arc<dyn Accumulator>>,
    ) -> Result<PartitionedAggregator, EngineError> {
        let table = Self::table(memory, config, comparator, vec![accumulator.clone(); 2])?;
        Ok(PartitionedAggregator::new(table, accumulator))
    }

    pub fn sorted_aggregator(
        memory: MemoryContext,
        config: &OperationConfig,
        comparator: Arc<dyn Comparator>,
        accumulator: Option<Arc<dyn Accumulator>>,
    ) -> Result<SortedPartitionedAggregator, EngineError> {
        let table = Self::table(memory, config, comparator, vec![accumulator.clone(); 2])?;
        Ok(SortedPartitionedAggregator::new(table, accumulator))
    }

    /// `accumulator`, when given, pre-aggregates the build side; probe pairs are always kept.
    pub fn joiner(
        memory: MemoryContext,
        config: &OperationConfig,
        comparator: Arc<dyn Comparator>,
        accumulator: Option<Arc<dyn Accumulator>>,
    ) -> Result<PartitionedJoiner, EngineError> {
        let table = Self::table(memory, config, comparator, vec![accumulator, None])?;
        Ok(PartitionedJoiner::new(table))
    }

    /// Numeric callbacks must decode with the byte order the chunks are written in.
    fn check_byte_order(
        config: &OperationConfig,
        comparator: &dyn Comparator,
        lanes: &[Option<Arc<dyn Accumulator>>],
    ) -> Result<(), EngineError> {
        let expected = config.endianness();
        let mismatch = |what: &str, found: Endianness| {
            EngineError::InvalidConfig(format!(
                "{} decodes {:?}-endian numbers but use_big_endian selects {:?}",
                what, found, expected
            ))
        };
        if let Some(found) = comparator.endianness().filter(|e| *e != expected) {
            return Err(mismatch("comparator", found));
        }
        for accumulator in lanes.iter().flatten() {
            if let Some(found) = accumulator.endianness().filter(|e| *e != expected) {
                return Err(mismatch("accumulator", found));
            }
        }
        Ok(())
    }

    fn table(
        memory: MemoryContext,
        config: &OperationConfig,
        comparator: Arc<dyn Comparator>,
        lanes: Vec<Option<Arc<dyn Accumulator>>>,
    ) -> Result<PartitionTable, EngineError> {
        config.validate(&memory)?;
        Self::check_byte_order(config, comparator.as_ref(), &lanes)?;
        let spill = if config.spill_to_disk {
            Some(
                SpillContext::new(
                    &config.spilling_directory,
                    config.spilling_buffer_size,
                    config.spilling_chunk_size,
                    config.endianness(),
                )
                .map_err(|e| {
                    EngineError::InvalidConfig(format!(
                        "spilling directory {} is unusable: {}",
                        config.spilling_directory.display(),
                        e
                    ))
                })?,
            )
        } else {
            None
        };
        debug!(
            partitions = config.partition_count,
            block_size = memory.block_size(),
            max_blocks = memory.max_blocks(),
            spill_dir = ?spill.as_ref().map(|s| s.path().to_path_buf()),
            "created operation"
        );
        Ok(PartitionTable::new(
            memory,
            spill,
            config.partition_count,
            KeyOrder::new(comparator, config.sort_order),
            lanes,
            config.memory_chaining_rule,
            config.merge_fan_in,
        ))
    }
}
