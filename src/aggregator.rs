use crate::accumulator::Accumulator;
use crate::merge::MergeCursor;
use crate::pair::Pair;
use crate::partition::PartitionTable;
use crate::storage::{RecordAddr, RecordView};
use crate::EngineError;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::info;

pub(crate) const VALUES: usize = 0;
pub(crate) const RETRACTIONS: usize = 1;

/// Counters describing one operation instance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OperationStats {
    pub pairs_accepted: u64,
    pub spills: usize,
    pub chunks_written: usize,
    pub bytes_spilled: u64,
    pub blocks_in_use: usize,
}

/// Push-based operator: pairs go in through `accumulate`, results come out of `finish`.
///
/// `finish` consumes the operator and returns a lazy single-pass iterator;
/// consuming or dropping it releases every block and spill file. `cancel`
/// abandons the run and releases the same resources immediately.
pub trait Aggregator {
    type Item;
    type Output: Iterator<Item = Result<Self::Item, EngineError>>;

    fn accumulate(&mut self, pair: &Pair) -> Result<(), EngineError>;

    fn finish(self) -> Result<Self::Output, EngineError>;

    fn cancel(self);

    fn stats(&self) -> OperationStats;
}

/// Partition table plus the bookkeeping shared by both aggregator variants.
struct AggregationCore {
    table: PartitionTable,
    accumulator: Option<Arc<dyn Accumulator>>,
    pairs_accepted: u64,
}

impl AggregationCore {
    fn new(table: PartitionTable, accumulator: Option<Arc<dyn Accumulator>>) -> Self {
        Self {
            table,
            accumulator,
            pairs_accepted: 0,
        }
    }

    fn accumulate(&mut self, pair: &Pair) -> Result<(), EngineError> {
        self.table.insert(VALUES, &pair.key, &pair.value)?;
        self.pairs_accepted += 1;
        Ok(())
    }

    fn retract(&mut self, pair: &Pair) -> Result<(), EngineError> {
        if !self.accumulator.as_ref().is_some_and(|acc| acc.supports_deduct()) {
            return Err(EngineError::Unsupported(
                "retraction needs an accumulator with deduct support".to_string(),
            ));
        }
        self.table.retract(VALUES, RETRACTIONS, &pair.key, &pair.value)
    }

    fn stats(&self) -> OperationStats {
        OperationStats {
            pairs_accepted: self.pairs_accepted,
            spills: self.table.spills(),
            chunks_written: self.table.chunks_written(),
            bytes_spilled: self.table.bytes_spilled(),
            blocks_in_use: self.table.blocks_in_use(),
        }
    }

    fn finish(self, sorted: bool, name: &'static str) -> AggregateOutput {
        info!(
            operation = name,
            pairs = self.pairs_accepted,
            partitions = self.table.partition_count(),
            spills = self.table.spills(),
            bytes_spilled = self.table.bytes_spilled(),
            "input complete"
        );
        AggregateOutput {
            table: self.table,
            accumulator: self.accumulator,
            sorted,
            next_partition: 0,
            stream: None,
            done: false,
        }
    }
}

/// Group-by aggregation under a bounded block pool.
///
/// Output is grouped by partition; within a partition that never spilled the
/// order is hash-table order. Without an accumulator every value is emitted,
/// values of one key next to each other.
pub struct PartitionedAggregator {
    core: AggregationCore,
}

impl PartitionedAggregator {
    pub(crate) fn new(table: PartitionTable, accumulator: Option<Arc<dyn Accumulator>>) -> Self {
        Self {
            core: AggregationCore::new(table, accumulator),
        }
    }

    /// Removes a previously accumulated value from its key's result.
    pub fn retract(&mut self, pair: &Pair) -> Result<(), EngineError> {
        self.core.retract(pair)
    }

    pub fn partition_of(&self, key: &[u8]) -> usize {
        self.core.table.partition_of(key)
    }
}

impl Aggregator for PartitionedAggregator {
    type Item = Pair;
    type Output = AggregateOutput;

    fn accumulate(&mut self, pair: &Pair) -> Result<(), EngineError> {
        self.core.accumulate(pair)
    }

    fn finish(self) -> Result<AggregateOutput, EngineError> {
        Ok(self.core.finish(false, "aggregate"))
    }

    fn cancel(mut self) {
        self.core.table.teardown();
    }

    fn stats(&self) -> OperationStats {
        self.core.stats()
    }
}

/// Aggregation whose output is ordered: partitions ascending, keys in the configured sort order.
pub struct SortedPartitionedAggregator {
    core: AggregationCore,
}

impl SortedPartitionedAggregator {
    pub(crate) fn new(table: PartitionTable, accumulator: Option<Arc<dyn Accumulator>>) -> Self {
        Self {
            core: AggregationCore::new(table, accumulator),
        }
    }

    pub fn retract(&mut self, pair: &Pair) -> Result<(), EngineError> {
        self.core.retract(pair)
    }

    pub fn partition_of(&self, key: &[u8]) -> usize {
        self.core.table.partition_of(key)
    }
}

impl Aggregator for SortedPartitionedAggregator {
    type Item = Pair;
    type Output = AggregateOutput;

    fn accumulate(&mut self, pair: &Pair) -> Result<(), EngineError> {
        self.core.accumulate(pair)
    }

    fn finish(self) -> Result<AggregateOutput, EngineError> {
        Ok(self.core.finish(true, "sorted_aggregate"))
    }

    fn cancel(mut self) {
        self.core.table.teardown();
    }

    fn stats(&self) -> OperationStats {
        self.core.stats()
    }
}

enum PartitionStream {
    /// Slot-order walk of a partition that never spilled, following each slot's chain.
    Hashed {
        partition: usize,
        slot: usize,
        chain: Option<RecordAddr>,
    },
    /// Ordered merge of chunks and resident records, with pending retractions applied by key.
    Merged {
        partition: usize,
        values: MergeCursor,
        retractions: MergeCursor,
        pending: Option<Pair>,
    },
}

impl PartitionStream {
    fn partition(&self) -> usize {
        match self {
            PartitionStream::Hashed { partition, .. }
            | PartitionStream::Merged { partition, .. } => *partition,
        }
    }
}

/// Lazy result of an aggregation. Each partition is released as soon as it is drained.
pub struct AggregateOutput {
    table: PartitionTable,
    accumulator: Option<Arc<dyn Accumulator>>,
    sorted: bool,
    next_partition: usize,
    stream: Option<PartitionStream>,
    done: bool,
}

impl AggregateOutput {
    /// Partition the next emitted pair will come from.
    pub fn current_partition(&self) -> Option<usize> {
        match &self.stream {
            Some(stream) => Some(stream.partition()),
            None if self.next_partition < self.table.partition_count() => Some(self.next_partition),
            None => None,
        }
    }

    fn open(&self, partition: usize) -> Result<PartitionStream, EngineError> {
        if !self.sorted && !self.table.has_spilled(partition) {
            return Ok(PartitionStream::Hashed {
                partition,
                slot: 0,
                chain: None,
            });
        }
        Ok(PartitionStream::Merged {
            partition,
            values: self.table.merge_cursor(partition, VALUES)?,
            retractions: self.table.merge_cursor(partition, RETRACTIONS)?,
            pending: None,
        })
    }

    /// Next pair of the open stream, `None` once the partition is drained.
    fn pull(&mut self) -> Result<Option<Pair>, EngineError> {
        let memory = self.table.memory();
        let accumulator = self.accumulator.as_deref();
        match self.stream.as_mut() {
            None => Ok(None),
            Some(PartitionStream::Hashed {
                partition,
                slot,
                chain,
            }) => {
                let values = self.table.lane(*partition, VALUES).storage();
                let retractions = self.table.lane(*partition, RETRACTIONS).storage();
                loop {
                    if let Some(addr) = chain.take() {
                        let view = RecordView::read(memory, addr);
                        *chain = view.next();
                        let retracted = retractions.lookup(memory, view.key);
                        let value = deduct(accumulator, view.value.to_vec(), retracted)?;
                        return Ok(Some(Pair::new(view.key, value)));
                    }
                    if *slot >= values.slot_count() {
                        return Ok(None);
                    }
                    *chain = values.slot_head(*slot);
                    *slot += 1;
                }
            }
            Some(PartitionStream::Merged {
                values,
                retractions,
                pending,
                ..
            }) => {
                let Some(pair) = values.next_pair(memory)? else {
                    return Ok(None);
                };
                let order = self.table.order();
                loop {
                    if pending.is_none() {
                        *pending = retractions.next_pair(memory)?;
                    }
                    match pending.as_ref().map(|r| order.compare(&r.key, &pair.key)) {
                        Some(Ordering::Less) => *pending = None,
                        _ => break,
                    }
                }
                let retracted = pending
                    .take_if(|r| order.equals(&r.key, &pair.key))
                    .map(|r| r.value);
                let value = deduct(accumulator, pair.value, retracted.as_deref())?;
                Ok(Some(Pair::new(pair.key, value)))
            }
        }
    }

    fn advance(&mut self) -> Result<Option<Pair>, EngineError> {
        loop {
            if self.stream.is_none() {
                if self.next_partition >= self.table.partition_count() {
                    return Ok(None);
                }
                self.stream = Some(self.open(self.next_partition)?);
                self.next_partition += 1;
            }
            if let Some(pair) = self.pull()? {
                return Ok(Some(pair));
            }
            if let Some(stream) = self.stream.take() {
                let partition = stream.partition();
                drop(stream);
                self.table.release(partition)?;
            }
        }
    }
}

fn deduct(
    accumulator: Option<&dyn Accumulator>,
    state: Vec<u8>,
    retracted: Option<&[u8]>,
) -> Result<Vec<u8>, EngineError> {
    let Some(retracted) = retracted else {
        return Ok(state);
    };
    let mut out = Vec::with_capacity(state.len());
    if !accumulator.is_some_and(|acc| acc.deduct(&state, retracted, &mut out)) {
        return Err(EngineError::Unsupported("accumulator refused to deduct".to_string()));
    }
    Ok(out)
}

impl Iterator for AggregateOutput {
    type Item = Result<Pair, EngineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.advance() {
            Ok(Some(pair)) => Some(Ok(pair)),
            Ok(None) => {
                self.done = true;
                self.table.teardown();
                None
            }
            Err(e) => {
                self.done = true;
                self.stream = None;
                self.table.teardown();
                Some(Err(e))
            }
        }
    }
}
