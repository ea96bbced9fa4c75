use crate::aggregator::{Aggregator, OperationStats};
use crate::merge::MergeCursor;
use crate::pair::{JoinedPair, Pair};
use crate::partition::PartitionTable;
use crate::storage::{RecordAddr, RecordView};
use crate::EngineError;
use std::cmp::Ordering;
use tracing::info;

pub(crate) const BUILD: usize = 0;
pub(crate) const PROBE: usize = 1;

/// Inner equi-join of a build input and a probe input.
///
/// Both inputs are partitioned with the same routing and buffered under the
/// same block pool; build pairs come in through [`Aggregator::accumulate`],
/// probe pairs through [`PartitionedJoiner::probe`]. Build values of one key
/// are kept individually unless the joiner was created with an accumulator.
pub struct PartitionedJoiner {
    table: PartitionTable,
    build_pairs: u64,
    probe_pairs: u64,
}

impl PartitionedJoiner {
    pub(crate) fn new(table: PartitionTable) -> Self {
        Self {
            table,
            build_pairs: 0,
            probe_pairs: 0,
        }
    }

    pub fn probe(&mut self, pair: &Pair) -> Result<(), EngineError> {
        self.table.insert(PROBE, &pair.key, &pair.value)?;
        self.probe_pairs += 1;
        Ok(())
    }

    pub fn partition_of(&self, key: &[u8]) -> usize {
        self.table.partition_of(key)
    }
}

impl Aggregator for PartitionedJoiner {
    type Item = JoinedPair;
    type Output = JoinOutput;

    fn accumulate(&mut self, pair: &Pair) -> Result<(), EngineError> {
        self.table.insert(BUILD, &pair.key, &pair.value)?;
        self.build_pairs += 1;
        Ok(())
    }

    fn finish(self) -> Result<JoinOutput, EngineError> {
        info!(
            operation = "join",
            build = self.build_pairs,
            probe = self.probe_pairs,
            spills = self.table.spills(),
            bytes_spilled = self.table.bytes_spilled(),
            "input complete"
        );
        Ok(JoinOutput {
            table: self.table,
            next_partition: 0,
            stream: None,
            done: false,
        })
    }

    fn cancel(mut self) {
        self.table.teardown();
    }

    fn stats(&self) -> OperationStats {
        OperationStats {
            pairs_accepted: self.build_pairs + self.probe_pairs,
            spills: self.table.spills(),
            chunks_written: self.table.chunks_written(),
            bytes_spilled: self.table.bytes_spilled(),
            blocks_in_use: self.table.blocks_in_use(),
        }
    }
}

/// Build values sharing one key, gathered from the sorted build stream.
struct BuildGroup {
    key: Vec<u8>,
    values: Vec<Vec<u8>>,
}

enum JoinStream {
    /// Both sides resident: walk probe records and look up their build chain.
    Hashed {
        partition: usize,
        slot: usize,
        probe: Option<RecordAddr>,
        build: Option<RecordAddr>,
    },
    /// Something spilled: sort-merge join of the two merged streams.
    Merged {
        partition: usize,
        build: MergeCursor,
        probe: MergeCursor,
        lookahead: Option<Pair>,
        group: Option<BuildGroup>,
        current: Option<(Pair, usize)>,
    },
}

impl JoinStream {
    fn partition(&self) -> usize {
        match self {
            JoinStream::Hashed { partition, .. } | JoinStream::Merged { partition, .. } => {
                *partition
            }
        }
    }
}

/// Lazy joined output, partition by partition.
pub struct JoinOutput {
    table: PartitionTable,
    next_partition: usize,
    stream: Option<JoinStream>,
    done: bool,
}

impl JoinOutput {
    fn open(&self, partition: usize) -> Result<JoinStream, EngineError> {
        if !self.table.has_spilled(partition) {
            return Ok(JoinStream::Hashed {
                partition,
                slot: 0,
                probe: None,
                build: None,
            });
        }
        Ok(JoinStream::Merged {
            partition,
            build: self.table.merge_cursor(partition, BUILD)?,
            probe: self.table.merge_cursor(partition, PROBE)?,
            lookahead: None,
            group: None,
            current: None,
        })
    }

    fn pull(&mut self) -> Result<Option<JoinedPair>, EngineError> {
        let memory = self.table.memory();
        let order = self.table.order();
        match self.stream.as_mut() {
            None => Ok(None),
            Some(JoinStream::Hashed {
                partition,
                slot,
                probe,
                build,
            }) => {
                let build_side = self.table.lane(*partition, BUILD).storage();
                let probe_side = self.table.lane(*partition, PROBE).storage();
                let build_head =
                    |key: &[u8]| build_side.values(memory, key).next().map(|(addr, _)| addr);
                loop {
                    if let Some(probe_addr) = *probe {
                        let probe_view = RecordView::read(memory, probe_addr);
                        if let Some(build_addr) = *build {
                            let build_view = RecordView::read(memory, build_addr);
                            *build = build_view.next();
                            return Ok(Some(JoinedPair {
                                key: probe_view.key.to_vec(),
                                build: build_view.value.to_vec(),
                                probe: probe_view.value.to_vec(),
                            }));
                        }
                        *probe = probe_view.next();
                    } else {
                        if *slot >= probe_side.slot_count() {
                            return Ok(None);
                        }
                        *probe = probe_side.slot_head(*slot);
                        *slot += 1;
                    }
                    *build = probe.and_then(|addr| build_head(RecordView::read(memory, addr).key));
                }
            }
            Some(JoinStream::Merged {
                build,
                probe,
                lookahead,
                group,
                current,
                ..
            }) => loop {
                if let Some((probe_pair, idx)) = current.as_mut() {
                    if let Some(values) = group.as_ref().map(|g| &g.values) {
                        if let Some(value) = values.get(*idx) {
                            *idx += 1;
                            return Ok(Some(JoinedPair {
                                key: probe_pair.key.clone(),
                                build: value.clone(),
                                probe: probe_pair.value.clone(),
                            }));
                        }
                    }
                    *current = None;
                }

                let Some(probe_pair) = probe.next_pair(memory)? else {
                    return Ok(None);
                };
                if !group.as_ref().is_some_and(|g| order.equals(&g.key, &probe_pair.key)) {
                    *group = None;
                    loop {
                        if lookahead.is_none() {
                            *lookahead = build.next_pair(memory)?;
                        }
                        let Some(next) = lookahead.as_ref() else {
                            break;
                        };
                        match order.compare(&next.key, &probe_pair.key) {
                            Ordering::Less => *lookahead = None,
                            Ordering::Greater => break,
                            Ordering::Equal => {
                                let g = group.get_or_insert_with(|| BuildGroup {
                                    key: probe_pair.key.clone(),
                                    values: Vec::new(),
                                });
                                if let Some(matched) = lookahead.take() {
                                    g.values.push(matched.value);
                                }
                            }
                        }
                    }
                    if group.is_none() && lookahead.is_none() {
                        // Build side exhausted; no later probe key can match.
                        return Ok(None);
                    }
                }
                if group.is_some() {
                    *current = Some((probe_pair, 0));
                }
            },
        }
    }

    fn advance(&mut self) -> Result<Option<JoinedPair>, EngineError> {
        loop {
            if self.stream.is_none() {
                if self.next_partition >= self.table.partition_count() {
                    return Ok(None);
                }
                self.stream = Some(self.open(self.next_partition)?);
                self.next_partition += 1;
            }
            if let Some(joined) = self.pull()? {
                return Ok(Some(joined));
            }
            if let Some(stream) = self.stream.take() {
                let partition = stream.partition();
                drop(stream);
                self.table.release(partition)?;
            }
        }
    }
}

impl Iterator for JoinOutput {
    type Item = Result<JoinedPair, EngineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.advance() {
            Ok(Some(joined)) => Some(Ok(joined)),
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
