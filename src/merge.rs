use crate::accumulator::Accumulator;
use crate::comparator::KeyOrder;
use crate::memory::MemoryContext;
use crate::pair::{Endianness, Pair};
use crate::spill::{Chunk, ChunkReader, SpillContext};
use crate::storage::{RecordAddr, RecordView};
use crate::EngineError;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::debug;

enum Source {
    Chunk(ChunkReader),
    Memory(std::vec::IntoIter<RecordAddr>),
}

impl Source {
    fn next(&mut self, memory: &MemoryContext) -> Result<Option<Pair>, EngineError> {
        match self {
            Source::Chunk(reader) => reader.next().transpose(),
            Source::Memory(addrs) => Ok(addrs.next().map(|addr| {
                let view = RecordView::read(memory, addr);
                Pair::new(view.key, view.value)
            })),
        }
    }
}

/// Streaming k-way merge over spilled chunks (oldest first) and the resident sorted records (last).
///
/// With an accumulator equal keys are folded into one pair with `combine`;
/// without one every record is yielded. Memory records are read through the
/// context passed to each call, so the cursor never borrows the pool.
pub struct MergeCursor {
    sources: Vec<Source>,
    heads: Vec<Option<Pair>>,
    /// Min-heap of source indices whose head is loaded.
    heap: Vec<usize>,
    order: KeyOrder,
    accumulator: Option<Arc<dyn Accumulator>>,
    scratch: Vec<u8>,
}

impl MergeCursor {
    pub fn new(
        chunks: &[Chunk],
        resident: Vec<RecordAddr>,
        memory: &MemoryContext,
        order: KeyOrder,
        accumulator: Option<Arc<dyn Accumulator>>,
        buffer_size: usize,
        endian: Endianness,
    ) -> Result<Self, EngineError> {
        let mut sources = chunks
            .iter()
            .map(|chunk| chunk.open(buffer_size, endian).map(Source::Chunk))
            .collect::<Result<Vec<_>, _>>()?;
        if !resident.is_empty() {
            sources.push(Source::Memory(resident.into_iter()));
        }

        let mut cursor = Self {
            heads: (0..sources.len()).map(|_| None).collect(),
            heap: Vec::with_capacity(sources.len()),
            sources,
            order,
            accumulator,
            scratch: Vec::new(),
        };
        for idx in 0..cursor.sources.len() {
            if let Some(pair) = cursor.sources[idx].next(memory)? {
                cursor.heads[idx] = Some(pair);
                cursor.heap.push(idx);
                cursor.sift_up(cursor.heap.len() - 1);
            }
        }
        Ok(cursor)
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Next pair in key order; one pair per key when folding.
    pub fn next_pair(&mut self, memory: &MemoryContext) -> Result<Option<Pair>, EngineError> {
        let Some(mut pair) = self.pop(memory)? else {
            return Ok(None);
        };
        let Some(acc) = self.accumulator.clone() else {
            return Ok(Some(pair));
        };
        while self
            .peek()
            .is_some_and(|head| self.order.equals(&head.key, &pair.key))
        {
            let Some(newer) = self.pop(memory)? else {
                break;
            };
            self.scratch.clear();
            acc.combine(&pair.value, &newer.value, &mut self.scratch);
            std::mem::swap(&mut pair.value, &mut self.scratch);
        }
        Ok(Some(pair))
    }

    fn peek(&self) -> Option<&Pair> {
        self.heap.first().and_then(|&source| self.heads[source].as_ref())
    }

    fn pop(&mut self, memory: &MemoryContext) -> Result<Option<Pair>, EngineError> {
        let Some(&source) = self.heap.first() else {
            return Ok(None);
        };
        let pair = self.heads[source].take();
        match self.sources[source].next(memory)? {
            Some(next) => self.heads[source] = Some(next),
            None => {
                self.heap.swap_remove(0);
            }
        }
        if !self.heap.is_empty() {
            self.sift_down(0);
        }
        Ok(pair)
    }

    /// Smaller key first; older sources win ties so equal keys fold in arrival order.
    fn precedes(&self, a: usize, b: usize) -> bool {
        match (&self.heads[a], &self.heads[b]) {
            (Some(left), Some(right)) => match self.order.compare(&left.key, &right.key) {
                Ordering::Less => true,
                Ordering::Greater => false,
                Ordering::Equal => a < b,
            },
            _ => a < b,
        }
    }

    fn sift_up(&mut self, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if !self.precedes(self.heap[pos], self.heap[parent]) {
                break;
            }
            self.heap.swap(pos, parent);
            pos = parent;
        }
    }

    fn sift_down(&mut self, mut pos: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * pos + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let mut best = left;
            if right < len && self.precedes(self.heap[right], self.heap[left]) {
                best = right;
            }
            if !self.precedes(self.heap[best], self.heap[pos]) {
                break;
            }
            self.heap.swap(pos, best);
            pos = best;
        }
    }
}

/// Merges chunk runs in groups of `fan_in` until at most `fan_in` remain.
///
/// Groups are consecutive so the relative age of records is preserved.
pub fn compact_chunks(
    mut chunks: Vec<Chunk>,
    partition: usize,
    fan_in: usize,
    order: &KeyOrder,
    accumulator: Option<Arc<dyn Accumulator>>,
    spill: &mut SpillContext,
    memory: &MemoryContext,
) -> Result<Vec<Chunk>, EngineError> {
    let fan_in = fan_in.max(2);
    while chunks.len() > fan_in {
        let mut next_pass = Vec::new();
        for group in chunks.chunks(fan_in) {
            if group.len() == 1 {
                next_pass.extend_from_slice(group);
                continue;
            }
            let mut cursor = MergeCursor::new(
                group,
                Vec::new(),
                memory,
                order.clone(),
                accumulator.clone(),
                spill.buffer_size(),
                spill.endian(),
            )?;
            let merged = spill.write_sorted(
                partition,
                std::iter::from_fn(|| cursor.next_pair(memory).transpose())
                    .map(|pair| pair.map(|p| (p.key, p.value))),
            )?;
            for chunk in group {
                chunk.remove()?;
            }
            next_pass.extend(merged);
        }
        debug!(
            partition,
            before = chunks.len(),
            after = next_pass.len(),
            "compacted spilled chunks"
        );
        chunks = next_pass;
    }
    Ok(chunks)
}
