use crate::pair::Endianness;

/// Binary merge function folding values into an accumulated state.
///
/// States produced here are what the engine stores in memory blocks and
/// spills to disk. `accumulate` and `combine` must be associative; states of
/// one key are always combined in arrival order, so commutativity is not
/// required. `deduct` must only be supported by invertible accumulators.
pub trait Accumulator: Send + Sync {
    /// Initial state for the first value of a key.
    fn init(&self, value: &[u8], out: &mut Vec<u8>) {
        out.extend_from_slice(value);
    }

    /// Folds one input value into `state`, writing the new state to `out`.
    fn accumulate(&self, state: &[u8], value: &[u8], out: &mut Vec<u8>);

    /// Merges two states of the same key, `left` being the older one.
    fn combine(&self, left: &[u8], right: &[u8], out: &mut Vec<u8>) {
        self.accumulate(left, right, out);
    }

    /// Removes a previously accumulated `retracted` state from `state`.
    /// Returns false when the accumulator cannot retract.
    fn deduct(&self, _state: &[u8], _retracted: &[u8], _out: &mut Vec<u8>) -> bool {
        false
    }

    fn supports_deduct(&self) -> bool {
        false
    }

    /// Byte order of numeric states, for accumulators that decode them.
    fn endianness(&self) -> Option<Endianness> {
        None
    }
}

/// Sum of 8-byte signed integers. Malformed widths are treated as zero.
#[derive(Clone, Copy, Debug)]
pub struct SumAccumulator {
    endian: Endianness,
}

impl SumAccumulator {
    pub fn new(endian: Endianness) -> Self {
        Self { endian }
    }

    fn read(&self, bytes: &[u8]) -> i64 {
        self.endian.decode_i64(bytes).unwrap_or(0)
    }
}

impl Accumulator for SumAccumulator {
    fn init(&self, value: &[u8], out: &mut Vec<u8>) {
        out.extend_from_slice(&self.endian.encode_i64(self.read(value)));
    }

    fn accumulate(&self, state: &[u8], value: &[u8], out: &mut Vec<u8>) {
        let sum = self.read(state).wrapping_add(self.read(value));
        out.extend_from_slice(&self.endian.encode_i64(sum));
    }

    fn deduct(&self, state: &[u8], retracted: &[u8], out: &mut Vec<u8>) -> bool {
        let diff = self.read(state).wrapping_sub(self.read(retracted));
        out.extend_from_slice(&self.endian.encode_i64(diff));
        true
    }

    fn supports_deduct(&self) -> bool {
        true
    }

    fn endianness(&self) -> Option<Endianness> {
        Some(self.endian)
    }
}

/// Maximum of 8-byte signed integers.
#[derive(Clone, Copy, Debug)]
pub struct MaxAccumulator {
    endian: Endianness,
}

impl MaxAccumulator {
    pub fn new(endian: Endianness) -> Self {
        Self { endian }
    }
}

impl Accumulator for MaxAccumulator {
    fn accumulate(&self, state: &[u8], value: &[u8], out: &mut Vec<u8>) {
        let current = self.endian.decode_i64(state);
        let candidate = self.endian.decode_i64(value);
        let max = match (current, candidate) {
            (Some(c), Some(v)) => c.max(v),
            (Some(c), None) => c,
            (None, Some(v)) => v,
            (None, None) => 0,
        };
        out.extend_from_slice(&self.endian.encode_i64(max));
    }

    fn endianness(&self) -> Option<Endianness> {
        Some(self.endian)
    }
}

/// Appends values in arrival order. Associative but not commutative.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConcatAccumulator;

impl Accumulator for ConcatAccumulator {
    fn accumulate(&self, state: &[u8], value: &[u8], out: &mut Vec<u8>) {
        out.extend_from_slice(state);
        out.extend_from_slice(value);
    }
}
