pub mod accumulator;
pub mod aggregator;
pub mod comparator;
pub mod config;
pub mod error;
pub mod factory;
pub mod joiner;
pub mod memory;
pub mod merge;
pub mod pair;
pub mod partition;
pub mod spill;
pub mod storage;

pub use accumulator::{Accumulator, ConcatAccumulator, MaxAccumulator, SumAccumulator};
pub use aggregator::{
    AggregateOutput, Aggregator, OperationStats, PartitionedAggregator, SortedPartitionedAggregator,
};
pub use comparator::{BytewiseComparator, Comparator, I64Comparator, KeyOrder, SortOrder};
pub use config::{MemoryConfig, OperationConfig};
pub use error::*;
pub use factory::OperationFactory;
pub use joiner::{JoinOutput, PartitionedJoiner};
pub use memory::{MemoryChainingRule, MemoryContext};
pub use pair::{Endianness, JoinedPair, Pair};
