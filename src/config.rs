use crate::comparator::SortOrder;
use crate::memory::{MemoryChainingRule, MemoryContext};
use crate::pair::Endianness;
use crate::storage::RECORD_HEADER_LEN;
use crate::EngineError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use sysinfo::System;
use tracing::info;

/// Environment variable overriding the default spilling directory.
pub const SPILL_DIR_ENV: &str = "SPILLAGG_SPILL_DIR";

fn default_spilling_directory() -> PathBuf {
    std::env::var(SPILL_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::temp_dir().join("spillagg"))
}

/// Settings of one aggregation or join instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationConfig {
    pub partition_count: usize,
    /// I/O buffer size for chunk writes and reads, in bytes.
    pub spilling_buffer_size: usize,
    pub spill_to_disk: bool,
    pub spilling_directory: PathBuf,
    /// Target chunk size in bytes.
    pub spilling_chunk_size: usize,
    pub sort_order: SortOrder,
    pub use_big_endian: bool,
    pub memory_chaining_rule: MemoryChainingRule,
    /// Maximum number of chunks merged at once.
    pub merge_fan_in: usize,
}

impl Default for OperationConfig {
    fn default() -> Self {
        Self {
            partition_count: 16,
            spilling_buffer_size: 64 * 1024,
            spill_to_disk: true,
            spilling_directory: default_spilling_directory(),
            spilling_chunk_size: 4 * 1024 * 1024,
            sort_order: SortOrder::Ascending,
            use_big_endian: false,
            memory_chaining_rule: MemoryChainingRule::Grow,
            merge_fan_in: 64,
        }
    }
}

impl OperationConfig {
    pub fn from_json_str(json: &str) -> Result<Self, EngineError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, EngineError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    pub fn endianness(&self) -> Endianness {
        Endianness::from_big_endian_flag(self.use_big_endian)
    }

    /// Rejects settings that would only fail mid-run.
    pub fn validate(&self, memory: &MemoryContext) -> Result<(), EngineError> {
        if self.partition_count == 0 {
            return Err(EngineError::InvalidConfig("partition_count must be positive".to_string()));
        }
        if self.spilling_buffer_size == 0 {
            return Err(EngineError::InvalidConfig(
                "spilling_buffer_size must be positive".to_string(),
            ));
        }
        if self.spilling_chunk_size == 0 {
            return Err(EngineError::InvalidConfig(
                "spilling_chunk_size must be positive".to_string(),
            ));
        }
        if self.merge_fan_in < 2 {
            return Err(EngineError::InvalidConfig("merge_fan_in must be at least 2".to_string()));
        }
        if let MemoryChainingRule::Bounded { blocks_per_storage: 0 } = self.memory_chaining_rule {
            return Err(EngineError::InvalidConfig(
                "blocks_per_storage must be positive".to_string(),
            ));
        }
        if memory.max_blocks() == 0 {
            return Err(EngineError::InvalidConfig("memory context has no blocks".to_string()));
        }
        if memory.block_size() <= RECORD_HEADER_LEN {
            return Err(EngineError::InvalidConfig(format!(
                "block size {} cannot hold a record",
                memory.block_size()
            )));
        }
        Ok(())
    }
}

/// Size of the block pool handed to an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryConfig {
    pub block_size: usize,
    pub max_blocks: usize,
}

impl MemoryConfig {
    const MIN_BLOCKS: usize = 4;
    const MAX_BLOCK_SIZE: usize = 4 * 1024 * 1024;

    /// Sizes the pool to `percent` of system RAM, split into blocks of at most 4 MiB.
    ///
    /// Smaller budgets get smaller blocks so that every partition can still
    /// hold a block of its own.
    pub fn calculate(percent: usize, partition_count: usize) -> Self {
        let mut sys = System::new();
        sys.refresh_memory();

        let total_memory = sys.total_memory() as usize;
        let budget = total_memory / 100 * percent.clamp(1, 90);

        let min_blocks = partition_count.max(Self::MIN_BLOCKS);
        let block_size = (budget / min_blocks)
            .clamp(4 * 1024, Self::MAX_BLOCK_SIZE)
            .next_power_of_two()
            .min(Self::MAX_BLOCK_SIZE);
        let max_blocks = (budget / block_size).max(min_blocks);

        let config = Self {
            block_size,
            max_blocks,
        };
        info!(
            total_mb = total_memory / 1_048_576,
            budget_mb = budget / 1_048_576,
            block_size = config.block_size,
            max_blocks = config.max_blocks,
            "sized block pool from system memory"
        );
        config
    }

    /// Fixed 64 MiB pool for tests or when system info is unavailable.
    pub fn default_config() -> Self {
        Self {
            block_size: 1024 * 1024,
            max_blocks: 64,
        }
    }

    pub fn budget_bytes(&self) -> usize {
        self.block_size.saturating_mul(self.max_blocks)
    }

    pub fn into_context(self) -> MemoryContext {
        MemoryContext::new(self.block_size, self.max_blocks)
    }
}
