use std::fmt;
use std::path::PathBuf;

#[derive(Debug)]
pub enum EngineError {
    InvalidConfig(String),
    MemoryExhausted { partition: usize },
    PairTooLarge { record_len: usize, block_size: usize },
    Unsupported(String),
    CorruptChunk { path: PathBuf, missing: u64 },
    Io(std::io::Error),
    Serialization(Box<bincode::error::EncodeError>),
    Deserialization(Box<bincode::error::DecodeError>),
    Config(serde_json::Error),
    Other(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::InvalidConfig(e) => write!(f, "Invalid configuration: {}", e),
            EngineError::MemoryExhausted { partition } => write!(
                f,
                "Memory exhausted in partition {} with nothing left to spill",
                partition
            ),
            EngineError::PairTooLarge { record_len, block_size } => write!(
                f,
                "Pair needs {} bytes but a memory block holds only {}",
                record_len, block_size
            ),
            EngineError::Unsupported(e) => write!(f, "Unsupported operation: {}", e),
            EngineError::CorruptChunk { path, missing } => write!(
                f,
                "Chunk {} is truncated: {} records missing",
                path.display(),
                missing
            ),
            EngineError::Io(e) => write!(f, "IO error: {}", e),
            EngineError::Serialization(e) => write!(f, "Serialization error: {}", e),
            EngineError::Deserialization(e) => write!(f, "Deserialization error: {}", e),
            EngineError::Config(e) => write!(f, "Config error: {}", e),
            EngineError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Io(e) => Some(e),
            EngineError::Config(e) => Some(e),
            _ => None,
        }
    }
}

impl From<bincode::error::EncodeError> for EngineError {
    fn from(err: bincode::error::EncodeError) -> Self {
        EngineError::Serialization(Box::new(err))
    }
}

impl From<bincode::error::DecodeError> for EngineError {
    fn from(err: bincode::error::DecodeError) -> Self {
        EngineError::Deserialization(Box::new(err))
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Io(err)
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Config(err)
    }
}

impl From<String> for EngineError {
    fn from(err: String) -> Self {
        EngineError::Other(err)
    }
}

impl From<&str> for EngineError {
    fn from(err: &str) -> Self {
        EngineError::Other(err.to_string())
    }
}
