use crate::pair::{Endianness, Pair};
use crate::EngineError;
use bincode::config;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::debug;

/// Writes one record as `u64 key_len, key, u64 value_len, value` in the given byte order.
pub fn encode_record<W: Write>(
    writer: &mut W,
    key: &[u8],
    value: &[u8],
    endian: Endianness,
) -> Result<usize, EngineError> {
    let written = match endian {
        Endianness::Big => bincode::encode_into_std_write(
            (key, value),
            writer,
            config::standard().with_big_endian().with_fixed_int_encoding(),
        )?,
        Endianness::Little => bincode::encode_into_std_write(
            (key, value),
            writer,
            config::standard().with_little_endian().with_fixed_int_encoding(),
        )?,
    };
    Ok(written)
}

pub fn decode_record<R: std::io::Read>(
    reader: &mut R,
    endian: Endianness,
) -> Result<Pair, EngineError> {
    let pair: Pair = match endian {
        Endianness::Big => bincode::decode_from_std_read(
            reader,
            config::standard().with_big_endian().with_fixed_int_encoding(),
        )?,
        Endianness::Little => bincode::decode_from_std_read(
            reader,
            config::standard().with_little_endian().with_fixed_int_encoding(),
        )?,
    };
    Ok(pair)
}

/// A fully written, key-sorted run of one partition.
#[derive(Clone, Debug)]
pub struct Chunk {
    path: PathBuf,
    partition: usize,
    records: u64,
    bytes: u64,
}

impl Chunk {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn partition(&self) -> usize {
        self.partition
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn open(&self, buffer_size: usize, endian: Endianness) -> Result<ChunkReader, EngineError> {
        let file = File::open(&self.path)?;
        Ok(ChunkReader {
            reader: BufReader::with_capacity(buffer_size, file),
            endian,
            remaining: self.records,
            path: self.path.clone(),
        })
    }

    pub fn remove(&self) -> Result<(), EngineError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EngineError::Io(e)),
        }
    }
}

/// Streams the records of a chunk; a chunk that ends early is reported as an error.
pub struct ChunkReader {
    reader: BufReader<File>,
    endian: Endianness,
    remaining: u64,
    path: PathBuf,
}

impl Iterator for ChunkReader {
    type Item = Result<Pair, EngineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        match self.reader.fill_buf() {
            Ok(buf) if buf.is_empty() => {
                let missing = self.remaining;
                self.remaining = 0;
                return Some(Err(EngineError::CorruptChunk {
                    path: self.path.clone(),
                    missing,
                }));
            }
            Ok(_) => {}
            Err(e) => return Some(Err(EngineError::Io(e))),
        }
        self.remaining -= 1;
        Some(decode_record(&mut self.reader, self.endian))
    }
}

struct ChunkWriter {
    tmp_path: PathBuf,
    final_path: PathBuf,
    writer: BufWriter<File>,
    records: u64,
    bytes: u64,
}

impl ChunkWriter {
    fn create(final_path: PathBuf, buffer_size: usize) -> Result<Self, EngineError> {
        let tmp_path = final_path.with_extension("tmp");
        let file = File::create(&tmp_path)?;
        Ok(Self {
            tmp_path,
            final_path,
            writer: BufWriter::with_capacity(buffer_size, file),
            records: 0,
            bytes: 0,
        })
    }

    fn write(&mut self, key: &[u8], value: &[u8], endian: Endianness) -> Result<(), EngineError> {
        self.bytes += encode_record(&mut self.writer, key, value, endian)? as u64;
        self.records += 1;
        Ok(())
    }

    /// Flushes, syncs and renames into place. Only a finished chunk is ever merged.
    fn finish(self, partition: usize) -> Result<Chunk, EngineError> {
        let file = self
            .writer
            .into_inner()
            .map_err(|e| EngineError::Io(e.into_error()))?;
        file.sync_all()?;
        drop(file);
        fs::rename(&self.tmp_path, &self.final_path)?;
        Ok(Chunk {
            path: self.final_path,
            partition,
            records: self.records,
            bytes: self.bytes,
        })
    }
}

/// Owns the spill directory of one operation instance.
///
/// The directory is unique per instance and is deleted with everything in it
/// when the context is dropped or closed.
pub struct SpillContext {
    dir: TempDir,
    buffer_size: usize,
    chunk_size: usize,
    endian: Endianness,
    next_chunk: usize,
    chunks_written: usize,
    bytes_written: u64,
}

impl SpillContext {
    pub fn new(
        base: &Path,
        buffer_size: usize,
        chunk_size: usize,
        endian: Endianness,
    ) -> Result<Self, EngineError> {
        fs::create_dir_all(base)?;
        let dir = tempfile::Builder::new().prefix("spillagg-").tempdir_in(base)?;
        debug!(dir = %dir.path().display(), "created spill directory");
        Ok(Self {
            dir,
            buffer_size,
            chunk_size,
            endian,
            next_chunk: 0,
            chunks_written: 0,
            bytes_written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn endian(&self) -> Endianness {
        self.endian
    }

    pub fn chunks_written(&self) -> usize {
        self.chunks_written
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Writes already sorted entries as one or more chunks of about `chunk_size` bytes each.
    pub fn write_sorted<I, K, V>(
        &mut self,
        partition: usize,
        entries: I,
    ) -> Result<Vec<Chunk>, EngineError>
    where
        I: IntoIterator<Item = Result<(K, V), EngineError>>,
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        let mut chunks = Vec::new();
        let mut current: Option<ChunkWriter> = None;

        for entry in entries {
            let (key, value) = entry?;
            let mut writer = match current.take() {
                Some(writer) => writer,
                None => ChunkWriter::create(self.next_chunk_path(partition), self.buffer_size)?,
            };
            writer.write(key.as_ref(), value.as_ref(), self.endian)?;
            if writer.bytes >= self.chunk_size as u64 {
                let chunk = writer.finish(partition)?;
                chunks.push(self.register(chunk));
            } else {
                current = Some(writer);
            }
        }
        if let Some(writer) = current.take() {
            let chunk = writer.finish(partition)?;
            chunks.push(self.register(chunk));
        }
        Ok(chunks)
    }

    pub fn close(self) -> Result<(), EngineError> {
        self.dir.close()?;
        Ok(())
    }

    fn next_chunk_path(&mut self, partition: usize) -> PathBuf {
        let path = self
            .dir
            .path()
            .join(format!("p={:04}-chunk-{:06}.run", partition, self.next_chunk));
        self.next_chunk += 1;
        path
    }

    fn register(&mut self, chunk: Chunk) -> Chunk {
        self.chunks_written += 1;
        self.bytes_written += chunk.bytes;
        debug!(
            partition = chunk.partition,
            chunk = %chunk.path.display(),
            records = chunk.records,
            bytes = chunk.bytes,
            "spilled chunk"
        );
        chunk
    }
}
