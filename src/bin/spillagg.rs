use clap::{Parser, Subcommand, ValueEnum};
use spillagg::{
    Accumulator, Aggregator, BytewiseComparator, EngineError, MaxAccumulator, MemoryConfig,
    MemoryContext, OperationConfig, OperationFactory, Pair, SortOrder, SumAccumulator,
};
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "spillagg")]
#[command(about = "Out-of-core aggregation and join over key,value files", long_about = None)]
struct Cli {
    /// JSON operation config; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,
    /// Pool budget in MiB; sized from system memory when omitted
    #[arg(long)]
    memory_mb: Option<usize>,
    #[arg(long, default_value_t = 64 * 1024)]
    block_size: usize,
    #[arg(long)]
    partitions: Option<usize>,
    #[arg(long)]
    spill_dir: Option<PathBuf>,
    /// Fail instead of spilling when memory runs out
    #[arg(long)]
    no_spill: bool,
    #[arg(long)]
    descending: bool,
    #[arg(long, value_enum, default_value_t = Function::Sum)]
    function: Function,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Function {
    Sum,
    Max,
    /// Keep every value, grouped by key
    Collect,
}

#[derive(Subcommand)]
enum Commands {
    /// Group by key and fold the integer values with --function
    Aggregate { input: PathBuf },
    /// Like aggregate, with keys sorted inside each partition
    Sorted { input: PathBuf },
    /// Inner join of two files on key, printing key,build,probe
    Join { build: PathBuf, probe: PathBuf },
}

fn main() -> Result<(), EngineError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let config = operation_config(&cli)?;
    let memory = memory_context(&cli, config.partition_count);
    let endian = config.endianness();
    let accumulator: Option<Arc<dyn Accumulator>> = match cli.function {
        Function::Sum => Some(Arc::new(SumAccumulator::new(endian))),
        Function::Max => Some(Arc::new(MaxAccumulator::new(endian))),
        Function::Collect => None,
    };
    let comparator = Arc::new(BytewiseComparator);
    let mut out = BufWriter::new(io::stdout().lock());

    match &cli.command {
        Commands::Aggregate { input } => {
            let agg = OperationFactory::aggregator(memory, &config, comparator, accumulator)?;
            run_aggregation(agg, input, &config, &mut out)?;
        }
        Commands::Sorted { input } => {
            let agg =
                OperationFactory::sorted_aggregator(memory, &config, comparator, accumulator)?;
            run_aggregation(agg, input, &config, &mut out)?;
        }
        Commands::Join { build, probe } => {
            let mut joiner = OperationFactory::joiner(memory, &config, comparator, None)?;
            for pair in read_pairs(build, &config)? {
                joiner.accumulate(&pair?)?;
            }
            for pair in read_pairs(probe, &config)? {
                joiner.probe(&pair?)?;
            }
            let stats = joiner.stats();
            let mut emitted = 0u64;
            for joined in joiner.finish()? {
                let joined = joined?;
                writeln!(
                    out,
                    "{},{},{}",
                    String::from_utf8_lossy(&joined.key),
                    decode_value(&joined.build, &config),
                    decode_value(&joined.probe, &config)
                )?;
                emitted += 1;
            }
            info!(
                input = stats.pairs_accepted,
                spills = stats.spills,
                emitted,
                "join finished"
            );
        }
    }
    out.flush()?;
    Ok(())
}

fn run_aggregation<A>(
    mut agg: A,
    input: &Path,
    config: &OperationConfig,
    out: &mut impl Write,
) -> Result<(), EngineError>
where
    A: Aggregator<Item = Pair>,
{
    for pair in read_pairs(input, config)? {
        agg.accumulate(&pair?)?;
    }
    let stats = agg.stats();
    let mut emitted = 0u64;
    for pair in agg.finish()? {
        let pair = pair?;
        writeln!(
            out,
            "{},{}",
            String::from_utf8_lossy(&pair.key),
            decode_value(&pair.value, config)
        )?;
        emitted += 1;
    }
    info!(
        input = stats.pairs_accepted,
        spills = stats.spills,
        chunks = stats.chunks_written,
        bytes_spilled = stats.bytes_spilled,
        emitted,
        "aggregation finished"
    );
    Ok(())
}

fn operation_config(cli: &Cli) -> Result<OperationConfig, EngineError> {
    let mut config = match &cli.config {
        Some(path) => OperationConfig::from_json_file(path)?,
        None => OperationConfig::default(),
    };
    if let Some(partitions) = cli.partitions {
        config.partition_count = partitions;
    }
    if let Some(dir) = &cli.spill_dir {
        config.spilling_directory = dir.clone();
    }
    if cli.no_spill {
        config.spill_to_disk = false;
    }
    if cli.descending {
        config.sort_order = SortOrder::Descending;
    }
    Ok(config)
}

fn memory_context(cli: &Cli, partitions: usize) -> MemoryContext {
    match cli.memory_mb {
        Some(mb) => {
            let block_size = cli.block_size.max(64);
            MemoryContext::new(block_size, (mb * 1_048_576 / block_size).max(1))
        }
        None => MemoryConfig::calculate(25, partitions).into_context(),
    }
}

/// Reads `key,value` lines; the value must be an integer. Blank lines are skipped.
fn read_pairs(
    path: &Path,
    config: &OperationConfig,
) -> Result<impl Iterator<Item = Result<Pair, EngineError>>, EngineError> {
    let reader = BufReader::new(File::open(path)?);
    let endian = config.endianness();
    Ok(reader
        .lines()
        .enumerate()
        .filter(|(_, line)| line.as_ref().map_or(true, |l| !l.trim().is_empty()))
        .map(move |(idx, line)| {
            parse_line(&line?, endian)
                .map_err(|e| EngineError::Other(format!("line {}: {}", idx + 1, e)))
        }))
}

fn parse_line(line: &str, endian: spillagg::Endianness) -> Result<Pair, String> {
    let (key, value) = line
        .rsplit_once(',')
        .ok_or_else(|| format!("expected key,value but got {:?}", line))?;
    let value: i64 = value
        .trim()
        .parse()
        .map_err(|e| format!("bad value {:?}: {}", value, e))?;
    Ok(Pair::with_i64_value(key.trim(), value, endian))
}

fn decode_value(bytes: &[u8], config: &OperationConfig) -> String {
    match config.endianness().decode_i64(bytes) {
        Some(v) => v.to_string(),
        None => String::from_utf8_lossy(bytes).into_owned(),
    }
}
