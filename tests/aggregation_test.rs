use spillagg::storage::record_len;
use spillagg::{
    Accumulator, Aggregator, BytewiseComparator, ConcatAccumulator, Endianness, EngineError,
    I64Comparator, MaxAccumulator, MemoryChainingRule, MemoryContext, OperationConfig,
    OperationFactory, Pair, SortOrder, SumAccumulator,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tempfile::TempDir;

const E: Endianness = Endianness::Little;

fn config(dir: &TempDir, partitions: usize) -> OperationConfig {
    OperationConfig {
        partition_count: partitions,
        spilling_directory: dir.path().to_path_buf(),
        spilling_buffer_size: 512,
        spilling_chunk_size: 256,
        merge_fan_in: 3,
        ..Default::default()
    }
}

fn sum() -> Option<Arc<dyn Accumulator>> {
    Some(Arc::new(SumAccumulator::new(E)))
}

/// Deterministic pseudo-random stream of `(key, value)` inputs.
fn inputs(count: usize, distinct: u64) -> Vec<(String, i64)> {
    let mut state: u64 = 0x2545_f491_4f6c_dd1d;
    (0..count)
        .map(|_| {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let key = format!("key-{}", (state >> 33) % distinct);
            let value = ((state >> 17) % 1000) as i64 - 500;
            (key, value)
        })
        .collect()
}

fn expected_sums(inputs: &[(String, i64)]) -> HashMap<String, i64> {
    let mut sums = HashMap::new();
    for (k, v) in inputs {
        *sums.entry(k.clone()).or_insert(0) += v;
    }
    sums
}

fn feed<A: Aggregator<Item = Pair>>(agg: &mut A, inputs: &[(String, i64)]) {
    for (k, v) in inputs {
        agg.accumulate(&Pair::with_i64_value(k.as_str(), *v, E)).unwrap();
    }
}

fn drain_values<A: Aggregator<Item = Pair>>(agg: A) -> Vec<(String, i64)> {
    agg.finish()
        .unwrap()
        .map(|p| {
            let p = p.unwrap();
            (String::from_utf8(p.key).unwrap(), E.decode_i64(&p.value).unwrap())
        })
        .collect()
}

/// Fails when the values of one key are not emitted next to each other.
fn assert_grouped(output: &[(String, i64)]) {
    let mut closed: HashSet<&str> = HashSet::new();
    let mut current: Option<&str> = None;
    for (key, _) in output {
        if current != Some(key.as_str()) {
            assert!(!closed.contains(key.as_str()), "values of {} are not grouped", key);
            if let Some(done) = current {
                closed.insert(done);
            }
            current = Some(key.as_str());
        }
    }
}

fn run_sum(
    memory: MemoryContext,
    config: &OperationConfig,
    inputs: &[(String, i64)],
) -> (HashMap<String, i64>, usize) {
    let mut agg =
        OperationFactory::aggregator(memory, config, Arc::new(BytewiseComparator), sum()).unwrap();
    feed(&mut agg, inputs);
    let spills = agg.stats().spills;
    let mut result = HashMap::new();
    for pair in agg.finish().unwrap() {
        let pair = pair.unwrap();
        let key = String::from_utf8(pair.key).unwrap();
        let value = E.decode_i64(&pair.value).unwrap();
        assert!(result.insert(key.clone(), value).is_none(), "key {} emitted twice", key);
    }
    (result, spills)
}

#[test]
fn test_scenario_two_partitions_with_spill() {
    let dir = TempDir::new().unwrap();
    // Two one-record blocks hold A and B; the fourth input, C, needs a spill.
    let mut agg = OperationFactory::aggregator(
        MemoryContext::new(record_len(1, 8), 2),
        &config(&dir, 2),
        Arc::new(BytewiseComparator),
        sum(),
    )
    .unwrap();
    for (k, v) in [("A", 1), ("B", 2), ("A", 3)] {
        agg.accumulate(&Pair::with_i64_value(k, v, E)).unwrap();
    }
    assert_eq!(agg.stats().spills, 0);
    agg.accumulate(&Pair::with_i64_value("C", 4, E)).unwrap();
    assert_eq!(agg.stats().spills, 1);
    agg.accumulate(&Pair::with_i64_value("B", 5, E)).unwrap();

    let result: HashMap<String, i64> = drain_values(agg).into_iter().collect();
    assert_eq!(result.len(), 3);
    assert_eq!(result["A"], 4);
    assert_eq!(result["B"], 7);
    assert_eq!(result["C"], 4);
}

#[test]
fn test_sums_match_with_and_without_spills() {
    let input = inputs(5000, 300);
    let expected = expected_sums(&input);

    let dir = TempDir::new().unwrap();
    let (resident, spills) = run_sum(MemoryContext::new(1 << 20, 8), &config(&dir, 4), &input);
    assert_eq!(spills, 0);
    assert_eq!(resident, expected);

    let dir = TempDir::new().unwrap();
    let (spilled, spills) = run_sum(MemoryContext::new(256, 4), &config(&dir, 4), &input);
    assert!(spills > 10, "expected many spills, got {}", spills);
    assert_eq!(spilled, expected);
}

#[test]
fn test_chaining_rules_agree() {
    let input = inputs(2000, 150);
    let expected = expected_sums(&input);
    for rule in [
        MemoryChainingRule::Grow,
        MemoryChainingRule::Bounded { blocks_per_storage: 2 },
        MemoryChainingRule::SpillOnFull,
    ] {
        let dir = TempDir::new().unwrap();
        let config = OperationConfig {
            memory_chaining_rule: rule,
            ..config(&dir, 3)
        };
        let (result, _) = run_sum(MemoryContext::new(512, 16), &config, &input);
        assert_eq!(result, expected, "rule {:?}", rule);
    }
}

#[test]
fn test_sorted_scenario_ascending_within_partitions() {
    let dir = TempDir::new().unwrap();
    let mut agg = OperationFactory::sorted_aggregator(
        MemoryContext::new(record_len(1, 8), 2),
        &config(&dir, 2),
        Arc::new(BytewiseComparator),
        sum(),
    )
    .unwrap();
    for (k, v) in [("A", 1), ("B", 2), ("A", 3), ("C", 4), ("B", 5)] {
        agg.accumulate(&Pair::with_i64_value(k, v, E)).unwrap();
    }
    let partition_of: HashMap<Vec<u8>, usize> = [b"A", b"B", b"C"]
        .iter()
        .map(|k| (k.to_vec(), agg.partition_of(*k)))
        .collect();

    let output: Vec<Pair> = agg.finish().unwrap().map(|p| p.unwrap()).collect();
    assert_eq!(output.len(), 3);
    for window in output.windows(2) {
        let (pa, pb) = (partition_of[&window[0].key], partition_of[&window[1].key]);
        assert!(pa <= pb);
        if pa == pb {
            assert!(window[0].key < window[1].key);
        }
    }
    let sums: HashMap<Vec<u8>, i64> = output
        .into_iter()
        .map(|p| (p.key.clone(), p.value_as_i64(E).unwrap()))
        .collect();
    assert_eq!(sums[&b"A".to_vec()], 4);
    assert_eq!(sums[&b"B".to_vec()], 7);
    assert_eq!(sums[&b"C".to_vec()], 4);
}

#[test]
fn test_sorted_numeric_keys_descending_after_spills() {
    let dir = TempDir::new().unwrap();
    let big = Endianness::Big;
    let config = OperationConfig {
        sort_order: SortOrder::Descending,
        use_big_endian: true,
        ..config(&dir, 3)
    };
    let mut agg = OperationFactory::sorted_aggregator(
        MemoryContext::new(256, 3),
        &config,
        Arc::new(I64Comparator::new(big)),
        Some(Arc::new(SumAccumulator::new(big))),
    )
    .unwrap();

    let mut expected: HashMap<i64, i64> = HashMap::new();
    for (i, (_, v)) in inputs(3000, 1).iter().enumerate() {
        let key = (*v * 7 + i as i64) % 400 - 200;
        *expected.entry(key).or_insert(0) += 1;
        agg.accumulate(&Pair::new(big.encode_i64(key), big.encode_i64(1))).unwrap();
    }
    assert!(agg.stats().spills > 0);
    let partition_of: HashMap<i64, usize> =
        expected.keys().map(|k| (*k, agg.partition_of(&big.encode_i64(*k)))).collect();

    let output: Vec<(i64, i64)> = agg
        .finish()
        .unwrap()
        .map(|p| {
            let p = p.unwrap();
            (p.key_as_i64(big).unwrap(), p.value_as_i64(big).unwrap())
        })
        .collect();
    assert_eq!(output.len(), expected.len());
    for window in output.windows(2) {
        let (pa, pb) = (partition_of[&window[0].0], partition_of[&window[1].0]);
        assert!(pa <= pb, "partitions out of order");
        if pa == pb {
            assert!(window[0].0 > window[1].0, "{} before {}", window[0].0, window[1].0);
        }
    }
    for (key, count) in output {
        assert_eq!(expected[&key], count);
    }
}

#[test]
fn test_non_commutative_accumulator_keeps_arrival_order() {
    let dir = TempDir::new().unwrap();
    let mut agg = OperationFactory::aggregator(
        MemoryContext::new(128, 2),
        &config(&dir, 2),
        Arc::new(BytewiseComparator),
        Some(Arc::new(ConcatAccumulator)),
    )
    .unwrap();
    let mut expected: HashMap<String, String> = HashMap::new();
    for round in 0..6u8 {
        for key in 0..12 {
            let letter = (b'a' + round) as char;
            let key = format!("k{:02}", key);
            expected.entry(key.clone()).or_default().push(letter);
            agg.accumulate(&Pair::new(key.as_str(), letter.to_string())).unwrap();
        }
    }
    assert!(agg.stats().spills > 0);
    let result: HashMap<String, String> = agg
        .finish()
        .unwrap()
        .map(|p| {
            let p = p.unwrap();
            (String::from_utf8(p.key).unwrap(), String::from_utf8(p.value).unwrap())
        })
        .collect();
    assert_eq!(result, expected);
    assert!(result.values().all(|v| v == "abcdef"));
}

#[test]
fn test_hot_key_state_outgrowing_a_block_spills() {
    let dir = TempDir::new().unwrap();
    let mut agg = OperationFactory::aggregator(
        MemoryContext::new(64, 4),
        &config(&dir, 1),
        Arc::new(BytewiseComparator),
        Some(Arc::new(ConcatAccumulator)),
    )
    .unwrap();
    let mut expected = Vec::new();
    for i in 0..10 {
        let value = format!("value-{:02}", i);
        expected.extend_from_slice(value.as_bytes());
        agg.accumulate(&Pair::new("k", value)).unwrap();
    }
    assert!(agg.stats().spills > 0);
    let output: Vec<Pair> = agg.finish().unwrap().map(|p| p.unwrap()).collect();
    assert_eq!(output, vec![Pair::new("k", expected)]);
}

#[test]
fn test_without_accumulator_every_value_is_kept_and_grouped() {
    let input = inputs(2000, 100);
    let mut expected = input.clone();
    expected.sort();
    for (block_size, spilling) in [(1 << 16, false), (256, true)] {
        let dir = TempDir::new().unwrap();
        let mut agg = OperationFactory::aggregator(
            MemoryContext::new(block_size, 8),
            &config(&dir, 4),
            Arc::new(BytewiseComparator),
            None,
        )
        .unwrap();
        feed(&mut agg, &input);
        assert_eq!(agg.stats().spills > 0, spilling);
        let output = drain_values(agg);
        assert_grouped(&output);
        let mut output = output;
        output.sort();
        assert_eq!(output, expected);
    }
}

#[test]
fn test_sorted_without_accumulator_orders_keys_after_spills() {
    let dir = TempDir::new().unwrap();
    let input = inputs(1500, 80);
    let mut agg = OperationFactory::sorted_aggregator(
        MemoryContext::new(256, 6),
        &config(&dir, 3),
        Arc::new(BytewiseComparator),
        None,
    )
    .unwrap();
    feed(&mut agg, &input);
    assert!(agg.stats().spills > 0);
    let partition_of: HashMap<String, usize> = input
        .iter()
        .map(|(k, _)| (k.clone(), agg.partition_of(k.as_bytes())))
        .collect();

    let output = drain_values(agg);
    for window in output.windows(2) {
        let (pa, pb) = (partition_of[&window[0].0], partition_of[&window[1].0]);
        assert!(pa <= pb, "partitions out of order");
        if pa == pb {
            assert!(window[0].0 <= window[1].0, "{} before {}", window[0].0, window[1].0);
        }
    }
    let mut output = output;
    output.sort();
    let mut expected = input;
    expected.sort();
    assert_eq!(output, expected);
}

#[test]
fn test_max_accumulator_across_spills() {
    let dir = TempDir::new().unwrap();
    let input = inputs(3000, 200);
    let mut expected: HashMap<String, i64> = HashMap::new();
    for (k, v) in &input {
        let entry = expected.entry(k.clone()).or_insert(i64::MIN);
        *entry = (*entry).max(*v);
    }
    let mut agg = OperationFactory::aggregator(
        MemoryContext::new(256, 4),
        &config(&dir, 4),
        Arc::new(BytewiseComparator),
        Some(Arc::new(MaxAccumulator::new(E))),
    )
    .unwrap();
    for (k, v) in &input {
        agg.accumulate(&Pair::with_i64_value(k.as_str(), *v, E)).unwrap();
    }
    let result: HashMap<String, i64> = agg
        .finish()
        .unwrap()
        .map(|p| {
            let p = p.unwrap();
            (String::from_utf8(p.key.clone()).unwrap(), p.value_as_i64(E).unwrap())
        })
        .collect();
    assert_eq!(result, expected);
}

#[test]
fn test_exhaustion_without_spilling_is_fatal() {
    let dir = TempDir::new().unwrap();
    let config = OperationConfig {
        spill_to_disk: false,
        ..config(&dir, 2)
    };
    let mut agg = OperationFactory::aggregator(
        MemoryContext::new(record_len(6, 8), 2),
        &config,
        Arc::new(BytewiseComparator),
        sum(),
    )
    .unwrap();
    let mut failure = None;
    for (k, v) in inputs(100, 50) {
        if let Err(e) = agg.accumulate(&Pair::with_i64_value(k.as_str(), v, E)) {
            failure = Some(e);
            break;
        }
    }
    assert!(matches!(failure, Some(EngineError::MemoryExhausted { .. })));
    agg.cancel();
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn test_oversized_pair_is_rejected() {
    let dir = TempDir::new().unwrap();
    let mut agg = OperationFactory::aggregator(
        MemoryContext::new(64, 4),
        &config(&dir, 1),
        Arc::new(BytewiseComparator),
        sum(),
    )
    .unwrap();
    let err = agg.accumulate(&Pair::with_i64_value(vec![b'x'; 100], 1, E)).unwrap_err();
    assert!(matches!(err, EngineError::PairTooLarge { .. }));
}

#[test]
fn test_retractions_with_spills() {
    let dir = TempDir::new().unwrap();
    let input = inputs(3000, 120);
    let mut expected = expected_sums(&input);

    let mut agg = OperationFactory::aggregator(
        MemoryContext::new(256, 3),
        &config(&dir, 3),
        Arc::new(BytewiseComparator),
        sum(),
    )
    .unwrap();
    for (i, (k, v)) in input.iter().enumerate() {
        agg.accumulate(&Pair::with_i64_value(k.as_str(), *v, E)).unwrap();
        if i % 3 == 0 {
            agg.retract(&Pair::with_i64_value(k.as_str(), 10, E)).unwrap();
            *expected.get_mut(k).unwrap() -= 10;
        }
    }
    agg.retract(&Pair::with_i64_value("never-seen", 5, E)).unwrap();
    assert!(agg.stats().spills > 0);

    let result: HashMap<String, i64> = agg
        .finish()
        .unwrap()
        .map(|p| {
            let p = p.unwrap();
            (String::from_utf8(p.key.clone()).unwrap(), p.value_as_i64(E).unwrap())
        })
        .collect();
    assert_eq!(result, expected);
}

#[test]
fn test_retract_requires_deduct_support() {
    let dir = TempDir::new().unwrap();
    let mut agg = OperationFactory::sorted_aggregator(
        MemoryContext::new(256, 3),
        &config(&dir, 1),
        Arc::new(BytewiseComparator),
        Some(Arc::new(MaxAccumulator::new(E))),
    )
    .unwrap();
    let err = agg.retract(&Pair::with_i64_value("a", 1, E)).unwrap_err();
    assert!(matches!(err, EngineError::Unsupported(_)));
}

#[test]
fn test_stats_track_spilled_bytes() {
    let dir = TempDir::new().unwrap();
    let mut agg = OperationFactory::aggregator(
        MemoryContext::new(256, 2),
        &config(&dir, 2),
        Arc::new(BytewiseComparator),
        sum(),
    )
    .unwrap();
    for (k, v) in inputs(500, 100) {
        agg.accumulate(&Pair::with_i64_value(k.as_str(), v, E)).unwrap();
    }
    let stats = agg.stats();
    assert_eq!(stats.pairs_accepted, 500);
    assert!(stats.spills > 0);
    assert!(stats.chunks_written >= stats.spills);
    assert!(stats.bytes_spilled > 0);
    assert!(stats.blocks_in_use <= 2);
    agg.cancel();
}
