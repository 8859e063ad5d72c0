//! Property-based tests for the segmentation/recovery pair.

use dedupbench_core::{
    run_recovery, run_segmentation, ConnectionParams, DedupIndex, HashAlgorithm, Namespace,
    RecoverRequest, RunContext, SegmentRequest, TrailReader,
};
use proptest::prelude::*;
use std::collections::HashMap;

fn any_algorithm() -> impl Strategy<Value = HashAlgorithm> {
    prop_oneof![
        Just(HashAlgorithm::Md5),
        Just(HashAlgorithm::Sha1),
        Just(HashAlgorithm::Sha256),
        Just(HashAlgorithm::Sha512),
    ]
}

/// Data drawn from a small alphabet of blocks so duplicates are common.
fn blocky_data(block: usize) -> impl Strategy<Value = Vec<u8>> {
    (
        proptest::collection::vec(0u8..4, 0..24),
        proptest::collection::vec(any::<u8>(), 0..block),
    )
        .prop_map(move |(picks, tail)| {
            let mut data: Vec<u8> = picks
                .iter()
                .flat_map(|&p| std::iter::repeat(p).take(block))
                .collect();
            data.extend(tail);
            data
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Recovery from an untouched index reproduces the source, whatever the
    /// duplicate structure and tail length.
    #[test]
    fn recovery_reproduces_source(
        data in proptest::collection::vec(any::<u8>(), 0..6000),
        block_size in 1u64..2048,
        algorithm in any_algorithm(),
    ) {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("src");
        let trail = dir.path().join("src.hb");
        let output = dir.path().join("src.out");
        std::fs::write(&source, &data).unwrap();
        let mut index = DedupIndex::connect(&ConnectionParams::memory()).unwrap();
        let ctx = RunContext::default();

        let seg = run_segmentation(&mut index, &SegmentRequest {
            source: source.clone(),
            trail: trail.clone(),
            block_size,
            algorithm,
            overwrite: false,
        }, &ctx).unwrap();
        let expected = (data.len() as u64).div_ceil(block_size);
        prop_assert_eq!(seg.total_blocks, expected);
        prop_assert_eq!(seg.distinct + seg.repeats, expected);
        let trail_reader = TrailReader::open(&trail, algorithm).unwrap();
        prop_assert_eq!(trail_reader.expected_records(), expected);
        prop_assert!(trail_reader.path().ends_with("src.hb"));

        let rec = run_recovery(&index, &RecoverRequest {
            trail,
            output: output.clone(),
            block_size,
            algorithm,
            overwrite: false,
        }, &ctx).unwrap();
        prop_assert_eq!(rec.recovered, expected);
        prop_assert_eq!(rec.unrecoverable(), 0);
        prop_assert_eq!(std::fs::read(&output).unwrap(), data);
    }

    /// One record per distinct block, and counters add up to the block count.
    #[test]
    fn counters_match_block_multiplicity(
        data in blocky_data(64),
        algorithm in any_algorithm(),
    ) {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("src");
        std::fs::write(&source, &data).unwrap();
        let mut index = DedupIndex::connect(&ConnectionParams::memory()).unwrap();
        let seg = run_segmentation(&mut index, &SegmentRequest {
            source,
            trail: dir.path().join("src.hb"),
            block_size: 64,
            algorithm,
            overwrite: false,
        }, &RunContext::default()).unwrap();

        let mut multiplicity: HashMap<&[u8], u64> = HashMap::new();
        for block in data.chunks(64) {
            *multiplicity.entry(block).or_default() += 1;
        }
        let ns = Namespace::new(64, algorithm).unwrap();
        prop_assert_eq!(index.row_count(&ns).unwrap(), multiplicity.len() as u64);
        prop_assert_eq!(seg.distinct, multiplicity.len() as u64);
        for (block, count) in &multiplicity {
            let d = dedupbench_core::digest(block, algorithm);
            let rec = index.fetch_record(&ns, &d).unwrap().unwrap();
            prop_assert_eq!(rec.counter, *count);
            prop_assert_eq!(rec.size, block.len() as u64);
        }
    }
}
