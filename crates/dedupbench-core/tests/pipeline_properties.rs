//! End-to-end behaviour of segmentation, recovery and benchmarking.

use dedupbench_core::{
    digest, run_benchmark, run_recovery, run_segmentation, BenchmarkPlan, ConnectionParams,
    DedupError, DedupIndex, HashAlgorithm, Namespace, RecoverRequest, RunContext, SegmentRequest,
    TrailReader,
};
use std::path::{Path, PathBuf};

fn unique_blocks(len: usize) -> Vec<u8> {
    // every 4-byte word differs, so no two aligned blocks of >= 4 bytes match
    (0..len as u32 / 4 + 1)
        .flat_map(|w| w.to_le_bytes())
        .take(len)
        .collect()
}

fn write_source(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, data).unwrap();
    path
}

fn seg_request(source: &Path, trail: &Path, block_size: u64, algorithm: HashAlgorithm) -> SegmentRequest {
    SegmentRequest {
        source: source.to_path_buf(),
        trail: trail.to_path_buf(),
        block_size,
        algorithm,
        overwrite: false,
    }
}

fn rec_request(trail: &Path, output: &Path, block_size: u64, algorithm: HashAlgorithm) -> RecoverRequest {
    RecoverRequest {
        trail: trail.to_path_buf(),
        output: output.to_path_buf(),
        block_size,
        algorithm,
        overwrite: false,
    }
}

#[test]
fn ten_thousand_bytes_in_4k_sha256_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let source = write_source(dir.path(), "src.bin", &unique_blocks(10_000));
    let trail = dir.path().join("src.hb");
    let output = dir.path().join("src.out");
    let mut index = DedupIndex::connect(&ConnectionParams::memory()).unwrap();
    let ctx = RunContext::default();

    let seg = run_segmentation(&mut index, &seg_request(&source, &trail, 4096, HashAlgorithm::Sha256), &ctx).unwrap();
    assert_eq!(seg.total_blocks, 3);
    assert_eq!(seg.distinct, 3);
    assert_eq!(seg.repeats, 0);
    assert_eq!(seg.repeat_rate_percent(), 0.0);

    let ns = Namespace::new(4096, HashAlgorithm::Sha256).unwrap();
    let tail_digest = digest(&unique_blocks(10_000)[8192..], HashAlgorithm::Sha256);
    let tail = index.fetch_record(&ns, &tail_digest).unwrap().unwrap();
    assert_eq!(tail.size, 1808);
    assert_eq!(tail.counter, 1);

    let rec = run_recovery(&index, &rec_request(&trail, &output, 4096, HashAlgorithm::Sha256), &ctx).unwrap();
    assert_eq!(rec.recovered, 3);
    assert_eq!(rec.recovered_rate_percent(), 100.0);
    assert_eq!(std::fs::read(&output).unwrap(), std::fs::read(&source).unwrap());
}

#[test]
fn unique_blocks_round_trip_losslessly() {
    for algorithm in HashAlgorithm::ALL {
        let dir = tempfile::tempdir().unwrap();
        let data = unique_blocks(64 * 1024 + 123);
        let source = write_source(dir.path(), "src.bin", &data);
        let trail = dir.path().join("src.hb");
        let output = dir.path().join("src.out");
        let mut index = DedupIndex::connect(&ConnectionParams::memory()).unwrap();
        let ctx = RunContext::default();

        let seg = run_segmentation(&mut index, &seg_request(&source, &trail, 1000, algorithm), &ctx).unwrap();
        let expected = (data.len() as u64).div_ceil(1000);
        assert_eq!(seg.total_blocks, expected);
        assert_eq!(seg.distinct, expected);
        assert_eq!(
            std::fs::metadata(&trail).unwrap().len(),
            expected * algorithm.digest_size() as u64
        );
        let ns = Namespace::new(1000, algorithm).unwrap();
        assert_eq!(index.row_count(&ns).unwrap(), expected);

        let rec = run_recovery(&index, &rec_request(&trail, &output, 1000, algorithm), &ctx).unwrap();
        assert_eq!(rec.recovered, expected);
        assert_eq!(std::fs::read(&output).unwrap(), data);
    }
}

#[test]
fn k_identical_blocks_plus_one_distinct() {
    const K: u64 = 9;
    const B: usize = 256;
    let dir = tempfile::tempdir().unwrap();
    let mut data = vec![0x5Au8; K as usize * B];
    data.extend(unique_blocks(B));
    let source = write_source(dir.path(), "dup.bin", &data);
    let trail = dir.path().join("dup.hb");
    let mut index = DedupIndex::connect(&ConnectionParams::memory()).unwrap();

    let seg = run_segmentation(
        &mut index,
        &seg_request(&source, &trail, B as u64, HashAlgorithm::Sha1),
        &RunContext::default(),
    )
    .unwrap();

    let ns = Namespace::new(B as u64, HashAlgorithm::Sha1).unwrap();
    assert_eq!(index.row_count(&ns).unwrap(), 2);
    let repeated = index
        .fetch_record(&ns, &digest(&[0x5Au8; B], HashAlgorithm::Sha1))
        .unwrap()
        .unwrap();
    let single = index
        .fetch_record(&ns, &digest(&unique_blocks(B), HashAlgorithm::Sha1))
        .unwrap()
        .unwrap();
    assert_eq!(repeated.counter, K);
    assert_eq!(single.counter, 1);
    assert_eq!(seg.total_blocks, K + 1);
    let expected_rate = (K - 1) as f64 / (K + 1) as f64 * 100.0;
    assert!((seg.repeat_rate_percent() - expected_rate).abs() < 1e-9);

    let mut reader = TrailReader::open(&trail, HashAlgorithm::Sha1).unwrap();
    assert_eq!(reader.expected_records(), K + 1);
    let first = reader.next_digest().unwrap().unwrap();
    assert_eq!(first, repeated.digest);
}

#[test]
fn deleted_source_degrades_only_its_records() {
    let dir = tempfile::tempdir().unwrap();
    let keep = write_source(dir.path(), "keep.bin", &[1u8; 300]);
    let mut mixed = unique_blocks(200);
    mixed.extend([1u8; 100]);
    let doomed = write_source(dir.path(), "doomed.bin", &mixed);
    let mut index = DedupIndex::connect(&ConnectionParams::memory()).unwrap();
    let ctx = RunContext::default();

    // the last block of `doomed` was first seen in `keep`
    run_segmentation(
        &mut index,
        &seg_request(&keep, &dir.path().join("keep.hb"), 100, HashAlgorithm::Md5),
        &ctx,
    )
    .unwrap();
    let trail = dir.path().join("doomed.hb");
    run_segmentation(&mut index, &seg_request(&doomed, &trail, 100, HashAlgorithm::Md5), &ctx).unwrap();
    std::fs::remove_file(&doomed).unwrap();

    let output = dir.path().join("doomed.out");
    let rec = run_recovery(&index, &rec_request(&trail, &output, 100, HashAlgorithm::Md5), &ctx).unwrap();
    assert_eq!(rec.total_records, 3);
    assert_eq!(rec.missing_sources, 2);
    assert_eq!(rec.recovered, 1);

    let out = std::fs::read(&output).unwrap();
    assert_eq!(out.len() as u64, rec.total_records * 100);
    assert!(out[..200].iter().all(|&b| b == 0));
    assert_eq!(&out[200..], &[1u8; 100]);
}

#[test]
fn benchmark_twice_gives_identical_dedup_figures() {
    let dir = tempfile::tempdir().unwrap();
    let mut data = vec![0u8; 8192];
    data.extend(unique_blocks(8192));
    data.extend(vec![0u8; 4096]);
    let source = write_source(dir.path(), "bench.bin", &data);
    let plan = BenchmarkPlan {
        source,
        algorithm: HashAlgorithm::Sha256,
        block_sizes: vec![512, 4096],
        work_dir: dir.path().join("work"),
        keep_artifacts: false,
    };
    let mut index = DedupIndex::connect(&ConnectionParams::memory()).unwrap();
    let ctx = RunContext::default();

    let first = run_benchmark(&mut index, &plan, &ctx).unwrap();
    let second = run_benchmark(&mut index, &plan, &ctx).unwrap();
    assert_eq!(first.len(), 2);
    for (a, b) in first.iter().zip(&second) {
        assert_eq!(a.block_size, b.block_size);
        assert_eq!(a.distinct_digests, b.distinct_digests);
        assert_eq!(a.repeat_rate_percent, b.repeat_rate_percent);
        assert_eq!(a.recovered_rate_percent, 100.0);
    }
    assert_eq!(first[1].total_blocks, 5);
    assert_eq!(first[1].repeat_count, 2);
}

#[test]
fn index_persists_between_connections() {
    let dir = tempfile::tempdir().unwrap();
    let source = write_source(dir.path(), "p.bin", &unique_blocks(5000));
    let trail = dir.path().join("p.hb");
    let output = dir.path().join("p.out");
    let params = ConnectionParams::wal(dir.path().join("data"), "bench");

    {
        let mut index = DedupIndex::connect(&params).unwrap();
        run_segmentation(
            &mut index,
            &seg_request(&source, &trail, 512, HashAlgorithm::Sha512),
            &RunContext::default(),
        )
        .unwrap();
        index.close().unwrap();
    }

    let index = DedupIndex::connect(&params).unwrap();
    let rec = run_recovery(
        &index,
        &rec_request(&trail, &output, 512, HashAlgorithm::Sha512),
        &RunContext::default(),
    )
    .unwrap();
    assert_eq!(rec.recovered, 10);
    assert_eq!(std::fs::read(&output).unwrap(), std::fs::read(&source).unwrap());
}

#[test]
fn recovery_with_mismatched_parameters_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let source = write_source(dir.path(), "m.bin", &unique_blocks(100));
    let trail = dir.path().join("m.hb");
    let mut index = DedupIndex::connect(&ConnectionParams::memory()).unwrap();
    run_segmentation(
        &mut index,
        &seg_request(&source, &trail, 10, HashAlgorithm::Md5),
        &RunContext::default(),
    )
    .unwrap();

    let output = dir.path().join("m.out");
    let err = run_recovery(
        &index,
        &rec_request(&trail, &output, 10, HashAlgorithm::Sha1),
        &RunContext::default(),
    )
    .unwrap_err();
    assert!(matches!(err, DedupError::NamespaceNotFound(_)));
    assert!(!output.exists());
}

#[test]
fn block_size_far_larger_than_the_source() {
    for block_size in [1u64 << 40, u64::MAX] {
        let dir = tempfile::tempdir().unwrap();
        let data = unique_blocks(10);
        let source = write_source(dir.path(), "tiny.bin", &data);
        let trail = dir.path().join("tiny.hb");
        let output = dir.path().join("tiny.out");
        let mut index = DedupIndex::connect(&ConnectionParams::memory()).unwrap();
        let ctx = RunContext::default();

        let seg = run_segmentation(&mut index, &seg_request(&source, &trail, block_size, HashAlgorithm::Sha256), &ctx).unwrap();
        assert_eq!(seg.total_blocks, 1);
        assert_eq!(seg.bytes, 10);
        let rec = run_recovery(&index, &rec_request(&trail, &output, block_size, HashAlgorithm::Sha256), &ctx).unwrap();
        assert_eq!(rec.recovered, 1);
        assert_eq!(std::fs::read(&output).unwrap(), data);
    }
}
