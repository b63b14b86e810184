//! Benchmarks for bucket packing and shard assignment.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::path::PathBuf;

use seqflow::demux::shard_for;
use seqflow::planner::{pack, ReadPair};

fn read_pairs(count: usize) -> Vec<ReadPair> {
    let mut size: u64 = 17;
    (0..count)
        .map(|i| {
            size = size.wrapping_mul(2_862_933_555_777_941_757).wrapping_add(3_037_000_493);
            ReadPair {
                forward: PathBuf::from(format!("proj/s{i}_S{i}_L001_R1_001.fastq.gz")),
                reverse: PathBuf::from(format!("proj/s{i}_S{i}_L001_R2_001.fastq.gz")),
                project: "proj".to_string(),
                size_bytes: size % 4_000_000_000,
            }
        })
        .collect()
}

fn pack_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("pack");
    for count in [384, 4_608] {
        let pairs = read_pairs(count);
        group.bench_with_input(BenchmarkId::from_parameter(count), &pairs, |b, pairs| {
            b.iter(|| pack(black_box(pairs.clone()), 16));
        });
    }
    group.finish();
}

fn shard_benchmark(c: &mut Criterion) {
    let tags: Vec<String> = (0..1_000).map(|i| format!("AACGTG{i:04}")).collect();
    c.bench_function("shard_for", |b| {
        b.iter(|| tags.iter().map(|t| shard_for(black_box(t), 8)).sum::<usize>());
    });
}

criterion_group!(benches, pack_benchmark, shard_benchmark);
criterion_main!(benches);
