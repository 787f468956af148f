// ========================================================================================
//
//                       KINSHIP PAIRWISE KERNEL PERFORMANCE BENCHMARK
//
// ========================================================================================
//
// Measures the word-level pair statistic on its own, and the full parallel kernel over
// cohorts of increasing size with every pair forced through the reservoir.
//
// ========================================================================================

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use kinship::kernel::{self, Reservoir};
use kinship::matrix::GenotypeMatrix;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::AtomicU64;

// --- Benchmark Tuning Parameters ---

/// Words per bit-vector, i.e. 64 markers each.
const ENTRIES_COUNT: usize = 4_096;
/// Cohort sizes for the full-kernel benchmark.
const COHORT_SIZES: [usize; 3] = [32, 128, 256];

/// Random het/hom_alt vectors. Roughly one marker in sixteen comes out missing.
fn random_cohort(num_samples: usize, entries_count: usize) -> GenotypeMatrix {
    let mut rng = StdRng::seed_from_u64(0x4b49_4e47);
    let samples: Vec<(Vec<u64>, Vec<u64>)> = (0..num_samples)
        .map(|_| {
            let het = (0..entries_count).map(|_| rng.r#gen::<u64>()).collect();
            let hom_alt = (0..entries_count)
                .map(|_| rng.r#gen::<u64>() & rng.r#gen::<u64>())
                .collect();
            (het, hom_alt)
        })
        .collect();
    GenotypeMatrix::from_samples(&samples).expect("benchmark cohort is well formed")
}

fn bench_pair_counts(c: &mut Criterion) {
    let matrix = random_cohort(2, ENTRIES_COUNT);
    let mut group = c.benchmark_group("pair_counts");
    group.throughput(Throughput::Bytes(
        (4 * ENTRIES_COUNT * size_of::<u64>()) as u64,
    ));
    group.bench_function("single_pair", |b| {
        b.iter(|| kernel::pair_counts(black_box(matrix.sample(0)), black_box(matrix.sample(1))))
    });
    group.finish();
}

fn bench_compute_relatedness(c: &mut Criterion) {
    let mut group = c.benchmark_group("compute_relatedness");
    group.sample_size(10);
    for &num_samples in &COHORT_SIZES {
        let matrix = random_cohort(num_samples, ENTRIES_COUNT);
        let num_pairs = num_samples * (num_samples - 1) / 2;
        group.throughput(Throughput::Elements(num_pairs as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(num_samples),
            &matrix,
            |b, matrix| {
                b.iter(|| {
                    let reservoir =
                        Reservoir::with_capacity(num_pairs).expect("reservoir allocates");
                    let rows_done = AtomicU64::new(0);
                    kernel::compute_relatedness(
                        matrix,
                        0..num_samples,
                        f32::MIN,
                        &reservoir,
                        &rows_done,
                    )
                    .expect("kernel succeeds");
                    black_box(reservoir.cursor())
                })
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_pair_counts, bench_compute_relatedness);
criterion_main!(benches);
