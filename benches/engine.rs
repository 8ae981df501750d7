use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use modalspace::dense::{compute_dmd_matrices_direct_method, compute_dmd_matrices_snaps_method};
use modalspace::{
    ArrayVector, CMatrix, DenseOptions, Dmd, Handle, MemoryHandle, SingleProcess, VectorSpace,
    VectorSpaceConfig, WeightedInnerProduct,
};
use num_complex::Complex64;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;

fn random_data(rows: usize, cols: usize, seed: u64) -> CMatrix {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
    CMatrix::from_fn(rows, cols, |_, _| Complex64::new(rng.gen_range(-1.0..1.0), 0.0))
}

fn handles(data: &CMatrix) -> Vec<Handle<ArrayVector>> {
    ArrayVector::columns_of(data)
        .into_iter()
        .map(|vec| Arc::new(MemoryHandle::new(vec)) as Handle<ArrayVector>)
        .collect()
}

fn space(max_vecs: usize) -> VectorSpace<ArrayVector> {
    VectorSpace::new(
        Arc::new(SingleProcess),
        VectorSpaceConfig::default().with_max_vecs_per_node(max_vecs),
    )
    .with_inner_product(WeightedInnerProduct::default())
}

fn bench_engine(c: &mut Criterion) {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .try_init();
    let data = random_data(2_000, 64, 42);
    let snapshots = handles(&data);
    let coeffs = random_data(64, 16, 7);

    let mut group = c.benchmark_group("vectorspace");
    for quota in [8, 64] {
        group.bench_function(format!("symmetric_inner_product_q{quota}"), |b| {
            let space = space(quota);
            b.iter(|| {
                let mat = space
                    .compute_symmetric_inner_product_mat(&snapshots)
                    .expect("inner product matrix");
                black_box(mat);
            });
        });
        group.bench_function(format!("lin_combine_q{quota}"), |b| {
            let space = space(quota);
            let outputs: Vec<Handle<ArrayVector>> = (0..16)
                .map(|_| Arc::new(MemoryHandle::empty()) as Handle<ArrayVector>)
                .collect();
            b.iter(|| {
                space
                    .lin_combine(&snapshots, &coeffs, &outputs)
                    .expect("lin_combine");
            });
        });
    }
    group.finish();

    let mut group = c.benchmark_group("dmd");
    group.sample_size(20);
    group.bench_function("handles_snapshot_method", |b| {
        b.iter(|| {
            let mut dmd = Dmd::new(space(32));
            let decomp = dmd.compute_decomp(&snapshots, None).expect("decomp");
            black_box(decomp);
        });
    });
    let options = DenseOptions::default();
    group.bench_function("dense_snapshot_method", |b| {
        b.iter(|| {
            let result = compute_dmd_matrices_snaps_method(&data, None, &[0, 1, 2], &options)
                .expect("snaps");
            black_box(result);
        });
    });
    group.bench_function("dense_direct_method", |b| {
        b.iter(|| {
            let result = compute_dmd_matrices_direct_method(&data, None, &[0, 1, 2], &options)
                .expect("direct");
            black_box(result);
        });
    });
    group.finish();
}

criterion_group!(benches, bench_engine);
criterion_main!(benches);
