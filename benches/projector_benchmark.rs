use std::time::Duration;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use nalgebra_sparse::{CooMatrix, CsrMatrix};
use rand::distr::{Distribution, Uniform};
use rand::{rngs::StdRng, SeedableRng};
use rasp::RandomizedProjector;

#[derive(Clone)]
pub struct ProjectorBenchConfig {
    seed: u64,
    matrix_sizes: Vec<(usize, usize)>,
    densities: Vec<f64>,
    target_rank: usize,
    measurement_time: u64,
    sample_size: usize,
}

impl Default for ProjectorBenchConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            matrix_sizes: vec![(1000, 500), (10000, 2000), (50000, 5000)],
            densities: vec![0.01, 0.05],
            target_rank: 20,
            measurement_time: 10,
            sample_size: 10,
        }
    }
}

fn create_csr_matrix(rows: usize, cols: usize, density: f64, seed: u64) -> CsrMatrix<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut coo = CooMatrix::new(rows, cols);
    let total_elements = (rows * cols) as f64 * density;
    let value_dist = Uniform::new(0.1, 10.0).unwrap();
    let row_dist = Uniform::new(0, rows).unwrap();
    let col_dist = Uniform::new(0, cols).unwrap();

    for _ in 0..total_elements as usize {
        coo.push(
            row_dist.sample(&mut rng),
            col_dist.sample(&mut rng),
            value_dist.sample(&mut rng),
        );
    }
    CsrMatrix::from(&coo)
}

fn bench_projector(c: &mut Criterion) {
    let _ = env_logger::builder().is_test(true).try_init();
    let config = ProjectorBenchConfig::default();
    let mut group = c.benchmark_group("randomized_projector");
    group.measurement_time(Duration::from_secs(config.measurement_time));
    group.sample_size(config.sample_size);

    for &(rows, cols) in &config.matrix_sizes {
        for &density in &config.densities {
            let matrix = create_csr_matrix(rows, cols, density, config.seed);
            let id = BenchmarkId::new(format!("{rows}x{cols}"), density);
            group.bench_with_input(id, &matrix, |b, m| {
                b.iter(|| {
                    RandomizedProjector::<f64>::builder()
                        .target_rank(config.target_rank)
                        .seed(config.seed)
                        .build()
                        .project_sparse(m)
                        .unwrap()
                })
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_projector);
criterion_main!(benches);
